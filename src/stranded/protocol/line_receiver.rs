use async_trait::async_trait;

use crate::stranded::common::{Error, Result};
use crate::stranded::protocol::core::Protocol;
use crate::stranded::protocol::Context;

/// Default line delimiter. `LineReceiver::with_delimiter` picks something
/// else (e.g. a bare `\n`, or a protocol-specific multi-byte sequence).
pub const DEFAULT_DELIMITER: &[u8] = b"\r\n";

const INITIAL_LINE_BUFFER: usize = 32;

/// User callbacks for `LineReceiver`: the wire is delimiter-terminated
/// lines, with no maximum length imposed by the engine itself.
#[async_trait]
pub trait LinesHandler: Send + 'static {
    type Error: std::error::Error + Send + Sync + 'static;

    /// `data` is one line with the delimiter already stripped.
    async fn line_received(
        &mut self,
        ctx: &Context,
        ctrl: &mut LineReceiverControl<'_>,
        data: &[u8],
    ) -> std::result::Result<(), Self::Error>;

    async fn on_error(&mut self, ctx: &Context, err: &Error) -> std::result::Result<(), Self::Error> {
        tracing::error!(connection_id = ctx.connection_id(), %err, "line receiver error");
        Ok(())
    }

    async fn on_disconnect(&mut self, _ctx: &Context) {}
}

/// Handle passed to `line_received`, currently offering only `send_line` -
/// kept as a distinct type (rather than just using `Context` directly) so
/// `MixedReceiver` can compose it with `ByteReceiverControl` behind one
/// control type without the two engines' states aliasing.
pub struct LineReceiverControl<'a> {
    delimiter: &'a [u8],
}

impl<'a> LineReceiverControl<'a> {
    fn new(delimiter: &'a [u8]) -> Self {
        LineReceiverControl { delimiter }
    }

    /// Writes `data` followed by the delimiter, as a single scatter write -
    /// the delimiter is never copied onto the end of `data`.
    pub async fn send_line(&self, ctx: &Context, data: &[u8]) -> Result<()> {
        ctx.send_buffers(&[data, self.delimiter]).await
    }
}

/// Delimiter-terminated line framing over a growable buffer. The buffer
/// starts small (32 bytes) and doubles whenever a line doesn't fit, so
/// short-lined protocols (the common case) stay cheap while long lines are
/// still accepted.
pub struct LineReceiver<H: LinesHandler> {
    handler: H,
    delimiter: Vec<u8>,
    buf: Vec<u8>,
    current_begin: usize,
    current_count: usize,
}

impl<H: LinesHandler> LineReceiver<H> {
    pub fn new(handler: H) -> Self {
        Self::with_delimiter(handler, DEFAULT_DELIMITER)
    }

    pub fn with_delimiter(handler: H, delimiter: impl Into<Vec<u8>>) -> Self {
        let delimiter = delimiter.into();
        assert!(!delimiter.is_empty(), "delimiter must be non-empty");
        LineReceiver {
            handler,
            delimiter,
            buf: vec![0u8; INITIAL_LINE_BUFFER],
            current_begin: 0,
            current_count: 0,
        }
    }

    fn compact(&mut self) {
        if self.current_count == 0 {
            self.current_begin = 0;
        } else if self.current_begin > 0 {
            self.buf.copy_within(self.current_begin..self.current_begin + self.current_count, 0);
            self.current_begin = 0;
        }
    }

    /// Doubles the buffer when the writable tail has run out, preserving
    /// whatever's unconsumed. Compaction alone is tried first since it's
    /// free; growth only happens when compaction wouldn't have left room.
    fn grow_if_needed(&mut self) {
        let tail_len = self.buf.len() - (self.current_begin + self.current_count);
        if tail_len > 0 {
            return;
        }
        self.compact();
        let tail_len = self.buf.len() - (self.current_begin + self.current_count);
        if tail_len == 0 {
            let new_len = self.buf.len() * 2;
            self.buf.resize(new_len, 0);
        }
    }
}

#[async_trait]
impl<H: LinesHandler> Protocol for LineReceiver<H> {
    fn writable_tail(&mut self) -> &mut [u8] {
        self.grow_if_needed();
        let start = self.current_begin + self.current_count;
        &mut self.buf[start..]
    }

    async fn on_message(&mut self, ctx: &Context, n: usize) -> Result<()> {
        self.current_count += n;
        loop {
            let window = &self.buf[self.current_begin..self.current_begin + self.current_count];
            let Some(pos) = memchr::memmem::find(window, &self.delimiter) else {
                break;
            };
            let line_start = self.current_begin;
            let line = self.buf[line_start..line_start + pos].to_vec();
            let consumed = pos + self.delimiter.len();
            self.current_begin += consumed;
            self.current_count -= consumed;

            let mut ctrl = LineReceiverControl::new(&self.delimiter);
            self.handler
                .line_received(ctx, &mut ctrl, &line)
                .await
                .map_err(Error::user)?;
        }
        self.compact();
        Ok(())
    }

    async fn on_error(&mut self, ctx: &Context, err: &Error) -> Result<()> {
        self.handler.on_error(ctx, err).await.map_err(Error::user)
    }

    async fn on_disconnect(&mut self, ctx: &Context) {
        self.handler.on_disconnect(ctx).await;
    }
}
