use async_trait::async_trait;

use crate::stranded::common::{Error, Result};
use crate::stranded::protocol::core::Protocol;
use crate::stranded::protocol::line_receiver::DEFAULT_DELIMITER;
use crate::stranded::protocol::Context;

/// Which framing discipline `MixedReceiver` is currently applying to the
/// stream. Switched at any time via `MixedReceiverControl`, including from
/// inside a callback - the common case is a protocol that reads a
/// line-terminated command and then drops into fixed-size-block mode to
/// read the command's payload.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Mode {
    Bytes,
    Lines,
}

/// User callbacks for `MixedReceiver`. Both callbacks are required since
/// either may be invoked at any time depending on the current mode.
#[async_trait]
pub trait MixedHandler: Send + 'static {
    type Error: std::error::Error + Send + Sync + 'static;

    async fn bytes_received(
        &mut self,
        ctx: &Context,
        ctrl: &mut MixedReceiverControl<'_>,
        data: &[u8],
    ) -> std::result::Result<(), Self::Error>;

    async fn line_received(
        &mut self,
        ctx: &Context,
        ctrl: &mut MixedReceiverControl<'_>,
        data: &[u8],
    ) -> std::result::Result<(), Self::Error>;

    async fn on_error(&mut self, ctx: &Context, err: &Error) -> std::result::Result<(), Self::Error> {
        tracing::error!(connection_id = ctx.connection_id(), %err, "mixed receiver error");
        Ok(())
    }

    async fn on_disconnect(&mut self, _ctx: &Context) {}
}

/// Combines the byte-mode and line-mode controls into one type, plus the
/// mode switch itself.
pub struct MixedReceiverControl<'a> {
    buf: &'a mut Vec<u8>,
    current_begin: &'a mut usize,
    current_count: &'a mut usize,
    next_bytes_size: &'a mut usize,
    delimiter: &'a mut Vec<u8>,
    mode: &'a mut Mode,
}

impl<'a> MixedReceiverControl<'a> {
    pub fn mode(&self) -> Mode {
        *self.mode
    }

    pub fn package_size(&self) -> usize {
        *self.next_bytes_size
    }

    /// Switches to (or stays in) byte mode with the given block size,
    /// growing the buffer to `3 * package_size` if necessary. Unconsumed
    /// bytes already buffered are kept and reinterpreted under the new mode.
    pub fn set_byte_mode(&mut self, package_size: usize) {
        assert!(package_size > 0, "package size must be non-zero");
        let needed = package_size.saturating_mul(3);
        if needed > self.buf.len() {
            self.buf.resize(needed, 0);
        }
        *self.next_bytes_size = package_size;
        *self.mode = Mode::Bytes;
    }

    /// Switches the active block size without changing mode. Behaves like
    /// `ByteReceiverControl::set_package_size`: takes effect for the next
    /// block, and only grows the buffer, never shrinks it.
    pub fn set_package_size(&mut self, new_size: usize) {
        assert!(new_size > 0, "package size must be non-zero");
        if new_size > *self.next_bytes_size {
            let needed = new_size.saturating_mul(3);
            if needed > self.buf.len() {
                self.buf.resize(needed, 0);
            }
        }
        *self.next_bytes_size = new_size;
    }

    /// Switches to line mode, optionally changing the delimiter.
    pub fn set_line_mode(&mut self, delimiter: impl Into<Vec<u8>>) {
        let delimiter = delimiter.into();
        assert!(!delimiter.is_empty(), "delimiter must be non-empty");
        *self.delimiter = delimiter;
        *self.mode = Mode::Lines;
    }

    pub async fn send_line(&self, ctx: &Context, data: &[u8]) -> Result<()> {
        ctx.send_buffers(&[data, &self.delimiter[..]]).await
    }

    /// Same semantics as `ByteReceiverControl::next_packet`: only makes
    /// sense while `mode() == Mode::Bytes`.
    pub async fn next_packet(&mut self, ctx: &Context) -> Result<Vec<u8>> {
        let n = *self.next_bytes_size;
        if *self.current_count >= n {
            let start = *self.current_begin;
            let packet = self.buf[start..start + n].to_vec();
            *self.current_begin += n;
            *self.current_count = 0;
            return Ok(packet);
        }

        let need = n - *self.current_count;
        self.make_room(need);
        let read_start = *self.current_begin + *self.current_count;
        ctx.read_more(&mut self.buf[read_start..read_start + need]).await?;

        let begin = *self.current_begin;
        let packet = self.buf[begin..begin + n].to_vec();
        *self.current_begin += n;
        *self.current_count = 0;
        Ok(packet)
    }

    fn make_room(&mut self, need: usize) {
        let needed_end = *self.current_begin + *self.current_count + need;
        if needed_end <= self.buf.len() {
            return;
        }
        if *self.current_begin > 0 {
            self.buf.copy_within(*self.current_begin..*self.current_begin + *self.current_count, 0);
            *self.current_begin = 0;
        }
        let needed_end = *self.current_count + need;
        if needed_end > self.buf.len() {
            self.buf.resize(needed_end, 0);
        }
    }
}

/// A framing engine that switches between fixed-size-block and
/// delimiter-terminated-line framing at the handler's discretion, sharing
/// one reassembly buffer across both modes.
pub struct MixedReceiver<H: MixedHandler> {
    handler: H,
    buf: Vec<u8>,
    next_bytes_size: usize,
    delimiter: Vec<u8>,
    current_begin: usize,
    current_count: usize,
    mode: Mode,
}

impl<H: MixedHandler> MixedReceiver<H> {
    /// Starts in byte mode with the given initial block size.
    pub fn new_bytes_first(handler: H, initial_package_size: usize) -> Self {
        assert!(initial_package_size > 0, "package size must be non-zero");
        MixedReceiver {
            handler,
            buf: vec![0u8; initial_package_size.saturating_mul(3)],
            next_bytes_size: initial_package_size,
            delimiter: DEFAULT_DELIMITER.to_vec(),
            current_begin: 0,
            current_count: 0,
            mode: Mode::Bytes,
        }
    }

    /// Starts in line mode.
    pub fn new_lines_first(handler: H) -> Self {
        MixedReceiver {
            handler,
            buf: vec![0u8; 32],
            next_bytes_size: 1,
            delimiter: DEFAULT_DELIMITER.to_vec(),
            current_begin: 0,
            current_count: 0,
            mode: Mode::Lines,
        }
    }

    fn compact(&mut self) {
        if self.current_count == 0 {
            self.current_begin = 0;
        } else if self.mode == Mode::Lines && self.current_begin > 0 {
            self.buf.copy_within(self.current_begin..self.current_begin + self.current_count, 0);
            self.current_begin = 0;
        } else if self.mode == Mode::Bytes && self.current_begin + self.current_count == self.buf.len() {
            self.buf.copy_within(self.current_begin..self.current_begin + self.current_count, 0);
            self.current_begin = 0;
        }
    }

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

    fn control(&mut self) -> MixedReceiverControl<'_> {
        MixedReceiverControl {
            buf: &mut self.buf,
            current_begin: &mut self.current_begin,
            current_count: &mut self.current_count,
            next_bytes_size: &mut self.next_bytes_size,
            delimiter: &mut self.delimiter,
            mode: &mut self.mode,
        }
    }
}

#[async_trait]
impl<H: MixedHandler> Protocol for MixedReceiver<H> {
    fn writable_tail(&mut self) -> &mut [u8] {
        self.grow_if_needed();
        let start = self.current_begin + self.current_count;
        &mut self.buf[start..]
    }

    async fn on_message(&mut self, ctx: &Context, n: usize) -> Result<()> {
        self.current_count += n;
        loop {
            match self.mode {
                Mode::Bytes => {
                    let block_size = self.next_bytes_size;
                    if self.current_count < block_size {
                        break;
                    }
                    let start = self.current_begin;
                    let block = self.buf[start..start + block_size].to_vec();
                    self.current_count -= block_size;
                    self.current_begin += block_size;

                    let mut ctrl = self.control();
                    self.handler
                        .bytes_received(ctx, &mut ctrl, &block)
                        .await
                        .map_err(Error::user)?;
                }
                Mode::Lines => {
                    let window = &self.buf[self.current_begin..self.current_begin + self.current_count];
                    let Some(pos) = memchr::memmem::find(window, &self.delimiter) else {
                        break;
                    };
                    let line_start = self.current_begin;
                    let line = self.buf[line_start..line_start + pos].to_vec();
                    let consumed = pos + self.delimiter.len();
                    self.current_begin += consumed;
                    self.current_count -= consumed;

                    let mut ctrl = self.control();
                    self.handler
                        .line_received(ctx, &mut ctrl, &line)
                        .await
                        .map_err(Error::user)?;
                }
            }
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

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::stranded::protocol::test_support::test_context;

    /// Toggles mode on every callback: after a line, switch to 5-byte
    /// blocks; after a block, switch back to line mode.
    struct TogglingHandler {
        out: Arc<Mutex<Vec<Vec<u8>>>>,
    }

    #[async_trait]
    impl MixedHandler for TogglingHandler {
        type Error = std::convert::Infallible;

        async fn bytes_received(
            &mut self,
            _ctx: &Context,
            ctrl: &mut MixedReceiverControl<'_>,
            data: &[u8],
        ) -> std::result::Result<(), Self::Error> {
            self.out.lock().unwrap().push(data.to_vec());
            ctrl.set_line_mode(DEFAULT_DELIMITER);
            Ok(())
        }

        async fn line_received(
            &mut self,
            _ctx: &Context,
            ctrl: &mut MixedReceiverControl<'_>,
            data: &[u8],
        ) -> std::result::Result<(), Self::Error> {
            self.out.lock().unwrap().push(data.to_vec());
            ctrl.set_byte_mode(5);
            Ok(())
        }
    }

    #[tokio::test]
    async fn mode_toggling_interleaves_lines_and_blocks() {
        let (ctx, _peer) = test_context().await;
        let out = Arc::new(Mutex::new(Vec::new()));
        let mut recv = MixedReceiver::new_lines_first(TogglingHandler { out: out.clone() });

        let input = b"AAA\r\nBBBBBCCC\r\nDDDDD";
        let tail = recv.writable_tail();
        tail[..input.len()].copy_from_slice(input);
        recv.on_message(&ctx, input.len()).await.unwrap();

        let got: Vec<String> = out
            .lock()
            .unwrap()
            .iter()
            .map(|b| String::from_utf8(b.clone()).unwrap())
            .collect();
        assert_eq!(got, vec!["AAA", "BBBBB", "CCC", "DDDDD"]);
    }

    /// Never switches mode - used to confirm byte-mode framing behaves
    /// identically to a standalone `ByteReceiver` once embedded in
    /// `MixedReceiver`.
    struct BytesOnly {
        out: Arc<Mutex<Vec<Vec<u8>>>>,
    }

    #[async_trait]
    impl MixedHandler for BytesOnly {
        type Error = std::convert::Infallible;

        async fn bytes_received(
            &mut self,
            _ctx: &Context,
            _ctrl: &mut MixedReceiverControl<'_>,
            data: &[u8],
        ) -> std::result::Result<(), Self::Error> {
            self.out.lock().unwrap().push(data.to_vec());
            Ok(())
        }

        async fn line_received(
            &mut self,
            _ctx: &Context,
            _ctrl: &mut MixedReceiverControl<'_>,
            _data: &[u8],
        ) -> std::result::Result<(), Self::Error> {
            unreachable!("this handler never switches to line mode");
        }
    }

    #[tokio::test]
    async fn byte_mode_never_splits_the_buffer_across_modes() {
        let (ctx, _peer) = test_context().await;
        let out = Arc::new(Mutex::new(Vec::new()));
        let mut recv = MixedReceiver::new_bytes_first(BytesOnly { out: out.clone() }, 3);

        let input = b"AAABBBCCC";
        let tail = recv.writable_tail();
        tail[..input.len()].copy_from_slice(input);
        recv.on_message(&ctx, input.len()).await.unwrap();

        assert_eq!(out.lock().unwrap().clone(), vec![b"AAA".to_vec(), b"BBB".to_vec(), b"CCC".to_vec()]);
    }
}
