use async_trait::async_trait;

use crate::stranded::common::{Error, Result};
use crate::stranded::protocol::core::Protocol;
use crate::stranded::protocol::Context;

/// User callbacks for `ByteReceiver`: the wire is a stream of concatenated
/// fixed-size blocks, with no framing bytes of its own.
#[async_trait]
pub trait BytesHandler: Send + 'static {
    type Error: std::error::Error + Send + Sync + 'static;

    /// `data` is exactly one block - `ctrl.package_size()` bytes, the size
    /// that was in effect when this block started filling.
    async fn bytes_received(
        &mut self,
        ctx: &Context,
        ctrl: &mut ByteReceiverControl<'_>,
        data: &[u8],
    ) -> std::result::Result<(), Self::Error>;

    async fn on_error(&mut self, ctx: &Context, err: &Error) -> std::result::Result<(), Self::Error> {
        tracing::error!(connection_id = ctx.connection_id(), %err, "byte receiver error");
        Ok(())
    }

    async fn on_disconnect(&mut self, _ctx: &Context) {}
}

/// Handle into the engine's reassembly state, passed to `bytes_received` so
/// the handler can change the block size or pull an extra block
/// synchronously without waiting for the next socket read.
pub struct ByteReceiverControl<'a> {
    buf: &'a mut Vec<u8>,
    current_begin: &'a mut usize,
    current_count: &'a mut usize,
    next_bytes_size: &'a mut usize,
}

impl<'a> ByteReceiverControl<'a> {
    pub fn package_size(&self) -> usize {
        *self.next_bytes_size
    }

    /// Changes the block size. Takes effect starting with the next
    /// delivered block - the block currently being delivered already used
    /// the previous size. Growing the size grows the backing buffer to
    /// `3 * new_size`; shrinking never shrinks it back down.
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

    /// Ensures the buffer can hold `need` more bytes past the current
    /// unconsumed region, compacting that region down to index 0 first if
    /// that alone makes enough room.
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

    /// Pulls the next complete block immediately: if one is already
    /// buffered, returns it without touching the transport; otherwise
    /// synchronously reads exactly the missing bytes. Either way,
    /// `current_count` is reset to zero afterward - any bytes already
    /// buffered beyond this one block are discarded rather than carried
    /// into the next `on_message` dispatch.
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
}

/// Fixed-size block framing with a dynamic block size and an explicit
/// synchronous "give me the next block now" escape hatch.
pub struct ByteReceiver<H: BytesHandler> {
    handler: H,
    buf: Vec<u8>,
    next_bytes_size: usize,
    current_begin: usize,
    current_count: usize,
}

impl<H: BytesHandler> ByteReceiver<H> {
    pub fn new(handler: H, initial_package_size: usize) -> Self {
        assert!(initial_package_size > 0, "package size must be non-zero");
        ByteReceiver {
            handler,
            buf: vec![0u8; initial_package_size.saturating_mul(3)],
            next_bytes_size: initial_package_size,
            current_begin: 0,
            current_count: 0,
        }
    }

    /// Same as `new`, but takes the initial block size from
    /// `settings.recv_buffer_size` instead of a caller-supplied constant -
    /// the same role the teacher's `conf().recv_buffer_size` plays sizing
    /// `message_parser`'s initial read buffer.
    pub fn with_configured_package_size(handler: H) -> Self {
        let size = crate::stranded::config::config().recv_buffer_size as usize;
        Self::new(handler, size)
    }

    fn compact(&mut self) {
        if self.current_count == 0 {
            self.current_begin = 0;
        } else if self.current_begin + self.current_count == self.buf.len() {
            self.buf.copy_within(self.current_begin..self.current_begin + self.current_count, 0);
            self.current_begin = 0;
        }
    }
}

#[async_trait]
impl<H: BytesHandler> Protocol for ByteReceiver<H> {
    fn writable_tail(&mut self) -> &mut [u8] {
        let start = self.current_begin + self.current_count;
        if start >= self.buf.len() {
            self.compact();
            let start = self.current_begin + self.current_count;
            return &mut self.buf[start..];
        }
        &mut self.buf[start..]
    }

    async fn on_message(&mut self, ctx: &Context, n: usize) -> Result<()> {
        self.current_count += n;
        loop {
            let block_size = self.next_bytes_size;
            if self.current_count < block_size {
                break;
            }
            let start = self.current_begin;
            let block = self.buf[start..start + block_size].to_vec();
            // Advance bookkeeping before invoking the handler so that a
            // `next_packet` call from inside `bytes_received` operates on
            // the bytes that follow this block, not the block itself.
            self.current_count -= block_size;
            self.current_begin += block_size;

            let mut ctrl = ByteReceiverControl {
                buf: &mut self.buf,
                current_begin: &mut self.current_begin,
                current_count: &mut self.current_count,
                next_bytes_size: &mut self.next_bytes_size,
            };
            self.handler
                .bytes_received(ctx, &mut ctrl, &block)
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

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use tokio::io::AsyncWriteExt;

    use super::*;
    use crate::stranded::protocol::test_support::test_context;

    struct Collect {
        out: Arc<Mutex<Vec<Vec<u8>>>>,
    }

    #[async_trait]
    impl BytesHandler for Collect {
        type Error = std::convert::Infallible;

        async fn bytes_received(
            &mut self,
            _ctx: &Context,
            _ctrl: &mut ByteReceiverControl<'_>,
            data: &[u8],
        ) -> std::result::Result<(), Self::Error> {
            self.out.lock().unwrap().push(data.to_vec());
            Ok(())
        }
    }

    /// Copies `chunk` into the engine's writable tail and dispatches
    /// `on_message`, the way `ProtocolCore::run` would after a `read_some`.
    async fn feed<H: BytesHandler>(recv: &mut ByteReceiver<H>, ctx: &Context, chunk: &[u8]) {
        let tail = recv.writable_tail();
        tail[..chunk.len()].copy_from_slice(chunk);
        recv.on_message(ctx, chunk.len()).await.unwrap();
    }

    #[tokio::test]
    async fn arbitrary_chunking_reassembles_into_fixed_blocks() {
        let (ctx, _peer) = test_context().await;
        let out = Arc::new(Mutex::new(Vec::new()));
        let mut recv = ByteReceiver::new(Collect { out: out.clone() }, 3);

        for chunk in ["AAA", "BBB", "C", "CCD", "DDE", "EE"] {
            feed(&mut recv, &ctx, chunk.as_bytes()).await;
        }

        let got: Vec<String> = out
            .lock()
            .unwrap()
            .iter()
            .map(|b| String::from_utf8(b.clone()).unwrap())
            .collect();
        assert_eq!(got, vec!["AAA", "BBB", "CCC", "DDD", "EEE"]);
    }

    struct SetSizeOnce {
        out: Arc<Mutex<Vec<Vec<u8>>>>,
        new_size: usize,
        done: bool,
    }

    #[async_trait]
    impl BytesHandler for SetSizeOnce {
        type Error = std::convert::Infallible;

        async fn bytes_received(
            &mut self,
            _ctx: &Context,
            ctrl: &mut ByteReceiverControl<'_>,
            data: &[u8],
        ) -> std::result::Result<(), Self::Error> {
            self.out.lock().unwrap().push(data.to_vec());
            if !self.done {
                ctrl.set_package_size(self.new_size);
                self.done = true;
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn changing_package_size_takes_effect_starting_with_the_next_block() {
        let (ctx, _peer) = test_context().await;
        let out = Arc::new(Mutex::new(Vec::new()));
        let mut recv = ByteReceiver::new(
            SetSizeOnce { out: out.clone(), new_size: 20, done: false },
            2,
        );

        feed(&mut recv, &ctx, b"AA").await;
        feed(&mut recv, &ctx, &vec![b'X'; 20]).await;

        let got = out.lock().unwrap().clone();
        assert_eq!(got, vec![b"AA".to_vec(), vec![b'X'; 20]]);
    }

    struct NextPacketOnce {
        pulled: Arc<Mutex<Option<Vec<u8>>>>,
        done: bool,
    }

    #[async_trait]
    impl BytesHandler for NextPacketOnce {
        type Error = std::convert::Infallible;

        async fn bytes_received(
            &mut self,
            ctx: &Context,
            ctrl: &mut ByteReceiverControl<'_>,
            _data: &[u8],
        ) -> std::result::Result<(), Self::Error> {
            if !self.done {
                let packet = ctrl.next_packet(ctx).await.unwrap();
                *self.pulled.lock().unwrap() = Some(packet);
                self.done = true;
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn next_packet_pulls_a_block_synchronously_from_the_transport() {
        let (ctx, mut peer) = test_context().await;
        peer.write_all(b"WXYZ").await.unwrap();

        let pulled = Arc::new(Mutex::new(None));
        let mut recv = ByteReceiver::new(
            NextPacketOnce { pulled: pulled.clone(), done: false },
            4,
        );

        feed(&mut recv, &ctx, b"ABCD").await;

        assert_eq!(pulled.lock().unwrap().as_deref(), Some(b"WXYZ".as_slice()));
    }

    proptest::proptest! {
        /// Framing preservation: however a byte stream is chopped into reads,
        /// `ByteReceiver` must deliver exactly the blocks that evenly divide
        /// it, in order, with nothing dropped or reordered. Any bytes short
        /// of a full trailing block stay buffered rather than delivered.
        #[test]
        fn arbitrary_chunking_preserves_block_framing(
            block_size in 1usize..8,
            stream in proptest::collection::vec(proptest::prelude::any::<u8>(), 0..200),
            chunk_sizes in proptest::collection::vec(1usize..20usize, 1..30),
        ) {
            let rt = tokio::runtime::Runtime::new().unwrap();
            rt.block_on(async move {
                let (ctx, _peer) = test_context().await;
                let out = Arc::new(Mutex::new(Vec::<Vec<u8>>::new()));
                let mut recv = ByteReceiver::new(Collect { out: out.clone() }, block_size);

                let mut sizes = chunk_sizes.iter().cycle();
                let mut i = 0usize;
                while i < stream.len() {
                    let tail_len = recv.writable_tail().len();
                    let sz = (*sizes.next().unwrap()).min(stream.len() - i).min(tail_len).max(1);
                    feed(&mut recv, &ctx, &stream[i..i + sz]).await;
                    i += sz;
                }

                let delivered: Vec<u8> = out.lock().unwrap().iter().flatten().copied().collect();
                let expected_len = (stream.len() / block_size) * block_size;
                proptest::prop_assert_eq!(delivered, stream[..expected_len].to_vec());
                Ok(())
            })?;
        }
    }
}
