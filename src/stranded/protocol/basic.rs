use async_trait::async_trait;

use crate::stranded::common::{Error, Result};
use crate::stranded::protocol::core::Protocol;
use crate::stranded::protocol::Context;

/// A protocol's trivial framing handler: whatever arrived in one
/// `read_some` is delivered verbatim, with no reassembly.
#[async_trait]
pub trait BasicHandler: Send + 'static {
    type Error: std::error::Error + Send + Sync + 'static;

    async fn on_message(&mut self, ctx: &Context, data: &[u8]) -> std::result::Result<(), Self::Error>;

    async fn on_error(&mut self, ctx: &Context, err: &Error) -> std::result::Result<(), Self::Error> {
        tracing::error!(connection_id = ctx.connection_id(), %err, "basic protocol error");
        Ok(())
    }

    async fn on_disconnect(&mut self, _ctx: &Context) {}
}

const BASIC_BUFFER_SIZE: usize = 1024;

/// No framing at all: a fixed 1024-byte buffer is reused from the start on
/// every read and handed to the user wholesale.
pub struct BasicProtocol<H: BasicHandler> {
    handler: H,
    buf: Box<[u8]>,
}

impl<H: BasicHandler> BasicProtocol<H> {
    pub fn new(handler: H) -> Self {
        BasicProtocol {
            handler,
            buf: vec![0u8; BASIC_BUFFER_SIZE].into_boxed_slice(),
        }
    }
}

#[async_trait]
impl<H: BasicHandler> Protocol for BasicProtocol<H> {
    fn writable_tail(&mut self) -> &mut [u8] {
        &mut self.buf[..]
    }

    async fn on_message(&mut self, ctx: &Context, n: usize) -> Result<()> {
        self.handler
            .on_message(ctx, &self.buf[..n])
            .await
            .map_err(Error::user)
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
    use std::time::Duration;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;
    use crate::stranded::connections::{ConnectionTable, Metrics};
    use crate::stranded::protocol::core::ProtocolCore;
    use crate::stranded::protocol::test_support::loopback_transport;

    struct Echo;

    #[async_trait]
    impl BasicHandler for Echo {
        type Error = std::convert::Infallible;

        async fn on_message(&mut self, ctx: &Context, data: &[u8]) -> std::result::Result<(), Self::Error> {
            let _ = ctx.send(data).await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn echoes_whatever_arrives_verbatim() {
        let (transport, mut client) = loopback_transport().await;
        let (core, _handle) =
            ProtocolCore::new(transport, BasicProtocol::new(Echo), Metrics::new(), ConnectionTable::new(0));
        tokio::spawn(core.run());

        client.write_all(b"TEST123").await.unwrap();
        let mut buf = [0u8; 7];
        tokio::time::timeout(Duration::from_secs(5), client.read_exact(&mut buf)).await.unwrap().unwrap();
        assert_eq!(&buf, b"TEST123");
    }
}
