//! Test-only plumbing shared by the framing-engine and `ProtocolCore` unit
//! tests. `Transport` wraps a real `tokio::net::TcpStream` rather than some
//! generic `AsyncRead`/`AsyncWrite`, so there is no mock to hand tests -
//! instead, like the teacher's own `ServerTransport`/`ClientTransport`
//! tests, these drive a real loopback socket pair.

use std::sync::atomic::AtomicU32;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

use crate::stranded::protocol::context::{next_connection_id, ConnectionShared, Context};
use crate::stranded::transport::Transport;

/// A connected loopback pair: the server half wrapped in a plain `Transport`,
/// and the raw client half for a test to read from or write to directly.
pub(crate) async fn loopback_transport() -> (Arc<Transport>, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let client = TcpStream::connect(addr).await.unwrap();
    let (server, _) = listener.accept().await.unwrap();
    (Transport::new_plain(server), client)
}

/// A `Context` good for exactly the things the framing engines need in
/// tests - `send`/`send_buffers`/`read_more` - backed by a real loopback
/// transport, plus the peer socket to drive it from the test side.
pub(crate) async fn test_context() -> (Context, TcpStream) {
    let (transport, client) = loopback_transport().await;
    let (job_tx, _job_rx) = mpsc::unbounded_channel();
    let shared = Arc::new(ConnectionShared {
        id: next_connection_id(),
        transport,
        job_tx,
        last_active: AtomicU32::new(0),
    });
    (Context::new(shared), client)
}
