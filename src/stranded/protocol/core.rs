use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{error, info, info_span, warn, Instrument};

use std::sync::atomic::AtomicU32;

use crate::stranded::common::{Error, Result};
use crate::stranded::connections::{ConnectionTable, Metrics};
use crate::stranded::protocol::context::{next_connection_id, ConnectionHandle, ConnectionShared, Job};
use crate::stranded::protocol::Context;
use crate::stranded::transport::Transport;

/// The interface between `ProtocolCore` and a framing engine (or a direct
/// user protocol, for the trivial case). There is no dynamic dispatch here
/// on the hot path - `ProtocolCore<P>` is generic over `P` and the engine's
/// user-facing callbacks are invoked through a second, inner generic
/// parameter on the concrete engine types (`ByteReceiver<H>` and so on).
#[async_trait]
pub trait Protocol: Send + 'static {
    /// Returns the destination for the next `read_some`: the writable tail
    /// of whatever buffer this engine owns. Called once per read.
    fn writable_tail(&mut self) -> &mut [u8];

    /// `n` bytes were just written into the slice previously returned by
    /// `writable_tail`. Dispatches to user callbacks. An `Err` here is
    /// always a user error - framing engines never fail on their own.
    async fn on_message(&mut self, ctx: &Context, n: usize) -> Result<()>;

    /// Default policy: log and continue reading.
    async fn on_error(&mut self, ctx: &Context, err: &Error) -> Result<()> {
        error!(connection_id = ctx.connection_id(), %err, "protocol reported a user error");
        Ok(())
    }

    /// Default: no-op.
    async fn on_disconnect(&mut self, _ctx: &Context) {}
}

/// The per-connection cooperative task. Owns the Transport exclusively and
/// drives: handshake, read, dispatch, and - on any failure or graceful
/// close - disconnect, exactly once.
pub struct ProtocolCore<P: Protocol> {
    transport: Arc<Transport>,
    protocol: P,
    shared: Arc<ConnectionShared>,
    job_rx: mpsc::UnboundedReceiver<Job>,
    metrics: Arc<Metrics>,
    connections: Arc<ConnectionTable>,
}

impl<P: Protocol> ProtocolCore<P> {
    pub fn new(
        transport: Arc<Transport>,
        protocol: P,
        metrics: Arc<Metrics>,
        connections: Arc<ConnectionTable>,
    ) -> (Self, ConnectionHandle) {
        let (job_tx, job_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(ConnectionShared {
            id: next_connection_id(),
            transport: transport.clone(),
            job_tx,
            last_active: AtomicU32::new(0),
        });
        let handle = ConnectionHandle {
            shared: shared.clone(),
        };
        connections.register(handle.clone());
        (
            ProtocolCore {
                transport,
                protocol,
                shared,
                job_rx,
                metrics,
                connections,
            },
            handle,
        )
    }

    pub fn connection_id(&self) -> u64 {
        self.shared.id
    }

    /// Runs the full connection lifecycle to completion: Starting ->
    /// Handshaking -> (Reading <-> Dispatching) -> Disconnecting -> Done.
    /// Always calls `on_disconnect` exactly once before returning.
    pub async fn run(mut self) {
        let id = self.shared.id;
        let span = info_span!("connection", connection_id = id);
        async move {
            self.metrics.connection_accepted();
            if let Err(e) = self.transport.handshake().await {
                warn!(%e, "handshake failed");
                self.disconnect().await;
                return;
            }
            info!("handshake complete");

            loop {
                // Drain any strand work queued while we were last dispatching,
                // so `call_later(0, ..)` work runs before the next read.
                while let Ok(job) = self.job_rx.try_recv() {
                    let ctx = Context::new(self.shared.clone());
                    job(ctx).await;
                    if !self.transport.is_open() {
                        self.disconnect().await;
                        return;
                    }
                }
                if !self.transport.is_open() {
                    self.disconnect().await;
                    return;
                }

                let tail = self.protocol.writable_tail();
                tokio::select! {
                    job = self.job_rx.recv() => {
                        if let Some(job) = job {
                            let ctx = Context::new(self.shared.clone());
                            job(ctx).await;
                        }
                    }
                    read_result = self.transport.read_some(tail) => {
                        match read_result {
                            Ok(n) => {
                                let ctx = Context::new(self.shared.clone());
                                match self.protocol.on_message(&ctx, n).await {
                                    Ok(()) => {}
                                    Err(e) => {
                                        self.metrics.connection_errored();
                                        match self.protocol.on_error(&ctx, &e).await {
                                            Ok(()) => {}
                                            Err(_) => {
                                                self.disconnect().await;
                                                return;
                                            }
                                        }
                                    }
                                }
                            }
                            Err(_) => {
                                self.disconnect().await;
                                return;
                            }
                        }
                    }
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn disconnect(mut self) {
        let ctx = Context::new(self.shared.clone());
        self.protocol.on_disconnect(&ctx).await;
        self.transport.close();
        self.connections.unregister(self.shared.id);
        self.metrics.connection_closed();
        info!("connection closed");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;
    use crate::stranded::protocol::test_support::loopback_transport;

    fn harness() -> (Arc<Metrics>, Arc<ConnectionTable>) {
        (Metrics::new(), ConnectionTable::new(0))
    }

    /// Stashes whatever arrives, fails the first dispatch, then echoes the
    /// stash from `on_error`. A second message should go through normally,
    /// proving the connection survived the first failure.
    struct FlakyOnce {
        buf: [u8; 64],
        disconnects: Arc<AtomicUsize>,
        failed_once: bool,
    }

    #[async_trait]
    impl Protocol for FlakyOnce {
        fn writable_tail(&mut self) -> &mut [u8] {
            &mut self.buf
        }

        async fn on_message(&mut self, _ctx: &Context, _n: usize) -> Result<()> {
            if !self.failed_once {
                self.failed_once = true;
                return Err(Error::user(std::io::Error::new(std::io::ErrorKind::Other, "boom")));
            }
            Ok(())
        }

        async fn on_error(&mut self, ctx: &Context, _err: &Error) -> Result<()> {
            ctx.send(b"stashed").await
        }

        async fn on_disconnect(&mut self, _ctx: &Context) {
            self.disconnects.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn a_user_error_is_isolated_to_on_error_and_the_connection_survives() {
        let (metrics, connections) = harness();
        let (transport, mut client) = loopback_transport().await;
        let disconnects = Arc::new(AtomicUsize::new(0));
        let protocol = FlakyOnce { buf: [0u8; 64], disconnects: disconnects.clone(), failed_once: false };
        let (core, _handle) = ProtocolCore::new(transport, protocol, metrics, connections);
        let task = tokio::spawn(core.run());

        client.write_all(b"first").await.unwrap();
        let mut buf = [0u8; 7];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"stashed");

        client.write_all(b"second").await.unwrap();
        drop(client);

        tokio::time::timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
        assert_eq!(disconnects.load(Ordering::SeqCst), 1, "on_disconnect must fire exactly once");
    }

    struct CountDisconnects {
        buf: [u8; 64],
        disconnects: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Protocol for CountDisconnects {
        fn writable_tail(&mut self) -> &mut [u8] {
            &mut self.buf
        }

        async fn on_message(&mut self, ctx: &Context, _n: usize) -> Result<()> {
            ctx.lose_connection();
            Ok(())
        }

        async fn on_disconnect(&mut self, _ctx: &Context) {
            self.disconnects.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn closing_locally_disconnects_exactly_once() {
        let (metrics, connections) = harness();
        let (transport, mut client) = loopback_transport().await;
        let disconnects = Arc::new(AtomicUsize::new(0));
        let protocol = CountDisconnects { buf: [0u8; 64], disconnects: disconnects.clone() };
        let (core, _handle) = ProtocolCore::new(transport, protocol, metrics, connections);
        let task = tokio::spawn(core.run());

        client.write_all(b"x").await.unwrap();

        tokio::time::timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
        assert_eq!(disconnects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn peer_close_disconnects_exactly_once() {
        let (metrics, connections) = harness();
        let (transport, client) = loopback_transport().await;
        let disconnects = Arc::new(AtomicUsize::new(0));
        let protocol = CountDisconnects { buf: [0u8; 64], disconnects: disconnects.clone() };
        let (core, _handle) = ProtocolCore::new(transport, protocol, metrics, connections);
        let task = tokio::spawn(core.run());

        drop(client);

        tokio::time::timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
        assert_eq!(disconnects.load(Ordering::SeqCst), 1);
    }

    struct Idle {
        buf: [u8; 64],
    }

    #[async_trait]
    impl Protocol for Idle {
        fn writable_tail(&mut self) -> &mut [u8] {
            &mut self.buf
        }

        async fn on_message(&mut self, _ctx: &Context, _n: usize) -> Result<()> {
            Ok(())
        }
    }

    /// Race window: each job reads `counter`, yields back to the executor,
    /// then writes it back incremented. Without true strand serialization
    /// this loses updates whenever two jobs interleave. `done` is a
    /// properly synchronized counter used only to know when every job has
    /// finished touching `counter`, so the final read of `counter` itself
    /// happens-after all of them and isn't itself a race.
    struct RaceState {
        counter: std::cell::UnsafeCell<u64>,
        done: AtomicUsize,
    }
    unsafe impl Sync for RaceState {}

    #[tokio::test]
    async fn concurrent_call_from_thread_invocations_serialize_on_one_strand() {
        let (metrics, connections) = harness();
        let (transport, _client) = loopback_transport().await;
        let protocol = Idle { buf: [0u8; 64] };
        let (core, handle) = ProtocolCore::new(transport, protocol, metrics, connections);
        let task = tokio::spawn(core.run());

        const JOBS: usize = 200;
        let state = Arc::new(RaceState { counter: std::cell::UnsafeCell::new(0), done: AtomicUsize::new(0) });
        let mut spawners = Vec::with_capacity(JOBS);
        for _ in 0..JOBS {
            let handle = handle.clone();
            let state = state.clone();
            spawners.push(tokio::spawn(async move {
                handle.call_from_thread(move |_ctx| {
                    Box::pin(async move {
                        let val = unsafe { *state.counter.get() };
                        tokio::task::yield_now().await;
                        unsafe { *state.counter.get() = val + 1 };
                        state.done.fetch_add(1, Ordering::SeqCst);
                    })
                });
            }));
        }
        for s in spawners {
            s.await.unwrap();
        }

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while state.done.load(Ordering::SeqCst) < JOBS {
            assert!(tokio::time::Instant::now() < deadline, "jobs never finished draining");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        assert_eq!(unsafe { *state.counter.get() }, JOBS as u64);

        handle.lose_connection();
        let _ = tokio::time::timeout(Duration::from_secs(5), task).await;
    }
}
