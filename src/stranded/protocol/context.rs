use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, AtomicU64};
use std::sync::atomic::Ordering::Relaxed;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::time::Duration;

use crate::stranded::common::{coarse_monotonic_now, Error, Result};
use crate::stranded::transport::Transport;

type BoxFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// A piece of strand work: a scheduled call, or a `call_from_thread` hop.
/// Always run by the owning strand's task, one at a time, via `job_rx`.
pub(crate) type Job = Box<dyn FnOnce(Context) -> BoxFuture + Send>;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) fn next_connection_id() -> u64 {
    NEXT_CONNECTION_ID.fetch_add(1, Relaxed)
}

pub(crate) struct ConnectionShared {
    pub(crate) id: u64,
    pub(crate) transport: Arc<Transport>,
    pub(crate) job_tx: mpsc::UnboundedSender<Job>,
    pub(crate) last_active: AtomicU32,
}

/// A cloneable, `Send`-able reference to a connection, usable from any
/// thread - unlike `Context`, which only exists for the duration of a
/// callback or scheduled call on that connection's own strand.
///
/// This is what `forward()` targets and what `call_from_thread` is called
/// on to hop back into a strand from arbitrary code (a timer, another
/// thread, another connection's strand).
#[derive(Clone)]
pub struct ConnectionHandle {
    pub(crate) shared: Arc<ConnectionShared>,
}

impl ConnectionHandle {
    pub fn id(&self) -> u64 {
        self.shared.id
    }

    pub fn is_connected(&self) -> bool {
        self.shared.transport.is_open()
    }

    pub fn lose_connection(&self) {
        self.shared.transport.close();
    }

    /// Seconds since this connection last had a callback or job run on it.
    /// Used by the idle-timeout sweep; not meaningful before the first
    /// dispatch (reads 0 until then, same as the connection never idling).
    pub(crate) fn idle_seconds(&self) -> u32 {
        let last = self.shared.last_active.load(Relaxed);
        if last == 0 {
            return 0;
        }
        coarse_monotonic_now().saturating_sub(last)
    }

    fn touch(&self) {
        self.shared.last_active.store(coarse_monotonic_now(), Relaxed);
    }

    /// Writes `bytes` on this connection using the caller's own task as the
    /// suspension context - the write completes wherever `forward` is
    /// awaited, not on this connection's strand. Fails if the connection
    /// is no longer open.
    pub async fn forward(&self, bytes: &[u8]) -> Result<()> {
        if !self.is_connected() {
            return Err(Error::closed());
        }
        self.shared.transport.write_all(bytes).await
    }

    /// Enqueues `f` onto this connection's strand without binding to the
    /// caller's own strand (if any) and without suspending. `f` runs with
    /// a fresh `Context` the next time this connection's task drains its
    /// job queue.
    pub fn call_from_thread<F>(&self, f: F)
    where
        F: FnOnce(Context) -> BoxFuture + Send + 'static,
    {
        let _ = self.shared.job_tx.send(Box::new(f));
    }
}

/// The current suspension context: the handle through which a user
/// callback or scheduled-call body may issue I/O on its own connection.
///
/// Rust's ownership already gives us the invariant the source relied on a
/// mutable "current context" variable for: a `Context` can only be
/// constructed by `ProtocolCore` for the duration of one callback or job
/// invocation, so it is never reachable outside of one, and nesting
/// (`call_later` inside a callback) just produces a fresh `Context` for the
/// nested body - there is nothing to save and restore.
#[derive(Clone)]
pub struct Context {
    handle: ConnectionHandle,
}

impl Context {
    pub(crate) fn new(shared: Arc<ConnectionShared>) -> Self {
        let ctx = Context {
            handle: ConnectionHandle { shared },
        };
        ctx.handle.touch();
        ctx
    }

    pub fn connection_id(&self) -> u64 {
        self.handle.id()
    }

    pub fn is_connected(&self) -> bool {
        self.handle.is_connected()
    }

    pub fn lose_connection(&self) {
        self.handle.lose_connection()
    }

    /// A cloneable handle to this connection, for storing (e.g. to forward
    /// to later) or handing to another strand.
    pub fn handle(&self) -> ConnectionHandle {
        self.handle.clone()
    }

    pub async fn send(&self, bytes: &[u8]) -> Result<()> {
        self.handle.shared.transport.write_all(bytes).await
    }

    /// Scatter write: writes each buffer in order without concatenating
    /// them first. `LineReceiver::send_line` uses this to append the
    /// delimiter to a payload without copying it.
    pub async fn send_buffers(&self, bufs: &[&[u8]]) -> Result<()> {
        self.handle.shared.transport.write_vectored(bufs).await
    }

    pub async fn forward(&self, other: &ConnectionHandle, bytes: &[u8]) -> Result<()> {
        other.forward(bytes).await
    }

    /// Suspends the current task for `delay`.
    pub async fn wait_for(&self, delay: Duration) {
        tokio::time::sleep(delay).await;
    }

    /// Synchronously (from the framing engine's point of view) reads
    /// exactly `buf.len()` more bytes from the transport, used by
    /// `ByteReceiver::next_packet` to complete a partial block without
    /// waiting for the next `on_message` dispatch.
    pub async fn read_more(&self, buf: &mut [u8]) -> Result<()> {
        let mut filled = 0;
        while filled < buf.len() {
            let n = self.handle.shared.transport.read_some(&mut buf[filled..]).await?;
            filled += n;
        }
        Ok(())
    }

    /// Schedules `f` to run after `delay`, on this connection's strand.
    /// Nestable: `f` receives its own fresh `Context` just like any other
    /// dispatch.
    pub fn call_later<F>(&self, delay: Duration, f: F)
    where
        F: FnOnce(Context) -> BoxFuture + Send + 'static,
    {
        let handle = self.handle.clone();
        if delay.is_zero() {
            handle.call_from_thread(f);
            return;
        }
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            handle.call_from_thread(f);
        });
    }

    /// Equivalent to `call_later(Duration::ZERO, f)`: runs after the
    /// current callback returns and after any work already queued on this
    /// strand drains.
    pub fn call<F>(&self, f: F)
    where
        F: FnOnce(Context) -> BoxFuture + Send + 'static,
    {
        self.call_later(Duration::ZERO, f)
    }
}
