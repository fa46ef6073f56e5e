use std::sync::atomic::Ordering::Relaxed;
use std::sync::atomic::{AtomicI64, AtomicU64};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::time::{interval, Duration};
use tracing::{info_span, warn};

use crate::stranded::config::CHECK_TIMEOUTS_INTERVAL;
use crate::stranded::protocol::ConnectionHandle;

/// Connection-lifecycle counters, exposed for health checks and logging.
/// The teacher tracked these as plain fields on its lock-free connection
/// table; kept as a standalone struct here since the table itself no
/// longer owns connection storage directly (see `ConnectionTable`).
#[derive(Default)]
pub struct Metrics {
    accepted: AtomicU64,
    active: AtomicI64,
    rejected: AtomicU64,
    errored: AtomicU64,
    closed: AtomicU64,
}

/// A snapshot of `Metrics` at one point in time, safe to log or serialize.
#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct MetricsSnapshot {
    pub accepted: u64,
    pub active: i64,
    pub rejected: u64,
    pub errored: u64,
    pub closed: u64,
}

impl Metrics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn connection_accepted(&self) {
        self.accepted.fetch_add(1, Relaxed);
        self.active.fetch_add(1, Relaxed);
    }

    pub(crate) fn connection_rejected(&self) {
        self.rejected.fetch_add(1, Relaxed);
    }

    pub(crate) fn connection_errored(&self) {
        self.errored.fetch_add(1, Relaxed);
    }

    pub(crate) fn connection_closed(&self) {
        self.closed.fetch_add(1, Relaxed);
        self.active.fetch_add(-1, Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            accepted: self.accepted.load(Relaxed),
            active: self.active.load(Relaxed),
            rejected: self.rejected.load(Relaxed),
            errored: self.errored.load(Relaxed),
            closed: self.closed.load(Relaxed),
        }
    }
}

/// The set of currently-live connections, keyed by connection id.
///
/// The teacher's `Connections<C>` is a lock-free array of atomic pointers,
/// sized and slotted to avoid ever allocating on the connection-accept hot
/// path. This crate doesn't own the connection's memory the way the
/// teacher's `Ark<C>` ref-counting scheme did - `ProtocolCore<P>` owns its
/// `Protocol` directly - so the table only needs to hold cloneable
/// `ConnectionHandle`s for timeout sweeps and diagnostics, which is exactly
/// what `dashmap::DashMap` is for. See DESIGN.md for the tradeoff.
pub struct ConnectionTable {
    items: DashMap<u64, ConnectionHandle>,
    timeout_seconds: u32,
}

impl ConnectionTable {
    pub fn new(timeout_seconds: u32) -> Arc<Self> {
        let table = Arc::new(ConnectionTable {
            items: DashMap::new(),
            timeout_seconds,
        });
        if timeout_seconds > 0 {
            tokio::spawn(table.clone().timeouts_task());
        }
        table
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub(crate) fn register(&self, handle: ConnectionHandle) {
        self.items.insert(handle.id(), handle);
    }

    pub(crate) fn unregister(&self, id: u64) {
        self.items.remove(&id);
    }

    /// Closes every currently-registered connection's transport. This wakes
    /// any suspended read on each connection's strand with `Error::closed()`,
    /// driving `ProtocolCore::run` to `on_disconnect` the same way a peer
    /// hangup would. Used by `Reactor::stop()` so that stopping the reactor
    /// doesn't leave already-accepted connections running indefinitely.
    pub(crate) fn close_all(&self) {
        for entry in self.items.iter() {
            entry.value().lose_connection();
        }
    }

    fn do_timeouts(&self) {
        let _span = info_span!("scanning for idle connections", count = self.len()).entered();
        self.items.retain(|_, handle| {
            if !handle.is_connected() {
                return false;
            }
            if handle.idle_seconds() >= self.timeout_seconds {
                warn!(connection_id = handle.id(), timeout = self.timeout_seconds, "closing idle connection");
                handle.lose_connection();
            }
            true
        });
    }

    async fn timeouts_task(self: Arc<Self>) {
        let mut ticker = interval(Duration::from_secs(CHECK_TIMEOUTS_INTERVAL));
        loop {
            ticker.tick().await;
            self.do_timeouts();
        }
    }
}
