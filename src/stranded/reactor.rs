use std::sync::Arc;

use rustls::ServerConfig;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::stranded::common::Result;
use crate::stranded::config::config;
use crate::stranded::connections::{ConnectionTable, Metrics};
use crate::stranded::protocol::{Protocol, ProtocolCore};
use crate::stranded::transport::{Listener, Transport};

/// Owns every listening socket and the shared connection bookkeeping
/// (`Metrics`, `ConnectionTable`) for one process. Mirrors the teacher's
/// `PostgresService`: bind, loop accepting, hand each socket off to its own
/// spawned task - generalized from one hardcoded protocol to any `Protocol`
/// the caller supplies via a factory closure, and from one listener to
/// however many `listen_tcp`/`listen_tls` calls the caller makes.
pub struct Reactor {
    metrics: Arc<Metrics>,
    connections: Arc<ConnectionTable>,
    tasks: Vec<JoinHandle<()>>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Reactor {
    pub fn new() -> Self {
        let cfg = config();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Reactor {
            metrics: Metrics::new(),
            connections: ConnectionTable::new(cfg.timeout_seconds),
            tasks: Vec::new(),
            shutdown_tx,
            shutdown_rx,
        }
    }

    pub fn metrics(&self) -> Arc<Metrics> {
        self.metrics.clone()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Binds `port` and accepts plain TCP connections, constructing a fresh
    /// `P` from `factory` for each one. If `settings.reuseport` is set,
    /// binds one socket per worker thread instead of sharing a single
    /// listener across them.
    pub fn listen_tcp<P, F>(&mut self, port: u16, factory: F) -> Result<()>
    where
        P: Protocol,
        F: Fn() -> P + Send + Sync + 'static,
    {
        self.spawn_listeners(port, None, factory)
    }

    /// Same as `listen_tcp`, but wraps each accepted socket in a TLS
    /// server session using `tls_config`.
    pub fn listen_tls<P, F>(&mut self, port: u16, tls_config: Arc<ServerConfig>, factory: F) -> Result<()>
    where
        P: Protocol,
        F: Fn() -> P + Send + Sync + 'static,
    {
        self.spawn_listeners(port, Some(tls_config), factory)
    }

    fn spawn_listeners<P, F>(&mut self, port: u16, tls_config: Option<Arc<ServerConfig>>, factory: F) -> Result<()>
    where
        P: Protocol,
        F: Fn() -> P + Send + Sync + 'static,
    {
        let cfg = config();
        let num_listeners = if cfg.reuseport { cfg.worker_count as usize } else { 1 };
        let factory = Arc::new(factory);
        let max_connections = cfg.max_connections as usize;

        for _ in 0..num_listeners.max(1) {
            let listener = Listener::bind(&cfg.host, port, cfg.reuseport)?;
            let metrics = self.metrics.clone();
            let connections = self.connections.clone();
            let tls_config = tls_config.clone();
            let factory = factory.clone();
            let mut shutdown_rx = self.shutdown_rx.clone();

            let handle = tokio::spawn(async move {
                info!(address = %listener.address, "listening");
                loop {
                    let sock = tokio::select! {
                        _ = shutdown_rx.changed() => break,
                        accepted = listener.accept() => match accepted {
                            Some(sock) => sock,
                            None => break,
                        },
                    };

                    if max_connections > 0 && connections.len() >= max_connections {
                        metrics.connection_rejected();
                        warn!(limit = max_connections, "reached connection limit, rejecting accept");
                        continue;
                    }

                    let transport = match &tls_config {
                        Some(tls_config) => match Transport::new_tls(sock, tls_config.clone()) {
                            Ok(t) => t,
                            Err(e) => {
                                warn!(%e, "failed to set up TLS transport for accepted connection");
                                continue;
                            }
                        },
                        None => Transport::new_plain(sock),
                    };

                    let protocol = (*factory)();
                    let (core, _handle) =
                        ProtocolCore::new(transport, protocol, metrics.clone(), connections.clone());
                    tokio::spawn(core.run());
                }
                info!(address = %listener.address, "listener stopped");
            });
            self.tasks.push(handle);
        }
        Ok(())
    }

    /// Awaits every listener task. Returns once all of them have stopped -
    /// normally only after `stop()` is called, or a listener hits a fatal
    /// accept error.
    pub async fn run(mut self) {
        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                warn!(%e, "listener task panicked");
            }
        }
    }

    /// Signals every listener to stop accepting new connections, then closes
    /// every connection currently open. Closing wakes each connection's
    /// suspended read with `Error::closed()`, so every `ProtocolCore::run`
    /// task runs its `on_disconnect` and exits on its own; `stop()` itself
    /// does not block on that happening.
    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
        self.connections.close_all();
    }
}

impl Default for Reactor {
    fn default() -> Self {
        Self::new()
    }
}
