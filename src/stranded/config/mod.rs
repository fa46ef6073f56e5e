mod config;
mod load;

pub use config::{config, FileOrBytes, ListenerConfig, Settings, TlsMaterial};
pub use load::load_config;

/// Granularity of the coarse monotonic clock used for idle-timeout sweeps.
pub const COARSE_CLOCK_GRANULARITY_SECONDS: u64 = 1;

/// Backlog passed to `listen(2)` for each listening socket.
pub const LISTEN_BACKLOG: u32 = 1024;

/// How often the Reactor's connection table scans for idle connections.
pub const CHECK_TIMEOUTS_INTERVAL: u64 = 5;
