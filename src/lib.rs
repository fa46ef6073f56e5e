pub mod stranded;

pub use crate::stranded::*;

use std::io;

use tokio::runtime::{Builder, Runtime};
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

use crate::stranded::common::{coarse_monotonic_clock_updater, Result};
use crate::stranded::config::{load_config, Settings};

/// Installs a process-wide `tracing` subscriber writing to stdout. Call
/// once, before `init_settings`/`Reactor::new`.
pub fn init_tracing(max_level: Level) {
    let subscriber = FmtSubscriber::builder().with_max_level(max_level).finish();
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");
}

/// Loads settings from `stranded.yaml`, searching the paths documented on
/// `stranded::config::load_config`.
pub fn init_settings() -> Result<&'static Settings> {
    load_config("stranded.yaml")
}

/// Builds the multi-threaded tokio runtime the reactor runs on, sized by
/// `settings.worker_count`.
pub fn init_runtime(settings: &'static Settings) -> io::Result<Runtime> {
    Builder::new_multi_thread()
        .worker_threads(settings.worker_count as usize)
        .enable_all()
        .build()
}

/// Starts the coarse monotonic clock updater on `runtime`. Call once before
/// accepting any connections - `ConnectionTable`'s idle-timeout sweep and
/// `ConnectionHandle::idle_seconds` both read this clock.
pub fn spawn_coarse_clock(runtime: &Runtime) {
    runtime.spawn(coarse_monotonic_clock_updater());
}
