use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering::Relaxed;

use tokio::time::{interval, Duration, Instant};

use crate::stranded::config::COARSE_CLOCK_GRANULARITY_SECONDS;

/// A global, shared atomic clock advanced by `coarse_monotonic_clock_updater`.
static COARSE_CLOCK: AtomicU32 = AtomicU32::new(0);

/// Returns the current value of the clock, accurate to roughly
/// `COARSE_CLOCK_GRANULARITY_SECONDS`. Used for connection accept
/// timestamps and idle-timeout sweeps, where a cheap atomic load beats a
/// syscall on every read.
pub fn coarse_monotonic_now() -> u32 {
    COARSE_CLOCK.load(Relaxed)
}

fn update_coarse_monotonic_clock() {
    static mut START: Option<Instant> = None;

    // Safety: only the updater task calls this, and only from one place.
    unsafe {
        match START {
            Some(start) => {
                COARSE_CLOCK.store(start.elapsed().as_secs() as u32, Relaxed);
            }
            None => {
                START = Some(Instant::now());
            }
        }
    }
}

/// An infinite task that keeps the coarse clock ticking. The Reactor spawns
/// this once when the runtime starts.
pub async fn coarse_monotonic_clock_updater() {
    let mut interval = interval(Duration::from_secs(COARSE_CLOCK_GRANULARITY_SECONDS));
    loop {
        interval.tick().await;
        update_coarse_monotonic_clock();
    }
}
