use core::fmt::Debug;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Generic abstraction for the wall clock used for event timestamps and transaction deadlines.
///
/// The engine never waits on deadlines itself. It only records them, and an external periodic
/// task compares them against this clock.
pub trait TimeProvider: Debug + Send + Sync {
    /// Seconds since the UNIX epoch.
    fn now(&self) -> u64;
}

#[derive(Debug, Default, Copy, Clone)]
pub struct StdTimeProvider;

impl TimeProvider for StdTimeProvider {
    fn now(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_secs())
            .unwrap_or(0)
    }
}

/// Clock which only moves when told to. Useful for simulations and tests of deadline handling.
#[derive(Debug, Default)]
pub struct ManualClock(AtomicU64);

impl ManualClock {
    pub fn new(start: u64) -> Self {
        Self(AtomicU64::new(start))
    }

    pub fn set(&self, now: u64) {
        self.0.store(now, Ordering::Relaxed);
    }

    pub fn advance(&self, seconds: u64) {
        self.0.fetch_add(seconds, Ordering::Relaxed);
    }
}

impl TimeProvider for ManualClock {
    fn now(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}
