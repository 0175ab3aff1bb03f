//! Wall-clock abstraction.
//!
//! Window closing and harvest readiness are decided against a [`Clock`] so
//! that tests can drive time explicitly. All readings are nanoseconds since
//! the Unix epoch, matching event timestamps.

use std::fmt::Debug;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Source of the current time in nanoseconds since the Unix epoch.
pub trait Clock: Send + Sync + Debug {
    /// Returns the current time in nanoseconds since the Unix epoch.
    fn now_ns(&self) -> u64;
}

/// Clock backed by [`SystemTime`].
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    #[allow(clippy::cast_possible_truncation)] // Current epoch nanos fit in u64 until year 2554
    fn now_ns(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| d.as_nanos() as u64)
    }
}

/// Manually advanced clock.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    /// Creates a clock reading `now_ns`.
    pub fn new(now_ns: u64) -> Self {
        Self {
            now: AtomicU64::new(now_ns),
        }
    }

    /// Sets the current reading.
    pub fn set(&self, now_ns: u64) {
        self.now.store(now_ns, Ordering::SeqCst);
    }

    /// Moves the clock forward by `by`.
    #[allow(clippy::cast_possible_truncation)]
    pub fn advance(&self, by: Duration) {
        self.now.fetch_add(by.as_nanos() as u64, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ns(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}
