//! Time source abstraction.
//!
//! Circuit timeouts and performance timestamps read the time through [`Clock`] so tests can
//! drive them without sleeping. Timers themselves use `tokio::time`, which tests pause with
//! `#[tokio::test(start_paused = true)]`.

use parking_lot::Mutex;
use std::time::Duration;
use tokio::time::Instant;

/// Source of monotonic time.
pub trait Clock: Send + Sync + 'static {
    /// Current instant.
    fn now(&self) -> Instant;
}

/// Clock backed by `tokio::time::Instant::now()`.
///
/// Follows the tokio runtime clock, so it advances with `tokio::time::advance` in paused
/// test runtimes.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Manually advanced clock for deterministic tests.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<Instant>,
}

impl ManualClock {
    /// Create a clock frozen at the current instant.
    pub fn new() -> Self {
        Self {
            now: Mutex::new(Instant::now()),
        }
    }

    /// Move the clock forward.
    pub fn advance(&self, by: Duration) {
        *self.now.lock() += by;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        *self.now.lock()
    }
}
