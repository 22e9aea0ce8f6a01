//! Monotonic time sources used by every limiter.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

/// A monotonic time source.
///
/// Window and expiry arithmetic is expressed against this trait so that
/// limiter behavior can be tested without waiting on the wall clock.
pub trait Clock: Send + Sync {
    /// The current instant.
    fn now(&self) -> Instant;
}

/// Clock shared between a service and its limiters.
pub type SharedClock = Arc<dyn Clock>;

/// Clock backed by the tokio runtime.
///
/// Follows tokio's paused time in tests, so queued waiters and window
/// expiry stay in step when a test calls `tokio::time::advance`.
#[derive(Debug, Clone, Copy, Default)]
pub struct RuntimeClock;

impl RuntimeClock {
    /// Create a shared runtime clock.
    pub fn shared() -> SharedClock {
        Arc::new(RuntimeClock)
    }
}

impl Clock for RuntimeClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Manually driven clock for deterministic tests.
///
/// Clones share the same underlying instant.
#[derive(Debug, Clone)]
pub struct ManualClock {
    current: Arc<Mutex<Instant>>,
}

impl ManualClock {
    /// Create a manual clock starting at `start`.
    pub fn new(start: Instant) -> Self {
        Self {
            current: Arc::new(Mutex::new(start)),
        }
    }

    /// Advance the clock by `duration`.
    pub fn advance(&self, duration: Duration) {
        *self.current.lock() += duration;
    }

    /// Set the clock to a specific instant.
    pub fn set(&self, instant: Instant) {
        *self.current.lock() = instant;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(Instant::now())
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        *self.current.lock()
    }
}
