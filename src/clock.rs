//! Time sources.
//!
//! All primitives read time through [`Clock`] so tests can drive refill,
//! window rollover and breaker timeouts without sleeping.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// A source of wall-clock time.
pub trait Clock: Send + Sync {
    /// Time elapsed since the UNIX epoch.
    fn now(&self) -> Duration;

    /// Whole milliseconds since the UNIX epoch.
    fn now_ms(&self) -> u64 {
        self.now().as_millis() as u64
    }
}

/// The system wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Duration {
        let micros = chrono::Utc::now().timestamp_micros();
        Duration::from_micros(micros.max(0) as u64)
    }
}

/// A clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now_us: AtomicU64,
}

impl ManualClock {
    /// Create a manual clock starting at `start` since the epoch.
    pub fn new(start: Duration) -> Arc<Self> {
        Arc::new(Self {
            now_us: AtomicU64::new(start.as_micros() as u64),
        })
    }

    /// Move the clock forward.
    pub fn advance(&self, by: Duration) {
        self.now_us.fetch_add(by.as_micros() as u64, Ordering::SeqCst);
    }

    /// Jump to an absolute time. Going backwards is allowed.
    pub fn set(&self, to: Duration) {
        self.now_us.store(to.as_micros() as u64, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Duration {
        Duration::from_micros(self.now_us.load(Ordering::SeqCst))
    }
}

/// Shared default clock.
pub(crate) fn system() -> Arc<dyn Clock> {
    Arc::new(SystemClock)
}
