//! Rate limit decisions.

use std::time::Duration;

/// The outcome of one `allow` call.
///
/// A denial is a normal outcome, not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitDecision {
    /// Whether the operation may proceed
    pub allowed: bool,
    /// Operations still available before the limit is reached
    pub remaining: u64,
    /// When quota frees up again (meaning depends on the algorithm)
    pub reset_after: Duration,
}

impl RateLimitDecision {
    /// An admitted operation.
    pub fn allowed(remaining: u64, reset_after: Duration) -> Self {
        Self {
            allowed: true,
            remaining,
            reset_after,
        }
    }

    /// A denied operation; nothing remains until `reset_after` passes.
    pub fn denied(reset_after: Duration) -> Self {
        Self {
            allowed: false,
            remaining: 0,
            reset_after,
        }
    }
}
