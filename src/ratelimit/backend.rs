//! Rate limiter trait for abstracting local and distributed implementations.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use super::decision::RateLimitDecision;
use crate::error::Result;

/// Trait for rate limiter implementations.
///
/// This trait abstracts over both the [`LocalRateLimiter`](super::LocalRateLimiter)
/// and the [`DistributedRateLimiter`](super::DistributedRateLimiter) so callers
/// can work with either.
#[async_trait]
pub trait RateLimiter: Send + Sync {
    /// Count one operation for `key` against `limit` operations per `period`.
    ///
    /// A denial is returned as `Ok` with `allowed == false`. Errors are store
    /// failures or invalid arguments; whether to fail open or closed on an
    /// error is the caller's decision.
    async fn allow(&self, key: &str, limit: u64, period: Duration) -> Result<RateLimitDecision>;
}

#[async_trait]
impl<T: RateLimiter + ?Sized> RateLimiter for Arc<T> {
    async fn allow(&self, key: &str, limit: u64, period: Duration) -> Result<RateLimitDecision> {
        (**self).allow(key, limit, period).await
    }
}
