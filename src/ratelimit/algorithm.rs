//! Rate limiting algorithms.
//!
//! The state transitions and decision math live here once and are shared by
//! the in-process limiter, the standalone buckets and the store scripts, so
//! every variant answers identically for the same calls at the same times.
//! Time is whole milliseconds since the UNIX epoch.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::decision::RateLimitDecision;
use crate::error::{BulwarkError, Result};

/// The four limiter families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Algorithm {
    /// Counter per `floor(now / period)` window. Boundary bursts may reach
    /// twice the limit.
    FixedWindow,
    /// Current window plus the previous window weighted by how much of it
    /// still overlaps the rolling period.
    SlidingWindow,
    /// Bucket of `limit` credits refilled at `limit / period`.
    TokenBucket,
    /// Queue of at most `limit` entries drained at `limit / period`.
    LeakyBucket,
}

impl Algorithm {
    /// All algorithms, for iteration in tests and tooling.
    pub const ALL: [Algorithm; 4] = [
        Algorithm::FixedWindow,
        Algorithm::SlidingWindow,
        Algorithm::TokenBucket,
        Algorithm::LeakyBucket,
    ];

    /// Configuration name of the algorithm.
    pub fn as_str(&self) -> &'static str {
        match self {
            Algorithm::FixedWindow => "fixed_window",
            Algorithm::SlidingWindow => "sliding_window",
            Algorithm::TokenBucket => "token_bucket",
            Algorithm::LeakyBucket => "leaky_bucket",
        }
    }

    /// Short tag used in store keys.
    pub(crate) fn key_tag(&self) -> &'static str {
        match self {
            Algorithm::FixedWindow => "fw",
            Algorithm::SlidingWindow => "sw",
            Algorithm::TokenBucket => "tb",
            Algorithm::LeakyBucket => "lb",
        }
    }
}

impl std::fmt::Display for Algorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Counter for one fixed window, remembering the window before it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowCounter {
    /// `floor(now / period)` of the current window
    pub index: u64,
    /// Operations counted in the current window
    pub count: u64,
    /// Operations counted in the window just before `index`
    pub previous: u64,
}

impl WindowCounter {
    /// An empty counter for the window containing `now_ms`.
    pub fn new(now_ms: u64, period_ms: u64) -> Self {
        Self {
            index: now_ms / period_ms,
            count: 0,
            previous: 0,
        }
    }

    /// Move to the window containing `now_ms`. A clock that steps backwards
    /// stays in the current window.
    fn roll(&mut self, now_ms: u64, period_ms: u64) {
        let index = now_ms / period_ms;
        if index <= self.index {
            return;
        }
        self.previous = if index == self.index + 1 { self.count } else { 0 };
        self.count = 0;
        self.index = index;
    }
}

/// Level and last update time of a token or leaky bucket.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketState {
    /// Tokens available (token bucket) or queued entries (leaky bucket)
    pub level: f64,
    /// Time of the last refill or leak
    pub last_update_ms: u64,
}

impl BucketState {
    /// A token bucket starts full.
    pub fn full(capacity: f64, now_ms: u64) -> Self {
        Self {
            level: capacity,
            last_update_ms: now_ms,
        }
    }

    /// A leaky bucket starts empty.
    pub fn empty(now_ms: u64) -> Self {
        Self {
            level: 0.0,
            last_update_ms: now_ms,
        }
    }

    fn elapsed_secs(&mut self, now_ms: u64) -> f64 {
        let elapsed_ms = now_ms.saturating_sub(self.last_update_ms);
        self.last_update_ms = self.last_update_ms.max(now_ms);
        elapsed_ms as f64 / 1000.0
    }
}

/// Check `limit` and `period`, returning the period in milliseconds.
pub(crate) fn validate(limit: u64, period: Duration) -> Result<u64> {
    if limit == 0 {
        return Err(BulwarkError::InvalidArgument(
            "limit must be greater than zero".to_string(),
        ));
    }
    let period_ms = u64::try_from(period.as_millis()).map_err(|_| {
        BulwarkError::InvalidArgument(format!("period {period:?} is too large"))
    })?;
    if period_ms == 0 {
        return Err(BulwarkError::InvalidArgument(
            "period must be at least one millisecond".to_string(),
        ));
    }
    Ok(period_ms)
}

/// Check a standalone bucket's capacity and rate.
pub(crate) fn validate_bucket(capacity: u64, rate_per_sec: f64) -> Result<()> {
    if capacity == 0 {
        return Err(BulwarkError::InvalidArgument(
            "capacity must be greater than zero".to_string(),
        ));
    }
    if !rate_per_sec.is_finite() || rate_per_sec <= 0.0 {
        return Err(BulwarkError::InvalidArgument(format!(
            "rate must be a positive number, got {rate_per_sec}"
        )));
    }
    Ok(())
}

/// Refill or leak rate in units per second.
pub(crate) fn rate_per_sec(limit: u64, period_ms: u64) -> f64 {
    limit as f64 / (period_ms as f64 / 1000.0)
}

/// Store TTL for window counters and bucket state.
pub(crate) fn state_ttl(period_ms: u64) -> Duration {
    Duration::from_millis(period_ms.saturating_mul(2))
}

fn until_window_end(now_ms: u64, period_ms: u64) -> Duration {
    Duration::from_millis(period_ms - now_ms % period_ms)
}

fn secs_to_duration(secs: f64) -> Duration {
    if !secs.is_finite() || secs <= 0.0 {
        return Duration::ZERO;
    }
    Duration::from_millis((secs * 1000.0).ceil() as u64)
}

// Fixed window

/// Count one operation in the current fixed window.
pub(crate) fn fixed_window(
    state: &mut WindowCounter,
    now_ms: u64,
    limit: u64,
    period_ms: u64,
) -> RateLimitDecision {
    state.roll(now_ms, period_ms);
    state.count += 1;
    fixed_window_decision(state.count, now_ms, limit, period_ms)
}

/// Decision for a fixed window whose counter reached `count`.
pub(crate) fn fixed_window_decision(
    count: u64,
    now_ms: u64,
    limit: u64,
    period_ms: u64,
) -> RateLimitDecision {
    RateLimitDecision {
        allowed: count <= limit,
        remaining: limit.saturating_sub(count),
        reset_after: until_window_end(now_ms, period_ms),
    }
}

// Sliding window

/// Weighted count of the rolling period ending at `now_ms`.
pub(crate) fn sliding_weighted_count(current: u64, previous: u64, now_ms: u64, period_ms: u64) -> f64 {
    let progress = (now_ms % period_ms) as f64 / period_ms as f64;
    current as f64 + previous as f64 * (1.0 - progress)
}

/// Admit one operation if the weighted count is below `limit`.
pub(crate) fn sliding_window(
    state: &mut WindowCounter,
    now_ms: u64,
    limit: u64,
    period_ms: u64,
) -> RateLimitDecision {
    state.roll(now_ms, period_ms);
    let current = state.count;
    let admitted = sliding_admits(current, state.previous, now_ms, limit, period_ms);
    if admitted {
        state.count += 1;
    }
    sliding_window_decision(admitted, current, state.previous, now_ms, limit, period_ms)
}

/// Whether the weighted count leaves room for one more operation.
pub(crate) fn sliding_admits(current: u64, previous: u64, now_ms: u64, limit: u64, period_ms: u64) -> bool {
    sliding_weighted_count(current, previous, now_ms, period_ms) < limit as f64
}

/// Decision for a sliding window given the counts seen before admission.
pub(crate) fn sliding_window_decision(
    admitted: bool,
    current: u64,
    previous: u64,
    now_ms: u64,
    limit: u64,
    period_ms: u64,
) -> RateLimitDecision {
    if admitted {
        let weighted = sliding_weighted_count(current, previous, now_ms, period_ms);
        let remaining = (limit as f64 - weighted - 1.0).floor().max(0.0) as u64;
        return RateLimitDecision::allowed(remaining, until_window_end(now_ms, period_ms));
    }

    let elapsed_ms = now_ms % period_ms;
    if previous > 0 && current < limit {
        // first e with current + previous * (period - e) / period < limit
        let (period, previous) = (period_ms as u128, previous as u128);
        let spare = (limit - current) as u128 * period;
        let first_ms = (period * previous).saturating_sub(spare) / previous + 1;
        let wait_ms = (first_ms as u64).saturating_sub(elapsed_ms).max(1);
        return RateLimitDecision::denied(Duration::from_millis(wait_ms));
    }

    // past the boundary this window's count becomes the previous one and
    // first drops below `limit` e ms in, with current * (period - e) / period < limit
    let (period, current, limit) = (period_ms as u128, current.max(1) as u128, limit as u128);
    let past_boundary_ms = period * current.saturating_sub(limit) / current + 1;
    RateLimitDecision::denied(
        until_window_end(now_ms, period_ms) + Duration::from_millis(past_boundary_ms as u64),
    )
}

// Token bucket

/// Rounding slack in bucket level comparisons. Bucket scripts use the same
/// literal.
pub(crate) const LEVEL_EPSILON: f64 = 1e-9;

/// Add the tokens earned since the last update, capped at `capacity`.
pub(crate) fn refill(state: &mut BucketState, now_ms: u64, capacity: f64, rate: f64) {
    let elapsed_secs = state.elapsed_secs(now_ms);
    state.level = (state.level + elapsed_secs * rate).min(capacity);
}

/// Refill, then take one token if available.
pub(crate) fn token_bucket_step(state: &mut BucketState, now_ms: u64, capacity: f64, rate: f64) -> bool {
    refill(state, now_ms, capacity, rate);
    if state.level >= 1.0 - LEVEL_EPSILON {
        state.level = (state.level - 1.0).max(0.0);
        true
    } else {
        false
    }
}

/// Decision for a token bucket left at `tokens` after the step.
pub(crate) fn token_bucket_decision(allowed: bool, tokens: f64, capacity: f64, rate: f64) -> RateLimitDecision {
    if allowed {
        RateLimitDecision::allowed(
            tokens.floor().max(0.0) as u64,
            secs_to_duration((capacity - tokens) / rate),
        )
    } else {
        RateLimitDecision::denied(secs_to_duration((1.0 - tokens) / rate))
    }
}

// Leaky bucket

/// Drain the entries leaked since the last update.
pub(crate) fn leak(state: &mut BucketState, now_ms: u64, rate: f64) {
    let elapsed_secs = state.elapsed_secs(now_ms);
    state.level = (state.level - elapsed_secs * rate).max(0.0);
}

/// Leak, then enqueue one entry if it fits under `capacity`.
pub(crate) fn leaky_bucket_step(state: &mut BucketState, now_ms: u64, capacity: f64, rate: f64) -> bool {
    leak(state, now_ms, rate);
    if state.level + 1.0 <= capacity + LEVEL_EPSILON {
        state.level = (state.level + 1.0).min(capacity);
        true
    } else {
        false
    }
}

/// Decision for a leaky bucket left at `level` after the step.
pub(crate) fn leaky_bucket_decision(allowed: bool, level: f64, capacity: f64, rate: f64) -> RateLimitDecision {
    if allowed {
        RateLimitDecision::allowed(
            (capacity - level).floor().max(0.0) as u64,
            secs_to_duration(level / rate),
        )
    } else {
        RateLimitDecision::denied(secs_to_duration((level + 1.0 - capacity) / rate))
    }
}
