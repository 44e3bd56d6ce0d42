//! Standalone single-instance limiters.
//!
//! These guard one resource (a connection, an outbound client) rather than a
//! key space, and are what [`KeyedLimiter`](super::KeyedLimiter) creates per
//! key.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::algorithm::{self, BucketState};
use super::decision::RateLimitDecision;
use crate::clock::{self, Clock};
use crate::error::Result;

/// Shortest pause between two attempts in [`Limiter::wait`].
const MIN_WAIT: Duration = Duration::from_millis(1);

/// A limiter guarding a single resource.
#[async_trait]
pub trait Limiter: Send + Sync {
    /// Take one unit if available and report the outcome.
    fn check(&self) -> RateLimitDecision;

    /// Take one unit if available.
    fn allow(&self) -> bool {
        self.check().allowed
    }

    /// Take one unit, sleeping until one is available.
    ///
    /// Cancel-safe: dropping the future between attempts takes nothing.
    async fn wait(&self) {
        loop {
            let decision = self.check();
            if decision.allowed {
                return;
            }
            tokio::time::sleep(decision.reset_after.max(MIN_WAIT)).await;
        }
    }
}

/// Token bucket with a continuous refill rate.
pub struct TokenBucket {
    capacity: f64,
    rate: f64,
    clock: Arc<dyn Clock>,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    /// A full bucket of `capacity` tokens refilled at `refill_per_sec`.
    pub fn new(capacity: u64, refill_per_sec: f64) -> Result<Self> {
        Self::with_clock(capacity, refill_per_sec, clock::system())
    }

    /// Same as [`TokenBucket::new`] reading time from `clock`.
    pub fn with_clock(capacity: u64, refill_per_sec: f64, clock: Arc<dyn Clock>) -> Result<Self> {
        algorithm::validate_bucket(capacity, refill_per_sec)?;
        Ok(Self::unchecked(capacity, refill_per_sec, clock))
    }

    pub(crate) fn unchecked(capacity: u64, refill_per_sec: f64, clock: Arc<dyn Clock>) -> Self {
        let capacity = capacity as f64;
        let state = BucketState::full(capacity, clock.now_ms());
        Self {
            capacity,
            rate: refill_per_sec,
            clock,
            state: Mutex::new(state),
        }
    }

    /// Tokens available right now.
    pub fn tokens(&self) -> f64 {
        let mut state = self.state.lock();
        algorithm::refill(&mut state, self.clock.now_ms(), self.capacity, self.rate);
        state.level
    }
}

impl Limiter for TokenBucket {
    fn check(&self) -> RateLimitDecision {
        let mut state = self.state.lock();
        let allowed = algorithm::token_bucket_step(&mut state, self.clock.now_ms(), self.capacity, self.rate);
        algorithm::token_bucket_decision(allowed, state.level, self.capacity, self.rate)
    }
}

/// Leaky bucket: a queue of at most `capacity` entries drained at a
/// constant rate.
pub struct LeakyBucket {
    capacity: f64,
    rate: f64,
    clock: Arc<dyn Clock>,
    state: Mutex<BucketState>,
}

impl LeakyBucket {
    /// An empty queue of `capacity` entries drained at `leak_per_sec`.
    pub fn new(capacity: u64, leak_per_sec: f64) -> Result<Self> {
        Self::with_clock(capacity, leak_per_sec, clock::system())
    }

    /// Same as [`LeakyBucket::new`] reading time from `clock`.
    pub fn with_clock(capacity: u64, leak_per_sec: f64, clock: Arc<dyn Clock>) -> Result<Self> {
        algorithm::validate_bucket(capacity, leak_per_sec)?;
        Ok(Self::unchecked(capacity, leak_per_sec, clock))
    }

    pub(crate) fn unchecked(capacity: u64, leak_per_sec: f64, clock: Arc<dyn Clock>) -> Self {
        let state = BucketState::empty(clock.now_ms());
        Self {
            capacity: capacity as f64,
            rate: leak_per_sec,
            clock,
            state: Mutex::new(state),
        }
    }

    /// Entries queued right now.
    pub fn level(&self) -> f64 {
        let mut state = self.state.lock();
        algorithm::leak(&mut state, self.clock.now_ms(), self.rate);
        state.level
    }
}

impl Limiter for LeakyBucket {
    fn check(&self) -> RateLimitDecision {
        let mut state = self.state.lock();
        let allowed = algorithm::leaky_bucket_step(&mut state, self.clock.now_ms(), self.capacity, self.rate);
        algorithm::leaky_bucket_decision(allowed, state.level, self.capacity, self.rate)
    }
}
