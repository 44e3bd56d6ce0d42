//! In-process rate limiter with per-key locking.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, trace};

use super::algorithm::{self, Algorithm, BucketState, WindowCounter};
use super::backend::RateLimiter;
use super::decision::RateLimitDecision;
use crate::clock::{self, Clock};
use crate::error::Result;

/// Per-key algorithm state.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum KeyState {
    /// Fixed or sliding window counter
    Window(WindowCounter),
    /// Token or leaky bucket
    Bucket(BucketState),
}

struct Slot {
    state: KeyState,
    last_seen_ms: u64,
}

/// A rate limiter whose state lives in this process.
///
/// Each key's state sits behind its own mutex, so calls for one key are
/// serialized while calls for different keys never contend. The map itself is
/// sharded ([`DashMap`]) and its guard is released before the key's mutex is
/// taken.
pub struct LocalRateLimiter {
    algorithm: Algorithm,
    clock: Arc<dyn Clock>,
    slots: DashMap<String, Arc<Mutex<Slot>>>,
}

impl LocalRateLimiter {
    /// Create a local limiter for `algorithm` on the system clock.
    pub fn new(algorithm: Algorithm) -> Self {
        Self::with_clock(algorithm, clock::system())
    }

    /// Create a local limiter reading time from `clock`.
    pub fn with_clock(algorithm: Algorithm, clock: Arc<dyn Clock>) -> Self {
        Self {
            algorithm,
            clock,
            slots: DashMap::new(),
        }
    }

    /// Fixed window limiter on the system clock.
    pub fn fixed_window() -> Self {
        Self::new(Algorithm::FixedWindow)
    }

    /// Sliding window limiter on the system clock.
    pub fn sliding_window() -> Self {
        Self::new(Algorithm::SlidingWindow)
    }

    /// Token bucket limiter on the system clock.
    pub fn token_bucket() -> Self {
        Self::new(Algorithm::TokenBucket)
    }

    /// Leaky bucket limiter on the system clock.
    pub fn leaky_bucket() -> Self {
        Self::new(Algorithm::LeakyBucket)
    }

    /// The algorithm this limiter runs.
    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    /// Count one operation for `key`.
    pub fn check(&self, key: &str, limit: u64, period: Duration) -> Result<RateLimitDecision> {
        let period_ms = algorithm::validate(limit, period)?;
        let now_ms = self.clock.now_ms();
        let slot = self.slot(key, now_ms, limit, period_ms);

        let decision = {
            let mut slot = slot.lock();
            slot.last_seen_ms = now_ms;
            self.step(&mut slot.state, now_ms, limit, period_ms)
        };

        trace!(
            key = %key,
            algorithm = %self.algorithm,
            allowed = decision.allowed,
            remaining = decision.remaining,
            "Checked local rate limit"
        );
        if !decision.allowed {
            debug!(key = %key, limit = limit, "Rate limit exceeded");
        }
        Ok(decision)
    }

    /// Snapshot of the state held for `key`.
    pub fn state(&self, key: &str) -> Option<KeyState> {
        let slot = self.slots.get(key)?.clone();
        let state = slot.lock().state;
        Some(state)
    }

    /// Forget the state held for `key`.
    pub fn reset(&self, key: &str) {
        self.slots.remove(key);
    }

    /// Clear all state.
    ///
    /// This is primarily useful for testing.
    pub fn clear(&self) {
        self.slots.clear();
    }

    /// Number of keys with state.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether no key has state.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Drop the state of keys not used for at least `max_idle`.
    ///
    /// A bucket untouched for a full period is back to its initial level, so
    /// evicting keys idle for longer than their period loses nothing.
    pub fn evict_idle(&self, max_idle: Duration) -> usize {
        let now_ms = self.clock.now_ms();
        let max_idle_ms = max_idle.as_millis() as u64;
        let before = self.slots.len();
        self.slots
            .retain(|_, slot| now_ms.saturating_sub(slot.lock().last_seen_ms) < max_idle_ms);
        let evicted = before.saturating_sub(self.slots.len());
        if evicted > 0 {
            debug!(evicted = evicted, "Evicted idle rate limit state");
        }
        evicted
    }

    fn slot(&self, key: &str, now_ms: u64, limit: u64, period_ms: u64) -> Arc<Mutex<Slot>> {
        if let Some(slot) = self.slots.get(key) {
            return slot.clone();
        }

        self.slots
            .entry(key.to_string())
            .or_insert_with(|| {
                debug!(
                    key = %key,
                    algorithm = %self.algorithm,
                    limit = limit,
                    period_ms = period_ms,
                    "Creating new rate limit state"
                );
                Arc::new(Mutex::new(Slot {
                    state: self.initial_state(now_ms, limit, period_ms),
                    last_seen_ms: now_ms,
                }))
            })
            .clone()
    }

    fn initial_state(&self, now_ms: u64, limit: u64, period_ms: u64) -> KeyState {
        match self.algorithm {
            Algorithm::FixedWindow | Algorithm::SlidingWindow => {
                KeyState::Window(WindowCounter::new(now_ms, period_ms))
            }
            Algorithm::TokenBucket => KeyState::Bucket(BucketState::full(limit as f64, now_ms)),
            Algorithm::LeakyBucket => KeyState::Bucket(BucketState::empty(now_ms)),
        }
    }

    fn step(&self, state: &mut KeyState, now_ms: u64, limit: u64, period_ms: u64) -> RateLimitDecision {
        let capacity = limit as f64;
        let rate = algorithm::rate_per_sec(limit, period_ms);
        match (self.algorithm, state) {
            (Algorithm::FixedWindow, KeyState::Window(counter)) => {
                algorithm::fixed_window(counter, now_ms, limit, period_ms)
            }
            (Algorithm::SlidingWindow, KeyState::Window(counter)) => {
                algorithm::sliding_window(counter, now_ms, limit, period_ms)
            }
            (Algorithm::TokenBucket, KeyState::Bucket(bucket)) => {
                let allowed = algorithm::token_bucket_step(bucket, now_ms, capacity, rate);
                algorithm::token_bucket_decision(allowed, bucket.level, capacity, rate)
            }
            (Algorithm::LeakyBucket, KeyState::Bucket(bucket)) => {
                let allowed = algorithm::leaky_bucket_step(bucket, now_ms, capacity, rate);
                algorithm::leaky_bucket_decision(allowed, bucket.level, capacity, rate)
            }
            (algorithm, state) => unreachable!("{algorithm} limiter holding {state:?}"),
        }
    }
}

#[async_trait]
impl RateLimiter for LocalRateLimiter {
    async fn allow(&self, key: &str, limit: u64, period: Duration) -> Result<RateLimitDecision> {
        self.check(key, limit, period)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    const SECOND: Duration = Duration::from_secs(1);

    fn limiter(algorithm: Algorithm) -> (Arc<ManualClock>, LocalRateLimiter) {
        let clock = ManualClock::new(Duration::from_secs(1_700_000_000));
        let limiter = LocalRateLimiter::with_clock(algorithm, clock.clone());
        (clock, limiter)
    }

    #[tokio::test]
    async fn test_rate_limiter_creation() {
        let limiter = LocalRateLimiter::token_bucket();
        assert_eq!(limiter.len(), 0);
        assert_eq!(limiter.algorithm(), Algorithm::TokenBucket);
    }

    #[tokio::test]
    async fn test_allow_creates_state() {
        let (_, limiter) = limiter(Algorithm::FixedWindow);
        let decision = limiter.allow("key", 10, SECOND).await.unwrap();

        assert!(decision.allowed);
        assert_eq!(decision.remaining, 9);
        assert_eq!(limiter.len(), 1);
    }

    #[tokio::test]
    async fn test_limit_enforced_for_every_algorithm() {
        for algorithm in Algorithm::ALL {
            let (_, limiter) = limiter(algorithm);
            for i in 0..5 {
                let decision = limiter.allow("key", 5, SECOND).await.unwrap();
                assert!(decision.allowed, "{algorithm} request {i} should pass");
            }
            let decision = limiter.allow("key", 5, SECOND).await.unwrap();
            assert!(!decision.allowed, "{algorithm} should deny the 6th request");
            assert_eq!(decision.remaining, 0);
            assert!(decision.reset_after > Duration::ZERO);
        }
    }

    #[tokio::test]
    async fn test_different_keys_have_separate_state() {
        let (_, limiter) = limiter(Algorithm::TokenBucket);

        assert!(limiter.allow("a", 1, SECOND).await.unwrap().allowed);
        assert!(!limiter.allow("a", 1, SECOND).await.unwrap().allowed);
        assert!(limiter.allow("b", 1, SECOND).await.unwrap().allowed);
    }

    #[tokio::test]
    async fn test_token_bucket_never_exceeds_limit() {
        let (clock, limiter) = limiter(Algorithm::TokenBucket);
        limiter.allow("key", 3, SECOND).await.unwrap();
        clock.advance(Duration::from_secs(3600));
        limiter.allow("key", 3, SECOND).await.unwrap();

        match limiter.state("key") {
            Some(KeyState::Bucket(bucket)) => assert!(bucket.level <= 3.0),
            other => panic!("unexpected state {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_invalid_arguments_rejected() {
        let (_, limiter) = limiter(Algorithm::SlidingWindow);
        assert!(limiter.allow("key", 0, SECOND).await.is_err());
        assert!(limiter.allow("key", 1, Duration::ZERO).await.is_err());
        assert!(limiter.is_empty());
    }

    #[tokio::test]
    async fn test_reset_and_clear() {
        let (_, limiter) = limiter(Algorithm::FixedWindow);
        limiter.allow("a", 1, SECOND).await.unwrap();
        limiter.allow("b", 1, SECOND).await.unwrap();

        limiter.reset("a");
        assert!(limiter.state("a").is_none());
        assert!(limiter.allow("a", 1, SECOND).await.unwrap().allowed);

        limiter.clear();
        assert_eq!(limiter.len(), 0);
    }

    #[tokio::test]
    async fn test_evict_idle_keeps_recent_keys() {
        let (clock, limiter) = limiter(Algorithm::LeakyBucket);
        limiter.allow("old", 1, SECOND).await.unwrap();
        clock.advance(Duration::from_secs(30));
        limiter.allow("new", 1, SECOND).await.unwrap();

        assert_eq!(limiter.evict_idle(Duration::from_secs(10)), 1);
        assert!(limiter.state("old").is_none());
        assert!(limiter.state("new").is_some());
    }

    #[test]
    fn test_concurrent_calls_on_one_key_are_serialized() {
        let (_, limiter) = limiter(Algorithm::FixedWindow);
        let limiter = Arc::new(limiter);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let limiter = limiter.clone();
                std::thread::spawn(move || {
                    (0..100)
                        .filter(|_| limiter.check("hot", 500, SECOND).unwrap().allowed)
                        .count()
                })
            })
            .collect();

        let allowed: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(allowed, 500);
        match limiter.state("hot") {
            Some(KeyState::Window(counter)) => assert_eq!(counter.count, 800),
            other => panic!("unexpected state {other:?}"),
        }
    }
}
