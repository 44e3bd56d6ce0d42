//! Distributed rate limiter backed by a shared [`KeyStore`].
//!
//! Every check is one atomic script round trip, so concurrent processes
//! sharing the store never race between reading and updating a key's state.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, trace, warn};

use super::algorithm::{self, Algorithm};
use super::backend::RateLimiter;
use super::decision::RateLimitDecision;
use super::scripts::{FixedWindowScript, LeakyBucketScript, SlidingWindowScript, TokenBucketScript};
use crate::clock::{self, Clock};
use crate::config::RateLimitSettings;
use crate::error::{BulwarkError, Result};
use crate::store::{AtomicScript, KeyStore, StoreError};

/// Default prefix for store keys.
const DEFAULT_PREFIX: &str = "bulwark";

/// A rate limiter whose state lives in a shared [`KeyStore`].
///
/// No local lock is held while waiting on the store. Dropping the returned
/// future abandons the call; the script either ran completely on the store or
/// not at all.
pub struct DistributedRateLimiter {
    store: Arc<dyn KeyStore>,
    algorithm: Algorithm,
    prefix: String,
    clock: Arc<dyn Clock>,
    timeout: Option<Duration>,
}

impl DistributedRateLimiter {
    /// Create a distributed limiter for `algorithm` over `store`.
    pub fn new(store: Arc<dyn KeyStore>, algorithm: Algorithm) -> Self {
        Self {
            store,
            algorithm,
            prefix: DEFAULT_PREFIX.to_string(),
            clock: clock::system(),
            timeout: None,
        }
    }

    /// Create a distributed limiter from configuration.
    pub fn from_settings(store: Arc<dyn KeyStore>, settings: &RateLimitSettings) -> Self {
        let mut limiter = Self::new(store, settings.algorithm).with_prefix(&settings.key_prefix);
        limiter.timeout = settings.store_timeout();
        limiter
    }

    /// Namespace store keys under `prefix`.
    pub fn with_prefix(mut self, prefix: &str) -> Self {
        self.prefix = prefix.to_string();
        self
    }

    /// Read time from `clock`.
    ///
    /// Every process sharing a store must agree on time; the store scripts
    /// take `now` from the caller.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Fail a check with [`StoreError::Timeout`] when the store takes longer
    /// than `timeout`.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// The algorithm this limiter runs.
    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    /// Count one operation for `key`.
    pub async fn check(&self, key: &str, limit: u64, period: Duration) -> Result<RateLimitDecision> {
        let period_ms = algorithm::validate(limit, period)?;
        let now_ms = self.clock.now_ms();
        let ttl_ms = algorithm::state_ttl(period_ms).as_millis() as u64;

        trace!(
            key = %key,
            algorithm = %self.algorithm,
            limit = limit,
            period_ms = period_ms,
            "Checking distributed rate limit"
        );

        let decision = match self.algorithm {
            Algorithm::FixedWindow => {
                let index = now_ms / period_ms;
                let keys = vec![self.window_key(key, index)];
                let args = vec![ttl_ms.to_string()];
                let out = self.run(key, &FixedWindowScript, keys, args).await?;
                let count: u64 = field(key, &FixedWindowScript, &out, 0)?;
                algorithm::fixed_window_decision(count, now_ms, limit, period_ms)
            }
            Algorithm::SlidingWindow => {
                let index = now_ms / period_ms;
                let keys = vec![
                    self.window_key(key, index),
                    self.window_key(key, index.saturating_sub(1)),
                ];
                let args = vec![
                    limit.to_string(),
                    period_ms.to_string(),
                    now_ms.to_string(),
                    ttl_ms.to_string(),
                ];
                let out = self.run(key, &SlidingWindowScript, keys, args).await?;
                let admitted: u8 = field(key, &SlidingWindowScript, &out, 0)?;
                let current: u64 = field(key, &SlidingWindowScript, &out, 1)?;
                let previous: u64 = field(key, &SlidingWindowScript, &out, 2)?;
                algorithm::sliding_window_decision(admitted == 1, current, previous, now_ms, limit, period_ms)
            }
            Algorithm::TokenBucket | Algorithm::LeakyBucket => {
                let capacity = limit as f64;
                let rate = algorithm::rate_per_sec(limit, period_ms);
                let keys = vec![self.bucket_key(key, "level"), self.bucket_key(key, "ts")];
                let args = vec![
                    limit.to_string(),
                    rate.to_string(),
                    now_ms.to_string(),
                    ttl_ms.to_string(),
                ];
                let script: &dyn AtomicScript = if self.algorithm == Algorithm::TokenBucket {
                    &TokenBucketScript
                } else {
                    &LeakyBucketScript
                };
                let out = self.run(key, script, keys, args).await?;
                let allowed: u8 = field(key, script, &out, 0)?;
                let level: f64 = field(key, script, &out, 1)?;
                if self.algorithm == Algorithm::TokenBucket {
                    algorithm::token_bucket_decision(allowed == 1, level, capacity, rate)
                } else {
                    algorithm::leaky_bucket_decision(allowed == 1, level, capacity, rate)
                }
            }
        };

        if !decision.allowed {
            debug!(
                key = %key,
                algorithm = %self.algorithm,
                limit = limit,
                "Distributed rate limit exceeded"
            );
        }
        Ok(decision)
    }

    async fn run(
        &self,
        key: &str,
        script: &dyn AtomicScript,
        keys: Vec<String>,
        args: Vec<String>,
    ) -> Result<Vec<String>> {
        let call = self.store.run_script(script, &keys, &args);
        let outcome = match self.timeout {
            Some(timeout) => tokio::time::timeout(timeout, call)
                .await
                .unwrap_or(Err(StoreError::Timeout)),
            None => call.await,
        };

        outcome.map_err(|source| {
            warn!(
                key = %key,
                script = script.name(),
                error = %source,
                "Rate limit store call failed"
            );
            BulwarkError::store(key, source)
        })
    }

    /// Window counters are keyed by `(key, windowIndex)`. The braces keep all
    /// keys of one logical key in the same cluster slot.
    fn window_key(&self, key: &str, index: u64) -> String {
        format!("{}:{}:{{{}}}:{}", self.prefix, self.algorithm.key_tag(), key, index)
    }

    fn bucket_key(&self, key: &str, field: &str) -> String {
        format!("{}:{}:{{{}}}:{}", self.prefix, self.algorithm.key_tag(), key, field)
    }
}

#[async_trait]
impl RateLimiter for DistributedRateLimiter {
    async fn allow(&self, key: &str, limit: u64, period: Duration) -> Result<RateLimitDecision> {
        self.check(key, limit, period).await
    }
}

fn field<T: std::str::FromStr>(
    key: &str,
    script: &dyn AtomicScript,
    out: &[String],
    index: usize,
) -> Result<T> {
    out.get(index)
        .and_then(|raw| raw.parse().ok())
        .ok_or_else(|| {
            BulwarkError::store(
                key,
                StoreError::Script {
                    script: script.name(),
                    message: format!("unexpected reply {out:?}"),
                },
            )
        })
}
