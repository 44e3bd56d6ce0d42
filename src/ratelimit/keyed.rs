//! Per-key registry of standalone limiters.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use super::algorithm;
use super::bucket::{LeakyBucket, Limiter, TokenBucket};
use super::decision::RateLimitDecision;
use crate::clock::{self, Clock};
use crate::error::Result;

/// Eviction policy for a [`KeyedLimiter`].
///
/// The default keeps every key forever, which is only safe for bounded key
/// spaces.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KeyedLimiterConfig {
    /// Evict the least recently used key before inserting past this size.
    pub max_keys: Option<usize>,
    /// Keys unused for this long are removed by
    /// [`evict_idle`](KeyedLimiter::evict_idle).
    pub idle_ttl: Option<Duration>,
}

struct Entry<L> {
    limiter: Arc<L>,
    last_seen_ms: AtomicU64,
}

/// Lazily creates one limiter per key, giving each key its own quota.
pub struct KeyedLimiter<L> {
    constructor: Box<dyn Fn() -> L + Send + Sync>,
    config: KeyedLimiterConfig,
    clock: Arc<dyn Clock>,
    entries: DashMap<String, Entry<L>, ahash::RandomState>,
}

impl<L: Limiter> KeyedLimiter<L> {
    /// Build limiters with `constructor`, never evicting.
    pub fn new<F>(constructor: F) -> Self
    where
        F: Fn() -> L + Send + Sync + 'static,
    {
        Self::with_config(constructor, KeyedLimiterConfig::default())
    }

    /// Build limiters with `constructor` under an eviction policy.
    pub fn with_config<F>(constructor: F, config: KeyedLimiterConfig) -> Self
    where
        F: Fn() -> L + Send + Sync + 'static,
    {
        Self {
            constructor: Box::new(constructor),
            config,
            clock: clock::system(),
            entries: DashMap::with_hasher(ahash::RandomState::new()),
        }
    }

    /// Track key recency with `clock`.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Take one unit from `key`'s limiter.
    pub fn allow(&self, key: &str) -> bool {
        self.limiter(key).allow()
    }

    /// Take one unit from `key`'s limiter and report the outcome.
    pub fn check(&self, key: &str) -> RateLimitDecision {
        self.limiter(key).check()
    }

    /// Take one unit from `key`'s limiter, sleeping until one is available.
    pub async fn wait(&self, key: &str) {
        let limiter = self.limiter(key);
        limiter.wait().await
    }

    /// The limiter for `key`, created on first use.
    pub fn limiter(&self, key: &str) -> Arc<L> {
        let now_ms = self.clock.now_ms();

        if let Some(entry) = self.entries.get(key) {
            entry.last_seen_ms.store(now_ms, Ordering::Relaxed);
            return entry.limiter.clone();
        }

        if let Some(max_keys) = self.config.max_keys {
            while self.entries.len() >= max_keys.max(1) && self.evict_lru() {}
        }

        let entry = self.entries.entry(key.to_string()).or_insert_with(|| {
            debug!(key = %key, "Creating keyed limiter");
            Entry {
                limiter: Arc::new((self.constructor)()),
                last_seen_ms: AtomicU64::new(now_ms),
            }
        });
        entry.last_seen_ms.store(now_ms, Ordering::Relaxed);
        entry.limiter.clone()
    }

    /// Forget `key`'s limiter.
    pub fn remove(&self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }

    /// Whether `key` has a limiter.
    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Number of keys with a limiter.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no key has a limiter.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Remove keys unused for the configured idle TTL. Returns the number
    /// removed; without an idle TTL nothing is removed.
    pub fn evict_idle(&self) -> usize {
        let Some(idle_ttl) = self.config.idle_ttl else {
            return 0;
        };
        let now_ms = self.clock.now_ms();
        let idle_ms = idle_ttl.as_millis() as u64;

        let before = self.entries.len();
        self.entries.retain(|_, entry| {
            now_ms.saturating_sub(entry.last_seen_ms.load(Ordering::Relaxed)) < idle_ms
        });
        let evicted = before.saturating_sub(self.entries.len());
        if evicted > 0 {
            debug!(evicted = evicted, remaining = self.entries.len(), "Evicted idle keyed limiters");
        }
        evicted
    }

    fn evict_lru(&self) -> bool {
        let oldest = self
            .entries
            .iter()
            .min_by_key(|entry| entry.value().last_seen_ms.load(Ordering::Relaxed))
            .map(|entry| entry.key().clone());

        match oldest {
            Some(key) => {
                trace!(key = %key, "Evicting least recently used keyed limiter");
                self.entries.remove(&key).is_some()
            }
            None => false,
        }
    }
}

impl<L: Limiter + 'static> KeyedLimiter<L> {
    /// Run [`evict_idle`](Self::evict_idle) every `interval` on the tokio
    /// runtime. The task stops once the registry is dropped.
    pub fn spawn_cleanup(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let registry: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match registry.upgrade() {
                    Some(registry) => {
                        registry.evict_idle();
                    }
                    None => break,
                }
            }
        })
    }
}

impl KeyedLimiter<TokenBucket> {
    /// One token bucket of `capacity` refilled at `refill_per_sec` per key.
    pub fn token_buckets(capacity: u64, refill_per_sec: f64, config: KeyedLimiterConfig) -> Result<Self> {
        algorithm::validate_bucket(capacity, refill_per_sec)?;
        let clock = clock::system();
        Ok(Self::with_config(
            move || TokenBucket::unchecked(capacity, refill_per_sec, clock.clone()),
            config,
        ))
    }
}

impl KeyedLimiter<LeakyBucket> {
    /// One leaky bucket of `capacity` drained at `leak_per_sec` per key.
    pub fn leaky_buckets(capacity: u64, leak_per_sec: f64, config: KeyedLimiterConfig) -> Result<Self> {
        algorithm::validate_bucket(capacity, leak_per_sec)?;
        let clock = clock::system();
        Ok(Self::with_config(
            move || LeakyBucket::unchecked(capacity, leak_per_sec, clock.clone()),
            config,
        ))
    }
}
