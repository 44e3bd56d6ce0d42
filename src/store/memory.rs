//! In-process [`KeyStore`] with millisecond expiry.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::trace;

use super::{AtomicScript, KeyStore, ScriptContext, StoreError, StoreResult};
use crate::clock::{self, Clock};

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at_ms: Option<u64>,
}

impl Entry {
    fn is_live(&self, now_ms: u64) -> bool {
        self.expires_at_ms.map_or(true, |at| now_ms < at)
    }
}

/// A [`KeyStore`] held in process memory.
///
/// Scripts run while the store lock is held, so every script is atomic with
/// respect to all other operations on the store. Expired values are dropped
/// lazily when touched and by [`MemoryStore::purge_expired`].
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Entry>>,
    clock: Arc<dyn Clock>,
}

impl MemoryStore {
    /// Create an empty store on the system clock.
    pub fn new() -> Self {
        Self::with_clock(clock::system())
    }

    /// Create an empty store that expires values using `clock`.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            clock,
        }
    }

    /// Number of live values.
    pub fn len(&self) -> usize {
        let now_ms = self.clock.now_ms();
        self.entries
            .lock()
            .values()
            .filter(|e| e.is_live(now_ms))
            .count()
    }

    /// Whether the store holds no live values.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remaining time to live of a value, if it has one.
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let now_ms = self.clock.now_ms();
        let entries = self.entries.lock();
        let entry = entries.get(key).filter(|e| e.is_live(now_ms))?;
        entry
            .expires_at_ms
            .map(|at| Duration::from_millis(at.saturating_sub(now_ms)))
    }

    /// Drop every expired value, returning how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now_ms = self.clock.now_ms();
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, e| e.is_live(now_ms));
        before - entries.len()
    }

    fn with_tx<T>(&self, f: impl FnOnce(&mut MemoryTx<'_>) -> StoreResult<T>) -> StoreResult<T> {
        let now_ms = self.clock.now_ms();
        let mut entries = self.entries.lock();
        let mut tx = MemoryTx {
            entries: &mut *entries,
            now_ms,
        };
        f(&mut tx)
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Store view handed to scripts and single operations.
struct MemoryTx<'a> {
    entries: &'a mut HashMap<String, Entry>,
    now_ms: u64,
}

impl MemoryTx<'_> {
    fn live(&mut self, key: &str) -> Option<&mut Entry> {
        let now_ms = self.now_ms;
        if self.entries.get(key).is_some_and(|e| !e.is_live(now_ms)) {
            self.entries.remove(key);
        }
        self.entries.get_mut(key)
    }

    fn expiry(&self, ttl: Option<Duration>) -> Option<u64> {
        ttl.map(|ttl| self.now_ms.saturating_add(u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX)))
    }
}

impl ScriptContext for MemoryTx<'_> {
    fn get(&mut self, key: &str) -> StoreResult<Option<String>> {
        Ok(self.live(key).map(|e| e.value.clone()))
    }

    fn set(&mut self, key: &str, value: String, ttl: Option<Duration>) -> StoreResult<()> {
        let expires_at_ms = self.expiry(ttl);
        self.entries.insert(
            key.to_string(),
            Entry {
                value,
                expires_at_ms,
            },
        );
        Ok(())
    }

    fn incr(&mut self, key: &str, delta: i64) -> StoreResult<i64> {
        match self.live(key) {
            Some(entry) => {
                let current: i64 =
                    entry
                        .value
                        .parse()
                        .map_err(|_| StoreError::InvalidValue {
                            key: key.to_string(),
                            value: entry.value.clone(),
                        })?;
                let next = current + delta;
                entry.value = next.to_string();
                Ok(next)
            }
            None => {
                self.entries.insert(
                    key.to_string(),
                    Entry {
                        value: delta.to_string(),
                        expires_at_ms: None,
                    },
                );
                Ok(delta)
            }
        }
    }

    fn expire(&mut self, key: &str, ttl: Duration) -> StoreResult<()> {
        let expires_at_ms = self.expiry(Some(ttl));
        if let Some(entry) = self.live(key) {
            entry.expires_at_ms = expires_at_ms;
        }
        Ok(())
    }

    fn delete(&mut self, key: &str) -> StoreResult<()> {
        self.entries.remove(key);
        Ok(())
    }
}

#[async_trait]
impl KeyStore for MemoryStore {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        self.with_tx(|tx| tx.get(key))
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()> {
        self.with_tx(|tx| tx.set(key, value.to_string(), ttl))
    }

    async fn incr(&self, key: &str, delta: i64) -> StoreResult<i64> {
        self.with_tx(|tx| tx.incr(key, delta))
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        self.with_tx(|tx| tx.delete(key))
    }

    async fn run_script(
        &self,
        script: &dyn AtomicScript,
        keys: &[String],
        args: &[String],
    ) -> StoreResult<Vec<String>> {
        trace!(script = script.name(), keys = ?keys, "Running script in memory store");
        self.with_tx(|tx| script.run(tx, keys, args))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use tokio_test::assert_ok;

    fn store() -> (Arc<ManualClock>, MemoryStore) {
        let clock = ManualClock::new(Duration::from_secs(1_000));
        let store = MemoryStore::with_clock(clock.clone());
        (clock, store)
    }

    struct SwapScript;

    impl AtomicScript for SwapScript {
        fn name(&self) -> &'static str {
            "swap"
        }

        fn lua(&self) -> &'static str {
            "local a = redis.call('GET', KEYS[1]) redis.call('SET', KEYS[1], ARGV[1]) return {a}"
        }

        fn run(
            &self,
            ctx: &mut dyn ScriptContext,
            keys: &[String],
            args: &[String],
        ) -> StoreResult<Vec<String>> {
            let old = ctx.get(&keys[0])?.unwrap_or_default();
            ctx.set(&keys[0], args[0].clone(), None)?;
            Ok(vec![old])
        }
    }

    #[tokio::test]
    async fn test_incr_starts_from_zero() {
        let (_, store) = store();
        assert_eq!(store.incr("a", 1).await.unwrap(), 1);
        assert_eq!(store.incr("a", 4).await.unwrap(), 5);
        assert_eq!(store.incr("a", -2).await.unwrap(), 3);
        assert_eq!(store.get("a").await.unwrap().as_deref(), Some("3"));
    }

    #[tokio::test]
    async fn test_set_with_ttl_expires() {
        let (clock, store) = store();
        assert_ok!(store.set("k", "v", Some(Duration::from_millis(500))).await);
        assert_eq!(store.ttl("k"), Some(Duration::from_millis(500)));

        clock.advance(Duration::from_millis(499));
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("v"));

        clock.advance(Duration::from_millis(1));
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_incr_on_non_integer_fails() {
        let (_, store) = store();
        store.set("k", "abc", None).await.unwrap();
        let err = store.incr("k", 1).await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidValue { .. }));
    }

    #[tokio::test]
    async fn test_delete_and_purge() {
        let (clock, store) = store();
        store.set("a", "1", None).await.unwrap();
        store.set("b", "1", Some(Duration::from_millis(10))).await.unwrap();
        assert_eq!(store.len(), 2);

        store.delete("a").await.unwrap();
        clock.advance(Duration::from_millis(10));
        assert_eq!(store.purge_expired(), 1);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_run_script_is_applied() {
        let (_, store) = store();
        store.set("k", "first", None).await.unwrap();

        let out = store
            .run_script(&SwapScript, &["k".to_string()], &["second".to_string()])
            .await
            .unwrap();

        assert_eq!(out, vec!["first".to_string()]);
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("second"));
    }
}
