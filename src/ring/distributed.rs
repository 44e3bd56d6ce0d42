//! Bounded-load hash ring over a shared [`KeyStore`].
//!
//! Placement is computed locally; only the per-host load counters live in
//! the store.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tracing::{debug, info, warn};

use super::topology::Topology;
use super::{max_load, validate_average_load, RingConfig};
use crate::error::{BulwarkError, Result};
use crate::store::{parse_arg, parse_value, AtomicScript, KeyStore, ScriptContext, StoreError, StoreResult};

const DEFAULT_PREFIX: &str = "bulwark";

/// `KEYS` load counters of the candidate hosts in ring order; `ARGV[1]`
/// max load. Returns `{index, load, saturated}` for the chosen host.
struct BoundedPickScript;

impl AtomicScript for BoundedPickScript {
    fn name(&self) -> &'static str {
        "bulwark_ring_pick"
    }

    fn lua(&self) -> &'static str {
        r#"
        local max_load = tonumber(ARGV[1])
        for i, key in ipairs(KEYS) do
            local load = tonumber(redis.call("GET", key)) or 0
            if load < max_load then
                load = redis.call("INCR", key)
                return {tostring(i - 1), tostring(load), "0"}
            end
        end
        local load = redis.call("INCR", KEYS[1])
        return {"0", tostring(load), "1"}
        "#
    }

    fn run(
        &self,
        ctx: &mut dyn ScriptContext,
        keys: &[String],
        args: &[String],
    ) -> StoreResult<Vec<String>> {
        let max_load: i64 = parse_arg(self.name(), args, 0)?;
        if keys.is_empty() {
            return Err(StoreError::Script {
                script: self.name(),
                message: "no candidate hosts".to_string(),
            });
        }

        for (index, key) in keys.iter().enumerate() {
            let load = parse_value::<i64>(key, ctx.get(key)?)?.unwrap_or(0);
            if load < max_load {
                let load = ctx.incr(key, 1)?;
                return Ok(vec![index.to_string(), load.to_string(), "0".to_string()]);
            }
        }
        let load = ctx.incr(&keys[0], 1)?;
        Ok(vec!["0".to_string(), load.to_string(), "1".to_string()])
    }
}

/// `KEYS[1]` load counter. Decrements unless already zero.
/// Returns `{released, load}`.
struct ReleaseScript;

impl AtomicScript for ReleaseScript {
    fn name(&self) -> &'static str {
        "bulwark_ring_release"
    }

    fn lua(&self) -> &'static str {
        r#"
        local load = tonumber(redis.call("GET", KEYS[1])) or 0
        if load <= 0 then
            return {"0", "0"}
        end
        load = redis.call("DECR", KEYS[1])
        return {"1", tostring(load)}
        "#
    }

    fn run(
        &self,
        ctx: &mut dyn ScriptContext,
        keys: &[String],
        _args: &[String],
    ) -> StoreResult<Vec<String>> {
        let key = crate::store::key_at(self.name(), keys, 0)?;
        let load = parse_value::<i64>(key, ctx.get(key)?)?.unwrap_or(0);
        if load <= 0 {
            return Ok(vec!["0".to_string(), "0".to_string()]);
        }
        let load = ctx.incr(key, -1)?;
        Ok(vec!["1".to_string(), load.to_string()])
    }
}

struct Shape {
    topology: Topology,
    average_load: f64,
}

/// Hash ring whose load counters live in a shared [`KeyStore`].
///
/// Every process holding the same hosts computes the same placement; the
/// bounded pick runs as one atomic script over the candidates' counters, so
/// the bound holds across processes.
pub struct DistributedHashRing {
    store: Arc<dyn KeyStore>,
    name: String,
    prefix: String,
    load_factor: f64,
    timeout: Option<Duration>,
    shape: RwLock<Shape>,
}

impl DistributedHashRing {
    /// Create an empty ring named `name` over `store`.
    pub fn new(store: Arc<dyn KeyStore>, name: &str, config: RingConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            store,
            name: name.to_string(),
            prefix: DEFAULT_PREFIX.to_string(),
            load_factor: config.load_factor,
            timeout: None,
            shape: RwLock::new(Shape {
                topology: Topology::new(config.virtual_nodes),
                average_load: config.average_load,
            }),
        })
    }

    /// Namespace store keys under `prefix`.
    pub fn with_prefix(mut self, prefix: &str) -> Self {
        self.prefix = prefix.to_string();
        self
    }

    /// Fail store calls with [`StoreError::Timeout`] when the store takes
    /// longer than `timeout`.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Add `host` to this process's view of the ring.
    pub fn add(&self, host: &str) -> bool {
        let mut shape = self.shape.write();
        let added = shape.topology.add(host);
        if added {
            info!(ring = %self.name, host = %host, hosts = shape.topology.len(), "Host added to ring");
        }
        added
    }

    /// Remove `host` from this process's view of the ring. Its shared load
    /// counter is left for other processes still routing to it.
    pub fn remove(&self, host: &str) -> bool {
        let mut shape = self.shape.write();
        let removed = shape.topology.remove(host);
        if removed {
            info!(ring = %self.name, host = %host, hosts = shape.topology.len(), "Host removed from ring");
        }
        removed
    }

    /// Pick a host for `key` and count one request against it.
    pub async fn get(&self, key: &str) -> Result<String> {
        let (hosts, max_load) = {
            let shape = self.shape.read();
            let hosts: Vec<String> = shape
                .topology
                .candidates(key)
                .into_iter()
                .map(str::to_string)
                .collect();
            (hosts, max_load(shape.average_load, self.load_factor))
        };
        if hosts.is_empty() {
            return Err(BulwarkError::NoHosts);
        }

        let keys: Vec<String> = hosts.iter().map(|host| self.load_key(host)).collect();
        let args = vec![max_load.to_string()];
        let out = self
            .call(key, self.store.run_script(&BoundedPickScript, &keys, &args))
            .await?;

        let index: usize = reply(key, &BoundedPickScript, &out, 0)?;
        let saturated: u8 = reply(key, &BoundedPickScript, &out, 2)?;
        let host = hosts.into_iter().nth(index).ok_or_else(|| {
            BulwarkError::store(
                key,
                StoreError::Script {
                    script: BoundedPickScript.name(),
                    message: format!("candidate index {index} out of range"),
                },
            )
        })?;

        if saturated == 1 {
            warn!(
                ring = %self.name,
                key = %key,
                host = %host,
                max_load = max_load,
                "Every host at max load, failing open to canonical host"
            );
        }
        Ok(host)
    }

    /// The canonical host for `key`, without counting load.
    pub fn locate(&self, key: &str) -> Result<String> {
        self.shape
            .read()
            .topology
            .owner(key)
            .map(str::to_string)
            .ok_or(BulwarkError::NoHosts)
    }

    /// Mark one request on `host` as complete.
    ///
    /// Fails with [`BulwarkError::ReleaseUnderflow`] when the shared counter
    /// is already zero.
    pub async fn release(&self, host: &str) -> Result<()> {
        let keys = vec![self.load_key(host)];
        let out = self
            .call(host, self.store.run_script(&ReleaseScript, &keys, &[]))
            .await?;

        let released: u8 = reply(host, &ReleaseScript, &out, 0)?;
        if released == 0 {
            return Err(BulwarkError::ReleaseUnderflow {
                host: host.to_string(),
            });
        }
        Ok(())
    }

    /// Outstanding requests on `host` across all processes.
    pub async fn load(&self, host: &str) -> Result<u64> {
        let key = self.load_key(host);
        let raw = self.call(host, self.store.get(&key)).await?;
        let load = parse_value::<i64>(&key, raw).map_err(|source| BulwarkError::store(host, source))?;
        Ok(load.unwrap_or(0).max(0) as u64)
    }

    /// Zero the shared counters of every host on this ring.
    pub async fn reset_loads(&self) -> Result<()> {
        for host in self.hosts() {
            let key = self.load_key(&host);
            self.call(&host, self.store.delete(&key)).await?;
        }
        debug!(ring = %self.name, "Ring loads reset");
        Ok(())
    }

    /// Hosts on the ring, sorted.
    pub fn hosts(&self) -> Vec<String> {
        self.shape.read().topology.hosts().cloned().collect()
    }

    /// Number of hosts.
    pub fn len(&self) -> usize {
        self.shape.read().topology.len()
    }

    /// Whether the ring has no hosts.
    pub fn is_empty(&self) -> bool {
        self.shape.read().topology.is_empty()
    }

    /// Current per-host bound.
    pub fn max_load(&self) -> u64 {
        max_load(self.shape.read().average_load, self.load_factor)
    }

    /// Change the per-host load baseline.
    pub fn set_average_load(&self, average_load: f64) -> Result<()> {
        validate_average_load(average_load)?;
        self.shape.write().average_load = average_load;
        Ok(())
    }

    async fn call<T>(&self, key: &str, call: impl Future<Output = StoreResult<T>>) -> Result<T> {
        let outcome = match self.timeout {
            Some(timeout) => tokio::time::timeout(timeout, call)
                .await
                .unwrap_or(Err(StoreError::Timeout)),
            None => call.await,
        };

        outcome.map_err(|source| {
            warn!(ring = %self.name, key = %key, error = %source, "Ring store call failed");
            BulwarkError::store(key, source)
        })
    }

    fn load_key(&self, host: &str) -> String {
        format!("{}:ring:{{{}}}:{}", self.prefix, self.name, host)
    }
}

fn reply<T: std::str::FromStr>(
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use async_trait::async_trait;

    /// A store that never answers.
    struct HangingStore;

    #[async_trait]
    impl KeyStore for HangingStore {
        async fn get(&self, _key: &str) -> StoreResult<Option<String>> {
            std::future::pending().await
        }

        async fn set(&self, _key: &str, _value: &str, _ttl: Option<Duration>) -> StoreResult<()> {
            std::future::pending().await
        }

        async fn incr(&self, _key: &str, _delta: i64) -> StoreResult<i64> {
            std::future::pending().await
        }

        async fn delete(&self, _key: &str) -> StoreResult<()> {
            std::future::pending().await
        }

        async fn run_script(
            &self,
            _script: &dyn AtomicScript,
            _keys: &[String],
            _args: &[String],
        ) -> StoreResult<Vec<String>> {
            std::future::pending().await
        }
    }

    fn ring(store: &Arc<MemoryStore>, average_load: f64) -> DistributedHashRing {
        let ring =
            DistributedHashRing::new(store.clone(), "api", RingConfig::with_average_load(average_load)).unwrap();
        for host in ["a", "b", "c"] {
            ring.add(host);
        }
        ring
    }

    #[tokio::test]
    async fn test_empty_ring_has_no_hosts() {
        let store = Arc::new(MemoryStore::new());
        let ring = DistributedHashRing::new(store, "api", RingConfig::default()).unwrap();
        assert!(matches!(ring.get("k").await, Err(BulwarkError::NoHosts)));
    }

    #[tokio::test]
    async fn test_bound_holds_across_processes() {
        // two processes sharing one store, max_load = 2
        let store = Arc::new(MemoryStore::new());
        let first = ring(&store, 1.0);
        let second = ring(&store, 1.0);

        let owner = first.locate("hot").unwrap();
        assert_eq!(second.locate("hot").unwrap(), owner);

        assert_eq!(first.get("hot").await.unwrap(), owner);
        assert_eq!(second.get("hot").await.unwrap(), owner);
        let spilled = first.get("hot").await.unwrap();
        assert_ne!(spilled, owner);
        assert_eq!(second.load(&owner).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_fails_open_when_saturated() {
        let store = Arc::new(MemoryStore::new());
        let ring = ring(&store, 0.5);
        for _ in 0..3 {
            ring.get("k").await.unwrap();
        }
        let owner = ring.locate("k").unwrap();
        assert_eq!(ring.get("k").await.unwrap(), owner);
        assert_eq!(ring.load(&owner).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_release_refuses_to_underflow() {
        let store = Arc::new(MemoryStore::new());
        let ring = ring(&store, 10.0);
        let host = ring.get("k").await.unwrap();

        ring.release(&host).await.unwrap();
        assert_eq!(ring.load(&host).await.unwrap(), 0);
        assert!(matches!(
            ring.release(&host).await,
            Err(BulwarkError::ReleaseUnderflow { .. })
        ));
    }

    #[tokio::test]
    async fn test_reset_loads_and_key_layout() {
        let store = Arc::new(MemoryStore::new());
        let ring = ring(&store, 10.0).with_prefix("lb");
        let host = ring.get("k").await.unwrap();
        assert!(store.get(&format!("lb:ring:{{api}}:{host}")).await.unwrap().is_some());

        ring.reset_loads().await.unwrap();
        assert_eq!(ring.load(&host).await.unwrap(), 0);
        assert!(store.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_store_times_out() {
        let ring = DistributedHashRing::new(Arc::new(HangingStore), "api", RingConfig::default())
            .unwrap()
            .with_timeout(Duration::from_millis(50));
        ring.add("a");

        for result in [
            ring.get("k").await.map(|_| ()),
            ring.release("a").await,
            ring.load("a").await.map(|_| ()),
            ring.reset_loads().await,
        ] {
            assert!(matches!(
                result,
                Err(BulwarkError::Store {
                    source: StoreError::Timeout,
                    ..
                })
            ));
        }
    }
}
