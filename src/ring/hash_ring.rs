//! In-process bounded-load hash ring.

use std::collections::HashMap;

use parking_lot::Mutex;
use tracing::{debug, info, trace, warn};

use super::topology::Topology;
use super::{max_load, validate_average_load, RingConfig};
use crate::error::{BulwarkError, Result};

struct Inner {
    topology: Topology,
    loads: HashMap<String, u64>,
    average_load: f64,
}

/// In-process consistent hash ring with bounded loads.
///
/// Topology changes and load accounting share one lock, so a pick never sees
/// a half-updated ring. Callers must [`release`](Self::release) every host
/// returned by [`get`](Self::get) once the request completes.
pub struct HashRing {
    load_factor: f64,
    inner: Mutex<Inner>,
}

impl HashRing {
    /// Create an empty ring.
    pub fn new(config: RingConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            load_factor: config.load_factor,
            inner: Mutex::new(Inner {
                topology: Topology::new(config.virtual_nodes),
                loads: HashMap::new(),
                average_load: config.average_load,
            }),
        })
    }

    /// Add `host` with zero load. Adding a present host changes nothing.
    pub fn add(&self, host: &str) -> bool {
        let mut inner = self.inner.lock();
        if !inner.topology.add(host) {
            return false;
        }
        inner.loads.insert(host.to_string(), 0);
        info!(host = %host, hosts = inner.topology.len(), "Host added to ring");
        true
    }

    /// Remove `host` and its load counter.
    pub fn remove(&self, host: &str) -> bool {
        let mut inner = self.inner.lock();
        if !inner.topology.remove(host) {
            return false;
        }
        inner.loads.remove(host);
        info!(host = %host, hosts = inner.topology.len(), "Host removed from ring");
        true
    }

    /// Pick a host for `key` and count one request against it.
    pub fn get(&self, key: &str) -> Result<String> {
        let mut inner = self.inner.lock();
        let max_load = max_load(inner.average_load, self.load_factor);

        let picked = {
            let candidates = inner.topology.candidates(key);
            let canonical = *candidates.first().ok_or(BulwarkError::NoHosts)?;
            let below_bound = candidates
                .iter()
                .position(|host| inner.loads.get(*host).copied().unwrap_or(0) < max_load);

            match below_bound {
                Some(skipped) => {
                    if skipped > 0 {
                        trace!(key = %key, canonical = %canonical, skipped = skipped, "Spilled over loaded hosts");
                    }
                    candidates[skipped].to_string()
                }
                None => {
                    warn!(
                        key = %key,
                        host = %canonical,
                        max_load = max_load,
                        "Every host at max load, failing open to canonical host"
                    );
                    canonical.to_string()
                }
            }
        };

        *inner.loads.entry(picked.clone()).or_insert(0) += 1;
        Ok(picked)
    }

    /// The canonical host for `key`, without counting load.
    pub fn locate(&self, key: &str) -> Result<String> {
        let inner = self.inner.lock();
        inner
            .topology
            .owner(key)
            .map(str::to_string)
            .ok_or(BulwarkError::NoHosts)
    }

    /// Mark one request on `host` as complete.
    ///
    /// # Panics
    ///
    /// If `host` has no outstanding load. Releases for hosts removed since
    /// the pick are ignored.
    pub fn release(&self, host: &str) {
        let mut inner = self.inner.lock();
        match inner.loads.get_mut(host) {
            Some(load) => {
                assert!(*load > 0, "released host {host} with no outstanding load");
                *load -= 1;
            }
            None => debug!(host = %host, "Release for host no longer on the ring"),
        }
    }

    /// Zero every load counter.
    pub fn reset_loads(&self) {
        let mut inner = self.inner.lock();
        inner.loads.values_mut().for_each(|load| *load = 0);
        debug!("Ring loads reset");
    }

    /// Outstanding requests on `host`.
    pub fn load(&self, host: &str) -> Option<u64> {
        self.inner.lock().loads.get(host).copied()
    }

    /// Hosts on the ring, sorted.
    pub fn hosts(&self) -> Vec<String> {
        self.inner.lock().topology.hosts().cloned().collect()
    }

    /// Whether `host` is on the ring.
    pub fn contains(&self, host: &str) -> bool {
        self.inner.lock().topology.contains(host)
    }

    /// Number of hosts.
    pub fn len(&self) -> usize {
        self.inner.lock().topology.len()
    }

    /// Whether the ring has no hosts.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().topology.is_empty()
    }

    /// Current per-host bound.
    pub fn max_load(&self) -> u64 {
        max_load(self.inner.lock().average_load, self.load_factor)
    }

    /// Change the per-host load baseline.
    pub fn set_average_load(&self, average_load: f64) -> Result<()> {
        validate_average_load(average_load)?;
        self.inner.lock().average_load = average_load;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ring(average_load: f64, hosts: &[&str]) -> HashRing {
        let ring = HashRing::new(RingConfig::with_average_load(average_load)).unwrap();
        for host in hosts {
            ring.add(host);
        }
        ring
    }

    #[test]
    fn test_empty_ring_has_no_hosts() {
        let ring = ring(1.0, &[]);
        assert!(matches!(ring.get("k"), Err(BulwarkError::NoHosts)));
        assert!(matches!(ring.locate("k"), Err(BulwarkError::NoHosts)));
    }

    #[test]
    fn test_get_is_deterministic_below_capacity() {
        let ring = ring(1_000.0, &["a", "b", "c"]);
        for i in 0..50 {
            let key = format!("key-{i}");
            let first = ring.get(&key).unwrap();
            ring.release(&first);
            assert_eq!(ring.get(&key).unwrap(), first);
            assert_eq!(ring.locate(&key).unwrap(), first);
            ring.release(&first);
        }
    }

    #[test]
    fn test_spills_over_when_owner_is_full() {
        // max_load = ceil(1 * 1.25) = 2
        let ring = ring(1.0, &["a", "b", "c"]);
        let owner = ring.locate("hot").unwrap();

        assert_eq!(ring.get("hot").unwrap(), owner);
        assert_eq!(ring.get("hot").unwrap(), owner);
        let spilled = ring.get("hot").unwrap();
        assert_ne!(spilled, owner);
        assert_eq!(ring.load(&owner), Some(2));
        assert_eq!(ring.load(&spilled), Some(1));
    }

    #[test]
    fn test_fails_open_when_every_host_is_full() {
        let ring = ring(0.5, &["a", "b"]);
        assert_eq!(ring.max_load(), 1);
        ring.get("x").unwrap();
        ring.get("x").unwrap();

        let owner = ring.locate("x").unwrap();
        assert_eq!(ring.get("x").unwrap(), owner);
        assert_eq!(ring.load(&owner), Some(2));
    }

    #[test]
    fn test_loads_never_exceed_bound_below_saturation() {
        let ring = ring(4.0, &["a", "b", "c", "d"]);
        let max_load = ring.max_load();
        // 4 hosts * 5 slots = 20 requests fit without failing open
        for i in 0..20 {
            ring.get(&format!("key-{}", i % 3)).unwrap();
        }
        for host in ring.hosts() {
            assert!(ring.load(&host).unwrap() <= max_load);
        }
    }

    #[test]
    fn test_release_and_reset() {
        let ring = ring(10.0, &["a"]);
        ring.get("k").unwrap();
        ring.get("k").unwrap();
        ring.release("a");
        assert_eq!(ring.load("a"), Some(1));

        ring.reset_loads();
        assert_eq!(ring.load("a"), Some(0));

        // removed hosts ignore late releases
        ring.remove("a");
        ring.release("a");
    }

    #[test]
    #[should_panic(expected = "no outstanding load")]
    fn test_release_underflow_panics() {
        let ring = ring(10.0, &["a"]);
        ring.release("a");
    }

    #[test]
    fn test_set_average_load() {
        let ring = ring(1.0, &["a"]);
        assert_eq!(ring.max_load(), 2);
        ring.set_average_load(8.0).unwrap();
        assert_eq!(ring.max_load(), 10);
        assert!(ring.set_average_load(f64::NAN).is_err());
    }

    #[test]
    fn test_adding_a_host_moves_few_keys() {
        let ring = ring(1_000.0, &["a", "b", "c", "d", "e", "f", "g", "h", "i"]);
        let keys: Vec<String> = (0..2_000).map(|i| format!("key-{i}")).collect();
        let before: Vec<String> = keys.iter().map(|k| ring.locate(k).unwrap()).collect();

        ring.add("j");
        let moved = keys
            .iter()
            .zip(&before)
            .filter(|(key, owner)| ring.locate(key).unwrap() != **owner)
            .count();

        // about 1/10 of keys should move to the new host
        assert!(moved > 0);
        assert!(moved < keys.len() / 5, "moved {moved} keys");
    }
}
