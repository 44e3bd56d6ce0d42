//! Virtual node placement shared by the local and distributed rings.

use std::collections::{BTreeSet, HashSet};

use ahash::RandomState;

// Fixed seeds keep placement identical in every process running the same
// build, which the distributed ring relies on.
const SEEDS: [u64; 4] = [
    0x243f_6a88_85a3_08d3,
    0x1319_8a2e_0370_7344,
    0xa409_3822_299f_31d0,
    0x082e_fa98_ec4e_6c89,
];

pub(crate) struct Topology {
    hasher: RandomState,
    virtual_nodes: usize,
    positions: Vec<(u64, String)>,
    hosts: BTreeSet<String>,
}

impl Topology {
    pub fn new(virtual_nodes: usize) -> Self {
        Self {
            hasher: RandomState::with_seeds(SEEDS[0], SEEDS[1], SEEDS[2], SEEDS[3]),
            virtual_nodes,
            positions: Vec::new(),
            hosts: BTreeSet::new(),
        }
    }

    pub fn hash(&self, key: &str) -> u64 {
        self.hasher.hash_one(key)
    }

    /// Place `virtual_nodes` positions for `host`. Returns false if it was
    /// already present.
    pub fn add(&mut self, host: &str) -> bool {
        if !self.hosts.insert(host.to_string()) {
            return false;
        }
        for i in 0..self.virtual_nodes {
            let position = self.hash(&format!("{host}-{i}"));
            self.positions.push((position, host.to_string()));
        }
        self.positions.sort_unstable();
        true
    }

    /// Drop every position of `host`. Returns false if it was absent.
    pub fn remove(&mut self, host: &str) -> bool {
        if !self.hosts.remove(host) {
            return false;
        }
        self.positions.retain(|(_, owner)| owner != host);
        true
    }

    pub fn contains(&self, host: &str) -> bool {
        self.hosts.contains(host)
    }

    pub fn hosts(&self) -> impl Iterator<Item = &String> {
        self.hosts.iter()
    }

    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }

    /// Owner of the first position at or after `key`'s hash, wrapping.
    pub fn owner(&self, key: &str) -> Option<&str> {
        let start = self.start(key)?;
        Some(self.positions[start].1.as_str())
    }

    /// Every host in ring order starting from `key`'s position, each once.
    /// The first entry is the canonical owner.
    pub fn candidates(&self, key: &str) -> Vec<&str> {
        let Some(start) = self.start(key) else {
            return Vec::new();
        };

        let mut seen = HashSet::with_capacity(self.hosts.len());
        let mut order = Vec::with_capacity(self.hosts.len());
        let (tail, head) = self.positions.split_at(start);
        for (_, host) in head.iter().chain(tail) {
            if seen.insert(host.as_str()) {
                order.push(host.as_str());
                if order.len() == self.hosts.len() {
                    break;
                }
            }
        }
        order
    }

    fn start(&self, key: &str) -> Option<usize> {
        if self.positions.is_empty() {
            return None;
        }
        let hash = self.hash(key);
        let index = self.positions.partition_point(|(position, _)| *position < hash);
        Some(index % self.positions.len())
    }
}
