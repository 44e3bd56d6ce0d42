//! Consistent hashing with bounded loads.
//!
//! Hosts are placed on a 64-bit ring at `virtual_nodes` positions each. A
//! key is served by the first host at or after its hash that is below
//! `max_load = ceil(average_load * load_factor)` in-flight requests; hosts at
//! the bound are skipped in ring order. When every host is at the bound the
//! key's canonical host takes the request anyway.
//!
//! `average_load` is the expected number of in-flight requests per host. It
//! is an input: the ring does not estimate it from traffic.

mod distributed;
mod hash_ring;
mod topology;

use serde::{Deserialize, Serialize};

pub use distributed::DistributedHashRing;
pub use hash_ring::HashRing;

use crate::error::{BulwarkError, Result};

/// Hash ring configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RingConfig {
    /// Ring positions per host
    #[serde(default = "default_virtual_nodes")]
    pub virtual_nodes: usize,

    /// Headroom over the average load a host may take
    #[serde(default = "default_load_factor")]
    pub load_factor: f64,

    /// Expected in-flight requests per host
    #[serde(default = "default_average_load")]
    pub average_load: f64,
}

impl Default for RingConfig {
    fn default() -> Self {
        Self {
            virtual_nodes: default_virtual_nodes(),
            load_factor: default_load_factor(),
            average_load: default_average_load(),
        }
    }
}

fn default_virtual_nodes() -> usize {
    100
}

fn default_load_factor() -> f64 {
    1.25
}

fn default_average_load() -> f64 {
    100.0
}

impl RingConfig {
    /// Default placement with the given per-host load baseline.
    pub fn with_average_load(average_load: f64) -> Self {
        Self {
            average_load,
            ..Self::default()
        }
    }

    /// Check ranges.
    pub fn validate(&self) -> Result<()> {
        if self.virtual_nodes == 0 {
            return Err(BulwarkError::InvalidArgument(
                "virtual_nodes must be greater than zero".to_string(),
            ));
        }
        if !self.load_factor.is_finite() || self.load_factor < 1.0 {
            return Err(BulwarkError::InvalidArgument(format!(
                "load_factor must be at least 1.0, got {}",
                self.load_factor
            )));
        }
        validate_average_load(self.average_load)
    }

    /// Per-host in-flight bound.
    pub fn max_load(&self) -> u64 {
        max_load(self.average_load, self.load_factor)
    }
}

fn validate_average_load(average_load: f64) -> Result<()> {
    if !average_load.is_finite() || average_load < 0.0 {
        return Err(BulwarkError::InvalidArgument(format!(
            "average_load must be a non-negative number, got {average_load}"
        )));
    }
    Ok(())
}

fn max_load(average_load: f64, load_factor: f64) -> u64 {
    ((average_load * load_factor).ceil() as u64).max(1)
}
