//! Bulwark - Traffic Shaping and Fault Isolation Primitives
//!
//! This crate provides the building blocks services use to protect
//! themselves and their dependencies:
//!
//! - [`ratelimit`]: fixed window, sliding window, token bucket and leaky
//!   bucket limiters, each in-process or as atomic scripts against a shared
//!   [`store::KeyStore`], plus standalone buckets and a per-key registry.
//! - [`breaker`]: a closed/open/half-open circuit breaker.
//! - [`ring`]: consistent hashing with bounded loads.

pub mod breaker;
pub mod clock;
pub mod config;
pub mod error;
pub mod ratelimit;
pub mod ring;
pub mod store;
pub mod telemetry;

pub use breaker::{BreakerConfig, BreakerError, CircuitBreaker, CircuitState};
pub use config::BulwarkConfig;
pub use error::{BulwarkError, Result};
pub use ratelimit::{
    Algorithm, DistributedRateLimiter, KeyedLimiter, LocalRateLimiter, RateLimitDecision, RateLimiter,
};
pub use ring::{DistributedHashRing, HashRing, RingConfig};
