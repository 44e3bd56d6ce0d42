//! Rate limiting algorithms and limiters.
//!
//! [`LocalRateLimiter`] keeps per-key state in this process;
//! [`DistributedRateLimiter`] runs the same algorithms as atomic scripts
//! against a shared [`KeyStore`](crate::store::KeyStore). Both implement
//! [`RateLimiter`]. [`TokenBucket`] and [`LeakyBucket`] guard a single
//! resource, and [`KeyedLimiter`] hands out one of them per key.

mod algorithm;
mod backend;
mod bucket;
mod decision;
mod distributed;
mod keyed;
mod local;
mod scripts;

pub use algorithm::{Algorithm, BucketState, WindowCounter};
pub use backend::RateLimiter;
pub use bucket::{LeakyBucket, Limiter, TokenBucket};
pub use decision::RateLimitDecision;
pub use distributed::DistributedRateLimiter;
pub use keyed::{KeyedLimiter, KeyedLimiterConfig};
pub use local::{KeyState, LocalRateLimiter};
