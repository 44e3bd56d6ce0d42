//! Error types for Bulwark primitives.

use thiserror::Error;

use crate::store::StoreError;

/// Main error type for Bulwark operations.
///
/// A rate limit denial is not an error: it is reported through
/// [`RateLimitDecision`](crate::ratelimit::RateLimitDecision). Errors here
/// are store failures, bad arguments and configuration problems.
#[derive(Error, Debug)]
pub enum BulwarkError {
    /// The shared counter store failed while serving a key.
    #[error("store error for key {key}: {source}")]
    Store {
        /// Logical key being served when the store failed
        key: String,
        /// Underlying store failure
        #[source]
        source: StoreError,
    },

    /// An argument was outside its valid range.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The hash ring has no hosts.
    #[error("hash ring has no hosts")]
    NoHosts,

    /// A distributed ring release found no outstanding load for the host.
    #[error("released host {host} with no outstanding load")]
    ReleaseUnderflow {
        /// Host whose counter was already zero
        host: String,
    },

    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl BulwarkError {
    pub(crate) fn store(key: impl Into<String>, source: StoreError) -> Self {
        BulwarkError::Store {
            key: key.into(),
            source,
        }
    }
}

/// Result type alias for Bulwark operations.
pub type Result<T> = std::result::Result<T, BulwarkError>;
