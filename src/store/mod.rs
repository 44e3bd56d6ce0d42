//! Shared counter store boundary.
//!
//! The distributed limiters and ring only need a narrow interface from the
//! backing store: plain `get/set/incr/delete` plus an atomic script primitive
//! for read-modify-write sequences. Any backend with transactions can
//! implement [`KeyStore`]; Lua-capable stores run [`AtomicScript::lua`],
//! in-process stores run [`AtomicScript::run`] under their own lock.

mod memory;
#[cfg(feature = "redis")]
mod redis;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

pub use memory::MemoryStore;
#[cfg(feature = "redis")]
pub use self::redis::RedisKeyStore;

/// Errors raised by a [`KeyStore`].
#[derive(Error, Debug)]
pub enum StoreError {
    /// The store did not answer within the configured deadline.
    #[error("store operation timed out")]
    Timeout,

    /// The store could not be reached.
    #[error("store connection error: {0}")]
    Connection(String),

    /// A script failed or returned an unexpected shape.
    #[error("script {script} failed: {message}")]
    Script {
        /// Script name
        script: &'static str,
        /// Failure detail
        message: String,
    },

    /// A stored value could not be interpreted.
    #[error("invalid value {value:?} at key {key}")]
    InvalidValue {
        /// Store key holding the value
        key: String,
        /// The raw value
        value: String,
    },

    /// Redis client errors
    #[cfg(feature = "redis")]
    #[error("redis error: {0}")]
    Redis(#[from] ::redis::RedisError),
}

/// Result type alias for store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// An atomic counter/value store shared between processes.
#[async_trait]
pub trait KeyStore: Send + Sync {
    /// Read a value.
    async fn get(&self, key: &str) -> StoreResult<Option<String>>;

    /// Write a value, optionally expiring after `ttl`.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()>;

    /// Atomically add `delta` to an integer value (missing counts as 0).
    async fn incr(&self, key: &str, delta: i64) -> StoreResult<i64>;

    /// Remove a value.
    async fn delete(&self, key: &str) -> StoreResult<()>;

    /// Run `script` as one indivisible read-modify-write sequence.
    async fn run_script(
        &self,
        script: &dyn AtomicScript,
        keys: &[String],
        args: &[String],
    ) -> StoreResult<Vec<String>>;
}

/// Store operations available inside an atomic script.
///
/// Implementations are only valid for the duration of one script run.
pub trait ScriptContext {
    /// Read a value.
    fn get(&mut self, key: &str) -> StoreResult<Option<String>>;
    /// Write a value with an optional expiry.
    fn set(&mut self, key: &str, value: String, ttl: Option<Duration>) -> StoreResult<()>;
    /// Add `delta` to an integer value, returning the new value.
    fn incr(&mut self, key: &str, delta: i64) -> StoreResult<i64>;
    /// Set the expiry of an existing value.
    fn expire(&mut self, key: &str, ttl: Duration) -> StoreResult<()>;
    /// Remove a value.
    fn delete(&mut self, key: &str) -> StoreResult<()>;
}

/// An indivisible read-modify-write sequence.
///
/// `lua` and `run` must implement the same logic over the same `KEYS`/`ARGV`
/// layout and return the same strings.
pub trait AtomicScript: Send + Sync {
    /// Stable script name used for caching and errors.
    fn name(&self) -> &'static str;

    /// Server-side source for Lua-capable stores.
    fn lua(&self) -> &'static str;

    /// The same sequence for stores that execute scripts in-process.
    fn run(
        &self,
        ctx: &mut dyn ScriptContext,
        keys: &[String],
        args: &[String],
    ) -> StoreResult<Vec<String>>;
}

/// Parse a numeric script argument.
pub(crate) fn parse_arg<T: std::str::FromStr>(
    script: &'static str,
    args: &[String],
    index: usize,
) -> StoreResult<T> {
    args.get(index)
        .and_then(|raw| raw.parse().ok())
        .ok_or_else(|| StoreError::Script {
            script,
            message: format!("missing or invalid ARGV[{}]", index + 1),
        })
}

/// Fetch a script key.
pub(crate) fn key_at<'a>(
    script: &'static str,
    keys: &'a [String],
    index: usize,
) -> StoreResult<&'a str> {
    keys.get(index)
        .map(String::as_str)
        .ok_or_else(|| StoreError::Script {
            script,
            message: format!("missing KEYS[{}]", index + 1),
        })
}

/// Parse an optional stored value.
pub(crate) fn parse_value<T: std::str::FromStr>(
    key: &str,
    raw: Option<String>,
) -> StoreResult<Option<T>> {
    match raw {
        None => Ok(None),
        Some(value) => value
            .parse()
            .map(Some)
            .map_err(|_| StoreError::InvalidValue {
                key: key.to_string(),
                value,
            }),
    }
}
