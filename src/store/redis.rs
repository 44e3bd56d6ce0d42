//! Redis-backed [`KeyStore`].

use std::time::Duration;

use ::redis::aio::ConnectionManager;
use ::redis::{AsyncCommands, Client, ErrorKind, RedisError, Script};
use async_trait::async_trait;
use dashmap::DashMap;
use tracing::{debug, trace};

use super::{AtomicScript, KeyStore, StoreError, StoreResult};

/// A [`KeyStore`] over a Redis connection manager.
///
/// Scripts are sent as Lua through `EVALSHA`, falling back to `EVAL` when the
/// server has not cached them yet.
#[derive(Clone)]
pub struct RedisKeyStore {
    connection_manager: ConnectionManager,
    scripts: DashMap<&'static str, Script>,
}

impl RedisKeyStore {
    /// Wrap an existing connection manager.
    pub fn new(connection_manager: ConnectionManager) -> Self {
        Self {
            connection_manager,
            scripts: DashMap::new(),
        }
    }

    /// Connect to `url` (e.g. `redis://127.0.0.1:6379`).
    pub async fn connect(url: &str) -> StoreResult<Self> {
        let client = Client::open(url)?;
        let connection_manager = client
            .get_connection_manager()
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;
        debug!(url = %url, "Connected to Redis key store");
        Ok(Self::new(connection_manager))
    }

    fn script(&self, script: &dyn AtomicScript) -> Script {
        self.scripts
            .entry(script.name())
            .or_insert_with(|| Script::new(script.lua()))
            .clone()
    }
}

#[async_trait]
impl KeyStore for RedisKeyStore {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let mut conn = self.connection_manager.clone();
        Ok(conn.get(key).await?)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()> {
        let mut conn = self.connection_manager.clone();
        match ttl {
            Some(ttl) => {
                let ms = (ttl.as_millis() as u64).max(1);
                conn.pset_ex::<_, _, ()>(key, value, ms).await?;
            }
            None => conn.set::<_, _, ()>(key, value).await?,
        }
        Ok(())
    }

    async fn incr(&self, key: &str, delta: i64) -> StoreResult<i64> {
        let mut conn = self.connection_manager.clone();
        Ok(conn.incr(key, delta).await?)
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        let mut conn = self.connection_manager.clone();
        conn.del::<_, ()>(key).await?;
        Ok(())
    }

    async fn run_script(
        &self,
        script: &dyn AtomicScript,
        keys: &[String],
        args: &[String],
    ) -> StoreResult<Vec<String>> {
        trace!(script = script.name(), keys = ?keys, "Running script in Redis");

        let compiled = self.script(script);
        let mut invocation = compiled.prepare_invoke();
        for key in keys {
            invocation.key(key);
        }
        for arg in args {
            invocation.arg(arg);
        }

        let mut conn = self.connection_manager.clone();
        invocation
            .invoke_async(&mut conn)
            .await
            .map_err(|e| script_error(script.name(), e))
    }
}

/// Server-side script failures and reply shape errors are script errors;
/// everything else is a transport failure.
fn script_error(script: &'static str, error: RedisError) -> StoreError {
    match error.kind() {
        ErrorKind::ResponseError
        | ErrorKind::ExtensionError
        | ErrorKind::TypeError
        | ErrorKind::NoScriptError => StoreError::Script {
            script,
            message: error.to_string(),
        },
        _ => StoreError::Redis(error),
    }
}
