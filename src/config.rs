//! Configuration management for Bulwark.
//!
//! Every field has a default, so an empty document is a valid configuration.
//! [`BulwarkConfig::load`] layers `BULWARK__SECTION__FIELD` environment
//! variables over an optional file, e.g. `BULWARK__BREAKER__FAILURE_THRESHOLD=10`.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::breaker::BreakerConfig;
use crate::error::{BulwarkError, Result};
use crate::ratelimit::{Algorithm, KeyedLimiterConfig};
use crate::ring::RingConfig;

/// Prefix of environment variables read by [`BulwarkConfig::load`].
pub const ENV_PREFIX: &str = "BULWARK";

/// Main configuration for the Bulwark primitives.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BulwarkConfig {
    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limit: RateLimitSettings,

    /// Circuit breaker configuration
    #[serde(default)]
    pub breaker: BreakerConfig,

    /// Hash ring configuration
    #[serde(default)]
    pub ring: RingConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Rate limiting configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitSettings {
    /// Algorithm used by the local and distributed limiters
    #[serde(default = "default_algorithm")]
    pub algorithm: Algorithm,

    /// Prefix of distributed limiter keys
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Deadline for one store round trip, in milliseconds
    #[serde(default = "default_store_timeout_ms")]
    pub store_timeout_ms: Option<u64>,

    /// Per-key limiter registry
    #[serde(default)]
    pub keyed: KeyedSettings,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            algorithm: default_algorithm(),
            key_prefix: default_key_prefix(),
            store_timeout_ms: default_store_timeout_ms(),
            keyed: KeyedSettings::default(),
        }
    }
}

fn default_algorithm() -> Algorithm {
    Algorithm::TokenBucket
}

fn default_key_prefix() -> String {
    "bulwark".to_string()
}

fn default_store_timeout_ms() -> Option<u64> {
    Some(100)
}

impl RateLimitSettings {
    /// Store deadline, if any.
    pub fn store_timeout(&self) -> Option<Duration> {
        self.store_timeout_ms.map(Duration::from_millis)
    }
}

/// Eviction settings for per-key limiters. Unset means unbounded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyedSettings {
    /// Maximum number of keys held
    #[serde(default)]
    pub max_keys: Option<usize>,

    /// Idle time after which a key is evicted, in seconds
    #[serde(default)]
    pub idle_ttl_secs: Option<u64>,

    /// Interval of the background cleanup task, in seconds
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_secs: u64,
}

impl Default for KeyedSettings {
    fn default() -> Self {
        Self {
            max_keys: None,
            idle_ttl_secs: None,
            cleanup_interval_secs: default_cleanup_interval(),
        }
    }
}

fn default_cleanup_interval() -> u64 {
    60
}

impl KeyedSettings {
    /// Registry eviction policy.
    pub fn limiter_config(&self) -> KeyedLimiterConfig {
        KeyedLimiterConfig {
            max_keys: self.max_keys,
            idle_ttl: self.idle_ttl_secs.map(Duration::from_secs),
        }
    }

    /// Interval for [`KeyedLimiter::spawn_cleanup`](crate::ratelimit::KeyedLimiter::spawn_cleanup).
    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs.max(1))
    }
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive, overridden by `RUST_LOG`
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human-readable text
    #[serde(default)]
    pub json: bool,

    /// Include the event target
    #[serde(default)]
    pub with_target: bool,

    /// Include thread IDs
    #[serde(default = "default_with_thread_ids")]
    pub with_thread_ids: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
            with_target: false,
            with_thread_ids: default_with_thread_ids(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_with_thread_ids() -> bool {
    true
}

impl BulwarkConfig {
    /// Parse configuration from YAML.
    pub fn from_yaml(contents: &str) -> Result<Self> {
        let config: BulwarkConfig =
            serde_yaml::from_str(contents).map_err(|e| BulwarkError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from an optional file overlaid with environment
    /// variables.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let config: BulwarkConfig = builder
            .build()
            .and_then(|settings| settings.try_deserialize())
            .map_err(|e| BulwarkError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check every section.
    pub fn validate(&self) -> Result<()> {
        self.breaker
            .validate()
            .and_then(|_| self.ring.validate())
            .map_err(|e| BulwarkError::Config(e.to_string()))
    }
}

/// Serde helper storing a [`Duration`] as whole milliseconds.
pub(crate) mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
