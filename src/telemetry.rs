//! Tracing subscriber setup for services embedding Bulwark.

use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;
use crate::error::{BulwarkError, Result};

/// Install a global `fmt` subscriber.
///
/// `RUST_LOG` takes precedence over `config.level`. Fails if a global
/// subscriber is already installed.
pub fn init_tracing(config: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .map_err(|e| BulwarkError::Config(format!("invalid log level {:?}: {e}", config.level)))?;

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(config.with_target)
        .with_thread_ids(config.with_thread_ids);

    let installed = if config.json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    installed.map_err(|e| BulwarkError::Config(format!("failed to install tracing subscriber: {e}")))
}
