//! Tracing subscriber setup
//!
//! `RUST_LOG` takes precedence over the configured level.

use anyhow::{anyhow, Context, Result};
use cloudmirror_core::config::LoggingConfig;
use tracing_subscriber::EnvFilter;

/// Install a global `fmt` subscriber for `config`.
///
/// Calling this again once a subscriber is installed is a no-op.
pub fn init_tracing(config: &LoggingConfig) -> Result<()> {
    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&config.level)
            .with_context(|| format!("Invalid log level '{}'", config.level))?,
    };

    let installed = match config.format.as_str() {
        "json" => tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .try_init(),
        "pretty" => tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .try_init(),
        other => return Err(anyhow!("Unknown log format '{other}'")),
    };

    if installed.is_err() {
        tracing::debug!("Tracing subscriber already installed");
    }
    Ok(())
}
