//! Configuration loading and management
//!
//! This module handles loading configuration from files and environment variables.

use std::path::Path;

use tracing::{debug, info};

use super::types::Config;
use crate::error::ConfigError;

/// Environment variable overriding the log level
pub const ENV_LOG_LEVEL: &str = "TUNBRIDGE_LOG_LEVEL";

/// Environment variable overriding the stats listen address
pub const ENV_STATS_ADDR: &str = "TUNBRIDGE_STATS_ADDR";

/// Environment variable overriding the timer interval
pub const ENV_TIMER_INTERVAL_MS: &str = "TUNBRIDGE_TIMER_INTERVAL_MS";

/// Load configuration from a JSON file
///
/// # Arguments
///
/// * `path` - Path to the configuration file
///
/// # Errors
///
/// Returns `ConfigError` if the file cannot be read or parsed.
pub fn load_config(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
    let path = path.as_ref();

    debug!("Loading configuration from {:?}", path);

    if !path.exists() {
        return Err(ConfigError::FileNotFound {
            path: path.display().to_string(),
        });
    }

    let contents = std::fs::read_to_string(path)?;

    let config: Config = serde_json::from_str(&contents).map_err(|e| {
        ConfigError::ParseError(format!("Failed to parse JSON: {e} at {path:?}"))
    })?;

    config.validate()?;

    info!(
        "Configuration loaded: timer={}ms, stats={}",
        config.stack.timer_interval_ms,
        if config.stats.enabled {
            config.stats.listen.to_string()
        } else {
            "disabled".into()
        }
    );

    Ok(config)
}

/// Load configuration from a JSON string
///
/// # Errors
///
/// Returns `ConfigError` if parsing or validation fails.
pub fn load_config_str(json: &str) -> Result<Config, ConfigError> {
    let config: Config =
        serde_json::from_str(json).map_err(|e| ConfigError::ParseError(e.to_string()))?;

    config.validate()?;

    Ok(config)
}

/// Load configuration with environment variable overrides
///
/// Environment variables:
/// - `TUNBRIDGE_LOG_LEVEL`: Override log level
/// - `TUNBRIDGE_STATS_ADDR`: Override stats listen address
/// - `TUNBRIDGE_TIMER_INTERVAL_MS`: Override timer tick interval
///
/// # Errors
///
/// Returns `ConfigError` if loading, parsing or an override fails.
pub fn load_config_with_env(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
    let mut config = load_config(path)?;
    apply_env_overrides(&mut config, |name| std::env::var(name).ok())?;
    Ok(config)
}

/// Apply overrides from a variable lookup, then re-validate
///
/// # Errors
///
/// Returns `ConfigError::EnvError` for values that do not parse.
pub fn apply_env_overrides<F>(config: &mut Config, lookup: F) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(level) = lookup(ENV_LOG_LEVEL) {
        config.log.level = level;
        debug!("Log level overridden to {}", config.log.level);
    }

    if let Some(addr) = lookup(ENV_STATS_ADDR) {
        config.stats.listen = addr.parse().map_err(|_| ConfigError::EnvError {
            name: ENV_STATS_ADDR.into(),
            reason: format!("Invalid socket address: {addr}"),
        })?;
        debug!("Stats address overridden to {}", config.stats.listen);
    }

    if let Some(ms) = lookup(ENV_TIMER_INTERVAL_MS) {
        config.stack.timer_interval_ms = ms.parse().map_err(|_| ConfigError::EnvError {
            name: ENV_TIMER_INTERVAL_MS.into(),
            reason: format!("Invalid number: {ms}"),
        })?;
        debug!(
            "Timer interval overridden to {}ms",
            config.stack.timer_interval_ms
        );
    }

    config.validate()
}

/// Create a default configuration file at the given path
///
/// # Errors
///
/// Returns `ConfigError` if the file cannot be written.
pub fn create_default_config(path: impl AsRef<Path>) -> Result<(), ConfigError> {
    let config = Config::default_config();
    let json = serde_json::to_string_pretty(&config)
        .map_err(|e| ConfigError::ParseError(format!("Failed to serialize config: {e}")))?;

    std::fs::write(path, json)?;
    Ok(())
}
