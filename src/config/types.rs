//! Configuration types for tunbridge
//!
//! This module defines the configuration structures for the adapter layer.
//! Every section has defaults, so an empty JSON object is a valid config.

use std::net::SocketAddr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Root configuration structure
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    /// Stack lifecycle and timer settings
    #[serde(default)]
    pub stack: StackConfig,

    /// Stream connection limits
    #[serde(default)]
    pub tcp: TcpConfig,

    /// Datagram flow settings
    #[serde(default)]
    pub udp: UdpConfig,

    /// Session statistics and the plain-text endpoint
    #[serde(default)]
    pub stats: StatsConfig,

    /// Logging configuration
    #[serde(default)]
    pub log: LogConfig,
}

impl Config {
    /// Validate the configuration
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` if validation fails.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.stack.validate()?;
        self.tcp.validate()?;
        self.udp.validate()?;
        self.stats.validate()?;
        self.log.validate()?;
        Ok(())
    }

    /// Create the default configuration
    #[must_use]
    pub fn default_config() -> Self {
        Self::default()
    }
}

/// Stack lifecycle configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StackConfig {
    /// Engine timer tick interval in milliseconds
    #[serde(default = "default_timer_interval_ms")]
    pub timer_interval_ms: u64,

    /// Per-connection poll interval, in timer ticks
    #[serde(default = "default_poll_interval_ticks")]
    pub poll_interval_ticks: u8,
}

impl StackConfig {
    /// Validate stack configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.timer_interval_ms == 0 {
            return Err(ConfigError::ValidationError(
                "timer_interval_ms must be greater than 0".into(),
            ));
        }

        if self.poll_interval_ticks == 0 {
            return Err(ConfigError::ValidationError(
                "poll_interval_ticks must be greater than 0".into(),
            ));
        }

        Ok(())
    }

    /// Timer tick interval as Duration
    #[must_use]
    pub const fn timer_interval(&self) -> Duration {
        Duration::from_millis(self.timer_interval_ms)
    }
}

impl Default for StackConfig {
    fn default() -> Self {
        Self {
            timer_interval_ms: default_timer_interval_ms(),
            poll_interval_ticks: default_poll_interval_ticks(),
        }
    }
}

/// Stream connection configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TcpConfig {
    /// Maximum bytes queued by `write` before it reports a full buffer
    #[serde(default = "default_max_pending_write")]
    pub max_pending_write: usize,

    /// Bytes acknowledged to the engine before the reader must drain
    #[serde(default = "default_recv_buffer")]
    pub recv_buffer: usize,

    /// Consecutive polls without output progress before aborting
    #[serde(default = "default_max_stalled_polls")]
    pub max_stalled_polls: u32,

    /// Read deadline in milliseconds (0 disables)
    #[serde(default)]
    pub read_timeout_ms: u64,
}

impl TcpConfig {
    /// Validate stream configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_pending_write == 0 {
            return Err(ConfigError::ValidationError(
                "max_pending_write must be greater than 0".into(),
            ));
        }

        if self.recv_buffer == 0 {
            return Err(ConfigError::ValidationError(
                "recv_buffer must be greater than 0".into(),
            ));
        }

        if self.max_stalled_polls == 0 {
            return Err(ConfigError::ValidationError(
                "max_stalled_polls must be greater than 0".into(),
            ));
        }

        Ok(())
    }

    /// Read deadline, if one is configured
    #[must_use]
    pub const fn read_timeout(&self) -> Option<Duration> {
        if self.read_timeout_ms == 0 {
            None
        } else {
            Some(Duration::from_millis(self.read_timeout_ms))
        }
    }
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            max_pending_write: default_max_pending_write(),
            recv_buffer: default_recv_buffer(),
            max_stalled_polls: default_max_stalled_polls(),
            read_timeout_ms: 0,
        }
    }
}

/// Datagram flow configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UdpConfig {
    /// Idle time after which a flow is reclaimed, in seconds
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,

    /// Interval between idle sweeps, in seconds
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

impl UdpConfig {
    /// Validate datagram configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.idle_timeout_secs == 0 {
            return Err(ConfigError::ValidationError(
                "idle_timeout_secs must be greater than 0".into(),
            ));
        }

        if self.sweep_interval_secs == 0 {
            return Err(ConfigError::ValidationError(
                "sweep_interval_secs must be greater than 0".into(),
            ));
        }

        Ok(())
    }

    /// Idle timeout as Duration
    #[must_use]
    pub const fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    /// Sweep interval as Duration
    #[must_use]
    pub const fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

impl Default for UdpConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: default_idle_timeout_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

/// Session statistics configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StatsConfig {
    /// Serve the plain-text report over HTTP
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Listen address of the report endpoint
    #[serde(default = "default_stats_listen")]
    pub listen: SocketAddr,

    /// Request path of the plain-text report
    #[serde(default = "default_stats_path")]
    pub path: String,

    /// Completed sessions kept in history
    #[serde(default = "default_max_completed")]
    pub max_completed: usize,
}

impl StatsConfig {
    /// Validate stats configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.path.starts_with('/') {
            return Err(ConfigError::ValidationError(format!(
                "stats path must start with '/': {}",
                self.path
            )));
        }

        if self
            .path
            .chars()
            .any(|c| matches!(c, '{' | '}' | '*' | ':' | '?' | '#') || c.is_whitespace())
        {
            return Err(ConfigError::ValidationError(format!(
                "stats path must be a literal path: {}",
                self.path
            )));
        }

        if self.max_completed == 0 {
            return Err(ConfigError::ValidationError(
                "max_completed must be greater than 0".into(),
            ));
        }

        Ok(())
    }
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            listen: default_stats_listen(),
            path: default_stats_path(),
            max_completed: default_max_completed(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format: "json" or "text"
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Include target (module path)
    #[serde(default = "default_true")]
    pub target: bool,
}

impl LogConfig {
    /// Validate logging configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self.format.as_str() {
            "json" | "text" => Ok(()),
            other => Err(ConfigError::ValidationError(format!(
                "Unknown log format: {other}"
            ))),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            target: true,
        }
    }
}

// Default value functions

const fn default_true() -> bool {
    true
}

const fn default_timer_interval_ms() -> u64 {
    250
}

const fn default_poll_interval_ticks() -> u8 {
    2
}

const fn default_max_pending_write() -> usize {
    64 * 1024
}

const fn default_recv_buffer() -> usize {
    64 * 1024
}

const fn default_max_stalled_polls() -> u32 {
    120
}

const fn default_idle_timeout_secs() -> u64 {
    60
}

const fn default_sweep_interval_secs() -> u64 {
    10
}

fn default_stats_listen() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 6001))
}

fn default_stats_path() -> String {
    "/stats/session/plain".into()
}

const fn default_max_completed() -> usize {
    50
}

fn default_log_level() -> String {
    "info".into()
}

fn default_log_format() -> String {
    "text".into()
}
