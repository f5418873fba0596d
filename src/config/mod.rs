//! Configuration module for tunbridge
//!
//! This module provides configuration types and loading utilities.
//!
//! # Example
//!
//! ```no_run
//! use tunbridge::config::{load_config, Config};
//!
//! let config = load_config("/etc/tunbridge/config.json").unwrap();
//! println!("Timer interval: {}ms", config.stack.timer_interval_ms);
//! ```

mod loader;
mod types;

pub use loader::{
    apply_env_overrides, create_default_config, load_config, load_config_str,
    load_config_with_env, ENV_LOG_LEVEL, ENV_STATS_ADDR, ENV_TIMER_INTERVAL_MS,
};
pub use types::{Config, LogConfig, StackConfig, StatsConfig, TcpConfig, UdpConfig};
