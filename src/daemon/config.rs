//! Daemon configuration
//!
//! Wraps the node manager configuration with daemon-level settings
//! (run-loop intervals, logging) and handles loading and saving of
//! TOML/JSON/YAML configuration files.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::config::WifiConfig;
use crate::{Result, WifiError};

/// Full daemon configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// General daemon settings
    pub general: GeneralConfig,
    /// Node manager configuration
    pub wifi: WifiConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

/// General daemon settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Daemon name
    pub name: String,
    /// Daemon version
    pub version: String,
    /// Per-channel scan dwell time in milliseconds
    pub dwell_time_ms: u64,
    /// Node ageing pass interval in seconds
    pub age_interval_secs: u64,
    /// Statistics logging interval in seconds
    pub stats_interval_secs: u64,
    /// Log statistics periodically
    pub enable_stats: bool,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            name: "wifi-noded".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            dwell_time_ms: 200,
            age_interval_secs: 60,
            stats_interval_secs: 60,
            enable_stats: true,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    /// Log to the console
    pub console: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            console: true,
        }
    }
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            general: GeneralConfig::default(),
            wifi: WifiConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl DaemonConfig {
    /// Load a configuration file; the format is picked by extension.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .map_err(|e| WifiError::Config(format!("Failed to read config file: {}", e)))?;

        let config: DaemonConfig = match path.extension().and_then(|s| s.to_str()) {
            Some("json") => serde_json::from_str(&content)
                .map_err(|e| WifiError::Config(format!("Failed to parse JSON config: {}", e)))?,
            Some("toml") => toml::from_str(&content)
                .map_err(|e| WifiError::Config(format!("Failed to parse TOML config: {}", e)))?,
            Some("yaml") | Some("yml") => serde_yaml::from_str(&content)
                .map_err(|e| WifiError::Config(format!("Failed to parse YAML config: {}", e)))?,
            _ => {
                return Err(WifiError::Config(
                    "Unsupported config file format".to_string(),
                ))
            }
        };
        config.validate()?;
        Ok(config)
    }

    /// Save to a configuration file, format picked by extension.
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let content = match path.extension().and_then(|s| s.to_str()) {
            Some("json") => serde_json::to_string_pretty(self)
                .map_err(|e| WifiError::Config(format!("Failed to serialize config: {}", e)))?,
            Some("toml") => toml::to_string_pretty(self)
                .map_err(|e| WifiError::Config(format!("Failed to serialize config: {}", e)))?,
            Some("yaml") | Some("yml") => serde_yaml::to_string(self)
                .map_err(|e| WifiError::Config(format!("Failed to serialize config: {}", e)))?,
            _ => {
                return Err(WifiError::Config(
                    "Unsupported config file format".to_string(),
                ))
            }
        };
        fs::write(path, content)
            .map_err(|e| WifiError::Config(format!("Failed to write config file: {}", e)))?;
        Ok(())
    }

    /// Validate daemon and node manager settings together.
    pub fn validate(&self) -> Result<()> {
        if self.general.dwell_time_ms == 0 {
            return Err(WifiError::Config("dwell time cannot be 0".to_string()));
        }
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            return Err(WifiError::Config(format!(
                "Invalid log level '{}', must be one of: {}",
                self.logging.level,
                valid_levels.join(", ")
            )));
        }
        self.wifi.validate()
    }
}
