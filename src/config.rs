//! Application configuration for the host-override tool.
//!
//! This module handles loading, parsing and validating the YAML settings
//! file. Rules themselves live in a separate rule file owned by the
//! [`crate::bridge`]; this file only says where it is and how it is synced.

use crate::bridge::PersistMode;
use crate::error::{OverrideError, Result};
use crate::resolver::DEFAULT_EVENT_CAPACITY;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Paths searched, in order, when no configuration path is given.
pub const DEFAULT_CONFIG_PATHS: [&str; 3] = [
    "./host-override.yaml",
    "./host-override.yml",
    "/etc/host-override/config.yaml",
];

/// Log output format.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable pretty format.
    #[default]
    Pretty,
    /// Compact single-line format.
    Compact,
    /// JSON format for structured logging.
    Json,
}

/// Logging configuration section.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error.
    pub level: String,

    /// Output destination: stdout, stderr, or file path.
    pub output: String,

    /// Log format.
    pub format: LogFormat,

    /// Include timestamps in logs.
    pub timestamps: bool,

    /// Include target (module path) in logs.
    pub include_target: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            output: "stderr".to_string(),
            format: LogFormat::Pretty,
            timestamps: true,
            include_target: true,
        }
    }
}

/// Rule file section.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct RulesConfig {
    /// Rule file path. Without one the rule set lives in memory only.
    pub file: Option<PathBuf>,

    /// When mutations are written back to the rule file.
    pub persistence: PersistMode,

    /// Reload the rule file when it changes on disk.
    pub watch: bool,
}

impl RulesConfig {
    /// Whether a long-running command follows the rule file.
    /// `force` comes from the command line and wins over the file setting.
    pub fn should_watch(&self, force: bool) -> bool {
        force || self.watch
    }
}

/// Match-event section.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EventsConfig {
    /// Broadcast buffer per subscriber before it starts lagging.
    pub capacity: usize,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

/// Root configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct AppConfig {
    /// Logging configuration.
    pub logging: LoggingConfig,

    /// Rule file configuration.
    pub rules: RulesConfig,

    /// Match-event configuration.
    pub events: EventsConfig,
}

impl AppConfig {
    /// Loads configuration from a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(OverrideError::ConfigNotFound {
                path: path.display().to_string(),
            });
        }

        let contents = fs::read_to_string(path)?;
        let mut config: AppConfig = serde_yaml::from_str(&contents)
            .map_err(|e| OverrideError::config_parse(e.to_string()))?;

        // A relative rule file is relative to the config file.
        if let (Some(file), Some(dir)) = (config.rules.file.as_ref(), path.parent()) {
            if file.is_relative() && !dir.as_os_str().is_empty() {
                config.rules.file = Some(dir.join(file));
            }
        }

        config.validate()?;

        Ok(config)
    }

    /// Finds the first existing default configuration file.
    pub fn find_default() -> Option<PathBuf> {
        DEFAULT_CONFIG_PATHS
            .iter()
            .map(PathBuf::from)
            .find(|p| p.exists())
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            return Err(OverrideError::config_validation(format!(
                "Invalid log level: {}. Must be one of: {:?}",
                self.logging.level, valid_levels
            )));
        }

        if self.logging.output.trim().is_empty() {
            return Err(OverrideError::config_validation(
                "Logging output cannot be empty",
            ));
        }

        if self.events.capacity == 0 {
            return Err(OverrideError::config_validation(
                "Event capacity must be at least 1",
            ));
        }

        if self.rules.watch && self.rules.file.is_none() {
            return Err(OverrideError::config_validation(
                "rules.watch requires rules.file",
            ));
        }

        Ok(())
    }
}
