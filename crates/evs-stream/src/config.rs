//! Configuration management

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::mux::MuxConfig;
use crate::stream::{StreamOptions, MAX_HIGH_WATER_MARK};

/// Top-level configuration: multiplexer settings plus the options applied to
/// locally created streams.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub mux: MuxConfig,
    pub stream: StreamOptions,
}

impl Config {
    /// Load configuration from an optional TOML file, then environment
    /// variables.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        // Start with defaults
        let mut config = match path {
            Some(path) => Self::from_toml_file(path)?,
            None => Self::default(),
        };

        config.apply_env()?;
        config.validate()?;

        Ok(config)
    }

    /// Load from TOML config file
    pub fn from_toml_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Override settings from `EVSTREAM_*` environment variables.
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        if let Ok(value) = std::env::var("EVSTREAM_FORCE_BASE64") {
            self.mux.force_base64 = parse_bool("EVSTREAM_FORCE_BASE64", &value)?;
        }

        if let Ok(value) = std::env::var("EVSTREAM_ALLOW_HALF_OPEN") {
            self.stream.allow_half_open = parse_bool("EVSTREAM_ALLOW_HALF_OPEN", &value)?;
        }

        if let Ok(value) = std::env::var("EVSTREAM_HIGH_WATER_MARK") {
            self.stream.high_water_mark = value.parse().map_err(|e| {
                ConfigError::Invalid(format!("Invalid EVSTREAM_HIGH_WATER_MARK: {}", e))
            })?;
        }

        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.stream.high_water_mark == 0 {
            return Err(ConfigError::Invalid(
                "high_water_mark must be > 0".to_string(),
            ));
        }

        if self.stream.high_water_mark > MAX_HIGH_WATER_MARK {
            return Err(ConfigError::Invalid(format!(
                "high_water_mark must be <= {}",
                MAX_HIGH_WATER_MARK
            )));
        }

        if self.mux.event.is_empty() {
            return Err(ConfigError::Invalid("event must not be empty".to_string()));
        }

        // Signal names are derived as `<event>-read` and so on.
        if self.mux.event.contains('-') {
            return Err(ConfigError::Invalid(format!(
                "event must not contain '-': {}",
                self.mux.event
            )));
        }

        Ok(())
    }
}

fn parse_bool(name: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(ConfigError::Invalid(format!("Invalid {}: {}", name, other))),
    }
}
