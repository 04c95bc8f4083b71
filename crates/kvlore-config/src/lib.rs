//! kvlore configuration management.
//!
//! This crate loads the settings of an actor session from YAML, TOML or JSON
//! files, applies `KVLORE_*` environment overrides and validates the result.
//!
//! # Example
//!
//! ```rust,ignore
//! use kvlore_config::ConfigLoader;
//!
//! let config = ConfigLoader::new()
//!     .with_file("kvlore.yaml")
//!     .with_env_prefix("KVLORE")
//!     .load()?;
//!
//! println!("Lane size: {}", config.session.cache.lane_ctx);
//! ```

#![warn(missing_docs)]

pub mod error;
pub mod loader;
pub mod validation;

pub use error::ConfigError;
pub use loader::{load_default_config, ConfigBuilder, ConfigFormat, ConfigLoader};

use kvlore_core::SessionConfig;
use serde::{Deserialize, Serialize};
use validator::Validate;

/// Main configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
pub struct Config {
    /// Session settings: pool, cache, lanes and the actor directory.
    #[serde(flatten)]
    #[validate(custom(function = "validation::validate_session"))]
    pub session: SessionConfig,

    /// Logging configuration.
    #[validate(nested)]
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Metrics configuration.
    #[validate(nested)]
    #[serde(default)]
    pub metrics: MetricsConfig,
}

impl Config {
    /// Load a configuration file.
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        ConfigLoader::new().with_file(path).load()
    }

    /// Defaults with environment overrides.
    pub fn from_env() -> Result<Self, ConfigError> {
        ConfigLoader::new().with_env_prefix("KVLORE").load()
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        <Self as Validate>::validate(self).map_err(ConfigError::from)
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct LoggingConfig {
    /// Log level or `EnvFilter` directive.
    #[serde(default = "default_log_level")]
    #[validate(length(min = 1, message = "log level cannot be empty"))]
    pub level: String,

    /// Log format (json, pretty, compact).
    #[serde(default = "default_log_format")]
    #[validate(custom(function = "validation::validate_log_format"))]
    pub format: String,

    /// Include span enter/exit events.
    #[serde(default)]
    pub spans: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            spans: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_true() -> bool {
    true
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct MetricsConfig {
    /// Enable metrics collection.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Prefix of every metric name.
    #[serde(default = "default_namespace")]
    #[validate(length(min = 1, message = "metrics namespace cannot be empty"))]
    pub namespace: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            namespace: default_namespace(),
        }
    }
}

fn default_namespace() -> String {
    "kvlore".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn test_session_errors_surface_with_field() {
        let mut config = Config::default();
        config.session.lanes.max_lanes = 1;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("max_lanes"), "{err}");
    }

    #[test]
    fn test_bad_log_format_rejected() {
        let mut config = Config::default();
        config.logging.format = "xml".into();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("logging.format"), "{err}");
    }
}
