//! Configuration error types.

use thiserror::Error;
use validator::ValidationErrors;

/// Configuration error.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// File not found.
    #[error("Configuration file not found: {0}")]
    FileNotFound(String),

    /// Validation error.
    #[error("Configuration validation failed: {0}")]
    ValidationError(String),

    /// Environment variable error.
    #[error("Environment variable {name}: {message}")]
    EnvError {
        /// Variable name.
        name: String,
        /// What was wrong with its value.
        message: String,
    },

    /// IO error.
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// YAML parsing error.
    #[error("YAML parsing error: {0}")]
    YamlError(#[from] serde_yaml::Error),

    /// TOML parsing error.
    #[error("TOML parsing error: {0}")]
    TomlError(#[from] toml::de::Error),

    /// JSON parsing error.
    #[error("JSON parsing error: {0}")]
    JsonError(#[from] serde_json::Error),

    /// Invalid value.
    #[error("Invalid value for {field}: {message}")]
    InvalidValue {
        /// Offending field.
        field: String,
        /// Why it is invalid.
        message: String,
    },

    /// Unsupported format.
    #[error("Unsupported configuration format: {0}")]
    UnsupportedFormat(String),
}

impl From<ValidationErrors> for ConfigError {
    fn from(errors: ValidationErrors) -> Self {
        let messages: Vec<String> = errors
            .errors()
            .iter()
            .flat_map(|(field, kind)| flatten(field, kind))
            .collect();

        ConfigError::ValidationError(messages.join("; "))
    }
}

fn flatten(field: &str, kind: &validator::ValidationErrorsKind) -> Vec<String> {
    use validator::ValidationErrorsKind;

    match kind {
        ValidationErrorsKind::Field(errors) => {
            let error_msgs: Vec<String> = errors
                .iter()
                .map(|e| {
                    e.message
                        .as_ref()
                        .map(|m| m.to_string())
                        .unwrap_or_else(|| format!("validation failed for {}", e.code))
                })
                .collect();
            vec![format!("{}: {}", field, error_msgs.join(", "))]
        }
        ValidationErrorsKind::Struct(nested) => nested
            .errors()
            .iter()
            .flat_map(|(inner, kind)| flatten(&format!("{field}.{inner}"), kind))
            .collect(),
        ValidationErrorsKind::List(items) => items
            .iter()
            .flat_map(|(i, nested)| {
                nested
                    .errors()
                    .iter()
                    .flat_map(|(inner, kind)| flatten(&format!("{field}[{i}].{inner}"), kind))
                    .collect::<Vec<_>>()
            })
            .collect(),
    }
}

impl From<kvlore_core::Error> for ConfigError {
    fn from(err: kvlore_core::Error) -> Self {
        match err {
            kvlore_core::Error::Validation {
                message,
                field: Some(field),
            } => ConfigError::InvalidValue { field, message },
            other => ConfigError::ValidationError(other.to_string()),
        }
    }
}

impl ConfigError {
    /// Create an invalid value error.
    pub fn invalid_value(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidValue {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Create an environment variable error.
    pub fn env(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::EnvError {
            name: name.into(),
            message: message.into(),
        }
    }
}
