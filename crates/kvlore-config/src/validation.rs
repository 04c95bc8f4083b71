//! Configuration validation.

use std::borrow::Cow;

use kvlore_core::SessionConfig;
use validator::ValidationError;

use crate::error::ConfigError;
use crate::Config;

/// Accepted log formats.
pub const LOG_FORMATS: [&str; 3] = ["pretty", "compact", "json"];

/// Validate the session part of a configuration.
pub fn validate_session(session: &SessionConfig) -> Result<(), ValidationError> {
    session.validate().map_err(|e| {
        let mut error = ValidationError::new("session");
        if let kvlore_core::Error::Validation {
            field: Some(field), ..
        } = &e
        {
            error.add_param(Cow::Borrowed("field"), field);
        }
        error.message = Some(Cow::Owned(e.to_string()));
        error
    })
}

/// Validate a log format name.
pub fn validate_log_format(format: &str) -> Result<(), ValidationError> {
    if LOG_FORMATS.contains(&format) {
        Ok(())
    } else {
        let mut error = ValidationError::new("log_format");
        error.message = Some(Cow::Owned(format!(
            "must be one of: {}",
            LOG_FORMATS.join(", ")
        )));
        Err(error)
    }
}

/// Checks that need the filesystem.
pub fn validate_environment(config: &Config) -> Result<(), ConfigError> {
    if let Some(dir) = &config.session.actors_dir {
        if !dir.is_dir() {
            return Err(ConfigError::invalid_value(
                "actors_dir",
                format!("{} is not a directory", dir.display()),
            ));
        }
    }
    Ok(())
}

/// Rough host memory needed by the configured lanes, in bytes.
pub fn lane_cache_bytes(config: &Config) -> usize {
    let cache = &config.session.cache;
    let per_token = cache.n_layer * (cache.k_row_bytes() + cache.v_row_bytes());
    per_token * cache.lane_ctx * config.session.lanes.max_lanes
}
