//! Tracing setup and configuration.

use std::str::FromStr;

use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

use crate::MetricsError;

/// Tracing configuration.
#[derive(Debug, Clone)]
pub struct TracingConfig {
    /// Level or `EnvFilter` directive, used when `RUST_LOG` is unset.
    pub level: String,

    /// Log format.
    pub format: LogFormat,

    /// Emit span open/close events.
    pub span_events: bool,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
            span_events: false,
        }
    }
}

/// Log format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable format.
    Pretty,

    /// Compact format.
    Compact,

    /// JSON format.
    Json,
}

impl FromStr for LogFormat {
    type Err = MetricsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "compact" => Ok(Self::Compact),
            "pretty" => Ok(Self::Pretty),
            other => Err(MetricsError::TracingError(format!(
                "unknown log format '{other}'"
            ))),
        }
    }
}

/// Filter from `RUST_LOG`, falling back to `level`.
pub fn build_filter(level: &str) -> Result<EnvFilter, MetricsError> {
    match EnvFilter::try_from_default_env() {
        Ok(filter) => Ok(filter),
        Err(_) => EnvFilter::try_new(level)
            .map_err(|e| MetricsError::TracingError(format!("bad filter '{level}': {e}"))),
    }
}

/// Initialize tracing. Events go to stderr.
pub fn init_tracing(config: TracingConfig) -> Result<(), MetricsError> {
    let filter = build_filter(&config.level)?;

    let span_events = if config.span_events {
        FmtSpan::NEW | FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };

    let registry = tracing_subscriber::registry().with(filter);
    let result = match config.format {
        LogFormat::Json => registry
            .with(
                fmt::layer()
                    .json()
                    .with_span_events(span_events)
                    .with_writer(std::io::stderr)
                    .with_target(true)
                    .with_file(true)
                    .with_line_number(true),
            )
            .try_init(),
        LogFormat::Compact => registry
            .with(
                fmt::layer()
                    .compact()
                    .with_span_events(span_events)
                    .with_writer(std::io::stderr)
                    .with_target(true),
            )
            .try_init(),
        LogFormat::Pretty => registry
            .with(
                fmt::layer()
                    .pretty()
                    .with_span_events(span_events)
                    .with_writer(std::io::stderr)
                    .with_target(true),
            )
            .try_init(),
    };

    result.map_err(|e| MetricsError::TracingError(e.to_string()))
}

/// Initialize tracing from `KVLORE_LOG` and `KVLORE_LOG_FORMAT`.
pub fn init_tracing_from_env() -> Result<(), MetricsError> {
    let level = std::env::var("KVLORE_LOG").unwrap_or_else(|_| "info".to_string());
    let format = match std::env::var("KVLORE_LOG_FORMAT") {
        Ok(s) => s.parse()?,
        Err(_) => LogFormat::Pretty,
    };

    init_tracing(TracingConfig {
        level,
        format,
        span_events: false,
    })
}
