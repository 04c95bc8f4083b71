//! kvlore metrics and observability.
//!
//! - `tracing` subscriber setup (pretty, compact or JSON output)
//! - Prometheus gauges for memory pool and lane state
//! - Counters for lane remaps and the tokens they moved or rewrote
//!
//! # Example
//!
//! ```rust,ignore
//! use kvlore_metrics::{init_metrics, metrics, MetricsConfig};
//!
//! init_metrics(MetricsConfig::default())?;
//! metrics()?.observe_pool(&session.pool_stats());
//! println!("{}", kvlore_metrics::export_prometheus()?);
//! ```

pub mod collector;
pub mod tracing_setup;

pub use collector::{MetricsCollector, MetricsConfig};
pub use tracing_setup::{init_tracing, init_tracing_from_env, LogFormat, TracingConfig};

use std::sync::OnceLock;
use thiserror::Error;

/// Global metrics collector.
static METRICS: OnceLock<MetricsCollector> = OnceLock::new();

/// Metrics error.
#[derive(Error, Debug)]
pub enum MetricsError {
    #[error("Metrics already initialized")]
    AlreadyInitialized,

    #[error("Metrics not initialized")]
    NotInitialized,

    #[error("Prometheus error: {0}")]
    PrometheusError(#[from] prometheus::Error),

    #[error("Tracing error: {0}")]
    TracingError(String),
}

/// Initialize the global metrics collector.
pub fn init_metrics(config: MetricsConfig) -> Result<(), MetricsError> {
    let collector = MetricsCollector::new(config)?;
    METRICS
        .set(collector)
        .map_err(|_| MetricsError::AlreadyInitialized)?;
    Ok(())
}

/// Get the global metrics collector.
pub fn metrics() -> Result<&'static MetricsCollector, MetricsError> {
    METRICS.get().ok_or(MetricsError::NotInitialized)
}

/// Export the global collector in Prometheus text format.
pub fn export_prometheus() -> Result<String, MetricsError> {
    metrics()?.export()
}

/// Time a block and record it under `$name` when metrics are initialized.
#[macro_export]
macro_rules! time_block {
    ($name:expr, $block:expr) => {{
        let start = std::time::Instant::now();
        let result = $block;
        let duration = start.elapsed();
        tracing::debug!("{} took {:?}", $name, duration);
        if let Ok(m) = $crate::metrics() {
            m.record_operation_latency($name, duration.as_secs_f64());
        }
        result
    }};
}
