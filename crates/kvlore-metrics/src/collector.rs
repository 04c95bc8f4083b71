//! Metrics collector.

use kvlore_core::LaneId;
use kvlore_engine::{LaneSummary, Placement};
use kvlore_memory::PoolStats;
use prometheus::{
    Counter, CounterVec, Encoder, Gauge, GaugeVec, HistogramOpts, HistogramVec, Opts, Registry,
    TextEncoder,
};
use tracing::debug;

use crate::MetricsError;

/// Metrics configuration.
#[derive(Debug, Clone)]
pub struct MetricsConfig {
    /// Namespace for metrics.
    pub namespace: String,

    /// Subsystem for metrics. Empty means none.
    pub subsystem: String,

    /// Latency histogram buckets.
    pub latency_buckets: Vec<f64>,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            namespace: "kvlore".to_string(),
            subsystem: String::new(),
            latency_buckets: vec![
                0.0001, 0.0005, 0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0,
            ],
        }
    }
}

impl MetricsConfig {
    /// Config with the given namespace and default buckets.
    pub fn with_namespace(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            ..Default::default()
        }
    }

    fn opts(&self, name: &str, help: &str) -> Opts {
        Opts::new(name, help)
            .namespace(&self.namespace)
            .subsystem(&self.subsystem)
    }
}

/// Metrics collector.
pub struct MetricsCollector {
    registry: Registry,

    // Pool metrics
    pool_bytes: GaugeVec,
    pool_blocks: GaugeVec,
    pool_chunks: Gauge,
    pool_allocated: Gauge,
    pool_allocations: GaugeVec,

    // Lane metrics
    lane_tokens: GaugeVec,
    lane_entries: GaugeVec,

    // Remap metrics
    remaps_total: CounterVec,
    tokens_moved_total: Counter,
    tokens_rewritten_total: Counter,

    errors_total: CounterVec,
    operation_latency: HistogramVec,
}

impl MetricsCollector {
    /// Create a collector with its own registry.
    pub fn new(config: MetricsConfig) -> Result<Self, MetricsError> {
        let registry = Registry::new();

        let pool_bytes = GaugeVec::new(
            config.opts("pool_bytes", "Pool bytes by state (used, loose)"),
            &["state"],
        )?;
        let pool_blocks = GaugeVec::new(
            config.opts("pool_blocks", "Pool blocks by state (used, loose, fallback)"),
            &["state"],
        )?;
        let pool_chunks = Gauge::with_opts(
            config.opts("pool_chunks", "Backing chunks obtained from the raw allocator"),
        )?;
        let pool_allocated = Gauge::with_opts(config.opts(
            "pool_allocated_hundreds_bytes",
            "Bytes obtained from the raw allocator, divided by 100",
        ))?;
        let pool_allocations = GaugeVec::new(
            config.opts("pool_allocations", "Pool allocations by the path that served them"),
            &["path"],
        )?;

        let lane_tokens = GaugeVec::new(
            config.opts("lane_resident_tokens", "Tokens resident in a lane's committed map"),
            &["lane"],
        )?;
        let lane_entries = GaugeVec::new(
            config.opts("lane_entries", "Entries in a lane's committed map"),
            &["lane"],
        )?;

        let remaps_total = CounterVec::new(
            config.opts("remaps_total", "Layout changes applied to a lane"),
            &["lane"],
        )?;
        let tokens_moved_total = Counter::with_opts(
            config.opts("tokens_moved_total", "Tokens relocated inside a cache"),
        )?;
        let tokens_rewritten_total = Counter::with_opts(
            config.opts("tokens_rewritten_total", "Tokens written from memory buffers"),
        )?;

        let errors_total = CounterVec::new(
            config.opts("errors_total", "Errors by error code"),
            &["code"],
        )?;
        let operation_latency = HistogramVec::new(
            HistogramOpts::new("operation_latency_seconds", "Operation latency in seconds")
                .namespace(&config.namespace)
                .subsystem(&config.subsystem)
                .buckets(config.latency_buckets.clone()),
            &["operation"],
        )?;

        registry.register(Box::new(pool_bytes.clone()))?;
        registry.register(Box::new(pool_blocks.clone()))?;
        registry.register(Box::new(pool_chunks.clone()))?;
        registry.register(Box::new(pool_allocated.clone()))?;
        registry.register(Box::new(pool_allocations.clone()))?;
        registry.register(Box::new(lane_tokens.clone()))?;
        registry.register(Box::new(lane_entries.clone()))?;
        registry.register(Box::new(remaps_total.clone()))?;
        registry.register(Box::new(tokens_moved_total.clone()))?;
        registry.register(Box::new(tokens_rewritten_total.clone()))?;
        registry.register(Box::new(errors_total.clone()))?;
        registry.register(Box::new(operation_latency.clone()))?;

        debug!(namespace = %config.namespace, "Initialized metrics collector");

        Ok(Self {
            registry,
            pool_bytes,
            pool_blocks,
            pool_chunks,
            pool_allocated,
            pool_allocations,
            lane_tokens,
            lane_entries,
            remaps_total,
            tokens_moved_total,
            tokens_rewritten_total,
            errors_total,
            operation_latency,
        })
    }

    // Pool metrics
    pub fn observe_pool(&self, stats: &PoolStats) {
        self.pool_bytes
            .with_label_values(&["used"])
            .set(stats.used_bytes as f64);
        self.pool_bytes
            .with_label_values(&["loose"])
            .set(stats.loose_bytes as f64);
        self.pool_blocks
            .with_label_values(&["used"])
            .set(stats.used_blocks as f64);
        self.pool_blocks
            .with_label_values(&["loose"])
            .set(stats.loose_blocks as f64);
        self.pool_blocks
            .with_label_values(&["fallback"])
            .set(stats.fallback_live as f64);
        self.pool_chunks.set(stats.chunks as f64);
        self.pool_allocated.set(stats.total_allocated as f64);

        for (path, count) in [
            ("reuse", stats.reuse_hits),
            ("fresh", stats.fresh_allocs),
            ("split", stats.splits),
            ("fallback", stats.fallback_allocs),
        ] {
            self.pool_allocations
                .with_label_values(&[path])
                .set(count as f64);
        }
    }

    // Lane metrics
    pub fn observe_lanes(&self, lanes: &[LaneSummary]) {
        for lane in lanes {
            let label = lane.lane.to_string();
            self.lane_tokens
                .with_label_values(&[&label])
                .set(lane.resident_tokens as f64);
            self.lane_entries
                .with_label_values(&[&label])
                .set(lane.entries as f64);
        }
    }

    /// Count one applied layout change and the tokens it touched.
    pub fn record_remap(&self, lane: LaneId, placement: &Placement) {
        self.remaps_total
            .with_label_values(&[&lane.value().to_string()])
            .inc();
        let moved: usize = placement.moves.iter().map(|m| m.from.len()).sum();
        self.tokens_moved_total.inc_by(moved as f64);
        self.tokens_rewritten_total
            .inc_by(placement.tokens_rewritten() as f64);
    }

    // Error metrics
    pub fn record_error(&self, code: &str) {
        self.errors_total.with_label_values(&[code]).inc();
    }

    // Operation latency
    pub fn record_operation_latency(&self, operation: &str, seconds: f64) {
        self.operation_latency
            .with_label_values(&[operation])
            .observe(seconds);
    }

    /// Get registry for custom metrics.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Encode every registered metric in Prometheus text format.
    pub fn export(&self) -> Result<String, MetricsError> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }
}

impl std::fmt::Debug for MetricsCollector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsCollector")
            .field("families", &self.registry.gather().len())
            .finish()
    }
}
