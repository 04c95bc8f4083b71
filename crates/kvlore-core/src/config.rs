//! Runtime configuration types.
//!
//! These are the structures the session is built from. File loading and
//! environment overrides live in `kvlore-config`.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Default values
pub const DEFAULT_POOL_MIN_SIZE: usize = 128;
pub const DEFAULT_POOL_MAX_SIZE: usize = 10240;
pub const DEFAULT_POOL_SLACK: usize = 144;
pub const DEFAULT_SPLIT_ALIGN: usize = 16;
pub const DEFAULT_SEGMENT_CAPACITY: usize = 512;
pub const DEFAULT_MAX_LANES: usize = 3;
pub const DEFAULT_LANE_CTX: usize = 2048;
pub const DEFAULT_MAX_LAYERS: usize = 32;
pub const DEFAULT_MAX_BUFLEN: usize = 1024 * 1024;
pub const DEFAULT_GRAPH_CAPACITY: usize = 8192;

/// Top-level configuration for an actor session.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SessionConfig {
    /// Host memory pool.
    #[serde(default)]
    pub pool: PoolConfig,

    /// KV cache geometry and staging.
    #[serde(default)]
    pub cache: CacheConfig,

    /// Lane scheduling.
    #[serde(default)]
    pub lanes: LaneConfig,

    /// Directory holding actor state files.
    #[serde(default)]
    pub actors_dir: Option<PathBuf>,
}

impl SessionConfig {
    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        self.pool.validate()?;
        self.cache.validate()?;
        self.lanes.validate()?;
        Ok(())
    }
}

/// Host memory pool configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Smallest request served from the pool; smaller ones go to the platform allocator.
    #[serde(default = "default_pool_min")]
    pub min_size: usize,

    /// Largest request served from the pool.
    #[serde(default = "default_pool_max")]
    pub max_size: usize,

    /// Oversize a parked block must have before it is split for a smaller request.
    #[serde(default = "default_slack")]
    pub slack: usize,

    /// Alignment of split remainders.
    #[serde(default = "default_split_align")]
    pub split_align: usize,

    /// Slots per index segment.
    #[serde(default = "default_segment_capacity")]
    pub segment_capacity: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_size: DEFAULT_POOL_MIN_SIZE,
            max_size: DEFAULT_POOL_MAX_SIZE,
            slack: DEFAULT_POOL_SLACK,
            split_align: DEFAULT_SPLIT_ALIGN,
            segment_capacity: DEFAULT_SEGMENT_CAPACITY,
        }
    }
}

impl PoolConfig {
    /// Whether a request of `size` bytes is served from the pool.
    pub fn manages(&self, size: usize) -> bool {
        size >= self.min_size && size <= self.max_size
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.min_size == 0 || self.min_size > self.max_size {
            return Err(Error::validation_field(
                "min_size must be non-zero and not above max_size",
                "pool.min_size",
            ));
        }
        if !self.split_align.is_power_of_two() {
            return Err(Error::validation_field(
                "split_align must be a power of two",
                "pool.split_align",
            ));
        }
        if self.segment_capacity < 2 {
            return Err(Error::validation_field(
                "segment_capacity must be at least 2",
                "pool.segment_capacity",
            ));
        }
        Ok(())
    }
}

/// KV cache geometry and staging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Number of transformer layers.
    #[serde(default = "default_n_layer")]
    pub n_layer: usize,

    /// Upper bound accepted for `n_layer`.
    #[serde(default = "default_max_layers")]
    pub max_layers: usize,

    /// K embedding width per token (head dim x kv heads).
    #[serde(default = "default_n_embd")]
    pub n_embd_k: usize,

    /// V embedding width per token.
    #[serde(default = "default_n_embd")]
    pub n_embd_v: usize,

    /// Bytes per element (2 for f16).
    #[serde(default = "default_elsize")]
    pub elsize: usize,

    /// Token slots per lane ring.
    #[serde(default = "default_lane_ctx")]
    pub lane_ctx: usize,

    /// Cap on a single coalesced staging write, in bytes.
    #[serde(default = "default_max_buflen")]
    pub max_buflen: usize,

    /// Maximum copy nodes in one shuffle graph.
    #[serde(default = "default_graph_capacity")]
    pub graph_capacity: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            n_layer: default_n_layer(),
            max_layers: DEFAULT_MAX_LAYERS,
            n_embd_k: default_n_embd(),
            n_embd_v: default_n_embd(),
            elsize: default_elsize(),
            lane_ctx: DEFAULT_LANE_CTX,
            max_buflen: DEFAULT_MAX_BUFLEN,
            graph_capacity: DEFAULT_GRAPH_CAPACITY,
        }
    }
}

impl CacheConfig {
    /// Bytes of K (or V) stored per token per layer.
    pub fn k_row_bytes(&self) -> usize {
        self.n_embd_k * self.elsize
    }

    /// Bytes of V stored per token per layer.
    pub fn v_row_bytes(&self) -> usize {
        self.n_embd_v * self.elsize
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.n_layer == 0 || self.n_layer > self.max_layers {
            return Err(Error::validation_field(
                format!("n_layer must be in 1..={}", self.max_layers),
                "cache.n_layer",
            ));
        }
        if self.n_embd_k == 0 || self.n_embd_v == 0 || self.elsize == 0 {
            return Err(Error::validation_field(
                "embedding widths and element size must be non-zero",
                "cache.n_embd_k",
            ));
        }
        if self.lane_ctx == 0 {
            return Err(Error::validation_field(
                "lane_ctx must be non-zero",
                "cache.lane_ctx",
            ));
        }
        if self.max_buflen < self.k_row_bytes().max(self.v_row_bytes()) {
            return Err(Error::validation_field(
                "max_buflen must hold at least one token row",
                "cache.max_buflen",
            ));
        }
        if self.graph_capacity == 0 {
            return Err(Error::validation_field(
                "graph_capacity must be non-zero",
                "cache.graph_capacity",
            ));
        }
        Ok(())
    }
}

/// Lane scheduling configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LaneConfig {
    /// Number of concurrently resident lanes, System lane included.
    #[serde(default = "default_max_lanes")]
    pub max_lanes: usize,

    /// Slots kept free at the tail of a lane for generation.
    #[serde(default = "default_reserve_tokens")]
    pub reserve_tokens: usize,
}

impl Default for LaneConfig {
    fn default() -> Self {
        Self {
            max_lanes: DEFAULT_MAX_LANES,
            reserve_tokens: default_reserve_tokens(),
        }
    }
}

impl LaneConfig {
    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.max_lanes < 2 {
            return Err(Error::validation_field(
                "max_lanes must leave room for the System lane and one actor",
                "lanes.max_lanes",
            ));
        }
        Ok(())
    }
}

fn default_pool_min() -> usize {
    DEFAULT_POOL_MIN_SIZE
}

fn default_pool_max() -> usize {
    DEFAULT_POOL_MAX_SIZE
}

fn default_slack() -> usize {
    DEFAULT_POOL_SLACK
}

fn default_split_align() -> usize {
    DEFAULT_SPLIT_ALIGN
}

fn default_segment_capacity() -> usize {
    DEFAULT_SEGMENT_CAPACITY
}

fn default_n_layer() -> usize {
    DEFAULT_MAX_LAYERS
}

fn default_max_layers() -> usize {
    DEFAULT_MAX_LAYERS
}

fn default_n_embd() -> usize {
    512
}

fn default_elsize() -> usize {
    2
}

fn default_lane_ctx() -> usize {
    DEFAULT_LANE_CTX
}

fn default_max_buflen() -> usize {
    DEFAULT_MAX_BUFLEN
}

fn default_graph_capacity() -> usize {
    DEFAULT_GRAPH_CAPACITY
}

fn default_max_lanes() -> usize {
    DEFAULT_MAX_LANES
}

fn default_reserve_tokens() -> usize {
    256
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        SessionConfig::default().validate().unwrap();
    }

    #[test]
    fn test_pool_range() {
        let pool = PoolConfig::default();
        assert!(pool.manages(128));
        assert!(pool.manages(10240));
        assert!(!pool.manages(127));
        assert!(!pool.manages(10241));
    }

    #[test]
    fn test_token_stride_matches_observed_layout() {
        // 512 f16 values per layer per token, for K and again for V.
        let cache = CacheConfig::default();
        assert_eq!(cache.k_row_bytes() + cache.v_row_bytes(), 2048);
    }

    #[test]
    fn test_invalid_layers() {
        let cache = CacheConfig {
            n_layer: 40,
            ..Default::default()
        };
        assert!(cache.validate().is_err());
    }

    #[test]
    fn test_serde_defaults() {
        let cfg: SessionConfig = serde_json::from_str(r#"{"lanes": {"max_lanes": 4}}"#).unwrap();
        assert_eq!(cfg.lanes.max_lanes, 4);
        assert_eq!(cfg.pool.slack, DEFAULT_POOL_SLACK);
        assert_eq!(cfg.cache.n_layer, DEFAULT_MAX_LAYERS);
    }
}
