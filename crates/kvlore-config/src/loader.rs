//! Configuration loader.

use std::path::Path;
use std::str::FromStr;

use kvlore_core::{CacheConfig, LaneConfig, PoolConfig};
use tracing::{debug, info};

use crate::error::ConfigError;
use crate::{Config, LoggingConfig};

/// Configuration file format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    /// `.yaml` / `.yml`
    Yaml,
    /// `.toml`
    Toml,
    /// `.json`
    Json,
}

impl ConfigFormat {
    /// Detect format from file extension.
    pub fn from_extension(path: &str) -> Option<Self> {
        let ext = Path::new(path)
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_lowercase());

        match ext.as_deref() {
            Some("yaml") | Some("yml") => Some(Self::Yaml),
            Some("toml") => Some(Self::Toml),
            Some("json") => Some(Self::Json),
            _ => None,
        }
    }

    /// Parse content in this format.
    pub fn parse<T: serde::de::DeserializeOwned>(&self, content: &str) -> Result<T, ConfigError> {
        match self {
            Self::Yaml => serde_yaml::from_str(content).map_err(ConfigError::from),
            Self::Toml => toml::from_str(content).map_err(ConfigError::from),
            Self::Json => serde_json::from_str(content).map_err(ConfigError::from),
        }
    }
}

/// Configuration loader.
pub struct ConfigLoader {
    /// Config file path.
    file_path: Option<String>,

    /// Environment variable prefix.
    env_prefix: Option<String>,

    /// Default values.
    defaults: Config,
}

impl ConfigLoader {
    /// Create a new config loader.
    pub fn new() -> Self {
        Self {
            file_path: None,
            env_prefix: None,
            defaults: Config::default(),
        }
    }

    /// Set the config file path.
    pub fn with_file(mut self, path: impl Into<String>) -> Self {
        self.file_path = Some(path.into());
        self
    }

    /// Set the environment variable prefix.
    pub fn with_env_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.env_prefix = Some(prefix.into());
        self
    }

    /// Set default values.
    pub fn with_defaults(mut self, defaults: Config) -> Self {
        self.defaults = defaults;
        self
    }

    /// Load the configuration.
    pub fn load(self) -> Result<Config, ConfigError> {
        let mut config = match self.file_path {
            Some(ref path) => self.load_from_file(path)?,
            None => self.defaults.clone(),
        };

        if let Some(ref prefix) = self.env_prefix {
            apply_env_overrides(&mut config, prefix, |name| std::env::var(name).ok())?;
        }

        config.validate()?;
        Ok(config)
    }

    fn load_from_file(&self, path: &str) -> Result<Config, ConfigError> {
        debug!("Loading configuration from {}", path);

        if !Path::new(path).exists() {
            return Err(ConfigError::FileNotFound(path.to_string()));
        }

        let format = ConfigFormat::from_extension(path)
            .ok_or_else(|| ConfigError::UnsupportedFormat(path.to_string()))?;
        let content = std::fs::read_to_string(path)?;
        let config: Config = format.parse(&content)?;

        info!("Loaded configuration from {}", path);
        Ok(config)
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

fn parsed<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
) -> Result<Option<T>, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match lookup(name) {
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| ConfigError::env(name, format!("cannot parse {raw:?}: {e}"))),
        None => Ok(None),
    }
}

/// Apply `{prefix}_*` overrides, reading variables through `lookup`.
pub fn apply_env_overrides(
    config: &mut Config,
    prefix: &str,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<(), ConfigError> {
    let var = |suffix: &str| format!("{prefix}_{suffix}");

    macro_rules! override_field {
        ($suffix:literal => $($field:ident).+) => {
            if let Some(value) = parsed(&lookup, &var($suffix))? {
                debug!(variable = %var($suffix), "configuration override");
                config.$($field).+ = value;
            }
        };
    }

    // Session
    override_field!("POOL_MIN_SIZE" => session.pool.min_size);
    override_field!("POOL_MAX_SIZE" => session.pool.max_size);
    override_field!("POOL_SLACK" => session.pool.slack);
    override_field!("N_LAYER" => session.cache.n_layer);
    override_field!("N_EMBD_K" => session.cache.n_embd_k);
    override_field!("N_EMBD_V" => session.cache.n_embd_v);
    override_field!("ELSIZE" => session.cache.elsize);
    override_field!("LANE_CTX" => session.cache.lane_ctx);
    override_field!("MAX_BUFLEN" => session.cache.max_buflen);
    override_field!("MAX_LANES" => session.lanes.max_lanes);
    override_field!("RESERVE_TOKENS" => session.lanes.reserve_tokens);
    if let Some(dir) = lookup(&var("ACTORS_DIR")) {
        config.session.actors_dir = Some(dir.into());
    }

    // Logging
    if let Some(level) = lookup(&var("LOG_LEVEL")) {
        config.logging.level = level;
    }
    if let Some(format) = lookup(&var("LOG_FORMAT")) {
        config.logging.format = format;
    }

    // Metrics
    override_field!("METRICS_ENABLED" => metrics.enabled);

    Ok(())
}

/// Load configuration from default locations.
pub fn load_default_config() -> Result<Config, ConfigError> {
    let paths = [
        "kvlore.yaml",
        "kvlore.yml",
        "kvlore.toml",
        "kvlore.json",
        "/etc/kvlore/config.yaml",
    ];

    for path in &paths {
        if Path::new(path).exists() {
            return ConfigLoader::new()
                .with_file(*path)
                .with_env_prefix("KVLORE")
                .load();
        }
    }

    ConfigLoader::new().with_env_prefix("KVLORE").load()
}

/// Builder for programmatic configuration.
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Create a new config builder.
    pub fn new() -> Self {
        Self {
            config: Config::default(),
        }
    }

    /// Set pool configuration.
    pub fn pool(mut self, pool: PoolConfig) -> Self {
        self.config.session.pool = pool;
        self
    }

    /// Set cache configuration.
    pub fn cache(mut self, cache: CacheConfig) -> Self {
        self.config.session.cache = cache;
        self
    }

    /// Set lane configuration.
    pub fn lanes(mut self, lanes: LaneConfig) -> Self {
        self.config.session.lanes = lanes;
        self
    }

    /// Set the actor directory.
    pub fn actors_dir(mut self, dir: impl Into<std::path::PathBuf>) -> Self {
        self.config.session.actors_dir = Some(dir.into());
        self
    }

    /// Set logging configuration.
    pub fn logging(mut self, logging: LoggingConfig) -> Self {
        self.config.logging = logging;
        self
    }

    /// Build the configuration.
    pub fn build(self) -> Result<Config, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
