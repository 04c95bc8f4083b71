//! kvlore CLI.

pub mod commands;
pub mod output;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use kvlore_config::{load_default_config, Config, ConfigLoader, LoggingConfig};
use kvlore_metrics::{LogFormat, MetricsConfig, TracingConfig};

/// kvlore - multi-actor conversation cache tools.
#[derive(Parser, Debug)]
#[command(
    name = "kvlore",
    version,
    about = "Inspect actor memory files, exercise the memory pool and replay lane relocations",
    long_about = "kvlore keeps several actors' conversation memories resident in per-lane\n\
                  KV caches and rearranges them in place when the layout changes.\n\n\
                  This tool works on the same configuration the library uses:\n\
                  • inspect: list the records of .def/.mem/.rag/.hst/.rec files\n\
                  • pool: run an allocation workload against the memory pool\n\
                  • relocate: replay random layout changes on a CPU-backed lane\n\
                  • validate: check a configuration file"
)]
pub struct Cli {
    /// Subcommand to run.
    #[command(subcommand)]
    pub command: Commands,

    /// Configuration file path.
    #[arg(short, long, global = true, env = "KVLORE_CONFIG")]
    pub config: Option<String>,

    /// Log level or filter directive; overrides the configuration.
    #[arg(short, long, global = true)]
    pub log_level: Option<String>,

    /// Enable JSON output.
    #[arg(long, global = true)]
    pub json: bool,
}

/// CLI commands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// List the records of actor memory files.
    Inspect(commands::inspect::InspectArgs),

    /// Run a random allocation workload against the memory pool.
    Pool(commands::pool::PoolArgs),

    /// Replay random layout changes on one lane.
    Relocate(commands::relocate::RelocateArgs),

    /// Validate a configuration file.
    Validate(commands::validate::ValidateArgs),

    /// Show version information.
    Version,
}

/// Load the configuration named on the command line, or the default search
/// path when none is given. `KVLORE_*` variables apply either way.
pub fn load_config(path: Option<&str>) -> Result<Config> {
    match path {
        Some(path) => ConfigLoader::new()
            .with_file(path)
            .with_env_prefix("KVLORE")
            .load()
            .with_context(|| format!("failed to load configuration from {path}")),
        None => load_default_config().context("failed to load configuration"),
    }
}

/// Tracing settings for `logging`, with JSON output forced by `--json`.
pub fn tracing_config(
    logging: &LoggingConfig,
    level: Option<&str>,
    json: bool,
) -> Result<TracingConfig> {
    let format = if json {
        LogFormat::Json
    } else {
        logging.format.parse()?
    };
    Ok(TracingConfig {
        level: level.unwrap_or(&logging.level).to_string(),
        format,
        span_events: logging.spans,
    })
}

/// Collector settings for the configured namespace.
pub fn metrics_config(config: &Config) -> MetricsConfig {
    MetricsConfig::with_namespace(config.metrics.namespace.clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_subcommands() {
        let cli = Cli::try_parse_from(["kvlore", "--json", "pool", "--ops", "50"]).unwrap();
        assert!(cli.json);
        assert!(matches!(cli.command, Commands::Pool(ref args) if args.ops == 50));

        let cli = Cli::try_parse_from(["kvlore", "inspect", "a.def", "a.hst"]).unwrap();
        match cli.command {
            Commands::Inspect(args) => assert_eq!(args.files.len(), 2),
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_tracing_config_from_logging() {
        let logging = LoggingConfig {
            level: "debug".into(),
            format: "compact".into(),
            spans: true,
        };
        let tc = tracing_config(&logging, None, false).unwrap();
        assert_eq!(tc.level, "debug");
        assert_eq!(tc.format, LogFormat::Compact);
        assert!(tc.span_events);

        let tc = tracing_config(&logging, Some("warn"), true).unwrap();
        assert_eq!(tc.level, "warn");
        assert_eq!(tc.format, LogFormat::Json);
    }

    #[test]
    fn test_load_config_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kvlore.yaml");
        std::fs::write(&path, "cache:\n  lane_ctx: 512\nlanes:\n  max_lanes: 4\n").unwrap();
        let config = load_config(path.to_str()).unwrap();
        assert_eq!(config.session.cache.lane_ctx, 512);
        assert_eq!(config.session.lanes.max_lanes, 4);
    }
}
