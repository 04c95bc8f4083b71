//! kvlore CLI entry point.

use anyhow::Result;
use clap::Parser;
use colored::Colorize;
use tracing::{debug, warn};

use kvlore_cli::{load_config, metrics_config, tracing_config, Cli, Commands};
use kvlore_config::Config;
use kvlore_metrics::{init_metrics, init_tracing};

fn main() -> Result<()> {
    let cli = Cli::parse();

    // validate and version must run even when the default config is broken
    let (config, load_error) = match cli.command {
        Commands::Validate(_) | Commands::Version => match load_config(cli.config.as_deref()) {
            Ok(config) => (config, None),
            Err(e) => (Config::default(), Some(e)),
        },
        _ => (load_config(cli.config.as_deref())?, None),
    };

    init_tracing(tracing_config(
        &config.logging,
        cli.log_level.as_deref(),
        cli.json,
    )?)?;
    if let Some(e) = load_error {
        warn!("using default configuration: {e:#}");
    }

    if config.metrics.enabled {
        init_metrics(metrics_config(&config))?;
        debug!(namespace = %config.metrics.namespace, "metrics enabled");
    }

    match cli.command {
        Commands::Inspect(args) => kvlore_cli::commands::inspect::execute(args, &config, cli.json),
        Commands::Pool(args) => kvlore_cli::commands::pool::execute(args, &config, cli.json),
        Commands::Relocate(args) => {
            kvlore_cli::commands::relocate::execute(args, &config, cli.json)
        }
        Commands::Validate(args) => kvlore_cli::commands::validate::execute(args, cli.json),
        Commands::Version => {
            print_version(cli.json)?;
            Ok(())
        }
    }
}

/// Print version information.
fn print_version(json: bool) -> Result<()> {
    if json {
        let version = serde_json::json!({
            "name": "kvlore",
            "version": env!("CARGO_PKG_VERSION"),
            "rust_version": env!("CARGO_PKG_RUST_VERSION"),
            "description": env!("CARGO_PKG_DESCRIPTION"),
        });
        println!("{}", serde_json::to_string_pretty(&version)?);
    } else {
        println!("{} {}", "kvlore".bright_green().bold(), env!("CARGO_PKG_VERSION"));
        println!("Rust version: {}", env!("CARGO_PKG_RUST_VERSION"));
        println!();
        println!("{}", env!("CARGO_PKG_DESCRIPTION"));
    }
    Ok(())
}
