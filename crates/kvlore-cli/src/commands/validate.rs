//! Validate command - validate configuration files.

use anyhow::Result;
use clap::Args;
use colored::Colorize;

use kvlore_config::validation::{lane_cache_bytes, validate_environment};
use kvlore_config::{Config, ConfigLoader};

use crate::output::format_bytes;

/// Validate command arguments.
#[derive(Args, Debug)]
pub struct ValidateArgs {
    /// Configuration file to validate.
    pub config_file: String,

    /// Also check that actors_dir exists.
    #[arg(long)]
    pub check_dirs: bool,

    /// Verbose output.
    #[arg(short, long)]
    pub verbose: bool,
}

/// Findings for one configuration.
#[derive(Debug, Default)]
pub struct Findings {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

/// Checks beyond what loading already enforces.
pub fn review(config: &Config, check_dirs: bool) -> Findings {
    let mut findings = Findings::default();
    let session = &config.session;

    if check_dirs {
        if let Err(e) = validate_environment(config) {
            findings.errors.push(e.to_string());
        }
    }

    if session.lanes.reserve_tokens >= session.cache.lane_ctx {
        findings.errors.push(format!(
            "lanes.reserve_tokens ({}) leaves no room in a lane of {} slots",
            session.lanes.reserve_tokens, session.cache.lane_ctx
        ));
    }

    let row = session.cache.k_row_bytes().max(session.cache.v_row_bytes());
    if session.cache.max_buflen > session.pool.max_size {
        findings.warnings.push(format!(
            "cache.max_buflen ({}) is above pool.max_size ({}); staging buffers bypass the pool",
            session.cache.max_buflen, session.pool.max_size
        ));
    }
    if row > 0 && session.cache.max_buflen % row != 0 {
        findings.warnings.push(format!(
            "cache.max_buflen ({}) is not a multiple of the {row} byte token row",
            session.cache.max_buflen
        ));
    }
    if session.actors_dir.is_none() {
        findings
            .warnings
            .push("actors_dir is unset; actors will not be saved".to_string());
    }

    findings
}

/// Execute the validate command.
pub fn execute(args: ValidateArgs, json: bool) -> Result<()> {
    if !json {
        println!(
            "\n{} {}",
            "Validating".bright_green().bold(),
            args.config_file.bright_cyan()
        );
        println!();
    }

    let mut findings = Findings::default();

    let config = match ConfigLoader::new().with_file(&args.config_file).load() {
        Ok(c) => {
            if !json && args.verbose {
                println!("  {} Configuration loaded successfully", "✓".bright_green());
            }
            Some(c)
        }
        Err(e) => {
            findings
                .errors
                .push(format!("Failed to load configuration: {}", e));
            None
        }
    };

    if let Some(ref config) = config {
        let more = review(config, args.check_dirs);
        findings.errors.extend(more.errors);
        findings.warnings.extend(more.warnings);

        if !json && args.verbose {
            let s = &config.session;
            println!();
            println!("  {}", "Configuration Summary".bright_cyan().underline());
            println!("    Lanes: {} (lane 0 reserved for System)", s.lanes.max_lanes);
            println!("    Slots per lane: {}", s.cache.lane_ctx);
            println!(
                "    Geometry: {} layers, K {} x {}B, V {} x {}B",
                s.cache.n_layer, s.cache.n_embd_k, s.cache.elsize, s.cache.n_embd_v, s.cache.elsize
            );
            println!("    Lane caches: {}", format_bytes(lane_cache_bytes(config)));
            println!("    Pool range: {}..={} bytes", s.pool.min_size, s.pool.max_size);
            println!();
        }
    }

    if json {
        let result = serde_json::json!({
            "file": args.config_file,
            "valid": findings.errors.is_empty(),
            "errors": findings.errors,
            "warnings": findings.warnings,
            "lane_cache_bytes": config.as_ref().map(lane_cache_bytes),
        });
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        if !findings.errors.is_empty() {
            println!("  {}", "Errors:".bright_red().bold());
            for error in &findings.errors {
                println!("    {} {}", "✗".bright_red(), error);
            }
            println!();
        }

        if !findings.warnings.is_empty() {
            println!("  {}", "Warnings:".bright_yellow().bold());
            for warning in &findings.warnings {
                println!("    {} {}", "⚠".bright_yellow(), warning);
            }
            println!();
        }

        if findings.errors.is_empty() {
            println!(
                "  {} Configuration is {}",
                "✓".bright_green(),
                "valid".bright_green().bold()
            );
        } else {
            println!(
                "  {} Configuration is {}",
                "✗".bright_red(),
                "invalid".bright_red().bold()
            );
        }
    }

    if !findings.errors.is_empty() {
        anyhow::bail!("Configuration validation failed");
    }

    Ok(())
}
