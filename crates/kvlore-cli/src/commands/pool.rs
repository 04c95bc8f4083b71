//! Pool command - run an allocation workload against the memory pool.

use std::time::Instant;

use anyhow::{bail, Result};
use clap::Args;
use colored::Colorize;
use kvlore_config::Config;
use kvlore_memory::{MemoryPool, PoolBuffer, PoolReport, PoolStats};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use tracing::info;

use crate::output::{format_bytes, format_duration, format_kv_list, format_number, print_section};

/// Pool command arguments.
#[derive(Args, Debug)]
pub struct PoolArgs {
    /// Allocation and release operations to run.
    #[arg(long, default_value = "10000")]
    pub ops: usize,

    /// Most allocations alive at once.
    #[arg(long, default_value = "256")]
    pub live: usize,

    /// Largest request size; defaults to the pool's max_size.
    #[arg(long)]
    pub max_request: Option<usize>,

    /// RNG seed.
    #[arg(long, default_value = "1")]
    pub seed: u64,

    /// Print the metrics registry after the run.
    #[arg(long)]
    pub metrics: bool,
}

/// Workload results.
#[derive(Debug, Serialize)]
pub struct PoolRun {
    pub ops: usize,
    pub allocs: usize,
    pub releases: usize,
    pub seconds: f64,
    pub peak: PoolStats,
    pub by_size: PoolReport,
    pub contiguous: PoolReport,
    pub drained: PoolStats,
}

impl PoolRun {
    /// Whether both diagnostic walks came back clean and everything was returned.
    pub fn is_clean(&self) -> bool {
        self.by_size.is_clean() && self.contiguous.is_clean() && self.drained.used_blocks == 0
    }
}

/// Run the workload: random sizes, random release order, then drain.
pub fn run(pool: &mut MemoryPool, args: &PoolArgs) -> Result<PoolRun> {
    let max_request = args.max_request.unwrap_or(pool.config().max_size).max(1);
    let mut rng = StdRng::seed_from_u64(args.seed);
    let mut live: Vec<PoolBuffer> = Vec::with_capacity(args.live);
    let mut peak = pool.stats();
    let (mut allocs, mut releases) = (0, 0);

    let start = Instant::now();
    for _ in 0..args.ops {
        let release = !live.is_empty() && (live.len() >= args.live || rng.gen_bool(0.45));
        if release {
            let buffer = live.swap_remove(rng.gen_range(0..live.len()));
            pool.release_buffer(buffer);
            releases += 1;
        } else {
            let buffer = pool.alloc_buffer(rng.gen_range(1..=max_request))?;
            live.push(buffer);
            allocs += 1;
            let stats = pool.stats();
            if stats.used_bytes > peak.used_bytes {
                peak = stats;
            }
        }
    }
    let seconds = start.elapsed().as_secs_f64();

    let by_size = pool.report_by_size();
    let contiguous = pool.report_contiguous();
    for buffer in live.drain(..) {
        pool.release_buffer(buffer);
        releases += 1;
    }
    let drained = pool.stats();
    info!(allocs, releases, seconds, "pool workload finished");

    Ok(PoolRun {
        ops: args.ops,
        allocs,
        releases,
        seconds,
        peak,
        by_size,
        contiguous,
        drained,
    })
}

/// Execute the pool command.
pub fn execute(args: PoolArgs, config: &Config, json: bool) -> Result<()> {
    let mut pool = MemoryPool::new(config.session.pool.clone())?;
    let result = run(&mut pool, &args)?;

    let metrics = kvlore_metrics::metrics().ok();
    if let Some(m) = metrics {
        m.observe_pool(&pool.stats());
        m.record_operation_latency("pool_workload", result.seconds);
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        print_section("Workload");
        println!(
            "{}",
            format_kv_list(&[
                ("operations", format_number(result.ops as u64)),
                ("allocations", format_number(result.allocs as u64)),
                ("releases", format_number(result.releases as u64)),
                ("elapsed", format_duration(result.seconds)),
            ])
        );

        print_section("At peak");
        println!("{}", stats_list(&result.peak));

        print_section("Diagnostic walks");
        for (name, report) in [("by size", &result.by_size), ("contiguous", &result.contiguous)] {
            let status = if report.is_clean() {
                "clean".bright_green()
            } else {
                "DEFECTS".bright_red().bold()
            };
            println!(
                "  {name}: {status} ({} blocks, {}, {} runs, largest {})",
                report.blocks,
                format_bytes(report.bytes),
                report.runs,
                format_bytes(report.largest)
            );
            for violation in &report.violations {
                println!("    {} {}", "✗".bright_red(), violation);
            }
        }

        print_section("After drain");
        println!("{}", stats_list(&result.drained));
        println!();
    }

    if args.metrics {
        if let Some(m) = metrics {
            print!("{}", m.export()?);
        }
    }

    if !result.is_clean() {
        bail!("memory pool reported defects");
    }
    Ok(())
}

fn stats_list(stats: &PoolStats) -> String {
    format_kv_list(&[
        ("used", format!("{} in {} blocks", format_bytes(stats.used_bytes), stats.used_blocks)),
        ("loose", format!("{} in {} blocks", format_bytes(stats.loose_bytes), stats.loose_blocks)),
        ("fallback live", stats.fallback_live.to_string()),
        ("chunks", stats.chunks.to_string()),
        ("reuse hits", format_number(stats.reuse_hits)),
        ("fresh allocs", format_number(stats.fresh_allocs)),
        ("splits", format_number(stats.splits)),
        ("fallback allocs", format_number(stats.fallback_allocs)),
    ])
}
