//! Relocate command - replay random layout changes on one lane.
//!
//! Builds a session over the CPU executor, gives a demo actor a set of
//! materialized memories, binds it to lane 1 and then applies a series of
//! random layouts. Each round also hoists one resident memory in front of an
//! earlier one. After every round the lane's cache content is checked
//! against each resident memory's own buffers.

use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, Result};
use clap::Args;
use kvlore_config::Config;
use kvlore_core::{LaneId, TokenRange};
use kvlore_engine::{ActorSession, ConversationMemory, MapEntry, MemoryId, MemoryKind, Placement};
use kvlore_tensor::{KvGeometry, KvSnapshot};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use tracing::info;

use crate::output::{format_duration, format_kv_list, format_table, print_section, print_success};

const ACTOR: &str = "demo";
const LANE: LaneId = LaneId(1);

/// Relocate command arguments.
#[derive(Args, Debug)]
pub struct RelocateArgs {
    /// Memories given to the demo actor.
    #[arg(short, long, default_value = "12")]
    pub memories: usize,

    /// Largest memory, in tokens.
    #[arg(long, default_value = "24")]
    pub max_tokens: usize,

    /// Layout changes to apply.
    #[arg(short, long, default_value = "8")]
    pub rounds: usize,

    /// Token slots in the lane; overrides the configured lane_ctx.
    #[arg(long, default_value = "256")]
    pub ring: usize,

    /// Layers per cache; overrides the configured n_layer.
    #[arg(long, default_value = "4")]
    pub layers: usize,

    /// Go through a non-final pass before each final layout.
    #[arg(long)]
    pub staged: bool,

    /// RNG seed.
    #[arg(long, default_value = "7")]
    pub seed: u64,

    /// Print the metrics registry after the run.
    #[arg(long)]
    pub metrics: bool,
}

/// Outcome of one layout change.
#[derive(Debug, Serialize)]
pub struct RoundReport {
    pub round: usize,
    pub entries: usize,
    pub kept: usize,
    pub moved: usize,
    pub rewritten: usize,
    pub dropped: usize,
    pub tokens_preserved: usize,
    pub tokens_rewritten: usize,
    pub hoisted: usize,
    pub seconds: f64,
}

impl RoundReport {
    fn new(round: usize, entries: usize, placement: &Placement, seconds: f64) -> Self {
        Self {
            round,
            entries,
            kept: placement.kept.len(),
            moved: placement.moves.len(),
            rewritten: placement.rewrites.len(),
            dropped: placement.dropped.len(),
            tokens_preserved: placement.tokens_preserved(),
            tokens_rewritten: placement.tokens_rewritten(),
            hoisted: 0,
            seconds,
        }
    }
}

fn random_snapshot(rng: &mut StdRng, geometry: &KvGeometry, n: usize) -> KvSnapshot {
    let mut layer = |len: usize| -> Arc<[u8]> {
        let mut bytes = vec![0u8; len];
        rng.fill(bytes.as_mut_slice());
        Arc::from(bytes)
    };
    let k = (0..geometry.n_layer)
        .map(|_| layer(n * geometry.k_row_bytes()))
        .collect();
    let v = (0..geometry.n_layer)
        .map(|_| layer(n * geometry.v_row_bytes()))
        .collect();
    KvSnapshot { n_tokens: n, k, v }
}

/// A random subset of `memories` in random order, packed from slot 0 with
/// random gaps, fitting `ring` slots.
pub fn random_layout(rng: &mut StdRng, memories: &[(MemoryId, usize)], ring: usize) -> Vec<MapEntry> {
    let mut order = memories.to_vec();
    order.shuffle(rng);

    let mut chosen = Vec::new();
    let mut total = 0;
    for (id, len) in order {
        if total + len <= ring && rng.gen_bool(0.85) {
            total += len;
            chosen.push((id, len));
        }
    }

    let mut free = ring - total;
    let mut slot = 0;
    chosen
        .into_iter()
        .map(|(id, len)| {
            let gap = rng.gen_range(0..=free.min(6));
            free -= gap;
            slot += gap;
            let entry = MapEntry::new(id, TokenRange::with_len(slot, len));
            slot += len;
            entry
        })
        .collect()
}

/// Hoist a random resident memory to the start of a random earlier one.
/// Returns the tokens hoisted.
fn hoist_random(session: &mut ActorSession, rng: &mut StdRng) -> Result<usize> {
    let map = session.lane(LANE)?.map().to_vec();
    if map.len() < 2 {
        return Ok(0);
    }
    let i = rng.gen_range(1..map.len());
    let j = rng.gen_range(0..i);
    session.hoist(LANE, map[i].memory, map[j].range.start)?;
    Ok(map[i].range.len())
}

/// Run the relocation rounds and return one report per layout change,
/// the initial actor binding first.
pub fn run(config: &Config, args: &RelocateArgs) -> Result<Vec<RoundReport>> {
    let mut session_config = config.session.clone();
    session_config.actors_dir = None;
    session_config.cache.lane_ctx = args.ring;
    session_config.cache.n_layer = args.layers;
    session_config.lanes.reserve_tokens = session_config.lanes.reserve_tokens.min(args.ring / 4);

    let mut session = ActorSession::with_cpu(session_config)?;
    let geometry = *session.geometry();
    let mut rng = StdRng::seed_from_u64(args.seed);

    session.pick_actor(ACTOR)?;
    let mut memories = Vec::with_capacity(args.memories);
    for i in 0..args.memories {
        let n = rng.gen_range(1..=args.max_tokens.clamp(1, args.ring));
        let kv = random_snapshot(&mut rng, &geometry, n);
        let memory = ConversationMemory::eidet(
            if i % 2 == 0 { ACTOR } else { "user" },
            format!("utterance {i}"),
            format!("{i:04}"),
            kv,
        );
        memories.push((session.add_memory(ACTOR, MemoryKind::History, memory)?, n));
    }

    let metrics = kvlore_metrics::metrics().ok();
    let mut reports = Vec::with_capacity(args.rounds + 1);

    let start = Instant::now();
    let placement = session.useactor(LANE, ACTOR)?;
    let entries = session.lane(LANE)?.map().len();
    reports.push(RoundReport::new(0, entries, &placement, start.elapsed().as_secs_f64()));
    if let Some(m) = metrics {
        m.record_remap(LANE, &placement);
    }

    for round in 1..=args.rounds {
        let candidate = random_layout(&mut rng, &memories, args.ring);
        let start = Instant::now();
        if args.staged && candidate.len() > 1 {
            session.usemap(LANE, &candidate[..candidate.len() - 1], false)?;
        }
        let placement = session.usemap(LANE, &candidate, true)?;
        let seconds = start.elapsed().as_secs_f64();

        let start = Instant::now();
        let hoisted = hoist_random(&mut session, &mut rng)?;
        let hoist_seconds = start.elapsed().as_secs_f64();

        let mismatched = session.verify_lane(LANE)?;
        if !mismatched.is_empty() {
            bail!(
                "round {round}: {} resident memories hold the wrong content",
                mismatched.len()
            );
        }
        if let Some(m) = metrics {
            m.record_remap(LANE, &placement);
            m.record_operation_latency("usemap", seconds);
            m.record_operation_latency("hoist", hoist_seconds);
        }
        reports.push(RoundReport {
            hoisted,
            ..RoundReport::new(round, candidate.len(), &placement, seconds)
        });
    }

    if let Some(m) = metrics {
        m.observe_lanes(&session.lane_summaries());
        m.observe_pool(&session.pool_stats());
    }
    info!(rounds = args.rounds, "relocation replay finished");
    session.shutdown()?;
    Ok(reports)
}

/// Execute the relocate command.
pub fn execute(args: RelocateArgs, config: &Config, json: bool) -> Result<()> {
    let reports = run(config, &args)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&reports)?);
    } else {
        print_section("Relocation replay");
        let rows: Vec<Vec<String>> = reports
            .iter()
            .map(|r| {
                vec![
                    r.round.to_string(),
                    r.entries.to_string(),
                    r.kept.to_string(),
                    r.moved.to_string(),
                    r.rewritten.to_string(),
                    r.dropped.to_string(),
                    r.tokens_preserved.to_string(),
                    r.tokens_rewritten.to_string(),
                    r.hoisted.to_string(),
                    format_duration(r.seconds),
                ]
            })
            .collect();
        print!(
            "{}",
            format_table(
                &[
                    "round", "entries", "kept", "moved", "rewritten", "dropped", "preserved",
                    "written", "hoisted", "time"
                ],
                &rows
            )
        );

        let preserved: usize = reports.iter().map(|r| r.tokens_preserved).sum();
        let written: usize = reports.iter().map(|r| r.tokens_rewritten).sum();
        println!();
        println!(
            "{}",
            format_kv_list(&[
                ("tokens preserved", preserved.to_string()),
                ("tokens written", written.to_string()),
            ])
        );
        println!();
        print_success("every resident memory matched its buffers");
    }

    if args.metrics {
        if let Ok(m) = kvlore_metrics::metrics() {
            print!("{}", m.export()?);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use kvlore_engine::MemoryStore;

    fn args(rounds: usize, staged: bool) -> RelocateArgs {
        RelocateArgs {
            memories: 10,
            max_tokens: 12,
            rounds,
            ring: 96,
            layers: 2,
            staged,
            seed: 5,
            metrics: false,
        }
    }

    fn small_config() -> Config {
        let mut config = Config::default();
        config.session.cache.n_embd_k = 4;
        config.session.cache.n_embd_v = 4;
        config
    }

    #[test]
    fn test_random_layout_fits_ring() {
        let mut store = MemoryStore::new();
        let memories: Vec<_> = (0..20)
            .map(|i| (store.insert(ConversationMemory::plain("a", "", i + 1, "t")), i + 1))
            .collect();
        let mut rng = StdRng::seed_from_u64(1);
        for _ in 0..50 {
            let layout = random_layout(&mut rng, &memories, 64);
            kvlore_engine::validate_candidate(&layout, 64).unwrap();
        }
    }

    #[test]
    fn test_replay_keeps_content() {
        let reports = run(&small_config(), &args(6, false)).unwrap();
        assert_eq!(reports.len(), 7);
        assert!(reports[1..].iter().any(|r| r.tokens_preserved > 0));
        assert!(reports[1..].iter().any(|r| r.hoisted > 0));
        assert_eq!(reports[0].hoisted, 0);
    }

    #[test]
    fn test_staged_replay_keeps_content() {
        let reports = run(&small_config(), &args(4, true)).unwrap();
        assert_eq!(reports.len(), 5);
    }
}
