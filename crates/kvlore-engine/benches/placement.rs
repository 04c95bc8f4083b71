//! Benchmark for lane placement.

use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use kvlore_core::{LaneId, SessionConfig, TokenRange};
use kvlore_engine::{plan, ActorSession, ConversationMemory, MapEntry, MemoryKind, MemoryStore};
use kvlore_tensor::{KvGeometry, KvSnapshot};
use rand::prelude::*;

fn layout(ids: &[kvlore_engine::MemoryId], rng: &mut StdRng) -> Vec<MapEntry> {
    let mut slot = 0;
    ids.iter()
        .map(|id| {
            slot += rng.gen_range(0..4);
            let len = rng.gen_range(4..64);
            let entry = MapEntry::new(*id, TokenRange::with_len(slot, len));
            slot += len;
            entry
        })
        .collect()
}

fn benchmark_plan(c: &mut Criterion) {
    let mut group = c.benchmark_group("placement_plan");
    let mut rng = StdRng::seed_from_u64(7);
    let mut store = MemoryStore::new();

    for entries in [16, 64, 256].iter() {
        let ids: Vec<_> = (0..*entries)
            .map(|i| store.insert(ConversationMemory::plain("b", format!("{i}"), 1, "t")))
            .collect();
        let previous = layout(&ids, &mut rng);
        let mut shuffled = ids.clone();
        shuffled.shuffle(&mut rng);
        let candidate = layout(&shuffled, &mut rng);

        group.bench_with_input(BenchmarkId::new("plan", entries), entries, |b, _| {
            b.iter(|| plan(black_box(&previous), black_box(&candidate)))
        });
    }

    group.finish();
}

fn snapshot(geometry: &KvGeometry, n: usize) -> KvSnapshot {
    KvSnapshot {
        n_tokens: n,
        k: (0..geometry.n_layer)
            .map(|_| Arc::from(vec![1u8; n * geometry.k_row_bytes()]))
            .collect(),
        v: (0..geometry.n_layer)
            .map(|_| Arc::from(vec![2u8; n * geometry.v_row_bytes()]))
            .collect(),
    }
}

fn benchmark_useactor(c: &mut Criterion) {
    let mut config = SessionConfig::default();
    config.cache.n_layer = 4;
    config.cache.n_embd_k = 64;
    config.cache.n_embd_v = 64;
    config.cache.lane_ctx = 1024;

    let mut session = ActorSession::with_cpu(config).expect("session");
    session.pick_actor("bench").expect("actor");
    let geometry = *session.geometry();
    for i in 0..24 {
        let kv = snapshot(&geometry, 32);
        let memory = ConversationMemory::eidet("bench", format!("line {i}"), "t", kv);
        session
            .add_memory("bench", MemoryKind::History, memory)
            .expect("memory");
    }

    let lane = LaneId::new(1);
    c.bench_function("useactor_cold_lane", |b| {
        b.iter(|| {
            session.release_lane(lane).expect("release");
            session.useactor(lane, "bench").expect("useactor")
        })
    });
}

criterion_group!(benches, benchmark_plan, benchmark_useactor);
criterion_main!(benches);
