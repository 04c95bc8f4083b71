//! The actor session: lanes, actors and their memories over one executor.
//!
//! An [`ActorSession`] owns everything the conversation cache needs: the
//! graph executor holding the lane caches, the host memory pool used for
//! staging, the shuffle context, the memory store and the loaded actors.
//! Every operation runs to completion on the calling thread.

use std::collections::BTreeMap;
use std::path::Path;

use kvlore_core::{
    Error, LaneId, Result, SessionConfig, SlotIdx, TokenRange, SYSTEM_ACTOR,
};
use kvlore_memory::{MemoryPool, PoolStats};
use kvlore_tensor::{CpuExecutor, GraphContext, GraphExecutor, KvCache, KvGeometry, KvSnapshot};
use tracing::{debug, info, instrument, warn};

use crate::actor::Actor;
use crate::lane::{Lane, LaneState, LaneSummary, MapEntry, RewindMark};
use crate::memory::{ConversationMemory, MemoryId, MemoryKind, MemoryStore};
use crate::placement::{self, Placement};

/// Conversation cache runtime.
pub struct ActorSession {
    config: SessionConfig,
    geometry: KvGeometry,
    executor: Box<dyn GraphExecutor>,
    pool: MemoryPool,
    graph: GraphContext,
    store: MemoryStore,
    actors: BTreeMap<String, Actor>,
    lanes: Vec<Lane>,
}

impl ActorSession {
    /// Create a session over `executor`.
    ///
    /// The System actor is picked immediately.
    pub fn new(config: SessionConfig, executor: Box<dyn GraphExecutor>) -> Result<Self> {
        config.validate()?;
        let geometry = KvGeometry::from_config(&config.cache);
        let mut session = Self {
            geometry,
            executor,
            pool: MemoryPool::new(config.pool.clone())?,
            graph: GraphContext::new(config.cache.graph_capacity),
            store: MemoryStore::new(),
            actors: BTreeMap::new(),
            lanes: (0..config.lanes.max_lanes).map(|i| Lane::new(LaneId::new(i))).collect(),
            config,
        };
        session.pick_actor(SYSTEM_ACTOR)?;
        info!(
            lanes = session.lanes.len(),
            lane_ctx = session.config.cache.lane_ctx,
            layers = geometry.n_layer,
            "actor session started"
        );
        Ok(session)
    }

    /// Create a session on the CPU executor.
    pub fn with_cpu(config: SessionConfig) -> Result<Self> {
        Self::new(config, Box::new(CpuExecutor::new()))
    }

    /// Session configuration.
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Cache layout shared by every lane.
    pub fn geometry(&self) -> &KvGeometry {
        &self.geometry
    }

    /// Host staging pool counters.
    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    /// Host staging pool.
    pub fn pool(&self) -> &MemoryPool {
        &self.pool
    }

    /// Stored memories.
    pub fn store(&self) -> &MemoryStore {
        &self.store
    }

    /// Look up a memory.
    pub fn memory(&self, id: MemoryId) -> Option<&ConversationMemory> {
        self.store.get(id)
    }

    /// All lanes.
    pub fn lanes(&self) -> &[Lane] {
        &self.lanes
    }

    /// One lane.
    pub fn lane(&self, id: LaneId) -> Result<&Lane> {
        self.lanes
            .get(id.value())
            .ok_or_else(|| Error::not_found(format!("{id}")))
    }

    /// Reporting view of every lane.
    pub fn lane_summaries(&self) -> Vec<LaneSummary> {
        self.lanes.iter().map(LaneSummary::from).collect()
    }

    /// A loaded actor.
    pub fn actor(&self, name: &str) -> Option<&Actor> {
        self.actors.get(name)
    }

    /// Names of loaded actors, sorted.
    pub fn actor_names(&self) -> Vec<String> {
        self.actors.keys().cloned().collect()
    }

    /// Get an actor, loading it from the configured directory or creating it
    /// empty on first use.
    pub fn pick_actor(&mut self, name: &str) -> Result<&Actor> {
        if !self.actors.contains_key(name) {
            let actor = match &self.config.actors_dir {
                Some(dir) => Actor::load(dir, name, &self.geometry, &mut self.store)?,
                None => Actor::new(name, None),
            };
            self.actors.insert(name.to_string(), actor);
        }
        self.actors
            .get(name)
            .ok_or_else(|| Error::internal(format!("actor {name} vanished after insert")))
    }

    /// Load an actor from `dir`.
    pub fn load_actor(&mut self, dir: &Path, name: &str) -> Result<&Actor> {
        if self.actors.contains_key(name) {
            return Err(Error::validation_field(
                format!("actor {name} is already loaded"),
                "name",
            ));
        }
        let actor = Actor::load(dir, name, &self.geometry, &mut self.store)?;
        Ok(self.actors.entry(name.to_string()).or_insert(actor))
    }

    /// Save an actor, release its lane and forget its memories.
    pub fn unload_actor(&mut self, name: &str) -> Result<()> {
        let actor = self
            .actors
            .get(name)
            .ok_or_else(|| Error::not_found(format!("actor {name}")))?;
        actor.save(&self.geometry, &self.store)?;
        if let Some(lane) = actor.lane {
            self.release_lane(lane)?;
        }
        if let Some(actor) = self.actors.remove(name) {
            for id in actor.all_memories() {
                self.store.remove(id);
            }
        }
        info!(actor = name, "actor unloaded");
        Ok(())
    }

    /// Save every loaded actor that has a directory.
    pub fn save_actors(&self) -> Result<()> {
        for actor in self.actors.values() {
            actor.save(&self.geometry, &self.store)?;
        }
        Ok(())
    }

    /// Append a text-only memory to an actor's recent buffer.
    pub fn record_memory(
        &mut self,
        actor: &str,
        speaker: &str,
        timestamp: &str,
        content: &str,
        n_tokens: usize,
    ) -> Result<MemoryId> {
        let owner = self
            .actors
            .get_mut(actor)
            .ok_or_else(|| Error::not_found(format!("actor {actor}")))?;
        let id = self
            .store
            .insert(ConversationMemory::plain(speaker, content, n_tokens, timestamp));
        owner.recent.push(id);
        debug!(actor, %id, n_tokens, "memory recorded");
        Ok(id)
    }

    /// Add an already materialized memory to one of an actor's lists.
    pub fn add_memory(
        &mut self,
        actor: &str,
        kind: MemoryKind,
        memory: ConversationMemory,
    ) -> Result<MemoryId> {
        if let Some(kv) = memory.snapshot() {
            if !kv.matches(&self.geometry) {
                return Err(Error::validation_field(
                    "snapshot does not match the cache geometry",
                    "memory",
                ));
            }
        }
        let owner = self
            .actors
            .get_mut(actor)
            .ok_or_else(|| Error::not_found(format!("actor {actor}")))?;
        let id = self.store.insert(memory);
        owner.memories_mut(kind).push(id);
        Ok(id)
    }

    /// Apply a candidate layout to a lane.
    ///
    /// Memories already in place stay untouched, relocatable ones are copied
    /// inside the cache in one batch, and the rest are written from their
    /// own buffers. With `finalize` the candidate becomes the committed map;
    /// otherwise it is held as pending and the next pass diffs against it.
    #[instrument(level = "debug", skip(self, candidate), fields(entries = candidate.len()))]
    pub fn usemap(
        &mut self,
        lane: LaneId,
        candidate: &[MapEntry],
        finalize: bool,
    ) -> Result<Placement> {
        self.ensure_ready(lane)?;
        let ring = self.config.cache.lane_ctx;
        placement::validate_candidate(candidate, ring)?;

        let plan = placement::plan(self.lanes[lane.value()].current_layout(), candidate);

        // Nothing is touched unless every rewrite can be served.
        for entry in &plan.rewrites {
            let memory = self
                .store
                .get(entry.memory)
                .ok_or_else(|| Error::not_found(format!("{}", entry.memory)))?;
            match memory.snapshot() {
                None => {
                    return Err(Error::cache_on_lane(
                        format!("{} is not materialized", entry.memory),
                        lane.value(),
                    ))
                }
                Some(kv) if kv.n_tokens != entry.range.len() => {
                    return Err(Error::cache_on_lane(
                        format!(
                            "{} holds {} tokens but is placed at {}",
                            entry.memory, kv.n_tokens, entry.range
                        ),
                        lane.value(),
                    ))
                }
                Some(_) => {}
            }
        }

        if let Err(e) = self.apply(lane, &plan) {
            let slot = &mut self.lanes[lane.value()];
            warn!(%lane, error = %e, "remap failed, lane content unknown");
            slot.pending = Some(Vec::new());
            slot.state = LaneState::Remapping;
            slot.mark = None;
            return Err(e);
        }

        let slot = &mut self.lanes[lane.value()];
        slot.mark = None;
        if finalize {
            slot.map = candidate.to_vec();
            slot.pending = None;
            slot.state = LaneState::Settled;
            slot.recompute_seq_start();
            let resident = slot.resident_tokens();
            if resident != slot.seq_start {
                warn!(
                    %lane,
                    resident,
                    seq_start = slot.seq_start,
                    "committed map has gaps, token count differs from last entry end"
                );
            }
        } else {
            slot.pending = Some(candidate.to_vec());
            slot.state = LaneState::Remapping;
        }

        info!(
            %lane,
            kept = plan.kept.len(),
            moved = plan.moves.len(),
            rewritten = plan.rewrites.len(),
            dropped = plan.dropped.len(),
            finalize,
            "lane remapped"
        );
        Ok(plan)
    }

    fn apply(&mut self, lane: LaneId, plan: &Placement) -> Result<()> {
        let cache = self.lanes[lane.value()]
            .cache
            .as_mut()
            .ok_or_else(|| Error::cache_on_lane("lane has no cache", lane.value()))?;

        if !plan.moves.is_empty() {
            for m in &plan.moves {
                if let Err(e) = self.graph.shuffle_kv(cache, m.from.start, m.from.end, m.delta()) {
                    self.graph.abandon(&mut self.pool);
                    return Err(e);
                }
            }
            self.graph
                .run_kv_shuffler(&mut *self.executor, &mut self.pool)?;
        }

        for entry in &plan.rewrites {
            if let Some(kv) = self.store.get(entry.memory).and_then(|m| m.snapshot()) {
                cache.write_tokens(entry.range.start, kv);
            }
        }
        if let Err(e) = cache.prefit_write(&mut *self.executor, &mut self.pool) {
            cache.discard_staged();
            return Err(e);
        }
        Ok(())
    }

    /// Bind an actor to a lane and lay out its materialized memories.
    ///
    /// Definition, persona, retrieved and recent memories are taken first,
    /// then as much of the newest history as fits while leaving
    /// `reserve_tokens` slots free. They are packed from slot 0 in the order
    /// definition, persona, retrieved, history, recent.
    #[instrument(level = "debug", skip(self))]
    pub fn useactor(&mut self, lane: LaneId, name: &str) -> Result<Placement> {
        self.lane(lane)?;
        if lane.is_system() != (name == SYSTEM_ACTOR) {
            return Err(Error::validation_field(
                format!("{SYSTEM_ACTOR} and only {SYSTEM_ACTOR} uses {}", LaneId::SYSTEM),
                "lane",
            ));
        }
        self.pick_actor(name)?;
        if let Some(bound) = self.actors.get(name).and_then(|a| a.lane) {
            if bound != lane {
                return Err(Error::validation_field(
                    format!("actor {name} is bound to {bound}"),
                    "lane",
                ));
            }
        }

        let candidate = self.select_resident(name)?;
        let plan = self.usemap(lane, &candidate, true)?;

        let previous = self.lanes[lane.value()].actor.replace(name.to_string());
        if let Some(prev) = previous.filter(|p| p != name) {
            if let Some(actor) = self.actors.get_mut(&prev) {
                actor.lane = None;
            }
            debug!(%lane, actor = %prev, "previous actor unbound");
        }
        if let Some(actor) = self.actors.get_mut(name) {
            actor.lane = Some(lane);
        }
        Ok(plan)
    }

    fn select_resident(&self, name: &str) -> Result<Vec<MapEntry>> {
        let actor = self
            .actors
            .get(name)
            .ok_or_else(|| Error::not_found(format!("actor {name}")))?;
        let budget = self
            .config
            .cache
            .lane_ctx
            .saturating_sub(self.config.lanes.reserve_tokens);
        let mut used = 0;

        let materialized = |id: &MemoryId| -> Option<usize> {
            let memory = self.store.get(*id)?;
            if !memory.is_materialized() {
                debug!(actor = name, %id, "plain memory not resident");
                return None;
            }
            Some(memory.n_tokens())
        };

        let take = |kind: MemoryKind, used: &mut usize| -> Vec<(MemoryId, usize)> {
            let mut out = Vec::new();
            for id in actor.memories(kind) {
                let Some(n) = materialized(id) else { continue };
                if *used + n > budget {
                    warn!(actor = name, %kind, %id, n, budget, "memory does not fit lane");
                    continue;
                }
                *used += n;
                out.push((*id, n));
            }
            out
        };
        let definition = take(MemoryKind::Definition, &mut used);
        let persona = take(MemoryKind::Persona, &mut used);
        let rag = take(MemoryKind::Rag, &mut used);
        let recent = take(MemoryKind::Recent, &mut used);

        let mut history = Vec::new();
        for id in actor.history.iter().rev() {
            let Some(memory) = self.store.get(*id) else { continue };
            if !memory.is_materialized() {
                continue;
            }
            let n = memory.n_tokens();
            if used + n > budget {
                break;
            }
            used += n;
            history.push((*id, n));
        }
        history.reverse();

        let mut slot = 0;
        Ok(definition
            .into_iter()
            .chain(persona)
            .chain(rag)
            .chain(history)
            .chain(recent)
            .map(|(id, n)| {
                let entry = MapEntry::new(id, TokenRange::with_len(slot, n));
                slot += n;
                entry
            })
            .collect())
    }

    /// Write freshly computed K/V content into a lane's cache.
    ///
    /// This is where decode output enters a lane; follow it with
    /// [`commit_generated`](Self::commit_generated).
    pub fn ingest_tokens(&mut self, lane: LaneId, slot: SlotIdx, kv: &KvSnapshot) -> Result<()> {
        self.ensure_ready(lane)?;
        if !kv.matches(&self.geometry) {
            return Err(Error::validation_field(
                "snapshot does not match the cache geometry",
                "kv",
            ));
        }
        let ring = self.config.cache.lane_ctx;
        if slot + kv.n_tokens > ring {
            return Err(Error::cache_on_lane(
                format!("{} outside ring of {ring}", TokenRange::with_len(slot, kv.n_tokens)),
                lane.value(),
            ));
        }
        let cache = Self::settled_cache(&mut self.lanes, lane)?;
        cache.write_tokens(slot, kv);
        if let Err(e) = cache.prefit_write(&mut *self.executor, &mut self.pool) {
            cache.discard_staged();
            return Err(e);
        }
        Ok(())
    }

    /// Turn generated cache slots `[start, end)` into an eidet appended to
    /// the lane map as its active tail.
    pub fn commit_generated(
        &mut self,
        lane: LaneId,
        start: SlotIdx,
        end: SlotIdx,
        speaker: &str,
        content: &str,
        timestamp: &str,
    ) -> Result<MemoryId> {
        let range = TokenRange::new(start, end);
        let ring = self.config.cache.lane_ctx;
        let seq_start = self.lane(lane)?.seq_start;
        if range.is_empty() || range.end > ring || range.start < seq_start {
            return Err(Error::validation_field(
                format!("generated range {range} must be non-empty, inside the ring and after slot {seq_start}"),
                "range",
            ));
        }
        let cache = Self::settled_cache(&mut self.lanes, lane)?;
        let kv = cache.read_range(&mut *self.executor, range.start, range.len())?;
        let id = self
            .store
            .insert(ConversationMemory::eidet(speaker, content, timestamp, kv));

        let slot = &mut self.lanes[lane.value()];
        slot.map.iter_mut().for_each(|e| e.active = false);
        slot.map.push(MapEntry {
            memory: id,
            range,
            active: true,
        });
        slot.seq_start = range.end;
        if let Some(actor) = slot.actor.as_ref().and_then(|a| self.actors.get_mut(a)) {
            actor.recent.push(id);
        }
        debug!(%lane, %id, %range, "generated tokens committed");
        Ok(id)
    }

    /// Snapshot a resident memory into its own buffers and drop it from the
    /// lane map.
    pub fn evict(&mut self, lane: LaneId, memory: MemoryId) -> Result<()> {
        let index = self
            .lane(lane)?
            .map
            .iter()
            .position(|e| e.memory == memory)
            .ok_or_else(|| Error::not_found(format!("{memory} on {lane}")))?;
        let range = self.lanes[lane.value()].map[index].range;

        let cache = Self::settled_cache(&mut self.lanes, lane)?;
        let kv = cache.read_range(&mut *self.executor, range.start, range.len())?;
        self.store
            .get_mut(memory)
            .ok_or_else(|| Error::not_found(format!("{memory}")))?
            .materialize(kv);

        let slot = &mut self.lanes[lane.value()];
        slot.map.remove(index);
        slot.recompute_seq_start();
        debug!(%lane, %memory, %range, "memory evicted");
        Ok(())
    }

    /// Move a resident memory forward to slot `to`, sliding whatever lies
    /// between `to` and its old start right by its length.
    ///
    /// Every affected entry keeps its cache content; the slots it would
    /// overwrite are staged through the pool first. No entry may straddle
    /// `to`, and active entries do not move.
    #[instrument(level = "debug", skip(self))]
    pub fn hoist(&mut self, lane: LaneId, memory: MemoryId, to: SlotIdx) -> Result<()> {
        let map = &self.lane(lane)?.map;
        let entry = *map
            .iter()
            .find(|e| e.memory == memory)
            .ok_or_else(|| Error::not_found(format!("{memory} on {lane}")))?;
        let range = entry.range;
        if to >= range.start {
            return Err(Error::validation_field(
                format!("{memory} at {range} cannot move forward to slot {to}"),
                "to",
            ));
        }
        let span = TokenRange::new(to, range.start);
        for other in map {
            if other.range.start < to && other.range.end > to {
                return Err(Error::validation_field(
                    format!("{} at {} straddles slot {to}", other.memory, other.range),
                    "to",
                ));
            }
            let shifted = other.memory == memory || span.contains(other.range.start);
            if shifted && other.active {
                return Err(Error::cache_on_lane(
                    format!("active {} at {} cannot move", other.memory, other.range),
                    lane.value(),
                ));
            }
        }

        let cache = Self::settled_cache(&mut self.lanes, lane)?;
        if let Err(e) = self.graph.swap_left_kv(
            &mut *self.executor,
            cache,
            &mut self.pool,
            range.start,
            range.end,
            to,
            span.start,
            span.end,
        ) {
            self.graph.abandon(&mut self.pool);
            return Err(e);
        }
        let ran = self
            .graph
            .run_kv_shuffler(&mut *self.executor, &mut self.pool);

        let slot = &mut self.lanes[lane.value()];
        slot.mark = None;
        if let Err(e) = ran {
            warn!(%lane, error = %e, "hoist failed, lane content unknown");
            slot.pending = Some(Vec::new());
            slot.state = LaneState::Remapping;
            return Err(e);
        }

        let m = range.len();
        for e in slot.map.iter_mut() {
            if e.memory == memory {
                e.range = TokenRange::with_len(to, m);
            } else if span.contains(e.range.start) {
                e.range = TokenRange::with_len(e.range.start + m, e.range.len());
            }
        }
        slot.map.sort_by_key(|e| e.range.start);
        slot.recompute_seq_start();
        debug!(%lane, %memory, from = %range, to, "memory hoisted");
        Ok(())
    }

    /// Remember the lane's committed map and token count.
    pub fn mark_rewind(&mut self, lane: LaneId) -> Result<()> {
        Self::settled_cache(&mut self.lanes, lane)?;
        let slot = &mut self.lanes[lane.value()];
        slot.mark = Some(RewindMark {
            map: slot.map.clone(),
            seq_start: slot.seq_start,
        });
        Ok(())
    }

    /// Restore the map and token count saved by
    /// [`mark_rewind`](Self::mark_rewind). The mark stays set.
    pub fn rewind_to_mark(&mut self, lane: LaneId) -> Result<()> {
        Self::settled_cache(&mut self.lanes, lane)?;
        let slot = &mut self.lanes[lane.value()];
        let mark = slot
            .mark
            .clone()
            .ok_or_else(|| Error::cache_on_lane("no rewind mark set", lane.value()))?;
        slot.map = mark.map;
        slot.seq_start = mark.seq_start;
        debug!(%lane, seq_start = slot.seq_start, "lane rewound");
        Ok(())
    }

    /// Compare every committed entry's cache content with its memory's own
    /// buffers. Returns the memories whose slots hold something else.
    pub fn verify_lane(&mut self, lane: LaneId) -> Result<Vec<MemoryId>> {
        let map = self.lane(lane)?.map.clone();
        let cache = Self::settled_cache(&mut self.lanes, lane)?;
        let mut mismatched = Vec::new();
        for entry in map {
            let Some(expected) = self.store.get(entry.memory).and_then(|m| m.snapshot()) else {
                continue;
            };
            let got = cache.read_range(&mut *self.executor, entry.range.start, entry.range.len())?;
            if &got != expected {
                warn!(%lane, memory = %entry.memory, range = %entry.range, "resident content differs");
                mismatched.push(entry.memory);
            }
        }
        Ok(mismatched)
    }

    /// Drop a lane's layout and cache, unbinding its actor.
    pub fn release_lane(&mut self, lane: LaneId) -> Result<()> {
        self.lane(lane)?;
        let slot = &mut self.lanes[lane.value()];
        if let Some(cache) = slot.cache.take() {
            cache.free(&mut *self.executor);
        }
        if let Some(actor) = slot.actor.take().and_then(|a| self.actors.get_mut(&a)) {
            actor.lane = None;
        }
        slot.map.clear();
        slot.pending = None;
        slot.mark = None;
        slot.seq_start = 0;
        slot.state = LaneState::NotReady;
        info!(%lane, "lane released");
        Ok(())
    }

    /// Save every actor and release every lane.
    pub fn shutdown(mut self) -> Result<()> {
        self.save_actors()?;
        for i in 0..self.lanes.len() {
            self.release_lane(LaneId::new(i))?;
        }
        info!("actor session stopped");
        Ok(())
    }

    fn ensure_ready(&mut self, lane: LaneId) -> Result<()> {
        self.lane(lane)?;
        let slot = &mut self.lanes[lane.value()];
        if slot.cache.is_none() {
            let cache = KvCache::new(
                &mut *self.executor,
                self.geometry,
                self.config.cache.lane_ctx,
                self.config.cache.max_buflen,
            )?;
            slot.cache = Some(cache);
            slot.state = LaneState::Settled;
            info!(%lane, slots = self.config.cache.lane_ctx, "lane ready");
        }
        Ok(())
    }

    fn settled_cache(lanes: &mut [Lane], lane: LaneId) -> Result<&mut KvCache> {
        let slot = lanes
            .get_mut(lane.value())
            .ok_or_else(|| Error::not_found(format!("{lane}")))?;
        match slot.state {
            LaneState::Settled => slot
                .cache
                .as_mut()
                .ok_or_else(|| Error::cache_on_lane("lane has no cache", lane.value())),
            LaneState::Remapping => Err(Error::cache_on_lane(
                "remap in progress",
                lane.value(),
            )),
            LaneState::NotReady => Err(Error::cache_on_lane("lane not ready", lane.value())),
        }
    }
}

impl std::fmt::Debug for ActorSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActorSession")
            .field("geometry", &self.geometry)
            .field("actors", &self.actors.keys().collect::<Vec<_>>())
            .field("lanes", &self.lanes.len())
            .field("memories", &self.store.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kvlore_core::{CacheConfig, LaneConfig, PoolConfig};
    use std::sync::Arc;

    const LANE: LaneId = LaneId(1);

    fn config(lane_ctx: usize) -> SessionConfig {
        SessionConfig {
            pool: PoolConfig::default(),
            cache: CacheConfig {
                n_layer: 2,
                n_embd_k: 4,
                n_embd_v: 3,
                elsize: 2,
                lane_ctx,
                max_buflen: 256,
                ..CacheConfig::default()
            },
            lanes: LaneConfig {
                max_lanes: 3,
                reserve_tokens: 4,
            },
            actors_dir: None,
        }
    }

    fn snapshot(geometry: &KvGeometry, n: usize, seed: u8) -> KvSnapshot {
        let fill = |len: usize, salt: u8| -> Arc<[u8]> {
            (0..len)
                .map(|i| seed.wrapping_mul(17).wrapping_add(salt).wrapping_add(i as u8))
                .collect::<Vec<_>>()
                .into()
        };
        KvSnapshot {
            n_tokens: n,
            k: (0..geometry.n_layer)
                .map(|l| fill(n * geometry.k_row_bytes(), l as u8))
                .collect(),
            v: (0..geometry.n_layer)
                .map(|l| fill(n * geometry.v_row_bytes(), 100 + l as u8))
                .collect(),
        }
    }

    fn eidet(session: &mut ActorSession, actor: &str, kind: MemoryKind, n: usize, seed: u8) -> MemoryId {
        let kv = snapshot(session.geometry(), n, seed);
        session
            .add_memory(actor, kind, ConversationMemory::eidet(actor, format!("{kind} {seed}"), "t", kv))
            .unwrap()
    }

    /// Every committed entry's cache content equals its memory's buffers.
    fn assert_resident(session: &mut ActorSession, lane: LaneId) {
        let map = session.lane(lane).unwrap().map().to_vec();
        for entry in map {
            let expected = session.memory(entry.memory).unwrap().snapshot().unwrap().clone();
            let cache = session.lanes[lane.value()].cache.as_ref().unwrap();
            let got = cache
                .read_range(&mut *session.executor, entry.range.start, entry.range.len())
                .unwrap();
            assert_eq!(got, expected, "content of {} at {}", entry.memory, entry.range);
        }
    }

    #[test]
    fn test_useactor_lays_out_in_kind_order() {
        let mut s = ActorSession::with_cpu(config(64)).unwrap();
        s.pick_actor("ada").unwrap();
        let rec = eidet(&mut s, "ada", MemoryKind::Recent, 2, 5);
        let hst = eidet(&mut s, "ada", MemoryKind::History, 3, 4);
        let def = eidet(&mut s, "ada", MemoryKind::Definition, 4, 1);
        let mem = eidet(&mut s, "ada", MemoryKind::Persona, 2, 2);

        let plan = s.useactor(LANE, "ada").unwrap();
        assert_eq!(plan.rewrites.len(), 4);

        let lane = s.lane(LANE).unwrap();
        let order: Vec<_> = lane.map().iter().map(|e| (e.memory, e.range)).collect();
        assert_eq!(
            order,
            vec![
                (def, TokenRange::new(0, 4)),
                (mem, TokenRange::new(4, 6)),
                (hst, TokenRange::new(6, 9)),
                (rec, TokenRange::new(9, 11)),
            ]
        );
        assert_eq!(lane.seq_start(), 11);
        assert_eq!(lane.actor(), Some("ada"));
        assert_eq!(s.actor("ada").unwrap().lane(), Some(LANE));
        assert_resident(&mut s, LANE);
    }

    #[test]
    fn test_history_trimmed_to_budget_newest_first() {
        // 20 slots, 4 reserved: 16 usable.
        let mut s = ActorSession::with_cpu(config(20)).unwrap();
        s.pick_actor("ada").unwrap();
        eidet(&mut s, "ada", MemoryKind::Definition, 6, 1);
        let oldest = eidet(&mut s, "ada", MemoryKind::History, 4, 2);
        let middle = eidet(&mut s, "ada", MemoryKind::History, 4, 3);
        let newest = eidet(&mut s, "ada", MemoryKind::History, 4, 4);

        s.useactor(LANE, "ada").unwrap();
        let resident: Vec<_> = s.lane(LANE).unwrap().map().iter().map(|e| e.memory).collect();
        assert!(!resident.contains(&oldest));
        assert_eq!(&resident[1..], &[middle, newest]);
        assert_eq!(s.lane(LANE).unwrap().seq_start(), 14);
    }

    #[test]
    fn test_plain_memories_are_not_resident() {
        let mut s = ActorSession::with_cpu(config(32)).unwrap();
        s.pick_actor("ada").unwrap();
        s.record_memory("ada", "bob", "t1", "hi there", 3).unwrap();
        let def = eidet(&mut s, "ada", MemoryKind::Definition, 2, 1);
        s.useactor(LANE, "ada").unwrap();
        let map = s.lane(LANE).unwrap().map().to_vec();
        assert_eq!(map.len(), 1);
        assert_eq!(map[0].memory, def);
    }

    #[test]
    fn test_usemap_finalize_conserves_tokens() {
        let mut s = ActorSession::with_cpu(config(32)).unwrap();
        s.pick_actor("ada").unwrap();
        let a = eidet(&mut s, "ada", MemoryKind::Persona, 4, 1);
        let b = eidet(&mut s, "ada", MemoryKind::Persona, 3, 2);
        let c = eidet(&mut s, "ada", MemoryKind::Persona, 5, 3);

        let spread = [
            MapEntry::new(a, TokenRange::new(0, 4)),
            MapEntry::new(b, TokenRange::new(12, 15)),
            MapEntry::new(c, TokenRange::new(20, 25)),
        ];
        s.usemap(LANE, &spread, true).unwrap();
        assert_resident(&mut s, LANE);

        let packed = [
            MapEntry::new(a, TokenRange::new(0, 4)),
            MapEntry::new(b, TokenRange::new(4, 7)),
            MapEntry::new(c, TokenRange::new(7, 12)),
        ];
        let plan = s.usemap(LANE, &packed, true).unwrap();
        assert_eq!(plan.kept, vec![a]);
        assert_eq!(plan.moves.len(), 2);
        assert!(plan.rewrites.is_empty());

        let lane = s.lane(LANE).unwrap();
        let total: usize = lane.map().iter().map(|e| e.range.len()).sum();
        assert_eq!(total, lane.seq_start());
        assert_eq!(lane.state(), LaneState::Settled);
        assert_resident(&mut s, LANE);
    }

    #[test]
    fn test_reorder_moves_and_rewrites() {
        let mut s = ActorSession::with_cpu(config(32)).unwrap();
        s.pick_actor("ada").unwrap();
        let short = eidet(&mut s, "ada", MemoryKind::Persona, 2, 1);
        let long = eidet(&mut s, "ada", MemoryKind::Persona, 8, 2);
        s.usemap(
            LANE,
            &[
                MapEntry::new(short, TokenRange::new(0, 2)),
                MapEntry::new(long, TokenRange::new(2, 10)),
            ],
            true,
        )
        .unwrap();
        let plan = s
            .usemap(
                LANE,
                &[
                    MapEntry::new(long, TokenRange::new(0, 8)),
                    MapEntry::new(short, TokenRange::new(8, 10)),
                ],
                true,
            )
            .unwrap();
        assert_eq!(plan.moves.len(), 1);
        assert_eq!(plan.rewrites.len(), 1);
        assert_resident(&mut s, LANE);
    }

    #[test]
    fn test_partial_entry_is_cache_error() {
        let mut s = ActorSession::with_cpu(config(32)).unwrap();
        s.pick_actor("ada").unwrap();
        let plain = s.record_memory("ada", "bob", "t", "hello", 2).unwrap();
        let err = s
            .usemap(LANE, &[MapEntry::new(plain, TokenRange::new(0, 2))], true)
            .unwrap_err();
        assert_eq!(err.error_code(), "CACHE_ERROR");
        assert!(s.lane(LANE).unwrap().map().is_empty());
        assert_eq!(s.lane(LANE).unwrap().state(), LaneState::Settled);
    }

    #[test]
    fn test_invalid_candidate_is_validation_error() {
        let mut s = ActorSession::with_cpu(config(16)).unwrap();
        s.pick_actor("ada").unwrap();
        let a = eidet(&mut s, "ada", MemoryKind::Persona, 4, 1);
        let err = s
            .usemap(LANE, &[MapEntry::new(a, TokenRange::new(14, 18))], true)
            .unwrap_err();
        assert_eq!(err.error_code(), "VALIDATION_ERROR");
    }

    #[test]
    fn test_non_final_pass_is_pending() {
        let mut s = ActorSession::with_cpu(config(32)).unwrap();
        s.pick_actor("ada").unwrap();
        let a = eidet(&mut s, "ada", MemoryKind::Persona, 4, 1);
        let first = [MapEntry::new(a, TokenRange::new(8, 12))];
        s.usemap(LANE, &first, false).unwrap();
        let lane = s.lane(LANE).unwrap();
        assert_eq!(lane.state(), LaneState::Remapping);
        assert!(lane.map().is_empty());
        assert_eq!(lane.seq_start(), 0);

        // The second pass diffs against the pending layout.
        let plan = s
            .usemap(LANE, &[MapEntry::new(a, TokenRange::new(0, 4))], true)
            .unwrap();
        assert_eq!(plan.moves.len(), 1);
        assert_eq!(s.lane(LANE).unwrap().seq_start(), 4);
        assert_resident(&mut s, LANE);
    }

    #[test]
    fn test_system_lane_is_reserved() {
        let mut s = ActorSession::with_cpu(config(16)).unwrap();
        assert!(s.useactor(LaneId::SYSTEM, "ada").is_err());
        assert!(s.useactor(LANE, SYSTEM_ACTOR).is_err());
        s.useactor(LaneId::SYSTEM, SYSTEM_ACTOR).unwrap();
        assert!(s.useactor(LaneId::new(9), "ada").is_err());
    }

    #[test]
    fn test_generate_commit_and_rewind() {
        let mut s = ActorSession::with_cpu(config(32)).unwrap();
        s.pick_actor("ada").unwrap();
        eidet(&mut s, "ada", MemoryKind::Definition, 4, 1);
        s.useactor(LANE, "ada").unwrap();
        s.mark_rewind(LANE).unwrap();

        let reply = snapshot(s.geometry(), 3, 9);
        s.ingest_tokens(LANE, 4, &reply).unwrap();
        let id = s.commit_generated(LANE, 4, 7, "ada", "hello", "t2").unwrap();
        assert_eq!(s.memory(id).unwrap().snapshot(), Some(&reply));
        assert_eq!(s.actor("ada").unwrap().memories(MemoryKind::Recent), &[id]);

        let lane = s.lane(LANE).unwrap();
        assert_eq!(lane.seq_start(), 7);
        assert!(lane.map().last().unwrap().active);
        assert!(s.commit_generated(LANE, 5, 8, "ada", "x", "t").is_err());

        s.rewind_to_mark(LANE).unwrap();
        assert_eq!(s.lane(LANE).unwrap().seq_start(), 4);
        assert_eq!(s.lane(LANE).unwrap().map().len(), 1);
    }

    #[test]
    fn test_evict_refreshes_buffers() {
        let mut s = ActorSession::with_cpu(config(32)).unwrap();
        s.pick_actor("ada").unwrap();
        let a = eidet(&mut s, "ada", MemoryKind::Persona, 3, 1);
        let b = eidet(&mut s, "ada", MemoryKind::Persona, 2, 2);
        s.useactor(LANE, "ada").unwrap();

        let fresh = snapshot(s.geometry(), 2, 42);
        s.ingest_tokens(LANE, 3, &fresh).unwrap();
        s.evict(LANE, b).unwrap();

        assert_eq!(s.memory(b).unwrap().snapshot(), Some(&fresh));
        let lane = s.lane(LANE).unwrap();
        assert_eq!(lane.map().len(), 1);
        assert_eq!(lane.map()[0].memory, a);
        assert_eq!(lane.seq_start(), 3);
    }

    #[test]
    fn test_hoist_slides_neighbours_right() {
        let mut s = ActorSession::with_cpu(config(32)).unwrap();
        s.pick_actor("ada").unwrap();
        let a = eidet(&mut s, "ada", MemoryKind::Persona, 4, 1);
        let b = eidet(&mut s, "ada", MemoryKind::Persona, 3, 2);
        let c = eidet(&mut s, "ada", MemoryKind::Persona, 5, 3);
        s.useactor(LANE, "ada").unwrap();

        // Longer than what it jumps over: the whole span is staged.
        s.hoist(LANE, c, 4).unwrap();
        let order: Vec<_> = s.lane(LANE).unwrap().map().iter().map(|e| (e.memory, e.range)).collect();
        assert_eq!(
            order,
            vec![
                (a, TokenRange::new(0, 4)),
                (c, TokenRange::new(4, 9)),
                (b, TokenRange::new(9, 12)),
            ]
        );
        assert_resident(&mut s, LANE);

        // Shorter than what it jumps over: part is staged, the rest slides.
        s.hoist(LANE, b, 0).unwrap();
        let order: Vec<_> = s.lane(LANE).unwrap().map().iter().map(|e| (e.memory, e.range)).collect();
        assert_eq!(
            order,
            vec![
                (b, TokenRange::new(0, 3)),
                (a, TokenRange::new(3, 7)),
                (c, TokenRange::new(7, 12)),
            ]
        );
        assert_eq!(s.lane(LANE).unwrap().seq_start(), 12);
        assert!(s.verify_lane(LANE).unwrap().is_empty());
        assert_eq!(s.pool_stats().used_blocks, 0);
    }

    #[test]
    fn test_hoist_rejects_bad_targets() {
        let mut s = ActorSession::with_cpu(config(32)).unwrap();
        s.pick_actor("ada").unwrap();
        let a = eidet(&mut s, "ada", MemoryKind::Persona, 4, 1);
        let b = eidet(&mut s, "ada", MemoryKind::Persona, 3, 2);
        s.useactor(LANE, "ada").unwrap();

        assert_eq!(s.hoist(LANE, b, 2).unwrap_err().error_code(), "VALIDATION_ERROR");
        assert_eq!(s.hoist(LANE, a, 0).unwrap_err().error_code(), "VALIDATION_ERROR");
        assert_eq!(s.hoist(LANE, b, 5).unwrap_err().error_code(), "VALIDATION_ERROR");

        s.ingest_tokens(LANE, 7, &snapshot(s.geometry(), 2, 9)).unwrap();
        let reply = s.commit_generated(LANE, 7, 9, "ada", "ok", "t").unwrap();
        assert_eq!(s.hoist(LANE, reply, 4).unwrap_err().error_code(), "CACHE_ERROR");

        // Nothing moved.
        assert_eq!(s.lane(LANE).unwrap().map()[1].range, TokenRange::new(4, 7));
        assert_resident(&mut s, LANE);
    }

    #[test]
    fn test_verify_lane_reports_overwritten_entry() {
        let mut s = ActorSession::with_cpu(config(32)).unwrap();
        s.pick_actor("ada").unwrap();
        let a = eidet(&mut s, "ada", MemoryKind::Persona, 3, 1);
        let b = eidet(&mut s, "ada", MemoryKind::Persona, 2, 2);
        s.useactor(LANE, "ada").unwrap();
        assert!(s.verify_lane(LANE).unwrap().is_empty());

        s.ingest_tokens(LANE, 3, &snapshot(s.geometry(), 2, 42)).unwrap();
        assert_eq!(s.verify_lane(LANE).unwrap(), vec![b]);
        assert!(!s.verify_lane(LANE).unwrap().contains(&a));
    }

    #[test]
    fn test_release_and_reuse_lane() {
        let mut s = ActorSession::with_cpu(config(16)).unwrap();
        s.pick_actor("ada").unwrap();
        eidet(&mut s, "ada", MemoryKind::Definition, 4, 1);
        s.useactor(LANE, "ada").unwrap();
        s.release_lane(LANE).unwrap();

        let lane = s.lane(LANE).unwrap();
        assert_eq!(lane.state(), LaneState::NotReady);
        assert!(lane.cache().is_none());
        assert!(s.actor("ada").unwrap().lane().is_none());

        s.useactor(LANE, "ada").unwrap();
        assert_eq!(s.lane(LANE).unwrap().seq_start(), 4);
        assert_resident(&mut s, LANE);
    }

    #[test]
    fn test_actor_lifecycle_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(32);
        cfg.actors_dir = Some(dir.path().to_path_buf());

        let mut s = ActorSession::with_cpu(cfg.clone()).unwrap();
        s.pick_actor("ada").unwrap();
        eidet(&mut s, "ada", MemoryKind::Definition, 3, 1);
        s.record_memory("ada", "bob", "t1", "hi", 2).unwrap();
        s.useactor(LANE, "ada").unwrap();
        assert_eq!(s.actor_names(), vec!["System".to_string(), "ada".to_string()]);

        s.unload_actor("ada").unwrap();
        assert!(s.actor("ada").is_none());
        assert_eq!(s.lane(LANE).unwrap().state(), LaneState::NotReady);
        assert!(s.store().is_empty());

        let mut again = ActorSession::with_cpu(cfg).unwrap();
        let actor = again.pick_actor("ada").unwrap();
        assert_eq!(actor.memories(MemoryKind::Definition).len(), 1);
        assert_eq!(actor.memories(MemoryKind::Recent).len(), 1);
        again.useactor(LANE, "ada").unwrap();
        assert_eq!(again.lane(LANE).unwrap().seq_start(), 3);
        assert_resident(&mut again, LANE);
        again.shutdown().unwrap();
    }

    #[test]
    fn test_staging_buffers_return_to_pool() {
        let mut s = ActorSession::with_cpu(config(64)).unwrap();
        s.pick_actor("ada").unwrap();
        for seed in 0..6 {
            eidet(&mut s, "ada", MemoryKind::History, 5, seed);
        }
        s.useactor(LANE, "ada").unwrap();
        let stats = s.pool_stats();
        assert_eq!(stats.used_blocks, 0);
        assert_eq!(stats.fallback_live, 0);
    }
}
