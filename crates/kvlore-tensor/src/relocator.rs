//! Relocation of live token ranges inside a KV ring.
//!
//! A [`GraphContext`] accumulates copy operations against a [`KvCache`] and
//! runs them in one batch with [`GraphContext::run_kv_shuffler`]. Moving a
//! range onto slots that are still occupied goes through
//! [`GraphContext::swap_left_kv`], which copies the threatened bytes to pool
//! buffers before any copy that could clobber them is queued, and writes them
//! back once the graph has run.

use kvlore_core::{Error, KvKind, LayerIdx, Result, SlotIdx, TokenRange};
use kvlore_memory::{MemoryPool, PoolBuffer};
use tracing::{debug, instrument, warn};

use crate::cache::KvCache;
use crate::executor::{CopyGraph, GraphExecutor, TensorView};

/// Overlap bytes held on the host until the pending graph has run.
#[derive(Debug)]
struct StagedOverlap {
    buffer: PoolBuffer,
    /// Where the bytes go afterwards.
    target: TensorView,
}

/// Pending shuffle graph plus the staging it depends on.
#[derive(Debug)]
pub struct GraphContext {
    graph: CopyGraph,
    staged: Vec<StagedOverlap>,
}

impl GraphContext {
    /// Create a context whose graph holds at most `capacity` copies.
    pub fn new(capacity: usize) -> Self {
        Self {
            graph: CopyGraph::new(capacity),
            staged: Vec::new(),
        }
    }

    /// Queued copies.
    pub fn pending(&self) -> usize {
        self.graph.len()
    }

    /// Overlap buffers waiting for write-back.
    pub fn staged_buffers(&self) -> usize {
        self.staged.len()
    }

    /// Queue a shift of slots `[start, end)` by `delta` for every layer.
    ///
    /// `end` is clamped to the ring, and again so the shifted range stays
    /// inside it. A negative target start is clamped to slot 0 by dropping
    /// the leading tokens that would land before it; that case is logged
    /// and only the surviving tail is moved.
    #[instrument(level = "debug", skip(self, cache))]
    pub fn shuffle_kv(
        &mut self,
        cache: &KvCache,
        start: SlotIdx,
        end: SlotIdx,
        delta: isize,
    ) -> Result<()> {
        let size = cache.size();
        let mut start = start;
        let mut end = end.min(size);
        if start >= end || delta == 0 {
            return Ok(());
        }

        let mut target = start as isize + delta;
        if target < 0 {
            let skipped = target.unsigned_abs();
            warn!(
                start,
                end,
                delta,
                skipped,
                "shuffle target before slot 0, clamping"
            );
            start += skipped;
            target = 0;
            if start >= end {
                return Ok(());
            }
        }
        let target = target as usize;
        if target + (end - start) > size {
            end = start + size.saturating_sub(target);
            if start >= end {
                return Ok(());
            }
        }

        let len = end - start;
        for layer in 0..cache.geometry().n_layer {
            self.graph
                .append_copy(cache.k_view(layer, start, len), cache.k_view(layer, target, len))?;
            self.graph
                .append_copy(cache.v_view(layer, start, len), cache.v_view(layer, target, len))?;
        }
        debug!(start, end, target, "shuffle queued");
        Ok(())
    }

    /// Queue a move of `[from_st, from_en)` to `to_st` while the occupied
    /// region `[used_start, empty_start)` may overlap the destination.
    ///
    /// The overlapped part of the occupied region, clamped so it never
    /// reaches `from_st`, is read to pool buffers right away. The moving range
    /// is copied first, then the rest of the occupied region beyond the
    /// overlap slides right by the moved length. After the graph runs the
    /// staged bytes land right after the moved range, so the occupied region
    /// ends up shifted by the moved length with nothing lost.
    #[allow(clippy::too_many_arguments)]
    #[instrument(level = "debug", skip(self, executor, cache, pool))]
    pub fn swap_left_kv(
        &mut self,
        executor: &mut dyn GraphExecutor,
        cache: &KvCache,
        pool: &mut MemoryPool,
        from_st: SlotIdx,
        from_en: SlotIdx,
        to_st: SlotIdx,
        used_start: SlotIdx,
        empty_start: SlotIdx,
    ) -> Result<()> {
        let moving = TokenRange::new(from_st, from_en);
        let m = moving.len();
        if m == 0 || to_st == from_st {
            return Ok(());
        }
        let dest = TokenRange::with_len(to_st, m);
        let occupied = TokenRange::new(used_start, empty_start);
        if moving.end > cache.size() || dest.end > cache.size() {
            return Err(Error::cache(format!(
                "swap of {moving} to {dest} outside ring of {}",
                cache.size()
            )));
        }

        let ov_start = dest.start.max(occupied.start);
        let ov_end = dest.end.min(occupied.end).min(from_st);
        let overlap = ov_end.saturating_sub(ov_start);

        if overlap > 0 && occupied.end + m > cache.size() {
            return Err(Error::cache(format!(
                "displacing {occupied} by {m} leaves the ring of {}",
                cache.size()
            )));
        }

        // Read-before-write: capture what the move would overwrite.
        if overlap > 0 {
            let target = ov_start + m;
            for layer in 0..cache.geometry().n_layer {
                for kind in [KvKind::K, KvKind::V] {
                    self.stage_overlap(executor, cache, pool, kind, layer, ov_start, overlap, target)?;
                }
            }
        }

        for layer in 0..cache.geometry().n_layer {
            self.graph
                .append_copy(cache.k_view(layer, from_st, m), cache.k_view(layer, to_st, m))?;
            self.graph
                .append_copy(cache.v_view(layer, from_st, m), cache.v_view(layer, to_st, m))?;
        }

        let remnant = if overlap > 0 {
            TokenRange::new(ov_end, occupied.end)
        } else {
            TokenRange::default()
        };
        if !remnant.is_empty() {
            let len = remnant.len();
            for layer in 0..cache.geometry().n_layer {
                self.graph.append_copy(
                    cache.k_view(layer, remnant.start, len),
                    cache.k_view(layer, remnant.start + m, len),
                )?;
                self.graph.append_copy(
                    cache.v_view(layer, remnant.start, len),
                    cache.v_view(layer, remnant.start + m, len),
                )?;
            }
        }

        debug!(%moving, %dest, overlap, remnant = remnant.len(), "swap queued");
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn stage_overlap(
        &mut self,
        executor: &mut dyn GraphExecutor,
        cache: &KvCache,
        pool: &mut MemoryPool,
        kind: KvKind,
        layer: LayerIdx,
        start: SlotIdx,
        len: usize,
        target: SlotIdx,
    ) -> Result<()> {
        let source = cache.view(kind, layer, start, len);
        let mut buffer = pool.alloc_buffer(source.bytes())?;
        if let Err(e) = executor.get_tensor(&source, buffer.as_mut_slice()) {
            pool.release_buffer(buffer);
            return Err(e);
        }
        self.staged.push(StagedOverlap {
            buffer,
            target: cache.view(kind, layer, target, len),
        });
        Ok(())
    }

    /// Execute the pending graph, write back staged overlap bytes, release
    /// their buffers, and reset the graph.
    #[instrument(level = "debug", skip_all, fields(nodes = self.graph.len(), staged = self.staged.len()))]
    pub fn run_kv_shuffler(
        &mut self,
        executor: &mut dyn GraphExecutor,
        pool: &mut MemoryPool,
    ) -> Result<()> {
        let mut result = executor.execute(&self.graph);
        self.graph.clear();

        for staged in self.staged.drain(..) {
            if result.is_ok() {
                result = executor.set_tensor(&staged.target, staged.buffer.as_slice());
            }
            pool.release_buffer(staged.buffer);
        }
        result?;
        executor.synchronize()
    }

    /// [`shuffle_kv`](Self::shuffle_kv) followed by
    /// [`run_kv_shuffler`](Self::run_kv_shuffler).
    pub fn shuffle_kv_now(
        &mut self,
        executor: &mut dyn GraphExecutor,
        cache: &KvCache,
        pool: &mut MemoryPool,
        start: SlotIdx,
        end: SlotIdx,
        delta: isize,
    ) -> Result<()> {
        self.shuffle_kv(cache, start, end, delta)?;
        self.run_kv_shuffler(executor, pool)
    }

    /// [`swap_left_kv`](Self::swap_left_kv) followed by
    /// [`run_kv_shuffler`](Self::run_kv_shuffler).
    #[allow(clippy::too_many_arguments)]
    pub fn swap_left_kv_now(
        &mut self,
        executor: &mut dyn GraphExecutor,
        cache: &KvCache,
        pool: &mut MemoryPool,
        from_st: SlotIdx,
        from_en: SlotIdx,
        to_st: SlotIdx,
        used_start: SlotIdx,
        empty_start: SlotIdx,
    ) -> Result<()> {
        self.swap_left_kv(
            executor, cache, pool, from_st, from_en, to_st, used_start, empty_start,
        )?;
        self.run_kv_shuffler(executor, pool)
    }

    /// Drop queued copies and staged buffers without running them.
    pub fn abandon(&mut self, pool: &mut MemoryPool) {
        self.graph.clear();
        for staged in self.staged.drain(..) {
            pool.release_buffer(staged.buffer);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::tests::{pattern, GEOMETRY};
    use crate::cache::{KvCache, KvSnapshot};
    use crate::cpu::CpuExecutor;
    use kvlore_core::PoolConfig;

    struct Fixture {
        exec: CpuExecutor,
        pool: MemoryPool,
        cache: KvCache,
        ctx: GraphContext,
    }

    impl Fixture {
        fn new(size: usize) -> Self {
            let mut exec = CpuExecutor::new();
            let cache = KvCache::new(&mut exec, GEOMETRY, size, 4096).unwrap();
            Self {
                exec,
                pool: MemoryPool::new(PoolConfig::default()).unwrap(),
                cache,
                ctx: GraphContext::new(64),
            }
        }

        fn put(&mut self, slot: usize, snap: &KvSnapshot) {
            self.cache.write_tokens(slot, snap);
            self.cache.prefit_write(&mut self.exec, &mut self.pool).unwrap();
        }

        fn read(&mut self, slot: usize, len: usize) -> KvSnapshot {
            self.cache.read_range(&mut self.exec, slot, len).unwrap()
        }
    }

    /// Sub-range of a snapshot, token offsets `[from, from + len)`.
    fn sub(snap: &KvSnapshot, from: usize, len: usize) -> KvSnapshot {
        let k_row = GEOMETRY.k_row_bytes();
        let el = GEOMETRY.elsize;
        let band = snap.n_tokens * el;
        KvSnapshot {
            n_tokens: len,
            k: snap
                .k
                .iter()
                .map(|b| b[from * k_row..(from + len) * k_row].into())
                .collect(),
            v: snap
                .v
                .iter()
                .map(|b| {
                    (0..GEOMETRY.n_embd_v)
                        .flat_map(|c| b[c * band + from * el..c * band + (from + len) * el].iter().copied())
                        .collect::<Vec<u8>>()
                        .into()
                })
                .collect(),
        }
    }

    #[test]
    fn test_shuffle_left_into_gap() {
        // 16-slot ring, 2 layers, data at [0,4) and [10,14).
        let mut f = Fixture::new(16);
        let first = pattern(&GEOMETRY, 4, 1);
        let second = pattern(&GEOMETRY, 4, 2);
        f.put(0, &first);
        f.put(10, &second);

        f.ctx.shuffle_kv(&f.cache, 10, 14, -6).unwrap();
        assert_eq!(f.ctx.pending(), 4);
        f.ctx.run_kv_shuffler(&mut f.exec, &mut f.pool).unwrap();
        assert_eq!(f.ctx.pending(), 0);

        assert_eq!(f.read(0, 4), first);
        assert_eq!(f.read(4, 4), second);
    }

    #[test]
    fn test_shuffle_right_non_overlapping() {
        let mut f = Fixture::new(16);
        let data = pattern(&GEOMETRY, 3, 5);
        f.put(1, &data);
        f.ctx
            .shuffle_kv_now(&mut f.exec, &f.cache, &mut f.pool, 1, 4, 8)
            .unwrap();
        assert_eq!(f.read(9, 3), data);
    }

    #[test]
    fn test_shuffle_clamps_end_to_ring() {
        let mut f = Fixture::new(16);
        let data = pattern(&GEOMETRY, 4, 6);
        f.put(8, &data);
        // [8,12) + 6 would end at 18; only two tokens fit.
        f.ctx
            .shuffle_kv_now(&mut f.exec, &f.cache, &mut f.pool, 8, 12, 6)
            .unwrap();
        assert_eq!(f.read(14, 2), sub(&data, 0, 2));
    }

    #[test]
    fn test_shuffle_negative_target_is_clamped() {
        let mut f = Fixture::new(16);
        let data = pattern(&GEOMETRY, 4, 7);
        f.put(2, &data);
        // Target would be -2: the first two tokens are dropped.
        f.ctx
            .shuffle_kv_now(&mut f.exec, &f.cache, &mut f.pool, 2, 6, -4)
            .unwrap();
        assert_eq!(f.read(0, 2), sub(&data, 2, 2));
    }

    #[test]
    fn test_swap_left_preserves_both_ranges() {
        let mut f = Fixture::new(16);
        let resident = pattern(&GEOMETRY, 6, 3);
        let young = pattern(&GEOMETRY, 3, 4);
        f.put(0, &resident);
        f.put(10, &young);

        f.ctx
            .swap_left_kv(&mut f.exec, &f.cache, &mut f.pool, 10, 13, 2, 0, 6)
            .unwrap();
        // K and V for each of 2 layers.
        assert_eq!(f.ctx.staged_buffers(), 4);
        f.ctx.run_kv_shuffler(&mut f.exec, &mut f.pool).unwrap();
        assert_eq!(f.ctx.staged_buffers(), 0);

        assert_eq!(f.read(0, 2), sub(&resident, 0, 2));
        assert_eq!(f.read(2, 3), young);
        assert_eq!(f.read(5, 4), sub(&resident, 2, 4));
        assert!(f.pool.used().is_empty());
    }

    #[test]
    fn test_swap_left_remnant_crossing_source() {
        // The displaced tail slides onto the moving range's old slots.
        let mut f = Fixture::new(16);
        let resident = pattern(&GEOMETRY, 8, 11);
        let young = pattern(&GEOMETRY, 4, 12);
        f.put(0, &resident);
        f.put(8, &young);

        f.ctx
            .swap_left_kv_now(&mut f.exec, &f.cache, &mut f.pool, 8, 12, 1, 0, 8)
            .unwrap();

        assert_eq!(f.read(0, 1), sub(&resident, 0, 1));
        assert_eq!(f.read(1, 4), young);
        assert_eq!(f.read(5, 7), sub(&resident, 1, 7));
    }

    #[test]
    fn test_swap_left_without_overlap_is_plain_move() {
        let mut f = Fixture::new(16);
        let resident = pattern(&GEOMETRY, 2, 1);
        let young = pattern(&GEOMETRY, 3, 2);
        f.put(0, &resident);
        f.put(10, &young);

        f.ctx
            .swap_left_kv_now(&mut f.exec, &f.cache, &mut f.pool, 10, 13, 4, 0, 2)
            .unwrap();
        assert_eq!(f.read(0, 2), resident);
        assert_eq!(f.read(4, 3), young);
    }

    #[test]
    fn test_swap_left_rejects_displacement_past_ring() {
        let mut f = Fixture::new(8);
        let err = f
            .ctx
            .swap_left_kv(&mut f.exec, &f.cache, &mut f.pool, 6, 8, 0, 0, 7)
            .unwrap_err();
        assert_eq!(err.error_code(), "CACHE_ERROR");
        assert_eq!(f.ctx.staged_buffers(), 0);
    }

    #[test]
    fn test_graph_capacity_exceeded() {
        let mut exec = CpuExecutor::new();
        let cache = KvCache::new(&mut exec, GEOMETRY, 16, 4096).unwrap();
        let mut ctx = GraphContext::new(6);
        ctx.shuffle_kv(&cache, 0, 2, 4).unwrap();
        assert!(ctx.shuffle_kv(&cache, 8, 10, 2).is_err());
    }
}
