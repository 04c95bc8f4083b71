//! Per-lane KV cache storage and write staging.
//!
//! A [`KvCache`] owns one K and one V tensor per layer, forming a ring of
//! `size` token slots:
//!
//! - K is token-major: `[size, n_embd_k * elsize]`, one row per token.
//! - V is stored transposed: `[n_embd_v, size * elsize]`, one column band per
//!   token.
//!
//! Writes of materialized memories are staged with [`KvCache::prefit_set`]
//! and flushed by [`KvCache::prefit_write`], which merges exactly contiguous
//! staged ranges into pool buffers of at most `max_buflen` bytes so that many
//! small writes become a few large ones.

use std::sync::Arc;

use kvlore_core::{CacheConfig, KvKind, LayerIdx, Result, SlotIdx, TokenRange};
use kvlore_memory::MemoryPool;
use tracing::{debug, trace};

use crate::executor::{GraphExecutor, TensorId, TensorView};

/// Byte layout of one lane's cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KvGeometry {
    /// Number of layers.
    pub n_layer: usize,
    /// K width per token, in elements.
    pub n_embd_k: usize,
    /// V width per token, in elements.
    pub n_embd_v: usize,
    /// Bytes per element.
    pub elsize: usize,
}

impl KvGeometry {
    /// Geometry described by a cache configuration.
    pub fn from_config(config: &CacheConfig) -> Self {
        Self {
            n_layer: config.n_layer,
            n_embd_k: config.n_embd_k,
            n_embd_v: config.n_embd_v,
            elsize: config.elsize,
        }
    }

    /// Bytes of one K row (one token, one layer).
    #[inline]
    pub const fn k_row_bytes(&self) -> usize {
        self.n_embd_k * self.elsize
    }

    /// Bytes of V for one token in one layer.
    #[inline]
    pub const fn v_row_bytes(&self) -> usize {
        self.n_embd_v * self.elsize
    }

    /// Bytes per token per layer for `kind`.
    #[inline]
    pub const fn row_bytes(&self, kind: KvKind) -> usize {
        match kind {
            KvKind::K => self.k_row_bytes(),
            KvKind::V => self.v_row_bytes(),
        }
    }

    /// K bytes per token across all layers.
    #[inline]
    pub const fn k_token_bytes(&self) -> usize {
        self.n_layer * self.k_row_bytes()
    }

    /// V bytes per token across all layers.
    #[inline]
    pub const fn v_token_bytes(&self) -> usize {
        self.n_layer * self.v_row_bytes()
    }
}

/// Host copy of the K and V content of a token range.
///
/// `k[layer]` is token-major (`n_tokens` rows of `k_row_bytes`). `v[layer]`
/// follows the transposed device layout: `n_embd_v` rows of
/// `n_tokens * elsize` bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvSnapshot {
    /// Tokens covered.
    pub n_tokens: usize,
    /// K bytes per layer.
    pub k: Vec<Arc<[u8]>>,
    /// V bytes per layer.
    pub v: Vec<Arc<[u8]>>,
}

impl KvSnapshot {
    /// Whether buffer sizes match `geometry`.
    pub fn matches(&self, geometry: &KvGeometry) -> bool {
        self.k.len() == geometry.n_layer
            && self.v.len() == geometry.n_layer
            && self
                .k
                .iter()
                .all(|b| b.len() == self.n_tokens * geometry.k_row_bytes())
            && self
                .v
                .iter()
                .all(|b| b.len() == self.n_tokens * geometry.v_row_bytes())
    }
}

#[derive(Debug, Clone)]
struct StagedWrite {
    start: SlotIdx,
    len: usize,
    data: Arc<[u8]>,
}

impl StagedWrite {
    fn end(&self) -> SlotIdx {
        self.start + self.len
    }
}

/// K and V tensors of one lane, plus pending staged writes.
#[derive(Debug)]
pub struct KvCache {
    geometry: KvGeometry,
    size: usize,
    max_buflen: usize,
    k: Vec<TensorId>,
    v: Vec<TensorId>,
    pre_k: Vec<Vec<StagedWrite>>,
    pre_v: Vec<Vec<StagedWrite>>,
}

impl KvCache {
    /// Allocate K and V tensors for `size` token slots.
    pub fn new(
        executor: &mut dyn GraphExecutor,
        geometry: KvGeometry,
        size: usize,
        max_buflen: usize,
    ) -> Result<Self> {
        let mut k = Vec::with_capacity(geometry.n_layer);
        let mut v = Vec::with_capacity(geometry.n_layer);
        for _ in 0..geometry.n_layer {
            k.push(executor.alloc_tensor(size, geometry.k_row_bytes())?);
            v.push(executor.alloc_tensor(geometry.n_embd_v, size * geometry.elsize)?);
        }
        debug!(
            layers = geometry.n_layer,
            size,
            bytes = size * (geometry.k_token_bytes() + geometry.v_token_bytes()),
            "kv cache allocated"
        );
        Ok(Self {
            geometry,
            size,
            max_buflen,
            k,
            v,
            pre_k: vec![Vec::new(); geometry.n_layer],
            pre_v: vec![Vec::new(); geometry.n_layer],
        })
    }

    /// Release the tensors back to the executor.
    pub fn free(self, executor: &mut dyn GraphExecutor) {
        for id in self.k.into_iter().chain(self.v) {
            executor.free_tensor(id);
        }
    }

    /// Number of token slots.
    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Byte layout.
    #[inline]
    pub fn geometry(&self) -> &KvGeometry {
        &self.geometry
    }

    /// Cap on one coalesced write.
    #[inline]
    pub fn max_buflen(&self) -> usize {
        self.max_buflen
    }

    /// View of K rows `[start, start + len)` of `layer`.
    pub fn k_view(&self, layer: LayerIdx, start: SlotIdx, len: usize) -> TensorView {
        TensorView {
            tensor: self.k[layer],
            row0: start,
            rows: len,
            col0: 0,
            cols: self.geometry.k_row_bytes(),
        }
    }

    /// View of the V columns for tokens `[start, start + len)` of `layer`.
    pub fn v_view(&self, layer: LayerIdx, start: SlotIdx, len: usize) -> TensorView {
        let el = self.geometry.elsize;
        TensorView {
            tensor: self.v[layer],
            row0: 0,
            rows: self.geometry.n_embd_v,
            col0: start * el,
            cols: len * el,
        }
    }

    /// View of `kind` for a token range.
    pub fn view(&self, kind: KvKind, layer: LayerIdx, start: SlotIdx, len: usize) -> TensorView {
        match kind {
            KvKind::K => self.k_view(layer, start, len),
            KvKind::V => self.v_view(layer, start, len),
        }
    }

    /// Stage a write of `len` tokens at `start` for one layer.
    ///
    /// `data` uses the layout of [`KvSnapshot`] for a single layer.
    ///
    /// # Panics
    /// If the range leaves the ring, `data` has the wrong length, or the
    /// range overlaps a range already staged for this layer and kind.
    pub fn prefit_set(
        &mut self,
        kind: KvKind,
        layer: LayerIdx,
        start: SlotIdx,
        len: usize,
        data: Arc<[u8]>,
    ) {
        assert!(
            start + len <= self.size,
            "staged range [{start}, {}) outside ring of {}",
            start + len,
            self.size
        );
        let expected = len * self.geometry.row_bytes(kind);
        assert_eq!(
            data.len(),
            expected,
            "staged {kind} data for {len} tokens must be {expected} bytes"
        );
        if len == 0 {
            return;
        }

        let list = match kind {
            KvKind::K => &mut self.pre_k[layer],
            KvKind::V => &mut self.pre_v[layer],
        };
        let at = list.partition_point(|w| w.start < start);
        if let Some(prev) = at.checked_sub(1).map(|i| &list[i]) {
            if prev.end() > start {
                panic!(
                    "staged {kind} range [{start}, {}) overlaps [{}, {}) in layer {layer}",
                    start + len,
                    prev.start,
                    prev.end()
                );
            }
        }
        if let Some(next) = list.get(at) {
            if next.start < start + len {
                panic!(
                    "staged {kind} range [{start}, {}) overlaps [{}, {}) in layer {layer}",
                    start + len,
                    next.start,
                    next.end()
                );
            }
        }
        list.insert(at, StagedWrite { start, len, data });
    }

    /// Stage a whole snapshot at `slot`.
    pub fn write_tokens(&mut self, slot: SlotIdx, snapshot: &KvSnapshot) {
        for layer in 0..self.geometry.n_layer {
            self.prefit_set(KvKind::K, layer, slot, snapshot.n_tokens, snapshot.k[layer].clone());
            self.prefit_set(KvKind::V, layer, slot, snapshot.n_tokens, snapshot.v[layer].clone());
        }
    }

    /// Number of staged records across all layers.
    pub fn staged(&self) -> usize {
        self.pre_k.iter().chain(&self.pre_v).map(Vec::len).sum()
    }

    /// Drop staged writes without applying them.
    pub fn discard_staged(&mut self) {
        self.pre_k.iter_mut().chain(self.pre_v.iter_mut()).for_each(Vec::clear);
    }

    /// Flush every staged write to the device. Returns the number of device
    /// writes issued.
    pub fn prefit_write(
        &mut self,
        executor: &mut dyn GraphExecutor,
        pool: &mut MemoryPool,
    ) -> Result<usize> {
        let pre_k = std::mem::replace(&mut self.pre_k, vec![Vec::new(); self.geometry.n_layer]);
        let pre_v = std::mem::replace(&mut self.pre_v, vec![Vec::new(); self.geometry.n_layer]);

        let mut writes = 0;
        for (layer, list) in pre_k.iter().enumerate() {
            writes += self.flush_list(executor, pool, KvKind::K, layer, list)?;
        }
        for (layer, list) in pre_v.iter().enumerate() {
            writes += self.flush_list(executor, pool, KvKind::V, layer, list)?;
        }
        if writes > 0 {
            debug!(writes, "staged kv writes flushed");
        }
        Ok(writes)
    }

    fn flush_list(
        &self,
        executor: &mut dyn GraphExecutor,
        pool: &mut MemoryPool,
        kind: KvKind,
        layer: LayerIdx,
        list: &[StagedWrite],
    ) -> Result<usize> {
        let per_token = self.geometry.row_bytes(kind);
        let mut writes = 0;
        let mut run: Vec<&StagedWrite> = Vec::new();
        let mut run_start = 0;
        let mut run_len = 0;

        for w in list {
            if !run.is_empty() {
                let contiguous = w.start == run_start + run_len;
                let fits = (run_len + w.len) * per_token <= self.max_buflen;
                if !(contiguous && fits) {
                    self.write_run(executor, pool, kind, layer, &run, run_start, run_len)?;
                    writes += 1;
                    run.clear();
                }
            }
            if run.is_empty() {
                run_start = w.start;
                run_len = 0;
            }
            run.push(w);
            run_len += w.len;
        }
        if !run.is_empty() {
            self.write_run(executor, pool, kind, layer, &run, run_start, run_len)?;
            writes += 1;
        }
        Ok(writes)
    }

    #[allow(clippy::too_many_arguments)]
    fn write_run(
        &self,
        executor: &mut dyn GraphExecutor,
        pool: &mut MemoryPool,
        kind: KvKind,
        layer: LayerIdx,
        run: &[&StagedWrite],
        start: SlotIdx,
        len: usize,
    ) -> Result<()> {
        let view = self.view(kind, layer, start, len);
        if let [single] = run {
            return executor.set_tensor(&view, &single.data);
        }

        let mut buffer = pool.alloc_buffer(len * self.geometry.row_bytes(kind))?;
        let bytes = buffer.as_mut_slice();
        match kind {
            KvKind::K => {
                let mut offset = 0;
                for w in run {
                    bytes[offset..offset + w.data.len()].copy_from_slice(&w.data);
                    offset += w.data.len();
                }
            }
            KvKind::V => {
                // Interleave: channel c of the run is the concatenation of
                // channel c of every record.
                let el = self.geometry.elsize;
                let band = len * el;
                for w in run {
                    let w_band = w.len * el;
                    let at = (w.start - start) * el;
                    for c in 0..self.geometry.n_embd_v {
                        bytes[c * band + at..c * band + at + w_band]
                            .copy_from_slice(&w.data[c * w_band..(c + 1) * w_band]);
                    }
                }
            }
        }
        trace!(%kind, layer, start, len, records = run.len(), "coalesced write");
        let result = executor.set_tensor(&view, buffer.as_slice());
        pool.release_buffer(buffer);
        result
    }

    /// Copy tokens `[start, start + len)` of every layer to host memory.
    pub fn read_range(
        &self,
        executor: &mut dyn GraphExecutor,
        start: SlotIdx,
        len: usize,
    ) -> Result<KvSnapshot> {
        let range = TokenRange::with_len(start, len);
        if range.end > self.size {
            return Err(kvlore_core::Error::cache(format!(
                "read of {range} outside ring of {}",
                self.size
            )));
        }
        let mut k = Vec::with_capacity(self.geometry.n_layer);
        let mut v = Vec::with_capacity(self.geometry.n_layer);
        for layer in 0..self.geometry.n_layer {
            let mut kb = vec![0u8; len * self.geometry.k_row_bytes()];
            executor.get_tensor(&self.k_view(layer, start, len), &mut kb)?;
            k.push(Arc::from(kb));

            let mut vb = vec![0u8; len * self.geometry.v_row_bytes()];
            executor.get_tensor(&self.v_view(layer, start, len), &mut vb)?;
            v.push(Arc::from(vb));
        }
        Ok(KvSnapshot {
            n_tokens: len,
            k,
            v,
        })
    }
}
