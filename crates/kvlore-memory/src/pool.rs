//! Best-fit host memory pool.
//!
//! Requests inside the managed size range are served from blocks parked in
//! the `loose` index, best fit by size. The smallest parked block that fits is
//! taken when it is an exact fit or at least `slack` bytes larger than the
//! request. Otherwise the lookup is retried once at `size + slack`, and only
//! when nothing that large is parked does the near fit get used. Fresh memory
//! comes from the [`RawAllocator`] when no parked block fits at all.
//! Oversized blocks are split and the aligned tail is parked again.
//!
//! Released blocks are zeroed and parked. Adjacent parked blocks are never
//! coalesced, so the pool fragments over a long run.
//!
//! Requests outside the managed range go straight to the raw allocator and are
//! tracked so that [`MemoryPool::release`] can hand them back.
//!
//! Raw pointers from [`MemoryPool::alloc`] go back through the unsafe
//! [`MemoryPool::release`]. [`PoolBuffer`]s are the safe path: only
//! [`MemoryPool::release_buffer`] gives one back, consuming it, and a pool
//! dropped while buffers are still out leaks its chunks instead of freeing
//! memory they point into.
//!
//! The pool is single threaded. Every mutating operation takes `&mut self`.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::collections::HashMap;
use std::ptr::NonNull;
use std::rc::Rc;

use kvlore_core::{Error, PoolConfig, Result};
use serde::Serialize;
use tracing::{debug, trace, warn};

use crate::arena::{BlockArena, BlockHandle, BlockRecord};
use crate::dual_index::{Cursor, Dimension, DualIndex};

/// Alignment of every raw allocation.
pub const RAW_ALIGN: usize = 16;

/// Source of fresh memory for the pool.
pub trait RawAllocator {
    /// Allocate `size` zeroed bytes aligned to [`RAW_ALIGN`].
    fn raw_alloc(&mut self, size: usize) -> Result<NonNull<u8>>;

    /// Free memory returned by [`raw_alloc`](Self::raw_alloc).
    ///
    /// # Safety
    /// `ptr` must come from `raw_alloc` on this allocator with the same
    /// `size`, and must not be freed twice.
    unsafe fn raw_free(&mut self, ptr: NonNull<u8>, size: usize);
}

/// [`RawAllocator`] backed by the global allocator.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemAllocator;

impl SystemAllocator {
    fn layout(size: usize) -> Result<Layout> {
        Layout::from_size_align(size.max(1), RAW_ALIGN)
            .map_err(|_| Error::memory_allocation("invalid allocation layout", size))
    }
}

impl RawAllocator for SystemAllocator {
    fn raw_alloc(&mut self, size: usize) -> Result<NonNull<u8>> {
        let layout = Self::layout(size)?;
        // SAFETY: layout has a non-zero size.
        let ptr = unsafe { alloc_zeroed(layout) };
        NonNull::new(ptr)
            .ok_or_else(|| Error::memory_allocation("platform allocator returned null", size))
    }

    unsafe fn raw_free(&mut self, ptr: NonNull<u8>, size: usize) {
        if let Ok(layout) = Self::layout(size) {
            dealloc(ptr.as_ptr(), layout);
        }
    }
}

/// Byte buffer handed out by [`MemoryPool::alloc_buffer`].
///
/// The buffer does not free itself; return it with
/// [`MemoryPool::release_buffer`]. Its block stays reserved until then, even
/// past the end of the pool.
#[derive(Debug)]
pub struct PoolBuffer {
    ptr: NonNull<u8>,
    len: usize,
    live: Rc<()>,
}

impl PoolBuffer {
    /// Get the buffer as a slice.
    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: only `release_buffer` returns the block, and it consumes the
        // buffer. A pool dropped first leaks the chunk instead of freeing it.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    /// Get the buffer as a mutable slice.
    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: as above, and `&mut self` gives exclusive access.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }

    /// Get the length.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Check if empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Start address.
    #[inline]
    pub fn as_ptr(&self) -> NonNull<u8> {
        self.ptr
    }
}

/// Counters describing pool activity and occupancy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    /// Blocks currently handed out.
    pub used_blocks: usize,
    /// Bytes currently handed out.
    pub used_bytes: usize,
    /// Blocks parked for reuse.
    pub loose_blocks: usize,
    /// Bytes parked for reuse.
    pub loose_bytes: usize,
    /// Live allocations outside the managed range.
    pub fallback_live: usize,
    /// Backing chunks obtained from the raw allocator.
    pub chunks: usize,
    /// Bytes obtained from the raw allocator for the pool, divided by 100.
    pub total_allocated: usize,
    /// Allocations served from a parked block.
    pub reuse_hits: u64,
    /// Allocations that needed fresh memory.
    pub fresh_allocs: u64,
    /// Parked blocks split on allocation.
    pub splits: u64,
    /// Allocations delegated to the raw allocator.
    pub fallback_allocs: u64,
}

/// Outcome of a diagnostic walk.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PoolReport {
    /// Entries visited.
    pub blocks: usize,
    /// Bytes covered by the visited entries.
    pub bytes: usize,
    /// Maximal runs of address-adjacent blocks (contiguity walk only).
    pub runs: usize,
    /// Largest visited block.
    pub largest: usize,
    /// Human readable descriptions of detected defects.
    pub violations: Vec<String>,
}

impl PoolReport {
    /// Whether no defects were found.
    pub fn is_clean(&self) -> bool {
        self.violations.is_empty()
    }
}

/// Dual-indexed best-fit memory pool.
pub struct MemoryPool<A: RawAllocator = SystemAllocator> {
    config: PoolConfig,
    allocator: A,
    blocks: BlockArena,
    /// Blocks handed out, primary = address, secondary = size.
    used: DualIndex,
    /// Parked blocks, same fields; looked up by size.
    loose: DualIndex,
    /// Raw allocations backing pool blocks, released on drop.
    chunks: Vec<(NonNull<u8>, usize)>,
    /// Out-of-range allocations by address.
    fallbacks: HashMap<usize, usize>,
    /// Shared with every outstanding [`PoolBuffer`].
    live: Rc<()>,
    total_allocated: usize,
    stats: PoolStats,
}

impl MemoryPool<SystemAllocator> {
    /// Create a pool over the global allocator.
    pub fn new(config: PoolConfig) -> Result<Self> {
        Self::with_allocator(config, SystemAllocator)
    }
}

impl Default for MemoryPool<SystemAllocator> {
    fn default() -> Self {
        Self::build(PoolConfig::default(), SystemAllocator)
    }
}

impl<A: RawAllocator> MemoryPool<A> {
    /// Create a pool over a custom raw allocator.
    pub fn with_allocator(config: PoolConfig, allocator: A) -> Result<Self> {
        config.validate()?;
        Ok(Self::build(config, allocator))
    }

    fn build(config: PoolConfig, allocator: A) -> Self {
        let segment_capacity = config.segment_capacity;
        Self {
            config,
            allocator,
            blocks: BlockArena::new(),
            used: DualIndex::new(segment_capacity),
            loose: DualIndex::new(segment_capacity),
            chunks: Vec::new(),
            fallbacks: HashMap::new(),
            live: Rc::new(()),
            total_allocated: 0,
            stats: PoolStats::default(),
        }
    }

    /// Pool configuration.
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Allocate `size` zeroed bytes.
    pub fn alloc(&mut self, size: usize) -> Result<NonNull<u8>> {
        if !self.config.manages(size) {
            let ptr = self.allocator.raw_alloc(size)?;
            self.fallbacks.insert(ptr.as_ptr() as usize, size);
            self.stats.fallback_allocs += 1;
            trace!(size, "pool fallback allocation");
            return Ok(ptr);
        }

        let handle = match self.find_parked(size) {
            Some(cursor) => self.take_parked(cursor, size),
            None => self.alloc_fresh(size)?,
        };

        let record = self.record(handle);
        self.used.insert(handle, record.address, record.size);
        NonNull::new(record.address as *mut u8)
            .ok_or_else(|| Error::internal("pool block at null address"))
    }

    /// Return memory obtained from [`alloc`](Self::alloc).
    ///
    /// Pool blocks are zeroed and parked. Fallback allocations are freed.
    /// Unknown pointers are logged and ignored.
    ///
    /// # Safety
    /// Nothing may access the memory at `ptr` afterwards, and `ptr` must not
    /// be the start of a live [`PoolBuffer`]; use
    /// [`release_buffer`](Self::release_buffer) for those.
    pub unsafe fn release(&mut self, ptr: NonNull<u8>) {
        let address = ptr.as_ptr() as usize;

        if let Some(cursor) = self.used.lower_bound(Dimension::Primary, address) {
            if cursor.primary == address {
                let record = self.record(cursor.handle);
                // SAFETY: the block is tracked in `used`, so it lies inside a
                // live chunk owned by this pool, and the caller gave it up.
                unsafe { std::ptr::write_bytes(ptr.as_ptr(), 0, record.size) };
                self.used.erase(cursor.handle, record.address, record.size);
                self.loose.insert(cursor.handle, record.address, record.size);
                trace!(address, size = record.size, "block parked");
                return;
            }
        }

        if let Some(size) = self.fallbacks.remove(&address) {
            // SAFETY: address was recorded by `alloc` from this allocator.
            unsafe { self.allocator.raw_free(ptr, size) };
            return;
        }

        warn!("release of pointer {address:#x} not owned by pool ignored");
    }

    /// Allocate a byte buffer of `len` bytes.
    pub fn alloc_buffer(&mut self, len: usize) -> Result<PoolBuffer> {
        let ptr = self.alloc(len)?;
        Ok(PoolBuffer {
            ptr,
            len,
            live: Rc::clone(&self.live),
        })
    }

    /// Return a buffer to the pool.
    ///
    /// A buffer from another pool is logged and left alone.
    pub fn release_buffer(&mut self, buffer: PoolBuffer) {
        if !Rc::ptr_eq(&buffer.live, &self.live) {
            warn!(len = buffer.len, "buffer from another pool not released");
            return;
        }
        // SAFETY: the buffer came from this pool and is consumed here, so no
        // slice into the block outlives the release.
        unsafe { self.release(buffer.ptr) };
    }

    /// Buffers handed out and not yet released.
    pub fn outstanding_buffers(&self) -> usize {
        Rc::strong_count(&self.live) - 1
    }

    /// Snapshot of counters and occupancy.
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            used_blocks: self.used.len(),
            used_bytes: self.used.iter(Dimension::Primary).map(|e| e.secondary).sum(),
            loose_blocks: self.loose.len(),
            loose_bytes: self.loose.iter(Dimension::Primary).map(|e| e.secondary).sum(),
            fallback_live: self.fallbacks.len(),
            chunks: self.chunks.len(),
            total_allocated: self.total_allocated,
            ..self.stats
        }
    }

    /// The index of blocks in use.
    pub fn used(&self) -> &DualIndex {
        &self.used
    }

    /// The index of parked blocks.
    pub fn loose(&self) -> &DualIndex {
        &self.loose
    }

    /// Resolve a handle from either index.
    pub fn block(&self, handle: BlockHandle) -> Option<&BlockRecord> {
        self.blocks.get(handle)
    }

    /// Walk parked blocks in size order and check the ordering invariants of
    /// both indexes.
    pub fn report_by_size(&self) -> PoolReport {
        let mut report = PoolReport::default();
        for (name, index) in [("used", &self.used), ("loose", &self.loose)] {
            if let Err(violation) = index.check_order() {
                warn!(index = name, %violation, "pool index defect");
                report.violations.push(format!("{name}: {violation}"));
            }
        }

        let mut prev = 0;
        for entry in self.loose.iter(Dimension::Secondary) {
            if entry.secondary < prev {
                let msg = format!(
                    "loose block {:#x} of {} bytes follows a {} byte block",
                    entry.primary, entry.secondary, prev
                );
                warn!("{msg}");
                report.violations.push(msg);
            }
            prev = entry.secondary;
            report.blocks += 1;
            report.bytes += entry.secondary;
            report.largest = report.largest.max(entry.secondary);
            debug!(address = entry.primary, size = entry.secondary, "parked");
        }
        report
    }

    /// Walk every pool block in address order, counting adjacent runs and
    /// reporting overlaps.
    pub fn report_contiguous(&self) -> PoolReport {
        let mut all: Vec<(usize, usize, &'static str)> = self
            .used
            .iter(Dimension::Primary)
            .map(|e| (e.primary, e.secondary, "used"))
            .chain(
                self.loose
                    .iter(Dimension::Primary)
                    .map(|e| (e.primary, e.secondary, "loose")),
            )
            .collect();
        all.sort_unstable();

        let mut report = PoolReport::default();
        let mut prev_end: Option<usize> = None;
        for (address, size, state) in all {
            match prev_end {
                Some(end) if address < end => {
                    let msg = format!("{state} block {address:#x} overlaps previous block ending at {end:#x}");
                    warn!("{msg}");
                    report.violations.push(msg);
                }
                Some(end) if address == end => {}
                _ => report.runs += 1,
            }
            prev_end = Some(address + size);
            report.blocks += 1;
            report.bytes += size;
            report.largest = report.largest.max(size);
        }
        debug!(blocks = report.blocks, runs = report.runs, "contiguity walk");
        report
    }

    fn record(&self, handle: BlockHandle) -> BlockRecord {
        match self.blocks.get(handle) {
            Some(record) => *record,
            None => panic!("memory pool: index references dead block {handle:?}"),
        }
    }

    /// Best fit: an exact or comfortably oversized block first, a near fit
    /// only when nothing at least `size + slack` is parked.
    fn find_parked(&self, size: usize) -> Option<Cursor> {
        let slack = self.config.slack;
        let first = self.loose.lower_bound(Dimension::Secondary, size)?;
        if first.secondary == size || first.secondary >= size + slack {
            return Some(first);
        }
        self.loose
            .lower_bound(Dimension::Secondary, size + slack)
            .or(Some(first))
    }

    fn take_parked(&mut self, cursor: Cursor, size: usize) -> BlockHandle {
        let handle = cursor.handle;
        let record = self.record(handle);
        self.loose.erase(handle, record.address, record.size);
        self.stats.reuse_hits += 1;

        if record.size > size {
            let align = self.config.split_align;
            let tail_start = align_up(record.address + size, align);
            let tail_end = record.end();
            if tail_end > tail_start && tail_end - tail_start >= align {
                let tail = BlockRecord {
                    address: tail_start,
                    size: tail_end - tail_start,
                };
                let tail_handle = self.blocks.insert(tail);
                self.loose.insert(tail_handle, tail.address, tail.size);
                if let Some(block) = self.blocks.get_mut(handle) {
                    block.size = size;
                }
                self.stats.splits += 1;
                debug!(
                    address = record.address,
                    from = record.size,
                    to = size,
                    remainder = tail.size,
                    "split parked block"
                );
            }
        }
        handle
    }

    fn alloc_fresh(&mut self, size: usize) -> Result<BlockHandle> {
        let ptr = self.allocator.raw_alloc(size)?;
        self.chunks.push((ptr, size));
        self.total_allocated += size / 100;
        self.stats.fresh_allocs += 1;
        Ok(self.blocks.insert(BlockRecord {
            address: ptr.as_ptr() as usize,
            size,
        }))
    }
}

impl<A: RawAllocator> Drop for MemoryPool<A> {
    fn drop(&mut self) {
        let outstanding = self.outstanding_buffers();
        if outstanding > 0 {
            warn!(
                outstanding,
                chunks = self.chunks.len(),
                "pool dropped with live buffers, leaking its memory"
            );
            return;
        }
        for (ptr, size) in self.chunks.drain(..) {
            // SAFETY: each chunk came from `raw_alloc` with this size and is
            // freed exactly once here.
            unsafe { self.allocator.raw_free(ptr, size) };
        }
        for (address, size) in self.fallbacks.drain() {
            if let Some(ptr) = NonNull::new(address as *mut u8) {
                // SAFETY: recorded by `alloc` and not yet released.
                unsafe { self.allocator.raw_free(ptr, size) };
            }
        }
    }
}

impl<A: RawAllocator> std::fmt::Debug for MemoryPool<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryPool")
            .field("config", &self.config)
            .field("stats", &self.stats())
            .finish()
    }
}

#[inline]
const fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn used_sizes(pool: &MemoryPool) -> Vec<usize> {
        let mut sizes: Vec<_> = pool.used().iter(Dimension::Primary).map(|e| e.secondary).collect();
        sizes.sort_unstable();
        sizes
    }

    #[test]
    fn test_reuse_freed_middle_block() {
        let mut pool = MemoryPool::default();
        let a = pool.alloc(200).unwrap();
        let b = pool.alloc(300).unwrap();
        let c = pool.alloc(200).unwrap();

        unsafe { pool.release(b) };
        let d = pool.alloc(250).unwrap();
        assert_eq!(d, b);

        assert_eq!(used_sizes(&pool), vec![200, 200, 250]);
        let used: Vec<_> = pool.used().iter(Dimension::Primary).map(|e| e.primary).collect();
        for ptr in [a, c, d] {
            assert!(used.contains(&(ptr.as_ptr() as usize)));
        }

        // 300 - 250 leaves 50 bytes; aligning the tail start to 16 keeps 44.
        let loose: Vec<_> = pool.loose().iter(Dimension::Secondary).copied().collect();
        assert_eq!(loose.len(), 1);
        let tail_start = align_up(b.as_ptr() as usize + 250, 16);
        assert_eq!(loose[0].primary, tail_start);
        assert_eq!(loose[0].secondary, b.as_ptr() as usize + 300 - tail_start);
        assert_eq!(pool.stats().splits, 1);
    }

    #[test]
    fn test_split_remainder_position() {
        let mut pool = MemoryPool::default();
        let big = pool.alloc(1024).unwrap();
        unsafe { pool.release(big) };

        let small = pool.alloc(512).unwrap();
        assert_eq!(small, big);
        let rem = pool.loose().iter(Dimension::Primary).next().copied().unwrap();
        assert_eq!(rem.primary, big.as_ptr() as usize + 512);
        assert_eq!(rem.secondary, 512);
        assert_eq!(pool.block(pool.used().iter(Dimension::Primary).next().unwrap().handle).unwrap().size, 512);
    }

    #[test]
    fn test_oversized_block_preferred_over_near_fit() {
        let mut pool = MemoryPool::default();
        let p = pool.alloc(300).unwrap();
        let q = pool.alloc(500).unwrap();
        unsafe { pool.release(p) };
        unsafe { pool.release(q) };

        // 300 is a near fit for 250; 500 clears 250 + 144.
        let r = pool.alloc(250).unwrap();
        assert_eq!(r, q);

        // Only the near fit and the split tail remain; the near fit wins.
        let s = pool.alloc(250).unwrap();
        assert_eq!(s, p);
        assert_eq!(pool.stats().fresh_allocs, 2);
    }

    #[test]
    fn test_exact_fit_reuse() {
        let mut pool = MemoryPool::default();
        let p = pool.alloc(640).unwrap();
        unsafe { pool.release(p) };
        let q = pool.alloc(640).unwrap();
        assert_eq!(p, q);
        assert!(pool.loose().is_empty());
        assert_eq!(pool.stats().reuse_hits, 1);
    }

    #[test]
    fn test_release_zeroes_block() {
        let mut pool = MemoryPool::default();
        let mut buf = pool.alloc_buffer(256).unwrap();
        buf.as_mut_slice().fill(0xAB);
        let ptr = buf.as_ptr();
        pool.release_buffer(buf);

        let again = pool.alloc_buffer(256).unwrap();
        assert_eq!(again.as_ptr(), ptr);
        assert!(again.as_slice().iter().all(|&b| b == 0));
        pool.release_buffer(again);
    }

    #[test]
    fn test_live_buffer_is_never_reissued() {
        let mut pool = MemoryPool::default();
        let mut other = MemoryPool::default();
        let mut held = pool.alloc_buffer(256).unwrap();
        held.as_mut_slice().fill(0xAA);
        let address = held.as_ptr();

        assert_eq!(pool.outstanding_buffers(), 1);

        // Only the owning pool takes a buffer back; the block stays in use.
        other.release_buffer(held);
        assert_eq!(pool.used().len(), 1);
        assert!(other.used().is_empty() && other.loose().is_empty());

        let fresh = pool.alloc_buffer(256).unwrap();
        assert_ne!(fresh.as_ptr(), address);
        assert!(fresh.as_slice().iter().all(|&b| b == 0));
        pool.release_buffer(fresh);
        assert_eq!(pool.outstanding_buffers(), 0);
    }

    #[test]
    fn test_buffer_outlives_dropped_pool() {
        let mut pool = MemoryPool::default();
        let mut buf = pool.alloc_buffer(512).unwrap();
        buf.as_mut_slice().fill(7);
        drop(pool);

        buf.as_mut_slice()[511] = 9;
        assert_eq!(buf.as_slice()[0], 7);
        assert_eq!(buf.as_slice()[511], 9);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = PoolConfig {
            split_align: 0,
            ..PoolConfig::default()
        };
        let err = MemoryPool::new(config).unwrap_err();
        assert_eq!(err.error_code(), "VALIDATION_ERROR");
        assert!(MemoryPool::with_allocator(
            PoolConfig {
                segment_capacity: 1,
                ..PoolConfig::default()
            },
            SystemAllocator
        )
        .is_err());
    }

    #[test]
    fn test_fallback_outside_range() {
        let mut pool = MemoryPool::default();
        let small = pool.alloc(64).unwrap();
        let large = pool.alloc(64 * 1024).unwrap();
        assert!(pool.used().is_empty());
        assert_eq!(pool.stats().fallback_live, 2);

        unsafe { pool.release(small) };
        unsafe { pool.release(large) };
        assert_eq!(pool.stats().fallback_live, 0);
        assert!(pool.loose().is_empty());
    }

    #[test]
    fn test_release_unknown_pointer_is_ignored() {
        let mut pool = MemoryPool::default();
        let p = pool.alloc(256).unwrap();
        let inner = NonNull::new(unsafe { p.as_ptr().add(16) }).unwrap();
        unsafe { pool.release(inner) };
        assert_eq!(pool.used().len(), 1);
        unsafe { pool.release(p) };
        assert!(pool.used().is_empty());
    }

    #[test]
    fn test_total_allocated_scaled() {
        let mut pool = MemoryPool::default();
        let _ = pool.alloc(1000).unwrap();
        let _ = pool.alloc(250).unwrap();
        assert_eq!(pool.stats().total_allocated, 12);
    }

    #[test]
    fn test_random_round_trip_no_overlap() {
        let mut rng = StdRng::seed_from_u64(42);
        let mut pool = MemoryPool::new(PoolConfig {
            segment_capacity: 16,
            ..PoolConfig::default()
        })
        .unwrap();
        let mut live: Vec<(NonNull<u8>, usize)> = Vec::new();

        for _ in 0..3000 {
            if live.is_empty() || rng.gen_bool(0.55) {
                let size = rng.gen_range(128..=4096);
                let ptr = pool.alloc(size).unwrap();
                let start = ptr.as_ptr() as usize;
                for &(other, len) in &live {
                    let o = other.as_ptr() as usize;
                    assert!(start + size <= o || o + len <= start, "overlapping live blocks");
                }
                live.push((ptr, size));
            } else {
                let (ptr, _) = live.swap_remove(rng.gen_range(0..live.len()));
                unsafe { pool.release(ptr) };
            }
        }

        assert!(pool.report_by_size().is_clean());
        assert!(pool.report_contiguous().is_clean());

        for (ptr, _) in live.drain(..) {
            unsafe { pool.release(ptr) };
        }
        assert!(pool.used().is_empty());
        assert!(pool.report_contiguous().is_clean());
    }

    #[test]
    fn test_reports_do_not_mutate() {
        let mut pool = MemoryPool::default();
        let a = pool.alloc(512).unwrap();
        let _b = pool.alloc(512).unwrap();
        unsafe { pool.release(a) };
        let before = pool.stats();
        let by_size = pool.report_by_size();
        let contig = pool.report_contiguous();
        assert_eq!(pool.stats(), before);
        assert_eq!(by_size.blocks, 1);
        assert_eq!(contig.blocks, 2);
    }

    struct FailingAllocator;

    impl RawAllocator for FailingAllocator {
        fn raw_alloc(&mut self, size: usize) -> Result<NonNull<u8>> {
            Err(Error::memory_allocation("out of memory", size))
        }

        unsafe fn raw_free(&mut self, _ptr: NonNull<u8>, _size: usize) {}
    }

    #[test]
    fn test_allocation_failure_is_fatal_error() {
        let mut pool = MemoryPool::with_allocator(PoolConfig::default(), FailingAllocator).unwrap();
        let err = pool.alloc(512).unwrap_err();
        assert_eq!(err.error_code(), "MEMORY_ERROR");
        assert!(!err.is_recoverable());
    }
}
