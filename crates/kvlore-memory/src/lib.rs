//! # kvlore Memory
//!
//! Host memory management for kvlore:
//!
//! - [`SegmentChain`]: a sorted virtual array built from fixed-capacity segments
//! - [`DualIndex`]: two chains over the same records, sorted by two fields
//! - [`BlockArena`]: generation-checked storage for block records
//! - [`MemoryPool`]: best-fit allocator with slack, split on allocate and no
//!   coalescing on release
//!
//! Every host staging buffer used by the KV relocator comes from a
//! [`MemoryPool`] owned by the session.

#![warn(missing_docs)]

pub mod arena;
pub mod dual_index;
pub mod pool;
pub mod segment;

pub use arena::{BlockArena, BlockHandle, BlockRecord};
pub use dual_index::{Cursor, Dimension, DualIndex, IndexEntry, IndexViolation};
pub use pool::{
    MemoryPool, PoolBuffer, PoolReport, PoolStats, RawAllocator, SystemAllocator, RAW_ALIGN,
};
pub use segment::{SegmentChain, SlotPos};
