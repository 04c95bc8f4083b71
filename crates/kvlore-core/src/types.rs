//! Core types used throughout kvlore.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Range;

/// Token ID type (vocabulary index).
pub type TokenId = u32;

/// A layer index in the model.
pub type LayerIdx = usize;

/// Index of a slot in a lane's KV ring.
pub type SlotIdx = usize;

/// Name of the pseudo-actor that owns lane 0.
pub const SYSTEM_ACTOR: &str = "System";

/// Identifier of a KV-cache lane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LaneId(pub usize);

impl LaneId {
    /// The lane reserved for the System actor.
    pub const SYSTEM: LaneId = LaneId(0);

    /// Create a lane ID.
    pub const fn new(id: usize) -> Self {
        Self(id)
    }

    /// Get the numeric value.
    pub const fn value(&self) -> usize {
        self.0
    }

    /// Whether this is the System lane.
    pub const fn is_system(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for LaneId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "lane_{}", self.0)
    }
}

impl From<usize> for LaneId {
    fn from(id: usize) -> Self {
        Self(id)
    }
}

/// A half-open range of token slots `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct TokenRange {
    /// First slot.
    pub start: SlotIdx,
    /// One past the last slot.
    pub end: SlotIdx,
}

impl TokenRange {
    /// Create a range. `end` is clamped to be at least `start`.
    pub const fn new(start: SlotIdx, end: SlotIdx) -> Self {
        let end = if end < start { start } else { end };
        Self { start, end }
    }

    /// Create a range from a start and a length.
    pub const fn with_len(start: SlotIdx, len: usize) -> Self {
        Self {
            start,
            end: start + len,
        }
    }

    /// Number of slots covered.
    pub const fn len(&self) -> usize {
        self.end - self.start
    }

    /// Whether the range covers no slots.
    pub const fn is_empty(&self) -> bool {
        self.end == self.start
    }

    /// Whether the two ranges share at least one slot.
    pub const fn overlaps(&self, other: &TokenRange) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// Number of slots shared with `other`.
    pub fn intersection_len(&self, other: &TokenRange) -> usize {
        let lo = self.start.max(other.start);
        let hi = self.end.min(other.end);
        hi.saturating_sub(lo)
    }

    /// Whether `slot` falls inside the range.
    pub const fn contains(&self, slot: SlotIdx) -> bool {
        slot >= self.start && slot < self.end
    }

    /// The same range shifted by `delta` slots.
    pub fn shifted(&self, delta: isize) -> Option<TokenRange> {
        let start = self.start.checked_add_signed(delta)?;
        let end = self.end.checked_add_signed(delta)?;
        Some(TokenRange { start, end })
    }

    /// As a std range.
    pub const fn as_range(&self) -> Range<usize> {
        self.start..self.end
    }
}

impl fmt::Display for TokenRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

impl From<Range<usize>> for TokenRange {
    fn from(r: Range<usize>) -> Self {
        TokenRange::new(r.start, r.end)
    }
}

/// Which half of the attention cache a buffer belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KvKind {
    /// Key cache, token-major rows.
    K,
    /// Value cache, stored transposed.
    V,
}

impl fmt::Display for KvKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KvKind::K => write!(f, "k"),
            KvKind::V => write!(f, "v"),
        }
    }
}
