//! Per-lane cache bookkeeping.

use kvlore_core::{LaneId, SlotIdx, TokenRange};
use kvlore_tensor::KvCache;
use serde::Serialize;

use crate::memory::MemoryId;

/// One resident memory and the slots it occupies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapEntry {
    /// The memory whose K/V content is resident.
    pub memory: MemoryId,
    /// Slots it occupies.
    pub range: TokenRange,
    /// Tail currently generated into; never relocated.
    pub active: bool,
}

impl MapEntry {
    /// A resident, inactive entry.
    pub fn new(memory: MemoryId, range: TokenRange) -> Self {
        Self {
            memory,
            range,
            active: false,
        }
    }
}

/// Where a lane is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LaneState {
    /// No cache allocated yet.
    NotReady,
    /// Cache content matches the committed map.
    Settled,
    /// A non-final remap pass has been applied; the pending map describes
    /// the cache content.
    Remapping,
}

impl LaneState {
    /// Whether the lane has a cache.
    pub fn is_ready(&self) -> bool {
        !matches!(self, LaneState::NotReady)
    }
}

#[derive(Debug, Clone)]
pub(crate) struct RewindMark {
    pub(crate) map: Vec<MapEntry>,
    pub(crate) seq_start: SlotIdx,
}

/// A KV cache ring and the layout of what it holds.
#[derive(Debug)]
pub struct Lane {
    pub(crate) id: LaneId,
    pub(crate) state: LaneState,
    pub(crate) actor: Option<String>,
    pub(crate) cache: Option<KvCache>,
    pub(crate) map: Vec<MapEntry>,
    pub(crate) pending: Option<Vec<MapEntry>>,
    pub(crate) seq_start: SlotIdx,
    pub(crate) mark: Option<RewindMark>,
}

impl Lane {
    pub(crate) fn new(id: LaneId) -> Self {
        Self {
            id,
            state: LaneState::NotReady,
            actor: None,
            cache: None,
            map: Vec::new(),
            pending: None,
            seq_start: 0,
            mark: None,
        }
    }

    /// Lane id.
    pub fn id(&self) -> LaneId {
        self.id
    }

    /// Lifecycle state.
    pub fn state(&self) -> LaneState {
        self.state
    }

    /// Bound actor, if any.
    pub fn actor(&self) -> Option<&str> {
        self.actor.as_deref()
    }

    /// Committed layout.
    pub fn map(&self) -> &[MapEntry] {
        &self.map
    }

    /// Layout applied by a non-final pass, if one is in progress.
    pub fn pending(&self) -> Option<&[MapEntry]> {
        self.pending.as_deref()
    }

    /// Layout the cache currently holds.
    pub fn current_layout(&self) -> &[MapEntry] {
        self.pending.as_deref().unwrap_or(&self.map)
    }

    /// Committed token count: one past the last committed entry.
    pub fn seq_start(&self) -> SlotIdx {
        self.seq_start
    }

    /// Whether a rewind mark is set.
    pub fn has_mark(&self) -> bool {
        self.mark.is_some()
    }

    /// Cache, once allocated.
    pub fn cache(&self) -> Option<&KvCache> {
        self.cache.as_ref()
    }

    /// Entry holding `memory` in the committed map.
    pub fn entry(&self, memory: MemoryId) -> Option<&MapEntry> {
        self.map.iter().find(|e| e.memory == memory)
    }

    /// Sum of committed entry lengths.
    pub fn resident_tokens(&self) -> usize {
        self.map.iter().map(|e| e.range.len()).sum()
    }

    pub(crate) fn recompute_seq_start(&mut self) {
        self.seq_start = self.map.last().map_or(0, |e| e.range.end);
    }
}

/// Summary of one lane, for reporting.
#[derive(Debug, Clone, Serialize)]
pub struct LaneSummary {
    /// Lane number.
    pub lane: usize,
    /// Lifecycle state.
    pub state: LaneState,
    /// Bound actor.
    pub actor: Option<String>,
    /// Committed entries.
    pub entries: usize,
    /// Committed token count.
    pub seq_start: SlotIdx,
    /// Sum of committed entry lengths.
    pub resident_tokens: usize,
}

impl From<&Lane> for LaneSummary {
    fn from(lane: &Lane) -> Self {
        Self {
            lane: lane.id.value(),
            state: lane.state,
            actor: lane.actor.clone(),
            entries: lane.map.len(),
            seq_start: lane.seq_start,
            resident_tokens: lane.resident_tokens(),
        }
    }
}
