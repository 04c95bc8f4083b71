//! Layout diffing for lane remaps.
//!
//! [`plan`] compares the layout a cache currently holds with a candidate
//! layout and decides, per candidate entry, whether its content is already
//! in place, can be relocated with a cache-to-cache copy, or has to be
//! written again from the memory's own buffers.
//!
//! Relocations are chosen so that, executed in order, no copy overwrites a
//! range another relocation still has to read:
//!
//! 1. A movable entry whose destination touches no old range but its own
//!    always moves.
//! 2. Otherwise it moves only if its length outweighs the resident content it
//!    would overwrite. Overwritten entries are superseded and rewritten
//!    instead. An entry whose destination covers the source of a relocation
//!    already chosen does not move, and neither does one whose own source
//!    was superseded.

use std::collections::{HashMap, HashSet};

use kvlore_core::{Error, Result, TokenRange};

use crate::lane::MapEntry;
use crate::memory::MemoryId;

/// A cache-to-cache copy of one memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Relocation {
    /// Memory being moved.
    pub memory: MemoryId,
    /// Current slots.
    pub from: TokenRange,
    /// New slots, same length.
    pub to: TokenRange,
}

impl Relocation {
    /// Signed slot offset.
    pub fn delta(&self) -> isize {
        self.to.start as isize - self.from.start as isize
    }
}

/// Outcome of diffing two layouts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Placement {
    /// Already at the right slots.
    pub kept: Vec<MemoryId>,
    /// Copied inside the cache, in execution order.
    pub moves: Vec<Relocation>,
    /// Written from the memory's buffers.
    pub rewrites: Vec<MapEntry>,
    /// Resident memories whose slots a relocation takes over.
    pub superseded: Vec<MemoryId>,
    /// Resident memories absent from the candidate.
    pub dropped: Vec<MemoryId>,
}

impl Placement {
    /// Tokens that avoid a rewrite.
    pub fn tokens_preserved(&self) -> usize {
        self.moves.iter().map(|m| m.to.len()).sum()
    }

    /// Tokens written from host buffers.
    pub fn tokens_rewritten(&self) -> usize {
        self.rewrites.iter().map(|e| e.range.len()).sum()
    }
}

/// Check a candidate layout against a ring of `ring` slots.
///
/// Entries must be sorted by start, pairwise disjoint, inside the ring, and
/// reference each memory at most once.
pub fn validate_candidate(candidate: &[MapEntry], ring: usize) -> Result<()> {
    let mut seen = HashSet::with_capacity(candidate.len());
    for (i, entry) in candidate.iter().enumerate() {
        if entry.range.end > ring {
            return Err(Error::validation_field(
                format!("entry {i} at {} outside ring of {ring}", entry.range),
                "candidate",
            ));
        }
        if let Some(prev) = i.checked_sub(1).map(|p| &candidate[p]) {
            if entry.range.start < prev.range.end {
                return Err(Error::validation_field(
                    format!(
                        "entry {i} at {} is unsorted or overlaps {}",
                        entry.range, prev.range
                    ),
                    "candidate",
                ));
            }
        }
        if !seen.insert(entry.memory) {
            return Err(Error::validation_field(
                format!("{} appears more than once", entry.memory),
                "candidate",
            ));
        }
    }
    Ok(())
}

/// Diff `previous` against `candidate`.
///
/// Both layouts are assumed valid (see [`validate_candidate`]).
pub fn plan(previous: &[MapEntry], candidate: &[MapEntry]) -> Placement {
    let old: HashMap<MemoryId, &MapEntry> = previous.iter().map(|e| (e.memory, e)).collect();
    let wanted: HashSet<MemoryId> = candidate.iter().map(|e| e.memory).collect();

    let mut placement = Placement {
        dropped: previous
            .iter()
            .filter(|e| !wanted.contains(&e.memory))
            .map(|e| e.memory)
            .collect(),
        ..Placement::default()
    };

    let mut movable = Vec::new();
    for entry in candidate {
        match old.get(&entry.memory) {
            Some(prev) if prev.range == entry.range => placement.kept.push(entry.memory),
            Some(prev)
                if prev.range.len() == entry.range.len() && !prev.active && !entry.active =>
            {
                movable.push((*entry, prev.range));
            }
            _ => placement.rewrites.push(*entry),
        }
    }

    // First pass: destinations clear of every other resident range.
    let mut moving: HashSet<MemoryId> = HashSet::new();
    let mut contested = Vec::new();
    for (entry, from) in movable {
        let clear = previous
            .iter()
            .all(|p| p.memory == entry.memory || !p.range.overlaps(&entry.range));
        if clear {
            moving.insert(entry.memory);
            placement.moves.push(Relocation {
                memory: entry.memory,
                from,
                to: entry.range,
            });
        } else {
            contested.push((entry, from));
        }
    }

    // Second pass: move over resident content when it preserves more than
    // it costs.
    let mut superseded: HashSet<MemoryId> = HashSet::new();
    for (entry, from) in contested {
        if superseded.contains(&entry.memory) {
            placement.rewrites.push(entry);
            continue;
        }
        let overlapped: Vec<&MapEntry> = previous
            .iter()
            .filter(|p| p.memory != entry.memory && p.range.overlaps(&entry.range))
            .collect();
        if overlapped.iter().any(|p| moving.contains(&p.memory)) {
            placement.rewrites.push(entry);
            continue;
        }
        let cost: usize = overlapped
            .iter()
            .filter(|p| wanted.contains(&p.memory) && !superseded.contains(&p.memory))
            .map(|p| p.range.len())
            .sum();
        if entry.range.len() > cost {
            for p in overlapped {
                if wanted.contains(&p.memory) && superseded.insert(p.memory) {
                    placement.superseded.push(p.memory);
                }
            }
            moving.insert(entry.memory);
            placement.moves.push(Relocation {
                memory: entry.memory,
                from,
                to: entry.range,
            });
        } else {
            placement.rewrites.push(entry);
        }
    }

    placement.rewrites.sort_by_key(|e| e.range.start);
    placement
}
