//! Two parallel sorted chains over the same set of block records.
//!
//! A [`DualIndex`] keeps one [`SegmentChain`] ordered by the primary field
//! (address, for the pool) and one ordered by the secondary field (size).
//! Each chain orders entries by a compound key `(field, other field, handle)`,
//! so every record has a single well-defined position in both chains. Bounds
//! follow the usual convention: `lower_bound` finds the leftmost entry whose
//! field is `>= value`, `upper_bound` the first entry whose field is `> value`.
//!
//! Searches are two-level: a binary search over segments by their last key,
//! then a binary search inside the chosen segment.

use std::cmp::Ordering;

use crate::arena::BlockHandle;
use crate::segment::SegmentChain;

/// Which chain to search.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Dimension {
    /// Chain ordered by the primary field.
    Primary,
    /// Chain ordered by the secondary field.
    Secondary,
}

impl Dimension {
    const fn slot(self) -> usize {
        match self {
            Dimension::Primary => 0,
            Dimension::Secondary => 1,
        }
    }
}

/// One record as stored in both chains.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexEntry {
    /// Record this entry stands for.
    pub handle: BlockHandle,
    /// Primary sort field.
    pub primary: usize,
    /// Secondary sort field.
    pub secondary: usize,
}

impl IndexEntry {
    /// Value of the field `dim` sorts by.
    #[inline]
    pub const fn field(&self, dim: Dimension) -> usize {
        match dim {
            Dimension::Primary => self.primary,
            Dimension::Secondary => self.secondary,
        }
    }

    #[inline]
    fn key(&self, dim: Dimension) -> (usize, usize, BlockHandle) {
        match dim {
            Dimension::Primary => (self.primary, self.secondary, self.handle),
            Dimension::Secondary => (self.secondary, self.primary, self.handle),
        }
    }
}

/// Result of a bound search.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cursor {
    /// Record found.
    pub handle: BlockHandle,
    /// Its primary field.
    pub primary: usize,
    /// Its secondary field.
    pub secondary: usize,
    /// Logical index in the searched chain.
    pub index: usize,
    /// Segment ordinal holding it.
    pub segment: usize,
    /// Offset inside that segment.
    pub slot: usize,
}

/// Ordering defect reported by [`DualIndex::check_order`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IndexViolation {
    /// Two neighbours in a chain are out of order.
    #[error("{dimension:?} chain out of order at index {index}")]
    OutOfOrder {
        /// Chain with the defect.
        dimension: Dimension,
        /// Index of the second element of the pair.
        index: usize,
    },
    /// Chain lengths disagree with the entry count.
    #[error("count mismatch: count {count}, primary {primary}, secondary {secondary}")]
    CountMismatch {
        /// Recorded entry count.
        count: usize,
        /// Primary chain length.
        primary: usize,
        /// Secondary chain length.
        secondary: usize,
    },
}

/// Entries sorted on two fields at once.
#[derive(Debug)]
pub struct DualIndex {
    count: usize,
    chains: [SegmentChain<IndexEntry>; 2],
}

impl DualIndex {
    /// Create an empty index with `segment_capacity` slots per segment.
    pub fn new(segment_capacity: usize) -> Self {
        Self {
            count: 0,
            chains: [
                SegmentChain::new(segment_capacity),
                SegmentChain::new(segment_capacity),
            ],
        }
    }

    /// Number of entries.
    #[inline]
    pub fn len(&self) -> usize {
        self.count
    }

    /// Whether the index is empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// The chain for a dimension.
    #[inline]
    pub fn chain(&self, dim: Dimension) -> &SegmentChain<IndexEntry> {
        &self.chains[dim.slot()]
    }

    /// In-order entries of one chain.
    pub fn iter(&self, dim: Dimension) -> impl Iterator<Item = &IndexEntry> + '_ {
        self.chain(dim).iter()
    }

    /// Leftmost entry whose `dim` field is `>= value`.
    pub fn lower_bound(&self, dim: Dimension, value: usize) -> Option<Cursor> {
        self.partition(dim, |e| e.field(dim) < value)
    }

    /// First entry whose `dim` field is `> value`.
    pub fn upper_bound(&self, dim: Dimension, value: usize) -> Option<Cursor> {
        self.partition(dim, |e| e.field(dim) <= value)
    }

    /// Insert a record into both chains.
    pub fn insert(&mut self, handle: BlockHandle, primary: usize, secondary: usize) {
        let entry = IndexEntry {
            handle,
            primary,
            secondary,
        };
        for dim in [Dimension::Primary, Dimension::Secondary] {
            let key = entry.key(dim);
            let index = self.partition_index(dim, |e| e.key(dim) < key);
            self.chains[dim.slot()].insert_at(index, entry);
        }
        self.count += 1;
    }

    /// Remove a record from both chains.
    ///
    /// # Panics
    /// If either chain does not hold exactly this entry. The two chains must
    /// always agree, so a miss means the index is corrupt.
    pub fn erase(&mut self, handle: BlockHandle, primary: usize, secondary: usize) {
        let entry = IndexEntry {
            handle,
            primary,
            secondary,
        };
        for dim in [Dimension::Primary, Dimension::Secondary] {
            let key = entry.key(dim);
            let index = self.partition_index(dim, |e| e.key(dim) < key);
            let chain = &mut self.chains[dim.slot()];
            match chain.get(index) {
                Some(found) if *found == entry => {
                    chain.remove_at(index);
                }
                Some(found) => panic!(
                    "dual index corrupt: erase {entry:?} in {dim:?} chain found {found:?} at {index}"
                ),
                None => panic!("dual index corrupt: erase {entry:?} missing from {dim:?} chain"),
            }
        }
        self.count -= 1;
    }

    /// Whether an exact entry is present in the primary chain.
    pub fn contains(&self, handle: BlockHandle, primary: usize, secondary: usize) -> bool {
        let entry = IndexEntry {
            handle,
            primary,
            secondary,
        };
        let key = entry.key(Dimension::Primary);
        let index = self.partition_index(Dimension::Primary, |e| e.key(Dimension::Primary) < key);
        self.chain(Dimension::Primary).get(index) == Some(&entry)
    }

    /// Walk both chains and report the first ordering or count defect.
    pub fn check_order(&self) -> Result<(), IndexViolation> {
        let primary = self.chains[0].len();
        let secondary = self.chains[1].len();
        if primary != self.count || secondary != self.count {
            return Err(IndexViolation::CountMismatch {
                count: self.count,
                primary,
                secondary,
            });
        }
        for dim in [Dimension::Primary, Dimension::Secondary] {
            let mut prev: Option<&IndexEntry> = None;
            for (index, entry) in self.iter(dim).enumerate() {
                if let Some(p) = prev {
                    if p.key(dim).cmp(&entry.key(dim)) != Ordering::Less {
                        return Err(IndexViolation::OutOfOrder {
                            dimension: dim,
                            index,
                        });
                    }
                }
                prev = Some(entry);
            }
        }
        Ok(())
    }

    fn partition<P>(&self, dim: Dimension, pred: P) -> Option<Cursor>
    where
        P: Fn(&IndexEntry) -> bool,
    {
        let chain = self.chain(dim);
        let (segment, slot) = self.partition_pos(dim, &pred)?;
        let entry = chain.segment(segment)[slot];
        Some(Cursor {
            handle: entry.handle,
            primary: entry.primary,
            secondary: entry.secondary,
            index: chain.segment_start(segment) + slot,
            segment,
            slot,
        })
    }

    fn partition_index<P>(&self, dim: Dimension, pred: P) -> usize
    where
        P: Fn(&IndexEntry) -> bool,
    {
        match self.partition_pos(dim, &pred) {
            Some((segment, slot)) => self.chain(dim).segment_start(segment) + slot,
            None => self.chain(dim).len(),
        }
    }

    /// First `(segment, slot)` whose entry fails `pred`, given that `pred`
    /// holds for a prefix of the chain. `None` when it holds everywhere.
    fn partition_pos<P>(&self, dim: Dimension, pred: &P) -> Option<(usize, usize)>
    where
        P: Fn(&IndexEntry) -> bool,
    {
        let chain = self.chain(dim);
        let (mut lo, mut hi) = (0, chain.segment_count());
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            match chain.segment(mid).last() {
                Some(last) if pred(last) => lo = mid + 1,
                _ => hi = mid,
            }
        }
        if lo == chain.segment_count() {
            return None;
        }
        let items = chain.segment(lo);
        let slot = items.partition_point(|e| pred(e));
        if slot == items.len() {
            return None;
        }
        Some((lo, slot))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::{BlockArena, BlockRecord};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn fill(arena: &mut BlockArena, index: &mut DualIndex, records: &[(usize, usize)]) -> Vec<BlockHandle> {
        records
            .iter()
            .map(|&(address, size)| {
                let h = arena.insert(BlockRecord { address, size });
                index.insert(h, address, size);
                h
            })
            .collect()
    }

    #[test]
    fn test_bounds_on_duplicates() {
        let mut arena = BlockArena::new();
        let mut index = DualIndex::new(4);
        fill(
            &mut arena,
            &mut index,
            &[(0x100, 200), (0x400, 300), (0x200, 300), (0x800, 300), (0x900, 500)],
        );

        let lb = index.lower_bound(Dimension::Secondary, 300).unwrap();
        assert_eq!(lb.index, 1);
        assert_eq!(lb.primary, 0x200);

        let ub = index.upper_bound(Dimension::Secondary, 300).unwrap();
        assert_eq!(ub.index, 4);
        assert_eq!(ub.secondary, 500);

        assert!(index.lower_bound(Dimension::Secondary, 501).is_none());
        assert!(index.upper_bound(Dimension::Secondary, 500).is_none());
        assert_eq!(index.lower_bound(Dimension::Primary, 0x201).unwrap().primary, 0x400);
    }

    #[test]
    fn test_cursor_position_spans_segments() {
        let mut arena = BlockArena::new();
        let mut index = DualIndex::new(2);
        let records: Vec<_> = (0..9).map(|i| (i * 0x100, 128 + i)).collect();
        fill(&mut arena, &mut index, &records);

        let c = index.lower_bound(Dimension::Primary, 0x500).unwrap();
        assert_eq!(c.index, 5);
        assert_eq!(index.chain(Dimension::Primary).get_at(crate::segment::SlotPos {
            segment: c.segment,
            offset: c.slot,
        }).map(|e| e.primary), Some(0x500));
    }

    #[test]
    fn test_erase_keeps_counts() {
        let mut arena = BlockArena::new();
        let mut index = DualIndex::new(4);
        let handles = fill(
            &mut arena,
            &mut index,
            &[(0x100, 200), (0x400, 300), (0x200, 300)],
        );
        index.erase(handles[1], 0x400, 300);
        assert_eq!(index.len(), 2);
        assert!(!index.contains(handles[1], 0x400, 300));
        assert!(index.contains(handles[2], 0x200, 300));
        index.check_order().unwrap();
    }

    #[test]
    #[should_panic(expected = "dual index corrupt")]
    fn test_erase_identity_mismatch_panics() {
        let mut arena = BlockArena::new();
        let mut index = DualIndex::new(4);
        let handles = fill(&mut arena, &mut index, &[(0x100, 200)]);
        index.erase(handles[0], 0x100, 256);
    }

    #[test]
    fn test_random_insert_erase_preserves_order() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut arena = BlockArena::new();
        let mut index = DualIndex::new(8);
        let mut live: Vec<(BlockHandle, usize, usize)> = Vec::new();

        for step in 0..2000 {
            if live.is_empty() || rng.gen_bool(0.6) {
                let address = rng.gen_range(0..1 << 20) & !0xf;
                let size = rng.gen_range(128..=1024);
                let h = arena.insert(BlockRecord { address, size });
                index.insert(h, address, size);
                live.push((h, address, size));
            } else {
                let victim = live.swap_remove(rng.gen_range(0..live.len()));
                index.erase(victim.0, victim.1, victim.2);
                arena.remove(victim.0);
            }

            assert_eq!(index.len(), live.len(), "step {step}");
            assert_eq!(index.chain(Dimension::Primary).len(), live.len());
            assert_eq!(index.chain(Dimension::Secondary).len(), live.len());
            if step % 50 == 0 {
                index.check_order().unwrap();
            }
        }
        index.check_order().unwrap();

        let sizes: Vec<_> = index.iter(Dimension::Secondary).map(|e| e.secondary).collect();
        assert!(sizes.windows(2).all(|w| w[0] <= w[1]));
        let addrs: Vec<_> = index.iter(Dimension::Primary).map(|e| e.primary).collect();
        assert!(addrs.windows(2).all(|w| w[0] <= w[1]));
    }
}
