//! Growable virtual array built from fixed-capacity segments.
//!
//! A [`SegmentChain`] behaves like one densely indexed sorted array, but
//! stores its elements in segments of at most `capacity` slots. Inserting into
//! a full segment overflows a single element into the neighbour instead of
//! shifting the whole tail of the array, and removal only shifts inside one
//! segment.
//!
//! Segments that become empty are unlinked immediately. The chain always keeps
//! at least one segment.
//!
//! The logical start of every segment is cached, so locating an index is a
//! binary search over segments. A mutation refreshes the starts of the
//! segments after it.

use std::fmt;

/// Physical position of a logical index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotPos {
    /// Segment ordinal in the chain.
    pub segment: usize,
    /// Offset inside the segment.
    pub offset: usize,
}

/// Ordered list of fixed-capacity segments.
pub struct SegmentChain<T> {
    segments: Vec<Vec<T>>,
    /// Logical index of each segment's first slot.
    starts: Vec<usize>,
    capacity: usize,
    len: usize,
}

impl<T> SegmentChain<T> {
    /// Create a chain whose segments hold `capacity` slots each.
    ///
    /// # Panics
    /// If `capacity < 2`; an overflowing insert needs room for the element it
    /// keeps as well as the one it pushes out.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity >= 2, "segment capacity must be at least 2");
        Self {
            segments: vec![Vec::with_capacity(capacity)],
            starts: vec![0],
            capacity,
            len: 0,
        }
    }

    /// Total number of stored elements.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the chain is empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Slots per segment.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of linked segments.
    #[inline]
    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    /// Contents of one segment.
    #[inline]
    pub fn segment(&self, ordinal: usize) -> &[T] {
        &self.segments[ordinal]
    }

    /// Logical index of the first element of segment `ordinal`.
    #[inline]
    pub fn segment_start(&self, ordinal: usize) -> usize {
        self.starts[ordinal]
    }

    /// Locate a live element.
    pub fn locate(&self, index: usize) -> Option<SlotPos> {
        if index >= self.len {
            return None;
        }
        // Last segment starting at or before `index`; an empty segment shares
        // its start with the next one, so this lands on a non-empty one.
        let segment = self.starts.partition_point(|&start| start <= index) - 1;
        let offset = index - self.starts[segment];
        if offset >= self.segments[segment].len() {
            unreachable_index(index, self.len);
        }
        Some(SlotPos { segment, offset })
    }

    /// Locate a live element, or the append position when `index == len`.
    ///
    /// Appending past a full tail links a fresh empty segment first.
    ///
    /// # Panics
    /// If `index > len`.
    pub fn locate_or_grow(&mut self, index: usize) -> SlotPos {
        if let Some(pos) = self.locate(index) {
            return pos;
        }
        if index != self.len {
            unreachable_index(index, self.len);
        }
        let tail = self.segments.len() - 1;
        if self.segments[tail].len() < self.capacity {
            return SlotPos {
                segment: tail,
                offset: self.segments[tail].len(),
            };
        }
        self.segments.push(Vec::with_capacity(self.capacity));
        self.reindex(tail + 1);
        SlotPos {
            segment: tail + 1,
            offset: 0,
        }
    }

    /// Get the element at a logical index.
    pub fn get(&self, index: usize) -> Option<&T> {
        self.locate(index)
            .map(|pos| &self.segments[pos.segment][pos.offset])
    }

    /// Get the element at a physical position.
    #[inline]
    pub fn get_at(&self, pos: SlotPos) -> Option<&T> {
        self.segments.get(pos.segment)?.get(pos.offset)
    }

    /// Insert `value` so that it ends up at logical `index`.
    ///
    /// # Panics
    /// If `index > len`.
    pub fn insert_at(&mut self, index: usize, value: T) {
        let pos = self.locate_or_grow(index);
        let capacity = self.capacity;
        let segment = &mut self.segments[pos.segment];

        if segment.len() < capacity {
            segment.insert(pos.offset, value);
            self.len += 1;
            self.reindex(pos.segment + 1);
            return;
        }

        // Full: only the last element moves to a neighbour.
        let overflow = segment
            .pop()
            .unwrap_or_else(|| unreachable_index(index, self.len));
        segment.insert(pos.offset, value);

        let next = pos.segment + 1;
        match self.segments.get_mut(next) {
            Some(neighbour) if neighbour.len() < capacity => neighbour.insert(0, overflow),
            _ => {
                let mut fresh = Vec::with_capacity(capacity);
                fresh.push(overflow);
                self.segments.insert(next, fresh);
            }
        }
        self.len += 1;
        self.reindex(next);
    }

    /// Remove and return the element at logical `index`.
    ///
    /// # Panics
    /// If `index >= len`.
    pub fn remove_at(&mut self, index: usize) -> T {
        let pos = self
            .locate(index)
            .unwrap_or_else(|| unreachable_index(index, self.len));
        let value = self.segments[pos.segment].remove(pos.offset);
        self.len -= 1;
        if self.segments[pos.segment].is_empty() && self.segments.len() > 1 {
            self.segments.remove(pos.segment);
        }
        self.reindex(pos.segment);
        value
    }

    /// In-order traversal of every stored element.
    pub fn iter(&self) -> impl Iterator<Item = &T> + '_ {
        self.segments.iter().flat_map(|s| s.iter())
    }

    /// Drop empty segments left behind by [`locate_or_grow`](Self::locate_or_grow).
    pub fn prune(&mut self) {
        self.segments.retain(|s| !s.is_empty());
        if self.segments.is_empty() {
            self.segments.push(Vec::with_capacity(self.capacity));
        }
        self.reindex(0);
    }

    /// Recompute cached starts for segments `from..`.
    fn reindex(&mut self, from: usize) {
        self.starts.resize(self.segments.len(), 0);
        let mut start = match from.checked_sub(1) {
            Some(prev) if prev < self.segments.len() => {
                self.starts[prev] + self.segments[prev].len()
            }
            _ => 0,
        };
        for ordinal in from..self.segments.len() {
            self.starts[ordinal] = start;
            start += self.segments[ordinal].len();
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for SegmentChain<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SegmentChain")
            .field("len", &self.len)
            .field("capacity", &self.capacity)
            .field(
                "segments",
                &self.segments.iter().map(Vec::len).collect::<Vec<_>>(),
            )
            .finish()
    }
}

#[cold]
fn unreachable_index(index: usize, len: usize) -> ! {
    panic!("segment chain: index {index} unreachable (len {len})")
}
