//! Generational storage for block records.
//!
//! Each extent tracked by the pool is a [`BlockRecord`] living in a slot of
//! the [`BlockArena`]. Indexes refer to it through a [`BlockHandle`], which
//! stays valid only while the slot's generation matches. Removing a record
//! bumps the generation so stale handles resolve to `None`.

use std::fmt;

/// Stable, generation-checked reference to a block record.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockHandle {
    index: u32,
    generation: u32,
}

impl BlockHandle {
    /// Slot index inside the arena.
    #[inline]
    pub const fn index(&self) -> u32 {
        self.index
    }

    /// Generation the handle was issued with.
    #[inline]
    pub const fn generation(&self) -> u32 {
        self.generation
    }
}

impl fmt::Debug for BlockHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlockHandle({}v{})", self.index, self.generation)
    }
}

/// One memory extent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockRecord {
    /// Start address.
    pub address: usize,
    /// Length in bytes.
    pub size: usize,
}

impl BlockRecord {
    /// One past the last byte.
    #[inline]
    pub const fn end(&self) -> usize {
        self.address + self.size
    }
}

struct Slot {
    generation: u32,
    record: Option<BlockRecord>,
}

/// Slab of block records addressed by [`BlockHandle`].
pub struct BlockArena {
    slots: Vec<Slot>,
    free: Vec<u32>,
    live: usize,
}

impl BlockArena {
    /// Create an empty arena.
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            live: 0,
        }
    }

    /// Store a record and return its handle.
    pub fn insert(&mut self, record: BlockRecord) -> BlockHandle {
        self.live += 1;
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.record = Some(record);
            return BlockHandle {
                index,
                generation: slot.generation,
            };
        }

        let index = u32::try_from(self.slots.len()).unwrap_or_else(|_| {
            panic!("block arena exceeded {} slots", u32::MAX);
        });
        self.slots.push(Slot {
            generation: 0,
            record: Some(record),
        });
        BlockHandle {
            index,
            generation: 0,
        }
    }

    /// Resolve a handle.
    #[inline]
    pub fn get(&self, handle: BlockHandle) -> Option<&BlockRecord> {
        self.slots
            .get(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.record.as_ref())
    }

    /// Resolve a handle mutably.
    #[inline]
    pub fn get_mut(&mut self, handle: BlockHandle) -> Option<&mut BlockRecord> {
        self.slots
            .get_mut(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.record.as_mut())
    }

    /// Remove a record, invalidating every copy of its handle.
    pub fn remove(&mut self, handle: BlockHandle) -> Option<BlockRecord> {
        let slot = self.slots.get_mut(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        let record = slot.record.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(handle.index);
        self.live -= 1;
        Some(record)
    }

    /// Number of live records.
    #[inline]
    pub fn len(&self) -> usize {
        self.live
    }

    /// Whether no records are live.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// Iterate over live records with their handles.
    pub fn iter(&self) -> impl Iterator<Item = (BlockHandle, &BlockRecord)> + '_ {
        self.slots.iter().enumerate().filter_map(|(i, slot)| {
            slot.record.as_ref().map(|record| {
                (
                    BlockHandle {
                        index: i as u32,
                        generation: slot.generation,
                    },
                    record,
                )
            })
        })
    }
}

impl Default for BlockArena {
    fn default() -> Self {
        Self::new()
    }
}
