//! Conversation memories and their storage.

use std::fmt;

use kvlore_tensor::KvSnapshot;
use serde::{Deserialize, Serialize};

/// Which actor file a memory belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryKind {
    /// Actor definition (`.def`).
    Definition,
    /// Persona memories (`.mem`).
    Persona,
    /// Retrieved snippets (`.rag`).
    Rag,
    /// Permanent history (`.hst`).
    History,
    /// Recent buffer (`.rec`).
    Recent,
}

impl MemoryKind {
    /// Every kind, in file order.
    pub const ALL: [MemoryKind; 5] = [
        MemoryKind::Definition,
        MemoryKind::Persona,
        MemoryKind::Rag,
        MemoryKind::History,
        MemoryKind::Recent,
    ];

    /// File extension.
    pub const fn extension(&self) -> &'static str {
        match self {
            MemoryKind::Definition => "def",
            MemoryKind::Persona => "mem",
            MemoryKind::Rag => "rag",
            MemoryKind::History => "hst",
            MemoryKind::Recent => "rec",
        }
    }

    /// Kind stored in files with extension `ext`.
    pub fn from_extension(ext: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.extension() == ext)
    }
}

impl fmt::Display for MemoryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

/// A text-only memory, not resident in any cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlainMemory {
    /// Who said it.
    pub speaker: String,
    /// What was said.
    pub content: String,
    /// Token count once tokenized.
    pub n_tokens: usize,
    /// When it was said.
    pub timestamp: String,
}

/// A memory with its own copy of K/V content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EidetMemory {
    /// Who said it.
    pub speaker: String,
    /// What was said.
    pub content: String,
    /// When it was said.
    pub timestamp: String,
    /// Materialized cache content.
    pub kv: KvSnapshot,
}

/// A stored utterance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConversationMemory {
    /// Text only.
    Plain(PlainMemory),
    /// Materialized.
    Eidet(EidetMemory),
}

impl ConversationMemory {
    /// Create a text-only memory.
    pub fn plain(
        speaker: impl Into<String>,
        content: impl Into<String>,
        n_tokens: usize,
        timestamp: impl Into<String>,
    ) -> Self {
        Self::Plain(PlainMemory {
            speaker: speaker.into(),
            content: content.into(),
            n_tokens,
            timestamp: timestamp.into(),
        })
    }

    /// Create a materialized memory.
    pub fn eidet(
        speaker: impl Into<String>,
        content: impl Into<String>,
        timestamp: impl Into<String>,
        kv: KvSnapshot,
    ) -> Self {
        Self::Eidet(EidetMemory {
            speaker: speaker.into(),
            content: content.into(),
            timestamp: timestamp.into(),
            kv,
        })
    }

    /// Who said it.
    pub fn speaker(&self) -> &str {
        match self {
            Self::Plain(m) => &m.speaker,
            Self::Eidet(m) => &m.speaker,
        }
    }

    /// What was said.
    pub fn content(&self) -> &str {
        match self {
            Self::Plain(m) => &m.content,
            Self::Eidet(m) => &m.content,
        }
    }

    /// When it was said.
    pub fn timestamp(&self) -> &str {
        match self {
            Self::Plain(m) => &m.timestamp,
            Self::Eidet(m) => &m.timestamp,
        }
    }

    /// Number of cache slots it occupies.
    pub fn n_tokens(&self) -> usize {
        match self {
            Self::Plain(m) => m.n_tokens,
            Self::Eidet(m) => m.kv.n_tokens,
        }
    }

    /// Cache content, if materialized.
    pub fn snapshot(&self) -> Option<&KvSnapshot> {
        match self {
            Self::Plain(_) => None,
            Self::Eidet(m) => Some(&m.kv),
        }
    }

    /// Whether the memory carries cache content.
    pub fn is_materialized(&self) -> bool {
        matches!(self, Self::Eidet(_))
    }

    /// Replace the cache content, turning a plain memory into an eidet.
    pub fn materialize(&mut self, kv: KvSnapshot) {
        *self = match std::mem::replace(self, Self::plain("", "", 0, "")) {
            Self::Plain(m) => Self::eidet(m.speaker, m.content, m.timestamp, kv),
            Self::Eidet(m) => Self::eidet(m.speaker, m.content, m.timestamp, kv),
        };
    }
}

/// Stable reference to a stored memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MemoryId {
    index: u32,
    generation: u32,
}

impl fmt::Display for MemoryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "mem#{}v{}", self.index, self.generation)
    }
}

struct Slot {
    generation: u32,
    memory: Option<ConversationMemory>,
}

/// Generation-checked storage for memories.
#[derive(Default)]
pub struct MemoryStore {
    slots: Vec<Slot>,
    free: Vec<u32>,
    live: usize,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a memory.
    pub fn insert(&mut self, memory: ConversationMemory) -> MemoryId {
        self.live += 1;
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.memory = Some(memory);
            return MemoryId {
                index,
                generation: slot.generation,
            };
        }
        self.slots.push(Slot {
            generation: 0,
            memory: Some(memory),
        });
        MemoryId {
            index: (self.slots.len() - 1) as u32,
            generation: 0,
        }
    }

    /// Look up a memory.
    pub fn get(&self, id: MemoryId) -> Option<&ConversationMemory> {
        self.slots
            .get(id.index as usize)
            .filter(|s| s.generation == id.generation)
            .and_then(|s| s.memory.as_ref())
    }

    /// Look up a memory mutably.
    pub fn get_mut(&mut self, id: MemoryId) -> Option<&mut ConversationMemory> {
        self.slots
            .get_mut(id.index as usize)
            .filter(|s| s.generation == id.generation)
            .and_then(|s| s.memory.as_mut())
    }

    /// Remove a memory; its id goes stale.
    pub fn remove(&mut self, id: MemoryId) -> Option<ConversationMemory> {
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        let memory = slot.memory.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index);
        self.live -= 1;
        Some(memory)
    }

    /// Number of stored memories.
    pub fn len(&self) -> usize {
        self.live
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.live == 0
    }
}

impl fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryStore").field("live", &self.live).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn snapshot(n: usize) -> KvSnapshot {
        KvSnapshot {
            n_tokens: n,
            k: vec![Arc::from(vec![1u8; n * 4])],
            v: vec![Arc::from(vec![2u8; n * 4])],
        }
    }

    #[test]
    fn test_kind_from_extension() {
        for kind in MemoryKind::ALL {
            assert_eq!(MemoryKind::from_extension(kind.extension()), Some(kind));
        }
        assert_eq!(MemoryKind::from_extension("txt"), None);
    }

    #[test]
    fn test_materialize_plain() {
        let mut m = ConversationMemory::plain("bob", "hello", 3, "t0");
        assert!(!m.is_materialized());
        m.materialize(snapshot(3));
        assert!(m.is_materialized());
        assert_eq!(m.speaker(), "bob");
        assert_eq!(m.content(), "hello");
        assert_eq!(m.timestamp(), "t0");
        assert_eq!(m.n_tokens(), 3);
    }

    #[test]
    fn test_store_generations() {
        let mut store = MemoryStore::new();
        let a = store.insert(ConversationMemory::plain("a", "x", 1, "t"));
        assert_eq!(store.remove(a).map(|m| m.speaker().to_string()), Some("a".into()));
        let b = store.insert(ConversationMemory::plain("b", "y", 1, "t"));
        assert!(store.get(a).is_none());
        assert_eq!(store.get(b).map(|m| m.speaker()), Some("b"));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_kind_extensions() {
        let exts: Vec<_> = MemoryKind::ALL.iter().map(|k| k.extension()).collect();
        assert_eq!(exts, vec!["def", "mem", "rag", "hst", "rec"]);
    }
}
