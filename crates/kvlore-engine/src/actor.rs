//! Actors and their memory files.

use std::path::{Path, PathBuf};

use kvlore_core::{LaneId, Result};
use kvlore_tensor::KvGeometry;
use tracing::{debug, info};

use crate::memory::{MemoryId, MemoryKind, MemoryStore};
use crate::persist;

/// A named participant and the memories it owns.
#[derive(Debug, Clone)]
pub struct Actor {
    name: String,
    dir: Option<PathBuf>,
    pub(crate) definition: Vec<MemoryId>,
    pub(crate) persona: Vec<MemoryId>,
    pub(crate) rag: Vec<MemoryId>,
    pub(crate) history: Vec<MemoryId>,
    pub(crate) recent: Vec<MemoryId>,
    pub(crate) lane: Option<LaneId>,
}

impl Actor {
    /// An actor with no memories.
    pub fn new(name: impl Into<String>, dir: Option<PathBuf>) -> Self {
        Self {
            name: name.into(),
            dir,
            definition: Vec::new(),
            persona: Vec::new(),
            rag: Vec::new(),
            history: Vec::new(),
            recent: Vec::new(),
            lane: None,
        }
    }

    /// Actor name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Directory its files live in.
    pub fn dir(&self) -> Option<&Path> {
        self.dir.as_deref()
    }

    /// Lane it is bound to.
    pub fn lane(&self) -> Option<LaneId> {
        self.lane
    }

    /// Memories of one kind, oldest first.
    pub fn memories(&self, kind: MemoryKind) -> &[MemoryId] {
        match kind {
            MemoryKind::Definition => &self.definition,
            MemoryKind::Persona => &self.persona,
            MemoryKind::Rag => &self.rag,
            MemoryKind::History => &self.history,
            MemoryKind::Recent => &self.recent,
        }
    }

    pub(crate) fn memories_mut(&mut self, kind: MemoryKind) -> &mut Vec<MemoryId> {
        match kind {
            MemoryKind::Definition => &mut self.definition,
            MemoryKind::Persona => &mut self.persona,
            MemoryKind::Rag => &mut self.rag,
            MemoryKind::History => &mut self.history,
            MemoryKind::Recent => &mut self.recent,
        }
    }

    /// Every memory id, in file order.
    pub fn all_memories(&self) -> impl Iterator<Item = MemoryId> + '_ {
        MemoryKind::ALL
            .into_iter()
            .flat_map(move |kind| self.memories(kind).iter().copied())
    }

    /// Path of the file holding memories of `kind`.
    pub fn file_path(&self, kind: MemoryKind) -> Option<PathBuf> {
        self.dir
            .as_ref()
            .map(|dir| dir.join(format!("{}.{}", self.name, kind.extension())))
    }

    /// Load an actor's five files from `dir` into `store`.
    ///
    /// A missing file means no memories of that kind.
    pub fn load(
        dir: &Path,
        name: &str,
        geometry: &KvGeometry,
        store: &mut MemoryStore,
    ) -> Result<Self> {
        let mut actor = Actor::new(name, Some(dir.to_path_buf()));
        let mut loaded = Vec::new();
        for kind in MemoryKind::ALL {
            let Some(path) = actor.file_path(kind) else {
                continue;
            };
            if !path.exists() {
                debug!(actor = name, %kind, "no memory file");
                continue;
            }
            loaded.push((kind, persist::read_file(&path, geometry)?));
        }

        let mut total = 0;
        for (kind, memories) in loaded {
            total += memories.len();
            let ids = actor.memories_mut(kind);
            ids.extend(memories.into_iter().map(|m| store.insert(m)));
        }
        info!(actor = name, memories = total, "actor loaded");
        Ok(actor)
    }

    /// Write the actor's five files. Does nothing without a directory.
    pub fn save(&self, geometry: &KvGeometry, store: &MemoryStore) -> Result<()> {
        let Some(dir) = &self.dir else {
            debug!(actor = %self.name, "actor has no directory, not saved");
            return Ok(());
        };
        std::fs::create_dir_all(dir).map_err(|e| {
            kvlore_core::Error::io_with_path(
                "failed to create actor directory",
                dir.display().to_string(),
                e,
            )
        })?;
        for kind in MemoryKind::ALL {
            let Some(path) = self.file_path(kind) else {
                continue;
            };
            let memories: Vec<_> = self
                .memories(kind)
                .iter()
                .filter_map(|id| store.get(*id))
                .collect();
            persist::write_file(&path, geometry, memories.into_iter())?;
        }
        info!(actor = %self.name, "actor saved");
        Ok(())
    }
}
