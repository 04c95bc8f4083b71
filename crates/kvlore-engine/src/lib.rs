//! # kvlore Engine
//!
//! Multi-actor conversation cache on top of per-lane KV caches.
//!
//! ## Architecture
//!
//! - **Memories**: plain (text only) or eidet (with their own K/V buffers),
//!   held in a generation-checked [`MemoryStore`]
//! - **Actors**: named owners of five memory lists, persisted as
//!   `.def .mem .rag .hst .rec` files
//! - **Lanes**: one KV ring each, lane 0 reserved for the System actor
//! - **Placement**: diffing a lane's layout against a candidate to decide
//!   what stays, what is relocated in-cache and what is rewritten
//! - **Session**: [`ActorSession`], owning all of the above
//!
//! ## Example
//!
//! ```rust,ignore
//! use kvlore_core::{LaneId, SessionConfig};
//! use kvlore_engine::ActorSession;
//!
//! let mut session = ActorSession::with_cpu(SessionConfig::default())?;
//! session.useactor(LaneId::new(1), "ada")?;
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod actor;
pub mod lane;
pub mod memory;
pub mod persist;
pub mod placement;
pub mod session;

pub use actor::Actor;
pub use lane::{Lane, LaneState, LaneSummary, MapEntry};
pub use memory::{ConversationMemory, EidetMemory, MemoryId, MemoryKind, MemoryStore, PlainMemory};
pub use placement::{plan, validate_candidate, Placement, Relocation};
pub use session::ActorSession;

/// Prelude for common imports
pub mod prelude {
    pub use super::lane::*;
    pub use super::memory::*;
    pub use super::session::*;
}
