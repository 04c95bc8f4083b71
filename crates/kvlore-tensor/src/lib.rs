//! # kvlore Tensor
//!
//! Device-side storage for the conversation cache.
//!
//! This crate provides:
//!
//! - **Executor interface**: [`GraphExecutor`] and the [`CopyGraph`] it runs
//! - **CPU backend**: [`CpuExecutor`], built on Candle `u8` tensors
//! - **KV cache**: per-lane K/V tensors with coalesced write staging
//! - **Relocator**: [`GraphContext`], batching token-range moves into one graph

#![warn(missing_docs)]

pub mod cache;
pub mod cpu;
pub mod executor;
pub mod relocator;

pub use cache::{KvCache, KvGeometry, KvSnapshot};
pub use cpu::CpuExecutor;
pub use executor::{CopyGraph, CopyOp, GraphExecutor, TensorId, TensorView};
pub use relocator::GraphContext;

/// Prelude for common imports
pub mod prelude {
    pub use super::cache::*;
    pub use super::cpu::*;
    pub use super::executor::*;
    pub use super::relocator::*;
}
