//! CLI commands.

pub mod inspect;
pub mod pool;
pub mod relocate;
pub mod validate;
