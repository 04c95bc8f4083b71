//! # kvlore Core
//!
//! Core types and utilities shared by the kvlore crates:
//!
//! - **Error handling**: one error type, with invariant violations kept out of it
//! - **Configuration**: pool, cache and lane settings
//! - **Types**: lane ids, token ranges, K/V kinds

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]
#![deny(unsafe_code)]

pub mod config;
pub mod error;
pub mod types;

pub use config::*;
pub use error::{Error, ErrorContext, Result};
pub use types::*;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::*;
    pub use crate::error::{Error, ErrorContext, Result};
    pub use crate::types::*;
}
