#![warn(missing_docs)]

//! Runtime pieces of the convq kernels: memory descriptors and buffers, the reorder primitive,
//! and the cache keeping derived scales and reordered operands alive across inference calls.

extern crate alloc;

#[macro_use]
extern crate derive_new;

/// Scale and reorder cache module.
pub mod cache;
/// Configuration module.
pub mod config;
/// Memory module.
pub mod memory;
/// Reorder primitive module.
pub mod reorder;

mod context;
mod error;

pub use context::*;
pub use error::*;
