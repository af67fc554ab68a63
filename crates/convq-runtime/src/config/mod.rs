/// Scale cache config module.
pub mod cache;
/// Derivation config module.
pub mod derivation;
/// Graph pass config module.
pub mod pass;

mod base;
mod logger;

pub use base::*;
pub use logger::*;
