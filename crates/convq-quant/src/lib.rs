#![warn(missing_docs)]

//! Derivation of the requantization factors an int8 convolution needs from the floating-point
//! scales captured during calibration.
//!
//! The same [derive] function backs both the ahead-of-time graph pass and the kernel fallback,
//! so both always agree on every bit of the produced vectors.

#[macro_use]
extern crate derive_new;

mod calibration;
mod config;
mod derive;
mod error;

pub use calibration::*;
pub use config::*;
pub use derive::*;
pub use error::*;
