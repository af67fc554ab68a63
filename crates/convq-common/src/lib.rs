#![cfg_attr(not(feature = "std"), no_std)]
#![warn(missing_docs)]

//! Common types shared by the convq crates.

extern crate alloc;

/// Backtrace captured alongside errors.
pub mod backtrace;

/// Stream discriminator derived from the current thread.
pub mod stream_id;
