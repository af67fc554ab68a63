//! Transposed convolution: padding resolution, the reference primitive and the kernel driving it
//! through the scale cache.

pub mod activation;
pub mod padding;
pub mod primitive;

mod handler;
mod kernel;

pub use handler::{dst_type, weights_tz};
pub use kernel::*;
