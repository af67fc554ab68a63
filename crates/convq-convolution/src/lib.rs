//! Int8 convolution support: the graph pass attaching precomputed requantization scales to
//! convolution nodes, and the transposed convolution kernel consuming them.

#[macro_use]
extern crate derive_new;

pub mod attribute;
pub mod error;
pub mod graph;
pub mod pass;
pub mod tensor;
pub mod transpose;

mod scales;

pub use error::*;
pub use pass::*;
