//! Host (CPU) backend: buffers and math routines.
//!
//! These are the routines the dispatch layer runs when the active device
//! is the host itself, and when a CPU-class accelerator device is better
//! served by mapping its memory and computing directly on the host.

pub mod blas;
pub mod im2col;
pub mod memory;
pub mod rng;

pub use blas::Transpose;
pub use memory::HostBuffer;
