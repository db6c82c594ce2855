//! CUDA backend plumbing via `cudarc`.
//!
//! Provides device-handle caching, raw byte buffers with host↔device
//! transfer, and NVRTC compilation of generated kernel source with
//! module caching and a packed-argument launcher.

pub mod context;
pub mod launch;
pub mod memory;

pub use context::{get_device, CudaError};
pub use launch::{CudaProgramHandle, ScalarBlock};
pub use memory::CudaBuffer;
