//! # karst-kernels
//!
//! Backend plumbing for the Karst compute layer.
//!
//! Provides:
//! - Kernel-source emission for CUDA C and OpenCL C behind a common
//!   builder API (`codegen`)
//! - CPU host math routines (BLAS-like primitives, im2col/col2im, RNG)
//! - CUDA device/memory/launch wrappers via `cudarc` (behind the `cuda`
//!   feature)
//! - OpenCL device/memory/launch wrappers via `ocl` (behind the `opencl`
//!   feature)

pub mod codegen;
pub mod cpu;
pub mod real;

#[cfg(feature = "cuda")]
pub mod cuda;

#[cfg(feature = "opencl")]
pub mod opencl;

pub use real::Real;
