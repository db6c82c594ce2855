//! # karst-core
//!
//! Device abstraction and backend dispatch for the Karst compute layer.
//!
//! Provides the foundational pieces that let the same tensor code run
//! unmodified across CPU, CUDA, and OpenCL:
//! - [`VPtr`]: backend-polymorphic typed device pointer with offset
//! - [`SyncedMemory`]: dual host/device buffer with lazy synchronization
//! - [`Blob`]: shaped, typed tensor owning value and gradient buffers
//! - [`DeviceProgram`]/[`DeviceKernel`]: generated, runtime-compiled
//!   kernel source and its invocable entry points
//! - [`Device`]: the per-device dispatch object exposing the numeric
//!   primitive API (copy, gemm, axpy, dot, im2col, ...)
//! - [`ComputeContext`]: explicit device list and compute-mode holder

pub mod backend;
pub mod backends;
pub mod blob;
pub mod context;
pub mod device;
pub mod device_im2col;
pub mod device_math;
pub mod dtype;
pub mod error;
pub mod prelude;
pub mod program;
pub mod syncedmem;
pub mod vptr;

pub use backend::Backend;
pub use blob::{Blob, BlobData, BlobDesc, MAX_BLOB_AXES};
pub use context::{ComputeContext, ComputeMode};
pub use device::Device;
pub use dtype::{ElemKind, Numeric};
pub use error::{Error, Result};
pub use karst_kernels::cpu::Transpose;
pub use program::{DeviceKernel, DeviceProgram, KernelArgValue, ProgramFamily};
pub use syncedmem::{SyncHead, SyncedMemory};
pub use vptr::{MemHandle, VPtr};
