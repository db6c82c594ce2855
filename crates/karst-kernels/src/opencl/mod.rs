//! OpenCL backend plumbing via `ocl`.
//!
//! Provides platform/device/queue context caching, raw byte buffers
//! with transfer and map/unmap access, and program build + dynamic
//! kernel-argument launch for generated source.

pub mod context;
pub mod memory;
pub mod program;

pub use context::{get_context, ClContext, ClError};
pub use memory::ClBuffer;
pub use program::{ClArg, ClProgramHandle};
