//! Convenience re-exports for common karst-core types.
//!
//! ```rust
//! use karst_core::prelude::*;
//! ```

pub use crate::Backend;
pub use crate::Blob;
pub use crate::ComputeContext;
pub use crate::ComputeMode;
pub use crate::Device;
pub use crate::ElemKind;
pub use crate::Error;
pub use crate::Result;
pub use crate::SyncedMemory;
pub use crate::Transpose;
pub use crate::VPtr;
