use crate::backend::Backend;
use crate::dtype::ElemKind;

/// Errors of the dispatch layer.
///
/// These are fatal by convention: a failed numeric pipeline is unsafe
/// to continue from, so callers are expected to propagate and abort
/// rather than retry. No operation substitutes a different precision or
/// backend on failure.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("operation '{op}' is not implemented for {kind} on {backend}")]
    NotImplemented {
        op: &'static str,
        kind: ElemKind,
        backend: Backend,
    },

    #[error("operation '{op}' is not supported on the {backend} backend")]
    Unsupported {
        op: &'static str,
        backend: Backend,
    },

    #[error("pointer backend mismatch: expected {expected}, got {got}")]
    BackendMismatch { expected: Backend, got: Backend },

    #[error("shape mismatch: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        got: Vec<usize>,
    },

    #[error("invalid shape: {0}")]
    InvalidShape(String),

    #[error("blob size exceeds the signed index range: {0:?}")]
    CountOverflow(Vec<usize>),

    #[error("kernel program '{program}' failed to compile: {msg}")]
    Compile { program: String, msg: String },

    #[error("kernel '{0}' not found in program")]
    KernelNotFound(String),

    #[error("kernel argument slot {slot}: {msg}")]
    KernelArgs { slot: usize, msg: String },

    #[error("device memory error: {0}")]
    Memory(String),

    #[error("device init failed: {0}")]
    DeviceInit(String),

    #[cfg(feature = "cuda")]
    #[error(transparent)]
    Cuda(#[from] karst_kernels::cuda::CudaError),

    #[cfg(feature = "opencl")]
    #[error(transparent)]
    OpenCl(#[from] karst_kernels::opencl::ClError),
}

pub type Result<T> = std::result::Result<T, Error>;
