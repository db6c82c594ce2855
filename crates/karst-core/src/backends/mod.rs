//! Concrete backend state held by a [`crate::Device`].

pub(crate) mod cpu;

#[cfg(feature = "cuda")]
pub(crate) mod cuda;

#[cfg(feature = "opencl")]
pub(crate) mod opencl;

/// Backend-specific device state, dispatched by enum match.
pub(crate) enum BackendImpl {
    Cpu(cpu::CpuBackend),
    #[cfg(feature = "cuda")]
    Cuda(cuda::CudaBackend),
    #[cfg(feature = "opencl")]
    OpenCl(opencl::OclBackend),
}
