//! CUDA backend state.

use std::sync::Arc;

use cudarc::driver::CudaDevice;

use karst_kernels::cuda::{get_device, CudaError};

pub(crate) struct CudaBackend {
    dev: Arc<CudaDevice>,
    ordinal: usize,
}

impl CudaBackend {
    pub fn new(ordinal: usize) -> Result<Self, CudaError> {
        let dev = get_device(ordinal)?;
        Ok(Self { dev, ordinal })
    }

    pub fn device(&self) -> &Arc<CudaDevice> {
        &self.dev
    }

    pub fn ordinal(&self) -> usize {
        self.ordinal
    }

    pub fn name(&self) -> String {
        self.dev
            .name()
            .unwrap_or_else(|_| format!("cuda:{}", self.ordinal))
    }

    /// Block until all enqueued work on this device completes.
    pub fn synchronize(&self) -> Result<(), CudaError> {
        self.dev
            .synchronize()
            .map_err(|e| CudaError::Launch(e.to_string()))
    }
}
