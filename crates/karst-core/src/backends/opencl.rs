//! OpenCL backend state.

use std::sync::Arc;

use karst_kernels::opencl::{get_context, ClContext, ClError};

pub(crate) struct OclBackend {
    ctx: Arc<ClContext>,
}

impl OclBackend {
    pub fn new(ordinal: usize) -> Result<Self, ClError> {
        let ctx = get_context(ordinal)?;
        Ok(Self { ctx })
    }

    pub fn ctx(&self) -> &Arc<ClContext> {
        &self.ctx
    }

    pub fn name(&self) -> String {
        self.ctx.device_name()
    }

    pub fn vendor(&self) -> String {
        self.ctx.vendor()
    }

    /// BLAS-like ops on CPU-class devices bypass kernels and compute on
    /// mapped host memory instead.
    pub fn is_cpu_class(&self) -> bool {
        self.ctx.is_cpu_class()
    }
}
