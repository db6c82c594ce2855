use std::fmt;

/// Compute backend kind a device belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Backend {
    /// Host CPU.
    #[default]
    Cpu,
    /// CUDA GPU via the driver API.
    Cuda,
    /// OpenCL device (GPU, CPU, or accelerator class).
    OpenCl,
}

impl Backend {
    /// Whether this is the host backend.
    pub fn is_cpu(&self) -> bool {
        matches!(self, Backend::Cpu)
    }

    /// Whether this is the CUDA backend.
    pub fn is_cuda(&self) -> bool {
        matches!(self, Backend::Cuda)
    }

    /// Whether this is the OpenCL backend.
    pub fn is_opencl(&self) -> bool {
        matches!(self, Backend::OpenCl)
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Backend::Cpu => write!(f, "cpu"),
            Backend::Cuda => write!(f, "cuda"),
            Backend::OpenCl => write!(f, "opencl"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_properties() {
        assert!(Backend::Cpu.is_cpu());
        assert!(!Backend::Cpu.is_cuda());
        assert!(Backend::Cuda.is_cuda());
        assert!(Backend::OpenCl.is_opencl());
    }

    #[test]
    fn test_display() {
        assert_eq!(format!("{}", Backend::Cpu), "cpu");
        assert_eq!(format!("{}", Backend::Cuda), "cuda");
        assert_eq!(format!("{}", Backend::OpenCl), "opencl");
    }

    #[test]
    fn test_default() {
        assert_eq!(Backend::default(), Backend::Cpu);
    }
}
