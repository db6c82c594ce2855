//! Explicit compute context: device list, mode, active device.
//!
//! Call sites hold a context instead of consulting ambient global
//! state, so tests can run several contexts in one process.

use std::sync::Arc;

use crate::backend::Backend;
use crate::device::Device;
use crate::error::{Error, Result};

/// Process-wide execution mode collaborators switch on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ComputeMode {
    #[default]
    Cpu,
    Gpu,
}

/// Owns the devices visible to one compute pipeline.
///
/// Device 0 is always the host. Accelerator devices follow in
/// enumeration order and keep their list position for the context's
/// lifetime (devices are never relocated).
pub struct ComputeContext {
    devices: Vec<Arc<Device>>,
    mode: ComputeMode,
    active: usize,
}

impl ComputeContext {
    /// Host-only context.
    pub fn new() -> Self {
        let cpu = Device::cpu();
        cpu.set_list_id(0);
        Self {
            devices: vec![cpu],
            mode: ComputeMode::Cpu,
            active: 0,
        }
    }

    /// Context with every visible device: host first, then CUDA, then
    /// OpenCL devices, as compiled in.
    pub fn with_all_devices() -> Result<Self> {
        let mut ctx = Self::new();
        #[cfg(feature = "cuda")]
        for ordinal in 0..karst_kernels::cuda::context::device_count() {
            let dev = Device::cuda(ordinal)?;
            ctx.push_device(dev);
        }
        #[cfg(feature = "opencl")]
        for ordinal in 0..karst_kernels::opencl::context::device_count() {
            let dev = Device::opencl(ordinal)?;
            ctx.push_device(dev);
        }
        if ctx.devices.len() > 1 {
            ctx.mode = ComputeMode::Gpu;
            ctx.active = 1;
        }
        Ok(ctx)
    }

    fn push_device(&mut self, dev: Arc<Device>) {
        dev.set_list_id(self.devices.len());
        tracing::info!(
            "registered device {}: {} ({})",
            self.devices.len(),
            dev.name(),
            dev.backend()
        );
        self.devices.push(dev);
    }

    pub fn mode(&self) -> ComputeMode {
        self.mode
    }

    pub fn set_mode(&mut self, mode: ComputeMode) {
        self.mode = mode;
    }

    pub fn devices(&self) -> &[Arc<Device>] {
        &self.devices
    }

    /// The host device (always present, list position 0).
    pub fn cpu_device(&self) -> &Arc<Device> {
        &self.devices[0]
    }

    /// The device math dispatches to under the current mode.
    pub fn device(&self) -> &Arc<Device> {
        match self.mode {
            ComputeMode::Cpu => self.cpu_device(),
            ComputeMode::Gpu => &self.devices[self.active],
        }
    }

    /// Select the active device by list position.
    pub fn set_device(&mut self, list_id: usize) -> Result<()> {
        if list_id >= self.devices.len() {
            return Err(Error::DeviceInit(format!(
                "device {list_id} out of range ({} registered)",
                self.devices.len()
            )));
        }
        self.active = list_id;
        Ok(())
    }

    /// Whether any non-host device is registered.
    pub fn has_accelerator(&self) -> bool {
        self.devices.iter().any(|d| d.backend() != Backend::Cpu)
    }
}

impl Default for ComputeContext {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_context() {
        let ctx = ComputeContext::new();
        assert_eq!(ctx.mode(), ComputeMode::Cpu);
        assert_eq!(ctx.devices().len(), 1);
        assert_eq!(ctx.device().backend(), Backend::Cpu);
        assert!(!ctx.has_accelerator());
    }

    #[test]
    fn test_mode_switch_keeps_host_reachable() {
        let mut ctx = ComputeContext::new();
        ctx.set_mode(ComputeMode::Gpu);
        // Only the host is registered, so active stays 0.
        assert_eq!(ctx.device().backend(), Backend::Cpu);
        assert!(ctx.set_device(3).is_err());
    }

    #[test]
    fn test_multiple_contexts_coexist() {
        let a = ComputeContext::new();
        let b = ComputeContext::new();
        a.device().increase_memory_usage(64);
        assert_eq!(a.device().memory_usage(), 64);
        assert_eq!(b.device().memory_usage(), 0);
        a.device().decrease_memory_usage(64);
    }
}
