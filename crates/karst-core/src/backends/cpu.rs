//! Host backend state.
//!
//! The host is a first-class device: allocations are [`HostBuffer`]s,
//! "kernel launches" are direct calls into the `karst-kernels` CPU
//! routines, and host/device views of a buffer are unified.

/// Marker state for the host device. All host math routes through
/// `karst_kernels::cpu` at the dispatch sites.
pub(crate) struct CpuBackend;

impl CpuBackend {
    pub fn name(&self) -> String {
        "host".to_string()
    }

    pub fn vendor(&self) -> String {
        std::env::consts::ARCH.to_string()
    }
}
