//! Dual host/device memory with lazy, on-demand synchronization.

use std::sync::Arc;

use parking_lot::Mutex;

use karst_kernels::cpu::HostBuffer;

use crate::device::Device;
use crate::error::Result;
use crate::vptr::{MemHandle, VPtr};

/// Which side of a [`SyncedMemory`] holds the authoritative copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncHead {
    /// Neither side allocated yet.
    Uninitialized,
    /// Host copy is authoritative.
    HeadAtCpu,
    /// Device copy is authoritative.
    HeadAtGpu,
    /// Both copies agree.
    Synced,
}

struct SyncState {
    head: SyncHead,
    host: Option<Arc<HostBuffer>>,
    dev: Option<MemHandle>,
}

/// A byte buffer resident on the host, the device, or both, tracking
/// which side is authoritative. Any mutation through one side
/// invalidates the other; the next read from the stale side triggers a
/// copy. On host-unified devices the two sides share one allocation and
/// synchronization is free.
///
/// Not designed for concurrent host-thread mutation of the same buffer;
/// the host issues device work single-threaded per queue.
pub struct SyncedMemory {
    device: Arc<Device>,
    size: usize,
    state: Mutex<SyncState>,
}

impl std::fmt::Debug for SyncedMemory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncedMemory")
            .field("size", &self.size)
            .field("head", &self.head())
            .finish()
    }
}

impl SyncedMemory {
    /// A buffer of `size` bytes on `device`. Nothing is allocated until
    /// first access.
    pub fn new(device: Arc<Device>, size: usize) -> Self {
        Self {
            device,
            size,
            state: Mutex::new(SyncState {
                head: SyncHead::Uninitialized,
                host: None,
                dev: None,
            }),
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn head(&self) -> SyncHead {
        self.state.lock().head
    }

    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    fn ensure_host(&self, state: &mut SyncState) -> Arc<HostBuffer> {
        if state.host.is_none() {
            // Unified devices back the host view with the device
            // allocation itself.
            if self.device.is_host_unified() {
                if let Some(MemHandle::Host(buf)) = &state.dev {
                    state.host = Some(Arc::clone(buf));
                }
            }
        }
        if state.host.is_none() {
            state.host = Some(Arc::new(HostBuffer::new(self.size)));
        }
        Arc::clone(state.host.as_ref().unwrap())
    }

    fn ensure_device(&self, state: &mut SyncState) -> Result<MemHandle> {
        if state.dev.is_none() {
            if self.device.is_host_unified() {
                if let Some(host) = &state.host {
                    // Count the unified allocation as device memory.
                    self.device.increase_memory_usage(self.size);
                    state.dev = Some(MemHandle::Host(Arc::clone(host)));
                }
            }
        }
        if state.dev.is_none() {
            state.dev = Some(self.device.malloc_device(self.size)?);
        }
        Ok(state.dev.as_ref().unwrap().clone())
    }

    fn to_cpu(&self, state: &mut SyncState) -> Result<()> {
        match state.head {
            SyncHead::Uninitialized => {
                self.ensure_host(state);
                state.head = SyncHead::HeadAtCpu;
            }
            SyncHead::HeadAtGpu => {
                let host = self.ensure_host(state);
                let dev = state.dev.as_ref().expect("device head without allocation");
                let same = matches!(dev, MemHandle::Host(b) if Arc::ptr_eq(b, &host));
                if !same {
                    let src: VPtr<u8> = VPtr::new(dev.clone());
                    let dst = unsafe { host.bytes_mut() };
                    self.device.memcpy_d2h(self.size, &src, dst)?;
                }
                state.head = SyncHead::Synced;
            }
            SyncHead::HeadAtCpu | SyncHead::Synced => {}
        }
        Ok(())
    }

    fn to_gpu(&self, state: &mut SyncState) -> Result<()> {
        match state.head {
            SyncHead::Uninitialized => {
                self.ensure_device(state)?;
                state.head = SyncHead::HeadAtGpu;
            }
            SyncHead::HeadAtCpu => {
                let dev = self.ensure_device(state)?;
                let host = state.host.as_ref().expect("host head without allocation");
                let same = matches!(&dev, MemHandle::Host(b) if Arc::ptr_eq(b, host));
                if !same {
                    let dst: VPtr<u8> = VPtr::new(dev.clone());
                    let src = unsafe { host.bytes() };
                    self.device.memcpy_h2d(self.size, src, &dst)?;
                }
                state.head = SyncHead::Synced;
            }
            SyncHead::HeadAtGpu | SyncHead::Synced => {}
        }
        Ok(())
    }

    /// Read-side host view; synchronizes if the device copy is ahead.
    pub fn cpu_data(&self) -> Result<Arc<HostBuffer>> {
        let mut state = self.state.lock();
        self.to_cpu(&mut state)?;
        Ok(Arc::clone(state.host.as_ref().unwrap()))
    }

    /// Write-side host view; the device copy becomes stale.
    pub fn mutable_cpu_data(&self) -> Result<Arc<HostBuffer>> {
        let mut state = self.state.lock();
        self.to_cpu(&mut state)?;
        state.head = SyncHead::HeadAtCpu;
        Ok(Arc::clone(state.host.as_ref().unwrap()))
    }

    /// Read-side device view; synchronizes if the host copy is ahead.
    pub fn gpu_data(&self) -> Result<VPtr<u8>> {
        let mut state = self.state.lock();
        self.to_gpu(&mut state)?;
        Ok(VPtr::new(state.dev.as_ref().unwrap().clone()))
    }

    /// Write-side device view; the host copy becomes stale.
    pub fn mutable_gpu_data(&self) -> Result<VPtr<u8>> {
        let mut state = self.state.lock();
        self.to_gpu(&mut state)?;
        state.head = SyncHead::HeadAtGpu;
        Ok(VPtr::new(state.dev.as_ref().unwrap().clone()))
    }
}

impl Drop for SyncedMemory {
    fn drop(&mut self) {
        let mut state = self.state.lock();
        if let Some(handle) = state.dev.take() {
            self.device.free_device(handle);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_starts_uninitialized() {
        let dev = Device::cpu();
        let mem = SyncedMemory::new(dev, 64);
        assert_eq!(mem.head(), SyncHead::Uninitialized);
        assert_eq!(mem.size(), 64);
    }

    #[test]
    fn test_host_then_device_round_trip() {
        let dev = Device::cpu();
        let mem = SyncedMemory::new(Arc::clone(&dev), 16);

        let host = mem.mutable_cpu_data().unwrap();
        unsafe { host.bytes_mut() }.copy_from_slice(&[7u8; 16]);
        assert_eq!(mem.head(), SyncHead::HeadAtCpu);

        let gpu = mem.gpu_data().unwrap();
        let mut out = [0u8; 16];
        dev.memcpy_d2h(16, &gpu, &mut out).unwrap();
        assert_eq!(out, [7u8; 16]);
        assert_eq!(mem.head(), SyncHead::Synced);
    }

    #[test]
    fn test_device_then_host_round_trip() {
        let dev = Device::cpu();
        let mem = SyncedMemory::new(Arc::clone(&dev), 8);

        let gpu = mem.mutable_gpu_data().unwrap();
        dev.memcpy_h2d(8, &[3u8; 8], &gpu).unwrap();
        assert_eq!(mem.head(), SyncHead::HeadAtGpu);

        let host = mem.cpu_data().unwrap();
        assert_eq!(unsafe { host.bytes() }, &[3u8; 8]);
        assert_eq!(mem.head(), SyncHead::Synced);
    }

    #[test]
    fn test_mutation_invalidates_other_side() {
        let dev = Device::cpu();
        let mem = SyncedMemory::new(dev, 4);
        mem.mutable_gpu_data().unwrap();
        assert_eq!(mem.head(), SyncHead::HeadAtGpu);
        mem.mutable_cpu_data().unwrap();
        assert_eq!(mem.head(), SyncHead::HeadAtCpu);
    }

    #[test]
    fn test_device_allocation_is_counted() {
        let dev = Device::cpu();
        let before = dev.memory_usage();
        {
            let mem = SyncedMemory::new(Arc::clone(&dev), 128);
            mem.mutable_gpu_data().unwrap();
            assert_eq!(dev.memory_usage(), before + 128);
        }
        assert_eq!(dev.memory_usage(), before);
    }
}
