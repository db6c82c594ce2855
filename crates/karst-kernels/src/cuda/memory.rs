//! GPU memory buffers and host↔device transfer.

use std::sync::Arc;

use cudarc::driver::{CudaDevice, CudaSlice, DevicePtr};
use parking_lot::Mutex;

use super::context::{get_device, CudaError};

/// A raw byte allocation on one CUDA device.
///
/// Reference-counted so pointer views can share the allocation without
/// owning it; the backing memory is freed when the last handle drops.
/// The inner slice sits behind a mutex because partial transfers need a
/// mutable subview, while handles are shared.
#[derive(Debug, Clone)]
pub struct CudaBuffer {
    inner: Arc<Mutex<CudaSlice<u8>>>,
    device_idx: usize,
    nbytes: usize,
}

impl CudaBuffer {
    /// Allocate `nbytes` of zeroed device memory.
    pub fn zeros(device_idx: usize, nbytes: usize) -> Result<Self, CudaError> {
        let dev = get_device(device_idx)?;
        let slice = dev
            .alloc_zeros::<u8>(nbytes)
            .map_err(|e| CudaError::Memory(format!("alloc_zeros({nbytes} bytes): {e}")))?;
        Ok(Self {
            inner: Arc::new(Mutex::new(slice)),
            device_idx,
            nbytes,
        })
    }

    /// Copy host bytes into a new device buffer (H2D).
    pub fn from_host(device_idx: usize, data: &[u8]) -> Result<Self, CudaError> {
        let dev = get_device(device_idx)?;
        let nbytes = data.len();
        let slice = dev
            .htod_copy(data.to_vec())
            .map_err(|e| CudaError::Memory(format!("htod_copy({nbytes} bytes): {e}")))?;
        Ok(Self {
            inner: Arc::new(Mutex::new(slice)),
            device_idx,
            nbytes,
        })
    }

    /// Copy the whole buffer back to the host (D2H, synchronous).
    pub fn to_host(&self) -> Result<Vec<u8>, CudaError> {
        let dev = self.device()?;
        let guard = self.inner.lock();
        dev.dtoh_sync_copy(&*guard)
            .map_err(|e| CudaError::Memory(format!("dtoh_sync_copy: {e}")))
    }

    /// Write `data` into the buffer at `byte_offset`.
    pub fn write(&self, byte_offset: usize, data: &[u8]) -> Result<(), CudaError> {
        self.check_range(byte_offset, data.len(), "write")?;
        let dev = self.device()?;
        let mut guard = self.inner.lock();
        let mut sub = guard.slice_mut(byte_offset..byte_offset + data.len());
        dev.htod_sync_copy_into(data, &mut sub)
            .map_err(|e| CudaError::Memory(format!("htod_sync_copy_into: {e}")))
    }

    /// Read `out.len()` bytes starting at `byte_offset`.
    pub fn read(&self, byte_offset: usize, out: &mut [u8]) -> Result<(), CudaError> {
        self.check_range(byte_offset, out.len(), "read")?;
        let dev = self.device()?;
        let guard = self.inner.lock();
        let sub = guard.slice(byte_offset..byte_offset + out.len());
        dev.dtoh_sync_copy_into(&sub, out)
            .map_err(|e| CudaError::Memory(format!("dtoh_sync_copy_into: {e}")))
    }

    /// Raw device pointer of the allocation base plus `byte_offset`,
    /// for kernel launches.
    pub fn device_ptr(&self, byte_offset: usize) -> u64 {
        *self.inner.lock().device_ptr() + byte_offset as u64
    }

    fn check_range(&self, off: usize, len: usize, what: &str) -> Result<(), CudaError> {
        if off + len > self.nbytes {
            return Err(CudaError::Memory(format!(
                "{what} of {len} bytes at offset {off} exceeds allocation of {}",
                self.nbytes
            )));
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.nbytes
    }

    pub fn is_empty(&self) -> bool {
        self.nbytes == 0
    }

    pub fn device_idx(&self) -> usize {
        self.device_idx
    }

    pub fn device(&self) -> Result<Arc<CudaDevice>, CudaError> {
        get_device(self.device_idx)
    }
}

/// Device-to-device copy, staged through the host. Peer-to-peer copies
/// can replace this once needed.
pub fn copy_d2d(
    src: &CudaBuffer,
    src_off: usize,
    dst: &CudaBuffer,
    dst_off: usize,
    nbytes: usize,
) -> Result<(), CudaError> {
    let mut staging = vec![0u8; nbytes];
    src.read(src_off, &mut staging)?;
    dst.write(dst_off, &staging)
}
