//! OpenCL memory objects.

use std::sync::Arc;

use ocl::flags::{MapFlags, MemFlags};
use ocl::{Buffer, MemMap};

use super::context::{ClContext, ClError};

/// A raw byte allocation on one OpenCL device.
///
/// Wraps an `cl_mem` object; offsets cannot be folded into the handle,
/// so they travel next to it (see the split-argument convention in the
/// kernel source emitter).
#[derive(Debug, Clone)]
pub struct ClBuffer {
    inner: Buffer<u8>,
    ctx: Arc<ClContext>,
    nbytes: usize,
}

impl ClBuffer {
    /// Allocate `nbytes` of zero-filled device memory.
    pub fn zeros(ctx: &Arc<ClContext>, nbytes: usize) -> Result<Self, ClError> {
        let inner = Buffer::<u8>::builder()
            .queue(ctx.queue(0).clone())
            .len(nbytes.max(1))
            .flags(MemFlags::new().read_write())
            .fill_val(0u8)
            .build()
            .map_err(|e| ClError::Memory(format!("alloc({nbytes} bytes): {e}")))?;
        Ok(Self {
            inner,
            ctx: Arc::clone(ctx),
            nbytes,
        })
    }

    /// Allocate and fill from host bytes.
    pub fn from_host(ctx: &Arc<ClContext>, data: &[u8]) -> Result<Self, ClError> {
        let buf = Self::zeros(ctx, data.len())?;
        buf.write(0, data)?;
        Ok(buf)
    }

    /// Write host bytes at `byte_offset`.
    pub fn write(&self, byte_offset: usize, data: &[u8]) -> Result<(), ClError> {
        self.check_range(byte_offset, data.len(), "write")?;
        self.inner
            .write(data)
            .offset(byte_offset)
            .enq()
            .map_err(|e| ClError::Memory(format!("buffer write: {e}")))
    }

    /// Read into host bytes from `byte_offset`.
    pub fn read(&self, byte_offset: usize, out: &mut [u8]) -> Result<(), ClError> {
        self.check_range(byte_offset, out.len(), "read")?;
        self.inner
            .read(&mut *out)
            .offset(byte_offset)
            .enq()
            .map_err(|e| ClError::Memory(format!("buffer read: {e}")))
    }

    /// Map `len` bytes at `byte_offset` into host memory. The mapping is
    /// released when the returned handle drops (unmap is enqueued).
    ///
    /// # Safety
    /// No kernel may touch the mapped range while the map is alive.
    pub unsafe fn map(
        &self,
        byte_offset: usize,
        len: usize,
        write: bool,
    ) -> Result<MemMap<u8>, ClError> {
        self.check_range(byte_offset, len, "map")?;
        let flags = if write {
            MapFlags::new().read().write()
        } else {
            MapFlags::new().read()
        };
        self.inner
            .map()
            .flags(flags)
            .offset(byte_offset)
            .len(len)
            .enq()
            .map_err(|e| ClError::Memory(format!("buffer map: {e}")))
    }

    fn check_range(&self, off: usize, len: usize, what: &str) -> Result<(), ClError> {
        if off + len > self.nbytes {
            return Err(ClError::Memory(format!(
                "{what} of {len} bytes at offset {off} exceeds allocation of {}",
                self.nbytes
            )));
        }
        Ok(())
    }

    /// The raw memory object for kernel-argument binding.
    pub fn as_mem(&self) -> &ocl::core::Mem {
        self.inner.as_core()
    }

    pub fn context(&self) -> &Arc<ClContext> {
        &self.ctx
    }

    pub fn len(&self) -> usize {
        self.nbytes
    }

    pub fn is_empty(&self) -> bool {
        self.nbytes == 0
    }
}

/// Device-to-device copy within one context.
pub fn copy_d2d(
    src: &ClBuffer,
    src_off: usize,
    dst: &ClBuffer,
    dst_off: usize,
    nbytes: usize,
) -> Result<(), ClError> {
    let mut staging = vec![0u8; nbytes];
    src.read(src_off, &mut staging)?;
    dst.write(dst_off, &staging)
}
