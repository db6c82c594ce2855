//! Backend-polymorphic typed device pointers.

use std::marker::PhantomData;
use std::sync::Arc;

use karst_kernels::cpu::HostBuffer;

#[cfg(feature = "cuda")]
use karst_kernels::cuda::CudaBuffer;
#[cfg(feature = "opencl")]
use karst_kernels::opencl::ClBuffer;

use crate::backend::Backend;
use crate::dtype::Element;
use crate::error::{Error, Result};

/// Reference to a backend memory allocation: host buffer, CUDA device
/// allocation, or OpenCL memory object.
///
/// Handles are reference-counted views — cloning never copies device
/// memory, and dropping a handle never frees memory still referenced
/// elsewhere. Allocation lifetime is owned by `SyncedMemory` (or by
/// whoever called the raw allocator).
#[derive(Debug, Clone)]
pub enum MemHandle {
    Host(Arc<HostBuffer>),
    #[cfg(feature = "cuda")]
    Cuda(CudaBuffer),
    #[cfg(feature = "opencl")]
    OpenCl(ClBuffer),
}

impl MemHandle {
    pub fn backend(&self) -> Backend {
        match self {
            MemHandle::Host(_) => Backend::Cpu,
            #[cfg(feature = "cuda")]
            MemHandle::Cuda(_) => Backend::Cuda,
            #[cfg(feature = "opencl")]
            MemHandle::OpenCl(_) => Backend::OpenCl,
        }
    }

    /// Allocation size in bytes.
    pub fn len(&self) -> usize {
        match self {
            MemHandle::Host(b) => b.len(),
            #[cfg(feature = "cuda")]
            MemHandle::Cuda(b) => b.len(),
            #[cfg(feature = "opencl")]
            MemHandle::OpenCl(b) => b.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether two handles reference the same allocation.
    pub fn same_allocation(&self, other: &MemHandle) -> bool {
        match (self, other) {
            (MemHandle::Host(a), MemHandle::Host(b)) => Arc::ptr_eq(a, b),
            #[cfg(feature = "cuda")]
            (MemHandle::Cuda(a), MemHandle::Cuda(b)) => a.device_ptr(0) == b.device_ptr(0),
            #[cfg(feature = "opencl")]
            (MemHandle::OpenCl(a), MemHandle::OpenCl(b)) => {
                a.as_mem().as_ptr() == b.as_mem().as_ptr()
            }
            #[allow(unreachable_patterns)]
            _ => false,
        }
    }
}

/// A typed, non-owning view into backend memory with a byte offset.
///
/// Offset arithmetic works in elements of `T` and only ever adjusts the
/// logical offset, never the underlying handle; staying inside the
/// backing allocation is the caller's responsibility, like any device
/// pointer. Reinterpreting between element types preserves the handle
/// and the byte offset.
#[derive(Debug, Clone)]
pub struct VPtr<T: Element> {
    mem: MemHandle,
    byte_offset: usize,
    _marker: PhantomData<T>,
}

impl<T: Element> VPtr<T> {
    pub fn new(mem: MemHandle) -> Self {
        Self::with_offset(mem, 0)
    }

    pub fn with_offset(mem: MemHandle, byte_offset: usize) -> Self {
        Self {
            mem,
            byte_offset,
            _marker: PhantomData,
        }
    }

    pub fn backend(&self) -> Backend {
        self.mem.backend()
    }

    pub fn mem(&self) -> &MemHandle {
        &self.mem
    }

    /// Byte offset into the backing allocation.
    pub fn byte_offset(&self) -> usize {
        self.byte_offset
    }

    /// Element offset into the backing allocation.
    pub fn elem_offset(&self) -> usize {
        self.byte_offset / std::mem::size_of::<T>()
    }

    /// Advance by `n` elements.
    pub fn inc(&mut self, n: usize) {
        self.byte_offset += n * std::mem::size_of::<T>();
    }

    /// Rewind by `n` elements.
    pub fn dec(&mut self, n: usize) {
        self.byte_offset -= n * std::mem::size_of::<T>();
    }

    /// A new view advanced by `n` elements.
    pub fn offset_by(&self, n: usize) -> Self {
        Self::with_offset(self.mem.clone(), self.byte_offset + n * std::mem::size_of::<T>())
    }

    /// An independent duplicate sharing the same backing memory and
    /// offset.
    pub fn instance(&self) -> Self {
        self.clone()
    }

    /// Reinterpret the element type, preserving handle and byte offset.
    pub fn cast<U: Element>(&self) -> VPtr<U> {
        VPtr {
            mem: self.mem.clone(),
            byte_offset: self.byte_offset,
            _marker: PhantomData,
        }
    }

    /// The host buffer behind this pointer, or a clean error when the
    /// pointer belongs to a different backend.
    pub fn host(&self) -> Result<&Arc<HostBuffer>> {
        match &self.mem {
            MemHandle::Host(b) => Ok(b),
            other => Err(Error::BackendMismatch {
                expected: Backend::Cpu,
                got: other.backend(),
            }),
        }
    }

    /// Typed host slice of `n` elements at this pointer's offset.
    ///
    /// # Safety
    /// Device-memory aliasing rules: no conflicting access may be in
    /// flight, and the range must stay inside the allocation.
    pub unsafe fn host_slice(&self, n: usize) -> Result<&[T]> {
        Ok(self.host()?.slice(self.byte_offset, n))
    }

    /// Mutable typed host slice of `n` elements.
    ///
    /// # Safety
    /// Same rules as [`Self::host_slice`].
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn host_slice_mut(&self, n: usize) -> Result<&mut [T]> {
        Ok(self.host()?.slice_mut(self.byte_offset, n))
    }

    /// The CUDA buffer behind this pointer.
    #[cfg(feature = "cuda")]
    pub fn cuda(&self) -> Result<&CudaBuffer> {
        match &self.mem {
            MemHandle::Cuda(b) => Ok(b),
            other => Err(Error::BackendMismatch {
                expected: Backend::Cuda,
                got: other.backend(),
            }),
        }
    }

    /// The OpenCL buffer behind this pointer.
    #[cfg(feature = "opencl")]
    pub fn opencl(&self) -> Result<&ClBuffer> {
        match &self.mem {
            MemHandle::OpenCl(b) => Ok(b),
            other => Err(Error::BackendMismatch {
                expected: Backend::OpenCl,
                got: other.backend(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn host_ptr(bytes: usize) -> VPtr<f32> {
        VPtr::new(MemHandle::Host(Arc::new(HostBuffer::new(bytes))))
    }

    #[test]
    fn test_offset_algebra() {
        let mut p = host_ptr(1024);
        p.inc(3);
        p.inc(4);
        let mut q = host_ptr(1024);
        q.inc(7);
        assert_eq!(p.elem_offset(), q.elem_offset());

        p.dec(7);
        assert_eq!(p.elem_offset(), 0);
        assert_eq!(p.byte_offset(), 0);
    }

    #[test]
    fn test_offset_by_is_non_destructive() {
        let p = host_ptr(64);
        let q = p.offset_by(4);
        assert_eq!(p.elem_offset(), 0);
        assert_eq!(q.elem_offset(), 4);
        assert!(p.mem().same_allocation(q.mem()));
    }

    #[test]
    fn test_cast_preserves_byte_offset() {
        let mut p = host_ptr(64);
        p.inc(2); // 8 bytes
        let q: VPtr<f64> = p.cast();
        assert_eq!(q.byte_offset(), 8);
        assert_eq!(q.elem_offset(), 1);
        let back: VPtr<f32> = q.cast();
        assert_eq!(back.elem_offset(), 2);
    }

    #[test]
    fn test_instance_shares_memory() {
        let p = host_ptr(16);
        let q = p.instance();
        assert!(p.mem().same_allocation(q.mem()));
        assert_eq!(p.byte_offset(), q.byte_offset());
    }

    #[test]
    fn test_host_accessor_backend_check() {
        let p = host_ptr(16);
        assert!(p.host().is_ok());
    }

    #[test]
    fn test_host_slice_views() {
        let p = host_ptr(32);
        unsafe {
            let w = p.host_slice_mut(4).unwrap();
            w.copy_from_slice(&[1.0, 2.0, 3.0, 4.0]);
        }
        let q = p.offset_by(1);
        let r = unsafe { q.host_slice(3).unwrap() };
        assert_eq!(r, &[2.0, 3.0, 4.0]);
    }
}
