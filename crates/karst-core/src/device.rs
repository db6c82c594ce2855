//! The per-device dispatch object.
//!
//! One `Device` exists per compute device for the process lifetime. It
//! owns the backend state, the memory-usage counters, the queue
//! selection, and the cache of compiled kernel programs. The numeric
//! primitive API lives in [`crate::device_math`] and
//! [`crate::device_im2col`]; this module carries memory management,
//! queues, introspection, and program plumbing.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use karst_kernels::cpu::HostBuffer;

use crate::backend::Backend;
use crate::backends::BackendImpl;
use crate::dtype::{half_ops_enabled, Element, ElemKind, Numeric};
use crate::error::{Error, Result};
use crate::program::{DeviceProgram, ProgramFamily, ProgramTarget};
use crate::vptr::{MemHandle, VPtr};

/// Workgroup cap for 1-D launches.
const DEFAULT_LOCAL_SIZE: usize = 256;

/// One compute device: dispatch target for all numeric primitives.
pub struct Device {
    pub(crate) backend: BackendImpl,
    backend_kind: Backend,
    id: usize,
    list_id: AtomicUsize,
    name: String,
    vendor: String,
    current_queue: AtomicUsize,
    num_queues: usize,
    max_local_size: usize,
    max_local_sizes: [usize; 3],
    max_group_sizes: [usize; 3],
    host_unified: bool,
    fast_unsafe_math: bool,
    memory_usage: AtomicUsize,
    peak_memory_usage: AtomicUsize,
    programs: Mutex<HashMap<(ElemKind, ProgramFamily), Arc<DeviceProgram>>>,
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("backend", &self.backend_kind)
            .field("id", &self.id)
            .field("name", &self.name)
            .finish()
    }
}

impl Device {
    /// The host device. Host and device views of its memory are
    /// unified, so synchronization is free.
    pub fn cpu() -> Arc<Device> {
        let backend = BackendImpl::Cpu(crate::backends::cpu::CpuBackend);
        let (name, vendor) = match &backend {
            BackendImpl::Cpu(b) => (b.name(), b.vendor()),
            #[allow(unreachable_patterns)]
            _ => unreachable!(),
        };
        let dev = Arc::new(Self {
            backend,
            backend_kind: Backend::Cpu,
            id: 0,
            list_id: AtomicUsize::new(0),
            name,
            vendor,
            current_queue: AtomicUsize::new(0),
            num_queues: 1,
            max_local_size: 1,
            max_local_sizes: [1, 1, 1],
            max_group_sizes: [usize::MAX, usize::MAX, usize::MAX],
            host_unified: true,
            fast_unsafe_math: false,
            memory_usage: AtomicUsize::new(0),
            peak_memory_usage: AtomicUsize::new(0),
            programs: Mutex::new(HashMap::new()),
        });
        dev.init();
        dev
    }

    /// Open CUDA device `ordinal`.
    #[cfg(feature = "cuda")]
    pub fn cuda(ordinal: usize) -> Result<Arc<Device>> {
        let b = crate::backends::cuda::CudaBackend::new(ordinal)?;
        let name = b.name();
        let dev = Arc::new(Self {
            backend: BackendImpl::Cuda(b),
            backend_kind: Backend::Cuda,
            id: ordinal,
            list_id: AtomicUsize::new(0),
            name,
            vendor: "nvidia".to_string(),
            current_queue: AtomicUsize::new(0),
            num_queues: 1,
            max_local_size: 1024,
            max_local_sizes: [1024, 1024, 64],
            max_group_sizes: [2147483647, 65535, 65535],
            host_unified: false,
            fast_unsafe_math: true,
            memory_usage: AtomicUsize::new(0),
            peak_memory_usage: AtomicUsize::new(0),
            programs: Mutex::new(HashMap::new()),
        });
        dev.init();
        Ok(dev)
    }

    /// Open OpenCL device `ordinal` (flat ordinal over all platforms).
    #[cfg(feature = "opencl")]
    pub fn opencl(ordinal: usize) -> Result<Arc<Device>> {
        let b = crate::backends::opencl::OclBackend::new(ordinal)?;
        let name = b.name();
        let vendor = b.vendor();
        let wg = b.ctx().max_workgroup_size();
        let host_unified = b.is_cpu_class();
        let num_queues = b.ctx().num_queues();
        let dev = Arc::new(Self {
            backend: BackendImpl::OpenCl(b),
            backend_kind: Backend::OpenCl,
            id: ordinal,
            list_id: AtomicUsize::new(0),
            name,
            vendor,
            current_queue: AtomicUsize::new(0),
            num_queues,
            max_local_size: wg,
            max_local_sizes: [wg, wg, wg],
            max_group_sizes: [65536, 65536, 65536],
            host_unified,
            fast_unsafe_math: true,
            memory_usage: AtomicUsize::new(0),
            peak_memory_usage: AtomicUsize::new(0),
            programs: Mutex::new(HashMap::new()),
        });
        dev.init();
        Ok(dev)
    }

    fn init(&self) {
        tracing::debug!(
            "device ready: {} ({}, id {}, workgroup {})",
            self.name,
            self.backend_kind,
            self.id,
            self.max_local_size
        );
    }

    // ---- identity & introspection ----

    pub fn backend(&self) -> Backend {
        self.backend_kind
    }

    /// Backend-numbered device id.
    pub fn id(&self) -> usize {
        self.id
    }

    /// Position in the owning context's device list.
    pub fn list_id(&self) -> usize {
        self.list_id.load(Ordering::Relaxed)
    }

    pub(crate) fn set_list_id(&self, id: usize) {
        self.list_id.store(id, Ordering::Relaxed);
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Substring match against the device vendor string.
    pub fn check_vendor(&self, vendor: &str) -> bool {
        self.vendor.to_lowercase().contains(&vendor.to_lowercase())
    }

    /// Match against the coarse device class: "CPU" or "GPU".
    pub fn check_type(&self, ty: &str) -> bool {
        let is_cpu_like = match &self.backend {
            BackendImpl::Cpu(_) => true,
            #[cfg(feature = "cuda")]
            BackendImpl::Cuda(_) => false,
            #[cfg(feature = "opencl")]
            BackendImpl::OpenCl(b) => b.is_cpu_class(),
        };
        match ty {
            "CPU" => is_cpu_like,
            "GPU" => !is_cpu_like,
            _ => false,
        }
    }

    /// Capability probe by name ("fp64", "fp16").
    pub fn check_capability(&self, cap: &str) -> bool {
        match cap {
            "fp64" => true,
            "fp16" => half_ops_enabled(),
            _ => false,
        }
    }

    /// Whether host and device address the same memory.
    pub fn is_host_unified(&self) -> bool {
        self.host_unified
    }

    /// Whether generated programs build with fast/relaxed math.
    pub fn is_fast_unsafe_math(&self) -> bool {
        self.fast_unsafe_math
    }

    /// Workgroup size limit along dimension `id`.
    pub fn workgroup_size(&self, id: usize) -> usize {
        self.max_local_sizes.get(id).copied().unwrap_or(1)
    }

    // ---- memory accounting ----

    pub fn memory_usage(&self) -> usize {
        self.memory_usage.load(Ordering::Relaxed)
    }

    pub fn peak_memory_usage(&self) -> usize {
        self.peak_memory_usage.load(Ordering::Relaxed)
    }

    pub fn increase_memory_usage(&self, bytes: usize) {
        let now = self.memory_usage.fetch_add(bytes, Ordering::Relaxed) + bytes;
        self.peak_memory_usage.fetch_max(now, Ordering::Relaxed);
    }

    pub fn decrease_memory_usage(&self, bytes: usize) {
        self.memory_usage.fetch_sub(bytes, Ordering::Relaxed);
    }

    pub fn reset_peak_memory_usage(&self) {
        self.peak_memory_usage
            .store(self.memory_usage(), Ordering::Relaxed);
    }

    // ---- allocation ----

    /// Allocate zero-filled device memory, counted against this
    /// device's usage.
    pub fn malloc_device(&self, nbytes: usize) -> Result<MemHandle> {
        let handle = match &self.backend {
            BackendImpl::Cpu(_) => MemHandle::Host(Arc::new(HostBuffer::new(nbytes))),
            #[cfg(feature = "cuda")]
            BackendImpl::Cuda(b) => MemHandle::Cuda(karst_kernels::cuda::CudaBuffer::zeros(
                b.ordinal(),
                nbytes,
            )?),
            #[cfg(feature = "opencl")]
            BackendImpl::OpenCl(b) => {
                MemHandle::OpenCl(karst_kernels::opencl::ClBuffer::zeros(b.ctx(), nbytes)?)
            }
        };
        self.increase_memory_usage(nbytes);
        Ok(handle)
    }

    /// Release a device allocation and uncount it. The memory itself is
    /// freed once the last view drops.
    pub fn free_device(&self, handle: MemHandle) {
        self.decrease_memory_usage(handle.len());
        drop(handle);
    }

    // ---- raw copies ----

    /// Host → device, `n` bytes.
    pub fn memcpy_h2d(&self, n: usize, src: &[u8], dst: &VPtr<u8>) -> Result<()> {
        match dst.mem() {
            MemHandle::Host(b) => {
                unsafe { b.slice_mut::<u8>(dst.byte_offset(), n) }.copy_from_slice(&src[..n]);
                Ok(())
            }
            #[cfg(feature = "cuda")]
            MemHandle::Cuda(b) => Ok(b.write(dst.byte_offset(), &src[..n])?),
            #[cfg(feature = "opencl")]
            MemHandle::OpenCl(b) => Ok(b.write(dst.byte_offset(), &src[..n])?),
        }
    }

    /// Device → host, `n` bytes.
    pub fn memcpy_d2h(&self, n: usize, src: &VPtr<u8>, dst: &mut [u8]) -> Result<()> {
        match src.mem() {
            MemHandle::Host(b) => {
                dst[..n].copy_from_slice(unsafe { b.slice::<u8>(src.byte_offset(), n) });
                Ok(())
            }
            #[cfg(feature = "cuda")]
            MemHandle::Cuda(b) => Ok(b.read(src.byte_offset(), &mut dst[..n])?),
            #[cfg(feature = "opencl")]
            MemHandle::OpenCl(b) => Ok(b.read(src.byte_offset(), &mut dst[..n])?),
        }
    }

    /// Device → device, `n` bytes, same backend.
    pub fn memcpy_d2d(&self, n: usize, src: &VPtr<u8>, dst: &VPtr<u8>) -> Result<()> {
        if n == 0 {
            return Ok(());
        }
        match (src.mem(), dst.mem()) {
            (MemHandle::Host(s), MemHandle::Host(d)) => {
                // Copies within one allocation at the same offset are
                // no-ops (unified host/device views share storage).
                if Arc::ptr_eq(s, d) && src.byte_offset() == dst.byte_offset() {
                    return Ok(());
                }
                let src_slice = unsafe { s.slice::<u8>(src.byte_offset(), n) };
                let dst_slice = unsafe { d.slice_mut::<u8>(dst.byte_offset(), n) };
                dst_slice.copy_from_slice(src_slice);
                Ok(())
            }
            #[cfg(feature = "cuda")]
            (MemHandle::Cuda(s), MemHandle::Cuda(d)) => Ok(karst_kernels::cuda::memory::copy_d2d(
                s,
                src.byte_offset(),
                d,
                dst.byte_offset(),
                n,
            )?),
            #[cfg(feature = "opencl")]
            (MemHandle::OpenCl(s), MemHandle::OpenCl(d)) => {
                Ok(karst_kernels::opencl::memory::copy_d2d(
                    s,
                    src.byte_offset(),
                    d,
                    dst.byte_offset(),
                    n,
                )?)
            }
            #[allow(unreachable_patterns)]
            (s, d) => Err(Error::BackendMismatch {
                expected: s.backend(),
                got: d.backend(),
            }),
        }
    }

    /// Fill `n` bytes with `value`.
    pub fn memset(&self, n: usize, value: u8, dst: &VPtr<u8>) -> Result<()> {
        match dst.mem() {
            MemHandle::Host(b) => {
                unsafe { b.slice_mut::<u8>(dst.byte_offset(), n) }.fill(value);
                Ok(())
            }
            #[cfg(feature = "cuda")]
            MemHandle::Cuda(b) => Ok(b.write(dst.byte_offset(), &vec![value; n])?),
            #[cfg(feature = "opencl")]
            MemHandle::OpenCl(b) => Ok(b.write(dst.byte_offset(), &vec![value; n])?),
        }
    }

    /// Typed device → device copy of `n` elements.
    pub fn copy<T: Numeric>(&self, n: usize, x: &VPtr<T>, y: &VPtr<T>) -> Result<()> {
        self.memcpy_d2d(n * std::mem::size_of::<T>(), &x.cast(), &y.cast())
    }

    /// Typed host → device copy of `n` elements.
    pub fn copy_from_host<T: Element>(&self, n: usize, src: &[T], dst: &VPtr<T>) -> Result<()> {
        self.memcpy_h2d(
            n * std::mem::size_of::<T>(),
            bytemuck::cast_slice(&src[..n]),
            &dst.cast(),
        )
    }

    /// Typed device → host copy of `n` elements.
    pub fn copy_to_host<T: Element>(&self, n: usize, src: &VPtr<T>, dst: &mut [T]) -> Result<()> {
        self.memcpy_d2h(
            n * std::mem::size_of::<T>(),
            &src.cast(),
            bytemuck::cast_slice_mut(&mut dst[..n]),
        )
    }

    // ---- queues ----

    /// Select the active command queue.
    pub fn switch_queue(&self, id: usize) -> Result<()> {
        if id >= self.num_queues {
            return Err(Error::DeviceInit(format!(
                "queue {id} out of range ({} queues)",
                self.num_queues
            )));
        }
        self.current_queue.store(id, Ordering::Relaxed);
        Ok(())
    }

    pub fn current_queue_id(&self) -> usize {
        self.current_queue.load(Ordering::Relaxed)
    }

    pub fn num_queues(&self) -> usize {
        self.num_queues
    }

    /// Block until all enqueued work on this device completes. The only
    /// implicit synchronization points are scalar reads (dot, asum).
    pub fn finish_queues(&self) -> Result<()> {
        match &self.backend {
            BackendImpl::Cpu(_) => Ok(()),
            #[cfg(feature = "cuda")]
            BackendImpl::Cuda(b) => Ok(b.synchronize()?),
            #[cfg(feature = "opencl")]
            BackendImpl::OpenCl(b) => Ok(b.ctx().finish()?),
        }
    }

    // ---- launch sizing ----

    /// Pick group/local sizes for a launch over `work_size` items.
    pub fn get_threads(
        &self,
        work_size: &[usize],
        group: &mut Vec<usize>,
        local: &mut Vec<usize>,
        _auto_select: bool,
    ) {
        group.clear();
        local.clear();
        for (dim, &ws) in work_size.iter().enumerate() {
            let cap = if dim == 0 {
                self.max_local_size.min(DEFAULT_LOCAL_SIZE).max(1)
            } else {
                1
            };
            // Largest power of two that fits the cap. Group counts are
            // clamped to the device limit; the generated kernels stride
            // their grid, so a short launch still covers all work.
            let mut l = 1;
            while l * 2 <= cap {
                l *= 2;
            }
            local.push(l);
            let limit = self.max_group_sizes.get(dim).copied().unwrap_or(1);
            group.push(ws.div_ceil(l).clamp(1, limit));
        }
    }

    // ---- programs ----

    /// A fresh, empty program targeting this device's backend. Custom
    /// (JIT) layers use this with the same generate/compile/get-kernel
    /// flow as the built-in families.
    pub fn create_program(&self, identifier: &str) -> Result<DeviceProgram> {
        match &self.backend {
            BackendImpl::Cpu(_) => Err(Error::Unsupported {
                op: "create_program",
                backend: Backend::Cpu,
            }),
            #[cfg(feature = "cuda")]
            BackendImpl::Cuda(b) => Ok(DeviceProgram::new(
                ProgramTarget::Cuda {
                    dev: Arc::clone(b.device()),
                    device_idx: b.ordinal(),
                },
                identifier,
                self.fast_unsafe_math,
            )),
            #[cfg(feature = "opencl")]
            BackendImpl::OpenCl(b) => Ok(DeviceProgram::new(
                ProgramTarget::OpenCl {
                    ctx: Arc::clone(b.ctx()),
                },
                identifier,
                self.fast_unsafe_math,
            )),
        }
    }

    /// The compiled math program for `kind`, built on first use.
    pub fn math_program(&self, kind: ElemKind) -> Result<Arc<DeviceProgram>> {
        self.cached_program(kind, ProgramFamily::Math)
    }

    /// The compiled im2col program for `kind`, built on first use.
    pub fn im2col_program(&self, kind: ElemKind) -> Result<Arc<DeviceProgram>> {
        self.cached_program(kind, ProgramFamily::Im2col)
    }

    fn cached_program(&self, kind: ElemKind, family: ProgramFamily) -> Result<Arc<DeviceProgram>> {
        if kind.is_half() && !half_ops_enabled() {
            return Err(Error::NotImplemented {
                op: "program generation",
                kind,
                backend: self.backend_kind,
            });
        }
        let mut cache = self.programs.lock();
        if let Some(p) = cache.get(&(kind, family)) {
            return Ok(Arc::clone(p));
        }
        let program = match family {
            ProgramFamily::Math => crate::device_math::build_math_program(self, kind)?,
            ProgramFamily::Im2col => crate::device_im2col::build_im2col_program(self, kind)?,
        };
        let program = Arc::new(program);
        cache.insert((kind, family), Arc::clone(&program));
        tracing::debug!(
            "compiled {:?} program for {} on {}",
            family,
            kind,
            self.name
        );
        Ok(program)
    }

    /// Fail fast when a half-precision op is dispatched without
    /// half-precision math compiled in. Half is never silently demoted
    /// to float.
    pub(crate) fn check_half<T: Numeric>(&self, op: &'static str) -> Result<()> {
        if T::KIND.is_half() && !half_ops_enabled() {
            return Err(Error::NotImplemented {
                op,
                kind: ElemKind::Half,
                backend: self.backend_kind,
            });
        }
        Ok(())
    }
}
