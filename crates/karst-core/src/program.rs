//! Runtime kernel programs and their invocable entry points.
//!
//! A [`DeviceProgram`] accumulates generated source text plus the
//! declared signature of every kernel inside it, compiles once, and
//! hands out [`DeviceKernel`]s. A kernel's argument slots are bound
//! positionally with [`DeviceKernel::add_arg`] — binding order must
//! match the signature order used during source generation.

use std::collections::HashMap;

use half::f16;
use parking_lot::Mutex;

use karst_kernels::codegen::{ClBuilder, KernelArg, ProgramBuilder};

#[cfg(feature = "cuda")]
use karst_kernels::cuda::{CudaProgramHandle, ScalarBlock};
#[cfg(feature = "opencl")]
use karst_kernels::opencl::{ClArg, ClProgramHandle};

use crate::dtype::ElemKind;
use crate::error::{Error, Result};
use crate::vptr::{MemHandle, VPtr};

/// Families of built-in generated programs, cached per element kind on
/// each device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProgramFamily {
    Math,
    Im2col,
}

/// A value bound to one kernel argument slot.
#[derive(Debug, Clone)]
pub enum KernelArgValue {
    I32(i32),
    U32(u32),
    I64(i64),
    U64(u64),
    F16(f16),
    F32(f32),
    F64(f64),
    U8(u8),
    /// Device memory: backing handle plus byte offset.
    Ptr(MemHandle, usize),
}

macro_rules! arg_from {
    ($ty:ty, $variant:ident) => {
        impl From<$ty> for KernelArgValue {
            fn from(v: $ty) -> Self {
                KernelArgValue::$variant(v)
            }
        }
    };
}

arg_from!(i32, I32);
arg_from!(u32, U32);
arg_from!(i64, I64);
arg_from!(u64, U64);
arg_from!(f16, F16);
arg_from!(f32, F32);
arg_from!(f64, F64);
arg_from!(u8, U8);

impl<T: crate::dtype::Element> From<&VPtr<T>> for KernelArgValue {
    fn from(p: &VPtr<T>) -> Self {
        KernelArgValue::Ptr(p.mem().clone(), p.byte_offset())
    }
}

/// Where a program compiles and runs.
#[derive(Debug, Clone)]
pub(crate) enum ProgramTarget {
    #[cfg(feature = "cuda")]
    Cuda {
        dev: std::sync::Arc<cudarc::driver::CudaDevice>,
        device_idx: usize,
    },
    #[cfg(feature = "opencl")]
    OpenCl {
        ctx: std::sync::Arc<karst_kernels::opencl::ClContext>,
    },
    /// Placeholder so the enum is inhabited in CPU-only builds; a CPU
    /// device never constructs a program.
    #[allow(dead_code)]
    None,
}

#[derive(Debug)]
enum CompiledProgram {
    #[cfg(feature = "cuda")]
    Cuda(CudaProgramHandle),
    #[cfg(feature = "opencl")]
    OpenCl(std::sync::Arc<ClProgramHandle>),
    #[allow(dead_code)]
    None,
}

/// A unit of generated kernel source: signatures, text, and (after
/// [`DeviceProgram::compile`]) the backend's compiled artifact.
pub struct DeviceProgram {
    emitter: Box<dyn ProgramBuilder>,
    target: ProgramTarget,
    identifier: String,
    fast_math: bool,
    dtype: Option<ElemKind>,
    src: String,
    args: HashMap<String, Vec<KernelArg>>,
    compiled: Mutex<Option<CompiledProgram>>,
}

impl std::fmt::Debug for DeviceProgram {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceProgram")
            .field("identifier", &self.identifier)
            .field("target", &self.target)
            .field("fast_math", &self.fast_math)
            .field("kernels", &self.args.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl DeviceProgram {
    pub(crate) fn new(
        target: ProgramTarget,
        identifier: impl Into<String>,
        fast_math: bool,
    ) -> Self {
        let emitter: Box<dyn ProgramBuilder> = match &target {
            #[cfg(feature = "cuda")]
            ProgramTarget::Cuda { .. } => Box::new(karst_kernels::codegen::CudaBuilder),
            #[cfg(feature = "opencl")]
            ProgramTarget::OpenCl { .. } => Box::new(ClBuilder),
            ProgramTarget::None => Box::new(ClBuilder),
        };
        Self {
            emitter,
            target,
            identifier: identifier.into(),
            fast_math,
            dtype: None,
            src: String::new(),
            args: HashMap::new(),
            compiled: Mutex::new(None),
        }
    }

    /// A detached program used only for source emission (tests, dry
    /// runs): picks the emitter explicitly, never compiles.
    pub fn emit_only(emitter: Box<dyn ProgramBuilder>, identifier: impl Into<String>) -> Self {
        Self {
            emitter,
            target: ProgramTarget::None,
            identifier: identifier.into(),
            fast_math: true,
            dtype: None,
            src: String::new(),
            args: HashMap::new(),
            compiled: Mutex::new(None),
        }
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    /// The `Dtype` element kind this program was generated for.
    pub fn dtype(&self) -> Option<ElemKind> {
        self.dtype
    }

    // ---- source emission (delegates to the backend emitter) ----

    pub fn setup(&self) -> String {
        self.emitter.setup()
    }

    /// Typedef the program's numeric type to `Dtype` (and its scalar
    /// argument alias `Dtype_arg`) and remember it for argument
    /// marshaling. OpenCL kernels cannot take half scalars, so the
    /// argument alias resolves to `float` there.
    pub fn define_dtype(&mut self, kind: ElemKind) -> String {
        self.dtype = Some(kind);
        let mut s = self.emitter.define_type(kind.type_name(), "Dtype");
        let arg_ty = if kind.is_half() && self.emitter.lang() == "opencl" {
            "float"
        } else {
            kind.type_name()
        };
        s.push_str(&self.emitter.define_type(arg_ty, "Dtype_arg"));
        s
    }

    pub fn define_type(&self, ty: &str, alias: &str) -> String {
        self.emitter.define_type(ty, alias)
    }

    /// Register a kernel signature and emit its opening source text.
    pub fn function(&mut self, name: &str, args: Vec<KernelArg>) -> String {
        let text = self.emitter.function(name, &args);
        self.args.insert(name.to_string(), args);
        text
    }

    pub fn kernel_loop(&self, ty: &str, index: &str, n: &str) -> String {
        self.emitter.kernel_loop(ty, index, n)
    }

    pub fn global_ptr(&self, ty: &str, name: &str) -> String {
        self.emitter.global_ptr(ty, name)
    }

    pub fn local_ptr(&self, ty: &str, name: &str) -> String {
        self.emitter.local_ptr(ty, name)
    }

    pub fn local_mem(&self, ty: &str) -> String {
        self.emitter.local_mem(ty)
    }

    pub fn local_id(&self, dim: usize) -> String {
        self.emitter.local_id(dim)
    }

    pub fn local_size(&self, dim: usize) -> String {
        self.emitter.local_size(dim)
    }

    pub fn group_id(&self, dim: usize) -> String {
        self.emitter.group_id(dim)
    }

    pub fn global_id(&self, dim: usize) -> String {
        self.emitter.global_id(dim)
    }

    pub fn global_size(&self, dim: usize) -> String {
        self.emitter.global_size(dim)
    }

    pub fn local_barrier(&self) -> String {
        self.emitter.local_barrier()
    }

    pub fn global_barrier(&self) -> String {
        self.emitter.global_barrier()
    }

    pub fn atomics(&self) -> String {
        self.emitter.atomics()
    }

    pub fn set_source(&mut self, src: String) {
        self.src = src;
    }

    pub fn src(&self) -> &str {
        &self.src
    }

    /// Declared signature of `name`, if registered.
    pub fn signature(&self, name: &str) -> Option<&[KernelArg]> {
        self.args.get(name).map(|v| v.as_slice())
    }

    // ---- compilation and kernels ----

    /// Build the accumulated source on the target backend.
    ///
    /// `_load_cache` / `store_cache` control best-effort reuse and debug
    /// persistence of compiled binaries where the backend supports it.
    /// A failed build is fatal to the calling operation; there is no
    /// retry with different flags.
    #[allow(unused_variables)]
    pub fn compile(&self, load_cache: bool, store_cache: bool) -> Result<()> {
        let mut slot = self.compiled.lock();
        if slot.is_some() {
            return Ok(());
        }
        #[cfg(feature = "cuda")]
        if let ProgramTarget::Cuda { dev, device_idx } = &self.target {
            let handle = CudaProgramHandle::compile(
                dev,
                *device_idx,
                &self.identifier,
                &self.src,
                self.fast_math,
            )?;
            *slot = Some(CompiledProgram::Cuda(handle));
            return Ok(());
        }
        #[cfg(feature = "opencl")]
        if let ProgramTarget::OpenCl { ctx } = &self.target {
            let handle = ClProgramHandle::compile(
                ctx,
                &self.identifier,
                &self.src,
                self.fast_math,
                store_cache,
            )?;
            *slot = Some(CompiledProgram::OpenCl(std::sync::Arc::new(handle)));
            return Ok(());
        }
        Err(Error::Compile {
            program: self.identifier.clone(),
            msg: "program has no compile target".to_string(),
        })
    }

    /// Look up one kernel. The program must have been compiled and the
    /// kernel's signature registered during generation.
    pub fn get_kernel(&self, name: &str) -> Result<DeviceKernel<'_>> {
        let sig = self
            .args
            .get(name)
            .ok_or_else(|| Error::KernelNotFound(name.to_string()))?;
        if self.compiled.lock().is_none() {
            return Err(Error::Compile {
                program: self.identifier.clone(),
                msg: format!("kernel '{name}' requested before compilation"),
            });
        }
        Ok(DeviceKernel {
            program: self,
            name: name.to_string(),
            sig: sig.clone(),
            values: Vec::new(),
        })
    }

    #[cfg(feature = "opencl")]
    fn arg_elem_size(&self, arg: &KernelArg) -> usize {
        match arg.ty.as_str() {
            "Dtype" => self.dtype.map(|k| k.size()).unwrap_or(4),
            "int_tp" | "uint_tp" | "float" | "int32_t" | "uint32_t" => 4,
            "double" | "int64_t" | "uint64_t" => 8,
            "half" | "int16_t" | "uint16_t" => 2,
            _ => 1,
        }
    }
}

/// One invocable kernel with positional argument slots.
///
/// Slots are filled in order by [`DeviceKernel::add_arg`]; execution
/// fails when the bound count does not match the declared signature.
pub struct DeviceKernel<'p> {
    program: &'p DeviceProgram,
    name: String,
    sig: Vec<KernelArg>,
    values: Vec<KernelArgValue>,
}

impl<'p> DeviceKernel<'p> {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Bind the next argument slot.
    pub fn add_arg<V: Into<KernelArgValue>>(&mut self, v: V) -> &mut Self {
        self.values.push(v.into());
        self
    }

    /// Number of declared slots.
    pub fn num_args(&self) -> usize {
        self.sig.len()
    }

    /// Run the kernel over `group × local` work items on `queue_id`.
    pub fn execute(&self, group: &[usize], local: &[usize], queue_id: usize) -> Result<()> {
        if self.values.len() != self.sig.len() {
            return Err(Error::KernelArgs {
                slot: self.values.len(),
                msg: format!(
                    "kernel '{}' expects {} arguments, {} bound",
                    self.name,
                    self.sig.len(),
                    self.values.len()
                ),
            });
        }
        let guard = self.program.compiled.lock();
        match guard.as_ref() {
            #[cfg(feature = "cuda")]
            Some(CompiledProgram::Cuda(handle)) => self.execute_cuda(handle, group, local),
            #[cfg(feature = "opencl")]
            Some(CompiledProgram::OpenCl(handle)) => {
                self.execute_opencl(handle, group, local, queue_id)
            }
            _ => {
                let _ = queue_id;
                Err(Error::Compile {
                    program: self.program.identifier.clone(),
                    msg: "kernel executed before compilation".to_string(),
                })
            }
        }
    }

    #[cfg(feature = "cuda")]
    fn execute_cuda(
        &self,
        handle: &CudaProgramHandle,
        group: &[usize],
        local: &[usize],
    ) -> Result<()> {
        // Scalars coalesce into one block (matching the CUDA emitter),
        // pointers become raw device addresses with the offset folded in.
        let mut scalars = ScalarBlock::new();
        let mut ptrs: Vec<u64> = Vec::new();
        for (slot, (arg, value)) in self.sig.iter().zip(self.values.iter()).enumerate() {
            if arg.is_mem() {
                let (mem, off) = match value {
                    KernelArgValue::Ptr(mem, off) => (mem, *off),
                    other => {
                        return Err(Error::KernelArgs {
                            slot,
                            msg: format!("expected memory argument, got {other:?}"),
                        })
                    }
                };
                match mem {
                    MemHandle::Cuda(buf) => ptrs.push(buf.device_ptr(off)),
                    other => {
                        return Err(Error::BackendMismatch {
                            expected: crate::Backend::Cuda,
                            got: other.backend(),
                        })
                    }
                }
            } else {
                match value {
                    KernelArgValue::I32(v) => scalars.push(&v.to_ne_bytes()),
                    KernelArgValue::U32(v) => scalars.push(&v.to_ne_bytes()),
                    KernelArgValue::I64(v) => scalars.push(&v.to_ne_bytes()),
                    KernelArgValue::U64(v) => scalars.push(&v.to_ne_bytes()),
                    KernelArgValue::F16(v) => scalars.push(&v.to_bits().to_ne_bytes()),
                    KernelArgValue::F32(v) => scalars.push(&v.to_ne_bytes()),
                    KernelArgValue::F64(v) => scalars.push(&v.to_ne_bytes()),
                    KernelArgValue::U8(v) => scalars.push(&[*v]),
                    KernelArgValue::Ptr(..) => {
                        return Err(Error::KernelArgs {
                            slot,
                            msg: "memory value bound to scalar slot".to_string(),
                        })
                    }
                }
            }
        }
        scalars.finish();
        let cfg = cudarc::driver::LaunchConfig {
            grid_dim: (
                group.first().copied().unwrap_or(1) as u32,
                group.get(1).copied().unwrap_or(1) as u32,
                group.get(2).copied().unwrap_or(1) as u32,
            ),
            block_dim: (
                local.first().copied().unwrap_or(1) as u32,
                local.get(1).copied().unwrap_or(1) as u32,
                local.get(2).copied().unwrap_or(1) as u32,
            ),
            shared_mem_bytes: 0,
        };
        let block = if scalars.is_empty() {
            None
        } else {
            Some(scalars)
        };
        handle.launch(&self.name, cfg, block, &ptrs)?;
        Ok(())
    }

    #[cfg(feature = "opencl")]
    fn execute_opencl(
        &self,
        handle: &ClProgramHandle,
        group: &[usize],
        local: &[usize],
        queue_id: usize,
    ) -> Result<()> {
        let mut args: Vec<ClArg<'_>> = Vec::new();
        for (slot, (arg, value)) in self.sig.iter().zip(self.values.iter()).enumerate() {
            if arg.is_mem() {
                let (mem, off) = match value {
                    KernelArgValue::Ptr(mem, off) => (mem, *off),
                    other => {
                        return Err(Error::KernelArgs {
                            slot,
                            msg: format!("expected memory argument, got {other:?}"),
                        })
                    }
                };
                let buf = match mem {
                    MemHandle::OpenCl(buf) => buf,
                    other => {
                        return Err(Error::BackendMismatch {
                            expected: crate::Backend::OpenCl,
                            got: other.backend(),
                        })
                    }
                };
                args.push(ClArg::Mem(buf));
                if arg.has_offset() {
                    let elem = self.program.arg_elem_size(arg);
                    args.push(ClArg::U32((off / elem) as u32));
                } else if off != 0 {
                    return Err(Error::KernelArgs {
                        slot,
                        msg: format!(
                            "argument '{}' carries offset {} but its slot declares none",
                            arg.name, off
                        ),
                    });
                }
            } else {
                args.push(match value {
                    KernelArgValue::I32(v) => ClArg::I32(*v),
                    KernelArgValue::U32(v) => ClArg::U32(*v),
                    KernelArgValue::I64(v) => ClArg::I64(*v),
                    KernelArgValue::U64(v) => ClArg::U64(*v),
                    // OpenCL kernels take half scalars as float.
                    KernelArgValue::F16(v) => ClArg::F32(v.to_f32()),
                    KernelArgValue::F32(v) => ClArg::F32(*v),
                    KernelArgValue::F64(v) => ClArg::F64(*v),
                    KernelArgValue::U8(v) => ClArg::U8(*v),
                    KernelArgValue::Ptr(..) => {
                        return Err(Error::KernelArgs {
                            slot,
                            msg: "memory value bound to scalar slot".to_string(),
                        })
                    }
                });
            }
        }
        handle.launch(&self.name, queue_id, group, local, &args)?;
        Ok(())
    }
}
