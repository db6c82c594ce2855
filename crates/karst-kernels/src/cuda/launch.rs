//! NVRTC compilation and kernel launch.
//!
//! Generated source is compiled once per (device, program) and cached;
//! launches marshal one optional scalar-block parameter plus device
//! pointers, matching the signature layout the CUDA emitter produces.

use std::collections::HashSet;
use std::ffi::c_void;
use std::sync::{Arc, OnceLock};

use cudarc::driver::{CudaDevice, CudaFunction, DeviceRepr, LaunchAsync, LaunchConfig};
use parking_lot::Mutex;

use super::context::CudaError;

/// Modules already compiled and loaded, keyed by (device, module name).
static LOADED: OnceLock<Mutex<HashSet<(usize, String)>>> = OnceLock::new();

fn loaded_set() -> &'static Mutex<HashSet<(usize, String)>> {
    LOADED.get_or_init(|| Mutex::new(HashSet::new()))
}

/// A compiled, loaded kernel module on one device.
#[derive(Debug, Clone)]
pub struct CudaProgramHandle {
    dev: Arc<CudaDevice>,
    device_idx: usize,
    module: String,
}

impl CudaProgramHandle {
    /// Compile `src` with NVRTC and load it as `module` on `dev`.
    /// No-op when the module is already resident.
    ///
    /// Build flags follow the numeric contract of the dispatch layer:
    /// fast/relaxed math with fused multiply-add. A failed build is
    /// reported as-is; there is no retry with different flags.
    pub fn compile(
        dev: &Arc<CudaDevice>,
        device_idx: usize,
        module: &str,
        src: &str,
        fast_math: bool,
    ) -> Result<Self, CudaError> {
        let key = (device_idx, module.to_string());
        if loaded_set().lock().contains(&key) {
            return Ok(Self {
                dev: Arc::clone(dev),
                device_idx,
                module: module.to_string(),
            });
        }

        let opts = cudarc::nvrtc::CompileOptions {
            use_fast_math: Some(fast_math),
            fmad: Some(true),
            ..Default::default()
        };
        let ptx = cudarc::nvrtc::compile_ptx_with_opts(src, opts).map_err(|e| {
            CudaError::Compile {
                program: module.to_string(),
                msg: e.to_string(),
            }
        })?;

        dev.load_ptx(ptx, module, &[])
            .map_err(|e| CudaError::ModuleLoad {
                module: module.to_string(),
                msg: e.to_string(),
            })?;

        loaded_set().lock().insert(key);
        tracing::debug!("compiled CUDA module '{}' on device {}", module, device_idx);
        Ok(Self {
            dev: Arc::clone(dev),
            device_idx,
            module: module.to_string(),
        })
    }

    pub fn device_idx(&self) -> usize {
        self.device_idx
    }

    /// Look up one kernel entry point.
    pub fn func(&self, name: &str) -> Result<CudaFunction, CudaError> {
        self.dev
            .get_func(&self.module, name)
            .ok_or_else(|| CudaError::FuncNotFound {
                module: self.module.clone(),
                func: name.to_string(),
            })
    }

    /// Launch `name` with the packed scalar block and device pointers.
    pub fn launch(
        &self,
        name: &str,
        cfg: LaunchConfig,
        scalars: Option<ScalarBlock>,
        ptrs: &[u64],
    ) -> Result<(), CudaError> {
        let f = self.func(name)?;
        unsafe { launch_packed(f, cfg, scalars, ptrs) }
    }
}

/// Scalar kernel arguments packed with C struct layout (fields in
/// declaration order, each aligned to its own size), passed by value as
/// a single kernel parameter.
#[derive(Debug, Default, Clone)]
pub struct ScalarBlock {
    bytes: Vec<u8>,
    max_align: usize,
}

impl ScalarBlock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one scalar; `bytes` must be its native little-endian
    /// representation (size == alignment for every supported scalar).
    pub fn push(&mut self, bytes: &[u8]) {
        let align = bytes.len().max(1);
        while self.bytes.len() % align != 0 {
            self.bytes.push(0);
        }
        self.bytes.extend_from_slice(bytes);
        self.max_align = self.max_align.max(align);
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Pad the tail so the block size is a multiple of the largest
    /// member alignment, completing the C layout.
    pub fn finish(&mut self) {
        let align = self.max_align.max(1);
        while self.bytes.len() % align != 0 {
            self.bytes.push(0);
        }
    }
}

unsafe impl DeviceRepr for ScalarBlock {
    fn as_kernel_param(&self) -> *mut c_void {
        self.bytes.as_ptr() as *mut c_void
    }
}

/// Launch with an optional scalar block plus up to eight pointer
/// parameters. The typed tuple launch needs a fixed arity per arm,
/// hence the ladder.
///
/// # Safety
/// The pointers must reference live device allocations on the function's
/// device, and the scalar block layout must match the kernel signature.
pub unsafe fn launch_packed(
    f: CudaFunction,
    cfg: LaunchConfig,
    scalars: Option<ScalarBlock>,
    p: &[u64],
) -> Result<(), CudaError> {
    let err = |e: cudarc::driver::DriverError| CudaError::Launch(e.to_string());
    match (scalars, p.len()) {
        (Some(s), 0) => f.launch(cfg, (s,)).map_err(err),
        (Some(s), 1) => f.launch(cfg, (s, p[0])).map_err(err),
        (Some(s), 2) => f.launch(cfg, (s, p[0], p[1])).map_err(err),
        (Some(s), 3) => f.launch(cfg, (s, p[0], p[1], p[2])).map_err(err),
        (Some(s), 4) => f.launch(cfg, (s, p[0], p[1], p[2], p[3])).map_err(err),
        (Some(s), 5) => f
            .launch(cfg, (s, p[0], p[1], p[2], p[3], p[4]))
            .map_err(err),
        (Some(s), 6) => f
            .launch(cfg, (s, p[0], p[1], p[2], p[3], p[4], p[5]))
            .map_err(err),
        (Some(s), 7) => f
            .launch(cfg, (s, p[0], p[1], p[2], p[3], p[4], p[5], p[6]))
            .map_err(err),
        (Some(s), 8) => f
            .launch(cfg, (s, p[0], p[1], p[2], p[3], p[4], p[5], p[6], p[7]))
            .map_err(err),
        (None, 1) => f.launch(cfg, (p[0],)).map_err(err),
        (None, 2) => f.launch(cfg, (p[0], p[1])).map_err(err),
        (None, 3) => f.launch(cfg, (p[0], p[1], p[2])).map_err(err),
        (None, 4) => f.launch(cfg, (p[0], p[1], p[2], p[3])).map_err(err),
        (None, 5) => f.launch(cfg, (p[0], p[1], p[2], p[3], p[4])).map_err(err),
        (None, 6) => f
            .launch(cfg, (p[0], p[1], p[2], p[3], p[4], p[5]))
            .map_err(err),
        (None, 7) => f
            .launch(cfg, (p[0], p[1], p[2], p[3], p[4], p[5], p[6]))
            .map_err(err),
        (None, 8) => f
            .launch(cfg, (p[0], p[1], p[2], p[3], p[4], p[5], p[6], p[7]))
            .map_err(err),
        (_, n) => Err(CudaError::Launch(format!(
            "unsupported kernel parameter layout: {n} pointer arguments"
        ))),
    }
}

/// 1-D launch configuration for `n` work items.
pub fn grid_1d(n: usize, block_size: usize) -> LaunchConfig {
    let grid = n.div_ceil(block_size).max(1);
    LaunchConfig {
        grid_dim: (grid as u32, 1, 1),
        block_dim: (block_size as u32, 1, 1),
        shared_mem_bytes: 0,
    }
}
