//! OpenCL program build and kernel launch.

use std::io::Write as _;
use std::sync::Arc;

use ocl::core::ArgVal;
use ocl::enums::{ProgramInfo, ProgramInfoResult};
use ocl::Program;

use super::context::{ClContext, ClError};
use super::memory::ClBuffer;

/// Kernel argument value for dynamic marshaling. The caller pushes a
/// memory object's element offset as a separate trailing `U32` slot
/// when the signature follows the split-argument convention.
#[derive(Debug, Clone, Copy)]
pub enum ClArg<'a> {
    Mem(&'a ClBuffer),
    I32(i32),
    U32(u32),
    I64(i64),
    U64(u64),
    F32(f32),
    F64(f64),
    /// Half-precision scalar as raw bits.
    F16Bits(u16),
    U8(u8),
}

/// A built OpenCL program on one device.
#[derive(Debug)]
pub struct ClProgramHandle {
    ctx: Arc<ClContext>,
    program: Program,
    name: String,
}

impl ClProgramHandle {
    /// Build `src` on the context's device.
    ///
    /// Build options follow the numeric contract of the dispatch layer:
    /// `-cl-fast-relaxed-math -cl-mad-enable`. When `dump_binary` is set
    /// the compiled program binary is written to
    /// `.karst_debug/<name>.clbin` for offline inspection. A failed
    /// build is reported as-is; there is no retry with different flags.
    pub fn compile(
        ctx: &Arc<ClContext>,
        name: &str,
        src: &str,
        fast_math: bool,
        dump_binary: bool,
    ) -> Result<Self, ClError> {
        let mut builder = Program::builder();
        builder.devices(*ctx.device()).src(src);
        if fast_math {
            builder.cmplr_opt("-cl-fast-relaxed-math -cl-mad-enable");
        }
        let program = builder.build(ctx.context()).map_err(|e| ClError::Build {
            program: name.to_string(),
            msg: e.to_string(),
        })?;
        tracing::debug!("built OpenCL program '{}'", name);

        let handle = Self {
            ctx: Arc::clone(ctx),
            program,
            name: name.to_string(),
        };
        if dump_binary {
            handle.dump_binary();
        }
        Ok(handle)
    }

    fn dump_binary(&self) {
        if let Ok(ProgramInfoResult::Binaries(bins)) = self.program.info(ProgramInfo::Binaries) {
            if let Some(bin) = bins.first() {
                let dir = std::path::Path::new(".karst_debug");
                if std::fs::create_dir_all(dir).is_ok() {
                    let path = dir.join(format!("{}.clbin", self.name));
                    if let Ok(mut f) = std::fs::File::create(&path) {
                        let _ = f.write_all(bin);
                    }
                }
            }
        }
    }

    pub fn context(&self) -> &Arc<ClContext> {
        &self.ctx
    }

    /// Launch `kernel` over `group * local` work items on queue
    /// `queue_id`, binding `args` in slot order.
    pub fn launch(
        &self,
        kernel: &str,
        queue_id: usize,
        group: &[usize],
        local: &[usize],
        args: &[ClArg<'_>],
    ) -> Result<(), ClError> {
        let k = ocl::core::create_kernel(self.program.as_core(), kernel)
            .map_err(|_| ClError::KernelCreate(kernel.to_string()))?;

        let mut idx: u32 = 0;
        let mut set = |i: &mut u32, arg: ArgVal| -> Result<(), ClError> {
            ocl::core::set_kernel_arg(&k, *i, arg).map_err(|e| ClError::KernelArg {
                idx: *i,
                msg: e.to_string(),
            })?;
            *i += 1;
            Ok(())
        };

        for arg in args {
            match arg {
                ClArg::Mem(buf) => set(&mut idx, ArgVal::mem(buf.as_mem()))?,
                ClArg::I32(v) => set(&mut idx, ArgVal::scalar(v))?,
                ClArg::U32(v) => set(&mut idx, ArgVal::scalar(v))?,
                ClArg::I64(v) => set(&mut idx, ArgVal::scalar(v))?,
                ClArg::U64(v) => set(&mut idx, ArgVal::scalar(v))?,
                ClArg::F32(v) => set(&mut idx, ArgVal::scalar(v))?,
                ClArg::F64(v) => set(&mut idx, ArgVal::scalar(v))?,
                ClArg::F16Bits(v) => set(&mut idx, ArgVal::scalar(v))?,
                ClArg::U8(v) => set(&mut idx, ArgVal::scalar(v))?,
            }
        }

        let mut gws = [1usize; 3];
        let mut lws = [1usize; 3];
        let dims = group.len().max(1) as u32;
        for d in 0..group.len() {
            gws[d] = group[d] * local[d];
            lws[d] = local[d];
        }

        let queue = self.ctx.queue(queue_id);
        unsafe {
            ocl::core::enqueue_kernel(
                queue.as_core(),
                &k,
                dims,
                None,
                &gws,
                Some(lws),
                None::<ocl::core::Event>,
                None::<&mut ocl::core::Event>,
            )
            .map_err(|e| ClError::Enqueue(format!("kernel '{kernel}': {e}")))
        }
    }
}
