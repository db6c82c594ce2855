//! Math program generation and the numeric primitive API.
//!
//! Every public operation is generic over [`Numeric`] and resolves to
//! one of three fixed specializations (half/float/double) per backend:
//! - host device: direct calls into the `karst-kernels` CPU routines
//! - CUDA: generated kernels compiled through NVRTC
//! - OpenCL: generated kernels — except on CPU-class devices, where
//!   BLAS-like ops map the buffers and run the host routine instead
//!   (device kernels lose to direct host math there)
//!
//! Half-precision dispatch requires the `half-ops` feature and fails
//! fast otherwise; it is never demoted to float.

#[cfg(any(feature = "cuda", feature = "opencl"))]
use half::f16;

use karst_kernels::codegen::{dtype_math_defines, KernelArg, ARG_CONST};
use karst_kernels::cpu::{blas, rng, Transpose};

use crate::backends::BackendImpl;
use crate::device::Device;
use crate::dtype::{ElemKind, Numeric};
use crate::error::Result;
#[cfg(any(feature = "cuda", feature = "opencl"))]
use crate::program::KernelArgValue;
use crate::program::DeviceProgram;
use crate::vptr::VPtr;

/// Workgroup size baked into the generated reduction kernels.
const REDUCTION_LOCAL: usize = 256;
/// Upper bound on reduction workgroups (and scratch elements).
const MAX_REDUCTION_GROUPS: usize = 64;

// ---------------------------------------------------------------------------
// Source generation
// ---------------------------------------------------------------------------

/// Generate the math kernel family for `kind` into `p` and return the
/// full source text.
pub fn generate_math_source(p: &mut DeviceProgram, kind: ElemKind) -> String {
    let mut ss = String::new();
    ss.push_str(&p.setup());
    ss.push_str(&p.define_dtype(kind));
    ss.push_str(&dtype_math_defines(kind.type_name()));

    // fill: x = alpha
    ss.push_str(&p.function(
        "karst_fill",
        vec![
            KernelArg::int("n"),
            KernelArg::dtype_scalar("alpha"),
            KernelArg::dtype_mem("x", 0),
        ],
    ));
    ss.push_str(&p.kernel_loop("int_tp", "index", "n"));
    ss.push_str("x[index] = (Dtype)alpha;\n}\n}\n");

    // add_scalar: x += alpha
    ss.push_str(&p.function(
        "karst_add_scalar",
        vec![
            KernelArg::int("n"),
            KernelArg::dtype_scalar("alpha"),
            KernelArg::dtype_mem("x", 0),
        ],
    ));
    ss.push_str(&p.kernel_loop("int_tp", "index", "n"));
    ss.push_str("x[index] += (Dtype)alpha;\n}\n}\n");

    // scal: x *= alpha
    ss.push_str(&p.function(
        "karst_scal",
        vec![
            KernelArg::int("n"),
            KernelArg::dtype_scalar("alpha"),
            KernelArg::dtype_mem("x", 0),
        ],
    ));
    ss.push_str(&p.kernel_loop("int_tp", "index", "n"));
    ss.push_str("x[index] *= (Dtype)alpha;\n}\n}\n");

    // axpy: y += alpha * x, and scale: y = alpha * x
    for (name, stmt) in [
        ("karst_axpy", "y[index] += (Dtype)alpha * x[index];\n"),
        ("karst_scale", "y[index] = (Dtype)alpha * x[index];\n"),
    ] {
        ss.push_str(&p.function(
            name,
            vec![
                KernelArg::int("n"),
                KernelArg::dtype_scalar("alpha"),
                KernelArg::dtype_mem("x", ARG_CONST),
                KernelArg::dtype_mem("y", 0),
            ],
        ));
        ss.push_str(&p.kernel_loop("int_tp", "index", "n"));
        ss.push_str(stmt);
        ss.push_str("}\n}\n");
    }

    // elementwise binary
    for (name, op) in [
        ("karst_add", "+"),
        ("karst_sub", "-"),
        ("karst_mul", "*"),
        ("karst_div", "/"),
    ] {
        ss.push_str(&p.function(
            name,
            vec![
                KernelArg::int("n"),
                KernelArg::dtype_mem("a", ARG_CONST),
                KernelArg::dtype_mem("b", ARG_CONST),
                KernelArg::dtype_mem("y", 0),
            ],
        ));
        ss.push_str(&p.kernel_loop("int_tp", "index", "n"));
        ss.push_str(&format!("y[index] = a[index] {op} b[index];\n}}\n}}\n"));
    }

    // elementwise unary
    for (name, stmt) in [
        ("karst_abs", "y[index] = Dtype_abs(a[index]);\n"),
        ("karst_exp", "y[index] = Dtype_exp(a[index]);\n"),
        ("karst_log", "y[index] = Dtype_log(a[index]);\n"),
        ("karst_sqrt", "y[index] = Dtype_sqrt(a[index]);\n"),
        (
            "karst_sign",
            "y[index] = (a[index] > (Dtype)0) ? (Dtype)1 : \
             ((a[index] < (Dtype)0) ? (Dtype)-1 : (Dtype)0);\n",
        ),
        (
            "karst_sgnbit",
            "y[index] = Dtype_signbit(a[index]) ? (Dtype)1 : (Dtype)0;\n",
        ),
    ] {
        ss.push_str(&p.function(
            name,
            vec![
                KernelArg::int("n"),
                KernelArg::dtype_mem("a", ARG_CONST),
                KernelArg::dtype_mem("y", 0),
            ],
        ));
        ss.push_str(&p.kernel_loop("int_tp", "index", "n"));
        ss.push_str(stmt);
        ss.push_str("}\n}\n");
    }

    // powx: y = a^alpha
    ss.push_str(&p.function(
        "karst_powx",
        vec![
            KernelArg::int("n"),
            KernelArg::dtype_mem("a", ARG_CONST),
            KernelArg::dtype_scalar("alpha"),
            KernelArg::dtype_mem("y", 0),
        ],
    ));
    ss.push_str(&p.kernel_loop("int_tp", "index", "n"));
    ss.push_str("y[index] = Dtype_pow(a[index], (Dtype)alpha);\n}\n}\n");

    // Workgroup tree reductions; one partial sum per group lands in
    // `out`, the host sums the partials. Launched with local size
    // REDUCTION_LOCAL exactly.
    for (name, load) in [
        ("karst_dot", "acc += x[i] * y[i];"),
        ("karst_asum", "acc += Dtype_abs(x[i]);"),
    ] {
        let mut args = vec![KernelArg::int("n"), KernelArg::dtype_mem("x", ARG_CONST)];
        if name == "karst_dot" {
            args.push(KernelArg::dtype_mem("y", ARG_CONST));
        }
        args.push(KernelArg::dtype_mem("out", 0));
        ss.push_str(&p.function(name, args));
        ss.push_str(&p.local_mem("Dtype"));
        ss.push_str(&format!("scratch[{REDUCTION_LOCAL}];\n"));
        ss.push_str("Dtype acc = (Dtype)0;\n");
        ss.push_str(&format!(
            "for (int_tp i = {}; i < n; i += {}) {{\n",
            p.global_id(0),
            p.global_size(0)
        ));
        ss.push_str(load);
        ss.push_str("\n}\n");
        ss.push_str(&format!("scratch[{}] = acc;\n", p.local_id(0)));
        ss.push_str(&p.local_barrier());
        ss.push('\n');
        ss.push_str(&format!(
            "for (int_tp s = {}; s > 0; s >>= 1) {{\n",
            REDUCTION_LOCAL / 2
        ));
        ss.push_str(&format!(
            "if ((int_tp){} < s) {{ scratch[{}] += scratch[{} + s]; }}\n",
            p.local_id(0),
            p.local_id(0),
            p.local_id(0)
        ));
        ss.push_str(&p.local_barrier());
        ss.push_str("\n}\n");
        ss.push_str(&format!(
            "if ({} == 0) {{ out[{}] = scratch[0]; }}\n",
            p.local_id(0),
            p.group_id(0)
        ));
        ss.push_str("}\n");
    }

    // Naive gemm, one work item per output element. Fast paths belong
    // to vendor BLAS or JIT-tuned layer programs.
    ss.push_str(&p.function(
        "karst_gemm",
        vec![
            KernelArg::int("m"),
            KernelArg::int("n"),
            KernelArg::int("k"),
            KernelArg::dtype_scalar("alpha"),
            KernelArg::dtype_mem("a", ARG_CONST),
            KernelArg::dtype_mem("b", ARG_CONST),
            KernelArg::dtype_scalar("beta"),
            KernelArg::dtype_mem("c", 0),
            KernelArg::int("trans_a"),
            KernelArg::int("trans_b"),
        ],
    ));
    ss.push_str(&p.kernel_loop("int_tp", "index", "m * n"));
    ss.push_str("const int_tp row = index / n;\n");
    ss.push_str("const int_tp col = index % n;\n");
    ss.push_str("Dtype acc = (Dtype)0;\n");
    ss.push_str("for (int_tp p = 0; p < k; ++p) {\n");
    ss.push_str("const Dtype av = (trans_a == 0) ? a[row * k + p] : a[p * m + row];\n");
    ss.push_str("const Dtype bv = (trans_b == 0) ? b[p * n + col] : b[col * k + p];\n");
    ss.push_str("acc += av * bv;\n");
    ss.push_str("}\n");
    ss.push_str("c[index] = (Dtype)alpha * acc + (Dtype)beta * c[index];\n}\n}\n");

    ss
}

pub(crate) fn build_math_program(dev: &Device, kind: ElemKind) -> Result<DeviceProgram> {
    let mut p = dev.create_program(&format!("karst_math_{kind}"))?;
    let src = generate_math_source(&mut p, kind);
    p.set_source(src);
    p.compile(true, true)?;
    Ok(p)
}

// ---------------------------------------------------------------------------
// Op tables
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
enum ScalarInplaceOp {
    Set,
    AddScalar,
    Scal,
}

impl ScalarInplaceOp {
    #[cfg(any(feature = "cuda", feature = "opencl"))]
    fn kernel_name(self) -> &'static str {
        match self {
            ScalarInplaceOp::Set => "karst_fill",
            ScalarInplaceOp::AddScalar => "karst_add_scalar",
            ScalarInplaceOp::Scal => "karst_scal",
        }
    }

    fn host<T: Numeric>(self, alpha: T, x: &mut [T]) {
        match self {
            ScalarInplaceOp::Set => blas::set(alpha, x),
            ScalarInplaceOp::AddScalar => blas::add_scalar(alpha, x),
            ScalarInplaceOp::Scal => blas::scal(alpha, x),
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum ScalarXyOp {
    Axpy,
    Scale,
}

impl ScalarXyOp {
    #[cfg(any(feature = "cuda", feature = "opencl"))]
    fn kernel_name(self) -> &'static str {
        match self {
            ScalarXyOp::Axpy => "karst_axpy",
            ScalarXyOp::Scale => "karst_scale",
        }
    }

    fn host<T: Numeric>(self, alpha: T, x: &[T], y: &mut [T]) {
        match self {
            ScalarXyOp::Axpy => blas::axpy(alpha, x, y),
            ScalarXyOp::Scale => blas::scale(alpha, x, y),
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum BinaryMathOp {
    Add,
    Sub,
    Mul,
    Div,
}

impl BinaryMathOp {
    #[cfg(any(feature = "cuda", feature = "opencl"))]
    fn kernel_name(self) -> &'static str {
        match self {
            BinaryMathOp::Add => "karst_add",
            BinaryMathOp::Sub => "karst_sub",
            BinaryMathOp::Mul => "karst_mul",
            BinaryMathOp::Div => "karst_div",
        }
    }

    fn host<T: Numeric>(self, a: &[T], b: &[T], y: &mut [T]) {
        match self {
            BinaryMathOp::Add => blas::add(a, b, y),
            BinaryMathOp::Sub => blas::sub(a, b, y),
            BinaryMathOp::Mul => blas::mul(a, b, y),
            BinaryMathOp::Div => blas::div(a, b, y),
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum UnaryMathOp {
    Abs,
    Exp,
    Log,
    Sqrt,
    Sign,
    Sgnbit,
}

impl UnaryMathOp {
    #[cfg(any(feature = "cuda", feature = "opencl"))]
    fn kernel_name(self) -> &'static str {
        match self {
            UnaryMathOp::Abs => "karst_abs",
            UnaryMathOp::Exp => "karst_exp",
            UnaryMathOp::Log => "karst_log",
            UnaryMathOp::Sqrt => "karst_sqrt",
            UnaryMathOp::Sign => "karst_sign",
            UnaryMathOp::Sgnbit => "karst_sgnbit",
        }
    }

    fn host<T: Numeric>(self, a: &[T], y: &mut [T]) {
        match self {
            UnaryMathOp::Abs => blas::abs(a, y),
            UnaryMathOp::Exp => blas::exp(a, y),
            UnaryMathOp::Log => blas::log(a, y),
            UnaryMathOp::Sqrt => blas::sqrt(a, y),
            UnaryMathOp::Sign => blas::sign(a, y),
            UnaryMathOp::Sgnbit => blas::sgnbit(a, y),
        }
    }
}

#[cfg(any(feature = "cuda", feature = "opencl"))]
#[derive(Debug, Clone, Copy)]
enum ReduceOp {
    Dot,
    Asum,
}

#[cfg(any(feature = "cuda", feature = "opencl"))]
impl ReduceOp {
    fn kernel_name(self) -> &'static str {
        match self {
            ReduceOp::Dot => "karst_dot",
            ReduceOp::Asum => "karst_asum",
        }
    }
}

/// Scalar kernel-argument value for the program's element kind.
#[cfg(any(feature = "cuda", feature = "opencl"))]
fn scalar_arg<T: Numeric>(v: T) -> KernelArgValue {
    match T::KIND {
        ElemKind::Half => KernelArgValue::F16(f16::from_f64(v.to_f64())),
        ElemKind::Float => KernelArgValue::F32(v.to_f64() as f32),
        ElemKind::Double => KernelArgValue::F64(v.to_f64()),
    }
}

// ---------------------------------------------------------------------------
// Dispatch
// ---------------------------------------------------------------------------

impl Device {
    #[cfg(any(feature = "cuda", feature = "opencl"))]
    fn launch_1d(&self, kernel: &crate::program::DeviceKernel<'_>, n: usize) -> Result<()> {
        let mut group = Vec::new();
        let mut local = Vec::new();
        self.get_threads(&[n], &mut group, &mut local, true);
        kernel.execute(&group, &local, self.current_queue_id())
    }

    fn scalar_inplace<T: Numeric>(
        &self,
        op: ScalarInplaceOp,
        n: usize,
        alpha: T,
        x: &VPtr<T>,
    ) -> Result<()> {
        match &self.backend {
            BackendImpl::Cpu(_) => {
                op.host(alpha, unsafe { x.host_slice_mut(n)? });
                Ok(())
            }
            #[cfg(feature = "cuda")]
            BackendImpl::Cuda(_) => {
                let program = self.math_program(T::KIND)?;
                let mut k = program.get_kernel(op.kernel_name())?;
                k.add_arg(n as i32).add_arg(scalar_arg(alpha)).add_arg(x);
                self.launch_1d(&k, n)
            }
            #[cfg(feature = "opencl")]
            BackendImpl::OpenCl(b) => {
                if b.is_cpu_class() {
                    let buf = x.opencl()?;
                    let mut map = unsafe {
                        buf.map(x.byte_offset(), n * std::mem::size_of::<T>(), true)?
                    };
                    op.host(alpha, bytemuck::cast_slice_mut(&mut map[..]));
                    Ok(())
                } else {
                    let program = self.math_program(T::KIND)?;
                    let mut k = program.get_kernel(op.kernel_name())?;
                    k.add_arg(n as i32).add_arg(scalar_arg(alpha)).add_arg(x);
                    self.launch_1d(&k, n)
                }
            }
        }
    }

    fn scalar_xy<T: Numeric>(
        &self,
        op: ScalarXyOp,
        n: usize,
        alpha: T,
        x: &VPtr<T>,
        y: &VPtr<T>,
    ) -> Result<()> {
        match &self.backend {
            BackendImpl::Cpu(_) => {
                let xs = unsafe { x.host_slice(n)? };
                let ys = unsafe { y.host_slice_mut(n)? };
                op.host(alpha, xs, ys);
                Ok(())
            }
            #[cfg(feature = "cuda")]
            BackendImpl::Cuda(_) => {
                let program = self.math_program(T::KIND)?;
                let mut k = program.get_kernel(op.kernel_name())?;
                k.add_arg(n as i32)
                    .add_arg(scalar_arg(alpha))
                    .add_arg(x)
                    .add_arg(y);
                self.launch_1d(&k, n)
            }
            #[cfg(feature = "opencl")]
            BackendImpl::OpenCl(b) => {
                if b.is_cpu_class() {
                    let nbytes = n * std::mem::size_of::<T>();
                    let xmap = unsafe { x.opencl()?.map(x.byte_offset(), nbytes, false)? };
                    let mut ymap = unsafe { y.opencl()?.map(y.byte_offset(), nbytes, true)? };
                    op.host(
                        alpha,
                        bytemuck::cast_slice(&xmap[..]),
                        bytemuck::cast_slice_mut(&mut ymap[..]),
                    );
                    Ok(())
                } else {
                    let program = self.math_program(T::KIND)?;
                    let mut k = program.get_kernel(op.kernel_name())?;
                    k.add_arg(n as i32)
                        .add_arg(scalar_arg(alpha))
                        .add_arg(x)
                        .add_arg(y);
                    self.launch_1d(&k, n)
                }
            }
        }
    }

    fn binary_math<T: Numeric>(
        &self,
        op: BinaryMathOp,
        n: usize,
        a: &VPtr<T>,
        b: &VPtr<T>,
        y: &VPtr<T>,
    ) -> Result<()> {
        match &self.backend {
            BackendImpl::Cpu(_) => {
                let av = unsafe { a.host_slice(n)? };
                let bv = unsafe { b.host_slice(n)? };
                let yv = unsafe { y.host_slice_mut(n)? };
                op.host(av, bv, yv);
                Ok(())
            }
            #[cfg(feature = "cuda")]
            BackendImpl::Cuda(_) => {
                let program = self.math_program(T::KIND)?;
                let mut k = program.get_kernel(op.kernel_name())?;
                k.add_arg(n as i32).add_arg(a).add_arg(b).add_arg(y);
                self.launch_1d(&k, n)
            }
            #[cfg(feature = "opencl")]
            BackendImpl::OpenCl(cl) => {
                if cl.is_cpu_class() {
                    let nbytes = n * std::mem::size_of::<T>();
                    let amap = unsafe { a.opencl()?.map(a.byte_offset(), nbytes, false)? };
                    let bmap = unsafe { b.opencl()?.map(b.byte_offset(), nbytes, false)? };
                    let mut ymap = unsafe { y.opencl()?.map(y.byte_offset(), nbytes, true)? };
                    op.host(
                        bytemuck::cast_slice(&amap[..]),
                        bytemuck::cast_slice(&bmap[..]),
                        bytemuck::cast_slice_mut(&mut ymap[..]),
                    );
                    Ok(())
                } else {
                    let program = self.math_program(T::KIND)?;
                    let mut k = program.get_kernel(op.kernel_name())?;
                    k.add_arg(n as i32).add_arg(a).add_arg(b).add_arg(y);
                    self.launch_1d(&k, n)
                }
            }
        }
    }

    fn unary_math<T: Numeric>(
        &self,
        op: UnaryMathOp,
        n: usize,
        a: &VPtr<T>,
        y: &VPtr<T>,
    ) -> Result<()> {
        match &self.backend {
            BackendImpl::Cpu(_) => {
                let av = unsafe { a.host_slice(n)? };
                let yv = unsafe { y.host_slice_mut(n)? };
                op.host(av, yv);
                Ok(())
            }
            #[cfg(feature = "cuda")]
            BackendImpl::Cuda(_) => {
                let program = self.math_program(T::KIND)?;
                let mut k = program.get_kernel(op.kernel_name())?;
                k.add_arg(n as i32).add_arg(a).add_arg(y);
                self.launch_1d(&k, n)
            }
            #[cfg(feature = "opencl")]
            BackendImpl::OpenCl(cl) => {
                if cl.is_cpu_class() {
                    let nbytes = n * std::mem::size_of::<T>();
                    let amap = unsafe { a.opencl()?.map(a.byte_offset(), nbytes, false)? };
                    let mut ymap = unsafe { y.opencl()?.map(y.byte_offset(), nbytes, true)? };
                    op.host(
                        bytemuck::cast_slice(&amap[..]),
                        bytemuck::cast_slice_mut(&mut ymap[..]),
                    );
                    Ok(())
                } else {
                    let program = self.math_program(T::KIND)?;
                    let mut k = program.get_kernel(op.kernel_name())?;
                    k.add_arg(n as i32).add_arg(a).add_arg(y);
                    self.launch_1d(&k, n)
                }
            }
        }
    }

    /// Reduction with a call-scoped scratch buffer: allocated, filled
    /// with per-group partials, read back, and released before return
    /// on every path.
    #[cfg(any(feature = "cuda", feature = "opencl"))]
    fn reduce_device<T: Numeric>(
        &self,
        op: ReduceOp,
        n: usize,
        x: &VPtr<T>,
        y: Option<&VPtr<T>>,
    ) -> Result<T> {
        let groups = n
            .div_ceil(REDUCTION_LOCAL)
            .clamp(1, MAX_REDUCTION_GROUPS);
        let scratch_handle = self.malloc_device(groups * std::mem::size_of::<T>())?;
        let scratch: VPtr<T> = VPtr::new(scratch_handle.clone());
        let result = (|| -> Result<T> {
            let program = self.math_program(T::KIND)?;
            let mut k = program.get_kernel(op.kernel_name())?;
            k.add_arg(n as i32).add_arg(x);
            if let Some(y) = y {
                k.add_arg(y);
            }
            k.add_arg(&scratch);
            k.execute(&[groups], &[REDUCTION_LOCAL], self.current_queue_id())?;
            // Blocking readback extracts the scalar result.
            let mut partials = vec![T::ZERO; groups];
            self.copy_to_host(groups, &scratch, &mut partials)?;
            Ok(T::from_f64(partials.iter().map(|v| v.to_f64()).sum()))
        })();
        self.free_device(scratch_handle);
        result
    }

    // ---- public numeric API ----

    /// x = alpha, elementwise.
    pub fn set<T: Numeric>(&self, n: usize, alpha: T, x: &VPtr<T>) -> Result<()> {
        self.check_half::<T>("set")?;
        self.scalar_inplace(ScalarInplaceOp::Set, n, alpha, x)
    }

    /// x += alpha, elementwise.
    pub fn add_scalar<T: Numeric>(&self, n: usize, alpha: T, x: &VPtr<T>) -> Result<()> {
        self.check_half::<T>("add_scalar")?;
        self.scalar_inplace(ScalarInplaceOp::AddScalar, n, alpha, x)
    }

    /// x *= alpha.
    pub fn scal<T: Numeric>(&self, n: usize, alpha: T, x: &VPtr<T>) -> Result<()> {
        self.check_half::<T>("scal")?;
        self.scalar_inplace(ScalarInplaceOp::Scal, n, alpha, x)
    }

    /// y += alpha * x.
    pub fn axpy<T: Numeric>(&self, n: usize, alpha: T, x: &VPtr<T>, y: &VPtr<T>) -> Result<()> {
        self.check_half::<T>("axpy")?;
        self.scalar_xy(ScalarXyOp::Axpy, n, alpha, x, y)
    }

    /// y = alpha * x + beta * y.
    pub fn axpby<T: Numeric>(
        &self,
        n: usize,
        alpha: T,
        x: &VPtr<T>,
        beta: T,
        y: &VPtr<T>,
    ) -> Result<()> {
        self.check_half::<T>("axpby")?;
        self.scal(n, beta, y)?;
        self.axpy(n, alpha, x, y)
    }

    /// y = alpha * x.
    pub fn scale<T: Numeric>(&self, n: usize, alpha: T, x: &VPtr<T>, y: &VPtr<T>) -> Result<()> {
        self.check_half::<T>("scale")?;
        self.scalar_xy(ScalarXyOp::Scale, n, alpha, x, y)
    }

    /// y = a + b.
    pub fn add<T: Numeric>(&self, n: usize, a: &VPtr<T>, b: &VPtr<T>, y: &VPtr<T>) -> Result<()> {
        self.check_half::<T>("add")?;
        self.binary_math(BinaryMathOp::Add, n, a, b, y)
    }

    /// y = a - b.
    pub fn sub<T: Numeric>(&self, n: usize, a: &VPtr<T>, b: &VPtr<T>, y: &VPtr<T>) -> Result<()> {
        self.check_half::<T>("sub")?;
        self.binary_math(BinaryMathOp::Sub, n, a, b, y)
    }

    /// y = a * b, elementwise.
    pub fn mul<T: Numeric>(&self, n: usize, a: &VPtr<T>, b: &VPtr<T>, y: &VPtr<T>) -> Result<()> {
        self.check_half::<T>("mul")?;
        self.binary_math(BinaryMathOp::Mul, n, a, b, y)
    }

    /// y = a / b, elementwise.
    pub fn div<T: Numeric>(&self, n: usize, a: &VPtr<T>, b: &VPtr<T>, y: &VPtr<T>) -> Result<()> {
        self.check_half::<T>("div")?;
        self.binary_math(BinaryMathOp::Div, n, a, b, y)
    }

    /// y = |a|.
    pub fn abs<T: Numeric>(&self, n: usize, a: &VPtr<T>, y: &VPtr<T>) -> Result<()> {
        self.check_half::<T>("abs")?;
        self.unary_math(UnaryMathOp::Abs, n, a, y)
    }

    /// y = exp(a).
    pub fn exp<T: Numeric>(&self, n: usize, a: &VPtr<T>, y: &VPtr<T>) -> Result<()> {
        self.check_half::<T>("exp")?;
        self.unary_math(UnaryMathOp::Exp, n, a, y)
    }

    /// y = ln(a).
    pub fn log<T: Numeric>(&self, n: usize, a: &VPtr<T>, y: &VPtr<T>) -> Result<()> {
        self.check_half::<T>("log")?;
        self.unary_math(UnaryMathOp::Log, n, a, y)
    }

    /// y = sqrt(a).
    pub fn sqrt<T: Numeric>(&self, n: usize, a: &VPtr<T>, y: &VPtr<T>) -> Result<()> {
        self.check_half::<T>("sqrt")?;
        self.unary_math(UnaryMathOp::Sqrt, n, a, y)
    }

    /// y = sign(a).
    pub fn sign<T: Numeric>(&self, n: usize, a: &VPtr<T>, y: &VPtr<T>) -> Result<()> {
        self.check_half::<T>("sign")?;
        self.unary_math(UnaryMathOp::Sign, n, a, y)
    }

    /// y = 1 where the sign bit of a is set, else 0.
    pub fn sgnbit<T: Numeric>(&self, n: usize, a: &VPtr<T>, y: &VPtr<T>) -> Result<()> {
        self.check_half::<T>("sgnbit")?;
        self.unary_math(UnaryMathOp::Sgnbit, n, a, y)
    }

    /// y = a^b, fixed exponent.
    pub fn powx<T: Numeric>(&self, n: usize, a: &VPtr<T>, b: T, y: &VPtr<T>) -> Result<()> {
        self.check_half::<T>("powx")?;
        match &self.backend {
            BackendImpl::Cpu(_) => {
                let av = unsafe { a.host_slice(n)? };
                let yv = unsafe { y.host_slice_mut(n)? };
                blas::powx(av, b, yv);
                Ok(())
            }
            #[cfg(feature = "cuda")]
            BackendImpl::Cuda(_) => {
                let program = self.math_program(T::KIND)?;
                let mut k = program.get_kernel("karst_powx")?;
                k.add_arg(n as i32).add_arg(a).add_arg(scalar_arg(b)).add_arg(y);
                self.launch_1d(&k, n)
            }
            #[cfg(feature = "opencl")]
            BackendImpl::OpenCl(cl) => {
                if cl.is_cpu_class() {
                    let nbytes = n * std::mem::size_of::<T>();
                    let amap = unsafe { a.opencl()?.map(a.byte_offset(), nbytes, false)? };
                    let mut ymap = unsafe { y.opencl()?.map(y.byte_offset(), nbytes, true)? };
                    blas::powx(
                        bytemuck::cast_slice(&amap[..]),
                        b,
                        bytemuck::cast_slice_mut(&mut ymap[..]),
                    );
                    Ok(())
                } else {
                    let program = self.math_program(T::KIND)?;
                    let mut k = program.get_kernel("karst_powx")?;
                    k.add_arg(n as i32).add_arg(a).add_arg(scalar_arg(b)).add_arg(y);
                    self.launch_1d(&k, n)
                }
            }
        }
    }

    /// Inner product x·y, blocking.
    pub fn dot<T: Numeric>(&self, n: usize, x: &VPtr<T>, y: &VPtr<T>) -> Result<T> {
        self.check_half::<T>("dot")?;
        match &self.backend {
            BackendImpl::Cpu(_) => {
                let xs = unsafe { x.host_slice(n)? };
                let ys = unsafe { y.host_slice(n)? };
                Ok(blas::dot(xs, ys))
            }
            #[cfg(feature = "cuda")]
            BackendImpl::Cuda(_) => self.reduce_device(ReduceOp::Dot, n, x, Some(y)),
            #[cfg(feature = "opencl")]
            BackendImpl::OpenCl(cl) => {
                if cl.is_cpu_class() {
                    let nbytes = n * std::mem::size_of::<T>();
                    let xmap = unsafe { x.opencl()?.map(x.byte_offset(), nbytes, false)? };
                    let ymap = unsafe { y.opencl()?.map(y.byte_offset(), nbytes, false)? };
                    Ok(blas::dot(
                        bytemuck::cast_slice(&xmap[..]),
                        bytemuck::cast_slice(&ymap[..]),
                    ))
                } else {
                    self.reduce_device(ReduceOp::Dot, n, x, Some(y))
                }
            }
        }
    }

    /// Sum of absolute values, blocking.
    pub fn asum<T: Numeric>(&self, n: usize, x: &VPtr<T>) -> Result<T> {
        self.check_half::<T>("asum")?;
        match &self.backend {
            BackendImpl::Cpu(_) => Ok(blas::asum(unsafe { x.host_slice(n)? })),
            #[cfg(feature = "cuda")]
            BackendImpl::Cuda(_) => self.reduce_device(ReduceOp::Asum, n, x, None),
            #[cfg(feature = "opencl")]
            BackendImpl::OpenCl(cl) => {
                if cl.is_cpu_class() {
                    let nbytes = n * std::mem::size_of::<T>();
                    let xmap = unsafe { x.opencl()?.map(x.byte_offset(), nbytes, false)? };
                    Ok(blas::asum(bytemuck::cast_slice(&xmap[..])))
                } else {
                    self.reduce_device(ReduceOp::Asum, n, x, None)
                }
            }
        }
    }

    /// C = alpha * op(A) * op(B) + beta * C, row-major; op(A) is m×k,
    /// op(B) is k×n.
    #[allow(clippy::too_many_arguments)]
    pub fn gemm<T: Numeric>(
        &self,
        trans_a: Transpose,
        trans_b: Transpose,
        m: usize,
        n: usize,
        k: usize,
        alpha: T,
        a: &VPtr<T>,
        b: &VPtr<T>,
        beta: T,
        c: &VPtr<T>,
    ) -> Result<()> {
        self.check_half::<T>("gemm")?;
        let ta = i32::from(trans_a == Transpose::Trans);
        let tb = i32::from(trans_b == Transpose::Trans);
        match &self.backend {
            BackendImpl::Cpu(_) => {
                let av = unsafe { a.host_slice(m * k)? };
                let bv = unsafe { b.host_slice(k * n)? };
                let cv = unsafe { c.host_slice_mut(m * n)? };
                blas::gemm(trans_a, trans_b, m, n, k, alpha, av, bv, beta, cv);
                Ok(())
            }
            #[cfg(feature = "cuda")]
            BackendImpl::Cuda(_) => {
                let program = self.math_program(T::KIND)?;
                let mut kern = program.get_kernel("karst_gemm")?;
                kern.add_arg(m as i32)
                    .add_arg(n as i32)
                    .add_arg(k as i32)
                    .add_arg(scalar_arg(alpha))
                    .add_arg(a)
                    .add_arg(b)
                    .add_arg(scalar_arg(beta))
                    .add_arg(c)
                    .add_arg(ta)
                    .add_arg(tb);
                self.launch_1d(&kern, m * n)
            }
            #[cfg(feature = "opencl")]
            BackendImpl::OpenCl(cl) => {
                if cl.is_cpu_class() {
                    let amap = unsafe {
                        a.opencl()?
                            .map(a.byte_offset(), m * k * std::mem::size_of::<T>(), false)?
                    };
                    let bmap = unsafe {
                        b.opencl()?
                            .map(b.byte_offset(), k * n * std::mem::size_of::<T>(), false)?
                    };
                    let mut cmap = unsafe {
                        c.opencl()?
                            .map(c.byte_offset(), m * n * std::mem::size_of::<T>(), true)?
                    };
                    blas::gemm(
                        trans_a,
                        trans_b,
                        m,
                        n,
                        k,
                        alpha,
                        bytemuck::cast_slice(&amap[..]),
                        bytemuck::cast_slice(&bmap[..]),
                        beta,
                        bytemuck::cast_slice_mut(&mut cmap[..]),
                    );
                    Ok(())
                } else {
                    let program = self.math_program(T::KIND)?;
                    let mut kern = program.get_kernel("karst_gemm")?;
                    kern.add_arg(m as i32)
                        .add_arg(n as i32)
                        .add_arg(k as i32)
                        .add_arg(scalar_arg(alpha))
                        .add_arg(a)
                        .add_arg(b)
                        .add_arg(scalar_arg(beta))
                        .add_arg(c)
                        .add_arg(ta)
                        .add_arg(tb);
                    self.launch_1d(&kern, m * n)
                }
            }
        }
    }

    /// y = alpha * op(A) * x + beta * y; A stored m×n row-major.
    #[allow(clippy::too_many_arguments)]
    pub fn gemv<T: Numeric>(
        &self,
        trans_a: Transpose,
        m: usize,
        n: usize,
        alpha: T,
        a: &VPtr<T>,
        x: &VPtr<T>,
        beta: T,
        y: &VPtr<T>,
    ) -> Result<()> {
        self.check_half::<T>("gemv")?;
        match &self.backend {
            BackendImpl::Cpu(_) => {
                let av = unsafe { a.host_slice(m * n)? };
                let (rows, cols) = match trans_a {
                    Transpose::NoTrans => (m, n),
                    Transpose::Trans => (n, m),
                };
                let xs = unsafe { x.host_slice(cols)? };
                let ys = unsafe { y.host_slice_mut(rows)? };
                blas::gemv(trans_a, m, n, alpha, av, xs, beta, ys);
                Ok(())
            }
            #[allow(unreachable_patterns)]
            _ => {
                // A matrix-vector product is a gemm with one output
                // column; the stored matrix keeps its m×n layout.
                let (rows, cols) = match trans_a {
                    Transpose::NoTrans => (m, n),
                    Transpose::Trans => (n, m),
                };
                self.gemm(trans_a, Transpose::NoTrans, rows, 1, cols, alpha, a, x, beta, y)
            }
        }
    }

    // ---- RNG ----
    //
    // Sequences are drawn on the host and uploaded, which keeps every
    // backend on the same generator.

    /// Uniform values in (a, b].
    pub fn rng_uniform<T: Numeric>(&self, n: usize, a: T, b: T, r: &VPtr<T>) -> Result<()> {
        self.check_half::<T>("rng_uniform")?;
        let mut host = vec![T::ZERO; n];
        rng::uniform(a, b, &mut host);
        self.copy_from_host(n, &host, r)
    }

    /// N(mu, sigma²) values.
    pub fn rng_gaussian<T: Numeric>(&self, n: usize, mu: T, sigma: T, r: &VPtr<T>) -> Result<()> {
        self.check_half::<T>("rng_gaussian")?;
        let mut host = vec![T::ZERO; n];
        rng::gaussian(mu, sigma, &mut host);
        self.copy_from_host(n, &host, r)
    }

    /// Bernoulli(p) draws as 0/1 integers.
    pub fn rng_bernoulli<T: Numeric>(&self, n: usize, p: T, r: &VPtr<i32>) -> Result<()> {
        self.check_half::<T>("rng_bernoulli")?;
        let mut host = vec![0i32; n];
        rng::bernoulli(p, &mut host);
        self.copy_from_host(n, &host, r)
    }

    /// Full-range u32 values.
    pub fn rng_uniform_u32(&self, n: usize, r: &VPtr<u32>) -> Result<()> {
        let mut host = vec![0u32; n];
        rng::uniform_u32(&mut host);
        self.copy_from_host(n, &host, r)
    }

    /// Full-range u64 values.
    pub fn rng_uniform_u64(&self, n: usize, r: &VPtr<u64>) -> Result<()> {
        let mut host = vec![0u64; n];
        rng::uniform_u64(&mut host);
        self.copy_from_host(n, &host, r)
    }
}
