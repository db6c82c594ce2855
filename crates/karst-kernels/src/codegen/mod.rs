//! Backend-agnostic kernel source construction.
//!
//! Generators describe a kernel as a signature (`KernelArg` list with
//! memory-class flags) plus a body written through the [`ProgramBuilder`]
//! API. The two emitters ([`cuda::CudaBuilder`] and
//! [`opencl::ClBuilder`]) turn that description into CUDA C or OpenCL C.
//!
//! The emitters differ where the backends force them to:
//! - OpenCL memory objects cannot carry a pointer offset across the API
//!   boundary, so arguments flagged [`ARG_MEM_OFFSET`] are split into a
//!   `<name>_raw_ptr` parameter plus a `<name>_offset` parameter and
//!   rejoined by a pointer-arithmetic statement at the top of the body.
//! - CUDA device pointers support host-side arithmetic, so the same
//!   argument stays a single, already-offset pointer parameter. Scalar
//!   arguments are coalesced into one parameter block to keep launch
//!   parameter counts bounded.

pub mod cuda;
pub mod opencl;

pub use cuda::CudaBuilder;
pub use opencl::ClBuilder;

/// Argument lives in global (device) memory.
pub const ARG_GLOBAL_MEM: u32 = 1 << 0;
/// Argument lives in local (workgroup-shared) memory.
pub const ARG_LOCAL_MEM: u32 = 1 << 1;
/// Argument is read-only inside the kernel.
pub const ARG_CONST: u32 = 1 << 2;
/// Memory argument that carries an element offset next to its handle.
pub const ARG_MEM_OFFSET: u32 = 1 << 3;

/// One declared kernel parameter: type name, identifier, memory flags.
///
/// Type names are kernel-language identifiers; `Dtype`, `int_tp` and
/// `uint_tp` are typedef'd by [`ProgramBuilder::setup`] /
/// [`ProgramBuilder::define_type`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelArg {
    pub ty: String,
    pub name: String,
    pub flags: u32,
}

impl KernelArg {
    pub fn new(ty: impl Into<String>, name: impl Into<String>, flags: u32) -> Self {
        Self {
            ty: ty.into(),
            name: name.into(),
            flags,
        }
    }

    /// Scalar numeric argument. Uses the `Dtype_arg` alias because
    /// OpenCL kernels cannot take half-precision scalars; the alias
    /// resolves to `float` there and to `Dtype` everywhere else.
    pub fn dtype_scalar(name: &str) -> Self {
        Self::new("Dtype_arg", name, ARG_CONST)
    }

    /// Global-memory `Dtype` buffer with an element offset.
    pub fn dtype_mem(name: &str, extra: u32) -> Self {
        Self::new("Dtype", name, ARG_GLOBAL_MEM | ARG_MEM_OFFSET | extra)
    }

    /// Scalar `int_tp` argument.
    pub fn int(name: &str) -> Self {
        Self::new("int_tp", name, ARG_CONST)
    }

    /// Global-memory `int_tp` buffer.
    pub fn int_mem(name: &str, extra: u32) -> Self {
        Self::new("int_tp", name, ARG_GLOBAL_MEM | extra)
    }

    pub fn is_mem(&self) -> bool {
        self.flags & (ARG_GLOBAL_MEM | ARG_LOCAL_MEM) != 0
    }

    pub fn has_offset(&self) -> bool {
        self.flags & ARG_MEM_OFFSET != 0
    }
}

/// Code-emission interface implemented per kernel language.
///
/// Generator functions only talk to this trait, keeping the odometer and
/// offset algorithms backend-agnostic.
pub trait ProgramBuilder: Send + Sync {
    /// Short language tag ("cuda" or "opencl"), used in diagnostics.
    fn lang(&self) -> &'static str;

    /// Preamble: extension pragmas and the `int_tp`/`uint_tp` typedefs.
    fn setup(&self) -> String;

    /// `typedef <ty> <alias>;` plus any support the alias needs (e.g.
    /// half-precision headers).
    fn define_type(&self, ty: &str, alias: &str) -> String;

    /// Kernel signature and opening brace, including any per-backend
    /// argument rewriting (offset splitting, scalar coalescing) and the
    /// body preamble that undoes it.
    fn function(&self, name: &str, args: &[KernelArg]) -> String;

    /// Grid-stride loop header over `n` work items.
    fn kernel_loop(&self, ty: &str, index: &str, n: &str) -> String;

    /// Declaration of a pointer into global memory.
    fn global_ptr(&self, ty: &str, name: &str) -> String;

    /// Declaration of a pointer into local memory.
    fn local_ptr(&self, ty: &str, name: &str) -> String;

    /// Storage-class prefix for a local-memory array declaration.
    fn local_mem(&self, ty: &str) -> String;

    fn local_id(&self, dim: usize) -> String;
    fn local_size(&self, dim: usize) -> String;
    fn group_id(&self, dim: usize) -> String;
    fn group_size(&self, dim: usize) -> String;
    fn global_id(&self, dim: usize) -> String;
    fn global_size(&self, dim: usize) -> String;

    fn local_barrier(&self) -> String;
    fn global_barrier(&self) -> String;

    /// Atomic add/sub/mul/div helpers over the floating types the
    /// backend can support. Custom programs opt in; the built-in
    /// families do not use atomics.
    fn atomics(&self) -> String;
}

/// Math helper macros over the program's `Dtype` alias.
///
/// Half math routes through `float`; single and double map straight to
/// the overloaded C functions. Plain `#define`s so both kernel languages
/// accept the same text.
pub fn dtype_math_defines(ty: &str) -> String {
    let mut ss = String::new();
    if ty == "half" {
        ss.push_str("#define Dtype_exp(x) ((Dtype)exp((float)(x)))\n");
        ss.push_str("#define Dtype_log(x) ((Dtype)log((float)(x)))\n");
        ss.push_str("#define Dtype_sqrt(x) ((Dtype)sqrt((float)(x)))\n");
        ss.push_str("#define Dtype_pow(x, y) ((Dtype)pow((float)(x), (float)(y)))\n");
        ss.push_str("#define Dtype_signbit(x) signbit((float)(x))\n");
    } else {
        ss.push_str("#define Dtype_exp(x) exp(x)\n");
        ss.push_str("#define Dtype_log(x) log(x)\n");
        ss.push_str("#define Dtype_sqrt(x) sqrt(x)\n");
        ss.push_str("#define Dtype_pow(x, y) pow(x, y)\n");
        ss.push_str("#define Dtype_signbit(x) signbit(x)\n");
    }
    ss.push_str("#define Dtype_abs(x) ((x) < (Dtype)0 ? -(x) : (x))\n");
    ss
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_arg_flags() {
        let a = KernelArg::dtype_mem("data_im", ARG_CONST);
        assert!(a.is_mem());
        assert!(a.has_offset());
        assert_eq!(a.ty, "Dtype");

        let n = KernelArg::int("n");
        assert!(!n.is_mem());
        assert!(!n.has_offset());
    }

    #[test]
    fn test_math_defines_half_routes_through_float() {
        let half = dtype_math_defines("half");
        assert!(half.contains("(float)(x)"));
        let single = dtype_math_defines("float");
        assert!(!single.contains("(float)(x)"));
        assert!(single.contains("Dtype_abs"));
    }
}
