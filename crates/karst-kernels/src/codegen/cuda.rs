//! CUDA C emitter.

use super::{KernelArg, ProgramBuilder, ARG_CONST};

/// Emits CUDA C for NVRTC.
///
/// CUDA device pointers support host-side arithmetic, so offset-carrying
/// memory arguments become single, already-offset pointer parameters.
/// Scalar arguments are coalesced into one `struct` parameter per kernel
/// (`<name>_sargs_t`), passed by value; the launcher packs the scalar
/// values in declaration order with natural alignment so the layouts
/// agree. A preamble unpacks the struct back into the declared names so
/// kernel bodies stay backend-agnostic.
#[derive(Debug, Default, Clone, Copy)]
pub struct CudaBuilder;

impl CudaBuilder {
    fn sargs_ty(name: &str) -> String {
        format!("{name}_sargs_t")
    }
}

impl ProgramBuilder for CudaBuilder {
    fn lang(&self) -> &'static str {
        "cuda"
    }

    fn setup(&self) -> String {
        let mut ss = String::new();
        ss.push_str("typedef int int_tp;\n");
        ss.push_str("typedef unsigned int uint_tp;\n");
        ss
    }

    fn define_type(&self, ty: &str, alias: &str) -> String {
        let mut ss = String::new();
        if ty == "half" {
            ss.push_str("#include <cuda_fp16.h>\n");
        }
        ss.push_str(&format!("typedef {ty} {alias};\n"));
        ss
    }

    fn function(&self, name: &str, args: &[KernelArg]) -> String {
        let mut ss = String::new();
        let scalars: Vec<&KernelArg> = args.iter().filter(|a| !a.is_mem()).collect();
        let mems: Vec<&KernelArg> = args.iter().filter(|a| a.is_mem()).collect();

        if !scalars.is_empty() {
            ss.push_str("typedef struct {\n");
            for arg in &scalars {
                ss.push_str(&format!("{} {};\n", arg.ty, arg.name));
            }
            ss.push_str(&format!("}} {};\n", Self::sargs_ty(name)));
        }

        ss.push_str("extern \"C\" __global__ void ");
        ss.push_str(name);
        ss.push('(');
        let mut first = true;
        if !scalars.is_empty() {
            ss.push_str(&format!("{} __sargs", Self::sargs_ty(name)));
            first = false;
        }
        for arg in &mems {
            if !first {
                ss.push_str(", ");
            }
            first = false;
            if arg.flags & ARG_CONST != 0 {
                ss.push_str("const ");
            }
            ss.push_str(&arg.ty);
            ss.push_str("* ");
            ss.push_str(&arg.name);
        }
        ss.push_str(") {\n");
        for arg in &scalars {
            ss.push_str(&format!(
                "const {} {} = __sargs.{};\n",
                arg.ty, arg.name, arg.name
            ));
        }
        ss
    }

    fn kernel_loop(&self, ty: &str, index: &str, n: &str) -> String {
        format!(
            "for ({ty} {index} = blockIdx.x * blockDim.x + threadIdx.x; \
             {index} < ({n}); {index} += blockDim.x * gridDim.x) {{\n"
        )
    }

    fn global_ptr(&self, ty: &str, name: &str) -> String {
        format!("{ty}* {name}")
    }

    fn local_ptr(&self, ty: &str, name: &str) -> String {
        format!("{ty}* {name}")
    }

    fn local_mem(&self, ty: &str) -> String {
        format!("__shared__ {ty} ")
    }

    fn local_id(&self, dim: usize) -> String {
        match dim {
            0 => "threadIdx.x".to_string(),
            1 => "threadIdx.y".to_string(),
            _ => "threadIdx.z".to_string(),
        }
    }

    fn local_size(&self, dim: usize) -> String {
        match dim {
            0 => "blockDim.x".to_string(),
            1 => "blockDim.y".to_string(),
            _ => "blockDim.z".to_string(),
        }
    }

    fn group_id(&self, dim: usize) -> String {
        match dim {
            0 => "blockIdx.x".to_string(),
            1 => "blockIdx.y".to_string(),
            _ => "blockIdx.z".to_string(),
        }
    }

    fn group_size(&self, dim: usize) -> String {
        match dim {
            0 => "gridDim.x".to_string(),
            1 => "gridDim.y".to_string(),
            _ => "gridDim.z".to_string(),
        }
    }

    fn global_id(&self, dim: usize) -> String {
        format!(
            "({} * {} + {})",
            self.group_id(dim),
            self.local_size(dim),
            self.local_id(dim)
        )
    }

    fn global_size(&self, dim: usize) -> String {
        format!("({} * {})", self.group_size(dim), self.local_size(dim))
    }

    fn local_barrier(&self) -> String {
        "__syncthreads();".to_string()
    }

    fn global_barrier(&self) -> String {
        "__threadfence();".to_string()
    }

    fn atomics(&self) -> String {
        let mut ss = String::new();
        for ty in ["float", "double"] {
            ss.push_str(&format!(
                "__device__ inline void karst_atomic_{ty}_add(volatile {ty}* source, \
                 const {ty} operand) {{ atomicAdd(({ty}*)source, operand); }}\n"
            ));
            ss.push_str(&format!(
                "__device__ inline void karst_atomic_{ty}_sub(volatile {ty}* source, \
                 const {ty} operand) {{ atomicAdd(({ty}*)source, -operand); }}\n"
            ));
        }
        ss
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codegen::{ARG_CONST, ARG_GLOBAL_MEM, ARG_MEM_OFFSET};

    #[test]
    fn test_scalars_coalesce_into_struct() {
        let b = CudaBuilder;
        let args = vec![
            KernelArg::int("n"),
            KernelArg::dtype_scalar("alpha"),
            KernelArg::dtype_mem("x", ARG_CONST),
            KernelArg::dtype_mem("y", 0),
        ];
        let src = b.function("axpy", &args);
        assert!(src.contains("typedef struct"));
        assert!(src.contains("axpy_sargs_t __sargs"));
        assert!(src.contains("const int_tp n = __sargs.n;"));
        assert!(src.contains("const Dtype_arg alpha = __sargs.alpha;"));
        // Pointers stay single parameters, no offset splitting.
        assert!(src.contains("const Dtype* x"));
        assert!(src.contains("Dtype* y"));
        assert!(!src.contains("x_raw_ptr"));
        assert!(!src.contains("x_offset"));
    }

    #[test]
    fn test_pointer_only_kernel_has_no_struct() {
        let b = CudaBuilder;
        let args = vec![KernelArg::new(
            "Dtype",
            "x",
            ARG_GLOBAL_MEM | ARG_MEM_OFFSET,
        )];
        let src = b.function("touch", &args);
        assert!(!src.contains("typedef struct"));
        assert!(src.contains("extern \"C\" __global__ void touch(Dtype* x)"));
    }

    #[test]
    fn test_kernel_loop_is_grid_strided() {
        let l = CudaBuilder.kernel_loop("int_tp", "index", "n");
        assert!(l.contains("blockIdx.x * blockDim.x + threadIdx.x"));
        assert!(l.contains("blockDim.x * gridDim.x"));
    }

    #[test]
    fn test_half_define_pulls_header() {
        let d = CudaBuilder.define_type("half", "Dtype");
        assert!(d.contains("cuda_fp16.h"));
        assert!(d.contains("typedef half Dtype;"));
        let f = CudaBuilder.define_type("float", "Dtype");
        assert!(!f.contains("cuda_fp16.h"));
    }
}
