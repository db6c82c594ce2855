//! OpenCL C emitter.

use super::{KernelArg, ProgramBuilder, ARG_CONST, ARG_GLOBAL_MEM, ARG_LOCAL_MEM, ARG_MEM_OFFSET};

/// Emits OpenCL C. Memory arguments flagged with [`ARG_MEM_OFFSET`] are
/// split into a raw memory-object parameter plus an element offset and
/// rejoined at the top of the kernel body, because `cl_mem` handles do
/// not support pointer arithmetic at the API boundary.
#[derive(Debug, Default, Clone, Copy)]
pub struct ClBuilder;

impl ClBuilder {
    fn address_space(flags: u32) -> &'static str {
        if flags & ARG_GLOBAL_MEM != 0 {
            "__global "
        } else if flags & ARG_LOCAL_MEM != 0 {
            "__local "
        } else {
            ""
        }
    }

    fn pointer_suffix(flags: u32) -> &'static str {
        if flags & (ARG_GLOBAL_MEM | ARG_LOCAL_MEM) != 0 {
            "*"
        } else {
            ""
        }
    }
}

impl ProgramBuilder for ClBuilder {
    fn lang(&self) -> &'static str {
        "opencl"
    }

    fn setup(&self) -> String {
        let mut ss = String::new();
        // 64 bit floats: KHR on most stacks, AMD spelling on the rest.
        ss.push_str("#if defined(cl_khr_fp64)\n");
        ss.push_str("#pragma OPENCL EXTENSION cl_khr_fp64 : enable\n");
        ss.push_str("#define DOUBLE_SUPPORT_AVAILABLE\n");
        ss.push_str("#elif defined(cl_amd_fp64)\n");
        ss.push_str("#pragma OPENCL EXTENSION cl_amd_fp64 : enable\n");
        ss.push_str("#define DOUBLE_SUPPORT_AVAILABLE\n");
        ss.push_str("#endif\n");
        ss.push_str("#if defined(cl_khr_fp16)\n");
        ss.push_str("#pragma OPENCL EXTENSION cl_khr_fp16 : enable\n");
        ss.push_str("#define HALF_SUPPORT_AVAILABLE\n");
        ss.push_str("#endif\n");
        ss.push_str("typedef int int_tp;\n");
        ss.push_str("typedef unsigned int uint_tp;\n");
        ss
    }

    fn define_type(&self, ty: &str, alias: &str) -> String {
        format!("typedef {ty} {alias};\n")
    }

    fn function(&self, name: &str, args: &[KernelArg]) -> String {
        let mut ss = String::new();
        ss.push_str("__kernel void ");
        ss.push_str(name);
        ss.push('(');
        for (i, arg) in args.iter().enumerate() {
            if i > 0 {
                ss.push_str(", ");
            }
            ss.push_str(Self::address_space(arg.flags));
            if arg.flags & ARG_CONST != 0 {
                ss.push_str("const ");
            }
            ss.push_str(&arg.ty);
            ss.push_str(Self::pointer_suffix(arg.flags));
            ss.push(' ');
            if arg.has_offset() {
                ss.push_str(&arg.name);
                ss.push_str("_raw_ptr, const uint_tp ");
                ss.push_str(&arg.name);
                ss.push_str("_offset");
            } else {
                ss.push_str(&arg.name);
            }
        }
        ss.push_str(") {\n");
        // Rejoin split arguments so bodies can use the plain names.
        for arg in args.iter().filter(|a| a.has_offset()) {
            ss.push_str(Self::address_space(arg.flags));
            if arg.flags & ARG_CONST != 0 {
                ss.push_str("const ");
            }
            ss.push_str(&arg.ty);
            ss.push_str("* ");
            ss.push_str(&arg.name);
            ss.push_str(" = ");
            ss.push_str(&arg.name);
            ss.push_str("_raw_ptr + ");
            ss.push_str(&arg.name);
            ss.push_str("_offset;\n");
        }
        ss
    }

    fn kernel_loop(&self, ty: &str, index: &str, n: &str) -> String {
        format!(
            "for ({ty} {index} = get_global_id(0); {index} < ({n}); \
             {index} += get_global_size(0)) {{\n"
        )
    }

    fn global_ptr(&self, ty: &str, name: &str) -> String {
        format!("__global {ty}* {name}")
    }

    fn local_ptr(&self, ty: &str, name: &str) -> String {
        format!("__local {ty}* {name}")
    }

    fn local_mem(&self, ty: &str) -> String {
        format!("__local {ty} ")
    }

    fn local_id(&self, dim: usize) -> String {
        format!("get_local_id({dim})")
    }

    fn local_size(&self, dim: usize) -> String {
        format!("get_local_size({dim})")
    }

    fn group_id(&self, dim: usize) -> String {
        format!("get_group_id({dim})")
    }

    fn group_size(&self, dim: usize) -> String {
        format!("get_num_groups({dim})")
    }

    fn global_id(&self, dim: usize) -> String {
        format!("get_global_id({dim})")
    }

    fn global_size(&self, dim: usize) -> String {
        format!("get_global_size({dim})")
    }

    fn local_barrier(&self) -> String {
        "barrier(CLK_LOCAL_MEM_FENCE);".to_string()
    }

    fn global_barrier(&self) -> String {
        "barrier(CLK_GLOBAL_MEM_FENCE);".to_string()
    }

    fn atomics(&self) -> String {
        let mut ss = String::new();
        ss.push_str("#if defined(cl_khr_int32_base_atomics)\n");
        ss.push_str("#pragma OPENCL EXTENSION cl_khr_int32_base_atomics : enable\n");
        ss.push_str("#define ATOMICS_32_AVAILABLE\n");
        ss.push_str("#endif\n");
        ss.push_str("#if defined(cl_khr_global_int32_base_atomics)\n");
        ss.push_str("#pragma OPENCL EXTENSION cl_khr_global_int32_base_atomics : enable\n");
        ss.push_str("#define ATOMICS_32_AVAILABLE\n");
        ss.push_str("#endif\n");
        ss.push_str("#if defined(cl_khr_int64_base_atomics)\n");
        ss.push_str("#pragma OPENCL EXTENSION cl_khr_int64_base_atomics : enable\n");
        ss.push_str("#define ATOMICS_64_AVAILABLE\n");
        ss.push_str("#endif\n");

        // Compare-and-swap emulation over the float types; fp32 rides the
        // 32 bit atomics, fp64 needs the 64 bit extension.
        for ty in ["float", "double"] {
            if ty == "float" {
                ss.push_str("#if defined(ATOMICS_32_AVAILABLE)\n");
            } else {
                ss.push_str("#if defined(ATOMICS_64_AVAILABLE)\n");
            }
            for (func, op) in [("add", "+"), ("sub", "-"), ("mul", "*"), ("div", "/")] {
                ss.push_str(&format!(
                    "inline void karst_atomic_{ty}_{func}(volatile __global {ty}* source, \
                     const {ty} operand) {{\n"
                ));
                ss.push_str("union {\n");
                if ty == "double" {
                    ss.push_str("unsigned long intVal;\n");
                } else {
                    ss.push_str("unsigned int intVal;\n");
                }
                ss.push_str(&format!("{ty} floatVal;\n"));
                ss.push_str("} next, expected, current;\n");
                ss.push_str("current.floatVal = *source;\n");
                ss.push_str("do {\n");
                ss.push_str("expected.intVal = current.intVal;\n");
                ss.push_str(&format!(
                    "next.floatVal = expected.floatVal {op} operand;\n"
                ));
                if ty == "double" {
                    ss.push_str(
                        "current.intVal = atom_cmpxchg((volatile __global unsigned long*)\
                         source, expected.intVal, next.intVal);\n",
                    );
                } else {
                    ss.push_str(
                        "current.intVal = atomic_cmpxchg((volatile __global unsigned int*)\
                         source, expected.intVal, next.intVal);\n",
                    );
                }
                ss.push_str("} while (current.intVal != expected.intVal);\n");
                ss.push_str("}\n");
            }
            ss.push_str("#endif\n");
        }
        ss
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codegen::ARG_GLOBAL_MEM;

    #[test]
    fn test_offset_args_are_split_and_rejoined() {
        let b = ClBuilder;
        let args = vec![
            KernelArg::int("n"),
            KernelArg::dtype_mem("x", ARG_CONST),
            KernelArg::dtype_mem("y", 0),
        ];
        let src = b.function("axpy", &args);
        assert!(src.contains("x_raw_ptr, const uint_tp x_offset"));
        assert!(src.contains("y_raw_ptr, const uint_tp y_offset"));
        assert!(src.contains("__global const Dtype* x = x_raw_ptr + x_offset;"));
        assert!(src.contains("__global Dtype* y = y_raw_ptr + y_offset;"));
    }

    #[test]
    fn test_plain_args_are_untouched() {
        let b = ClBuilder;
        let args = vec![
            KernelArg::int("n"),
            KernelArg::int_mem("im_shape", ARG_CONST),
        ];
        let src = b.function("probe", &args);
        assert!(src.contains("const int_tp n"));
        assert!(src.contains("__global const int_tp* im_shape"));
        assert!(!src.contains("im_shape_offset"));
    }

    #[test]
    fn test_kernel_loop_is_grid_strided() {
        let b = ClBuilder;
        let l = b.kernel_loop("int_tp", "index", "n");
        assert!(l.contains("get_global_id(0)"));
        assert!(l.contains("get_global_size(0)"));
    }

    #[test]
    fn test_setup_enables_extensions() {
        let s = ClBuilder.setup();
        assert!(s.contains("cl_khr_fp64"));
        assert!(s.contains("cl_khr_fp16"));
        assert!(s.contains("typedef int int_tp;"));
    }

    #[test]
    fn test_atomics_use_cmpxchg() {
        let a = ClBuilder.atomics();
        assert!(a.contains("karst_atomic_float_add"));
        assert!(a.contains("atom_cmpxchg"));
        assert!(a.contains("atomic_cmpxchg"));
    }
}
