//! Im2col program generation and dispatch.
//!
//! The fixed-rank 2D kernels use one work item per output element,
//! recovering multi-dimensional coordinates by integer div/mod and
//! walking the receptive field with zero-padded out-of-range reads.
//! The N-D kernels (one per rank, 0 ≤ rank < 6) cache the geometry
//! vectors in workgroup-local memory behind a barrier and walk the
//! kernel footprint with a bounded odometer; the backward pass rejects
//! empty column ranges early and skips dilation-misaligned taps via a
//! modulo test.

use karst_kernels::codegen::{KernelArg, ARG_CONST};
use karst_kernels::cpu::im2col as host_im2col;

use crate::backends::BackendImpl;
use crate::device::Device;
use crate::dtype::{ElemKind, Numeric};
use crate::error::{Error, Result};
use crate::program::DeviceProgram;
use crate::vptr::VPtr;

/// Highest N-D rank (exclusive) a generated kernel exists for.
pub const MAX_SPATIAL_AXES: usize = 6;

pub use karst_kernels::cpu::im2col::conv_out_size;

// ---------------------------------------------------------------------------
// Source generation
// ---------------------------------------------------------------------------

fn generate_im2col_2d(p: &mut DeviceProgram, ss: &mut String) {
    // Forward: one work item per column element.
    let mut fw_args = vec![
        KernelArg::int("n"),
        KernelArg::dtype_mem("data_im", ARG_CONST),
    ];
    for name in [
        "height", "width", "kernel_h", "kernel_w", "pad_h", "pad_w", "stride_h", "stride_w",
        "dilation_h", "dilation_w", "height_col", "width_col",
    ] {
        fw_args.push(KernelArg::int(name));
    }
    fw_args.push(KernelArg::dtype_mem("data_col", 0));
    ss.push_str(&p.function("im2col", fw_args));
    ss.push_str(&p.kernel_loop("int_tp", "index", "n"));
    ss.push_str("const int_tp h_index = index / width_col;\n");
    ss.push_str("const int_tp h_col = h_index % height_col;\n");
    ss.push_str("const int_tp w_col = index % width_col;\n");
    ss.push_str("const int_tp c_im = h_index / height_col;\n");
    ss.push_str("const int_tp c_col = c_im * kernel_h * kernel_w;\n");
    ss.push_str("const int_tp h_offset = h_col * stride_h - pad_h;\n");
    ss.push_str("const int_tp w_offset = w_col * stride_w - pad_w;\n");
    ss.push_str(&format!("{} = data_col;\n", p.global_ptr("Dtype", "data_col_ptr")));
    ss.push_str("data_col_ptr += (c_col * height_col + h_col) * width_col + w_col;\n");
    ss.push_str(&format!(
        "{} = data_im;\n",
        p.global_ptr("const Dtype", "data_im_ptr")
    ));
    ss.push_str("data_im_ptr += (c_im * height + h_offset) * width + w_offset;\n");
    ss.push_str("for (int_tp i = 0; i < kernel_h; ++i) {\n");
    ss.push_str("for (int_tp j = 0; j < kernel_w; ++j) {\n");
    ss.push_str("const int_tp h_im = h_offset + i * dilation_h;\n");
    ss.push_str("const int_tp w_im = w_offset + j * dilation_w;\n");
    ss.push_str(
        "*data_col_ptr = (h_im >= 0 && w_im >= 0 && h_im < height && w_im < width) ? \
         data_im_ptr[i * dilation_h * width + j * dilation_w] : (Dtype)0;\n",
    );
    ss.push_str("data_col_ptr += height_col * width_col;\n");
    ss.push_str("}\n}\n}\n}\n");

    // Backward: one work item per image element accumulates every
    // overlapping window, so no atomics are needed.
    let mut bw_args = vec![
        KernelArg::int("n"),
        KernelArg::dtype_mem("data_col", ARG_CONST),
    ];
    for name in [
        "height", "width", "channels", "kernel_h", "kernel_w", "pad_h", "pad_w", "stride_h",
        "stride_w", "dilation_h", "dilation_w", "height_col", "width_col",
    ] {
        bw_args.push(KernelArg::int(name));
    }
    bw_args.push(KernelArg::dtype_mem("data_im", 0));
    ss.push_str(&p.function("col2im", bw_args));
    ss.push_str(&p.kernel_loop("int_tp", "index", "n"));
    ss.push_str("Dtype val = (Dtype)0;\n");
    ss.push_str("const int_tp w_im = index % width + pad_w;\n");
    ss.push_str("const int_tp h_im = (index / width) % height + pad_h;\n");
    ss.push_str("const int_tp c_im = index / (width * height);\n");
    ss.push_str("const int_tp kernel_extent_w = (kernel_w - 1) * dilation_w + 1;\n");
    ss.push_str("const int_tp kernel_extent_h = (kernel_h - 1) * dilation_h + 1;\n");
    ss.push_str(
        "const int_tp w_col_start = (w_im < kernel_extent_w) ? 0 : \
         (w_im - kernel_extent_w) / stride_w + 1;\n",
    );
    ss.push_str("const int_tp w_col_end = min(w_im / stride_w + 1, width_col);\n");
    ss.push_str(
        "const int_tp h_col_start = (h_im < kernel_extent_h) ? 0 : \
         (h_im - kernel_extent_h) / stride_h + 1;\n",
    );
    ss.push_str("const int_tp h_col_end = min(h_im / stride_h + 1, height_col);\n");
    ss.push_str("for (int_tp h_col = h_col_start; h_col < h_col_end; h_col += 1) {\n");
    ss.push_str("for (int_tp w_col = w_col_start; w_col < w_col_end; w_col += 1) {\n");
    ss.push_str("int_tp h_k = h_im - h_col * stride_h;\n");
    ss.push_str("int_tp w_k = w_im - w_col * stride_w;\n");
    ss.push_str("if (h_k % dilation_h == 0 && w_k % dilation_w == 0) {\n");
    ss.push_str("h_k /= dilation_h;\n");
    ss.push_str("w_k /= dilation_w;\n");
    ss.push_str(
        "const int_tp data_col_index = (((c_im * kernel_h + h_k) * kernel_w + w_k) * \
         height_col + h_col) * width_col + w_col;\n",
    );
    ss.push_str("val += data_col[data_col_index];\n");
    ss.push_str("}\n}\n}\n");
    ss.push_str("data_im[index] = val;\n");
    ss.push_str("}\n}\n");
}

fn nd_args(data_in: &str, data_out: &str) -> Vec<KernelArg> {
    vec![
        KernelArg::int("n"),
        KernelArg::dtype_mem(data_in, ARG_CONST),
        KernelArg::new("int_tp", "im_shape", karst_kernels::codegen::ARG_GLOBAL_MEM | ARG_CONST | karst_kernels::codegen::ARG_MEM_OFFSET),
        KernelArg::new("int_tp", "col_shape", karst_kernels::codegen::ARG_GLOBAL_MEM | ARG_CONST | karst_kernels::codegen::ARG_MEM_OFFSET),
        KernelArg::int_mem("kernel_shape", ARG_CONST),
        KernelArg::int_mem("pad", ARG_CONST),
        KernelArg::int_mem("stride", ARG_CONST),
        KernelArg::int_mem("dilation", ARG_CONST),
        KernelArg::dtype_mem(data_out, 0),
    ]
}

/// Emit the shared-memory staging of the geometry vectors plus the
/// barrier that publishes them to the workgroup.
fn emit_shared_geometry(p: &DeviceProgram, ss: &mut String, axes: usize) {
    let arr = axes.max(1);
    for name in ["dilation", "kernel_shape", "pad", "stride"] {
        ss.push_str(&p.local_mem("int_tp"));
        ss.push_str(&format!("shared_{name}[{arr}];\n"));
    }
    for name in ["col_shape", "im_shape"] {
        ss.push_str(&p.local_mem("int_tp"));
        ss.push_str(&format!("shared_{name}[{}];\n", axes + 1));
    }
    ss.push_str(&format!(
        "for (int_tp li = {}; li < {axes}; li += {}) {{\n",
        p.local_id(0),
        p.local_size(0)
    ));
    ss.push_str("shared_dilation[li] = dilation[li];\n");
    ss.push_str("shared_kernel_shape[li] = kernel_shape[li];\n");
    ss.push_str("shared_pad[li] = pad[li];\n");
    ss.push_str("shared_stride[li] = stride[li];\n");
    ss.push_str("}\n");
    ss.push_str(&format!(
        "for (int_tp li = {}; li < {}; li += {}) {{\n",
        p.local_id(0),
        axes + 1,
        p.local_size(0)
    ));
    ss.push_str("shared_col_shape[li] = col_shape[li];\n");
    ss.push_str("shared_im_shape[li] = im_shape[li];\n");
    ss.push_str("}\n");
    ss.push_str(&p.local_barrier());
    ss.push('\n');
}

fn generate_im2col_nd(p: &mut DeviceProgram, ss: &mut String, axes: usize) {
    let arr = axes.max(1);

    // Forward.
    ss.push_str(&p.function(&format!("im2col_nd_{axes}"), nd_args("data_im", "data_col")));
    if axes == 0 {
        // Rank zero degenerates to a channel copy.
        ss.push_str(&p.kernel_loop("int_tp", "index", "n"));
        ss.push_str("data_col[index] = data_im[index];\n}\n}\n");
    } else {
        ss.push_str(&format!("int_tp d_temp[{arr}];\n"));
        ss.push_str(&format!("int_tp d_iter[{arr}];\n"));
        emit_shared_geometry(p, ss, axes);
        ss.push_str("int_tp i;\n");
        ss.push_str(&p.kernel_loop("int_tp", "index", "n"));
        ss.push_str("int_tp channel_in = index;\n");
        ss.push_str("int_tp channel_out = 1;\n");
        ss.push_str(&format!("for (i = {axes} - 1; i >= 0; --i) {{\n"));
        ss.push_str("d_temp[i] = channel_in % shared_col_shape[i + 1];\n");
        ss.push_str("channel_in /= shared_col_shape[i + 1];\n");
        ss.push_str("channel_out *= shared_kernel_shape[i];\n");
        ss.push_str("}\n");
        ss.push_str("channel_out *= channel_in;\n");
        ss.push_str("int_tp data_col_inc = 1;\n");
        ss.push_str(&format!("for (i = 0; i < {axes}; ++i) {{\n"));
        ss.push_str("channel_out *= shared_col_shape[i + 1];\n");
        ss.push_str("channel_out += d_temp[i];\n");
        ss.push_str("d_temp[i] = d_temp[i] * shared_stride[i] - shared_pad[i];\n");
        ss.push_str("channel_in *= shared_im_shape[i + 1];\n");
        ss.push_str("channel_in += d_temp[i];\n");
        ss.push_str("data_col_inc *= shared_col_shape[i + 1];\n");
        ss.push_str("d_iter[i] = 0;\n");
        ss.push_str("}\n");
        ss.push_str(&format!(
            "{} = data_col + channel_out;\n",
            p.global_ptr("Dtype", "data_col_ptr")
        ));
        ss.push_str(&format!(
            "{} = data_im + channel_in;\n",
            p.global_ptr("const Dtype", "data_im_ptr")
        ));
        ss.push_str("bool incremented;\n");
        ss.push_str("do {\n");
        ss.push_str("bool in_range = true;\n");
        ss.push_str(&format!("for (i = 0; i < {axes}; ++i) {{\n"));
        ss.push_str("const int_tp d_iter_im = d_iter[i] * shared_dilation[i] + d_temp[i];\n");
        ss.push_str("in_range &= d_iter_im >= 0 && d_iter_im < shared_im_shape[i + 1];\n");
        ss.push_str("if (!in_range) { break; }\n");
        ss.push_str("}\n");
        ss.push_str("if (in_range) {\n");
        ss.push_str("int_tp data_im_offset = d_iter[0] * shared_dilation[0];\n");
        ss.push_str(&format!("for (i = 1; i < {axes}; ++i) {{\n"));
        ss.push_str("data_im_offset *= shared_im_shape[i + 1];\n");
        ss.push_str("data_im_offset += d_iter[i] * shared_dilation[i];\n");
        ss.push_str("}\n");
        ss.push_str("*data_col_ptr = data_im_ptr[data_im_offset];\n");
        ss.push_str("} else {\n");
        ss.push_str("*data_col_ptr = (Dtype)0;\n");
        ss.push_str("}\n");
        ss.push_str("data_col_ptr += data_col_inc;\n");
        ss.push_str("incremented = false;\n");
        ss.push_str(&format!("for (i = {axes} - 1; i >= 0; --i) {{\n"));
        ss.push_str("const int_tp d_max = shared_kernel_shape[i];\n");
        ss.push_str("if (d_iter[i] == d_max - 1) {\n");
        ss.push_str("d_iter[i] = 0;\n");
        ss.push_str("} else {\n");
        ss.push_str("++d_iter[i];\n");
        ss.push_str("incremented = true;\n");
        ss.push_str("break;\n");
        ss.push_str("}\n");
        ss.push_str("}\n");
        ss.push_str("} while (incremented);\n");
        ss.push_str("}\n}\n");
    }

    // Backward.
    ss.push_str(&p.function(&format!("col2im_nd_{axes}"), nd_args("data_col", "data_im")));
    if axes == 0 {
        ss.push_str(&p.kernel_loop("int_tp", "index", "n"));
        ss.push_str("data_im[index] = data_col[index];\n}\n}\n");
        return;
    }
    ss.push_str(&format!("int_tp d_im[{arr}];\n"));
    ss.push_str(&format!("int_tp d_col_iter[{arr}];\n"));
    ss.push_str(&format!("int_tp d_col_start[{arr}];\n"));
    ss.push_str(&format!("int_tp d_col_end[{arr}];\n"));
    emit_shared_geometry(p, ss, axes);
    ss.push_str(&p.kernel_loop("int_tp", "index", "n"));
    ss.push_str("int_tp c_im = index;\n");
    ss.push_str(&format!("for (int_tp i = {axes} - 1; i >= 0; --i) {{\n"));
    ss.push_str("d_im[i] = c_im % shared_im_shape[i + 1] + shared_pad[i];\n");
    ss.push_str("c_im /= shared_im_shape[i + 1];\n");
    ss.push_str("}\n");
    // Empty column range along any axis means nothing contributes.
    ss.push_str("bool done = false;\n");
    ss.push_str(&format!("for (int_tp i = 0; i < {axes}; ++i) {{\n"));
    ss.push_str(
        "const int_tp kernel_extent = shared_dilation[i] * (shared_kernel_shape[i] - 1) + 1;\n",
    );
    ss.push_str(
        "d_col_start[i] = d_col_iter[i] = (d_im[i] < kernel_extent) ? 0 : \
         (d_im[i] - kernel_extent) / shared_stride[i] + 1;\n",
    );
    ss.push_str(
        "d_col_end[i] = min(d_im[i] / shared_stride[i] + 1, shared_col_shape[i + 1]);\n",
    );
    ss.push_str("if (d_col_start[i] >= d_col_end[i]) {\n");
    ss.push_str("data_im[index] = (Dtype)0;\n");
    ss.push_str("done = true;\n");
    ss.push_str("break;\n");
    ss.push_str("}\n");
    ss.push_str("}\n");
    ss.push_str("if (done) {\n");
    ss.push_str("continue;\n");
    ss.push_str("}\n");
    ss.push_str("Dtype val = (Dtype)0;\n");
    ss.push_str("bool incremented = true;\n");
    ss.push_str("bool skip = false;\n");
    ss.push_str("do {\n");
    ss.push_str("int_tp final_offset = 0;\n");
    ss.push_str("int_tp kernel_shape_prod = 1;\n");
    ss.push_str("int_tp kernel_index;\n");
    ss.push_str(&format!("for (int_tp i = {axes} - 1; i >= 0; --i) {{\n"));
    ss.push_str("kernel_index = d_im[i] - d_col_iter[i] * shared_stride[i];\n");
    // Dilation-misaligned taps legitimately contribute nothing.
    ss.push_str("if (kernel_index % shared_dilation[i]) {\n");
    ss.push_str("skip = true;\n");
    ss.push_str("break;\n");
    ss.push_str("} else {\n");
    ss.push_str("kernel_index /= shared_dilation[i];\n");
    ss.push_str("final_offset += kernel_index * kernel_shape_prod;\n");
    ss.push_str("kernel_shape_prod *= shared_kernel_shape[i];\n");
    ss.push_str("}\n");
    ss.push_str("}\n");
    ss.push_str("if (!skip) {\n");
    ss.push_str("final_offset += kernel_shape_prod * c_im;\n");
    ss.push_str(&format!("for (int_tp i = 0; i < {axes}; ++i) {{\n"));
    ss.push_str("final_offset *= shared_col_shape[i + 1];\n");
    ss.push_str("final_offset += d_col_iter[i];\n");
    ss.push_str("}\n");
    ss.push_str("val += data_col[final_offset];\n");
    ss.push_str("}\n");
    ss.push_str("skip = false;\n");
    ss.push_str("incremented = false;\n");
    ss.push_str(&format!("for (int_tp i = {axes} - 1; i >= 0; --i) {{\n"));
    ss.push_str("const int_tp d_max = d_col_end[i];\n");
    ss.push_str("if (d_col_iter[i] == d_max - 1) {\n");
    ss.push_str("d_col_iter[i] = d_col_start[i];\n");
    ss.push_str("} else {\n");
    ss.push_str("++d_col_iter[i];\n");
    ss.push_str("incremented = true;\n");
    ss.push_str("break;\n");
    ss.push_str("}\n");
    ss.push_str("}\n");
    ss.push_str("} while (incremented);\n");
    ss.push_str("data_im[index] = val;\n");
    ss.push_str("}\n}\n");
}

/// Generate the full im2col kernel family for `kind` into `p`.
pub fn generate_im2col_source(p: &mut DeviceProgram, kind: ElemKind) -> String {
    let mut ss = String::new();
    ss.push_str(&p.setup());
    ss.push_str(&p.define_dtype(kind));
    generate_im2col_2d(p, &mut ss);
    for axes in 0..MAX_SPATIAL_AXES {
        generate_im2col_nd(p, &mut ss, axes);
    }
    ss
}

pub(crate) fn build_im2col_program(dev: &Device, kind: ElemKind) -> Result<DeviceProgram> {
    let mut p = dev.create_program(&format!("karst_im2col_{kind}"))?;
    let src = generate_im2col_source(&mut p, kind);
    p.set_source(src);
    p.compile(true, true)?;
    Ok(p)
}

// ---------------------------------------------------------------------------
// Dispatch
// ---------------------------------------------------------------------------

impl Device {
    /// Scatter image windows into the column buffer (2D geometry).
    #[allow(clippy::too_many_arguments)]
    pub fn im2col<T: Numeric>(
        &self,
        data_im: &VPtr<T>,
        channels: i32,
        height: i32,
        width: i32,
        kernel_h: i32,
        kernel_w: i32,
        pad_h: i32,
        pad_w: i32,
        stride_h: i32,
        stride_w: i32,
        dilation_h: i32,
        dilation_w: i32,
        data_col: &VPtr<T>,
    ) -> Result<()> {
        self.check_half::<T>("im2col")?;
        let height_col = conv_out_size(height, kernel_h, pad_h, stride_h, dilation_h);
        let width_col = conv_out_size(width, kernel_w, pad_w, stride_w, dilation_w);
        // One work item per column element of one kernel tap row.
        let num_kernels = (channels * height_col * width_col) as usize;
        match &self.backend {
            BackendImpl::Cpu(_) => {
                let im = unsafe { data_im.host_slice((channels * height * width) as usize)? };
                let col_len = (channels * kernel_h * kernel_w * height_col * width_col) as usize;
                let col = unsafe { data_col.host_slice_mut(col_len)? };
                host_im2col::im2col(
                    im, channels, height, width, kernel_h, kernel_w, pad_h, pad_w, stride_h,
                    stride_w, dilation_h, dilation_w, col,
                );
                Ok(())
            }
            #[allow(unreachable_patterns)]
            _ => {
                let program = self.im2col_program(T::KIND)?;
                let mut k = program.get_kernel("im2col")?;
                k.add_arg(num_kernels as i32)
                    .add_arg(data_im)
                    .add_arg(height)
                    .add_arg(width)
                    .add_arg(kernel_h)
                    .add_arg(kernel_w)
                    .add_arg(pad_h)
                    .add_arg(pad_w)
                    .add_arg(stride_h)
                    .add_arg(stride_w)
                    .add_arg(dilation_h)
                    .add_arg(dilation_w)
                    .add_arg(height_col)
                    .add_arg(width_col)
                    .add_arg(data_col);
                let mut group = Vec::new();
                let mut local = Vec::new();
                self.get_threads(&[num_kernels], &mut group, &mut local, true);
                k.execute(&group, &local, self.current_queue_id())
            }
        }
    }

    /// Accumulate the column buffer back into the image (2D geometry),
    /// the adjoint of [`Device::im2col`]. One work item per image
    /// element adds up its overlapping windows, avoiding atomics.
    #[allow(clippy::too_many_arguments)]
    pub fn col2im<T: Numeric>(
        &self,
        data_col: &VPtr<T>,
        channels: i32,
        height: i32,
        width: i32,
        kernel_h: i32,
        kernel_w: i32,
        pad_h: i32,
        pad_w: i32,
        stride_h: i32,
        stride_w: i32,
        dilation_h: i32,
        dilation_w: i32,
        data_im: &VPtr<T>,
    ) -> Result<()> {
        self.check_half::<T>("col2im")?;
        let height_col = conv_out_size(height, kernel_h, pad_h, stride_h, dilation_h);
        let width_col = conv_out_size(width, kernel_w, pad_w, stride_w, dilation_w);
        let num_kernels = (channels * height * width) as usize;
        match &self.backend {
            BackendImpl::Cpu(_) => {
                let col_len = (channels * kernel_h * kernel_w * height_col * width_col) as usize;
                let col = unsafe { data_col.host_slice(col_len)? };
                let im = unsafe { data_im.host_slice_mut(num_kernels)? };
                host_im2col::col2im(
                    col, channels, height, width, kernel_h, kernel_w, pad_h, pad_w, stride_h,
                    stride_w, dilation_h, dilation_w, im,
                );
                Ok(())
            }
            #[allow(unreachable_patterns)]
            _ => {
                let program = self.im2col_program(T::KIND)?;
                let mut k = program.get_kernel("col2im")?;
                k.add_arg(num_kernels as i32)
                    .add_arg(data_col)
                    .add_arg(height)
                    .add_arg(width)
                    .add_arg(channels)
                    .add_arg(kernel_h)
                    .add_arg(kernel_w)
                    .add_arg(pad_h)
                    .add_arg(pad_w)
                    .add_arg(stride_h)
                    .add_arg(stride_w)
                    .add_arg(dilation_h)
                    .add_arg(dilation_w)
                    .add_arg(height_col)
                    .add_arg(width_col)
                    .add_arg(data_im);
                let mut group = Vec::new();
                let mut local = Vec::new();
                self.get_threads(&[num_kernels], &mut group, &mut local, true);
                k.execute(&group, &local, self.current_queue_id())
            }
        }
    }

    /// N-D im2col. `im_shape`/`col_shape` carry a leading channel
    /// dimension; `num_kernels` is the work-item count
    /// (channels × column spatial extent).
    #[allow(clippy::too_many_arguments)]
    pub fn im2col_nd<T: Numeric>(
        &self,
        data_im: &VPtr<T>,
        num_spatial_axes: usize,
        num_kernels: usize,
        im_shape: &VPtr<i32>,
        col_shape: &VPtr<i32>,
        kernel_shape: &VPtr<i32>,
        pad: &VPtr<i32>,
        stride: &VPtr<i32>,
        dilation: &VPtr<i32>,
        data_col: &VPtr<T>,
    ) -> Result<()> {
        self.check_half::<T>("im2col_nd")?;
        if num_spatial_axes >= MAX_SPATIAL_AXES {
            return Err(Error::InvalidShape(format!(
                "im2col_nd supports ranks below {MAX_SPATIAL_AXES}, got {num_spatial_axes}"
            )));
        }
        match &self.backend {
            BackendImpl::Cpu(_) => {
                let axes = num_spatial_axes;
                let ims = unsafe { im_shape.host_slice(axes + 1)? };
                let cols = unsafe { col_shape.host_slice(axes + 1)? };
                let ks = unsafe { kernel_shape.host_slice(axes)? };
                let ps = unsafe { pad.host_slice(axes)? };
                let st = unsafe { stride.host_slice(axes)? };
                let di = unsafe { dilation.host_slice(axes)? };
                let im_len: i64 = ims.iter().map(|&d| d as i64).product();
                let col_len: i64 = cols.iter().map(|&d| d as i64).product();
                let im = unsafe { data_im.host_slice(im_len as usize)? };
                let col = unsafe { data_col.host_slice_mut(col_len as usize)? };
                host_im2col::im2col_nd(im, axes, ims, cols, ks, ps, st, di, col);
                Ok(())
            }
            #[allow(unreachable_patterns)]
            _ => {
                let program = self.im2col_program(T::KIND)?;
                let mut k = program.get_kernel(&format!("im2col_nd_{num_spatial_axes}"))?;
                k.add_arg(num_kernels as i32)
                    .add_arg(data_im)
                    .add_arg(im_shape)
                    .add_arg(col_shape)
                    .add_arg(kernel_shape)
                    .add_arg(pad)
                    .add_arg(stride)
                    .add_arg(dilation)
                    .add_arg(data_col);
                let mut group = Vec::new();
                let mut local = Vec::new();
                self.get_threads(&[num_kernels], &mut group, &mut local, true);
                k.execute(&group, &local, self.current_queue_id())
            }
        }
    }

    /// N-D col2im, the adjoint of [`Device::im2col_nd`]. `im_size` is
    /// the total image element count (work-item count).
    #[allow(clippy::too_many_arguments)]
    pub fn col2im_nd<T: Numeric>(
        &self,
        data_col: &VPtr<T>,
        num_spatial_axes: usize,
        im_size: usize,
        im_shape: &VPtr<i32>,
        col_shape: &VPtr<i32>,
        kernel_shape: &VPtr<i32>,
        pad: &VPtr<i32>,
        stride: &VPtr<i32>,
        dilation: &VPtr<i32>,
        data_im: &VPtr<T>,
    ) -> Result<()> {
        self.check_half::<T>("col2im_nd")?;
        if num_spatial_axes >= MAX_SPATIAL_AXES {
            return Err(Error::InvalidShape(format!(
                "col2im_nd supports ranks below {MAX_SPATIAL_AXES}, got {num_spatial_axes}"
            )));
        }
        match &self.backend {
            BackendImpl::Cpu(_) => {
                let axes = num_spatial_axes;
                let ims = unsafe { im_shape.host_slice(axes + 1)? };
                let cols = unsafe { col_shape.host_slice(axes + 1)? };
                let ks = unsafe { kernel_shape.host_slice(axes)? };
                let ps = unsafe { pad.host_slice(axes)? };
                let st = unsafe { stride.host_slice(axes)? };
                let di = unsafe { dilation.host_slice(axes)? };
                let col_len: i64 = cols.iter().map(|&d| d as i64).product();
                let col = unsafe { data_col.host_slice(col_len as usize)? };
                let im = unsafe { data_im.host_slice_mut(im_size)? };
                host_im2col::col2im_nd(col, axes, ims, cols, ks, ps, st, di, im);
                Ok(())
            }
            #[allow(unreachable_patterns)]
            _ => {
                let program = self.im2col_program(T::KIND)?;
                let mut k = program.get_kernel(&format!("col2im_nd_{num_spatial_axes}"))?;
                k.add_arg(im_size as i32)
                    .add_arg(data_col)
                    .add_arg(im_shape)
                    .add_arg(col_shape)
                    .add_arg(kernel_shape)
                    .add_arg(pad)
                    .add_arg(stride)
                    .add_arg(dilation)
                    .add_arg(data_im);
                let mut group = Vec::new();
                let mut local = Vec::new();
                self.get_threads(&[im_size], &mut group, &mut local, true);
                k.execute(&group, &local, self.current_queue_id())
            }
        }
    }
}
