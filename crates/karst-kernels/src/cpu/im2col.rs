//! Host im2col / col2im: convolution-window extraction and its adjoint
//! accumulation, for the fixed-rank 2D case and the general N-D case.
//!
//! The N-D variants walk the kernel footprint with a bounded odometer
//! (`d_iter`), mirroring the generated device kernels so host and device
//! agree bit-for-bit on layout.

use crate::real::Real;

/// Output spatial extent of one convolved axis.
pub fn conv_out_size(size: i32, kernel: i32, pad: i32, stride: i32, dilation: i32) -> i32 {
    (size + 2 * pad - (dilation * (kernel - 1) + 1)) / stride + 1
}

#[inline]
fn in_range(a: i32, b: i32) -> bool {
    a >= 0 && a < b
}

/// Scatter image windows into the column buffer.
///
/// `data_col` is laid out `[channels * kernel_h * kernel_w, height_col,
/// width_col]`; out-of-range taps read as zero.
#[allow(clippy::too_many_arguments)]
pub fn im2col<T: Real>(
    data_im: &[T],
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
    data_col: &mut [T],
) {
    let height_col = conv_out_size(height, kernel_h, pad_h, stride_h, dilation_h);
    let width_col = conv_out_size(width, kernel_w, pad_w, stride_w, dilation_w);
    let channel_size = (height * width) as usize;

    let mut col_idx = 0usize;
    for c in 0..channels {
        let im = &data_im[c as usize * channel_size..(c + 1) as usize * channel_size];
        for kr in 0..kernel_h {
            for kc in 0..kernel_w {
                let mut input_row = -pad_h + kr * dilation_h;
                for _ in 0..height_col {
                    if !in_range(input_row, height) {
                        for _ in 0..width_col {
                            data_col[col_idx] = T::ZERO;
                            col_idx += 1;
                        }
                    } else {
                        let mut input_col = -pad_w + kc * dilation_w;
                        for _ in 0..width_col {
                            data_col[col_idx] = if in_range(input_col, width) {
                                im[(input_row * width + input_col) as usize]
                            } else {
                                T::ZERO
                            };
                            col_idx += 1;
                            input_col += stride_w;
                        }
                    }
                    input_row += stride_h;
                }
            }
        }
    }
}

/// Gather the column buffer back into the image, accumulating
/// overlapping windows. The adjoint of [`im2col`].
#[allow(clippy::too_many_arguments)]
pub fn col2im<T: Real>(
    data_col: &[T],
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
    data_im: &mut [T],
) {
    let height_col = conv_out_size(height, kernel_h, pad_h, stride_h, dilation_h);
    let width_col = conv_out_size(width, kernel_w, pad_w, stride_w, dilation_w);
    let channel_size = (height * width) as usize;

    for v in data_im.iter_mut() {
        *v = T::ZERO;
    }

    let mut col_idx = 0usize;
    for c in 0..channels {
        let base = c as usize * channel_size;
        for kr in 0..kernel_h {
            for kc in 0..kernel_w {
                let mut input_row = -pad_h + kr * dilation_h;
                for _ in 0..height_col {
                    if !in_range(input_row, height) {
                        col_idx += width_col as usize;
                    } else {
                        let mut input_col = -pad_w + kc * dilation_w;
                        for _ in 0..width_col {
                            if in_range(input_col, width) {
                                let v = data_col[col_idx];
                                data_im[base + (input_row * width + input_col) as usize] += v;
                            }
                            col_idx += 1;
                            input_col += stride_w;
                        }
                    }
                    input_row += stride_h;
                }
            }
        }
    }
}

/// N-D im2col over `num_spatial_axes` spatial dimensions.
///
/// `im_shape` and `col_shape` carry a leading channel dimension
/// (`num_spatial_axes + 1` entries); `kernel_shape`, `pad`, `stride`,
/// `dilation` have `num_spatial_axes` entries.
#[allow(clippy::too_many_arguments)]
pub fn im2col_nd<T: Real>(
    data_im: &[T],
    num_spatial_axes: usize,
    im_shape: &[i32],
    col_shape: &[i32],
    kernel_shape: &[i32],
    pad: &[i32],
    stride: &[i32],
    dilation: &[i32],
    data_col: &mut [T],
) {
    let axes = num_spatial_axes;
    let col_spatial: i64 = col_shape[1..=axes].iter().map(|&d| d as i64).product();
    let n = im_shape[0] as i64 * col_spatial;

    let mut d_temp = vec![0i32; axes];
    let mut d_iter = vec![0i32; axes];

    for index in 0..n {
        // Decompose the flat index into spatial column coordinates plus
        // the input channel, accumulating the column-channel index.
        let mut channel_in = index;
        let mut channel_out: i64 = 1;
        for i in (0..axes).rev() {
            d_temp[i] = (channel_in % col_shape[i + 1] as i64) as i32;
            channel_in /= col_shape[i + 1] as i64;
            channel_out *= kernel_shape[i] as i64;
        }
        channel_out *= channel_in;

        let mut data_col_inc: i64 = 1;
        for i in 0..axes {
            channel_out *= col_shape[i + 1] as i64;
            channel_out += d_temp[i] as i64;
            d_temp[i] = d_temp[i] * stride[i] - pad[i];
            channel_in *= im_shape[i + 1] as i64;
            channel_in += d_temp[i] as i64;
            data_col_inc *= col_shape[i + 1] as i64;
            d_iter[i] = 0;
        }

        let mut col_off = channel_out;
        // Odometer over the kernel footprint.
        loop {
            let mut in_bounds = true;
            for i in 0..axes {
                let d_iter_im = d_iter[i] * dilation[i] + d_temp[i];
                if !in_range(d_iter_im, im_shape[i + 1]) {
                    in_bounds = false;
                    break;
                }
            }
            if in_bounds {
                let mut im_offset = (d_iter[0] * dilation[0]) as i64;
                for i in 1..axes {
                    im_offset *= im_shape[i + 1] as i64;
                    im_offset += (d_iter[i] * dilation[i]) as i64;
                }
                data_col[col_off as usize] = data_im[(channel_in + im_offset) as usize];
            } else {
                data_col[col_off as usize] = T::ZERO;
            }
            col_off += data_col_inc;

            let mut incremented = false;
            for i in (0..axes).rev() {
                if d_iter[i] == kernel_shape[i] - 1 {
                    d_iter[i] = 0;
                } else {
                    d_iter[i] += 1;
                    incremented = true;
                    break;
                }
            }
            if !incremented {
                break;
            }
        }
    }
}

/// N-D col2im: adjoint accumulation of [`im2col_nd`].
///
/// Rejects out-of-range work early (writes zero) before the inverse
/// offset walk; dilation-misaligned kernel taps are skipped by the
/// `kernel_index % dilation == 0` test.
#[allow(clippy::too_many_arguments)]
pub fn col2im_nd<T: Real>(
    data_col: &[T],
    num_spatial_axes: usize,
    im_shape: &[i32],
    col_shape: &[i32],
    kernel_shape: &[i32],
    pad: &[i32],
    stride: &[i32],
    dilation: &[i32],
    data_im: &mut [T],
) {
    let axes = num_spatial_axes;
    let im_size: i64 = im_shape[..=axes].iter().map(|&d| d as i64).product();

    let mut d_im = vec![0i32; axes];
    let mut d_col_iter = vec![0i32; axes];
    let mut d_col_start = vec![0i32; axes];
    let mut d_col_end = vec![0i32; axes];

    for index in 0..im_size {
        let mut c_im = index;
        for i in (0..axes).rev() {
            d_im[i] = (c_im % im_shape[i + 1] as i64) as i32 + pad[i];
            c_im /= im_shape[i + 1] as i64;
        }

        let mut empty = false;
        for i in 0..axes {
            let kernel_extent = dilation[i] * (kernel_shape[i] - 1) + 1;
            d_col_start[i] = if d_im[i] < kernel_extent {
                0
            } else {
                (d_im[i] - kernel_extent) / stride[i] + 1
            };
            d_col_iter[i] = d_col_start[i];
            d_col_end[i] = (d_im[i] / stride[i] + 1).min(col_shape[i + 1]);
            if d_col_start[i] >= d_col_end[i] {
                empty = true;
                break;
            }
        }
        if empty {
            data_im[index as usize] = T::ZERO;
            continue;
        }

        let mut val = T::ZERO;
        loop {
            let mut skip = false;
            let mut final_offset: i64 = 0;
            let mut kernel_shape_prod: i64 = 1;
            for i in (0..axes).rev() {
                let mut kernel_index = d_im[i] - d_col_iter[i] * stride[i];
                if kernel_index % dilation[i] != 0 {
                    skip = true;
                    break;
                }
                kernel_index /= dilation[i];
                final_offset += kernel_index as i64 * kernel_shape_prod;
                kernel_shape_prod *= kernel_shape[i] as i64;
            }
            if !skip {
                final_offset += kernel_shape_prod * c_im;
                for i in 0..axes {
                    final_offset *= col_shape[i + 1] as i64;
                    final_offset += d_col_iter[i] as i64;
                }
                val += data_col[final_offset as usize];
            }

            let mut incremented = false;
            for i in (0..axes).rev() {
                if d_col_iter[i] == d_col_end[i] - 1 {
                    d_col_iter[i] = d_col_start[i];
                } else {
                    d_col_iter[i] += 1;
                    incremented = true;
                    break;
                }
            }
            if !incremented {
                break;
            }
        }
        data_im[index as usize] = val;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn col_len(channels: i32, h: i32, w: i32, kh: i32, kw: i32, p: i32, s: i32, d: i32) -> usize {
        let hc = conv_out_size(h, kh, p, s, d);
        let wc = conv_out_size(w, kw, p, s, d);
        (channels * kh * kw * hc * wc) as usize
    }

    #[test]
    fn test_out_size() {
        assert_eq!(conv_out_size(4, 3, 1, 1, 1), 4);
        assert_eq!(conv_out_size(5, 3, 0, 2, 1), 2);
        assert_eq!(conv_out_size(5, 3, 0, 1, 2), 1);
    }

    #[test]
    fn test_im2col_1x1_kernel_is_identity() {
        let im: Vec<f32> = (0..12).map(|v| v as f32).collect();
        let mut col = vec![0.0f32; col_len(1, 3, 4, 1, 1, 0, 1, 1)];
        im2col(&im, 1, 3, 4, 1, 1, 0, 0, 1, 1, 1, 1, &mut col);
        assert_eq!(col, im);
    }

    #[test]
    fn test_im2col_col2im_adjoint_counts() {
        // 4x4 input, 3x3 kernel, stride 1, pad 1, dilation 1: every
        // element is reproduced scaled by its window multiplicity.
        let h = 4;
        let w = 4;
        let im: Vec<f32> = (1..=16).map(|v| v as f32).collect();
        let mut col = vec![0.0f32; col_len(1, h, w, 3, 3, 1, 1, 1)];
        im2col(&im, 1, h, w, 3, 3, 1, 1, 1, 1, 1, 1, &mut col);

        let mut back = vec![0.0f32; (h * w) as usize];
        col2im(&col, 1, h, w, 3, 3, 1, 1, 1, 1, 1, 1, &mut back);

        let ones = vec![1.0f32; (h * w) as usize];
        let mut col_ones = vec![0.0f32; col.len()];
        im2col(&ones, 1, h, w, 3, 3, 1, 1, 1, 1, 1, 1, &mut col_ones);
        let mut counts = vec![0.0f32; (h * w) as usize];
        col2im(&col_ones, 1, h, w, 3, 3, 1, 1, 1, 1, 1, 1, &mut counts);

        for i in 0..(h * w) as usize {
            assert_eq!(back[i], im[i] * counts[i], "element {i}");
        }
        // Interior elements of a 4x4 with 3x3/s1/p1 are covered 9 times,
        // corners 4 times.
        assert_eq!(counts[0], 4.0);
        assert_eq!(counts[5], 9.0);
    }

    #[test]
    fn test_nd_matches_2d_for_rank_two() {
        let h = 4;
        let w = 5;
        let channels = 2;
        let im: Vec<f32> = (0..channels * h * w).map(|v| v as f32 * 0.5).collect();

        let mut col_2d = vec![0.0f32; col_len(channels as i32, h as i32, w as i32, 3, 2, 1, 1, 1)];
        im2col(
            &im,
            channels as i32,
            h as i32,
            w as i32,
            3,
            2,
            1,
            1,
            1,
            1,
            1,
            1,
            &mut col_2d,
        );

        let hc = conv_out_size(h as i32, 3, 1, 1, 1);
        let wc = conv_out_size(w as i32, 2, 1, 1, 1);
        let im_shape = [channels as i32, h as i32, w as i32];
        let col_shape = [channels as i32 * 3 * 2, hc, wc];
        let mut col_nd = vec![0.0f32; col_2d.len()];
        im2col_nd(
            &im,
            2,
            &im_shape,
            &col_shape,
            &[3, 2],
            &[1, 1],
            &[1, 1],
            &[1, 1],
            &mut col_nd,
        );
        assert_eq!(col_2d, col_nd);

        let mut back_2d = vec![0.0f32; im.len()];
        col2im(
            &col_2d,
            channels as i32,
            h as i32,
            w as i32,
            3,
            2,
            1,
            1,
            1,
            1,
            1,
            1,
            &mut back_2d,
        );
        let mut back_nd = vec![0.0f32; im.len()];
        col2im_nd(
            &col_nd,
            2,
            &im_shape,
            &col_shape,
            &[3, 2],
            &[1, 1],
            &[1, 1],
            &[1, 1],
            &mut back_nd,
        );
        assert_eq!(back_2d, back_nd);
    }

    #[test]
    fn test_dilation_skips_misaligned_taps() {
        // 1 channel, 5 wide, kernel 3, dilation 2: effective extent 5.
        let im: Vec<f32> = vec![1.0, 2.0, 3.0, 4.0, 5.0];
        let im_shape = [1, 5];
        let wc = conv_out_size(5, 3, 0, 1, 2);
        assert_eq!(wc, 1);
        let col_shape = [3, wc];
        let mut col = vec![0.0f32; 3];
        im2col_nd(
            &im,
            1,
            &im_shape,
            &col_shape,
            &[3],
            &[0],
            &[1],
            &[2],
            &mut col,
        );
        assert_eq!(col, vec![1.0, 3.0, 5.0]);

        let mut back = vec![0.0f32; 5];
        col2im_nd(
            &col,
            1,
            &im_shape,
            &col_shape,
            &[3],
            &[0],
            &[1],
            &[2],
            &mut back,
        );
        // Positions 1 and 3 are never touched by a dilated tap.
        assert_eq!(back, vec![1.0, 0.0, 3.0, 0.0, 5.0]);
    }
}
