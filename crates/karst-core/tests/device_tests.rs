//! Dispatch-layer tests on the host device: numeric primitives, memory
//! accounting, pointer views, convolution primitives, fail-fast
//! behavior.

use std::sync::Arc;

use karst_core::{Blob, Device, Error, Transpose, VPtr};

fn assert_close(a: &[f32], b: &[f32], tol: f32) {
    assert_eq!(a.len(), b.len(), "length mismatch: {} vs {}", a.len(), b.len());
    for (i, (x, y)) in a.iter().zip(b.iter()).enumerate() {
        assert!(
            (x - y).abs() < tol,
            "element {} differs: {} vs {} (tol={})",
            i,
            x,
            y,
            tol
        );
    }
}

/// A device-resident vector initialized from host values.
fn device_vec(dev: &Arc<Device>, values: &[f32]) -> VPtr<f32> {
    let handle = dev
        .malloc_device(values.len() * std::mem::size_of::<f32>())
        .unwrap();
    let ptr: VPtr<f32> = VPtr::new(handle);
    dev.copy_from_host(values.len(), values, &ptr).unwrap();
    ptr
}

fn read_back(dev: &Arc<Device>, ptr: &VPtr<f32>, n: usize) -> Vec<f32> {
    let mut out = vec![0.0f32; n];
    dev.copy_to_host(n, ptr, &mut out).unwrap();
    out
}

// ============================================================================
// Scalar reductions and BLAS-like primitives
// ============================================================================

#[test]
fn test_dot_known_vector() {
    let dev = Device::cpu();
    let x = device_vec(&dev, &[1.0, 2.0, 3.0, 4.0]);
    assert_eq!(dev.dot(4, &x, &x).unwrap(), 30.0);
}

#[test]
fn test_asum_mixed_signs() {
    let dev = Device::cpu();
    let x = device_vec(&dev, &[-1.0, 2.0, -3.0, 4.0]);
    assert_eq!(dev.asum(4, &x).unwrap(), 10.0);
}

#[test]
fn test_scale_by_two() {
    let dev = Device::cpu();
    let x = device_vec(&dev, &[1.0, 2.0, 3.0, 4.0]);
    let y = device_vec(&dev, &[0.0; 4]);
    dev.scale(4, 2.0, &x, &y).unwrap();
    assert_eq!(read_back(&dev, &y, 4), vec![2.0, 4.0, 6.0, 8.0]);
}

#[test]
fn test_axpy_axpby() {
    let dev = Device::cpu();
    let x = device_vec(&dev, &[1.0, 1.0, 1.0]);
    let y = device_vec(&dev, &[1.0, 2.0, 3.0]);
    dev.axpy(3, 2.0, &x, &y).unwrap();
    assert_eq!(read_back(&dev, &y, 3), vec![3.0, 4.0, 5.0]);
    dev.axpby(3, 1.0, &x, 0.5, &y).unwrap();
    assert_eq!(read_back(&dev, &y, 3), vec![2.5, 3.0, 3.5]);
}

#[test]
fn test_set_and_add_scalar() {
    let dev = Device::cpu();
    let x = device_vec(&dev, &[0.0; 5]);
    dev.set(5, 3.0f32, &x).unwrap();
    assert_eq!(read_back(&dev, &x, 5), vec![3.0; 5]);
    dev.add_scalar(5, -1.0, &x).unwrap();
    assert_eq!(read_back(&dev, &x, 5), vec![2.0; 5]);
}

#[test]
fn test_elementwise_binary_ops() {
    let dev = Device::cpu();
    let a = device_vec(&dev, &[4.0, 9.0, 16.0]);
    let b = device_vec(&dev, &[2.0, 3.0, 4.0]);
    let y = device_vec(&dev, &[0.0; 3]);
    dev.add(3, &a, &b, &y).unwrap();
    assert_eq!(read_back(&dev, &y, 3), vec![6.0, 12.0, 20.0]);
    dev.sub(3, &a, &b, &y).unwrap();
    assert_eq!(read_back(&dev, &y, 3), vec![2.0, 6.0, 12.0]);
    dev.mul(3, &a, &b, &y).unwrap();
    assert_eq!(read_back(&dev, &y, 3), vec![8.0, 27.0, 64.0]);
    dev.div(3, &a, &b, &y).unwrap();
    assert_eq!(read_back(&dev, &y, 3), vec![2.0, 3.0, 4.0]);
}

#[test]
fn test_elementwise_unary_ops() {
    let dev = Device::cpu();
    let a = device_vec(&dev, &[-4.0, 0.0, 9.0]);
    let y = device_vec(&dev, &[0.0; 3]);
    dev.abs(3, &a, &y).unwrap();
    assert_eq!(read_back(&dev, &y, 3), vec![4.0, 0.0, 9.0]);
    dev.sign(3, &a, &y).unwrap();
    assert_eq!(read_back(&dev, &y, 3), vec![-1.0, 0.0, 1.0]);
    dev.sgnbit(3, &a, &y).unwrap();
    assert_eq!(read_back(&dev, &y, 3), vec![1.0, 0.0, 0.0]);

    let sq = device_vec(&dev, &[4.0, 9.0, 16.0]);
    dev.sqrt(3, &sq, &y).unwrap();
    assert_eq!(read_back(&dev, &y, 3), vec![2.0, 3.0, 4.0]);
    dev.powx(3, &sq, 2.0, &y).unwrap();
    assert_eq!(read_back(&dev, &y, 3), vec![16.0, 81.0, 256.0]);

    let e = device_vec(&dev, &[0.0, 1.0]);
    let ye = device_vec(&dev, &[0.0; 2]);
    dev.exp(2, &e, &ye).unwrap();
    assert_close(&read_back(&dev, &ye, 2), &[1.0, std::f32::consts::E], 1e-5);
    dev.log(2, &ye, &ye).unwrap();
    assert_close(&read_back(&dev, &ye, 2), &[0.0, 1.0], 1e-5);
}

#[test]
fn test_gemm_and_gemv() {
    let dev = Device::cpu();
    // A = [[1,2],[3,4]], B = [[5,6],[7,8]]
    let a = device_vec(&dev, &[1.0, 2.0, 3.0, 4.0]);
    let b = device_vec(&dev, &[5.0, 6.0, 7.0, 8.0]);
    let c = device_vec(&dev, &[0.0; 4]);
    dev.gemm(
        Transpose::NoTrans,
        Transpose::NoTrans,
        2,
        2,
        2,
        1.0,
        &a,
        &b,
        0.0,
        &c,
    )
    .unwrap();
    assert_eq!(read_back(&dev, &c, 4), vec![19.0, 22.0, 43.0, 50.0]);

    let x = device_vec(&dev, &[1.0, 1.0]);
    let y = device_vec(&dev, &[0.0; 2]);
    dev.gemv(Transpose::NoTrans, 2, 2, 1.0, &a, &x, 0.0, &y)
        .unwrap();
    assert_eq!(read_back(&dev, &y, 2), vec![3.0, 7.0]);
    dev.gemv(Transpose::Trans, 2, 2, 1.0, &a, &x, 0.0, &y)
        .unwrap();
    assert_eq!(read_back(&dev, &y, 2), vec![4.0, 6.0]);
}

// ============================================================================
// Pointer views through device ops
// ============================================================================

#[test]
fn test_offset_view_addresses_subrange() {
    let dev = Device::cpu();
    let x = device_vec(&dev, &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
    let tail = x.offset_by(2);
    dev.scal(4, 10.0, &tail).unwrap();
    assert_eq!(
        read_back(&dev, &x, 6),
        vec![1.0, 2.0, 30.0, 40.0, 50.0, 60.0]
    );
}

#[test]
fn test_typed_copy() {
    let dev = Device::cpu();
    let x = device_vec(&dev, &[1.0, 2.0, 3.0]);
    let y = device_vec(&dev, &[0.0; 3]);
    dev.copy(3, &x, &y).unwrap();
    assert_eq!(read_back(&dev, &y, 3), vec![1.0, 2.0, 3.0]);
}

#[test]
fn test_memset() {
    let dev = Device::cpu();
    let x = device_vec(&dev, &[1.0; 2]);
    dev.memset(8, 0, &x.cast()).unwrap();
    assert_eq!(read_back(&dev, &x, 2), vec![0.0, 0.0]);
}

// ============================================================================
// RNG
// ============================================================================

#[test]
fn test_rng_uniform_range() {
    let dev = Device::cpu();
    let r = device_vec(&dev, &[0.0; 512]);
    dev.rng_uniform(512, 1.0f32, 2.0, &r).unwrap();
    let vals = read_back(&dev, &r, 512);
    assert!(vals.iter().all(|&v| v > 1.0 && v <= 2.0));
}

#[test]
fn test_rng_bernoulli_counts() {
    let dev = Device::cpu();
    let handle = dev.malloc_device(256 * 4).unwrap();
    let r: VPtr<i32> = VPtr::new(handle);
    dev.rng_bernoulli(256, 0.5f32, &r).unwrap();
    let mut out = vec![0i32; 256];
    dev.copy_to_host(256, &r, &mut out).unwrap();
    assert!(out.iter().all(|&v| v == 0 || v == 1));
    let ones: i32 = out.iter().sum();
    // 0.5 draws should not collapse to either extreme.
    assert!(ones > 32 && ones < 224, "ones = {ones}");
}

#[test]
fn test_rng_uniform_ints_fill() {
    let dev = Device::cpu();
    let handle = dev.malloc_device(128 * 8).unwrap();
    let r: VPtr<u64> = VPtr::new(handle);
    dev.rng_uniform_u64(128, &r).unwrap();
    let mut out = vec![0u64; 128];
    dev.copy_to_host(128, &r, &mut out).unwrap();
    // Full-range draws are overwhelmingly unlikely to stay all-zero.
    assert!(out.iter().any(|&v| v != 0));
}

// ============================================================================
// Memory accounting
// ============================================================================

#[test]
fn test_memory_accounting_tracks_outstanding_allocations() {
    let dev = Device::cpu();
    assert_eq!(dev.memory_usage(), 0);

    let a = dev.malloc_device(100).unwrap();
    let b = dev.malloc_device(50).unwrap();
    let c = dev.malloc_device(25).unwrap();
    assert_eq!(dev.memory_usage(), 175);
    assert_eq!(dev.peak_memory_usage(), 175);

    dev.free_device(b);
    assert_eq!(dev.memory_usage(), 125);
    assert_eq!(dev.peak_memory_usage(), 175);

    let d = dev.malloc_device(10).unwrap();
    assert_eq!(dev.memory_usage(), 135);
    assert_eq!(dev.peak_memory_usage(), 175);

    dev.free_device(a);
    dev.free_device(c);
    dev.free_device(d);
    assert_eq!(dev.memory_usage(), 0);
    assert_eq!(dev.peak_memory_usage(), 175);

    dev.reset_peak_memory_usage();
    assert_eq!(dev.peak_memory_usage(), 0);
}

#[test]
fn test_peak_tracks_maximum_running_sum() {
    let dev = Device::cpu();
    let a = dev.malloc_device(64).unwrap();
    dev.free_device(a);
    let b = dev.malloc_device(32).unwrap();
    assert_eq!(dev.memory_usage(), 32);
    assert_eq!(dev.peak_memory_usage(), 64);
    dev.free_device(b);
}

// ============================================================================
// im2col / col2im through the Device API
// ============================================================================

#[test]
fn test_im2col_col2im_adjoint_accumulation() {
    // 1x1x4x4 input, 3x3 kernel, stride 1, pad 1, dilation 1: running
    // im2col then col2im reproduces each element scaled by the number
    // of extraction windows that covered it.
    let dev = Device::cpu();
    let im: Vec<f32> = (1..=16).map(|v| v as f32).collect();
    let x = device_vec(&dev, &im);
    let col = device_vec(&dev, &[0.0; 9 * 16]);
    dev.im2col(&x, 1, 4, 4, 3, 3, 1, 1, 1, 1, 1, 1, &col).unwrap();

    let back = device_vec(&dev, &[0.0; 16]);
    dev.col2im(&col, 1, 4, 4, 3, 3, 1, 1, 1, 1, 1, 1, &back)
        .unwrap();

    // Window multiplicity map for 4x4 / 3x3 / s1 / p1.
    let counts = [
        4.0, 6.0, 6.0, 4.0, //
        6.0, 9.0, 9.0, 6.0, //
        6.0, 9.0, 9.0, 6.0, //
        4.0, 6.0, 6.0, 4.0f32,
    ];
    let got = read_back(&dev, &back, 16);
    for i in 0..16 {
        assert_eq!(got[i], im[i] * counts[i], "element {i}");
    }
}

#[test]
fn test_im2col_nd_through_blob_shape_buffer() {
    let dev = Device::cpu();
    let mut im_blob: Blob<f32> = Blob::new(&dev, &[1, 4, 4]).unwrap();
    for (i, v) in im_blob.mutable_cpu_data().unwrap().iter_mut().enumerate() {
        *v = i as f32;
    }

    let shape_vec = |dims: &[i32]| {
        let handle = dev.malloc_device(dims.len() * 4).unwrap();
        let p: VPtr<i32> = VPtr::new(handle);
        dev.copy_from_host(dims.len(), dims, &p).unwrap();
        p
    };

    // The blob carries its own device-resident shape for N-D kernels.
    let im_shape = im_blob.gpu_shape().unwrap();
    let col_shape = shape_vec(&[9, 4, 4]);
    let kernel = shape_vec(&[3, 3]);
    let pad = shape_vec(&[1, 1]);
    let stride = shape_vec(&[1, 1]);
    let dilation = shape_vec(&[1, 1]);

    let col = device_vec(&dev, &[0.0; 9 * 16]);
    let x = im_blob.gpu_data().unwrap();
    dev.im2col_nd(
        &x, 2, 16, &im_shape, &col_shape, &kernel, &pad, &stride, &dilation, &col,
    )
    .unwrap();

    // The N-D path must agree with the fixed-rank 2D kernel.
    let col_2d = device_vec(&dev, &[0.0; 9 * 16]);
    dev.im2col(&x, 1, 4, 4, 3, 3, 1, 1, 1, 1, 1, 1, &col_2d)
        .unwrap();
    assert_eq!(read_back(&dev, &col, 144), read_back(&dev, &col_2d, 144));

    let back = device_vec(&dev, &[0.0; 16]);
    dev.col2im_nd(
        &col, 2, 16, &im_shape, &col_shape, &kernel, &pad, &stride, &dilation, &back,
    )
    .unwrap();
    let back_2d = device_vec(&dev, &[0.0; 16]);
    dev.col2im(&col_2d, 1, 4, 4, 3, 3, 1, 1, 1, 1, 1, 1, &back_2d)
        .unwrap();
    assert_eq!(read_back(&dev, &back, 16), read_back(&dev, &back_2d, 16));
}

#[test]
fn test_im2col_nd_rank_limit() {
    let dev = Device::cpu();
    let x = device_vec(&dev, &[0.0; 4]);
    let s = {
        let handle = dev.malloc_device(7 * 4).unwrap();
        VPtr::<i32>::new(handle)
    };
    let err = dev
        .im2col_nd(&x, 6, 4, &s, &s, &s, &s, &s, &s, &x)
        .unwrap_err();
    assert!(matches!(err, Error::InvalidShape(_)));
}

// ============================================================================
// Fail-fast dispatch
// ============================================================================

#[cfg(not(feature = "half-ops"))]
mod half_disabled {
    use super::*;
    use half::f16;

    #[test]
    fn test_half_dispatch_fails_fast() {
        let dev = Device::cpu();
        let handle = dev.malloc_device(8).unwrap();
        let x: VPtr<f16> = VPtr::new(handle);
        let err = dev.scal(4, f16::from_f32(2.0), &x).unwrap_err();
        assert!(
            matches!(
                err,
                Error::NotImplemented {
                    kind: karst_core::ElemKind::Half,
                    ..
                }
            ),
            "unexpected error: {err}"
        );

        // Reductions refuse too, rather than demoting to float.
        assert!(dev.dot(4, &x, &x).is_err());
        assert!(dev.asum(4, &x).is_err());
    }
}

#[cfg(feature = "half-ops")]
mod half_enabled {
    use super::*;
    use half::f16;

    #[test]
    fn test_half_math_works_when_compiled_in() {
        let dev = Device::cpu();
        let handle = dev.malloc_device(8).unwrap();
        let x: VPtr<f16> = VPtr::new(handle);
        let host: Vec<f16> = [1.0f32, 2.0, 3.0, 4.0]
            .iter()
            .map(|&v| f16::from_f32(v))
            .collect();
        dev.copy_from_host(4, &host, &x).unwrap();
        dev.scal(4, f16::from_f32(2.0), &x).unwrap();
        let mut out = vec![f16::ZERO; 4];
        dev.copy_to_host(4, &x, &mut out).unwrap();
        assert_eq!(out[3], f16::from_f32(8.0));
        assert_eq!(dev.dot(4, &x, &x).unwrap(), f16::from_f32(120.0));
    }
}

// ============================================================================
// Queues & programs
// ============================================================================

#[test]
fn test_queue_selection() {
    let dev = Device::cpu();
    assert_eq!(dev.num_queues(), 1);
    assert_eq!(dev.current_queue_id(), 0);
    dev.switch_queue(0).unwrap();
    assert!(dev.switch_queue(1).is_err());
    dev.finish_queues().unwrap();
}

#[test]
fn test_host_device_has_no_program_path() {
    let dev = Device::cpu();
    assert!(matches!(
        dev.create_program("probe"),
        Err(Error::Unsupported { .. })
    ));
}

#[test]
fn test_get_threads_covers_work() {
    let dev = Device::cpu();
    let mut group = Vec::new();
    let mut local = Vec::new();
    dev.get_threads(&[1000], &mut group, &mut local, true);
    assert_eq!(group.len(), 1);
    assert_eq!(local.len(), 1);
    assert!(group[0] * local[0] >= 1000);
}
