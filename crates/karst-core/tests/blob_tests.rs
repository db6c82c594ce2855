//! Blob shape, capacity, and buffer-management tests on the host
//! device.

use karst_core::{Blob, BlobData, BlobDesc, ComputeContext, Device, Error};

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

// ============================================================================
// Reshape semantics
// ============================================================================

#[test]
fn test_reshape_idempotent() {
    let dev = Device::cpu();
    let mut blob: Blob<f32> = Blob::new(&dev, &[2, 3]).unwrap();
    blob.mutable_cpu_data()
        .unwrap()
        .copy_from_slice(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);

    // Same shape: no reallocation, contents preserved.
    let realloc = blob.reshape(&[2, 3]).unwrap();
    assert!(!realloc);
    assert_eq!(blob.cpu_data().unwrap(), &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
}

#[test]
fn test_reshape_capacity_monotone() {
    let dev = Device::cpu();
    let mut blob: Blob<f32> = Blob::new(&dev, &[4, 4]).unwrap();
    assert_eq!(blob.capacity(), 16);

    // Shrinking is logical only.
    assert!(!blob.reshape(&[2, 2]).unwrap());
    assert_eq!(blob.count(), 4);
    assert_eq!(blob.capacity(), 16);

    // Growing within capacity does not reallocate.
    assert!(!blob.reshape(&[16]).unwrap());
    assert_eq!(blob.capacity(), 16);

    // Growing past capacity does.
    assert!(blob.reshape(&[5, 5]).unwrap());
    assert_eq!(blob.count(), 25);
    assert_eq!(blob.capacity(), 25);
    assert!(blob.count() <= blob.capacity());
}

#[test]
fn test_reshape_preserves_data_within_capacity() {
    let dev = Device::cpu();
    let mut blob: Blob<f32> = Blob::new(&dev, &[4]).unwrap();
    blob.mutable_cpu_data()
        .unwrap()
        .copy_from_slice(&[1.0, 2.0, 3.0, 4.0]);
    blob.reshape(&[2, 2]).unwrap();
    assert_eq!(blob.cpu_data().unwrap(), &[1.0, 2.0, 3.0, 4.0]);
}

#[test]
fn test_reshape_overflow_is_fatal() {
    let dev = Device::cpu();
    let mut blob: Blob<f32> = Blob::new(&dev, &[1]).unwrap();
    let huge = i32::MAX as usize;
    assert!(matches!(
        blob.reshape(&[huge, huge]),
        Err(Error::CountOverflow(_))
    ));
}

#[test]
fn test_reshape_axis_limit() {
    let dev = Device::cpu();
    let shape = vec![1usize; 33];
    assert!(matches!(
        Blob::<f32>::new(&dev, &shape),
        Err(Error::InvalidShape(_))
    ));
}

#[test]
fn test_offset_and_count_range() {
    let dev = Device::cpu();
    let blob: Blob<f32> = Blob::new(&dev, &[2, 3, 4]).unwrap();
    assert_eq!(blob.count(), 24);
    assert_eq!(blob.count_range(1, 3), 12);
    assert_eq!(blob.offset(&[1, 2, 3]), 23);
    assert_eq!(blob.offset(&[0, 0, 0]), 0);
}

// ============================================================================
// Sharing and aliasing
// ============================================================================

#[test]
fn test_share_data_aliases_storage() {
    let dev = Device::cpu();
    let mut a: Blob<f32> = Blob::new(&dev, &[4]).unwrap();
    let mut b: Blob<f32> = Blob::new(&dev, &[4]).unwrap();
    a.mutable_cpu_data()
        .unwrap()
        .copy_from_slice(&[1.0, 2.0, 3.0, 4.0]);
    b.share_data(&a).unwrap();
    assert_eq!(b.cpu_data().unwrap(), &[1.0, 2.0, 3.0, 4.0]);

    // Writes through either blob are visible in both.
    b.mutable_cpu_data().unwrap()[0] = 9.0;
    assert_eq!(a.cpu_data().unwrap()[0], 9.0);
}

#[test]
fn test_share_data_shape_checked() {
    let dev = Device::cpu();
    let a: Blob<f32> = Blob::new(&dev, &[4]).unwrap();
    let mut b: Blob<f32> = Blob::new(&dev, &[5]).unwrap();
    assert!(matches!(
        b.share_data(&a),
        Err(Error::ShapeMismatch { .. })
    ));
}

// ============================================================================
// Numeric helpers
// ============================================================================

#[test]
fn test_update_subtracts_diff() {
    let dev = Device::cpu();
    let mut blob: Blob<f32> = Blob::new(&dev, &[4]).unwrap();
    blob.mutable_cpu_data()
        .unwrap()
        .copy_from_slice(&[10.0, 20.0, 30.0, 40.0]);
    blob.mutable_cpu_diff()
        .unwrap()
        .copy_from_slice(&[1.0, 2.0, 3.0, 4.0]);
    blob.update().unwrap();
    assert_eq!(blob.cpu_data().unwrap(), &[9.0, 18.0, 27.0, 36.0]);
}

#[test]
fn test_asum_and_sumsq() {
    let dev = Device::cpu();
    let mut blob: Blob<f32> = Blob::new(&dev, &[4]).unwrap();

    // Untouched buffers reduce to zero.
    assert_eq!(blob.asum_data().unwrap(), 0.0);

    blob.mutable_cpu_data()
        .unwrap()
        .copy_from_slice(&[-1.0, 2.0, -3.0, 4.0]);
    assert_eq!(blob.asum_data().unwrap(), 10.0);
    assert_eq!(blob.sumsq_data().unwrap(), 30.0);
    assert_eq!(blob.asum_diff().unwrap(), 0.0);
}

#[test]
fn test_scale_data_and_diff() {
    let dev = Device::cpu();
    let mut blob: Blob<f32> = Blob::new(&dev, &[3]).unwrap();
    blob.mutable_cpu_data()
        .unwrap()
        .copy_from_slice(&[1.0, 2.0, 3.0]);
    blob.mutable_cpu_diff()
        .unwrap()
        .copy_from_slice(&[4.0, 5.0, 6.0]);
    blob.scale_data(2.0).unwrap();
    blob.scale_diff(0.5).unwrap();
    assert_eq!(blob.cpu_data().unwrap(), &[2.0, 4.0, 6.0]);
    assert_eq!(blob.cpu_diff().unwrap(), &[2.0, 2.5, 3.0]);
}

#[test]
fn test_copy_from_requires_matching_shape() {
    let dev = Device::cpu();
    let mut src: Blob<f32> = Blob::new(&dev, &[2, 2]).unwrap();
    src.mutable_cpu_data()
        .unwrap()
        .copy_from_slice(&[1.0, 2.0, 3.0, 4.0]);

    let mut dst: Blob<f32> = Blob::new(&dev, &[4]).unwrap();
    assert!(dst.copy_from(&src, false, false).is_err());

    dst.copy_from(&src, false, true).unwrap();
    assert_eq!(dst.shape(), &[2, 2]);
    assert_eq!(dst.cpu_data().unwrap(), &[1.0, 2.0, 3.0, 4.0]);
}

// ============================================================================
// Flat import/export
// ============================================================================

#[test]
fn test_desc_round_trip_single_precision() {
    let dev = Device::cpu();
    let desc = BlobDesc {
        shape: vec![2, 2],
        data: BlobData::Single(vec![1.5, -2.5, 3.5, -4.5]),
        diff: Some(BlobData::Single(vec![0.1, 0.2, 0.3, 0.4])),
    };
    let blob: Blob<f32> = Blob::from_desc(&dev, &desc).unwrap();
    assert_eq!(blob.shape(), &[2, 2]);
    assert_eq!(blob.cpu_data().unwrap(), &[1.5, -2.5, 3.5, -4.5]);

    let out = blob.to_desc(false, true).unwrap();
    assert_eq!(out.shape, vec![2, 2]);
    assert_eq!(out.data, BlobData::Single(vec![1.5, -2.5, 3.5, -4.5]));
    match out.diff.unwrap() {
        BlobData::Single(v) => assert_close(&v, &[0.1, 0.2, 0.3, 0.4], 1e-6),
        other => panic!("expected single precision, got {other:?}"),
    }
}

#[test]
fn test_desc_width_conversion() {
    let dev = Device::cpu();
    // Double-precision input into an f32 blob, exported as double.
    let desc = BlobDesc {
        shape: vec![3],
        data: BlobData::Double(vec![1.0, 2.0, 3.0]),
        diff: None,
    };
    let blob: Blob<f32> = Blob::from_desc(&dev, &desc).unwrap();
    let out = blob.to_desc(true, false).unwrap();
    assert_eq!(out.data, BlobData::Double(vec![1.0, 2.0, 3.0]));
    assert!(out.diff.is_none());
}

#[test]
fn test_desc_legacy_4d() {
    let dev = Device::cpu();
    let desc = BlobDesc::legacy_4d(1, 2, 2, 1, BlobData::Single(vec![1.0, 2.0, 3.0, 4.0]));
    let blob: Blob<f32> = Blob::from_desc(&dev, &desc).unwrap();
    assert_eq!(blob.shape(), &[1, 2, 2, 1]);
    assert_eq!(blob.num_axes(), 4);
}

#[test]
fn test_desc_count_mismatch_is_fatal() {
    let dev = Device::cpu();
    let desc = BlobDesc {
        shape: vec![4],
        data: BlobData::Single(vec![1.0, 2.0]),
        diff: None,
    };
    assert!(Blob::<f32>::from_desc(&dev, &desc).is_err());
}

// ============================================================================
// Context plumbing
// ============================================================================

#[test]
fn test_blob_on_context_device() {
    let ctx = ComputeContext::new();
    let mut blob: Blob<f64> = Blob::new(ctx.device(), &[2]).unwrap();
    blob.mutable_cpu_data().unwrap().copy_from_slice(&[1.0, 2.0]);
    assert_eq!(blob.asum_data().unwrap(), 3.0);
}
