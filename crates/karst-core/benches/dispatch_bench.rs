//! Benchmark: host-device dispatch overhead for gemm and im2col.

use std::sync::Arc;
use std::time::Instant;

use karst_core::{Device, Transpose, VPtr};

fn device_vec(dev: &Arc<Device>, values: &[f32]) -> VPtr<f32> {
    let handle = dev
        .malloc_device(values.len() * std::mem::size_of::<f32>())
        .unwrap();
    let ptr: VPtr<f32> = VPtr::new(handle);
    dev.copy_from_host(values.len(), values, &ptr).unwrap();
    ptr
}

fn bench_gemm(dev: &Arc<Device>, m: usize, n: usize, k: usize, iters: usize) -> f64 {
    let a_data: Vec<f32> = (0..m * k).map(|i| ((i * 7 + 3) % 13) as f32 * 0.1 - 0.6).collect();
    let b_data: Vec<f32> = (0..k * n).map(|i| ((i * 11 + 5) % 17) as f32 * 0.1 - 0.8).collect();
    let a = device_vec(dev, &a_data);
    let b = device_vec(dev, &b_data);
    let c = device_vec(dev, &vec![0.0f32; m * n]);

    let start = Instant::now();
    for _ in 0..iters {
        dev.gemm(
            Transpose::NoTrans,
            Transpose::NoTrans,
            m,
            n,
            k,
            1.0,
            &a,
            &b,
            0.0,
            &c,
        )
        .unwrap();
    }
    start.elapsed().as_secs_f64() / iters as f64
}

fn bench_im2col(dev: &Arc<Device>, channels: i32, hw: i32, iters: usize) -> f64 {
    let im_len = (channels * hw * hw) as usize;
    let im_data: Vec<f32> = (0..im_len).map(|i| (i % 31) as f32 * 0.03).collect();
    let im = device_vec(dev, &im_data);
    let col = device_vec(dev, &vec![0.0f32; im_len * 9]);

    let start = Instant::now();
    for _ in 0..iters {
        dev.im2col(&im, channels, hw, hw, 3, 3, 1, 1, 1, 1, 1, 1, &col)
            .unwrap();
    }
    start.elapsed().as_secs_f64() / iters as f64
}

fn gflops(m: usize, n: usize, k: usize, secs: f64) -> f64 {
    (2.0 * m as f64 * n as f64 * k as f64) / secs / 1e9
}

fn main() {
    let dev = Device::cpu();
    println!("=== Karst dispatch benchmark ({}) ===\n", dev.name());

    let sizes: &[(usize, usize, usize)] = &[
        (64, 64, 64),
        (128, 128, 128),
        (256, 256, 256),
        (512, 512, 512),
    ];

    println!("{:<16} {:>12} {:>10}", "gemm size", "time (ms)", "GF/s");
    println!("{}", "-".repeat(40));
    for &(m, n, k) in sizes {
        let iters = if m >= 512 { 3 } else { 10 };
        let t = bench_gemm(&dev, m, n, k, iters);
        println!(
            "{:<16} {:>12.3} {:>10.2}",
            format!("{m}x{n}x{k}"),
            t * 1e3,
            gflops(m, n, k, t)
        );
    }

    println!();
    println!("{:<16} {:>12}", "im2col size", "time (ms)");
    println!("{}", "-".repeat(30));
    for &(c, hw) in &[(3i32, 64i32), (16, 64), (32, 128)] {
        let t = bench_im2col(&dev, c, hw, 10);
        println!("{:<16} {:>12.3}", format!("{c}x{hw}x{hw}"), t * 1e3);
    }
}
