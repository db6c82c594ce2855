//! Host random number generation.

use rand::Rng;

use crate::real::Real;

/// Fill `out` with uniform values in (a, b] — strictly greater than `a`,
/// less than or equal to `b`.
pub fn uniform<T: Real>(a: T, b: T, out: &mut [T]) {
    let mut rng = rand::thread_rng();
    let (lo, hi) = (a.to_f64(), b.to_f64());
    for v in out.iter_mut() {
        let u: f64 = rng.gen_range(0.0..1.0);
        *v = T::from_f64(hi - (hi - lo) * u);
    }
}

/// Fill `out` with N(mu, sigma²) values via the Box–Muller transform.
pub fn gaussian<T: Real>(mu: T, sigma: T, out: &mut [T]) {
    let mut rng = rand::thread_rng();
    let (mu, sigma) = (mu.to_f64(), sigma.to_f64());
    for v in out.iter_mut() {
        let u1: f64 = rng.gen_range(1e-12f64..1.0);
        let u2: f64 = rng.gen_range(0.0..std::f64::consts::TAU);
        let z = (-2.0 * u1.ln()).sqrt() * u2.cos();
        *v = T::from_f64(mu + sigma * z);
    }
}

/// Fill `out` with Bernoulli(p) draws as 0/1 integers.
pub fn bernoulli<T: Real>(p: T, out: &mut [i32]) {
    let mut rng = rand::thread_rng();
    let p = p.to_f64();
    for v in out.iter_mut() {
        *v = i32::from(rng.gen_range(0.0..1.0f64) < p);
    }
}

/// Fill `out` with full-range u32 values.
pub fn uniform_u32(out: &mut [u32]) {
    let mut rng = rand::thread_rng();
    for v in out.iter_mut() {
        *v = rng.gen();
    }
}

/// Fill `out` with full-range u64 values.
pub fn uniform_u64(out: &mut [u64]) {
    let mut rng = rand::thread_rng();
    for v in out.iter_mut() {
        *v = rng.gen();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uniform_stays_in_half_open_range() {
        let mut out = vec![0.0f32; 1000];
        uniform(2.0, 3.0, &mut out);
        assert!(out.iter().all(|&v| v > 2.0 && v <= 3.0));
    }

    #[test]
    fn test_gaussian_moments() {
        let mut out = vec![0.0f64; 20000];
        gaussian(1.0, 2.0, &mut out);
        let mean = out.iter().sum::<f64>() / out.len() as f64;
        let var = out.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / out.len() as f64;
        assert!((mean - 1.0).abs() < 0.1, "mean {mean}");
        assert!((var - 4.0).abs() < 0.4, "var {var}");
    }

    #[test]
    fn test_bernoulli_extremes() {
        let mut out = vec![0i32; 64];
        bernoulli(0.0f32, &mut out);
        assert!(out.iter().all(|&v| v == 0));
        bernoulli(1.0f32, &mut out);
        assert!(out.iter().all(|&v| v == 1));
    }
}
