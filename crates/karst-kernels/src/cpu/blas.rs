//! BLAS-like host routines over plain slices.
//!
//! Level-1 routines are straight loops; `gemm` uses cache-friendly
//! tiling with rayon parallelism across row blocks once the output is
//! large enough to amortize the fork.

use rayon::prelude::*;

use crate::real::Real;

/// Operand transposition for `gemm`/`gemv`, row-major storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transpose {
    NoTrans,
    Trans,
}

/// Tile edge for the blocked gemm inner loops.
const TILE: usize = 64;
/// Minimum output rows before gemm forks into rayon.
const PAR_MIN_ROWS: usize = 32;

/// x = alpha, elementwise.
pub fn set<T: Real>(alpha: T, x: &mut [T]) {
    for v in x.iter_mut() {
        *v = alpha;
    }
}

/// x += alpha, elementwise.
pub fn add_scalar<T: Real>(alpha: T, x: &mut [T]) {
    for v in x.iter_mut() {
        *v += alpha;
    }
}

/// x *= alpha.
pub fn scal<T: Real>(alpha: T, x: &mut [T]) {
    for v in x.iter_mut() {
        *v *= alpha;
    }
}

/// y += alpha * x.
pub fn axpy<T: Real>(alpha: T, x: &[T], y: &mut [T]) {
    debug_assert_eq!(x.len(), y.len());
    for (yi, &xi) in y.iter_mut().zip(x.iter()) {
        *yi += alpha * xi;
    }
}

/// y = alpha * x + beta * y.
pub fn axpby<T: Real>(alpha: T, x: &[T], beta: T, y: &mut [T]) {
    scal(beta, y);
    axpy(alpha, x, y);
}

/// y = alpha * x.
pub fn scale<T: Real>(alpha: T, x: &[T], y: &mut [T]) {
    debug_assert_eq!(x.len(), y.len());
    for (yi, &xi) in y.iter_mut().zip(x.iter()) {
        *yi = alpha * xi;
    }
}

/// Inner product, accumulated in f64.
pub fn dot<T: Real>(x: &[T], y: &[T]) -> T {
    debug_assert_eq!(x.len(), y.len());
    let acc: f64 = x
        .iter()
        .zip(y.iter())
        .map(|(&a, &b)| a.to_f64() * b.to_f64())
        .sum();
    T::from_f64(acc)
}

/// Sum of absolute values, accumulated in f64.
pub fn asum<T: Real>(x: &[T]) -> T {
    let acc: f64 = x.iter().map(|&v| v.to_f64().abs()).sum();
    T::from_f64(acc)
}

/// Sum of squares, accumulated in f64.
pub fn sumsq<T: Real>(x: &[T]) -> T {
    let acc: f64 = x.iter().map(|&v| v.to_f64() * v.to_f64()).sum();
    T::from_f64(acc)
}

macro_rules! binary_op {
    ($name:ident, $op:tt) => {
        /// Elementwise binary op: y = a OP b.
        pub fn $name<T: Real>(a: &[T], b: &[T], y: &mut [T]) {
            debug_assert_eq!(a.len(), y.len());
            debug_assert_eq!(b.len(), y.len());
            for i in 0..y.len() {
                y[i] = a[i] $op b[i];
            }
        }
    };
}

binary_op!(add, +);
binary_op!(sub, -);
binary_op!(mul, *);
binary_op!(div, /);

/// y = |a|.
pub fn abs<T: Real>(a: &[T], y: &mut [T]) {
    for (yi, &ai) in y.iter_mut().zip(a.iter()) {
        *yi = ai.abs();
    }
}

/// y = exp(a).
pub fn exp<T: Real>(a: &[T], y: &mut [T]) {
    for (yi, &ai) in y.iter_mut().zip(a.iter()) {
        *yi = ai.exp();
    }
}

/// y = ln(a).
pub fn log<T: Real>(a: &[T], y: &mut [T]) {
    for (yi, &ai) in y.iter_mut().zip(a.iter()) {
        *yi = ai.ln();
    }
}

/// y = a^b, elementwise in a, fixed exponent.
pub fn powx<T: Real>(a: &[T], b: T, y: &mut [T]) {
    for (yi, &ai) in y.iter_mut().zip(a.iter()) {
        *yi = ai.powf(b);
    }
}

/// y = sqrt(a).
pub fn sqrt<T: Real>(a: &[T], y: &mut [T]) {
    for (yi, &ai) in y.iter_mut().zip(a.iter()) {
        *yi = ai.sqrt();
    }
}

/// y = sign(a) in {-1, 0, +1}.
pub fn sign<T: Real>(a: &[T], y: &mut [T]) {
    for (yi, &ai) in y.iter_mut().zip(a.iter()) {
        *yi = if ai > T::ZERO {
            T::ONE
        } else if ai < T::ZERO {
            -T::ONE
        } else {
            T::ZERO
        };
    }
}

/// y = 1 if the sign bit of a is set, else 0.
pub fn sgnbit<T: Real>(a: &[T], y: &mut [T]) {
    for (yi, &ai) in y.iter_mut().zip(a.iter()) {
        *yi = if ai.is_sign_negative() {
            T::ONE
        } else {
            T::ZERO
        };
    }
}

#[inline]
fn op_a<T: Real>(a: &[T], trans: Transpose, m: usize, k: usize, i: usize, p: usize) -> T {
    match trans {
        Transpose::NoTrans => a[i * k + p],
        Transpose::Trans => a[p * m + i],
    }
}

#[inline]
fn op_b<T: Real>(b: &[T], trans: Transpose, k: usize, n: usize, p: usize, j: usize) -> T {
    match trans {
        Transpose::NoTrans => b[p * n + j],
        Transpose::Trans => b[j * k + p],
    }
}

/// C = alpha * op(A) * op(B) + beta * C, row-major.
///
/// op(A) is m×k, op(B) is k×n, C is m×n. Row blocks run on rayon when
/// the output is tall enough.
#[allow(clippy::too_many_arguments)]
pub fn gemm<T: Real>(
    trans_a: Transpose,
    trans_b: Transpose,
    m: usize,
    n: usize,
    k: usize,
    alpha: T,
    a: &[T],
    b: &[T],
    beta: T,
    c: &mut [T],
) {
    debug_assert_eq!(c.len(), m * n);
    if m == 0 || n == 0 {
        return;
    }

    let row_block = |i0: usize, c_rows: &mut [T]| {
        let i_end = (i0 + TILE).min(m);
        for j0 in (0..n).step_by(TILE) {
            let j_end = (j0 + TILE).min(n);
            for i in i0..i_end {
                for j in j0..j_end {
                    let mut acc = T::ZERO;
                    for p in 0..k {
                        acc += op_a(a, trans_a, m, k, i, p) * op_b(b, trans_b, k, n, p, j);
                    }
                    let idx = (i - i0) * n + j;
                    c_rows[idx] = alpha * acc + beta * c_rows[idx];
                }
            }
        }
    };

    if m >= PAR_MIN_ROWS {
        c.par_chunks_mut(TILE * n)
            .enumerate()
            .for_each(|(blk, c_rows)| row_block(blk * TILE, c_rows));
    } else {
        for (blk, c_rows) in c.chunks_mut(TILE * n).enumerate() {
            row_block(blk * TILE, c_rows);
        }
    }
}

/// y = alpha * op(A) * x + beta * y, row-major. op(A) is m×n.
pub fn gemv<T: Real>(
    trans_a: Transpose,
    m: usize,
    n: usize,
    alpha: T,
    a: &[T],
    x: &[T],
    beta: T,
    y: &mut [T],
) {
    // op(A) rows × x; a stored m×n when NoTrans, the gemv dims refer to
    // the stored matrix like BLAS: op dims are (m,n) or (n,m).
    let (rows, cols) = match trans_a {
        Transpose::NoTrans => (m, n),
        Transpose::Trans => (n, m),
    };
    debug_assert_eq!(x.len(), cols);
    debug_assert_eq!(y.len(), rows);
    for i in 0..rows {
        let mut acc = T::ZERO;
        for j in 0..cols {
            let aij = match trans_a {
                Transpose::NoTrans => a[i * n + j],
                Transpose::Trans => a[j * n + i],
            };
            acc += aij * x[j];
        }
        y[i] = alpha * acc + beta * y[i];
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_axpy_and_scal() {
        let x = vec![1.0f32, 2.0, 3.0];
        let mut y = vec![10.0f32, 20.0, 30.0];
        axpy(2.0, &x, &mut y);
        assert_eq!(y, vec![12.0, 24.0, 36.0]);
        scal(0.5, &mut y);
        assert_eq!(y, vec![6.0, 12.0, 18.0]);
    }

    #[test]
    fn test_dot_and_asum() {
        let x = vec![1.0f32, 2.0, 3.0, 4.0];
        assert_eq!(dot(&x, &x), 30.0);
        let m = vec![-1.0f32, 2.0, -3.0];
        assert_eq!(asum(&m), 6.0);
        assert_eq!(sumsq(&m), 14.0);
    }

    #[test]
    fn test_sign_and_sgnbit() {
        let a = vec![-2.0f32, 0.0, 5.0];
        let mut s = vec![0.0f32; 3];
        sign(&a, &mut s);
        assert_eq!(s, vec![-1.0, 0.0, 1.0]);
        sgnbit(&a, &mut s);
        assert_eq!(s, vec![1.0, 0.0, 0.0]);
    }

    #[test]
    fn test_gemm_identity() {
        // 2x2 identity times arbitrary B.
        let a = vec![1.0f32, 0.0, 0.0, 1.0];
        let b = vec![1.0f32, 2.0, 3.0, 4.0];
        let mut c = vec![0.0f32; 4];
        gemm(
            Transpose::NoTrans,
            Transpose::NoTrans,
            2,
            2,
            2,
            1.0,
            &a,
            &b,
            0.0,
            &mut c,
        );
        assert_eq!(c, b);
    }

    #[test]
    fn test_gemm_transposed_operands() {
        // A = [[1,2],[3,4]] stored transposed as [[1,3],[2,4]].
        let a_t = vec![1.0f32, 3.0, 2.0, 4.0];
        let b = vec![1.0f32, 0.0, 0.0, 1.0];
        let mut c = vec![0.0f32; 4];
        gemm(
            Transpose::Trans,
            Transpose::NoTrans,
            2,
            2,
            2,
            1.0,
            &a_t,
            &b,
            0.0,
            &mut c,
        );
        assert_eq!(c, vec![1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_gemm_alpha_beta() {
        let a = vec![1.0f32, 1.0];
        let b = vec![1.0f32, 1.0];
        let mut c = vec![10.0f32];
        gemm(
            Transpose::NoTrans,
            Transpose::NoTrans,
            1,
            1,
            2,
            2.0,
            &a,
            &b,
            3.0,
            &mut c,
        );
        // 2 * (1+1) + 3 * 10
        assert_eq!(c, vec![34.0]);
    }

    #[test]
    fn test_gemv_matches_gemm() {
        let a = vec![1.0f32, 2.0, 3.0, 4.0, 5.0, 6.0]; // 2x3
        let x = vec![1.0f32, 1.0, 1.0];
        let mut y = vec![0.0f32, 0.0];
        gemv(Transpose::NoTrans, 2, 3, 1.0, &a, &x, 0.0, &mut y);
        assert_eq!(y, vec![6.0, 15.0]);

        let x2 = vec![1.0f32, 1.0];
        let mut y2 = vec![0.0f32; 3];
        gemv(Transpose::Trans, 2, 3, 1.0, &a, &x2, 0.0, &mut y2);
        assert_eq!(y2, vec![5.0, 7.0, 9.0]);
    }

    #[test]
    fn test_large_gemm_parallel_path() {
        // Big enough to cross PAR_MIN_ROWS; A = all ones, B = identity.
        let m = 80;
        let k = 16;
        let a = vec![1.0f32; m * k];
        let mut b = vec![0.0f32; k * k];
        for i in 0..k {
            b[i * k + i] = 1.0;
        }
        let mut c = vec![0.0f32; m * k];
        gemm(
            Transpose::NoTrans,
            Transpose::NoTrans,
            m,
            k,
            k,
            1.0,
            &a,
            &b,
            0.0,
            &mut c,
        );
        assert!(c.iter().all(|&v| v == 1.0));
    }
}
