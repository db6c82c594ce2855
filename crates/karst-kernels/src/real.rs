//! Scalar element trait shared by the CPU math routines and the
//! dispatch layer.

use std::fmt::Debug;
use std::ops::{Add, AddAssign, Div, Mul, MulAssign, Neg, Sub};

use half::f16;

/// A real scalar the host math routines can compute with.
///
/// Implemented for `f16`, `f32` and `f64`. Half-precision arithmetic is
/// routed through `f32` internally, matching how half math units behave
/// on most hardware.
pub trait Real:
    Copy
    + Send
    + Sync
    + PartialOrd
    + Debug
    + bytemuck::Pod
    + Add<Output = Self>
    + Sub<Output = Self>
    + Mul<Output = Self>
    + Div<Output = Self>
    + Neg<Output = Self>
    + AddAssign
    + MulAssign
    + 'static
{
    const ZERO: Self;
    const ONE: Self;

    fn from_f64(v: f64) -> Self;
    fn to_f64(self) -> f64;

    fn abs(self) -> Self;
    fn sqrt(self) -> Self;
    fn exp(self) -> Self;
    fn ln(self) -> Self;
    fn powf(self, e: Self) -> Self;

    /// True when the sign bit is set (negative zero included).
    fn is_sign_negative(self) -> bool;
}

impl Real for f32 {
    const ZERO: Self = 0.0;
    const ONE: Self = 1.0;

    fn from_f64(v: f64) -> Self {
        v as f32
    }
    fn to_f64(self) -> f64 {
        self as f64
    }
    fn abs(self) -> Self {
        f32::abs(self)
    }
    fn sqrt(self) -> Self {
        f32::sqrt(self)
    }
    fn exp(self) -> Self {
        f32::exp(self)
    }
    fn ln(self) -> Self {
        f32::ln(self)
    }
    fn powf(self, e: Self) -> Self {
        f32::powf(self, e)
    }
    fn is_sign_negative(self) -> bool {
        f32::is_sign_negative(self)
    }
}

impl Real for f64 {
    const ZERO: Self = 0.0;
    const ONE: Self = 1.0;

    fn from_f64(v: f64) -> Self {
        v
    }
    fn to_f64(self) -> f64 {
        self
    }
    fn abs(self) -> Self {
        f64::abs(self)
    }
    fn sqrt(self) -> Self {
        f64::sqrt(self)
    }
    fn exp(self) -> Self {
        f64::exp(self)
    }
    fn ln(self) -> Self {
        f64::ln(self)
    }
    fn powf(self, e: Self) -> Self {
        f64::powf(self, e)
    }
    fn is_sign_negative(self) -> bool {
        f64::is_sign_negative(self)
    }
}

impl Real for f16 {
    const ZERO: Self = f16::ZERO;
    const ONE: Self = f16::ONE;

    fn from_f64(v: f64) -> Self {
        f16::from_f64(v)
    }
    fn to_f64(self) -> f64 {
        f16::to_f64(self)
    }
    fn abs(self) -> Self {
        f16::from_bits(self.to_bits() & 0x7fff)
    }
    fn sqrt(self) -> Self {
        f16::from_f32(self.to_f32().sqrt())
    }
    fn exp(self) -> Self {
        f16::from_f32(self.to_f32().exp())
    }
    fn ln(self) -> Self {
        f16::from_f32(self.to_f32().ln())
    }
    fn powf(self, e: Self) -> Self {
        f16::from_f32(self.to_f32().powf(e.to_f32()))
    }
    fn is_sign_negative(self) -> bool {
        self.to_bits() & 0x8000 != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_f16_abs_and_sign() {
        let v = f16::from_f32(-2.5);
        assert_eq!(Real::abs(v).to_f32(), 2.5);
        assert!(Real::is_sign_negative(v));
        assert!(!Real::is_sign_negative(Real::abs(v)));
    }

    #[test]
    fn test_round_trip() {
        assert_eq!(f32::from_f64(1.5).to_f64(), 1.5);
        assert_eq!(f64::from_f64(1.5).to_f64(), 1.5);
        assert_eq!(f16::from_f64(0.25).to_f64(), 0.25);
    }
}
