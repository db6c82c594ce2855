use std::fmt;

use half::f16;

use karst_kernels::Real;

/// Numeric element kinds the dispatch layer routes on.
///
/// The public operations are generic over [`Numeric`]; each call
/// resolves to one of these three fixed specializations per backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ElemKind {
    /// 16-bit IEEE 754 half precision.
    Half,
    /// 32-bit IEEE 754 single precision.
    Float,
    /// 64-bit IEEE 754 double precision.
    Double,
}

impl ElemKind {
    /// Size of one element in bytes.
    pub fn size(&self) -> usize {
        match self {
            ElemKind::Half => 2,
            ElemKind::Float => 4,
            ElemKind::Double => 8,
        }
    }

    /// Kernel-language type name, typedef'd to `Dtype` in generated
    /// programs.
    pub fn type_name(&self) -> &'static str {
        match self {
            ElemKind::Half => "half",
            ElemKind::Float => "float",
            ElemKind::Double => "double",
        }
    }

    pub fn is_half(&self) -> bool {
        matches!(self, ElemKind::Half)
    }
}

impl fmt::Display for ElemKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ElemKind::Half => write!(f, "half"),
            ElemKind::Float => write!(f, "float"),
            ElemKind::Double => write!(f, "double"),
        }
    }
}

/// Whether half-precision math paths were compiled in.
///
/// Without the `half-ops` feature, half-precision dispatch fails fast
/// with `NotImplemented` instead of silently demoting to float.
pub fn half_ops_enabled() -> bool {
    cfg!(feature = "half-ops")
}

/// Plain-old-data types that can live behind a [`crate::VPtr`]:
/// numeric elements plus the integer types used for shape and RNG
/// buffers.
pub trait Element: bytemuck::Pod + Send + Sync + 'static {}

impl<T: bytemuck::Pod + Send + Sync + 'static> Element for T {}

/// Numeric element types the math API accepts.
pub trait Numeric: Real + Element {
    const KIND: ElemKind;
}

impl Numeric for f16 {
    const KIND: ElemKind = ElemKind::Half;
}

impl Numeric for f32 {
    const KIND: ElemKind = ElemKind::Float;
}

impl Numeric for f64 {
    const KIND: ElemKind = ElemKind::Double;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sizes() {
        assert_eq!(ElemKind::Half.size(), 2);
        assert_eq!(ElemKind::Float.size(), 4);
        assert_eq!(ElemKind::Double.size(), 8);
    }

    #[test]
    fn test_type_names() {
        assert_eq!(ElemKind::Half.type_name(), "half");
        assert_eq!(ElemKind::Float.type_name(), "float");
        assert_eq!(ElemKind::Double.type_name(), "double");
    }

    #[test]
    fn test_kind_constants() {
        assert_eq!(<f16 as Numeric>::KIND, ElemKind::Half);
        assert_eq!(<f32 as Numeric>::KIND, ElemKind::Float);
        assert_eq!(<f64 as Numeric>::KIND, ElemKind::Double);
    }
}
