//! Scalar element types carried by dense buffers.

use std::fmt;
use std::ops::{Add, Mul};

use half::f16;

/// Element type of a [`Tensor`](crate::Tensor).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ScalarType {
    F32,
    F64,
    F16,
    I8,
    U8,
    I32,
    I64,
}

impl ScalarType {
    /// Width of one element in bytes.
    pub fn size(self) -> usize {
        match self {
            ScalarType::F32 | ScalarType::I32 => 4,
            ScalarType::F64 | ScalarType::I64 => 8,
            ScalarType::F16 => 2,
            ScalarType::I8 | ScalarType::U8 => 1,
        }
    }
}

impl fmt::Display for ScalarType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ScalarType::F32 => "f32",
            ScalarType::F64 => "f64",
            ScalarType::F16 => "f16",
            ScalarType::I8 => "i8",
            ScalarType::U8 => "u8",
            ScalarType::I32 => "i32",
            ScalarType::I64 => "i64",
        };
        f.write_str(name)
    }
}

/// Types that can live in a tensor.
///
/// The bound set is what the reduction kernels need: plain-old-data for byte
/// reinterpretation, ordering for min/max, and the two arithmetic folds.
pub trait Scalar:
    bytemuck::Pod + PartialOrd + Add<Output = Self> + Mul<Output = Self> + Send + Sync + 'static
{
    /// The runtime tag matching `Self`.
    const DTYPE: ScalarType;
}

macro_rules! impl_scalar {
    ($($ty:ty => $tag:ident,)*) => {
        $(impl Scalar for $ty {
            const DTYPE: ScalarType = ScalarType::$tag;
        })*
    };
}

impl_scalar! {
    f32 => F32,
    f64 => F64,
    f16 => F16,
    i8 => I8,
    u8 => U8,
    i32 => I32,
    i64 => I64,
}
