//! Typed reduction dispatch: `(scalar type, op)` to a byte-level fold.

use half::f16;
use lockstep_tensor::{Scalar, ScalarType};
use lockstep_transport::ReduceFn;

use crate::error::{Error, Result};

/// Reduction applied by `allreduce` and `reduce`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReduceOp {
    Sum,
    Product,
    Min,
    Max,
    /// Placeholder carried for wire compatibility; never a valid dispatch.
    Unused,
}

fn fold_sum<T: Scalar>(dst: &mut [u8], src: &[u8]) {
    let dst: &mut [T] = bytemuck::cast_slice_mut(dst);
    let src: &[T] = bytemuck::cast_slice(src);
    for (d, s) in dst.iter_mut().zip(src) {
        *d = *d + *s;
    }
}

fn fold_product<T: Scalar>(dst: &mut [u8], src: &[u8]) {
    let dst: &mut [T] = bytemuck::cast_slice_mut(dst);
    let src: &[T] = bytemuck::cast_slice(src);
    for (d, s) in dst.iter_mut().zip(src) {
        *d = *d * *s;
    }
}

fn fold_min<T: Scalar>(dst: &mut [u8], src: &[u8]) {
    let dst: &mut [T] = bytemuck::cast_slice_mut(dst);
    let src: &[T] = bytemuck::cast_slice(src);
    for (d, s) in dst.iter_mut().zip(src) {
        if *s < *d {
            *d = *s;
        }
    }
}

fn fold_max<T: Scalar>(dst: &mut [u8], src: &[u8]) {
    let dst: &mut [T] = bytemuck::cast_slice_mut(dst);
    let src: &[T] = bytemuck::cast_slice(src);
    for (d, s) in dst.iter_mut().zip(src) {
        if *s > *d {
            *d = *s;
        }
    }
}

fn select<T: Scalar>(op: ReduceOp) -> Result<ReduceFn> {
    let fold: ReduceFn = match op {
        ReduceOp::Sum => fold_sum::<T>,
        ReduceOp::Product => fold_product::<T>,
        ReduceOp::Min => fold_min::<T>,
        ReduceOp::Max => fold_max::<T>,
        ReduceOp::Unused => {
            return Err(Error::Fatal("cannot reduce with the unused op".into()));
        }
    };
    Ok(fold)
}

/// Resolves the typed reducer for one collective submission.
pub(crate) fn reduce_fn(dtype: ScalarType, op: ReduceOp) -> Result<ReduceFn> {
    match dtype {
        ScalarType::F32 => select::<f32>(op),
        ScalarType::F64 => select::<f64>(op),
        ScalarType::F16 => select::<f16>(op),
        ScalarType::I8 => select::<i8>(op),
        ScalarType::U8 => select::<u8>(op),
        ScalarType::I32 => select::<i32>(op),
        ScalarType::I64 => select::<i64>(op),
    }
}
