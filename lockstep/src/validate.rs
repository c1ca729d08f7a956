//! Argument checks performed on the submitting thread, before any work is
//! enqueued.

use lockstep_tensor::Tensor;

use crate::error::{Error, Result};

fn argument(reason: String) -> Error {
    Error::Argument(reason)
}

pub(crate) fn check_rank(what: &str, rank: usize, size: usize) -> Result<()> {
    if rank >= size {
        return Err(argument(format!(
            "{} {} out of range for a group of {}",
            what, rank, size
        )));
    }
    Ok(())
}

pub(crate) fn check_tag(tag: i32) -> Result<()> {
    if tag < 0 {
        return Err(argument(format!("negative tag {}", tag)));
    }
    Ok(())
}

fn check_layout(what: &str, tensor: &Tensor) -> Result<()> {
    if !tensor.is_dense() || !tensor.is_contiguous() {
        return Err(argument(format!(
            "{} requires dense contiguous tensors",
            what
        )));
    }
    Ok(())
}

/// Non-empty, dense contiguous, mutually matching in type, shape and device
/// kind.
pub(crate) fn check_inputs(what: &str, tensors: &[Tensor]) -> Result<()> {
    let first = tensors
        .first()
        .ok_or_else(|| argument(format!("{} requires at least one tensor", what)))?;
    check_layout(what, first)?;
    for tensor in &tensors[1..] {
        check_layout(what, tensor)?;
        if tensor.dtype() != first.dtype() || tensor.sizes() != first.sizes() {
            return Err(argument(format!(
                "{} requires matching tensors, got {:?} alongside {:?}",
                what, tensor, first
            )));
        }
        if !tensor.device().same_kind(first.device()) {
            return Err(argument(format!(
                "{} requires tensors on one device kind, got {} alongside {}",
                what,
                tensor.device(),
                first.device()
            )));
        }
    }
    Ok(())
}

/// A list of exactly one tensor.
pub(crate) fn check_single(what: &str, tensors: &[Tensor]) -> Result<()> {
    if tensors.len() != 1 {
        return Err(argument(format!(
            "{} expects a single tensor, got {}",
            what,
            tensors.len()
        )));
    }
    Ok(())
}

/// An in-bounds tensor index into a list.
pub(crate) fn check_index(what: &str, index: usize, len: usize) -> Result<()> {
    if index >= len {
        return Err(argument(format!(
            "{} {} out of range for a list of {}",
            what, index, len
        )));
    }
    Ok(())
}

/// Dense contiguous and matching the reference in type and shape.
pub(crate) fn check_like(what: &str, tensor: &Tensor, reference: &Tensor) -> Result<()> {
    check_layout(what, tensor)?;
    if tensor.dtype() != reference.dtype() || tensor.sizes() != reference.sizes() {
        return Err(argument(format!(
            "{} requires tensors matching {:?}, got {:?}",
            what, reference, tensor
        )));
    }
    Ok(())
}

/// Accelerator placement is not wired up for this operation.
pub(crate) fn check_host_only(what: &str, tensors: &[Tensor]) -> Result<()> {
    if let Some(tensor) = tensors.iter().find(|t| t.device().is_accel()) {
        return Err(Error::Unsupported(format!(
            "{} does not support tensors on {}",
            what,
            tensor.device()
        )));
    }
    Ok(())
}

/// Point-to-point tensors additionally need a flat byte image.
pub(crate) fn check_point_to_point(what: &str, tensor: &Tensor) -> Result<()> {
    if !tensor.is_dense() || !tensor.is_contiguous() {
        return Err(argument(format!(
            "{} requires a dense contiguous tensor",
            what
        )));
    }
    if tensor.device().is_accel() {
        return Err(Error::Unsupported(format!(
            "{} does not support tensors on {}",
            what,
            tensor.device()
        )));
    }
    Ok(())
}
