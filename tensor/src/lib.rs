//! Dense numeric buffers and an emulated accelerator runtime.
//!
//! This crate provides the array side of the `lockstep` workspace: a cheaply
//! clonable [`Tensor`] handle over dense strided storage, the scalar types it
//! can carry, and an in-process emulation of an accelerator (virtual devices,
//! ordered streams, events, pinned host memory) that the collective engine
//! uses to exercise its device staging path without real hardware.

pub mod accel;
mod scalar;
mod tensor;

pub use scalar::{Scalar, ScalarType};
pub use tensor::{flatten_dense_tensors, new_like_flat, Device, Tensor};
