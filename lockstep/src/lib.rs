//! Collective process groups over an asynchronous work engine.
//!
//! A [`ProcessGroup`] binds `size` peer processes into a flat rank space
//! over a transport device and exposes broadcast, allreduce, reduce,
//! allgather, gather, scatter, barrier and point-to-point send/recv on
//! dense tensors. Arguments are validated on the submitting thread; the
//! operation itself runs on a small worker pool and reports through a
//! [`Work`] handle. Accelerator-resident buffers move through pinned
//! staging on dedicated streams, so the caller's compute stream is never
//! blocked on the host.
//!
//! # Examples
//! ```
//! use std::sync::Arc;
//!
//! use lockstep::tensor::Tensor;
//! use lockstep::transport::Device;
//! use lockstep::{GroupOptions, HashStore, ProcessGroup, ReduceOp};
//!
//! let store = Arc::new(HashStore::new());
//! let group = ProcessGroup::new(
//!     store,
//!     0,
//!     1,
//!     GroupOptions::default().device(Device::new()),
//! )
//! .unwrap();
//!
//! let tensor = Tensor::from_vec(vec![1.0f32, 2.0], &[2]);
//! let work = group
//!     .allreduce(std::slice::from_ref(&tensor), ReduceOp::Sum)
//!     .unwrap();
//! work.wait().unwrap();
//! assert_eq!(tensor.as_slice::<f32>(), &[1.0, 2.0]);
//! ```

mod collectives;
mod error;
mod group;
mod queue;
mod reduce;
mod staging;
mod store;
mod validate;
mod work;

pub use error::Error;
pub use group::{GroupOptions, ProcessGroup};
pub use reduce::ReduceOp;
pub use store::{HashStore, Store};
pub use work::{AsyncWork, Work};

pub use lockstep_tensor as tensor;
pub use lockstep_transport as transport;
