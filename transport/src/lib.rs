//! Collective transport over an in-process mesh.
//!
//! A [`Context`] binds one peer of a `(rank, size)` group to a transport
//! [`Device`] after a fullmesh rendezvous through a shared key/value
//! [`Store`]. Connected contexts feed the free collective functions
//! ([`broadcast`], [`allreduce`], ...) driven by per-operation option
//! structs, and hand out [`UnboundBuffer`]s for point-to-point traffic.
//!
//! The backend is a process-local mesh hub: peers must live in the same
//! process (threads, typically). The rendezvous, blocking semantics,
//! timeouts and wire-level matching rules are the real thing; only the bytes
//! never leave the process.

mod buffer;
mod collectives;
mod context;
mod error;
mod mesh;
mod store;

pub use buffer::UnboundBuffer;
pub use collectives::{
    allgather, allreduce, barrier, broadcast, gather, reduce, scatter, AllgatherOptions,
    AllreduceOptions, BarrierOptions, BroadcastOptions, GatherOptions, ReduceFn, ReduceOptions,
    ScatterOptions,
};
pub use context::Context;
pub use error::TransportError;
pub use mesh::Device;
pub use store::Store;
