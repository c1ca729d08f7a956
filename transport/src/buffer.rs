//! Point-to-point staging over caller-owned memory.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::error::TransportError;
use crate::mesh::{Group, Message};

struct Region {
    ptr: *mut u8,
    len: usize,
}

// The region is only touched from whichever thread currently drives the
// buffer, under the pending-state mutex; the pointer itself is just carried.
unsafe impl Send for Region {}
unsafe impl Sync for Region {}

impl Region {
    unsafe fn bytes(&self) -> &[u8] {
        std::slice::from_raw_parts(self.ptr, self.len)
    }

    unsafe fn bytes_mut(&self) -> &mut [u8] {
        std::slice::from_raw_parts_mut(self.ptr, self.len)
    }
}

enum Pending {
    Idle,
    Send,
    Recv { srcs: Vec<usize>, tag: u64 },
}

/// A transport-level staging region bound to caller memory.
///
/// One operation is outstanding at a time: a `send` is completed by
/// `wait_send`, a `recv`/`recv_from_any` by `wait_recv`. The owner must keep
/// the underlying memory alive (see
/// [`Context::unbound_buffer`](crate::Context::unbound_buffer)).
pub struct UnboundBuffer {
    group: Arc<Group>,
    rank: usize,
    size: usize,
    timeout: Duration,
    region: Region,
    pending: Mutex<Pending>,
}

impl UnboundBuffer {
    pub(crate) fn new(
        group: Arc<Group>,
        rank: usize,
        size: usize,
        timeout: Duration,
        ptr: *mut u8,
        len: usize,
    ) -> UnboundBuffer {
        UnboundBuffer {
            group,
            rank,
            size,
            timeout,
            region: Region { ptr, len },
            pending: Mutex::new(Pending::Idle),
        }
    }

    /// Posts the region's bytes to `dst`'s mailbox under `tag`.
    pub fn send(&self, dst: usize, tag: u64) -> Result<(), TransportError> {
        let mut pending = self.pending.lock().unwrap();
        if !matches!(*pending, Pending::Idle) {
            return Err(TransportError::Buffer("send on a busy buffer".into()));
        }
        let bytes = unsafe { self.region.bytes() }.to_vec();
        self.group.post(
            dst,
            Message {
                src: self.rank,
                tag,
                bytes,
            },
        )?;
        *pending = Pending::Send;
        Ok(())
    }

    /// Expects a message from `src` under `tag`.
    pub fn recv(&self, src: usize, tag: u64) -> Result<(), TransportError> {
        self.recv_from_any(&[src], tag)
    }

    /// Expects a message under `tag` from any rank in `srcs`.
    pub fn recv_from_any(&self, srcs: &[usize], tag: u64) -> Result<(), TransportError> {
        if srcs.is_empty() {
            return Err(TransportError::Buffer("recv from an empty rank set".into()));
        }
        if let Some(&bad) = srcs.iter().find(|&&s| s >= self.size) {
            return Err(TransportError::Buffer(format!(
                "source rank {} out of range",
                bad
            )));
        }
        let mut pending = self.pending.lock().unwrap();
        if !matches!(*pending, Pending::Idle) {
            return Err(TransportError::Buffer("recv on a busy buffer".into()));
        }
        *pending = Pending::Recv {
            srcs: srcs.to_vec(),
            tag,
        };
        Ok(())
    }

    /// Completes an outstanding send.
    ///
    /// Delivery is eager: the bytes were deposited with the destination at
    /// `send` time, so this only settles the buffer's state.
    pub fn wait_send(&self) -> Result<(), TransportError> {
        let mut pending = self.pending.lock().unwrap();
        match *pending {
            Pending::Send => {
                *pending = Pending::Idle;
                Ok(())
            }
            _ => Err(TransportError::Buffer("wait_send without a send".into())),
        }
    }

    /// Blocks for a matching message, fills the region, and returns the
    /// source rank.
    pub fn wait_recv(&self) -> Result<usize, TransportError> {
        let (srcs, tag) = {
            let mut pending = self.pending.lock().unwrap();
            match std::mem::replace(&mut *pending, Pending::Idle) {
                Pending::Recv { srcs, tag } => (srcs, tag),
                other => {
                    *pending = other;
                    return Err(TransportError::Buffer("wait_recv without a recv".into()));
                }
            }
        };
        let message = self.group.take(self.rank, &srcs, tag, self.timeout)?;
        if message.bytes.len() != self.region.len {
            return Err(TransportError::Buffer(format!(
                "message of {} bytes for a region of {}",
                message.bytes.len(),
                self.region.len
            )));
        }
        unsafe { self.region.bytes_mut() }.copy_from_slice(&message.bytes);
        Ok(message.src)
    }
}
