//! Rendezvous contexts bound to one `(rank, size)` group.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::buffer::UnboundBuffer;
use crate::error::TransportError;
use crate::mesh::{Device, Group};
use crate::store::Store;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// The address one peer publishes to the store during rendezvous.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
struct PeerAddr {
    mesh: u64,
    group: u64,
    rank: usize,
}

/// One peer's membership in a connected communication group.
///
/// Built unconnected, then wired to every peer by
/// [`connect_full_mesh`](Context::connect_full_mesh). After a successful
/// connect the context is immutable and safe to share across threads.
pub struct Context {
    rank: usize,
    size: usize,
    timeout: Duration,
    connected: Option<Arc<Group>>,
}

impl Context {
    pub fn new(rank: usize, size: usize) -> Context {
        assert!(size > 0, "group size must be positive");
        assert!(rank < size, "rank out of range");
        Context {
            rank,
            size,
            timeout: DEFAULT_TIMEOUT,
            connected: None,
        }
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Bounds every blocking transport operation issued through this
    /// context. Set before connecting; the rendezvous itself honors it.
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    /// Exchanges addresses with every peer through `store` and wires this
    /// context into `device`'s hub.
    ///
    /// Rank 0 registers the group and publishes first; every rank then
    /// waits until all `size` addresses exist and reads each one back, so
    /// the call returns only once the full mesh is reachable.
    pub fn connect_full_mesh(
        &mut self,
        device: &Device,
        store: &dyn Store,
    ) -> Result<(), TransportError> {
        if self.connected.is_some() {
            return Err(TransportError::Connect("context already connected".into()));
        }

        let key = |rank: usize| format!("rank/{}", rank);
        let group_id = if self.rank == 0 {
            device.mesh.create_group(self.size)
        } else {
            store.wait(&[key(0)], Some(self.timeout))?;
            let addr: PeerAddr = decode(&store.get(&key(0))?)?;
            if addr.mesh != device.mesh.id {
                return Err(TransportError::Connect(format!(
                    "rank 0 rendezvoused on mesh {} but this context uses mesh {}",
                    addr.mesh, device.mesh.id
                )));
            }
            addr.group
        };
        let group = device.mesh.group(group_id)?;

        let own = PeerAddr {
            mesh: device.mesh.id,
            group: group_id,
            rank: self.rank,
        };
        store.set(&key(self.rank), encode(&own)?)?;

        // Full mesh: collect and check every peer's address, our own included.
        let keys: Vec<String> = (0..self.size).map(|rank| key(rank)).collect();
        store.wait(&keys, Some(self.timeout))?;
        for rank in 0..self.size {
            let addr: PeerAddr = decode(&store.get(&key(rank))?)?;
            let expected = PeerAddr {
                mesh: device.mesh.id,
                group: group_id,
                rank,
            };
            if addr != expected {
                return Err(TransportError::Connect(format!(
                    "rank {} published {:?}, expected {:?}",
                    rank, addr, expected
                )));
            }
        }

        log::debug!(
            "rank {}/{} connected full mesh on mesh {} group {}",
            self.rank,
            self.size,
            device.mesh.id,
            group_id
        );
        self.connected = Some(group);
        Ok(())
    }

    pub(crate) fn group(&self) -> Result<&Arc<Group>, TransportError> {
        self.connected
            .as_ref()
            .ok_or_else(|| TransportError::Connect("context is not connected".into()))
    }

    /// Wraps caller-owned memory for point-to-point sends and receives.
    ///
    /// # Safety
    ///
    /// The region behind `ptr` must stay valid and unmoved for the life of
    /// the returned buffer; the buffer reads and writes it during sends and
    /// receive waits.
    pub unsafe fn unbound_buffer(
        &self,
        ptr: *mut u8,
        len: usize,
    ) -> Result<UnboundBuffer, TransportError> {
        let group = Arc::clone(self.group()?);
        Ok(UnboundBuffer::new(
            group,
            self.rank,
            self.size,
            self.timeout,
            ptr,
            len,
        ))
    }
}

fn encode(addr: &PeerAddr) -> Result<Vec<u8>, TransportError> {
    bincode::serialize(addr).map_err(|e| TransportError::Connect(e.to_string()))
}

fn decode(bytes: &[u8]) -> Result<PeerAddr, TransportError> {
    bincode::deserialize(bytes).map_err(|e| TransportError::Connect(e.to_string()))
}
