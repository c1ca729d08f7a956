//! The process-local mesh hub backing connected contexts.
//!
//! A [`Device`] names one hub. Each connected group owns a table of
//! collective rendezvous slots keyed by tag, plus one mailbox per rank for
//! point-to-point messages. All waiting is condvar-based and bounded by the
//! caller's timeout.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::error::TransportError;

static MESH_IDS: AtomicU64 = AtomicU64::new(1);

/// A handle to one in-process transport endpoint.
///
/// Every context connected against clones of the same device can reach the
/// others; addresses exchanged through the store name the device's hub, and
/// a peer that published a foreign hub fails the connect.
#[derive(Clone)]
pub struct Device {
    pub(crate) mesh: Arc<Mesh>,
}

impl Device {
    /// Creates a fresh hub.
    #[allow(clippy::new_without_default)]
    pub fn new() -> Device {
        let id = MESH_IDS.fetch_add(1, Ordering::Relaxed);
        log::trace!("created mesh hub {}", id);
        Device {
            mesh: Arc::new(Mesh {
                id,
                groups: Mutex::new(HashMap::new()),
                next_group: AtomicU64::new(0),
            }),
        }
    }
}

pub(crate) struct Mesh {
    pub(crate) id: u64,
    groups: Mutex<HashMap<u64, Arc<Group>>>,
    next_group: AtomicU64,
}

impl Mesh {
    pub(crate) fn create_group(&self, size: usize) -> u64 {
        let id = self.next_group.fetch_add(1, Ordering::Relaxed);
        self.groups.lock().unwrap().insert(id, Arc::new(Group::new(size)));
        id
    }

    pub(crate) fn group(&self, id: u64) -> Result<Arc<Group>, TransportError> {
        self.groups
            .lock()
            .unwrap()
            .get(&id)
            .cloned()
            .ok_or_else(|| TransportError::Connect(format!("unknown group {} on mesh {}", id, self.id)))
    }
}

/// Operation named by a collective slot; arrivals under one tag must agree.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum OpKind {
    Broadcast,
    Allreduce,
    Reduce,
    Allgather,
    Gather,
    Scatter,
    Barrier,
}

pub(crate) struct Group {
    size: usize,
    slots: Mutex<HashMap<u32, Arc<Slot>>>,
    mailboxes: Vec<Mailbox>,
}

impl Group {
    fn new(size: usize) -> Group {
        Group {
            size,
            slots: Mutex::new(HashMap::new()),
            mailboxes: (0..size).map(|_| Mailbox::default()).collect(),
        }
    }

    /// The rendezvous slot for `tag`, created on first arrival.
    pub(crate) fn slot(&self, tag: u32, kind: OpKind) -> Result<Arc<Slot>, TransportError> {
        let mut slots = self.slots.lock().unwrap();
        let slot = slots
            .entry(tag)
            .or_insert_with(|| Arc::new(Slot::new(tag, kind, self.size)));
        if slot.kind != kind {
            return Err(TransportError::Mismatch {
                tag,
                reason: format!("peers disagree on operation: {:?} vs {:?}", slot.kind, kind),
            });
        }
        Ok(Arc::clone(slot))
    }

    /// Marks one participant done with the slot; the last one retires it.
    pub(crate) fn finish(&self, tag: u32) {
        let mut slots = self.slots.lock().unwrap();
        if let Some(slot) = slots.get(&tag) {
            let mut state = slot.state.lock().unwrap();
            state.finished += 1;
            if state.finished == self.size {
                drop(state);
                slots.remove(&tag);
            }
        }
    }

    /// Delivers a point-to-point message to `dst`'s mailbox.
    pub(crate) fn post(&self, dst: usize, message: Message) -> Result<(), TransportError> {
        let mailbox = self
            .mailboxes
            .get(dst)
            .ok_or_else(|| TransportError::Buffer(format!("destination rank {} out of range", dst)))?;
        mailbox.queue.lock().unwrap().push(message);
        mailbox.cv.notify_all();
        Ok(())
    }

    /// Takes the first message for `rank` matching `tag` with a source in
    /// `srcs`, waiting up to `timeout`.
    pub(crate) fn take(
        &self,
        rank: usize,
        srcs: &[usize],
        tag: u64,
        timeout: Duration,
    ) -> Result<Message, TransportError> {
        let mailbox = &self.mailboxes[rank];
        let deadline = Instant::now() + timeout;
        let mut queue = mailbox.queue.lock().unwrap();
        loop {
            if let Some(at) = queue
                .iter()
                .position(|m| m.tag == tag && srcs.contains(&m.src))
            {
                return Ok(queue.remove(at));
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(TransportError::Timeout(timeout));
            }
            let (guard, _) = mailbox.cv.wait_timeout(queue, deadline - now).unwrap();
            queue = guard;
        }
    }
}

#[derive(Default)]
struct Mailbox {
    queue: Mutex<Vec<Message>>,
    cv: Condvar,
}

#[derive(Debug)]
pub(crate) struct Message {
    pub(crate) src: usize,
    pub(crate) tag: u64,
    pub(crate) bytes: Vec<u8>,
}

/// One collective rendezvous: per-rank deposits plus an optional published
/// result, both guarded by a single condvar.
pub(crate) struct Slot {
    tag: u32,
    kind: OpKind,
    state: Mutex<SlotState>,
    cv: Condvar,
}

struct SlotState {
    parts: Vec<Option<Vec<u8>>>,
    arrived: usize,
    result: Option<Arc<Vec<Vec<u8>>>>,
    finished: usize,
}

impl Slot {
    fn new(tag: u32, kind: OpKind, size: usize) -> Slot {
        Slot {
            tag,
            kind,
            state: Mutex::new(SlotState {
                parts: vec![None; size],
                arrived: 0,
                result: None,
                finished: 0,
            }),
            cv: Condvar::new(),
        }
    }

    fn mismatch(&self, reason: impl Into<String>) -> TransportError {
        TransportError::Mismatch {
            tag: self.tag,
            reason: reason.into(),
        }
    }

    /// Contributes `rank`'s bytes. All contributions must agree in length.
    pub(crate) fn deposit(&self, rank: usize, bytes: Vec<u8>) -> Result<(), TransportError> {
        let mut state = self.state.lock().unwrap();
        if state.parts[rank].is_some() {
            return Err(self.mismatch(format!("duplicate contribution from rank {}", rank)));
        }
        if let Some(expected) = state.parts.iter().flatten().map(Vec::len).next() {
            if bytes.len() != expected {
                return Err(self.mismatch(format!(
                    "contribution of {} bytes from rank {} where peers sent {}",
                    bytes.len(),
                    rank,
                    expected
                )));
            }
        }
        state.parts[rank] = Some(bytes);
        state.arrived += 1;
        self.cv.notify_all();
        Ok(())
    }

    /// Blocks until every rank has deposited, then clones the contributions
    /// out in rank order.
    pub(crate) fn wait_parts(&self, timeout: Duration) -> Result<Vec<Vec<u8>>, TransportError> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock().unwrap();
        loop {
            if state.arrived == state.parts.len() {
                return Ok(state
                    .parts
                    .iter()
                    .map(|p| p.as_ref().cloned().unwrap_or_default())
                    .collect());
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(TransportError::Timeout(timeout));
            }
            let (guard, _) = self.cv.wait_timeout(state, deadline - now).unwrap();
            state = guard;
        }
    }

    /// Publishes result chunks for the waiting ranks.
    pub(crate) fn publish(&self, chunks: Vec<Vec<u8>>) {
        let mut state = self.state.lock().unwrap();
        state.result = Some(Arc::new(chunks));
        self.cv.notify_all();
    }

    /// Blocks until a result has been published.
    pub(crate) fn wait_result(&self, timeout: Duration) -> Result<Arc<Vec<Vec<u8>>>, TransportError> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock().unwrap();
        loop {
            if let Some(result) = &state.result {
                return Ok(Arc::clone(result));
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(TransportError::Timeout(timeout));
            }
            let (guard, _) = self.cv.wait_timeout(state, deadline - now).unwrap();
            state = guard;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn mailbox_matches_tag_and_source() {
        let group = Group::new(2);
        group
            .post(1, Message { src: 0, tag: 7, bytes: vec![1] })
            .unwrap();
        group
            .post(1, Message { src: 0, tag: 9, bytes: vec![2] })
            .unwrap();

        let m = group.take(1, &[0], 9, Duration::from_millis(100)).unwrap();
        assert_eq!(m.bytes, vec![2]);
        let m = group.take(1, &[0], 7, Duration::from_millis(100)).unwrap();
        assert_eq!(m.bytes, vec![1]);
    }

    #[test]
    fn mailbox_take_times_out() {
        let group = Group::new(1);
        let err = group.take(0, &[0], 1, Duration::from_millis(20)).unwrap_err();
        assert!(matches!(err, TransportError::Timeout(_)));
    }

    #[test]
    fn slot_collects_parts_across_threads() {
        let group = Arc::new(Group::new(3));
        let mut handles = Vec::new();
        for rank in 0..3 {
            let group = Arc::clone(&group);
            handles.push(thread::spawn(move || {
                let slot = group.slot(5, OpKind::Allgather).unwrap();
                slot.deposit(rank, vec![rank as u8]).unwrap();
                let parts = slot.wait_parts(Duration::from_secs(1)).unwrap();
                group.finish(5);
                parts
            }));
        }
        for handle in handles {
            let parts = handle.join().unwrap();
            assert_eq!(parts, vec![vec![0u8], vec![1], vec![2]]);
        }
        // retired once everyone finished
        assert!(group.slots.lock().unwrap().is_empty());
    }

    #[test]
    fn slot_rejects_disagreeing_peers() {
        let group = Group::new(2);
        let slot = group.slot(3, OpKind::Allreduce).unwrap();
        assert!(group.slot(3, OpKind::Barrier).is_err());

        slot.deposit(0, vec![0; 8]).unwrap();
        let err = slot.deposit(1, vec![0; 4]).unwrap_err();
        assert!(matches!(err, TransportError::Mismatch { tag: 3, .. }));
    }
}
