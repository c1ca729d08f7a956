//! Emulated accelerator runtime: virtual devices, ordered streams, events.
//!
//! The emulation keeps device memory in ordinary host allocations but models
//! the part that matters to the collective engine: every stream is a real
//! thread executing its operations in FIFO order, so incorrect fencing shows
//! up as reordered effects rather than silently working.

use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, OnceLock};
use std::thread;

use crossbeam_channel::{unbounded, Sender};

/// Streams handed out by the per-device pool, per priority class.
const POOL_STREAMS: usize = 4;

type Task = Box<dyn FnOnce() + Send + 'static>;

/// Priority class for [`stream_from_pool`]. Advisory in the emulation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamPriority {
    Normal,
    High,
}

/// An ordered execution queue on one virtual device.
///
/// Cloning yields another handle to the same queue. Work enqueued on a
/// stream runs in submission order on the stream's thread.
#[derive(Clone)]
pub struct Stream {
    inner: Arc<StreamInner>,
}

struct StreamInner {
    device: usize,
    id: usize,
    tx: Sender<Task>,
}

impl Stream {
    fn spawn(device: usize, id: usize) -> Stream {
        let (tx, rx) = unbounded::<Task>();
        thread::Builder::new()
            .name(format!("lockstep:dev{}-stream{}", device, id))
            .spawn(move || {
                while let Ok(task) = rx.recv() {
                    task();
                }
            })
            .expect("failed to spawn stream thread");
        Stream {
            inner: Arc::new(StreamInner { device, id, tx }),
        }
    }

    /// The virtual device this stream belongs to.
    pub fn device(&self) -> usize {
        self.inner.device
    }

    /// Submits `task` to run after everything already on the stream.
    pub fn enqueue<F: FnOnce() + Send + 'static>(&self, task: F) {
        self.inner
            .tx
            .send(Box::new(task))
            .expect("stream thread lives for the process");
    }

    /// Blocks the calling thread until the stream has drained.
    pub fn synchronize(&self) {
        let latch = Arc::new((Mutex::new(false), Condvar::new()));
        let signal = Arc::clone(&latch);
        self.enqueue(move || {
            let (done, cv) = &*signal;
            *done.lock().unwrap() = true;
            cv.notify_all();
        });
        let (done, cv) = &*latch;
        let mut done = done.lock().unwrap();
        while !*done {
            done = cv.wait(done).unwrap();
        }
    }
}

impl PartialEq for Stream {
    fn eq(&self, other: &Stream) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Stream(dev{}, #{})", self.inner.device, self.inner.id)
    }
}

#[derive(Default)]
struct EventState {
    recorded: bool,
    complete: bool,
}

/// A one-shot ordering marker between streams.
///
/// Waiting on an event that was never recorded is a no-op, matching the
/// hardware runtimes this emulates.
#[derive(Clone, Default)]
pub struct Event {
    inner: Arc<EventInner>,
}

#[derive(Default)]
struct EventInner {
    state: Mutex<EventState>,
    cv: Condvar,
}

impl Event {
    pub fn new() -> Event {
        Event::default()
    }

    /// Marks the event complete once everything currently on `stream` has run.
    pub fn record(&self, stream: &Stream) {
        {
            let mut state = self.inner.state.lock().unwrap();
            state.recorded = true;
            state.complete = false;
        }
        let inner = Arc::clone(&self.inner);
        stream.enqueue(move || {
            inner.state.lock().unwrap().complete = true;
            inner.cv.notify_all();
        });
    }

    /// Makes `stream` wait for the event before running anything enqueued
    /// after this call.
    pub fn block(&self, stream: &Stream) {
        let inner = Arc::clone(&self.inner);
        stream.enqueue(move || {
            let mut state = inner.state.lock().unwrap();
            while state.recorded && !state.complete {
                state = inner.cv.wait(state).unwrap();
            }
        });
    }

    /// True when the event has completed (or was never recorded).
    pub fn query(&self) -> bool {
        let state = self.inner.state.lock().unwrap();
        !state.recorded || state.complete
    }

    /// Blocks the calling thread until the event completes.
    pub fn wait(&self) {
        let mut state = self.inner.state.lock().unwrap();
        while state.recorded && !state.complete {
            state = self.inner.cv.wait(state).unwrap();
        }
    }
}

struct VirtualDevice {
    default_stream: Stream,
    pool_normal: Vec<Stream>,
    pool_high: Vec<Stream>,
    next_normal: AtomicUsize,
    next_high: AtomicUsize,
}

impl VirtualDevice {
    fn new(index: usize, ids: &AtomicUsize) -> VirtualDevice {
        let mut next_id = || ids.fetch_add(1, Ordering::Relaxed);
        let default_stream = Stream::spawn(index, next_id());
        let pool_normal = (0..POOL_STREAMS).map(|_| Stream::spawn(index, next_id())).collect();
        let pool_high = (0..POOL_STREAMS).map(|_| Stream::spawn(index, next_id())).collect();
        log::trace!("materialized virtual device {}", index);
        VirtualDevice {
            default_stream,
            pool_normal,
            pool_high,
            next_normal: AtomicUsize::new(0),
            next_high: AtomicUsize::new(0),
        }
    }
}

struct Runtime {
    devices: Mutex<Vec<Arc<VirtualDevice>>>,
    stream_ids: AtomicUsize,
}

fn runtime() -> &'static Runtime {
    static RUNTIME: OnceLock<Runtime> = OnceLock::new();
    RUNTIME.get_or_init(|| Runtime {
        devices: Mutex::new(Vec::new()),
        stream_ids: AtomicUsize::new(0),
    })
}

fn device(index: usize) -> Arc<VirtualDevice> {
    let rt = runtime();
    let mut devices = rt.devices.lock().unwrap();
    while devices.len() <= index {
        let next = devices.len();
        devices.push(Arc::new(VirtualDevice::new(next, &rt.stream_ids)));
    }
    Arc::clone(&devices[index])
}

/// The stream a device runs on when nothing else is selected.
pub fn default_stream(index: usize) -> Stream {
    device(index).default_stream.clone()
}

/// Hands out a pool stream for `index`, round-robin within the priority class.
pub fn stream_from_pool(index: usize, priority: StreamPriority) -> Stream {
    let dev = device(index);
    let (pool, next) = match priority {
        StreamPriority::Normal => (&dev.pool_normal, &dev.next_normal),
        StreamPriority::High => (&dev.pool_high, &dev.next_high),
    };
    pool[next.fetch_add(1, Ordering::Relaxed) % pool.len()].clone()
}

thread_local! {
    static CURRENT: RefCell<HashMap<usize, Stream>> = RefCell::new(HashMap::new());
}

/// The calling thread's current stream for `index`, defaulting to the
/// device's default stream.
pub fn current_stream(index: usize) -> Stream {
    CURRENT.with(|current| {
        current
            .borrow()
            .get(&index)
            .cloned()
            .unwrap_or_else(|| default_stream(index))
    })
}

/// Makes a stream current for its device on this thread until drop.
pub struct StreamGuard {
    device: usize,
    previous: Option<Stream>,
}

impl StreamGuard {
    pub fn new(stream: &Stream) -> StreamGuard {
        let device = stream.device();
        let previous =
            CURRENT.with(|current| current.borrow_mut().insert(device, stream.clone()));
        StreamGuard { device, previous }
    }
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        CURRENT.with(|current| {
            let mut current = current.borrow_mut();
            match self.previous.take() {
                Some(stream) => current.insert(self.device, stream),
                None => current.remove(&self.device),
            }
        });
    }
}
