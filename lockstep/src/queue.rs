//! The worker pool and its shared work queue.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread::{self, JoinHandle};

use crate::work::{AsyncWork, Work};

struct QueueState {
    pending: VecDeque<Work>,
    in_progress: Vec<Option<Work>>,
    stop: bool,
}

struct Shared {
    state: Mutex<QueueState>,
    /// Workers sleep here while the deque is empty.
    work_ready: Condvar,
    /// Shutdown sleeps here until the deque has drained.
    drained: Condvar,
}

/// A bounded pool of workers pulling from one FIFO deque.
///
/// Each worker publishes the item it is executing in its `in_progress`
/// slot, so a fencing snapshot can observe work that has left the deque but
/// not yet finished. Dropping the queue drains all pending work before
/// stopping and joining the workers.
pub(crate) struct WorkQueue {
    shared: Arc<Shared>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkQueue {
    pub(crate) fn new(threads: usize) -> WorkQueue {
        assert!(threads > 0, "worker pool needs at least one thread");
        let shared = Arc::new(Shared {
            state: Mutex::new(QueueState {
                pending: VecDeque::new(),
                in_progress: vec![None; threads],
                stop: false,
            }),
            work_ready: Condvar::new(),
            drained: Condvar::new(),
        });
        let workers = (0..threads)
            .map(|index| {
                let shared = Arc::clone(&shared);
                thread::Builder::new()
                    .name(format!("lockstep:worker-{}", index))
                    .spawn(move || WorkQueue::run_loop(shared, index))
                    .expect("failed to spawn worker thread")
            })
            .collect();
        WorkQueue { shared, workers }
    }

    fn run_loop(shared: Arc<Shared>, index: usize) {
        loop {
            let work = {
                let mut state = shared.state.lock().unwrap();
                loop {
                    if let Some(work) = state.pending.pop_front() {
                        state.in_progress[index] = Some(Arc::clone(&work));
                        shared.drained.notify_all();
                        break work;
                    }
                    if state.stop {
                        return;
                    }
                    state = shared.work_ready.wait(state).unwrap();
                }
            };
            log::trace!("worker {} executing tag {}", index, work.tag());
            AsyncWork::execute(&work);
            shared.state.lock().unwrap().in_progress[index] = None;
        }
    }

    pub(crate) fn enqueue(&self, work: Work) {
        let mut state = self.shared.state.lock().unwrap();
        state.pending.push_back(work);
        self.shared.work_ready.notify_one();
    }

    /// Weak references to everything submitted and not yet finished:
    /// occupied worker slots first, then the deque in FIFO order.
    pub(crate) fn snapshot(&self) -> Vec<Weak<AsyncWork>> {
        let state = self.shared.state.lock().unwrap();
        state
            .in_progress
            .iter()
            .flatten()
            .chain(state.pending.iter())
            .map(Arc::downgrade)
            .collect()
    }

    /// Pending plus in-progress items.
    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        let state = self.shared.state.lock().unwrap();
        state.pending.len() + state.in_progress.iter().flatten().count()
    }
}

impl Drop for WorkQueue {
    fn drop(&mut self) {
        {
            let mut state = self.shared.state.lock().unwrap();
            while !state.pending.is_empty() {
                state = self.shared.drained.wait(state).unwrap();
            }
            state.stop = true;
            self.shared.work_ready.notify_all();
        }
        for worker in self.workers.drain(..) {
            worker.join().expect("worker panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;
    use crate::work::Collective;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct Recorder {
        id: usize,
        delay: Duration,
        log: Arc<Mutex<Vec<usize>>>,
    }

    impl Collective for Recorder {
        fn run(&self) -> Result<()> {
            thread::sleep(self.delay);
            self.log.lock().unwrap().push(self.id);
            Ok(())
        }
    }

    fn recorder(id: usize, delay_ms: u64, log: &Arc<Mutex<Vec<usize>>>) -> Work {
        AsyncWork::queued(
            id as u32,
            Box::new(Recorder {
                id,
                delay: Duration::from_millis(delay_ms),
                log: Arc::clone(log),
            }),
        )
    }

    #[test]
    fn drop_drains_all_pending_work() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let queue = WorkQueue::new(1);
        let works: Vec<Work> = (0..6).map(|id| recorder(id, 5, &log)).collect();
        for work in &works {
            queue.enqueue(Arc::clone(work));
        }
        drop(queue);
        assert_eq!(*log.lock().unwrap(), vec![0, 1, 2, 3, 4, 5]);
        assert!(works.iter().all(|w| w.is_completed()));
    }

    #[test]
    fn single_thread_preserves_fifo() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let queue = WorkQueue::new(1);
        for id in 0..4 {
            queue.enqueue(recorder(id, 1, &log));
        }
        drop(queue);
        assert_eq!(*log.lock().unwrap(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn snapshot_sees_in_progress_and_pending() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let queue = WorkQueue::new(1);
        let slow = recorder(0, 100, &log);
        let waiting = recorder(1, 0, &log);
        queue.enqueue(Arc::clone(&slow));
        queue.enqueue(Arc::clone(&waiting));

        // let the worker pick up the slow item
        thread::sleep(Duration::from_millis(30));
        let snapshot = queue.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(queue.len(), 2);
        let tags: Vec<u32> = snapshot
            .iter()
            .filter_map(Weak::upgrade)
            .map(|w| w.tag())
            .collect();
        assert_eq!(tags, vec![0, 1]);
        drop(queue);
    }

    #[test]
    fn workers_survive_failing_items() {
        struct Failing;
        impl Collective for Failing {
            fn run(&self) -> Result<()> {
                Err(crate::error::Error::Fatal("injected".into()))
            }
        }

        let ran = Arc::new(AtomicUsize::new(0));
        struct Counts(Arc<AtomicUsize>);
        impl Collective for Counts {
            fn run(&self) -> Result<()> {
                self.0.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }

        let queue = WorkQueue::new(2);
        let failed = AsyncWork::queued(0, Box::new(Failing));
        let counted = AsyncWork::queued(1, Box::new(Counts(Arc::clone(&ran))));
        queue.enqueue(Arc::clone(&failed));
        queue.enqueue(Arc::clone(&counted));
        drop(queue);

        assert!(failed.wait().is_err());
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }
}
