//! Asynchronous work items, shared between the caller and the engine.

use std::sync::{Arc, Condvar, Mutex};

use lockstep_tensor::Tensor;
use lockstep_transport::{TransportError, UnboundBuffer};

use crate::error::{Error, Result};

/// A collective executed by the engine.
pub(crate) trait Collective: Send + Sync {
    /// The transport call; runs on a worker thread.
    fn run(&self) -> Result<()>;

    /// Fences the caller's device streams; runs on the waiting thread after
    /// `run` has completed.
    fn synchronize(&self) -> Result<()> {
        Ok(())
    }

    /// Output handles captured by the work.
    fn result(&self) -> Vec<Tensor> {
        Vec::new()
    }
}

/// A point-to-point operation driven to completion by the first `wait`.
pub(crate) struct PointToPoint {
    pub(crate) buffer: UnboundBuffer,
    /// Keeps the memory under the unbound buffer alive until completion.
    pub(crate) tensor: Tensor,
}

enum Op {
    Queued(Box<dyn Collective>),
    Send(PointToPoint),
    Recv(PointToPoint),
}

struct State {
    completed: bool,
    failure: Option<Error>,
    source_rank: Option<usize>,
}

/// Handle to one submitted operation.
pub type Work = Arc<AsyncWork>;

/// One unit of asynchronous work.
///
/// Queued collectives are executed by a worker thread; send and recv are
/// completed inline by the first `wait`. Completion is a one-way transition:
/// every later `wait` replays the same outcome, including a captured
/// failure.
pub struct AsyncWork {
    tag: u32,
    op: Op,
    state: Mutex<State>,
    done: Condvar,
    /// Serializes the blocking part of point-to-point waits so that
    /// `is_completed` never queues behind them.
    driver: Mutex<()>,
}

impl AsyncWork {
    fn new(tag: u32, op: Op) -> Work {
        Arc::new(AsyncWork {
            tag,
            op,
            state: Mutex::new(State {
                completed: false,
                failure: None,
                source_rank: None,
            }),
            done: Condvar::new(),
            driver: Mutex::new(()),
        })
    }

    pub(crate) fn queued(tag: u32, op: Box<dyn Collective>) -> Work {
        AsyncWork::new(tag, Op::Queued(op))
    }

    pub(crate) fn send(tag: u32, p2p: PointToPoint) -> Work {
        AsyncWork::new(tag, Op::Send(p2p))
    }

    pub(crate) fn recv(tag: u32, p2p: PointToPoint) -> Work {
        AsyncWork::new(tag, Op::Recv(p2p))
    }

    /// Engine-assigned tag; strictly increasing per group modulo 2³².
    pub fn tag(&self) -> u32 {
        self.tag
    }

    pub fn is_completed(&self) -> bool {
        self.state.lock().unwrap().completed
    }

    /// Runs a queued work item and records its outcome. Worker thread only.
    pub(crate) fn execute(work: &Work) {
        let Op::Queued(op) = &work.op else {
            unreachable!("point-to-point work is never enqueued");
        };
        let failure = op.run().err();
        if let Some(error) = &failure {
            log::debug!("work tag {} failed: {}", work.tag, error);
        }
        work.complete(failure, None);
    }

    fn complete(&self, failure: Option<Error>, source_rank: Option<usize>) {
        let mut state = self.state.lock().unwrap();
        debug_assert!(!state.completed, "work completed twice");
        state.completed = true;
        state.failure = failure;
        state.source_rank = source_rank;
        self.done.notify_all();
    }

    /// Blocks until completion, fences device streams for device work, and
    /// rethrows any captured failure. Idempotent.
    pub fn wait(&self) -> Result<()> {
        match &self.op {
            Op::Queued(op) => {
                self.wait_completed()?;
                op.synchronize()
            }
            Op::Send(p2p) => self.drive(|| p2p.buffer.wait_send().map(|()| None)),
            Op::Recv(p2p) => self.drive(|| p2p.buffer.wait_recv().map(Some)),
        }
    }

    /// Blocks until the completion flag flips, without device fencing.
    pub(crate) fn wait_completed(&self) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        while !state.completed {
            state = self.done.wait(state).unwrap();
        }
        match &state.failure {
            Some(failure) => Err(failure.clone()),
            None => Ok(()),
        }
    }

    fn drive<F>(&self, operation: F) -> Result<()>
    where
        F: FnOnce() -> std::result::Result<Option<usize>, TransportError>,
    {
        let _driver = self.driver.lock().unwrap();
        if self.is_completed() {
            return self.wait_completed();
        }
        match operation() {
            Ok(source_rank) => {
                self.complete(None, source_rank);
                Ok(())
            }
            Err(transport) => {
                let failure = Error::from(transport);
                self.complete(Some(failure.clone()), None);
                Err(failure)
            }
        }
    }

    /// Fences the caller's current device streams against the work's
    /// internal streams. A no-op for host work.
    pub fn synchronize(&self) -> Result<()> {
        match &self.op {
            Op::Queued(op) => op.synchronize(),
            _ => Ok(()),
        }
    }

    /// The peer a completed recv accepted a message from.
    pub fn source_rank(&self) -> Result<usize> {
        if !matches!(self.op, Op::Recv(_)) {
            return Err(Error::Unsupported(
                "source_rank is only available on recv work".into(),
            ));
        }
        let state = self.state.lock().unwrap();
        if let Some(failure) = &state.failure {
            return Err(failure.clone());
        }
        state
            .source_rank
            .ok_or_else(|| Error::Argument("source_rank before the recv completed".into()))
    }

    /// Output handles captured by the work, empty when not applicable.
    pub fn result(&self) -> Vec<Tensor> {
        match &self.op {
            Op::Queued(op) => op.result(),
            Op::Send(p2p) | Op::Recv(p2p) => vec![p2p.tensor.clone()],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::thread;

    struct Flaky {
        runs: AtomicU32,
        fail: bool,
    }

    impl Collective for Flaky {
        fn run(&self) -> Result<()> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(Error::Transport(TransportError::Buffer("boom".into())))
            } else {
                Ok(())
            }
        }
    }

    #[test]
    fn wait_replays_success() {
        let work = AsyncWork::queued(
            1,
            Box::new(Flaky {
                runs: AtomicU32::new(0),
                fail: false,
            }),
        );
        assert!(!work.is_completed());
        AsyncWork::execute(&work);
        assert!(work.is_completed());
        work.wait().unwrap();
        work.wait().unwrap();
    }

    #[test]
    fn wait_replays_the_same_failure() {
        let work = AsyncWork::queued(
            2,
            Box::new(Flaky {
                runs: AtomicU32::new(0),
                fail: true,
            }),
        );
        AsyncWork::execute(&work);
        let first = work.wait().unwrap_err();
        let second = work.wait().unwrap_err();
        assert_eq!(first.to_string(), second.to_string());
        assert!(work.is_completed());
    }

    #[test]
    fn wait_blocks_until_execution() {
        let work = AsyncWork::queued(
            3,
            Box::new(Flaky {
                runs: AtomicU32::new(0),
                fail: false,
            }),
        );
        let waiter = {
            let work = Arc::clone(&work);
            thread::spawn(move || work.wait())
        };
        thread::sleep(std::time::Duration::from_millis(20));
        assert!(!waiter.is_finished());
        AsyncWork::execute(&work);
        waiter.join().unwrap().unwrap();
    }

    #[test]
    fn source_rank_requires_recv_work() {
        let work = AsyncWork::queued(
            4,
            Box::new(Flaky {
                runs: AtomicU32::new(0),
                fail: false,
            }),
        );
        assert!(matches!(
            work.source_rank(),
            Err(Error::Unsupported(_))
        ));
    }
}
