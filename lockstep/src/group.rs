//! Process groups: construction, collective dispatch, shutdown.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use lockstep_tensor::Tensor;
use lockstep_transport::{Context, Device};

use crate::collectives::{
    AllgatherWork, AllreduceWork, BarrierWork, BroadcastWork, GatherWork, ReduceWork, ScatterWork,
};
use crate::error::{Error, Result};
use crate::queue::WorkQueue;
use crate::reduce::{reduce_fn, ReduceOp};
use crate::store::{Store, StoreAdapter};
use crate::validate;
use crate::work::{AsyncWork, Collective, PointToPoint, Work};

/// Construction-time knobs for a [`ProcessGroup`].
#[derive(Clone)]
pub struct GroupOptions {
    /// Transport endpoints; one connected context is built per device and
    /// collective dispatch uses the first.
    pub devices: Vec<Device>,
    /// Bound on every blocking transport operation.
    pub timeout: Duration,
    /// Worker threads executing queued collectives.
    pub threads: usize,
    /// Reserved: plumbed for transport algorithm caching, unused here.
    pub cache_num_algorithm_entries: usize,
}

impl Default for GroupOptions {
    fn default() -> GroupOptions {
        GroupOptions {
            devices: Vec::new(),
            timeout: Duration::from_millis(10_000),
            threads: 2,
            cache_num_algorithm_entries: 1,
        }
    }
}

impl GroupOptions {
    pub fn device(mut self, device: Device) -> GroupOptions {
        self.devices.push(device);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> GroupOptions {
        self.timeout = timeout;
        self
    }

    pub fn threads(mut self, threads: usize) -> GroupOptions {
        self.threads = threads;
        self
    }
}

/// One peer of a collective process group.
///
/// Construction blocks until every peer has reached the fullmesh rendezvous
/// through the shared store. Each collective method validates its arguments
/// synchronously, then returns a [`Work`] handle whose `wait()` reports the
/// outcome. Dropping the group drains all enqueued work and joins the
/// workers.
///
/// With a single worker thread submissions execute in strict FIFO order;
/// with more, execution may interleave. Chain `wait()` calls or submit a
/// `barrier()` when cross-collective ordering matters.
pub struct ProcessGroup {
    rank: usize,
    size: usize,
    contexts: Vec<Arc<Context>>,
    queue: WorkQueue,
    next_tag: AtomicU32,
}

impl std::fmt::Debug for ProcessGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessGroup")
            .field("rank", &self.rank)
            .field("size", &self.size)
            .finish_non_exhaustive()
    }
}

impl ProcessGroup {
    /// Connects `rank` of `size` peers through `store`.
    pub fn new(
        store: Arc<dyn Store>,
        rank: usize,
        size: usize,
        options: GroupOptions,
    ) -> Result<ProcessGroup> {
        if options.devices.is_empty() {
            return Err(Error::Fatal("no transport devices configured".into()));
        }
        if size == 0 {
            return Err(Error::Argument("group size must be positive".into()));
        }
        validate::check_rank("rank", rank, size)?;

        let adapter = StoreAdapter::new(store);
        let mut contexts = Vec::with_capacity(options.devices.len());
        for device in &options.devices {
            let mut context = Context::new(rank, size);
            context.set_timeout(options.timeout);
            context.connect_full_mesh(device, &adapter)?;
            contexts.push(Arc::new(context));
        }
        log::debug!(
            "process group rank {}/{} up with {} context(s), {} worker(s)",
            rank,
            size,
            contexts.len(),
            options.threads
        );

        Ok(ProcessGroup {
            rank,
            size,
            contexts,
            queue: WorkQueue::new(options.threads),
            next_tag: AtomicU32::new(0),
        })
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// The rank space is flat; there is no enclosing group to translate to.
    pub fn group_rank(&self) -> Result<usize> {
        Err(Error::Unsupported(
            "group_rank is not supported on a flat rank space".into(),
        ))
    }

    fn context(&self) -> &Arc<Context> {
        &self.contexts[0]
    }

    /// Next collective tag. Wraps modulo 2³²; a tag may repeat only after
    /// 2³² intervening submissions, far beyond any live collective.
    fn next_tag(&self) -> u32 {
        self.next_tag.fetch_add(1, Ordering::Relaxed)
    }

    fn submit(&self, tag: u32, op: Box<dyn Collective>) -> Work {
        let work = AsyncWork::queued(tag, op);
        log::trace!("rank {} enqueues tag {}", self.rank, tag);
        self.queue.enqueue(Arc::clone(&work));
        work
    }

    /// Copies `inputs[root_tensor]` on the root rank to that position on
    /// every rank, then to every other input tensor locally.
    pub fn broadcast(
        &self,
        inputs: &[Tensor],
        root_rank: usize,
        root_tensor: usize,
    ) -> Result<Work> {
        validate::check_rank("root rank", root_rank, self.size)?;
        validate::check_inputs("broadcast", inputs)?;
        validate::check_index("root tensor", root_tensor, inputs.len())?;

        let tag = self.next_tag();
        let work = BroadcastWork::new(
            Arc::clone(self.context()),
            inputs.to_vec(),
            root_rank,
            root_tensor,
            tag,
        );
        Ok(self.submit(tag, Box::new(work)))
    }

    /// Reduces `inputs` across all ranks with `op`, in place.
    pub fn allreduce(&self, inputs: &[Tensor], op: ReduceOp) -> Result<Work> {
        validate::check_inputs("allreduce", inputs)?;
        let fold = reduce_fn(inputs[0].dtype(), op)?;

        let tag = self.next_tag();
        let work = AllreduceWork::new(Arc::clone(self.context()), inputs.to_vec(), fold, tag);
        Ok(self.submit(tag, Box::new(work)))
    }

    /// Reduces the single input across all ranks onto the root.
    pub fn reduce(
        &self,
        inputs: &[Tensor],
        root_rank: usize,
        root_tensor: usize,
        op: ReduceOp,
    ) -> Result<Work> {
        validate::check_rank("root rank", root_rank, self.size)?;
        validate::check_inputs("reduce", inputs)?;
        validate::check_single("reduce", inputs)?;
        validate::check_index("root tensor", root_tensor, inputs.len())?;
        validate::check_host_only("reduce", inputs)?;
        let fold = reduce_fn(inputs[0].dtype(), op)?;

        let tag = self.next_tag();
        let work = ReduceWork {
            context: Arc::clone(self.context()),
            input: inputs[0].clone(),
            root_rank,
            reduce: fold,
            tag,
        };
        Ok(self.submit(tag, Box::new(work)))
    }

    /// Gathers every rank's inputs into each of the output lists.
    ///
    /// Each output list holds `inputs.len() * size` tensors; entry
    /// `r * inputs.len() + k` receives rank `r`'s input `k`.
    pub fn allgather(&self, outputs: &[Vec<Tensor>], inputs: &[Tensor]) -> Result<Work> {
        validate::check_inputs("allgather", inputs)?;
        validate::check_host_only("allgather", inputs)?;
        if outputs.len() != inputs.len() {
            return Err(Error::Argument(format!(
                "allgather expects one output list per input, got {} for {}",
                outputs.len(),
                inputs.len()
            )));
        }
        for list in outputs {
            if list.len() != inputs.len() * self.size {
                return Err(Error::Argument(format!(
                    "allgather output lists need {} tensors, got {}",
                    inputs.len() * self.size,
                    list.len()
                )));
            }
            for output in list {
                validate::check_like("allgather", output, &inputs[0])?;
            }
            validate::check_host_only("allgather", list)?;
        }

        let tag = self.next_tag();
        let work = AllgatherWork {
            context: Arc::clone(self.context()),
            outputs: outputs.to_vec(),
            inputs: inputs.to_vec(),
            tag,
        };
        Ok(self.submit(tag, Box::new(work)))
    }

    /// Gathers the single input of every rank into the root's output list.
    pub fn gather(
        &self,
        outputs: &[Vec<Tensor>],
        inputs: &[Tensor],
        root_rank: usize,
    ) -> Result<Work> {
        validate::check_rank("root rank", root_rank, self.size)?;
        validate::check_inputs("gather", inputs)?;
        validate::check_single("gather", inputs)?;
        validate::check_host_only("gather", inputs)?;

        let root_outputs = if self.rank == root_rank {
            let list = match outputs {
                [list] => list,
                _ => {
                    return Err(Error::Argument(format!(
                        "gather on the root expects a single output list, got {}",
                        outputs.len()
                    )))
                }
            };
            if list.len() != self.size {
                return Err(Error::Argument(format!(
                    "gather output list needs {} tensors, got {}",
                    self.size,
                    list.len()
                )));
            }
            for output in list {
                validate::check_like("gather", output, &inputs[0])?;
            }
            validate::check_host_only("gather", list)?;
            list.clone()
        } else {
            if !outputs.is_empty() {
                return Err(Error::Argument(
                    "gather on non-root ranks expects no outputs".into(),
                ));
            }
            Vec::new()
        };

        let tag = self.next_tag();
        let work = GatherWork {
            context: Arc::clone(self.context()),
            outputs: root_outputs,
            input: inputs[0].clone(),
            root_rank,
            tag,
        };
        Ok(self.submit(tag, Box::new(work)))
    }

    /// Scatters the root's input list, one tensor per rank, into every
    /// rank's single output.
    pub fn scatter(
        &self,
        outputs: &[Tensor],
        inputs: &[Vec<Tensor>],
        root_rank: usize,
    ) -> Result<Work> {
        validate::check_rank("root rank", root_rank, self.size)?;
        validate::check_inputs("scatter", outputs)?;
        validate::check_single("scatter", outputs)?;
        validate::check_host_only("scatter", outputs)?;

        let root_inputs = if self.rank == root_rank {
            let list = match inputs {
                [list] => list,
                _ => {
                    return Err(Error::Argument(format!(
                        "scatter on the root expects a single input list, got {}",
                        inputs.len()
                    )))
                }
            };
            if list.len() != self.size {
                return Err(Error::Argument(format!(
                    "scatter input list needs {} tensors, got {}",
                    self.size,
                    list.len()
                )));
            }
            for input in list {
                validate::check_like("scatter", input, &outputs[0])?;
            }
            validate::check_host_only("scatter", list)?;
            list.clone()
        } else {
            if !inputs.is_empty() {
                return Err(Error::Argument(
                    "scatter on non-root ranks expects no inputs".into(),
                ));
            }
            Vec::new()
        };

        let tag = self.next_tag();
        let work = ScatterWork {
            context: Arc::clone(self.context()),
            output: outputs[0].clone(),
            inputs: root_inputs,
            root_rank,
            tag,
        };
        Ok(self.submit(tag, Box::new(work)))
    }

    /// Fences every collective submitted so far, across all ranks.
    ///
    /// The work item snapshots everything outstanding at submission time and
    /// completes only after each of those items has finished and the
    /// transport barrier has met on every rank. Submissions after the
    /// snapshot are not held back.
    pub fn barrier(&self) -> Result<Work> {
        let prior = self.queue.snapshot();
        let tag = self.next_tag();
        let work = BarrierWork {
            context: Arc::clone(self.context()),
            prior,
            tag,
        };
        Ok(self.submit(tag, Box::new(work)))
    }

    /// Sends `tensor` to `dst_rank` under the caller-chosen `tag`.
    pub fn send(&self, tensor: &Tensor, dst_rank: usize, tag: i32) -> Result<Work> {
        validate::check_rank("destination rank", dst_rank, self.size)?;
        validate::check_tag(tag)?;
        validate::check_point_to_point("send", tensor)?;

        let buffer = unsafe {
            self.context()
                .unbound_buffer(tensor.data_ptr(), tensor.nbytes())?
        };
        buffer.send(dst_rank, tag as u64)?;
        Ok(AsyncWork::send(
            self.next_tag(),
            PointToPoint {
                buffer,
                tensor: tensor.clone(),
            },
        ))
    }

    /// Receives into `tensor` from `src_rank` under `tag`.
    pub fn recv(&self, tensor: &Tensor, src_rank: usize, tag: i32) -> Result<Work> {
        validate::check_rank("source rank", src_rank, self.size)?;
        validate::check_tag(tag)?;
        validate::check_point_to_point("recv", tensor)?;

        let buffer = unsafe {
            self.context()
                .unbound_buffer(tensor.data_ptr(), tensor.nbytes())?
        };
        buffer.recv(src_rank, tag as u64)?;
        Ok(AsyncWork::recv(
            self.next_tag(),
            PointToPoint {
                buffer,
                tensor: tensor.clone(),
            },
        ))
    }

    /// Receives into `tensor` from whichever rank sends first under `tag`.
    /// The accepted peer is reported by `source_rank()` after `wait()`.
    pub fn recv_anysource(&self, tensor: &Tensor, tag: i32) -> Result<Work> {
        validate::check_tag(tag)?;
        validate::check_point_to_point("recv_anysource", tensor)?;

        let ranks: Vec<usize> = (0..self.size).collect();
        let buffer = unsafe {
            self.context()
                .unbound_buffer(tensor.data_ptr(), tensor.nbytes())?
        };
        buffer.recv_from_any(&ranks, tag as u64)?;
        Ok(AsyncWork::recv(
            self.next_tag(),
            PointToPoint {
                buffer,
                tensor: tensor.clone(),
            },
        ))
    }
}
