//! Concrete work items behind each collective method.
//!
//! Host and device variants differ only in the staging wrapper: device work
//! moves bytes through pinned mirrors on dedicated streams, host work hands
//! tensor bytes to the transport directly. The unsafe byte views are sound
//! under the engine's sharing contract: captured buffers belong to the work
//! item from submission until completion.

use std::sync::{Arc, Weak};

use lockstep_tensor::{flatten_dense_tensors, new_like_flat, Tensor};
use lockstep_transport::{self as transport, Context, ReduceFn};

use crate::error::Result;
use crate::staging::DeviceStaging;
use crate::work::{AsyncWork, Collective};

pub(crate) struct BroadcastWork {
    context: Arc<Context>,
    inputs: Vec<Tensor>,
    root_rank: usize,
    root_tensor: usize,
    tag: u32,
    staging: Option<DeviceStaging>,
}

impl BroadcastWork {
    pub(crate) fn new(
        context: Arc<Context>,
        inputs: Vec<Tensor>,
        root_rank: usize,
        root_tensor: usize,
        tag: u32,
    ) -> BroadcastWork {
        let staging = inputs[0].device().is_accel().then(|| {
            let staging = DeviceStaging::new(&inputs);
            // Only the root tensor carries bytes onto the wire, and only the
            // root rank has bytes worth staging.
            if context.rank() == root_rank {
                staging.stage_in(root_tensor, &inputs[root_tensor]);
            }
            staging
        });
        BroadcastWork {
            context,
            inputs,
            root_rank,
            root_tensor,
            tag,
            staging,
        }
    }

    fn transport_broadcast(&self, wire: &Tensor) -> Result<()> {
        let mut opts = transport::BroadcastOptions::new(&self.context);
        opts.set_root(self.root_rank);
        opts.set_tag(self.tag);
        opts.set_input(unsafe { wire.as_bytes_mut() });
        transport::broadcast(opts)?;
        Ok(())
    }
}

impl Collective for BroadcastWork {
    fn run(&self) -> Result<()> {
        match &self.staging {
            None => {
                let root = &self.inputs[self.root_tensor];
                self.transport_broadcast(root)?;
                for (index, input) in self.inputs.iter().enumerate() {
                    if index != self.root_tensor {
                        input.copy_from(root, false);
                    }
                }
            }
            Some(staging) => {
                staging.sync_streams();
                let wire = &staging.pinned()[self.root_tensor];
                self.transport_broadcast(wire)?;
                for (index, input) in self.inputs.iter().enumerate() {
                    staging.stage_out_from(index, wire, input);
                }
            }
        }
        Ok(())
    }

    fn synchronize(&self) -> Result<()> {
        if let Some(staging) = &self.staging {
            staging.fence_caller();
        }
        Ok(())
    }

    fn result(&self) -> Vec<Tensor> {
        self.inputs.clone()
    }
}

pub(crate) struct AllreduceWork {
    context: Arc<Context>,
    inputs: Vec<Tensor>,
    reduce: ReduceFn,
    tag: u32,
    staging: Option<DeviceStaging>,
}

impl AllreduceWork {
    pub(crate) fn new(
        context: Arc<Context>,
        inputs: Vec<Tensor>,
        reduce: ReduceFn,
        tag: u32,
    ) -> AllreduceWork {
        let staging = inputs[0].device().is_accel().then(|| {
            let staging = DeviceStaging::new(&inputs);
            for (index, input) in inputs.iter().enumerate() {
                staging.stage_in(index, input);
            }
            staging
        });
        AllreduceWork {
            context,
            inputs,
            reduce,
            tag,
            staging,
        }
    }

    fn transport_allreduce(&self, buffers: &[Tensor]) -> Result<()> {
        let mut opts = transport::AllreduceOptions::new(&self.context);
        opts.set_tag(self.tag);
        opts.set_reduce_fn(self.reduce);
        opts.set_inputs(
            buffers
                .iter()
                .map(|t| unsafe { t.as_bytes_mut() })
                .collect(),
        );
        transport::allreduce(opts)?;
        Ok(())
    }
}

impl Collective for AllreduceWork {
    fn run(&self) -> Result<()> {
        match &self.staging {
            None => self.transport_allreduce(&self.inputs)?,
            Some(staging) => {
                staging.sync_streams();
                self.transport_allreduce(staging.pinned())?;
                for (index, input) in self.inputs.iter().enumerate() {
                    staging.stage_out(index, input);
                }
            }
        }
        Ok(())
    }

    fn synchronize(&self) -> Result<()> {
        if let Some(staging) = &self.staging {
            staging.fence_caller();
        }
        Ok(())
    }

    fn result(&self) -> Vec<Tensor> {
        self.inputs.clone()
    }
}

pub(crate) struct ReduceWork {
    pub(crate) context: Arc<Context>,
    pub(crate) input: Tensor,
    pub(crate) root_rank: usize,
    pub(crate) reduce: ReduceFn,
    pub(crate) tag: u32,
}

impl Collective for ReduceWork {
    fn run(&self) -> Result<()> {
        let mut opts = transport::ReduceOptions::new(&self.context);
        opts.set_root(self.root_rank);
        opts.set_tag(self.tag);
        opts.set_reduce_fn(self.reduce);
        opts.set_input(unsafe { self.input.as_bytes_mut() });
        transport::reduce(opts)?;
        Ok(())
    }

    fn result(&self) -> Vec<Tensor> {
        vec![self.input.clone()]
    }
}

pub(crate) struct AllgatherWork {
    pub(crate) context: Arc<Context>,
    pub(crate) outputs: Vec<Vec<Tensor>>,
    pub(crate) inputs: Vec<Tensor>,
    pub(crate) tag: u32,
}

impl Collective for AllgatherWork {
    fn run(&self) -> Result<()> {
        let flat_input = flatten_dense_tensors(&self.inputs);
        let flat_output = new_like_flat(&self.outputs[0]);
        let mut opts = transport::AllgatherOptions::new(&self.context);
        opts.set_tag(self.tag);
        opts.set_input(flat_input.as_bytes());
        opts.set_output(unsafe { flat_output.as_bytes_mut() });
        transport::allgather(opts)?;

        // slice the flat result back into every output list
        let row = self.inputs[0].numel();
        for outputs in &self.outputs {
            for (index, output) in outputs.iter().enumerate() {
                output.copy_from(&flat_output.slice_elems(index * row, row), false);
            }
        }
        Ok(())
    }

    fn result(&self) -> Vec<Tensor> {
        self.outputs.iter().flatten().cloned().collect()
    }
}

pub(crate) struct GatherWork {
    pub(crate) context: Arc<Context>,
    pub(crate) outputs: Vec<Tensor>,
    pub(crate) input: Tensor,
    pub(crate) root_rank: usize,
    pub(crate) tag: u32,
}

impl Collective for GatherWork {
    fn run(&self) -> Result<()> {
        if self.context.rank() == self.root_rank {
            let flat = new_like_flat(&self.outputs);
            let mut opts = transport::GatherOptions::new(&self.context);
            opts.set_root(self.root_rank);
            opts.set_tag(self.tag);
            opts.set_input(self.input.as_bytes());
            opts.set_output(unsafe { flat.as_bytes_mut() });
            transport::gather(opts)?;

            let row = self.input.numel();
            for (index, output) in self.outputs.iter().enumerate() {
                output.copy_from(&flat.slice_elems(index * row, row), false);
            }
        } else {
            let mut opts = transport::GatherOptions::new(&self.context);
            opts.set_root(self.root_rank);
            opts.set_tag(self.tag);
            opts.set_input(self.input.as_bytes());
            transport::gather(opts)?;
        }
        Ok(())
    }

    fn result(&self) -> Vec<Tensor> {
        self.outputs.clone()
    }
}

pub(crate) struct ScatterWork {
    pub(crate) context: Arc<Context>,
    pub(crate) output: Tensor,
    pub(crate) inputs: Vec<Tensor>,
    pub(crate) root_rank: usize,
    pub(crate) tag: u32,
}

impl Collective for ScatterWork {
    fn run(&self) -> Result<()> {
        let mut opts = transport::ScatterOptions::new(&self.context);
        opts.set_root(self.root_rank);
        opts.set_tag(self.tag);
        if self.context.rank() == self.root_rank {
            opts.set_inputs(self.inputs.iter().map(Tensor::as_bytes).collect());
        }
        opts.set_output(unsafe { self.output.as_bytes_mut() });
        transport::scatter(opts)?;
        Ok(())
    }

    fn result(&self) -> Vec<Tensor> {
        vec![self.output.clone()]
    }
}

pub(crate) struct BarrierWork {
    pub(crate) context: Arc<Context>,
    /// Everything outstanding in the queue when the barrier was submitted.
    pub(crate) prior: Vec<Weak<AsyncWork>>,
    pub(crate) tag: u32,
}

impl Collective for BarrierWork {
    fn run(&self) -> Result<()> {
        // Fence: items still alive must finish first. A prior failure fails
        // the barrier too, since the fence it promises never formed.
        for weak in &self.prior {
            if let Some(work) = weak.upgrade() {
                work.wait_completed()?;
            }
        }
        let mut opts = transport::BarrierOptions::new(&self.context);
        opts.set_tag(self.tag);
        transport::barrier(opts)?;
        Ok(())
    }
}
