//! Per-collective option structs and the free functions that consume them.
//!
//! Buffers cross this boundary as plain byte slices; element interpretation
//! stays with the caller, which also supplies the typed reduction as a
//! [`ReduceFn`]. Every call blocks until the group's participants have met
//! on the slot named by the tag, bounded by the context timeout.

use crate::context::Context;
use crate::error::TransportError;
use crate::mesh::OpKind;

/// Folds one peer contribution (`src`) into the accumulator (`dst`).
pub type ReduceFn = fn(&mut [u8], &[u8]);

fn mismatch(tag: u32, reason: impl Into<String>) -> TransportError {
    TransportError::Mismatch {
        tag,
        reason: reason.into(),
    }
}

pub struct BroadcastOptions<'a> {
    context: &'a Context,
    root: usize,
    tag: u32,
    input: Option<&'a mut [u8]>,
}

impl<'a> BroadcastOptions<'a> {
    pub fn new(context: &'a Context) -> Self {
        BroadcastOptions {
            context,
            root: 0,
            tag: 0,
            input: None,
        }
    }

    pub fn set_root(&mut self, root: usize) {
        self.root = root;
    }

    pub fn set_tag(&mut self, tag: u32) {
        self.tag = tag;
    }

    /// The in-place buffer: read on the root, overwritten everywhere else.
    pub fn set_input(&mut self, input: &'a mut [u8]) {
        self.input = Some(input);
    }
}

pub fn broadcast(opts: BroadcastOptions<'_>) -> Result<(), TransportError> {
    let group = opts.context.group()?;
    let rank = opts.context.rank();
    let buf = opts
        .input
        .ok_or_else(|| TransportError::Buffer("broadcast without an input buffer".into()))?;

    let slot = group.slot(opts.tag, OpKind::Broadcast)?;
    if rank == opts.root {
        slot.publish(vec![buf.to_vec()]);
    }
    let result = slot.wait_result(opts.context.timeout())?;
    let bytes = &result[0];
    if bytes.len() != buf.len() {
        return Err(mismatch(
            opts.tag,
            format!("root sent {} bytes into a buffer of {}", bytes.len(), buf.len()),
        ));
    }
    if rank != opts.root {
        buf.copy_from_slice(bytes);
    }
    group.finish(opts.tag);
    Ok(())
}

pub struct AllreduceOptions<'a> {
    context: &'a Context,
    tag: u32,
    reduce: Option<ReduceFn>,
    inputs: Vec<&'a mut [u8]>,
}

impl<'a> AllreduceOptions<'a> {
    pub fn new(context: &'a Context) -> Self {
        AllreduceOptions {
            context,
            tag: 0,
            reduce: None,
            inputs: Vec::new(),
        }
    }

    pub fn set_tag(&mut self, tag: u32) {
        self.tag = tag;
    }

    pub fn set_reduce_fn(&mut self, reduce: ReduceFn) {
        self.reduce = Some(reduce);
    }

    pub fn set_input(&mut self, input: &'a mut [u8]) {
        self.inputs = vec![input];
    }

    /// In-place buffers: reduced across the local list and across ranks,
    /// with the result written back to every one of them.
    pub fn set_inputs(&mut self, inputs: Vec<&'a mut [u8]>) {
        self.inputs = inputs;
    }
}

pub fn allreduce(mut opts: AllreduceOptions<'_>) -> Result<(), TransportError> {
    let group = opts.context.group()?;
    let rank = opts.context.rank();
    let reduce = opts
        .reduce
        .ok_or_else(|| TransportError::Buffer("allreduce without a reduce function".into()))?;
    if opts.inputs.is_empty() {
        return Err(TransportError::Buffer("allreduce without inputs".into()));
    }

    // Fold the local list first, then exchange one contribution per rank.
    let mut local = opts.inputs[0].to_vec();
    for input in &opts.inputs[1..] {
        reduce(&mut local, input);
    }

    let slot = group.slot(opts.tag, OpKind::Allreduce)?;
    slot.deposit(rank, local)?;
    let parts = slot.wait_parts(opts.context.timeout())?;

    // Every rank folds in rank order, so all replicas agree bit for bit.
    let mut result = parts[0].clone();
    for part in &parts[1..] {
        reduce(&mut result, part);
    }

    for input in opts.inputs.iter_mut() {
        if input.len() != result.len() {
            return Err(mismatch(opts.tag, "local buffers disagree in length"));
        }
        input.copy_from_slice(&result);
    }
    group.finish(opts.tag);
    Ok(())
}

pub struct ReduceOptions<'a> {
    context: &'a Context,
    root: usize,
    tag: u32,
    reduce: Option<ReduceFn>,
    input: Option<&'a mut [u8]>,
}

impl<'a> ReduceOptions<'a> {
    pub fn new(context: &'a Context) -> Self {
        ReduceOptions {
            context,
            root: 0,
            tag: 0,
            reduce: None,
            input: None,
        }
    }

    pub fn set_root(&mut self, root: usize) {
        self.root = root;
    }

    pub fn set_tag(&mut self, tag: u32) {
        self.tag = tag;
    }

    pub fn set_reduce_fn(&mut self, reduce: ReduceFn) {
        self.reduce = Some(reduce);
    }

    /// Contribution everywhere; overwritten with the reduction on the root.
    pub fn set_input(&mut self, input: &'a mut [u8]) {
        self.input = Some(input);
    }
}

pub fn reduce(opts: ReduceOptions<'_>) -> Result<(), TransportError> {
    let group = opts.context.group()?;
    let rank = opts.context.rank();
    let fold = opts
        .reduce
        .ok_or_else(|| TransportError::Buffer("reduce without a reduce function".into()))?;
    let buf = opts
        .input
        .ok_or_else(|| TransportError::Buffer("reduce without an input buffer".into()))?;

    let slot = group.slot(opts.tag, OpKind::Reduce)?;
    slot.deposit(rank, buf.to_vec())?;
    if rank == opts.root {
        let parts = slot.wait_parts(opts.context.timeout())?;
        let mut result = parts[0].clone();
        for part in &parts[1..] {
            fold(&mut result, part);
        }
        buf.copy_from_slice(&result);
    }
    group.finish(opts.tag);
    Ok(())
}

pub struct AllgatherOptions<'a> {
    context: &'a Context,
    tag: u32,
    input: Option<&'a [u8]>,
    output: Option<&'a mut [u8]>,
}

impl<'a> AllgatherOptions<'a> {
    pub fn new(context: &'a Context) -> Self {
        AllgatherOptions {
            context,
            tag: 0,
            input: None,
            output: None,
        }
    }

    pub fn set_tag(&mut self, tag: u32) {
        self.tag = tag;
    }

    pub fn set_input(&mut self, input: &'a [u8]) {
        self.input = Some(input);
    }

    /// Receives the rank-order concatenation; `size` times the input length.
    pub fn set_output(&mut self, output: &'a mut [u8]) {
        self.output = Some(output);
    }
}

pub fn allgather(opts: AllgatherOptions<'_>) -> Result<(), TransportError> {
    let group = opts.context.group()?;
    let rank = opts.context.rank();
    let input = opts
        .input
        .ok_or_else(|| TransportError::Buffer("allgather without an input buffer".into()))?;
    let output = opts
        .output
        .ok_or_else(|| TransportError::Buffer("allgather without an output buffer".into()))?;
    if output.len() != input.len() * opts.context.size() {
        return Err(mismatch(
            opts.tag,
            format!(
                "output of {} bytes for {} ranks of {}",
                output.len(),
                opts.context.size(),
                input.len()
            ),
        ));
    }

    let slot = group.slot(opts.tag, OpKind::Allgather)?;
    slot.deposit(rank, input.to_vec())?;
    let parts = slot.wait_parts(opts.context.timeout())?;
    for (index, part) in parts.iter().enumerate() {
        output[index * input.len()..(index + 1) * input.len()].copy_from_slice(part);
    }
    group.finish(opts.tag);
    Ok(())
}

pub struct GatherOptions<'a> {
    context: &'a Context,
    root: usize,
    tag: u32,
    input: Option<&'a [u8]>,
    output: Option<&'a mut [u8]>,
}

impl<'a> GatherOptions<'a> {
    pub fn new(context: &'a Context) -> Self {
        GatherOptions {
            context,
            root: 0,
            tag: 0,
            input: None,
            output: None,
        }
    }

    pub fn set_root(&mut self, root: usize) {
        self.root = root;
    }

    pub fn set_tag(&mut self, tag: u32) {
        self.tag = tag;
    }

    pub fn set_input(&mut self, input: &'a [u8]) {
        self.input = Some(input);
    }

    /// Root only: receives the rank-order concatenation.
    pub fn set_output(&mut self, output: &'a mut [u8]) {
        self.output = Some(output);
    }
}

pub fn gather(opts: GatherOptions<'_>) -> Result<(), TransportError> {
    let group = opts.context.group()?;
    let rank = opts.context.rank();
    let input = opts
        .input
        .ok_or_else(|| TransportError::Buffer("gather without an input buffer".into()))?;

    let slot = group.slot(opts.tag, OpKind::Gather)?;
    slot.deposit(rank, input.to_vec())?;
    if rank == opts.root {
        let output = opts
            .output
            .ok_or_else(|| TransportError::Buffer("gather root without an output buffer".into()))?;
        if output.len() != input.len() * opts.context.size() {
            return Err(mismatch(
                opts.tag,
                format!(
                    "root output of {} bytes for {} ranks of {}",
                    output.len(),
                    opts.context.size(),
                    input.len()
                ),
            ));
        }
        let parts = slot.wait_parts(opts.context.timeout())?;
        for (index, part) in parts.iter().enumerate() {
            output[index * input.len()..(index + 1) * input.len()].copy_from_slice(part);
        }
    }
    group.finish(opts.tag);
    Ok(())
}

pub struct ScatterOptions<'a> {
    context: &'a Context,
    root: usize,
    tag: u32,
    inputs: Vec<&'a [u8]>,
    output: Option<&'a mut [u8]>,
}

impl<'a> ScatterOptions<'a> {
    pub fn new(context: &'a Context) -> Self {
        ScatterOptions {
            context,
            root: 0,
            tag: 0,
            inputs: Vec::new(),
            output: None,
        }
    }

    pub fn set_root(&mut self, root: usize) {
        self.root = root;
    }

    pub fn set_tag(&mut self, tag: u32) {
        self.tag = tag;
    }

    /// Root only: one chunk per destination rank, all the same length.
    pub fn set_inputs(&mut self, inputs: Vec<&'a [u8]>) {
        self.inputs = inputs;
    }

    pub fn set_output(&mut self, output: &'a mut [u8]) {
        self.output = Some(output);
    }
}

pub fn scatter(opts: ScatterOptions<'_>) -> Result<(), TransportError> {
    let group = opts.context.group()?;
    let rank = opts.context.rank();
    let output = opts
        .output
        .ok_or_else(|| TransportError::Buffer("scatter without an output buffer".into()))?;

    let slot = group.slot(opts.tag, OpKind::Scatter)?;
    if rank == opts.root {
        if opts.inputs.len() != opts.context.size() {
            return Err(mismatch(
                opts.tag,
                format!(
                    "scatter root provided {} chunks for {} ranks",
                    opts.inputs.len(),
                    opts.context.size()
                ),
            ));
        }
        if opts.inputs.iter().any(|c| c.len() != opts.inputs[0].len()) {
            return Err(mismatch(opts.tag, "scatter chunks disagree in length"));
        }
        slot.publish(opts.inputs.iter().map(|c| c.to_vec()).collect());
    }
    let result = slot.wait_result(opts.context.timeout())?;
    let chunk = &result[rank];
    if chunk.len() != output.len() {
        return Err(mismatch(
            opts.tag,
            format!("chunk of {} bytes into a buffer of {}", chunk.len(), output.len()),
        ));
    }
    output.copy_from_slice(chunk);
    group.finish(opts.tag);
    Ok(())
}

pub struct BarrierOptions<'a> {
    context: &'a Context,
    tag: u32,
}

impl<'a> BarrierOptions<'a> {
    pub fn new(context: &'a Context) -> Self {
        BarrierOptions { context, tag: 0 }
    }

    pub fn set_tag(&mut self, tag: u32) {
        self.tag = tag;
    }
}

pub fn barrier(opts: BarrierOptions<'_>) -> Result<(), TransportError> {
    let group = opts.context.group()?;
    let slot = group.slot(opts.tag, OpKind::Barrier)?;
    slot.deposit(opts.context.rank(), Vec::new())?;
    slot.wait_parts(opts.context.timeout())?;
    group.finish(opts.tag);
    Ok(())
}
