//! Pinned staging and stream fencing for accelerator-resident buffers.
//!
//! The caller's default stream is never blocked: each input gets its own
//! high-priority pool stream ordered behind the caller's current stream via
//! a recorded event, host-side transport calls see valid data by draining
//! those streams on the worker thread, and the copies back to the device
//! are fenced into the caller's stream through per-input events.

use smallvec::SmallVec;

use lockstep_tensor::accel::{self, Event, Stream, StreamGuard, StreamPriority};
use lockstep_tensor::Tensor;

pub(crate) struct DeviceStaging {
    pinned: SmallVec<[Tensor; 2]>,
    streams: SmallVec<[Stream; 2]>,
    events: SmallVec<[Event; 2]>,
    devices: SmallVec<[usize; 2]>,
}

impl DeviceStaging {
    /// One pinned mirror, pool stream and event per input, each stream
    /// serialized behind the caller's current stream on that device.
    pub(crate) fn new(inputs: &[Tensor]) -> DeviceStaging {
        let mut staging = DeviceStaging {
            pinned: SmallVec::new(),
            streams: SmallVec::new(),
            events: SmallVec::new(),
            devices: SmallVec::new(),
        };
        for input in inputs {
            let device = input
                .device()
                .accel_index()
                .expect("staging requires accelerator tensors");
            let stream = accel::stream_from_pool(device, StreamPriority::High);
            let ready = Event::new();
            ready.record(&accel::current_stream(device));
            ready.block(&stream);
            staging.pinned.push(input.pinned_like());
            staging.streams.push(stream);
            staging.events.push(Event::new());
            staging.devices.push(device);
        }
        staging
    }

    pub(crate) fn pinned(&self) -> &[Tensor] {
        &self.pinned
    }

    /// Starts the device→pinned copy for input `index` on its stream.
    pub(crate) fn stage_in(&self, index: usize, input: &Tensor) {
        let _guard = StreamGuard::new(&self.streams[index]);
        self.pinned[index].copy_from(input, true);
    }

    /// Blocks the worker until every staging stream has drained, so the
    /// host-side transport call sees valid pinned bytes.
    pub(crate) fn sync_streams(&self) {
        for stream in &self.streams {
            stream.synchronize();
        }
    }

    /// Copies `source` back to `input` on input `index`'s stream and records
    /// that stream's completion event.
    pub(crate) fn stage_out_from(&self, index: usize, source: &Tensor, input: &Tensor) {
        let _guard = StreamGuard::new(&self.streams[index]);
        input.copy_from(source, true);
        self.events[index].record(&self.streams[index]);
    }

    /// Copies pinned bytes of `index` back to `input`.
    pub(crate) fn stage_out(&self, index: usize, input: &Tensor) {
        self.stage_out_from(index, &self.pinned[index], input);
    }

    /// Caller-side fence: the current stream of each input's device waits
    /// on the recorded copy-back events.
    pub(crate) fn fence_caller(&self) {
        for (event, device) in self.events.iter().zip(&self.devices) {
            event.block(&accel::current_stream(*device));
        }
    }
}
