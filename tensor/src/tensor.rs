//! Dense strided tensors over host or virtual accelerator memory.

use std::cell::UnsafeCell;
use std::fmt;
use std::sync::Arc;

use crate::accel;
use crate::scalar::{Scalar, ScalarType};

/// Where a tensor's storage lives.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Device {
    Host,
    Accel(usize),
}

impl Device {
    pub fn is_accel(self) -> bool {
        matches!(self, Device::Accel(_))
    }

    pub fn accel_index(self) -> Option<usize> {
        match self {
            Device::Accel(index) => Some(index),
            Device::Host => None,
        }
    }

    /// Same device *kind*: host with host, accelerator with accelerator.
    pub fn same_kind(self, other: Device) -> bool {
        matches!(
            (self, other),
            (Device::Host, Device::Host) | (Device::Accel(_), Device::Accel(_))
        )
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Host => f.write_str("host"),
            Device::Accel(index) => write!(f, "accel:{}", index),
        }
    }
}

struct Storage {
    data: UnsafeCell<Box<[u8]>>,
    device: Device,
    pinned: bool,
}

// Storage is shared between caller threads, worker threads and stream
// threads. Exclusive access during mutation is the caller's contract (see
// `Tensor`); the cell itself is just bytes.
unsafe impl Send for Storage {}
unsafe impl Sync for Storage {}

impl Storage {
    fn base(&self) -> *mut u8 {
        unsafe { (*self.data.get()).as_mut_ptr() }
    }

    fn len(&self) -> usize {
        unsafe { (&(*self.data.get())).len() }
    }
}

/// A cheaply clonable handle over dense strided storage.
///
/// Handles share storage: cloning a tensor clones the view, not the bytes.
/// Concurrent mutation of the same storage without external ordering is
/// undefined; the collective engine holds captured handles exactly so that
/// callers keep their hands off buffers while work is in flight.
#[derive(Clone)]
pub struct Tensor {
    storage: Arc<Storage>,
    dtype: ScalarType,
    sizes: Vec<usize>,
    strides: Vec<usize>,
    offset: usize,
}

fn contiguous_strides(sizes: &[usize]) -> Vec<usize> {
    let mut strides = vec![1; sizes.len()];
    for d in (0..sizes.len().saturating_sub(1)).rev() {
        strides[d] = strides[d + 1] * sizes[d + 1];
    }
    strides
}

impl Tensor {
    fn alloc(dtype: ScalarType, sizes: &[usize], device: Device, pinned: bool) -> Tensor {
        let numel: usize = sizes.iter().product();
        let storage = Storage {
            data: UnsafeCell::new(vec![0u8; numel * dtype.size()].into_boxed_slice()),
            device,
            pinned,
        };
        Tensor {
            storage: Arc::new(storage),
            dtype,
            sizes: sizes.to_vec(),
            strides: contiguous_strides(sizes),
            offset: 0,
        }
    }

    /// A zero-filled contiguous tensor.
    pub fn zeros(dtype: ScalarType, sizes: &[usize], device: Device) -> Tensor {
        Tensor::alloc(dtype, sizes, device, false)
    }

    /// A host tensor initialized from `values`.
    pub fn from_vec<T: Scalar>(values: Vec<T>, sizes: &[usize]) -> Tensor {
        Tensor::from_vec_on(values, sizes, Device::Host)
    }

    /// A tensor on `device` initialized from `values`.
    pub fn from_vec_on<T: Scalar>(values: Vec<T>, sizes: &[usize], device: Device) -> Tensor {
        let tensor = Tensor::zeros(T::DTYPE, sizes, device);
        tensor.copy_from_slice(&values);
        tensor
    }

    /// A zero-filled tensor with this tensor's type, shape and device.
    pub fn new_like(&self) -> Tensor {
        Tensor::zeros(self.dtype, &self.sizes, self.device())
    }

    /// A page-locked host mirror with this tensor's type and shape.
    ///
    /// The emulation tags the allocation; real DMA pinning is a backend
    /// concern.
    pub fn pinned_like(&self) -> Tensor {
        Tensor::alloc(self.dtype, &self.sizes, Device::Host, true)
    }

    pub fn dtype(&self) -> ScalarType {
        self.dtype
    }

    pub fn device(&self) -> Device {
        self.storage.device
    }

    pub fn sizes(&self) -> &[usize] {
        &self.sizes
    }

    pub fn strides(&self) -> &[usize] {
        &self.strides
    }

    pub fn numel(&self) -> usize {
        self.sizes.iter().product()
    }

    pub fn itemsize(&self) -> usize {
        self.dtype.size()
    }

    pub fn nbytes(&self) -> usize {
        self.numel() * self.itemsize()
    }

    pub fn is_pinned(&self) -> bool {
        self.storage.pinned
    }

    /// Strided storage is the only layout here, so every tensor is dense.
    /// The query exists because callers validate density before collectives.
    pub fn is_dense(&self) -> bool {
        true
    }

    pub fn is_contiguous(&self) -> bool {
        self.strides == contiguous_strides(&self.sizes)
    }

    /// Pointer to the first element.
    pub fn data_ptr(&self) -> *mut u8 {
        debug_assert!(self.offset * self.itemsize() <= self.storage.len());
        unsafe { self.storage.base().add(self.offset * self.itemsize()) }
    }

    /// The raw bytes of a contiguous tensor.
    ///
    /// Reading while another thread mutates the storage is undefined, per
    /// the sharing contract on [`Tensor`].
    pub fn as_bytes(&self) -> &[u8] {
        assert!(self.is_contiguous(), "byte view of non-contiguous tensor");
        let start = self.offset * self.itemsize();
        unsafe { &(&(*self.storage.data.get()))[start..start + self.nbytes()] }
    }

    /// Mutable raw bytes of a contiguous tensor.
    ///
    /// # Safety
    ///
    /// The caller must be the only party touching this storage for the
    /// lifetime of the returned slice.
    pub unsafe fn as_bytes_mut(&self) -> &mut [u8] {
        assert!(self.is_contiguous(), "byte view of non-contiguous tensor");
        let start = self.offset * self.itemsize();
        let end = start + self.nbytes();
        &mut (&mut (*self.storage.data.get()))[start..end]
    }

    /// Typed view of a contiguous tensor.
    pub fn as_slice<T: Scalar>(&self) -> &[T] {
        assert_eq!(T::DTYPE, self.dtype, "scalar type mismatch");
        bytemuck::cast_slice(self.as_bytes())
    }

    /// Mutable typed view of a contiguous tensor.
    ///
    /// # Safety
    ///
    /// Same exclusivity requirement as [`Tensor::as_bytes_mut`].
    pub unsafe fn as_slice_mut<T: Scalar>(&self) -> &mut [T] {
        assert_eq!(T::DTYPE, self.dtype, "scalar type mismatch");
        bytemuck::cast_slice_mut(self.as_bytes_mut())
    }

    /// Overwrites a contiguous tensor's elements from `values`.
    pub fn copy_from_slice<T: Scalar>(&self, values: &[T]) {
        assert_eq!(T::DTYPE, self.dtype, "scalar type mismatch");
        assert_eq!(values.len(), self.numel(), "element count mismatch");
        unsafe { self.as_bytes_mut() }.copy_from_slice(bytemuck::cast_slice(values));
    }

    /// A 1-D view of `count` elements starting at `start`.
    pub fn slice_elems(&self, start: usize, count: usize) -> Tensor {
        assert!(self.is_contiguous(), "slicing a non-contiguous tensor");
        assert!(start + count <= self.numel(), "slice out of bounds");
        Tensor {
            storage: Arc::clone(&self.storage),
            dtype: self.dtype,
            sizes: vec![count],
            strides: vec![1],
            offset: self.offset + start,
        }
    }

    /// A view with two dimensions swapped.
    pub fn transpose(&self, d0: usize, d1: usize) -> Tensor {
        let mut view = self.clone();
        view.sizes.swap(d0, d1);
        view.strides.swap(d0, d1);
        view
    }

    /// This tensor if contiguous, otherwise a contiguous copy.
    pub fn contiguous(&self) -> Tensor {
        if self.is_contiguous() {
            return self.clone();
        }
        let out = Tensor::zeros(self.dtype, &self.sizes, self.device());
        out.copy_from(self, false);
        out
    }

    /// Copies `src` into this tensor. Types and element counts must match.
    ///
    /// When either side lives on an accelerator the byte copy is routed
    /// through the current stream of that device; a blocking copy
    /// synchronizes the stream before returning.
    pub fn copy_from(&self, src: &Tensor, nonblocking: bool) {
        assert_eq!(self.dtype, src.dtype, "copy between scalar types");
        assert_eq!(self.numel(), src.numel(), "copy between element counts");

        let accel = self
            .device()
            .accel_index()
            .or_else(|| src.device().accel_index());
        if let Some(index) = accel {
            assert!(
                self.is_contiguous() && src.is_contiguous(),
                "device copies require contiguous tensors"
            );
            let dst_storage = Arc::clone(&self.storage);
            let src_storage = Arc::clone(&src.storage);
            let dst_off = self.offset * self.itemsize();
            let src_off = src.offset * src.itemsize();
            let len = self.nbytes();
            let stream = accel::current_stream(index);
            stream.enqueue(move || unsafe {
                std::ptr::copy_nonoverlapping(
                    src_storage.base().add(src_off),
                    dst_storage.base().add(dst_off),
                    len,
                );
            });
            if !nonblocking {
                stream.synchronize();
            }
            return;
        }

        if self.is_contiguous() && src.is_contiguous() {
            unsafe {
                std::ptr::copy_nonoverlapping(src.data_ptr(), self.data_ptr(), self.nbytes());
            }
        } else {
            assert_eq!(self.sizes, src.sizes, "strided copy between shapes");
            self.copy_elementwise(src);
        }
    }

    fn copy_elementwise(&self, src: &Tensor) {
        let elem = self.itemsize();
        let ndim = self.sizes.len();
        let dst_base = self.storage.base();
        let src_base = src.storage.base();
        let mut index = vec![0usize; ndim];
        for _ in 0..self.numel() {
            let mut dst_off = self.offset;
            let mut src_off = src.offset;
            for d in 0..ndim {
                dst_off += index[d] * self.strides[d];
                src_off += index[d] * src.strides[d];
            }
            unsafe {
                std::ptr::copy_nonoverlapping(
                    src_base.add(src_off * elem),
                    dst_base.add(dst_off * elem),
                    elem,
                );
            }
            for d in (0..ndim).rev() {
                index[d] += 1;
                if index[d] < self.sizes[d] {
                    break;
                }
                index[d] = 0;
            }
        }
    }
}

impl fmt::Debug for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Tensor({}, {:?}, {})",
            self.dtype,
            self.sizes,
            self.device()
        )
    }
}

/// Concatenates dense same-typed tensors into one contiguous 1-D tensor.
pub fn flatten_dense_tensors(tensors: &[Tensor]) -> Tensor {
    assert!(!tensors.is_empty(), "flatten of an empty list");
    let dtype = tensors[0].dtype();
    let device = tensors[0].device();
    let total = tensors.iter().map(Tensor::numel).sum::<usize>();
    let flat = Tensor::zeros(dtype, &[total], device);
    let mut off = 0;
    for tensor in tensors {
        assert_eq!(tensor.dtype(), dtype, "flatten across scalar types");
        assert_eq!(tensor.device(), device, "flatten across devices");
        let src = tensor.contiguous();
        flat.slice_elems(off, src.numel()).copy_from(&src, false);
        off += src.numel();
    }
    flat
}

/// A zeroed contiguous tensor shaped `[N, *sizes]` matching a list of `N`
/// same-typed, same-shaped tensors.
pub fn new_like_flat(tensors: &[Tensor]) -> Tensor {
    assert!(!tensors.is_empty(), "flat allocation for an empty list");
    let first = &tensors[0];
    for tensor in tensors {
        assert_eq!(tensor.dtype(), first.dtype(), "flat allocation across scalar types");
        assert_eq!(tensor.sizes(), first.sizes(), "flat allocation across shapes");
    }
    let mut sizes = Vec::with_capacity(first.sizes().len() + 1);
    sizes.push(tensors.len());
    sizes.extend_from_slice(first.sizes());
    Tensor::zeros(first.dtype(), &sizes, first.device())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accel::{self, StreamPriority};
    use std::thread;
    use std::time::Duration;

    #[test]
    fn round_trip_and_layout() {
        let t = Tensor::from_vec(vec![1.0f32, 2.0, 3.0, 4.0, 5.0, 6.0], &[2, 3]);
        assert_eq!(t.sizes(), &[2, 3]);
        assert_eq!(t.strides(), &[3, 1]);
        assert_eq!(t.nbytes(), 24);
        assert!(t.is_contiguous());
        assert!(t.is_dense());
        assert_eq!(t.as_slice::<f32>(), &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
    }

    #[test]
    fn transpose_views_share_storage() {
        let t = Tensor::from_vec(vec![1i32, 2, 3, 4, 5, 6], &[2, 3]);
        let v = t.transpose(0, 1);
        assert_eq!(v.sizes(), &[3, 2]);
        assert!(!v.is_contiguous());

        let c = v.contiguous();
        assert_eq!(c.as_slice::<i32>(), &[1, 4, 2, 5, 3, 6]);
    }

    #[test]
    fn strided_copy_between_views() {
        let src = Tensor::from_vec(vec![1u8, 2, 3, 4], &[2, 2]).transpose(0, 1);
        let dst = Tensor::zeros(ScalarType::U8, &[2, 2], Device::Host);
        dst.copy_from(&src, false);
        assert_eq!(dst.as_slice::<u8>(), &[1, 3, 2, 4]);
    }

    #[test]
    fn flatten_concatenates_in_order() {
        let a = Tensor::from_vec(vec![1.0f64, 2.0], &[2]);
        let b = Tensor::from_vec(vec![3.0f64], &[1]);
        let flat = flatten_dense_tensors(&[a, b]);
        assert_eq!(flat.sizes(), &[3]);
        assert_eq!(flat.as_slice::<f64>(), &[1.0, 2.0, 3.0]);
    }

    #[test]
    fn like_flat_allocates_leading_dimension() {
        let tensors = vec![
            Tensor::zeros(ScalarType::I64, &[4], Device::Host),
            Tensor::zeros(ScalarType::I64, &[4], Device::Host),
            Tensor::zeros(ScalarType::I64, &[4], Device::Host),
        ];
        let flat = new_like_flat(&tensors);
        assert_eq!(flat.sizes(), &[3, 4]);
        assert_eq!(flat.dtype(), ScalarType::I64);
    }

    #[test]
    fn slice_views_window_the_flat_buffer() {
        let flat = Tensor::from_vec(vec![0i32, 1, 2, 3, 4, 5], &[6]);
        let window = flat.slice_elems(2, 3);
        assert_eq!(window.as_slice::<i32>(), &[2, 3, 4]);

        let out = Tensor::zeros(ScalarType::I32, &[3], Device::Host);
        out.copy_from(&window, false);
        assert_eq!(out.as_slice::<i32>(), &[2, 3, 4]);
    }

    #[test]
    fn pinned_mirror_is_host_and_tagged() {
        let dev = Tensor::zeros(ScalarType::F32, &[8], Device::Accel(0));
        let pinned = dev.pinned_like();
        assert_eq!(pinned.device(), Device::Host);
        assert!(pinned.is_pinned());
        assert!(!dev.is_pinned());
        assert_eq!(pinned.sizes(), dev.sizes());
    }

    #[test]
    fn nonblocking_device_copy_orders_after_stream_work() {
        let dev = Tensor::zeros(ScalarType::F32, &[2], Device::Accel(0));
        let host = Tensor::zeros(ScalarType::F32, &[2], Device::Host);

        // A slow producer on the current stream; the nonblocking copy is
        // enqueued behind it and must observe its writes.
        let producer = dev.clone();
        accel::current_stream(0).enqueue(move || {
            thread::sleep(Duration::from_millis(20));
            producer.copy_from_slice(&[4.0f32, 5.0]);
        });
        host.copy_from(&dev, true);
        accel::current_stream(0).synchronize();
        assert_eq!(host.as_slice::<f32>(), &[4.0, 5.0]);
    }

    #[test]
    fn pooled_streams_cycle_and_copy_blocking() {
        let s1 = accel::stream_from_pool(2, StreamPriority::High);
        let _s2 = accel::stream_from_pool(2, StreamPriority::High);
        let guard = accel::StreamGuard::new(&s1);
        let dev = Tensor::from_vec_on(vec![9i64, 8], &[2], Device::Accel(2));
        let host = Tensor::zeros(ScalarType::I64, &[2], Device::Host);
        host.copy_from(&dev, false);
        drop(guard);
        assert_eq!(host.as_slice::<i64>(), &[9, 8]);
    }
}
