//! The tensor type: a shaped, typed N-dimensional array owning paired
//! value ("data") and gradient ("diff") synced buffers.

use std::sync::Arc;

use smallvec::SmallVec;

use karst_kernels::cpu::blas;

use crate::device::Device;
use crate::dtype::Numeric;
use crate::error::{Error, Result};
use crate::syncedmem::{SyncHead, SyncedMemory};
use crate::vptr::VPtr;

/// Maximum tensor rank.
pub const MAX_BLOB_AXES: usize = 32;

/// Flat value/gradient arrays in single or double precision, the width
/// the serialization layer hands over.
#[derive(Debug, Clone, PartialEq)]
pub enum BlobData {
    Single(Vec<f32>),
    Double(Vec<f64>),
}

impl BlobData {
    pub fn len(&self) -> usize {
        match self {
            BlobData::Single(v) => v.len(),
            BlobData::Double(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn to_f64_iter(&self) -> Box<dyn Iterator<Item = f64> + '_> {
        match self {
            BlobData::Single(v) => Box::new(v.iter().map(|&x| x as f64)),
            BlobData::Double(v) => Box::new(v.iter().copied()),
        }
    }
}

/// Exchange form of a blob: shape plus flat arrays. The equivalent of
/// the serialization layer's wire record, minus the wire format.
#[derive(Debug, Clone)]
pub struct BlobDesc {
    pub shape: Vec<usize>,
    pub data: BlobData,
    pub diff: Option<BlobData>,
}

impl BlobDesc {
    /// Legacy 4-tuple shape (num, channels, height, width).
    pub fn legacy_4d(num: usize, channels: usize, height: usize, width: usize, data: BlobData) -> Self {
        Self {
            shape: vec![num, channels, height, width],
            data,
            diff: None,
        }
    }
}

/// A shaped, typed tensor on one device.
///
/// Reshape never shrinks the underlying allocation: `capacity` tracks
/// the largest element count ever allocated and only grows. Data and
/// diff buffers can be shared between blobs to alias storage across
/// layer boundaries.
pub struct Blob<T: Numeric> {
    shape: SmallVec<[usize; 8]>,
    count: usize,
    capacity: usize,
    device: Arc<Device>,
    data: Arc<SyncedMemory>,
    diff: Arc<SyncedMemory>,
    shape_data: Option<SyncedMemory>,
    _marker: std::marker::PhantomData<T>,
}

impl<T: Numeric> std::fmt::Debug for Blob<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Blob")
            .field("shape", &self.shape.as_slice())
            .field("count", &self.count)
            .field("capacity", &self.capacity)
            .finish()
    }
}

impl<T: Numeric> Blob<T> {
    /// A blob of the given shape, allocated on `device`.
    pub fn new(device: &Arc<Device>, shape: &[usize]) -> Result<Self> {
        let mut blob = Self {
            shape: SmallVec::new(),
            count: 0,
            capacity: 0,
            device: Arc::clone(device),
            data: Arc::new(SyncedMemory::new(Arc::clone(device), 0)),
            diff: Arc::new(SyncedMemory::new(Arc::clone(device), 0)),
            shape_data: None,
            _marker: std::marker::PhantomData,
        };
        blob.reshape(shape)?;
        Ok(blob)
    }

    /// Legacy 4-axis constructor (num, channels, height, width).
    pub fn new_4d(
        device: &Arc<Device>,
        num: usize,
        channels: usize,
        height: usize,
        width: usize,
    ) -> Result<Self> {
        Self::new(device, &[num, channels, height, width])
    }

    /// Logically resize. Returns true when the underlying buffers were
    /// reallocated (capacity grew); existing contents are preserved
    /// otherwise. The element count must stay within the signed 32-bit
    /// index range the kernels compute with.
    pub fn reshape(&mut self, shape: &[usize]) -> Result<bool> {
        if shape.len() > MAX_BLOB_AXES {
            return Err(Error::InvalidShape(format!(
                "{} axes exceed the {MAX_BLOB_AXES}-axis limit",
                shape.len()
            )));
        }
        let mut count: i64 = 1;
        for &dim in shape {
            if dim as i64 > i32::MAX as i64 / count.max(1) {
                return Err(Error::CountOverflow(shape.to_vec()));
            }
            count *= dim as i64;
        }
        let count = count as usize;

        self.shape = SmallVec::from_slice(shape);
        self.count = count;
        self.sync_shape_buffer()?;

        if count > self.capacity {
            self.capacity = count;
            self.data = Arc::new(SyncedMemory::new(
                Arc::clone(&self.device),
                self.capacity * std::mem::size_of::<T>(),
            ));
            self.diff = Arc::new(SyncedMemory::new(
                Arc::clone(&self.device),
                self.capacity * std::mem::size_of::<T>(),
            ));
            return Ok(true);
        }
        Ok(false)
    }

    /// Adopt another blob's shape.
    pub fn reshape_like<U: Numeric>(&mut self, other: &Blob<U>) -> Result<bool> {
        let shape: Vec<usize> = other.shape().to_vec();
        self.reshape(&shape)
    }

    fn sync_shape_buffer(&mut self) -> Result<()> {
        let needed = self.shape.len().max(1) * std::mem::size_of::<i32>();
        let realloc = match &self.shape_data {
            Some(buf) => buf.size() < needed,
            None => true,
        };
        if realloc {
            self.shape_data = Some(SyncedMemory::new(Arc::clone(&self.device), needed));
        }
        let buf = self.shape_data.as_ref().unwrap();
        let host = buf.mutable_cpu_data()?;
        let dims = unsafe { host.slice_mut::<i32>(0, self.shape.len()) };
        for (d, &s) in dims.iter_mut().zip(self.shape.iter()) {
            *d = s as i32;
        }
        Ok(())
    }

    // ---- shape accessors ----

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn num_axes(&self) -> usize {
        self.shape.len()
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    /// Element count over `[start, end)` axes.
    pub fn count_range(&self, start: usize, end: usize) -> usize {
        self.shape[start..end].iter().product()
    }

    /// Flat offset of a multi-dimensional index.
    pub fn offset(&self, indices: &[usize]) -> usize {
        let mut off = 0;
        for (axis, &idx) in indices.iter().enumerate() {
            off = off * self.shape[axis] + idx;
        }
        off
    }

    /// Device-resident copy of the shape as `i32` dims, for the N-D
    /// convolution kernels.
    pub fn gpu_shape(&self) -> Result<VPtr<i32>> {
        let buf = self
            .shape_data
            .as_ref()
            .expect("shape buffer exists after reshape");
        Ok(buf.gpu_data()?.cast())
    }

    // ---- element accessors ----
    //
    // Host slices borrow through the synced buffer's host allocation,
    // which stays alive as long as the blob holds the buffer (realloc
    // only happens through `&mut self` reshape).

    fn host_slice(&self, mem: &Arc<SyncedMemory>, mutable: bool) -> Result<&[T]> {
        let buf = if mutable {
            mem.mutable_cpu_data()?
        } else {
            mem.cpu_data()?
        };
        let slice = unsafe { buf.slice::<T>(0, self.count) };
        Ok(unsafe { std::slice::from_raw_parts(slice.as_ptr(), self.count) })
    }

    #[allow(clippy::mut_from_ref)]
    fn host_slice_mut(&self, mem: &Arc<SyncedMemory>) -> Result<&mut [T]> {
        let buf = mem.mutable_cpu_data()?;
        let slice = unsafe { buf.slice_mut::<T>(0, self.count) };
        Ok(unsafe { std::slice::from_raw_parts_mut(slice.as_mut_ptr(), self.count) })
    }

    /// Host view of the values, synchronized.
    pub fn cpu_data(&self) -> Result<&[T]> {
        self.host_slice(&self.data, false)
    }

    /// Mutable host view of the values; the device copy goes stale.
    pub fn mutable_cpu_data(&mut self) -> Result<&mut [T]> {
        let data = Arc::clone(&self.data);
        self.host_slice_mut(&data)
    }

    /// Host view of the gradients, synchronized.
    pub fn cpu_diff(&self) -> Result<&[T]> {
        self.host_slice(&self.diff, false)
    }

    /// Mutable host view of the gradients; the device copy goes stale.
    pub fn mutable_cpu_diff(&mut self) -> Result<&mut [T]> {
        let diff = Arc::clone(&self.diff);
        self.host_slice_mut(&diff)
    }

    /// Device view of the values, synchronized.
    pub fn gpu_data(&self) -> Result<VPtr<T>> {
        Ok(self.data.gpu_data()?.cast())
    }

    /// Mutable device view of the values; the host copy goes stale.
    pub fn mutable_gpu_data(&mut self) -> Result<VPtr<T>> {
        Ok(self.data.mutable_gpu_data()?.cast())
    }

    /// Device view of the gradients, synchronized.
    pub fn gpu_diff(&self) -> Result<VPtr<T>> {
        Ok(self.diff.gpu_data()?.cast())
    }

    /// Mutable device view of the gradients; the host copy goes stale.
    pub fn mutable_gpu_diff(&mut self) -> Result<VPtr<T>> {
        Ok(self.diff.mutable_gpu_data()?.cast())
    }

    // ---- sharing ----

    /// Alias the value buffer of `other` (reference-counted, no copy).
    pub fn share_data(&mut self, other: &Blob<T>) -> Result<()> {
        if self.count != other.count {
            return Err(Error::ShapeMismatch {
                expected: self.shape.to_vec(),
                got: other.shape.to_vec(),
            });
        }
        self.data = Arc::clone(&other.data);
        Ok(())
    }

    /// Alias the gradient buffer of `other`.
    pub fn share_diff(&mut self, other: &Blob<T>) -> Result<()> {
        if self.count != other.count {
            return Err(Error::ShapeMismatch {
                expected: self.shape.to_vec(),
                got: other.shape.to_vec(),
            });
        }
        self.diff = Arc::clone(&other.diff);
        Ok(())
    }

    // ---- numeric helpers ----

    /// data -= diff, computed on whichever side currently holds the
    /// data.
    pub fn update(&mut self) -> Result<()> {
        let n = self.count;
        match self.data.head() {
            SyncHead::HeadAtCpu => {
                let diff = Arc::clone(&self.diff);
                let diff_slice = self.host_slice(&diff, false)?;
                let data = Arc::clone(&self.data);
                let data_slice = self.host_slice_mut(&data)?;
                blas::axpy(-T::ONE, diff_slice, data_slice);
                Ok(())
            }
            SyncHead::HeadAtGpu | SyncHead::Synced => {
                let diff = self.gpu_diff()?;
                let data = self.mutable_gpu_data()?;
                self.device.axpy(n, -T::ONE, &diff, &data)
            }
            SyncHead::Uninitialized => Err(Error::Memory(
                "update on uninitialized blob data".to_string(),
            )),
        }
    }

    fn reduce_buffer(
        &self,
        mem: &Arc<SyncedMemory>,
        gpu: impl Fn(&VPtr<T>) -> Result<T>,
        host: impl Fn(&[T]) -> T,
    ) -> Result<T> {
        match mem.head() {
            SyncHead::Uninitialized => Ok(T::ZERO),
            SyncHead::HeadAtCpu => Ok(host(self.host_slice(mem, false)?)),
            SyncHead::HeadAtGpu | SyncHead::Synced => gpu(&mem.gpu_data()?.cast()),
        }
    }

    /// Sum of absolute values of the data.
    pub fn asum_data(&self) -> Result<T> {
        self.reduce_buffer(&self.data, |p| self.device.asum(self.count, p), blas::asum)
    }

    /// Sum of absolute values of the diff.
    pub fn asum_diff(&self) -> Result<T> {
        self.reduce_buffer(&self.diff, |p| self.device.asum(self.count, p), blas::asum)
    }

    /// Sum of squares of the data.
    pub fn sumsq_data(&self) -> Result<T> {
        self.reduce_buffer(
            &self.data,
            |p| self.device.dot(self.count, p, p),
            blas::sumsq,
        )
    }

    /// Sum of squares of the diff.
    pub fn sumsq_diff(&self) -> Result<T> {
        self.reduce_buffer(
            &self.diff,
            |p| self.device.dot(self.count, p, p),
            blas::sumsq,
        )
    }

    fn scale_buffer(&mut self, data_side: bool, alpha: T) -> Result<()> {
        let mem = if data_side { &self.data } else { &self.diff };
        match mem.head() {
            SyncHead::Uninitialized => Ok(()),
            SyncHead::HeadAtCpu => {
                let mem = Arc::clone(mem);
                blas::scal(alpha, self.host_slice_mut(&mem)?);
                Ok(())
            }
            SyncHead::HeadAtGpu | SyncHead::Synced => {
                let ptr: VPtr<T> = mem.mutable_gpu_data()?.cast();
                self.device.scal(self.count, alpha, &ptr)
            }
        }
    }

    /// Scale the data by `alpha`.
    pub fn scale_data(&mut self, alpha: T) -> Result<()> {
        self.scale_buffer(true, alpha)
    }

    /// Scale the diff by `alpha`.
    pub fn scale_diff(&mut self, alpha: T) -> Result<()> {
        self.scale_buffer(false, alpha)
    }

    /// Copy values (or gradients) from `src`. Shapes must match unless
    /// `reshape` permits adopting the source shape.
    pub fn copy_from(&mut self, src: &Blob<T>, copy_diff: bool, reshape: bool) -> Result<()> {
        if self.shape() != src.shape() {
            if reshape {
                self.reshape_like(src)?;
            } else {
                return Err(Error::ShapeMismatch {
                    expected: self.shape.to_vec(),
                    got: src.shape.to_vec(),
                });
            }
        }
        let n = self.count;
        if copy_diff {
            let s = src.gpu_diff()?;
            let d = self.mutable_gpu_diff()?;
            self.device.copy(n, &s, &d)
        } else {
            let s = src.gpu_data()?;
            let d = self.mutable_gpu_data()?;
            self.device.copy(n, &s, &d)
        }
    }

    // ---- flat import/export ----

    /// Build a blob from an exchange record, converting the stored
    /// width to `T`.
    pub fn from_desc(device: &Arc<Device>, desc: &BlobDesc) -> Result<Self> {
        let mut blob = Self::new(device, &desc.shape)?;
        if desc.data.len() != blob.count() {
            return Err(Error::ShapeMismatch {
                expected: vec![blob.count()],
                got: vec![desc.data.len()],
            });
        }
        for (dst, v) in blob
            .mutable_cpu_data()?
            .iter_mut()
            .zip(desc.data.to_f64_iter())
        {
            *dst = T::from_f64(v);
        }
        if let Some(diff) = &desc.diff {
            if diff.len() != blob.count() {
                return Err(Error::ShapeMismatch {
                    expected: vec![blob.count()],
                    got: vec![diff.len()],
                });
            }
            for (dst, v) in blob
                .mutable_cpu_diff()?
                .iter_mut()
                .zip(diff.to_f64_iter())
            {
                *dst = T::from_f64(v);
            }
        }
        Ok(blob)
    }

    /// Export shape and values (optionally gradients) as flat arrays in
    /// the requested width.
    pub fn to_desc(&self, double_precision: bool, include_diff: bool) -> Result<BlobDesc> {
        let pack = |slice: &[T]| {
            if double_precision {
                BlobData::Double(slice.iter().map(|v| v.to_f64()).collect())
            } else {
                BlobData::Single(slice.iter().map(|v| v.to_f64() as f32).collect())
            }
        };
        Ok(BlobDesc {
            shape: self.shape.to_vec(),
            data: pack(self.cpu_data()?),
            diff: if include_diff {
                Some(pack(self.cpu_diff()?))
            } else {
                None
            },
        })
    }
}
