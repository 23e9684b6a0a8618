use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::device::{Accelerator, DeviceAlloc};
use crate::dtype::WithDType;
use crate::error::{Error, Result};
use crate::shape::{Shape, MAX_AXES};
use crate::synced::{SyncState, SyncedBuffer};

// Tensor: shaped values plus their gradients
//
// A Tensor pairs two SyncedBuffers: `data` holds values and `diff` holds the
// gradient of the loss with respect to those values. Layers read bottom data
// and write top data in forward, then read top diff and accumulate bottom diff
// in backward. Solvers write an update step into a parameter's diff and commit
// it with update() (data -= diff).
//
// CAPACITY:
//
// reshape() only reallocates when the new element count exceeds capacity.
// Shrinking keeps the buffers, so a layer whose input batch size varies pays
// for allocation once. Accessors expose the first count() elements.
//
// A default tensor has no axes and count 0. An explicit reshape to [] gives
// a scalar with count 1, which is how loss outputs are shaped.

/// Serialized form of a tensor shape.
///
/// `Legacy` is the fixed four-axis (num, channels, height, width) encoding of
/// older snapshots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShapeRecord {
    Dims(Vec<usize>),
    Legacy {
        num: usize,
        channels: usize,
        height: usize,
        width: usize,
    },
}

impl ShapeRecord {
    pub fn to_shape(&self) -> Shape {
        match self {
            ShapeRecord::Dims(d) => Shape::new(d.clone()),
            ShapeRecord::Legacy {
                num,
                channels,
                height,
                width,
            } => Shape::from((*num, *channels, *height, *width)),
        }
    }
}

/// Serialized form of a tensor: shape, values, and optionally gradients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TensorRecord {
    pub shape: ShapeRecord,
    pub data: Vec<f64>,
    #[serde(default)]
    pub diff: Vec<f64>,
}

/// A shaped container of values (`data`) and gradients (`diff`).
pub struct Tensor<T: WithDType> {
    data: SyncedBuffer<T>,
    diff: SyncedBuffer<T>,
    shape: Shape,
    count: usize,
    capacity: usize,
    accelerator: Option<Arc<dyn Accelerator>>,
}

impl<T: WithDType> Default for Tensor<T> {
    fn default() -> Self {
        Self::new_in(None)
    }
}

impl<T: WithDType> Tensor<T> {
    /// An empty host tensor (no axes, count 0).
    pub fn new() -> Self {
        Self::default()
    }

    /// An empty tensor whose buffers mirror to `accelerator` when given.
    pub fn new_in(accelerator: Option<Arc<dyn Accelerator>>) -> Self {
        Tensor {
            data: SyncedBuffer::new(0, accelerator.clone()),
            diff: SyncedBuffer::new(0, accelerator.clone()),
            shape: Shape::default(),
            count: 0,
            capacity: 0,
            accelerator,
        }
    }

    /// A zero-filled host tensor of the given shape.
    pub fn with_shape(shape: impl Into<Shape>) -> Self {
        let mut t = Self::new();
        t.reshape(shape);
        t
    }

    /// A host tensor adopting `data` as its values.
    pub fn from_vec(data: Vec<T>, shape: impl Into<Shape>) -> Result<Self> {
        let mut t = Self::with_shape(shape);
        t.set_data(data)?;
        Ok(t)
    }

    // Shape

    /// Change the shape, growing capacity only when needed.
    ///
    /// Panics if the shape has more than [`MAX_AXES`] axes.
    pub fn reshape(&mut self, shape: impl Into<Shape>) {
        let shape = shape.into();
        assert!(
            shape.rank() <= MAX_AXES,
            "tensor shape {shape} has {} axes, maximum is {MAX_AXES}",
            shape.rank()
        );
        self.count = shape.elem_count();
        self.shape = shape;
        if self.count > self.capacity {
            self.capacity = self.count;
            self.data = SyncedBuffer::new(self.capacity, self.accelerator.clone());
            self.diff = SyncedBuffer::new(self.capacity, self.accelerator.clone());
        }
    }

    pub fn reshape_like(&mut self, other: &Tensor<T>) {
        self.reshape(other.shape.clone());
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn dims(&self) -> &[usize] {
        self.shape.dims()
    }

    pub fn num_axes(&self) -> usize {
        self.shape.rank()
    }

    /// Size of axis `index`, which may be negative.
    pub fn shape_at(&self, index: isize) -> usize {
        self.shape.dims()[self.canonical_axis_index(index)]
    }

    /// Total number of elements.
    pub fn count(&self) -> usize {
        self.count
    }

    /// Product of axis sizes in `[start, end)`. Panics on an invalid range.
    pub fn count_range(&self, start: usize, end: usize) -> usize {
        self.shape.count_range(start, end)
    }

    /// Product of axis sizes from `start` to the last axis.
    pub fn count_from(&self, start: usize) -> usize {
        self.shape.count_range(start, self.num_axes())
    }

    /// Elements reserved in each buffer. Never decreases.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Resolve a possibly negative axis index into `[0, num_axes)`. Panics when
    /// out of range.
    pub fn canonical_axis_index(&self, axis: isize) -> usize {
        self.shape.canonical_axis(axis)
    }

    /// Axis size under the four-axis convention, where missing axes are 1.
    ///
    /// Only valid for tensors with at most four axes; `index` is in `[-4, 4)`.
    pub fn legacy_shape(&self, index: isize) -> usize {
        assert!(
            self.num_axes() <= 4,
            "legacy accessors require at most 4 axes, tensor has {}",
            self.num_axes()
        );
        assert!((-4..4).contains(&index), "legacy axis {index} out of [-4, 4)");
        let rank = self.num_axes() as isize;
        if index >= rank || index < -rank {
            return 1;
        }
        self.shape_at(index)
    }

    pub fn num(&self) -> usize {
        self.legacy_shape(0)
    }

    pub fn channels(&self) -> usize {
        self.legacy_shape(1)
    }

    pub fn height(&self) -> usize {
        self.legacy_shape(2)
    }

    pub fn width(&self) -> usize {
        self.legacy_shape(3)
    }

    /// Flat row-major offset of a (possibly partial) index.
    pub fn offset(&self, indices: &[usize]) -> usize {
        assert!(
            indices.len() <= self.num_axes(),
            "offset: {} indices for {} axes",
            indices.len(),
            self.num_axes()
        );
        let mut offset = 0;
        for (axis, &dim) in self.dims().iter().enumerate() {
            offset *= dim;
            if let Some(&i) = indices.get(axis) {
                assert!(i < dim, "offset: index {i} out of range for axis {axis} of size {dim}");
                offset += i;
            }
        }
        offset
    }

    /// Render the shape as `"d0 d1 ... (count)"`.
    pub fn shape_string(&self) -> String {
        let mut s = String::new();
        for d in self.dims() {
            s.push_str(&d.to_string());
            s.push(' ');
        }
        s.push_str(&format!("({})", self.count));
        s
    }

    /// Structural comparison against a serialized shape.
    pub fn shape_equals(&self, other: &ShapeRecord) -> bool {
        match other {
            ShapeRecord::Dims(dims) => self.dims() == dims.as_slice(),
            ShapeRecord::Legacy {
                num,
                channels,
                height,
                width,
            } => {
                self.num_axes() <= 4
                    && self.legacy_shape(-4) == *num
                    && self.legacy_shape(-3) == *channels
                    && self.legacy_shape(-2) == *height
                    && self.legacy_shape(-1) == *width
            }
        }
    }

    // Buffers

    pub fn data_state(&self) -> SyncState {
        self.data.state()
    }

    pub fn diff_state(&self) -> SyncState {
        self.diff.state()
    }

    pub fn accelerator(&self) -> Option<&Arc<dyn Accelerator>> {
        self.accelerator.as_ref()
    }

    pub fn data(&mut self) -> Result<&[T]> {
        let count = self.count;
        Ok(&self.data.host_data()?[..count])
    }

    pub fn mutable_data(&mut self) -> Result<&mut [T]> {
        let count = self.count;
        Ok(&mut self.data.mutable_host_data()?[..count])
    }

    pub fn diff(&mut self) -> Result<&[T]> {
        let count = self.count;
        Ok(&self.diff.host_data()?[..count])
    }

    pub fn mutable_diff(&mut self) -> Result<&mut [T]> {
        let count = self.count;
        Ok(&mut self.diff.mutable_host_data()?[..count])
    }

    pub fn data_and_diff(&mut self) -> Result<(&[T], &[T])> {
        let count = self.count;
        let data = self.data.host_data()?;
        let diff = self.diff.host_data()?;
        Ok((&data[..count], &diff[..count]))
    }

    /// Values for reading alongside writable gradients.
    pub fn data_and_mutable_diff(&mut self) -> Result<(&[T], &mut [T])> {
        let count = self.count;
        let data = self.data.host_data()?;
        let diff = self.diff.mutable_host_data()?;
        Ok((&data[..count], &mut diff[..count]))
    }

    /// Writable values alongside gradients for reading.
    pub fn mutable_data_and_diff(&mut self) -> Result<(&mut [T], &[T])> {
        let count = self.count;
        let diff = self.diff.host_data()?;
        let data = self.data.mutable_host_data()?;
        Ok((&mut data[..count], &diff[..count]))
    }

    pub fn device_data(&mut self) -> Result<&DeviceAlloc> {
        self.data.device_data()
    }

    pub fn mutable_device_data(&mut self) -> Result<&DeviceAlloc> {
        self.data.mutable_device_data()
    }

    pub fn device_diff(&mut self) -> Result<&DeviceAlloc> {
        self.diff.device_data()
    }

    pub fn mutable_device_diff(&mut self) -> Result<&DeviceAlloc> {
        self.diff.mutable_device_data()
    }

    /// Replace the values with `data`, which must hold exactly `count()` elements.
    ///
    /// When the tensor is at capacity the vector is adopted without copying.
    pub fn set_data(&mut self, data: Vec<T>) -> Result<()> {
        if data.len() != self.count {
            return Err(Error::BufferSize {
                expected: self.count,
                got: data.len(),
            });
        }
        if self.count == self.capacity {
            self.data.set_host_data(data)
        } else {
            self.mutable_data()?.copy_from_slice(&data);
            Ok(())
        }
    }

    // Arithmetic

    /// `data -= diff`, the primitive solvers use to commit an update step.
    ///
    /// Fails when the data was never written.
    pub fn update(&mut self) -> Result<()> {
        if self.data.state() == SyncState::Uninitialized {
            return Err(Error::msg(format!(
                "cannot update tensor {}: data is not initialized",
                self.shape_string()
            )));
        }
        let (data, diff) = self.mutable_data_and_diff()?;
        for (d, g) in data.iter_mut().zip(diff) {
            *d -= *g;
        }
        Ok(())
    }

    /// Sum of absolute values of `data`.
    pub fn asum_data(&mut self) -> Result<T> {
        Ok(self.data()?.iter().map(|v| v.abs()).sum())
    }

    pub fn asum_diff(&mut self) -> Result<T> {
        Ok(self.diff()?.iter().map(|v| v.abs()).sum())
    }

    /// Sum of squares of `data`.
    pub fn sumsq_data(&mut self) -> Result<T> {
        Ok(self.data()?.iter().map(|&v| v * v).sum())
    }

    pub fn sumsq_diff(&mut self) -> Result<T> {
        Ok(self.diff()?.iter().map(|&v| v * v).sum())
    }

    pub fn scale_data(&mut self, factor: T) -> Result<()> {
        self.mutable_data()?.iter_mut().for_each(|v| *v *= factor);
        Ok(())
    }

    pub fn scale_diff(&mut self, factor: T) -> Result<()> {
        self.mutable_diff()?.iter_mut().for_each(|v| *v *= factor);
        Ok(())
    }

    /// Copy values (or gradients, when `copy_diff`) from `source`.
    ///
    /// A shape mismatch is an error unless `reshape` is set.
    pub fn copy_from(&mut self, source: &mut Tensor<T>, copy_diff: bool, reshape: bool) -> Result<()> {
        if source.count != self.count || source.shape != self.shape {
            if reshape {
                self.reshape_like(source);
            } else {
                return Err(Error::ShapeMismatch {
                    expected: self.shape.clone(),
                    got: source.shape.clone(),
                });
            }
        }
        if copy_diff {
            self.mutable_diff()?.copy_from_slice(source.diff()?);
        } else {
            self.mutable_data()?.copy_from_slice(source.data()?);
        }
        Ok(())
    }

    // Records

    pub fn to_record(&mut self, write_diff: bool) -> Result<TensorRecord> {
        let shape = ShapeRecord::Dims(self.dims().to_vec());
        let data = self.data()?.iter().map(|v| v.as_f64()).collect();
        let diff = if write_diff {
            self.diff()?.iter().map(|v| v.as_f64()).collect()
        } else {
            Vec::new()
        };
        Ok(TensorRecord { shape, data, diff })
    }

    /// Check that `record` can be loaded into this tensor as it is shaped now.
    pub fn check_record(&self, record: &TensorRecord) -> Result<()> {
        if !self.shape_equals(&record.shape) {
            return Err(Error::ShapeMismatch {
                expected: self.shape.clone(),
                got: record.shape.to_shape(),
            });
        }
        let diff_len = if record.diff.is_empty() { self.count } else { record.diff.len() };
        for got in [record.data.len(), diff_len] {
            if got != self.count {
                return Err(Error::BufferSize {
                    expected: self.count,
                    got,
                });
            }
        }
        Ok(())
    }

    /// Load values (and gradients, when present) from a record.
    ///
    /// Without `reshape` the record's shape must match this tensor's.
    /// Nothing is written when the record is rejected.
    pub fn from_record(&mut self, record: &TensorRecord, reshape: bool) -> Result<()> {
        if reshape {
            self.reshape(record.shape.to_shape());
        }
        self.check_record(record)?;
        for (d, &v) in self.mutable_data()?.iter_mut().zip(&record.data) {
            *d = T::from_f64(v);
        }
        if !record.diff.is_empty() {
            for (d, &v) in self.mutable_diff()?.iter_mut().zip(&record.diff) {
                *d = T::from_f64(v);
            }
        }
        Ok(())
    }
}

impl<T: WithDType> fmt::Debug for Tensor<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tensor")
            .field("shape", &self.shape)
            .field("capacity", &self.capacity)
            .field("dtype", &T::DTYPE)
            .field("data", &self.data.state())
            .field("diff", &self.diff.state())
            .finish()
    }
}
