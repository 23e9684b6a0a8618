use std::fmt;

use serde::{Deserialize, Serialize};

// Shape: ordered axis sizes of a tensor
//
//   Scalar: Shape([])            0 axes, 1 element
//   Vector: Shape([5])           1 axis, 5 elements
//   Batch:  Shape([2, 3, 4, 4])  4 axes, 96 elements (num, channels, height, width)
//
// Layers reason about shapes through axis ranges: an inner product over
// axis 1 of [N, C, H, W] treats the input as an [N, C*H*W] matrix, which is
// count_range(0, 1) x count_range(1, 4). Negative axes count from the end and
// are resolved by canonical_axis. Both are precondition checks: a bad axis is
// a wiring bug, so they panic rather than return an error.

/// Maximum number of axes a tensor may have.
pub const MAX_AXES: usize = 32;

/// N-dimensional shape of a tensor.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Shape(Vec<usize>);

impl Shape {
    /// Create a new shape from a vector of dimension sizes.
    pub fn new(dims: Vec<usize>) -> Self {
        Shape(dims)
    }

    /// The dimension sizes as a slice.
    pub fn dims(&self) -> &[usize] {
        &self.0
    }

    /// Number of axes (0 for scalar, 1 for vector, 2 for matrix, etc.).
    pub fn rank(&self) -> usize {
        self.0.len()
    }

    /// Total number of elements (product of all dimensions).
    /// A scalar shape [] has 1 element. Panics if the product overflows usize.
    pub fn elem_count(&self) -> usize {
        self.0.iter().fold(1usize, |acc, &d| {
            acc.checked_mul(d)
                .unwrap_or_else(|| panic!("element count of shape {self} overflows usize"))
        })
    }

    /// Product of the axis sizes in `[start, end)`.
    ///
    /// Panics if `start > end` or `end > rank`.
    pub fn count_range(&self, start: usize, end: usize) -> usize {
        assert!(start <= end, "count_range: start axis {start} > end axis {end}");
        assert!(
            end <= self.rank(),
            "count_range: end axis {end} out of range for {} axes",
            self.rank()
        );
        self.0[start..end].iter().product()
    }

    /// Resolve a possibly negative axis index into `[0, rank)`.
    ///
    /// Panics if the index falls outside `[-rank, rank)`.
    pub fn canonical_axis(&self, axis: isize) -> usize {
        let rank = self.rank() as isize;
        assert!(
            axis >= -rank && axis < rank,
            "axis {axis} out of range for {rank}-D shape {self}"
        );
        if axis < 0 {
            (axis + rank) as usize
        } else {
            axis as usize
        }
    }

    /// Copy of this shape with axis `axis` set to `size`.
    pub fn with_dim(&self, axis: usize, size: usize) -> Shape {
        let mut dims = self.0.clone();
        dims[axis] = size;
        Shape(dims)
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let dims: Vec<String> = self.0.iter().map(usize::to_string).collect();
        write!(f, "[{}]", dims.join(", "))
    }
}

// Convenient From implementations
// These let you write: Tensor::with_shape((4, 3)) instead of Shape::new(vec![4, 3])

impl From<()> for Shape {
    /// Scalar shape (0 dimensions).
    fn from(_: ()) -> Self {
        Shape(vec![])
    }
}

impl From<usize> for Shape {
    /// 1-D shape.
    fn from(d: usize) -> Self {
        Shape(vec![d])
    }
}

impl From<(usize, usize)> for Shape {
    fn from((d0, d1): (usize, usize)) -> Self {
        Shape(vec![d0, d1])
    }
}

impl From<(usize, usize, usize)> for Shape {
    fn from((d0, d1, d2): (usize, usize, usize)) -> Self {
        Shape(vec![d0, d1, d2])
    }
}

impl From<(usize, usize, usize, usize)> for Shape {
    fn from((d0, d1, d2, d3): (usize, usize, usize, usize)) -> Self {
        Shape(vec![d0, d1, d2, d3])
    }
}

impl From<Vec<usize>> for Shape {
    fn from(v: Vec<usize>) -> Self {
        Shape(v)
    }
}

impl From<&[usize]> for Shape {
    fn from(s: &[usize]) -> Self {
        Shape(s.to_vec())
    }
}

impl From<&Shape> for Shape {
    fn from(s: &Shape) -> Self {
        s.clone()
    }
}
