use std::cell::{RefCell, RefMut};
use std::fmt;
use std::sync::Arc;

use crate::device::Accelerator;
use crate::dtype::WithDType;
use crate::tensor::Tensor;

// TensorArena: owning storage for every tensor of a net
//
// Activations and learnable parameters both live here and are referred to by
// TensorId. Two layers that share a parameter hold the same id, so sharing is
// handle equality and the gradient both layers accumulate lands in one diff.
//
// Each slot is its own RefCell, so a layer may hold its bottom, top, and
// parameter tensors at the same time as long as the ids differ. Borrowing
// one id twice at once (an in-place layer that forgets to check) panics.

/// Handle to a tensor stored in a [`TensorArena`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TensorId(usize);

impl TensorId {
    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for TensorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Arena of individually borrowable tensors.
pub struct TensorArena<T: WithDType> {
    slots: Vec<RefCell<Tensor<T>>>,
    accelerator: Option<Arc<dyn Accelerator>>,
}

impl<T: WithDType> TensorArena<T> {
    /// An arena whose new tensors mirror to `accelerator` when given.
    pub fn new(accelerator: Option<Arc<dyn Accelerator>>) -> Self {
        TensorArena {
            slots: Vec::new(),
            accelerator,
        }
    }

    pub fn host() -> Self {
        Self::new(None)
    }

    pub fn accelerator(&self) -> Option<&Arc<dyn Accelerator>> {
        self.accelerator.as_ref()
    }

    /// Allocate an empty tensor.
    pub fn alloc(&mut self) -> TensorId {
        self.insert(Tensor::new_in(self.accelerator.clone()))
    }

    /// Allocate a zero-filled tensor of the given shape.
    pub fn alloc_shaped(&mut self, shape: impl Into<crate::Shape>) -> TensorId {
        let mut t = Tensor::new_in(self.accelerator.clone());
        t.reshape(shape);
        self.insert(t)
    }

    /// Take ownership of an existing tensor.
    pub fn insert(&mut self, tensor: Tensor<T>) -> TensorId {
        self.slots.push(RefCell::new(tensor));
        TensorId(self.slots.len() - 1)
    }

    /// Borrow a tensor.
    ///
    /// Panics if `id` is not from this arena or is already borrowed.
    pub fn get(&self, id: TensorId) -> RefMut<'_, Tensor<T>> {
        match self.slots.get(id.0) {
            Some(slot) => slot
                .try_borrow_mut()
                .unwrap_or_else(|_| panic!("tensor {id} is already borrowed")),
            None => panic!("tensor {id} does not belong to this arena"),
        }
    }

    /// Replace a tensor with an empty one, freeing its buffers.
    pub fn release(&mut self, id: TensorId) {
        let empty = Tensor::new_in(self.accelerator.clone());
        *self.slots[id.0].get_mut() = empty;
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Elements reserved across all tensors (data and diff).
    pub fn reserved_elements(&mut self) -> usize {
        self.slots.iter_mut().map(|s| 2 * s.get_mut().capacity()).sum()
    }
}

impl<T: WithDType> fmt::Debug for TensorArena<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TensorArena")
            .field("len", &self.slots.len())
            .field("device", &self.accelerator.as_ref().map(|a| a.name()))
            .finish()
    }
}
