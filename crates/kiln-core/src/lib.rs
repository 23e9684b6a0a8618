//! # kiln-core
//!
//! Storage primitives for kiln.
//!
//! This crate provides:
//! - [`SyncedBuffer`]: a typed block mirrored between host and accelerator
//!   memory with a four-state freshness tag
//! - [`Tensor`]: shaped values and gradients with capacity-reusing reshape
//! - [`TensorArena`] / [`TensorId`]: owning storage addressed by handle
//! - [`Accelerator`]: the device-side backend trait, plus [`SimulatedDevice`]
//! - [`Context`]: seeded randomness and device mode, passed explicitly
//! - [`Error`] / [`Result`]: the error type shared by every kiln crate

pub mod arena;
pub mod context;
pub mod device;
pub mod dtype;
pub mod error;
pub mod shape;
pub mod synced;
pub mod tensor;

pub use arena::{TensorArena, TensorId};
pub use context::{Context, Mode};
pub use device::{Accelerator, DeviceAlloc, DeviceStats, SimulatedDevice};
pub use dtype::{DType, WithDType};
pub use error::{Error, Result};
pub use shape::{Shape, MAX_AXES};
pub use synced::{SyncState, SyncedBuffer};
pub use tensor::{ShapeRecord, Tensor, TensorRecord};
