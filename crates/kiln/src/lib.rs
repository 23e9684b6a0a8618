//! # kiln
//!
//! Layer-graph networks trained by gradient-based solvers.
//!
//! This is the top-level facade crate that re-exports everything you need.
//!
//! ## Usage
//!
//! ```rust
//! use kiln::prelude::*;
//! ```
//!
//! ## Architecture
//!
//! | Crate | Purpose |
//! |-------|----------|
//! | `kiln-core` | SyncedBuffer, Tensor, TensorArena, Context, accelerator trait, errors |
//! | `kiln-nn` | Layer contract, configuration records, registry, built-in layers, gradient checker |
//! | `kiln` | Net executor, Solver and update rules, snapshots |
//!
//! ## Modules
//!
//! - [`net`]: builds a net from a [`NetConfig`] and runs forward / backward
//! - [`solver`]: SGD, Nesterov, AdaGrad, RMSProp, AdaDelta, Adam; learning-rate policies
//! - [`snapshot`]: model and solver-state files

/// Re-export core types.
pub use kiln_core::{
    Accelerator, Context, DType, Error, Result, Shape, ShapeRecord, SimulatedDevice, SyncState,
    SyncedBuffer, Tensor, TensorArena, TensorId, TensorRecord, WithDType,
};

/// Re-export layers and configuration records.
pub mod nn {
    pub use kiln_nn::*;
}

pub use kiln_nn::{LayerConfig, LayerKind, NetConfig, Phase};

/// Net: a topologically ordered graph of layers.
pub mod net;

/// Solver: gradient-based optimization of a net.
pub mod solver;

/// Snapshot: persist parameters and solver state.
pub mod snapshot;

pub use net::{LayerRecord, Net, NetRecord};
pub use solver::{Solver, SolverAction, SolverCallback, SolverConfig, SolverKind, SolverState};

/// Prelude: import this for the most common types.
pub mod prelude {
    pub use crate::net::{Net, NetRecord};
    pub use crate::nn::{
        FillerConfig, GradientChecker, InnerProductParams, Layer, LayerConfig, LayerKind,
        LayerRegistry, MemoryDataParams, NetConfig, ParamSpec, Phase,
    };
    pub use crate::solver::{
        LrPolicy, Regularization, SnapshotFormat, Solver, SolverAction, SolverCallback,
        SolverConfig, SolverKind,
    };
    pub use crate::{Context, Error, Result, Shape, Tensor, TensorArena, TensorId, WithDType};
}
