//! # kiln-nn
//!
//! Layers for kiln nets.
//!
//! Provides the pieces a net is assembled from:
//!
//! 1. **Configuration**: [`LayerConfig`], [`LayerKind`], [`NetConfig`], serde-backed
//! 2. **Layer trait**: setup, reshape, forward, backward over a [`TensorArena`]
//! 3. **Registry**: type name to constructor, extensible with user layers
//! 4. **Built-in layers**: data, inner product, losses, neurons, dropout, slice, concat
//! 5. **Fillers**: constant, uniform, gaussian, xavier, msra
//! 6. **Gradient checker**: central differences against backward()
//!
//! Layers are generic over the element type (`f32` or `f64`), and never own
//! their tensors: bottoms, tops, and parameters are ids into the net's arena.
//!
//! [`TensorArena`]: kiln_core::TensorArena

pub mod concat;
pub mod config;
pub mod data;
pub mod dropout;
pub mod filler;
pub mod gradient_check;
pub mod inner_product;
pub mod layer;
pub mod loss;
pub mod neuron;
pub mod registry;
pub mod slice;

pub use concat::Concat;
pub use config::{
    ClipParams, ConcatParams, DropoutParams, ExpParams, FillerConfig, InnerProductParams,
    InputParams, LayerConfig, LayerKind, LogParams, LossNormalization, MemoryDataParams,
    NetConfig, ParamSpec, Phase, PowerParams, ReluParams, SliceParams, SoftmaxLossParams,
    VarianceNorm,
};
pub use data::{Input, MemoryData};
pub use dropout::Dropout;
pub use gradient_check::{GradientChecker, GradientMismatch};
pub use inner_product::InnerProduct;
pub use layer::{Arity, Layer};
pub use loss::{EuclideanLoss, SoftmaxWithLoss};
pub use neuron::{NeuronFn, NeuronLayer};
pub use registry::{LayerCreator, LayerRegistry};
pub use slice::Slice;
