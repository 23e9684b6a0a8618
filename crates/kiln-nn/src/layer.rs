// Layer: the contract every operator in a net implements
//
// A layer reads its bottom tensors, writes its top tensors, and owns zero or
// more learnable parameter tensors. All of them live in the net's
// TensorArena and are passed to the layer as TensorIds, so a layer never
// owns its activations and two layers can share a parameter by holding the
// same id.
//
// LIFECYCLE:
//
//   construct (registry) -> setup (once) -> { reshape, forward, backward }*
//
// setup() checks the bottom/top counts against arity(), runs the layer's
// one-time layer_setup() (parameter allocation, reading its configuration),
// infers top shapes with reshape(), and writes loss weights into the diffs of
// weighted tops. forward() reshapes again, so varying input shapes are
// handled every iteration.
//
// GRADIENT CONTRACT:
//
// backward() ACCUMULATES into bottom diffs and parameter diffs. The net zeroes
// activation diffs before a backward pass and the solver zeroes parameter
// diffs once per iteration, so a tensor consumed by two layers receives the
// sum of both contributions. The exception is a layer running in place
// (bottom id == top id): there the top diff and bottom diff are one buffer
// and the layer overwrites it.
//
// HOST AND DEVICE:
//
// forward_host/backward_host are required. forward_device/backward_device are
// used when the arena mirrors to an accelerator and default to the host path.

use std::ops::RangeInclusive;

use kiln_core::{Result, TensorArena, TensorId, WithDType};

use crate::config::{LayerConfig, Phase};

/// How many bottoms and tops a layer accepts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Arity {
    pub bottom: RangeInclusive<usize>,
    pub top: RangeInclusive<usize>,
}

impl Arity {
    /// Any number of bottoms and tops.
    pub fn any() -> Self {
        Arity {
            bottom: 0..=usize::MAX,
            top: 0..=usize::MAX,
        }
    }

    /// Exactly `bottom` bottoms and `top` tops.
    pub fn exact(bottom: usize, top: usize) -> Self {
        Arity {
            bottom: bottom..=bottom,
            top: top..=top,
        }
    }

    pub fn new(bottom: RangeInclusive<usize>, top: RangeInclusive<usize>) -> Self {
        Arity { bottom, top }
    }

    /// Error unless `bottoms` and `tops` fall inside the accepted ranges.
    pub fn check(&self, layer: &str, type_name: &str, bottoms: usize, tops: usize) -> Result<()> {
        if !self.bottom.contains(&bottoms) {
            kiln_core::config_bail!(
                "{type_name} layer '{layer}' takes {} bottom blob(s), got {bottoms}",
                describe(&self.bottom)
            );
        }
        if !self.top.contains(&tops) {
            kiln_core::config_bail!(
                "{type_name} layer '{layer}' produces {} top blob(s), got {tops}",
                describe(&self.top)
            );
        }
        Ok(())
    }
}

fn describe(range: &RangeInclusive<usize>) -> String {
    match (*range.start(), *range.end()) {
        (lo, hi) if lo == hi => format!("exactly {lo}"),
        (lo, usize::MAX) => format!("at least {lo}"),
        (0, hi) => format!("at most {hi}"),
        (lo, hi) => format!("{lo} to {hi}"),
    }
}

/// A node of a net.
///
/// Implementors provide `config`, `reshape`, `forward_host`, and
/// `backward_host`, plus `layer_setup` and `params`/`params_mut` when they
/// own parameters. The provided `setup`, `forward`, and `backward` are what the
/// net calls.
pub trait Layer<T: WithDType> {
    /// The configuration the layer was built from.
    fn config(&self) -> &LayerConfig;

    /// Registry name of this layer's kind.
    fn type_name(&self) -> &str {
        self.config().kind.type_name()
    }

    fn phase(&self) -> Phase {
        self.config().phase
    }

    /// Accepted bottom/top counts.
    fn arity(&self) -> Arity {
        Arity::any()
    }

    /// One-time initialization. Layers with parameters allocate them here.
    fn layer_setup(
        &mut self,
        _arena: &mut TensorArena<T>,
        _bottom: &[TensorId],
        _top: &[TensorId],
    ) -> Result<()> {
        Ok(())
    }

    /// Shape the tops from the bottoms' shapes and the configuration.
    fn reshape(&mut self, arena: &TensorArena<T>, bottom: &[TensorId], top: &[TensorId]) -> Result<()>;

    fn forward_host(&mut self, arena: &TensorArena<T>, bottom: &[TensorId], top: &[TensorId]) -> Result<()>;

    fn backward_host(
        &mut self,
        arena: &TensorArena<T>,
        top: &[TensorId],
        propagate_down: &[bool],
        bottom: &[TensorId],
    ) -> Result<()>;

    fn forward_device(&mut self, arena: &TensorArena<T>, bottom: &[TensorId], top: &[TensorId]) -> Result<()> {
        self.forward_host(arena, bottom, top)
    }

    fn backward_device(
        &mut self,
        arena: &TensorArena<T>,
        top: &[TensorId],
        propagate_down: &[bool],
        bottom: &[TensorId],
    ) -> Result<()> {
        self.backward_host(arena, top, propagate_down, bottom)
    }

    /// Learnable parameters, in declaration order.
    fn params(&self) -> &[TensorId] {
        &[]
    }

    /// Mutable view of the parameter ids; the net rewires shared parameters
    /// through this.
    fn params_mut(&mut self) -> &mut [TensorId] {
        &mut []
    }

    /// Whether the layer produces a loss by default.
    fn is_loss(&self) -> bool {
        false
    }

    /// Whether the layer can run with a bottom and top that are one tensor.
    fn allows_in_place(&self) -> bool {
        false
    }

    /// Whether `force_backward` may request a gradient for bottom `index`.
    fn allow_force_backward(&self, _index: usize) -> bool {
        true
    }

    /// Restart the layer's random stream. Only stochastic layers care.
    fn reseed(&mut self, _seed: u64) {}

    /// Weight of top `index` in the net loss.
    fn loss_weight(&self, index: usize) -> f64 {
        match self.config().loss_weight.get(index) {
            Some(&w) => w,
            None if self.is_loss() && index == 0 => 1.0,
            None => 0.0,
        }
    }

    /// Check arity, initialize, shape the tops, and seed loss weights.
    fn setup(&mut self, arena: &mut TensorArena<T>, bottom: &[TensorId], top: &[TensorId]) -> Result<()> {
        let cfg = self.config();
        self.arity()
            .check(&cfg.name, self.type_name(), bottom.len(), top.len())?;
        if !cfg.loss_weight.is_empty() && cfg.loss_weight.len() != top.len() {
            kiln_core::config_bail!(
                "layer '{}' has {} loss weight(s) for {} top blob(s)",
                cfg.name,
                cfg.loss_weight.len(),
                top.len()
            );
        }
        self.layer_setup(arena, bottom, top)?;
        self.reshape(arena, bottom, top)?;
        for (i, &id) in top.iter().enumerate() {
            let weight = self.loss_weight(i);
            if weight != 0.0 {
                let w = T::from_f64(weight);
                arena.get(id).mutable_diff()?.iter_mut().for_each(|d| *d = w);
            }
        }
        Ok(())
    }

    /// Reshape, compute the tops, and return this layer's weighted loss.
    fn forward(&mut self, arena: &TensorArena<T>, bottom: &[TensorId], top: &[TensorId]) -> Result<T> {
        self.reshape(arena, bottom, top)?;
        if arena.accelerator().is_some() {
            self.forward_device(arena, bottom, top)?;
        } else {
            self.forward_host(arena, bottom, top)?;
        }
        let mut loss = 0.0;
        for (i, &id) in top.iter().enumerate() {
            let weight = self.loss_weight(i);
            if weight == 0.0 {
                continue;
            }
            let sum: T = arena.get(id).data()?.iter().copied().sum();
            loss += weight * sum.as_f64();
        }
        Ok(T::from_f64(loss))
    }

    /// Propagate top gradients to the bottoms flagged in `propagate_down` and
    /// to the parameters.
    fn backward(
        &mut self,
        arena: &TensorArena<T>,
        top: &[TensorId],
        propagate_down: &[bool],
        bottom: &[TensorId],
    ) -> Result<()> {
        if arena.accelerator().is_some() {
            self.backward_device(arena, top, propagate_down, bottom)
        } else {
            self.backward_host(arena, top, propagate_down, bottom)
        }
    }
}
