// Dropout: regularization via random zeroing
//
// In the Train phase each element is kept with probability 1 - ratio and the
// kept elements are scaled by 1/(1 - ratio), so the expected output equals the
// input. The mask drawn in forward is reused by backward. In the Test phase
// the layer is the identity.
//
// The layer owns a StdRng forked from the Context at construction. reseed()
// restarts it, which lets the gradient checker draw the same mask on every
// forward pass.

use rand::distributions::{Bernoulli, Distribution};
use rand::rngs::StdRng;
use rand::SeedableRng;

use kiln_core::{Error, Result, TensorArena, TensorId, WithDType};

use crate::config::{LayerConfig, LayerKind, Phase};
use crate::layer::{Arity, Layer};

/// Randomly zeros elements during training.
pub struct Dropout {
    config: LayerConfig,
    ratio: f64,
    keep: Bernoulli,
    /// Kept elements of the last forward pass.
    mask: Vec<bool>,
    rng: StdRng,
}

impl Dropout {
    pub fn new(config: LayerConfig, rng: StdRng) -> Result<Self> {
        let ratio = match &config.kind {
            LayerKind::Dropout(p) => p.ratio,
            _ => return Err(config.kind_mismatch("Dropout")),
        };
        if !(0.0..1.0).contains(&ratio) {
            kiln_core::config_bail!(
                "Dropout layer '{}' needs a ratio in [0, 1), got {ratio}",
                config.name
            );
        }
        let keep = Bernoulli::new(1.0 - ratio).map_err(|e| Error::Config(e.to_string()))?;
        Ok(Dropout {
            config,
            ratio,
            keep,
            mask: Vec::new(),
            rng,
        })
    }

    pub fn ratio(&self) -> f64 {
        self.ratio
    }

    fn scale(&self) -> f64 {
        1.0 / (1.0 - self.ratio)
    }

    /// Kept elements of the last forward pass.
    pub fn mask(&self) -> &[bool] {
        &self.mask
    }
}

impl<T: WithDType> Layer<T> for Dropout {
    fn config(&self) -> &LayerConfig {
        &self.config
    }

    fn arity(&self) -> Arity {
        Arity::exact(1, 1)
    }

    fn allows_in_place(&self) -> bool {
        true
    }

    fn reseed(&mut self, seed: u64) {
        self.rng = StdRng::seed_from_u64(seed);
    }

    fn reshape(&mut self, arena: &TensorArena<T>, bottom: &[TensorId], top: &[TensorId]) -> Result<()> {
        if bottom[0] != top[0] {
            let shape = arena.get(bottom[0]).shape().clone();
            arena.get(top[0]).reshape(shape);
        }
        Ok(())
    }

    fn forward_host(&mut self, arena: &TensorArena<T>, bottom: &[TensorId], top: &[TensorId]) -> Result<()> {
        let train = self.config.phase == Phase::Train;
        if train {
            let count = arena.get(bottom[0]).count();
            let keep = self.keep;
            let rng = &mut self.rng;
            self.mask.clear();
            self.mask.extend((0..count).map(|_| keep.sample(rng)));
        }
        let scale = T::from_f64(self.scale());
        let mask = &self.mask;
        let apply = |y: &mut T, x: T, i: usize| {
            *y = if !train {
                x
            } else if mask[i] {
                x * scale
            } else {
                T::zero()
            };
        };
        if bottom[0] == top[0] {
            let mut t = arena.get(top[0]);
            for (i, v) in t.mutable_data()?.iter_mut().enumerate() {
                let x = *v;
                apply(v, x, i);
            }
        } else {
            let mut b = arena.get(bottom[0]);
            let mut t = arena.get(top[0]);
            for (i, (y, &x)) in t.mutable_data()?.iter_mut().zip(b.data()?).enumerate() {
                apply(y, x, i);
            }
        }
        Ok(())
    }

    fn backward_host(
        &mut self,
        arena: &TensorArena<T>,
        top: &[TensorId],
        propagate_down: &[bool],
        bottom: &[TensorId],
    ) -> Result<()> {
        if !propagate_down[0] {
            return Ok(());
        }
        let train = self.config.phase == Phase::Train;
        let scale = T::from_f64(self.scale());
        let grad = |dy: T, i: usize| {
            if !train {
                dy
            } else if self.mask[i] {
                dy * scale
            } else {
                T::zero()
            }
        };
        if bottom[0] == top[0] {
            let mut t = arena.get(top[0]);
            for (i, d) in t.mutable_diff()?.iter_mut().enumerate() {
                *d = grad(*d, i);
            }
        } else {
            let mut t = arena.get(top[0]);
            let mut b = arena.get(bottom[0]);
            for (i, (dx, &dy)) in b.mutable_diff()?.iter_mut().zip(t.diff()?).enumerate() {
                *dx += grad(dy, i);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DropoutParams;
    use kiln_core::Tensor;

    fn dropout(ratio: f64, phase: Phase, seed: u64) -> Result<Dropout> {
        let cfg = LayerConfig::new("drop", LayerKind::Dropout(DropoutParams { ratio })).with_phase(phase);
        Dropout::new(cfg, StdRng::seed_from_u64(seed))
    }

    #[test]
    fn test_drop_rate_within_bounds() -> Result<()> {
        let n = 10000;
        let ratio = 0.5;
        let mut arena = TensorArena::<f32>::host();
        let b = arena.insert(Tensor::from_vec(vec![1.0f32; n], n)?);
        let t = arena.alloc();
        let mut layer = dropout(ratio, Phase::Train, 1701)?;
        Layer::<f32>::setup(&mut layer, &mut arena, &[b], &[t])?;
        Layer::<f32>::forward(&mut layer, &arena, &[b], &[t])?;

        let out = arena.get(t).data()?.to_vec();
        let dropped = out.iter().filter(|&&v| v == 0.0).count() as f64;
        assert!(out.iter().all(|&v| v == 0.0 || v == 2.0));
        let std_err = (ratio * (1.0 - ratio) / n as f64).sqrt();
        let observed = dropped / n as f64;
        assert!(
            (observed - ratio).abs() <= 1.96 * std_err,
            "observed drop rate {observed}"
        );
        Ok(())
    }

    #[test]
    fn test_test_phase_is_identity() -> Result<()> {
        let mut arena = TensorArena::<f64>::host();
        let b = arena.insert(Tensor::from_vec(vec![1.0, -2.0, 3.0], 3)?);
        let t = arena.alloc();
        let mut layer = dropout(0.9, Phase::Test, 1)?;
        Layer::<f64>::setup(&mut layer, &mut arena, &[b], &[t])?;
        Layer::<f64>::forward(&mut layer, &arena, &[b], &[t])?;
        assert_eq!(arena.get(t).data()?, &[1.0, -2.0, 3.0]);
        arena.get(t).mutable_diff()?.copy_from_slice(&[1.0, 1.0, 1.0]);
        Layer::<f64>::backward(&mut layer, &arena, &[t], &[true], &[b])?;
        assert_eq!(arena.get(b).diff()?, &[1.0, 1.0, 1.0]);
        Ok(())
    }

    #[test]
    fn test_backward_uses_forward_mask() -> Result<()> {
        let n = 64;
        let mut arena = TensorArena::<f64>::host();
        let b = arena.insert(Tensor::from_vec(vec![1.0; n], n)?);
        let t = arena.alloc();
        let mut layer = dropout(0.25, Phase::Train, 7)?;
        Layer::<f64>::setup(&mut layer, &mut arena, &[b], &[t])?;
        Layer::<f64>::forward(&mut layer, &arena, &[b], &[t])?;
        arena.get(t).mutable_diff()?.iter_mut().for_each(|d| *d = 1.0);
        Layer::<f64>::backward(&mut layer, &arena, &[t], &[true], &[b])?;
        let y = arena.get(t).data()?.to_vec();
        let dx = arena.get(b).diff()?.to_vec();
        assert_eq!(y, dx);
        Ok(())
    }

    #[test]
    fn test_reseed_repeats_mask() -> Result<()> {
        let n = 32;
        let mut arena = TensorArena::<f64>::host();
        let b = arena.insert(Tensor::from_vec(vec![1.0; n], n)?);
        let t = arena.alloc();
        let mut layer = dropout(0.5, Phase::Train, 3)?;
        Layer::<f64>::setup(&mut layer, &mut arena, &[b], &[t])?;
        Layer::<f64>::reseed(&mut layer, 11);
        Layer::<f64>::forward(&mut layer, &arena, &[b], &[t])?;
        let first = layer.mask().to_vec();
        Layer::<f64>::reseed(&mut layer, 11);
        Layer::<f64>::forward(&mut layer, &arena, &[b], &[t])?;
        assert_eq!(first, layer.mask());
        Ok(())
    }

    #[test]
    fn test_ratio_out_of_range() {
        assert!(matches!(dropout(1.0, Phase::Train, 0), Err(Error::Config(_))));
    }
}
