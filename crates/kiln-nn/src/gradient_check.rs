// GradientChecker: compares backward() against central differences
//
// For an objective E over the layer's tops, the checker runs backward once to
// get analytic gradients dE/dx for every checked blob (parameters, then
// bottoms), then perturbs each element x_i by +-stepsize, reruns forward, and
// estimates
//
//   dE/dx_i ~ (E(x_i + h) - E(x_i - h)) / 2h
//
// OBJECTIVES:
//
//   whole tops:      E = 1/2 sum over all tops of top^2   (top diff = top data)
//   single element:  E = 2 * top[k][j]                    (top diff = 2 at j)
//
// The analytic and estimated values agree when
//
//   |analytic - estimated| <= threshold * max(|analytic|, |estimated|, 1)
//
// Elements within kink_range of kink are skipped, since a finite difference
// straddling a nondifferentiable point (ReLU at 0, Clip at its bounds) is
// meaningless. Stochastic layers are reseeded before every forward pass so
// each evaluation sees the same random draws.

use kiln_core::{Error, Result, TensorArena, TensorId, WithDType};

use crate::layer::Layer;

/// Finite-difference gradient checker.
#[derive(Debug, Clone)]
pub struct GradientChecker {
    pub stepsize: f64,
    pub threshold: f64,
    pub seed: u64,
    pub kink: f64,
    pub kink_range: f64,
}

/// One disagreement between backward() and the estimate.
#[derive(Debug, Clone, PartialEq)]
pub struct GradientMismatch {
    /// Index into the checked blobs: parameters first, then bottoms.
    pub blob: usize,
    pub element: usize,
    pub analytic: f64,
    pub estimated: f64,
}

/// Which part of the tops the objective is built from.
#[derive(Debug, Clone, Copy)]
enum Objective {
    AllTops,
    Element { top: usize, index: usize },
}

impl Default for GradientChecker {
    fn default() -> Self {
        GradientChecker::new(1e-2, 1e-3)
    }
}

impl GradientChecker {
    pub fn new(stepsize: f64, threshold: f64) -> Self {
        GradientChecker {
            stepsize,
            threshold,
            seed: 1701,
            kink: 0.0,
            kink_range: -1.0,
        }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Skip elements whose value lies within `range` of `kink`.
    pub fn with_kink(mut self, kink: f64, range: f64) -> Self {
        self.kink = kink;
        self.kink_range = range;
        self
    }

    /// Check against E = 1/2 sum top^2, for all bottoms or just `check_bottom`.
    pub fn check_gradient<T: WithDType>(
        &self,
        layer: &mut dyn Layer<T>,
        arena: &mut TensorArena<T>,
        bottom: &[TensorId],
        top: &[TensorId],
        check_bottom: Option<usize>,
    ) -> Result<()> {
        layer.setup(arena, bottom, top)?;
        let mismatches = self.check(layer, arena, bottom, top, check_bottom, Objective::AllTops, false)?;
        Self::report(layer, mismatches)
    }

    /// Check against every top element separately.
    pub fn check_gradient_exhaustive<T: WithDType>(
        &self,
        layer: &mut dyn Layer<T>,
        arena: &mut TensorArena<T>,
        bottom: &[TensorId],
        top: &[TensorId],
        check_bottom: Option<usize>,
    ) -> Result<()> {
        layer.setup(arena, bottom, top)?;
        let mut mismatches = Vec::new();
        for (t, &id) in top.iter().enumerate() {
            let count = arena.get(id).count();
            for index in 0..count {
                let objective = Objective::Element { top: t, index };
                mismatches.extend(self.check(layer, arena, bottom, top, check_bottom, objective, false)?);
            }
        }
        Self::report(layer, mismatches)
    }

    /// For elementwise layers: top element j depends only on bottom element j,
    /// so only that pair is perturbed.
    pub fn check_gradient_eltwise<T: WithDType>(
        &self,
        layer: &mut dyn Layer<T>,
        arena: &mut TensorArena<T>,
        bottom: &[TensorId],
        top: &[TensorId],
    ) -> Result<()> {
        layer.setup(arena, bottom, top)?;
        if !layer.params().is_empty() {
            kiln_core::bail!("elementwise gradient check of '{}' which has parameters", layer.config().name);
        }
        let mut mismatches = Vec::new();
        for (t, &id) in top.iter().enumerate() {
            let count = arena.get(id).count();
            for &b in bottom {
                if arena.get(b).count() != count {
                    kiln_core::bail!("elementwise gradient check needs equal bottom and top counts");
                }
            }
            for index in 0..count {
                let objective = Objective::Element { top: t, index };
                mismatches.extend(self.check(layer, arena, bottom, top, None, objective, true)?);
            }
        }
        Self::report(layer, mismatches)
    }

    /// Check against the single element `top[top_id][index]`.
    pub fn check_gradient_single<T: WithDType>(
        &self,
        layer: &mut dyn Layer<T>,
        arena: &mut TensorArena<T>,
        bottom: &[TensorId],
        top: &[TensorId],
        check_bottom: Option<usize>,
        top_id: usize,
        index: usize,
    ) -> Result<()> {
        layer.setup(arena, bottom, top)?;
        let objective = Objective::Element { top: top_id, index };
        let mismatches = self.check(layer, arena, bottom, top, check_bottom, objective, false)?;
        Self::report(layer, mismatches)
    }

    fn report<T: WithDType>(layer: &dyn Layer<T>, mismatches: Vec<GradientMismatch>) -> Result<()> {
        if mismatches.is_empty() {
            return Ok(());
        }
        let shown: Vec<String> = mismatches
            .iter()
            .take(8)
            .map(|m| {
                format!(
                    "blob {} element {}: analytic {} vs estimated {}",
                    m.blob, m.element, m.analytic, m.estimated
                )
            })
            .collect();
        Err(Error::Msg(format!(
            "gradient check of '{}' failed at {} element(s): {}",
            layer.config().name,
            mismatches.len(),
            shown.join("; ")
        )))
    }

    #[allow(clippy::too_many_arguments)]
    fn check<T: WithDType>(
        &self,
        layer: &mut dyn Layer<T>,
        arena: &TensorArena<T>,
        bottom: &[TensorId],
        top: &[TensorId],
        check_bottom: Option<usize>,
        objective: Objective,
        element_wise: bool,
    ) -> Result<Vec<GradientMismatch>> {
        let mut blobs: Vec<TensorId> = if element_wise {
            Vec::new()
        } else {
            layer.params().to_vec()
        };
        let mut propagate_down = vec![false; bottom.len()];
        for (i, &b) in bottom.iter().enumerate() {
            if check_bottom.map_or(true, |c| c == i) {
                blobs.push(b);
                propagate_down[i] = true;
            }
        }

        // Analytic gradients.
        for &id in &blobs {
            arena.get(id).mutable_diff()?.iter_mut().for_each(|d| *d = T::zero());
        }
        layer.reseed(self.seed);
        layer.forward(arena, bottom, top)?;
        self.objective(arena, top, objective)?;
        layer.backward(arena, top, &propagate_down, bottom)?;
        let mut analytic = Vec::with_capacity(blobs.len());
        for &id in &blobs {
            analytic.push(arena.get(id).diff()?.to_vec());
        }

        let target = match objective {
            Objective::Element { index, .. } if element_wise => Some(index),
            _ => None,
        };
        let step = T::from_f64(self.stepsize);
        let mut mismatches = Vec::new();
        for (bi, &id) in blobs.iter().enumerate() {
            let count = arena.get(id).count();
            for feat in 0..count {
                if target.map_or(false, |t| t != feat) {
                    continue;
                }
                let estimated = if self.stepsize > 0.0 {
                    let original = arena.get(id).data()?[feat];
                    arena.get(id).mutable_data()?[feat] = original + step;
                    layer.reseed(self.seed);
                    layer.forward(arena, bottom, top)?;
                    let positive = self.objective(arena, top, objective)?;
                    arena.get(id).mutable_data()?[feat] = original - step;
                    layer.reseed(self.seed);
                    layer.forward(arena, bottom, top)?;
                    let negative = self.objective(arena, top, objective)?;
                    arena.get(id).mutable_data()?[feat] = original;
                    (positive - negative) / self.stepsize / 2.0
                } else {
                    0.0
                };
                let computed = analytic[bi][feat].as_f64();
                let feature = arena.get(id).data()?[feat].as_f64().abs();
                let in_kink = feature >= self.kink - self.kink_range && feature <= self.kink + self.kink_range;
                if in_kink {
                    continue;
                }
                let scale = computed.abs().max(estimated.abs()).max(1.0);
                if (computed - estimated).abs() > self.threshold * scale {
                    mismatches.push(GradientMismatch {
                        blob: bi,
                        element: feat,
                        analytic: computed,
                        estimated,
                    });
                }
            }
        }
        Ok(mismatches)
    }

    /// Evaluate the objective and write its gradient into the top diffs.
    fn objective<T: WithDType>(&self, arena: &TensorArena<T>, top: &[TensorId], objective: Objective) -> Result<f64> {
        match objective {
            Objective::AllTops => {
                let mut loss = 0.0;
                for &id in top {
                    let mut t = arena.get(id);
                    let (data, diff) = t.data_and_mutable_diff()?;
                    for (d, &v) in diff.iter_mut().zip(data) {
                        loss += v.as_f64() * v.as_f64();
                        *d = v;
                    }
                }
                Ok(loss / 2.0)
            }
            Objective::Element { top: k, index } => {
                for &id in top {
                    arena.get(id).mutable_diff()?.iter_mut().for_each(|d| *d = T::zero());
                }
                let mut t = arena.get(top[k]);
                let value = t.data()?[index].as_f64();
                t.mutable_diff()?[index] = T::from_f64(2.0);
                Ok(2.0 * value)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FillerConfig, InnerProductParams, LayerConfig, LayerKind};
    use crate::inner_product::InnerProduct;
    use crate::layer::Layer;
    use kiln_core::Tensor;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    /// y = 3x whose backward wrongly reports 2.
    struct Broken {
        config: LayerConfig,
    }

    impl Layer<f64> for Broken {
        fn config(&self) -> &LayerConfig {
            &self.config
        }
        fn reshape(&mut self, arena: &TensorArena<f64>, bottom: &[TensorId], top: &[TensorId]) -> Result<()> {
            let shape = arena.get(bottom[0]).shape().clone();
            arena.get(top[0]).reshape(shape);
            Ok(())
        }
        fn forward_host(&mut self, arena: &TensorArena<f64>, bottom: &[TensorId], top: &[TensorId]) -> Result<()> {
            let x = arena.get(bottom[0]).data()?.to_vec();
            let mut t = arena.get(top[0]);
            for (y, v) in t.mutable_data()?.iter_mut().zip(x) {
                *y = 3.0 * v;
            }
            Ok(())
        }
        fn backward_host(
            &mut self,
            arena: &TensorArena<f64>,
            top: &[TensorId],
            _propagate_down: &[bool],
            bottom: &[TensorId],
        ) -> Result<()> {
            let dy = arena.get(top[0]).diff()?.to_vec();
            let mut b = arena.get(bottom[0]);
            for (g, d) in b.mutable_diff()?.iter_mut().zip(dy) {
                *g += 2.0 * d;
            }
            Ok(())
        }
    }

    #[test]
    fn test_detects_wrong_gradient() -> Result<()> {
        let mut arena = TensorArena::<f64>::host();
        let b = arena.insert(Tensor::from_vec(vec![0.5, -1.0, 2.0], 3)?);
        let t = arena.alloc();
        let mut layer = Broken {
            config: LayerConfig::new("broken", LayerKind::Sigmoid),
        };
        let checker = GradientChecker::new(1e-2, 1e-3);
        match checker.check_gradient(&mut layer, &mut arena, &[b], &[t], None) {
            Err(Error::Msg(msg)) => assert!(msg.contains("3 element(s)"), "{msg}"),
            other => panic!("expected a mismatch, got {other:?}"),
        }
        Ok(())
    }

    #[test]
    fn test_inner_product_passes() -> Result<()> {
        let mut arena = TensorArena::<f64>::host();
        let x: Vec<f64> = (0..12).map(|i| (i as f64 - 5.5) / 4.0).collect();
        let b = arena.insert(Tensor::from_vec(x, (2, 3, 2))?);
        let t = arena.alloc();
        let kind = LayerKind::InnerProduct(InnerProductParams {
            num_output: 4,
            weight_filler: FillerConfig::Gaussian { mean: 0.0, std: 1.0 },
            bias_filler: FillerConfig::Uniform { min: 1.0, max: 2.0 },
            ..Default::default()
        });
        let mut layer = InnerProduct::new(LayerConfig::new("ip", kind), StdRng::seed_from_u64(1701))?;
        let checker = GradientChecker::new(1e-2, 1e-3);
        checker.check_gradient_exhaustive(&mut layer, &mut arena, &[b], &[t], None)
    }
}
