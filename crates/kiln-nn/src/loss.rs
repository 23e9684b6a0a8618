// Loss layers
//
// A loss layer reduces its bottoms to a scalar top. Its top 0 carries a loss
// weight of 1 unless configured otherwise, and the net seeds that top's diff
// with the weight before backward, so backward scales by top_diff[0].
//
// 1. EuclideanLoss: ||a - b||^2 / (2 N), N = a.shape(0)
//    Gradient a: +(a - b) / N, gradient b: -(a - b) / N.
//
// 2. SoftmaxWithLoss: softmax over `axis` followed by the multinomial
//    negative log-likelihood of integer labels.
//    loss = -sum log(max(p[label], MIN_POSITIVE)) / normalizer
//    Gradient of the scores: (p - onehot(label)) / normalizer, and zero at
//    ignored positions. Labels receive no gradient.

use kiln_core::{Error, Result, TensorArena, TensorId, WithDType};

use crate::config::{LayerConfig, LayerKind, LossNormalization, SoftmaxLossParams};
use crate::layer::{Arity, Layer};

/// Sum of squared differences, halved and divided by the batch size.
pub struct EuclideanLoss<T: WithDType> {
    config: LayerConfig,
    /// a - b from the last forward pass.
    diff: Vec<T>,
}

impl<T: WithDType> EuclideanLoss<T> {
    pub fn new(config: LayerConfig) -> Result<Self> {
        if config.kind != LayerKind::EuclideanLoss {
            return Err(config.kind_mismatch("EuclideanLoss"));
        }
        Ok(EuclideanLoss {
            config,
            diff: Vec::new(),
        })
    }
}

fn check_loss_inputs<T: WithDType>(
    layer: &LayerConfig,
    arena: &TensorArena<T>,
    bottom: &[TensorId],
    inner_must_match: bool,
) -> Result<()> {
    // Both bottoms may be the same blob, so never hold two borrows at once.
    let a = arena.get(bottom[0]).shape().clone();
    let b = arena.get(bottom[1]).shape().clone();
    if a.rank() == 0 || b.rank() == 0 || a.dims()[0] != b.dims()[0] {
        kiln_core::config_bail!(
            "loss layer '{}': inputs must have the same batch size, got {a} and {b}",
            layer.name
        );
    }
    if inner_must_match && a.count_range(1, a.rank()) != b.count_range(1, b.rank()) {
        kiln_core::config_bail!(
            "loss layer '{}': inputs must have the same dimension, got {a} and {b}",
            layer.name
        );
    }
    Ok(())
}

impl<T: WithDType> Layer<T> for EuclideanLoss<T> {
    fn config(&self) -> &LayerConfig {
        &self.config
    }

    fn arity(&self) -> Arity {
        Arity::exact(2, 1)
    }

    fn is_loss(&self) -> bool {
        true
    }

    fn reshape(&mut self, arena: &TensorArena<T>, bottom: &[TensorId], top: &[TensorId]) -> Result<()> {
        check_loss_inputs(&self.config, arena, bottom, true)?;
        let count = arena.get(bottom[0]).count();
        self.diff.resize(count, T::zero());
        arena.get(top[0]).reshape(());
        Ok(())
    }

    fn forward_host(&mut self, arena: &TensorArena<T>, bottom: &[TensorId], top: &[TensorId]) -> Result<()> {
        let num = {
            let mut a = arena.get(bottom[0]);
            let num = a.shape_at(0);
            self.diff.copy_from_slice(a.data()?);
            num
        };
        {
            let mut b = arena.get(bottom[1]);
            for (d, &v) in self.diff.iter_mut().zip(b.data()?) {
                *d -= v;
            }
        }
        let sumsq: T = self.diff.iter().map(|&d| d * d).sum();
        let loss = sumsq / T::from_f64(num as f64) / T::from_f64(2.0);
        arena.get(top[0]).mutable_data()?[0] = loss;
        Ok(())
    }

    fn backward_host(
        &mut self,
        arena: &TensorArena<T>,
        top: &[TensorId],
        propagate_down: &[bool],
        bottom: &[TensorId],
    ) -> Result<()> {
        let top_diff = arena.get(top[0]).diff()?[0];
        for (i, &id) in bottom.iter().enumerate() {
            if !propagate_down[i] {
                continue;
            }
            let mut b = arena.get(id);
            let sign = if i == 0 { T::one() } else { -T::one() };
            let alpha = sign * top_diff / T::from_f64(b.shape_at(0) as f64);
            for (g, &d) in b.mutable_diff()?.iter_mut().zip(&self.diff) {
                *g += alpha * d;
            }
        }
        Ok(())
    }
}

/// Softmax followed by multinomial logistic loss.
///
/// Bottoms are scores and integer labels; an optional second top receives
/// the probabilities.
pub struct SoftmaxWithLoss<T: WithDType> {
    config: LayerConfig,
    p: SoftmaxLossParams,
    prob: Vec<T>,
    outer: usize,
    inner: usize,
    channels: usize,
    normalizer: f64,
}

impl<T: WithDType> SoftmaxWithLoss<T> {
    pub fn new(config: LayerConfig) -> Result<Self> {
        let p = match &config.kind {
            LayerKind::SoftmaxWithLoss(p) => p.clone(),
            _ => return Err(config.kind_mismatch("SoftmaxWithLoss")),
        };
        Ok(SoftmaxWithLoss {
            config,
            p,
            prob: Vec::new(),
            outer: 0,
            inner: 0,
            channels: 0,
            normalizer: 1.0,
        })
    }

    /// Probabilities from the last forward pass.
    pub fn prob(&self) -> &[T] {
        &self.prob
    }

    fn normalizer(&self, valid: usize) -> f64 {
        let n = match self.p.normalization {
            LossNormalization::Full => (self.outer * self.inner) as f64,
            LossNormalization::Valid => valid as f64,
            LossNormalization::BatchSize => self.outer as f64,
            LossNormalization::None => 1.0,
        };
        n.max(1.0)
    }

    fn label_at(&self, labels: &[T], index: usize) -> Result<Option<usize>> {
        let label = labels[index].as_f64().round() as i64;
        if self.p.ignore_label == Some(label) {
            return Ok(None);
        }
        if label < 0 || label as usize >= self.channels {
            kiln_core::bail!(
                "SoftmaxWithLoss layer '{}': label {label} at {index} is outside [0, {})",
                self.config.name,
                self.channels
            );
        }
        Ok(Some(label as usize))
    }
}

impl<T: WithDType> Layer<T> for SoftmaxWithLoss<T> {
    fn config(&self) -> &LayerConfig {
        &self.config
    }

    fn arity(&self) -> Arity {
        Arity::new(2..=2, 1..=2)
    }

    fn is_loss(&self) -> bool {
        true
    }

    fn allow_force_backward(&self, index: usize) -> bool {
        index != 1
    }

    fn reshape(&mut self, arena: &TensorArena<T>, bottom: &[TensorId], top: &[TensorId]) -> Result<()> {
        check_loss_inputs(&self.config, arena, bottom, false)?;
        let scores = arena.get(bottom[0]);
        let axis = scores.canonical_axis_index(self.p.axis);
        self.outer = scores.count_range(0, axis);
        self.inner = scores.count_from(axis + 1);
        self.channels = scores.shape_at(axis as isize);
        let label_count = arena.get(bottom[1]).count();
        if label_count != self.outer * self.inner {
            kiln_core::config_bail!(
                "SoftmaxWithLoss layer '{}': {} labels for {} predictions; labels must have shape {} with the class axis removed",
                self.config.name,
                label_count,
                self.outer * self.inner,
                scores.shape()
            );
        }
        self.prob.resize(scores.count(), T::zero());
        let shape = scores.shape().clone();
        drop(scores);
        arena.get(top[0]).reshape(());
        if let Some(&prob_top) = top.get(1) {
            arena.get(prob_top).reshape(shape);
        }
        Ok(())
    }

    fn forward_host(&mut self, arena: &TensorArena<T>, bottom: &[TensorId], top: &[TensorId]) -> Result<()> {
        let (outer, inner, channels) = (self.outer, self.inner, self.channels);
        {
            let mut scores = arena.get(bottom[0]);
            let x = scores.data()?;
            for o in 0..outer {
                for i in 0..inner {
                    let at = |c: usize| (o * channels + c) * inner + i;
                    let max = (0..channels)
                        .map(|c| x[at(c)])
                        .fold(T::neg_infinity(), |m, v| m.max(v));
                    let mut sum = T::zero();
                    for c in 0..channels {
                        let e = (x[at(c)] - max).exp();
                        self.prob[at(c)] = e;
                        sum += e;
                    }
                    for c in 0..channels {
                        self.prob[at(c)] /= sum;
                    }
                }
            }
        }

        let mut labels = arena.get(bottom[1]);
        let labels = labels.data()?;
        let floor = T::from_f64(f32::MIN_POSITIVE as f64);
        let mut loss = T::zero();
        let mut valid = 0usize;
        for o in 0..outer {
            for i in 0..inner {
                if let Some(label) = self.label_at(labels, o * inner + i)? {
                    let p = self.prob[(o * channels + label) * inner + i];
                    loss -= p.max(floor).ln();
                    valid += 1;
                }
            }
        }
        self.normalizer = self.normalizer(valid);
        arena.get(top[0]).mutable_data()?[0] = loss / T::from_f64(self.normalizer);
        if let Some(&prob_top) = top.get(1) {
            arena.get(prob_top).mutable_data()?.copy_from_slice(&self.prob);
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
        if propagate_down.get(1).copied().unwrap_or(false) {
            return Err(Error::Config(format!(
                "SoftmaxWithLoss layer '{}' cannot backpropagate to label inputs",
                self.config.name
            )));
        }
        if !propagate_down[0] {
            return Ok(());
        }
        let (outer, inner, channels) = (self.outer, self.inner, self.channels);
        let scale = arena.get(top[0]).diff()?[0] / T::from_f64(self.normalizer);
        let mut labels = arena.get(bottom[1]);
        let labels = labels.data()?;
        let mut scores = arena.get(bottom[0]);
        let dx = scores.mutable_diff()?;
        for o in 0..outer {
            for i in 0..inner {
                let label = self.label_at(labels, o * inner + i)?;
                let Some(label) = label else { continue };
                for c in 0..channels {
                    let at = (o * channels + c) * inner + i;
                    let target = if c == label { T::one() } else { T::zero() };
                    dx[at] += (self.prob[at] - target) * scale;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_core::Tensor;

    fn approx_eq(a: f64, b: f64, tol: f64) -> bool {
        (a - b).abs() < tol
    }

    #[test]
    fn test_euclidean_forward_backward() -> Result<()> {
        let mut arena = TensorArena::<f64>::host();
        let a = arena.insert(Tensor::from_vec(vec![1.0, 2.0, 3.0, 4.0], (2, 2))?);
        let b = arena.insert(Tensor::from_vec(vec![0.0, 2.0, 5.0, 4.0], (2, 2))?);
        let t = arena.alloc();
        let mut layer = EuclideanLoss::<f64>::new(LayerConfig::new("loss", LayerKind::EuclideanLoss))?;
        layer.setup(&mut arena, &[a, b], &[t])?;
        assert_eq!(arena.get(t).count(), 1);
        assert_eq!(arena.get(t).diff()?, &[1.0]);

        // diff = [1, 0, -2, 0]; sum of squares 5; / 2 / 2
        let loss = layer.forward(&arena, &[a, b], &[t])?;
        assert!(approx_eq(loss, 1.25, 1e-12));

        layer.backward(&arena, &[t], &[true, true], &[a, b])?;
        assert_eq!(arena.get(a).diff()?, &[0.5, 0.0, -1.0, 0.0]);
        assert_eq!(arena.get(b).diff()?, &[-0.5, 0.0, 1.0, 0.0]);
        Ok(())
    }

    #[test]
    fn test_euclidean_loss_weight_scales() -> Result<()> {
        let mut arena = TensorArena::<f64>::host();
        let a = arena.insert(Tensor::from_vec(vec![2.0], (1, 1))?);
        let b = arena.insert(Tensor::from_vec(vec![0.0], (1, 1))?);
        let t = arena.alloc();
        let cfg = LayerConfig::new("loss", LayerKind::EuclideanLoss).with_loss_weight(3.0);
        let mut layer = EuclideanLoss::<f64>::new(cfg)?;
        layer.setup(&mut arena, &[a, b], &[t])?;
        let loss = layer.forward(&arena, &[a, b], &[t])?;
        assert!(approx_eq(loss, 6.0, 1e-12));
        layer.backward(&arena, &[t], &[true, false], &[a, b])?;
        assert_eq!(arena.get(a).diff()?, &[6.0]);
        assert_eq!(arena.get(b).diff()?, &[0.0]);
        Ok(())
    }

    #[test]
    fn test_euclidean_dimension_mismatch() {
        let mut arena = TensorArena::<f32>::host();
        let a = arena.alloc_shaped((2, 3));
        let b = arena.alloc_shaped((2, 4));
        let t = arena.alloc();
        let mut layer = EuclideanLoss::<f32>::new(LayerConfig::new("loss", LayerKind::EuclideanLoss)).unwrap();
        assert!(matches!(
            layer.setup(&mut arena, &[a, b], &[t]),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_euclidean_same_blob_for_both_bottoms() -> Result<()> {
        let mut arena = TensorArena::<f64>::host();
        let a = arena.insert(Tensor::from_vec(vec![1.0, -2.0, 3.0], (3, 1))?);
        let t = arena.alloc();
        let mut layer = EuclideanLoss::<f64>::new(LayerConfig::new("loss", LayerKind::EuclideanLoss))?;
        layer.setup(&mut arena, &[a, a], &[t])?;
        let loss = layer.forward(&arena, &[a, a], &[t])?;
        assert_eq!(loss, 0.0);
        layer.backward(&arena, &[t], &[true, true], &[a, a])?;
        assert_eq!(arena.get(a).diff()?, &[0.0, 0.0, 0.0]);
        Ok(())
    }

    fn softmax_layer(params: SoftmaxLossParams) -> Result<SoftmaxWithLoss<f64>> {
        SoftmaxWithLoss::new(LayerConfig::new("loss", LayerKind::SoftmaxWithLoss(params)))
    }

    #[test]
    fn test_softmax_uniform_scores() -> Result<()> {
        let mut arena = TensorArena::<f64>::host();
        let x = arena.insert(Tensor::from_vec(vec![0.0; 8], (2, 4))?);
        let y = arena.insert(Tensor::from_vec(vec![1.0, 3.0], 2)?);
        let (t, prob) = (arena.alloc(), arena.alloc());
        let mut layer = softmax_layer(SoftmaxLossParams::default())?;
        layer.setup(&mut arena, &[x, y], &[t, prob])?;
        let loss = layer.forward(&arena, &[x, y], &[t, prob])?;
        assert!(approx_eq(loss, 4f64.ln(), 1e-12));
        assert!(arena.get(prob).data()?.iter().all(|&p| approx_eq(p, 0.25, 1e-12)));

        layer.backward(&arena, &[t, prob], &[true, false], &[x, y])?;
        let dx = arena.get(x).diff()?.to_vec();
        assert!(approx_eq(dx[1], (0.25 - 1.0) / 2.0, 1e-12));
        assert!(approx_eq(dx[0], 0.25 / 2.0, 1e-12));
        assert!(approx_eq(dx.iter().sum::<f64>(), 0.0, 1e-12));
        Ok(())
    }

    #[test]
    fn test_softmax_ignore_label_and_normalization() -> Result<()> {
        let scores = vec![1.0, 2.0, 0.5, -1.0, 0.0, 3.0];
        let labels = vec![1.0, -1.0];
        let mut losses = Vec::new();
        for normalization in [LossNormalization::Valid, LossNormalization::BatchSize] {
            let mut arena = TensorArena::<f64>::host();
            let x = arena.insert(Tensor::from_vec(scores.clone(), (2, 3))?);
            let y = arena.insert(Tensor::from_vec(labels.clone(), 2)?);
            let t = arena.alloc();
            let mut layer = softmax_layer(SoftmaxLossParams {
                ignore_label: Some(-1),
                normalization,
                ..Default::default()
            })?;
            layer.setup(&mut arena, &[x, y], &[t])?;
            losses.push(layer.forward(&arena, &[x, y], &[t])?);
            layer.backward(&arena, &[t], &[true, false], &[x, y])?;
            assert!(arena.get(x).diff()?[3..].iter().all(|&d| d == 0.0));
        }
        assert!(approx_eq(losses[0], 2.0 * losses[1], 1e-12));
        Ok(())
    }

    #[test]
    fn test_softmax_label_backprop_rejected() -> Result<()> {
        let mut arena = TensorArena::<f64>::host();
        let x = arena.insert(Tensor::from_vec(vec![0.0; 4], (2, 2))?);
        let y = arena.insert(Tensor::from_vec(vec![0.0, 1.0], 2)?);
        let t = arena.alloc();
        let mut layer = softmax_layer(SoftmaxLossParams::default())?;
        assert!(!Layer::<f64>::allow_force_backward(&layer, 1));
        layer.setup(&mut arena, &[x, y], &[t])?;
        layer.forward(&arena, &[x, y], &[t])?;
        assert!(matches!(
            layer.backward(&arena, &[t], &[true, true], &[x, y]),
            Err(Error::Config(_))
        ));
        Ok(())
    }

    #[test]
    fn test_softmax_label_count_mismatch() -> Result<()> {
        let mut arena = TensorArena::<f64>::host();
        let x = arena.alloc_shaped((2, 3));
        let y = arena.alloc_shaped((2, 2));
        let t = arena.alloc();
        let mut layer = softmax_layer(SoftmaxLossParams::default())?;
        assert!(matches!(
            layer.setup(&mut arena, &[x, y], &[t]),
            Err(Error::Config(_))
        ));
        Ok(())
    }
}
