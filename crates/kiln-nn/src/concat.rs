// Concat: join several bottoms into one top along an axis
//
// All bottoms must agree on every axis except the concatenation axis. The
// same blob may appear more than once among the bottoms; each occurrence
// receives its part of the top gradient.

use kiln_core::{Result, TensorArena, TensorId, WithDType};

use crate::config::{ConcatParams, LayerConfig, LayerKind};
use crate::layer::{Arity, Layer};

pub struct Concat {
    config: LayerConfig,
    p: ConcatParams,
    widths: Vec<usize>,
    num_concats: usize,
    concat_size: usize,
    top_dim: usize,
}

impl Concat {
    pub fn new(config: LayerConfig) -> Result<Self> {
        let p = match &config.kind {
            LayerKind::Concat(p) => p.clone(),
            _ => return Err(config.kind_mismatch("Concat")),
        };
        Ok(Concat {
            config,
            p,
            widths: Vec::new(),
            num_concats: 0,
            concat_size: 0,
            top_dim: 0,
        })
    }
}

impl<T: WithDType> Layer<T> for Concat {
    fn config(&self) -> &LayerConfig {
        &self.config
    }

    fn arity(&self) -> Arity {
        Arity::new(1..=usize::MAX, 1..=1)
    }

    fn reshape(&mut self, arena: &TensorArena<T>, bottom: &[TensorId], top: &[TensorId]) -> Result<()> {
        let first = arena.get(bottom[0]).shape().clone();
        let axis = first.canonical_axis(self.p.axis);
        self.widths.clear();
        for &id in bottom {
            let shape = arena.get(id).shape().clone();
            let compatible = shape.rank() == first.rank()
                && (0..first.rank()).all(|a| a == axis || shape.dims()[a] == first.dims()[a]);
            if !compatible {
                kiln_core::config_bail!(
                    "Concat layer '{}': bottom {} has shape {shape}, incompatible with {first} along axis {axis}",
                    self.config.name,
                    id
                );
            }
            self.widths.push(shape.dims()[axis]);
        }
        self.top_dim = self.widths.iter().sum();
        self.num_concats = first.count_range(0, axis);
        self.concat_size = first.count_range(axis + 1, first.rank());
        arena.get(top[0]).reshape(first.with_dim(axis, self.top_dim));
        Ok(())
    }

    fn forward_host(&mut self, arena: &TensorArena<T>, bottom: &[TensorId], top: &[TensorId]) -> Result<()> {
        let mut t = arena.get(top[0]);
        let y = t.mutable_data()?;
        let mut offset = 0;
        for (&id, &w) in bottom.iter().zip(&self.widths) {
            let mut b = arena.get(id);
            let x = b.data()?;
            let chunk = w * self.concat_size;
            for n in 0..self.num_concats {
                let dst = (n * self.top_dim + offset) * self.concat_size;
                y[dst..dst + chunk].copy_from_slice(&x[n * chunk..(n + 1) * chunk]);
            }
            offset += w;
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
        let mut t = arena.get(top[0]);
        let dy = t.diff()?;
        let mut offset = 0;
        for (i, (&id, &w)) in bottom.iter().zip(&self.widths).enumerate() {
            if propagate_down[i] {
                let mut b = arena.get(id);
                let dx = b.mutable_diff()?;
                let chunk = w * self.concat_size;
                for n in 0..self.num_concats {
                    let src = (n * self.top_dim + offset) * self.concat_size;
                    for (g, &d) in dx[n * chunk..(n + 1) * chunk].iter_mut().zip(&dy[src..src + chunk]) {
                        *g += d;
                    }
                }
            }
            offset += w;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_core::{Error, Tensor};

    fn concat(axis: isize) -> Result<Concat> {
        Concat::new(LayerConfig::new("concat", LayerKind::Concat(ConcatParams { axis })))
    }

    #[test]
    fn test_concat_channels() -> Result<()> {
        let mut arena = TensorArena::<f64>::host();
        let a = arena.insert(Tensor::from_vec(vec![1.0, 2.0], (2, 1))?);
        let b = arena.insert(Tensor::from_vec(vec![3.0, 4.0, 5.0, 6.0], (2, 2))?);
        let t = arena.alloc();
        let mut layer = concat(1)?;
        Layer::<f64>::setup(&mut layer, &mut arena, &[a, b], &[t])?;
        assert_eq!(arena.get(t).dims(), &[2, 3]);
        Layer::<f64>::forward(&mut layer, &arena, &[a, b], &[t])?;
        assert_eq!(arena.get(t).data()?, &[1.0, 3.0, 4.0, 2.0, 5.0, 6.0]);

        arena
            .get(t)
            .mutable_diff()?
            .copy_from_slice(&[10.0, 20.0, 30.0, 40.0, 50.0, 60.0]);
        Layer::<f64>::backward(&mut layer, &arena, &[t], &[true, false], &[a, b])?;
        assert_eq!(arena.get(a).diff()?, &[10.0, 40.0]);
        assert_eq!(arena.get(b).diff()?, &[0.0; 4]);
        Ok(())
    }

    #[test]
    fn test_same_bottom_twice_accumulates() -> Result<()> {
        let mut arena = TensorArena::<f64>::host();
        let a = arena.insert(Tensor::from_vec(vec![1.0, 2.0], 2)?);
        let t = arena.alloc();
        let mut layer = concat(0)?;
        Layer::<f64>::setup(&mut layer, &mut arena, &[a, a], &[t])?;
        Layer::<f64>::forward(&mut layer, &arena, &[a, a], &[t])?;
        assert_eq!(arena.get(t).data()?, &[1.0, 2.0, 1.0, 2.0]);
        arena.get(t).mutable_diff()?.copy_from_slice(&[1.0, 2.0, 3.0, 4.0]);
        Layer::<f64>::backward(&mut layer, &arena, &[t], &[true, true], &[a, a])?;
        assert_eq!(arena.get(a).diff()?, &[4.0, 6.0]);
        Ok(())
    }

    #[test]
    fn test_incompatible_shapes() {
        let mut arena = TensorArena::<f32>::host();
        let a = arena.alloc_shaped((2, 3));
        let b = arena.alloc_shaped((3, 3));
        let t = arena.alloc();
        let mut layer = concat(1).unwrap();
        assert!(matches!(
            Layer::<f32>::setup(&mut layer, &mut arena, &[a, b], &[t]),
            Err(Error::Config(_))
        ));
    }
}
