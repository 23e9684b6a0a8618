// InnerProduct: fully connected layer
//
// The bottom is viewed as an [M, K] matrix by splitting its axes at `axis`:
// M = product of the leading axes, K = product of the rest. With N =
// num_output:
//
//   weight: [N, K]  ([K, N] when transpose is set)
//   bias:   [N]
//   top:    bottom.dims[..axis] ++ [N]
//
// COMPUTATION:
//
//   forward:   top   = bottom @ W^T + bias      (bottom @ W when transposed)
//   backward:  dW   += top_diff^T @ bottom      (bottom^T @ top_diff when transposed)
//              db   += column sums of top_diff
//              dbot += top_diff @ W             (top_diff @ W^T when transposed)
//
// K is fixed at setup; a later bottom whose trailing size differs is a
// configuration error, while M may change freely between iterations.

use rand::rngs::StdRng;

use kiln_core::{Result, TensorArena, TensorId, WithDType};

use crate::config::{InnerProductParams, LayerConfig, LayerKind};
use crate::filler;
use crate::layer::{Arity, Layer};

/// Fully connected layer with an optional bias.
pub struct InnerProduct {
    config: LayerConfig,
    p: InnerProductParams,
    /// Weight, then bias when `bias_term` is set.
    params: Vec<TensorId>,
    m: usize,
    k: usize,
    n: usize,
    rng: StdRng,
}

impl InnerProduct {
    pub fn new(config: LayerConfig, rng: StdRng) -> Result<Self> {
        let p = match &config.kind {
            LayerKind::InnerProduct(p) => p.clone(),
            _ => return Err(config.kind_mismatch("InnerProduct")),
        };
        if p.num_output == 0 {
            kiln_core::config_bail!("InnerProduct layer '{}' needs num_output > 0", config.name);
        }
        let n = p.num_output;
        Ok(InnerProduct {
            config,
            p,
            params: Vec::new(),
            m: 0,
            k: 0,
            n,
            rng,
        })
    }

    pub fn weight(&self) -> Option<TensorId> {
        self.params.first().copied()
    }

    pub fn bias(&self) -> Option<TensorId> {
        if self.p.bias_term {
            self.params.get(1).copied()
        } else {
            None
        }
    }

    fn weight_shape(&self) -> Vec<usize> {
        if self.p.transpose {
            vec![self.k, self.n]
        } else {
            vec![self.n, self.k]
        }
    }

    /// W[out][in] regardless of storage order.
    #[inline]
    fn w_index(&self, out: usize, inp: usize) -> usize {
        if self.p.transpose {
            inp * self.n + out
        } else {
            out * self.k + inp
        }
    }
}

impl<T: WithDType> Layer<T> for InnerProduct {
    fn config(&self) -> &LayerConfig {
        &self.config
    }

    fn arity(&self) -> Arity {
        Arity::exact(1, 1)
    }

    fn params(&self) -> &[TensorId] {
        &self.params
    }

    fn params_mut(&mut self) -> &mut [TensorId] {
        &mut self.params
    }

    fn layer_setup(&mut self, arena: &mut TensorArena<T>, bottom: &[TensorId], _top: &[TensorId]) -> Result<()> {
        {
            let b = arena.get(bottom[0]);
            let axis = b.canonical_axis_index(self.p.axis);
            self.k = b.count_from(axis);
        }
        if !self.params.is_empty() {
            log::info!("Skipping parameter initialization for '{}'", self.config.name);
            return Ok(());
        }
        let weight = arena.alloc_shaped(self.weight_shape());
        filler::fill(&self.p.weight_filler, &mut arena.get(weight), &mut self.rng)?;
        self.params.push(weight);
        if self.p.bias_term {
            let bias = arena.alloc_shaped(self.n);
            filler::fill(&self.p.bias_filler, &mut arena.get(bias), &mut self.rng)?;
            self.params.push(bias);
        }
        Ok(())
    }

    fn reshape(&mut self, arena: &TensorArena<T>, bottom: &[TensorId], top: &[TensorId]) -> Result<()> {
        let b = arena.get(bottom[0]);
        let axis = b.canonical_axis_index(self.p.axis);
        let k = b.count_from(axis);
        if k != self.k {
            kiln_core::config_bail!(
                "InnerProduct layer '{}': input size {k} incompatible with parameters of size {}",
                self.config.name,
                self.k
            );
        }
        self.m = b.count_range(0, axis);
        let mut dims = b.dims()[..axis].to_vec();
        dims.push(self.n);
        drop(b);
        arena.get(top[0]).reshape(dims);
        Ok(())
    }

    fn forward_host(&mut self, arena: &TensorArena<T>, bottom: &[TensorId], top: &[TensorId]) -> Result<()> {
        let (m, k, n) = (self.m, self.k, self.n);
        let mut b = arena.get(bottom[0]);
        let mut t = arena.get(top[0]);
        let mut w = arena.get(self.params[0]);
        let x = b.data()?;
        let w = w.data()?;
        let y = t.mutable_data()?;
        for i in 0..m {
            let row = &x[i * k..(i + 1) * k];
            for j in 0..n {
                let mut acc = T::zero();
                for (l, &xv) in row.iter().enumerate() {
                    acc += xv * w[self.w_index(j, l)];
                }
                y[i * n + j] = acc;
            }
        }
        if self.p.bias_term {
            let mut bt = arena.get(self.params[1]);
            let bias = bt.data()?;
            for i in 0..m {
                for j in 0..n {
                    y[i * n + j] += bias[j];
                }
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
        let (m, k, n) = (self.m, self.k, self.n);
        let mut t = arena.get(top[0]);
        let mut b = arena.get(bottom[0]);
        let dy = t.diff()?;
        {
            let mut wt = arena.get(self.params[0]);
            let x = b.data()?;
            let dw = wt.mutable_diff()?;
            for i in 0..m {
                for j in 0..n {
                    let g = dy[i * n + j];
                    if g == T::zero() {
                        continue;
                    }
                    for l in 0..k {
                        dw[self.w_index(j, l)] += g * x[i * k + l];
                    }
                }
            }
        }
        if self.p.bias_term {
            let mut bt = arena.get(self.params[1]);
            let db = bt.mutable_diff()?;
            for i in 0..m {
                for j in 0..n {
                    db[j] += dy[i * n + j];
                }
            }
        }
        if propagate_down[0] {
            let mut wt = arena.get(self.params[0]);
            let w = wt.data()?;
            let dx = b.mutable_diff()?;
            for i in 0..m {
                for j in 0..n {
                    let g = dy[i * n + j];
                    for l in 0..k {
                        dx[i * k + l] += g * w[self.w_index(j, l)];
                    }
                }
            }
        }
        Ok(())
    }
}
