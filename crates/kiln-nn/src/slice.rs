// Slice: split one bottom into several tops along an axis
//
// With `slice_points` [p1, p2, ...] the tops take the ranges [0, p1),
// [p1, p2), ..., [pk, dim) of the axis; without them the axis is split into
// equal parts, one per top. Backward accumulates each top's diff into its
// range of the bottom diff.

use kiln_core::{Result, TensorArena, TensorId, WithDType};

use crate::config::{LayerConfig, LayerKind, SliceParams};
use crate::layer::{Arity, Layer};

pub struct Slice {
    config: LayerConfig,
    p: SliceParams,
    /// Width of each top along the slice axis.
    widths: Vec<usize>,
    /// Product of the axes before the slice axis.
    num_slices: usize,
    /// Product of the axes after the slice axis.
    slice_size: usize,
    /// Size of the slice axis in the bottom.
    bottom_dim: usize,
}

impl Slice {
    pub fn new(config: LayerConfig) -> Result<Self> {
        let p = match &config.kind {
            LayerKind::Slice(p) => p.clone(),
            _ => return Err(config.kind_mismatch("Slice")),
        };
        Ok(Slice {
            config,
            p,
            widths: Vec::new(),
            num_slices: 0,
            slice_size: 0,
            bottom_dim: 0,
        })
    }

    fn widths_for(&self, dim: usize, tops: usize) -> Result<Vec<usize>> {
        let name = &self.config.name;
        if self.p.slice_points.is_empty() {
            if dim % tops != 0 {
                kiln_core::config_bail!(
                    "Slice layer '{name}': axis of size {dim} does not split into {tops} equal parts"
                );
            }
            return Ok(vec![dim / tops; tops]);
        }
        if self.p.slice_points.len() != tops - 1 {
            kiln_core::config_bail!(
                "Slice layer '{name}': {} slice points for {tops} tops",
                self.p.slice_points.len()
            );
        }
        let mut widths = Vec::with_capacity(tops);
        let mut prev = 0;
        for &point in self.p.slice_points.iter().chain(std::iter::once(&dim)) {
            if point <= prev || point > dim {
                kiln_core::config_bail!(
                    "Slice layer '{name}': slice points must increase strictly within (0, {dim}), got {:?}",
                    self.p.slice_points
                );
            }
            widths.push(point - prev);
            prev = point;
        }
        Ok(widths)
    }
}

impl<T: WithDType> Layer<T> for Slice {
    fn config(&self) -> &LayerConfig {
        &self.config
    }

    fn arity(&self) -> Arity {
        Arity::new(1..=1, 1..=usize::MAX)
    }

    fn reshape(&mut self, arena: &TensorArena<T>, bottom: &[TensorId], top: &[TensorId]) -> Result<()> {
        let b = arena.get(bottom[0]);
        let axis = b.canonical_axis_index(self.p.axis);
        self.bottom_dim = b.shape_at(axis as isize);
        self.num_slices = b.count_range(0, axis);
        self.slice_size = b.count_from(axis + 1);
        self.widths = self.widths_for(self.bottom_dim, top.len())?;
        let shape = b.shape().clone();
        drop(b);
        for (&id, &w) in top.iter().zip(&self.widths) {
            arena.get(id).reshape(shape.with_dim(axis, w));
        }
        Ok(())
    }

    fn forward_host(&mut self, arena: &TensorArena<T>, bottom: &[TensorId], top: &[TensorId]) -> Result<()> {
        let mut b = arena.get(bottom[0]);
        let x = b.data()?;
        let mut offset = 0;
        for (&id, &w) in top.iter().zip(&self.widths) {
            let mut t = arena.get(id);
            let y = t.mutable_data()?;
            let chunk = w * self.slice_size;
            for n in 0..self.num_slices {
                let src = (n * self.bottom_dim + offset) * self.slice_size;
                y[n * chunk..(n + 1) * chunk].copy_from_slice(&x[src..src + chunk]);
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
        if !propagate_down[0] {
            return Ok(());
        }
        let mut b = arena.get(bottom[0]);
        let dx = b.mutable_diff()?;
        let mut offset = 0;
        for (&id, &w) in top.iter().zip(&self.widths) {
            let mut t = arena.get(id);
            let dy = t.diff()?;
            let chunk = w * self.slice_size;
            for n in 0..self.num_slices {
                let dst = (n * self.bottom_dim + offset) * self.slice_size;
                for (g, &d) in dx[dst..dst + chunk].iter_mut().zip(&dy[n * chunk..(n + 1) * chunk]) {
                    *g += d;
                }
            }
            offset += w;
        }
        Ok(())
    }
}
