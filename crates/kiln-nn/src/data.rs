// Data layers: where a net's activations start
//
// Input has no bottoms; its tops are shaped at setup and filled by the caller
// between forward passes (they are the net's input blobs).
//
// MemoryData holds a fixed set of samples and targets and emits them in
// batches of `batch_size`, wrapping around at the end:
//
//   samples:  [s0 s1 s2 s3]   batch_size 2
//   forward 1 -> [s0 s1]
//   forward 2 -> [s2 s3]
//   forward 3 -> [s0 s1]
//
// Neither layer has a backward pass.

use kiln_core::{Result, Shape, TensorArena, TensorId, WithDType};

use crate::config::{InputParams, LayerConfig, LayerKind};
use crate::layer::{Arity, Layer};

/// Tops filled externally.
pub struct Input {
    config: LayerConfig,
    p: InputParams,
}

impl Input {
    pub fn new(config: LayerConfig) -> Result<Self> {
        let p = match &config.kind {
            LayerKind::Input(p) => p.clone(),
            _ => return Err(config.kind_mismatch("Input")),
        };
        Ok(Input { config, p })
    }
}

impl<T: WithDType> Layer<T> for Input {
    fn config(&self) -> &LayerConfig {
        &self.config
    }

    fn arity(&self) -> Arity {
        Arity::new(0..=0, 1..=usize::MAX)
    }

    fn layer_setup(&mut self, arena: &mut TensorArena<T>, _bottom: &[TensorId], top: &[TensorId]) -> Result<()> {
        let shapes = &self.p.shape;
        if shapes.len() != 1 && shapes.len() != top.len() {
            kiln_core::config_bail!(
                "Input layer '{}' needs 1 shape or one per top ({}), got {}",
                self.config.name,
                top.len(),
                shapes.len()
            );
        }
        for (i, &id) in top.iter().enumerate() {
            let dims = if shapes.len() == 1 { &shapes[0] } else { &shapes[i] };
            arena.get(id).reshape(dims.as_slice());
        }
        Ok(())
    }

    fn reshape(&mut self, _arena: &TensorArena<T>, _bottom: &[TensorId], _top: &[TensorId]) -> Result<()> {
        Ok(())
    }

    fn forward_host(&mut self, _arena: &TensorArena<T>, _bottom: &[TensorId], _top: &[TensorId]) -> Result<()> {
        Ok(())
    }

    fn backward_host(
        &mut self,
        _arena: &TensorArena<T>,
        _top: &[TensorId],
        _propagate_down: &[bool],
        _bottom: &[TensorId],
    ) -> Result<()> {
        Ok(())
    }
}

/// Batches drawn cyclically from in-memory samples and targets.
pub struct MemoryData<T: WithDType> {
    config: LayerConfig,
    batch_size: usize,
    sample_shape: Vec<usize>,
    target_shape: Vec<usize>,
    data: Vec<T>,
    targets: Vec<T>,
    samples: usize,
    cursor: usize,
}

impl<T: WithDType> MemoryData<T> {
    pub fn new(config: LayerConfig) -> Result<Self> {
        let p = match &config.kind {
            LayerKind::MemoryData(p) => p.clone(),
            _ => return Err(config.kind_mismatch("MemoryData")),
        };
        let mut layer = MemoryData {
            batch_size: p.batch_size,
            sample_shape: p.sample_shape.clone(),
            target_shape: p.target_shape.clone(),
            data: Vec::new(),
            targets: Vec::new(),
            samples: 0,
            cursor: 0,
            config,
        };
        if layer.batch_size == 0 {
            kiln_core::config_bail!("MemoryData layer '{}' needs batch_size > 0", layer.config.name);
        }
        layer.reset(&p.data, &p.targets)?;
        Ok(layer)
    }

    /// Replace the samples and targets and rewind to the first batch.
    pub fn reset(&mut self, data: &[f64], targets: &[f64]) -> Result<()> {
        let sample_size = Shape::from(self.sample_shape.as_slice()).elem_count();
        let target_size = Shape::from(self.target_shape.as_slice()).elem_count();
        if sample_size == 0 || data.len() % sample_size != 0 {
            kiln_core::config_bail!(
                "MemoryData layer '{}': {} values do not split into samples of size {sample_size}",
                self.config.name,
                data.len()
            );
        }
        let samples = data.len() / sample_size;
        if samples == 0 || samples % self.batch_size != 0 {
            kiln_core::config_bail!(
                "MemoryData layer '{}': {samples} samples is not a positive multiple of batch_size {}",
                self.config.name,
                self.batch_size
            );
        }
        if !targets.is_empty() && targets.len() != samples * target_size {
            kiln_core::config_bail!(
                "MemoryData layer '{}': {} targets for {samples} samples of size {target_size}",
                self.config.name,
                targets.len()
            );
        }
        self.data = data.iter().map(|&v| T::from_f64(v)).collect();
        self.targets = targets.iter().map(|&v| T::from_f64(v)).collect();
        self.samples = samples;
        self.cursor = 0;
        Ok(())
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Index of the first sample of the next batch.
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    fn batch_dims(&self, item: &[usize]) -> Vec<usize> {
        let mut dims = vec![self.batch_size];
        dims.extend_from_slice(item);
        dims
    }
}

impl<T: WithDType> Layer<T> for MemoryData<T> {
    fn config(&self) -> &LayerConfig {
        &self.config
    }

    fn arity(&self) -> Arity {
        Arity::new(0..=0, 1..=2)
    }

    fn reshape(&mut self, arena: &TensorArena<T>, _bottom: &[TensorId], top: &[TensorId]) -> Result<()> {
        arena.get(top[0]).reshape(self.batch_dims(&self.sample_shape));
        if let Some(&targets) = top.get(1) {
            if self.targets.is_empty() {
                kiln_core::config_bail!(
                    "MemoryData layer '{}' has a targets top but no targets",
                    self.config.name
                );
            }
            arena.get(targets).reshape(self.batch_dims(&self.target_shape));
        }
        Ok(())
    }

    fn forward_host(&mut self, arena: &TensorArena<T>, _bottom: &[TensorId], top: &[TensorId]) -> Result<()> {
        let mut t = arena.get(top[0]);
        let size = t.count() / self.batch_size;
        let start = self.cursor * size;
        t.mutable_data()?
            .copy_from_slice(&self.data[start..start + self.batch_size * size]);
        drop(t);
        if let Some(&targets) = top.get(1) {
            let mut t = arena.get(targets);
            let size = t.count() / self.batch_size;
            let start = self.cursor * size;
            t.mutable_data()?
                .copy_from_slice(&self.targets[start..start + self.batch_size * size]);
        }
        self.cursor = (self.cursor + self.batch_size) % self.samples;
        Ok(())
    }

    fn backward_host(
        &mut self,
        _arena: &TensorArena<T>,
        _top: &[TensorId],
        _propagate_down: &[bool],
        _bottom: &[TensorId],
    ) -> Result<()> {
        Ok(())
    }
}
