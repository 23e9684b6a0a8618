// Net: a topologically ordered graph of layers over one tensor arena
//
// Construction walks the layer configurations in order, resolving each bottom
// name to a blob produced earlier and creating a blob for each new top name.
// A top named like the bottom at the same position runs the layer in place.
// Order in the configuration is therefore the execution order, and a bottom
// that names a blob nobody produced yet is a configuration error.
//
// BACKWARD PRUNING:
//
// A layer needs backward when one of its bottoms needs a gradient or one of
// its parameters is learnable (lr_mult != 0), and when at least one of its
// tops contributes to the loss. Layers failing either test are skipped in
// backward. force_backward overrides the pruning for every bottom whose
// layer allows it.
//
// PARAMETER SHARING:
//
// Parameters with the same ParamSpec name share one tensor. The first layer
// to declare the name owns it; later layers are rewired to the owner's
// TensorId after setup and their own copy is released. Only owners appear in
// learnable_params, so one solver step updates a shared tensor once, using
// the owner's lr and decay multipliers, with the gradient summed over every
// layer that used it.
//
// GRADIENTS:
//
// backward() zeroes every activation diff, seeds each loss top's diff with its
// loss weight, then runs the layers in reverse. Parameter diffs are left
// alone: clear_param_diffs() zeroes them, so several backward passes can
// accumulate into one gradient.

use std::cell::RefMut;
use std::collections::{BTreeSet, HashMap};

use serde::{Deserialize, Serialize};

use kiln_core::{Context, Error, Result, Tensor, TensorArena, TensorId, TensorRecord, WithDType};
use kiln_nn::{Layer, LayerRegistry, NetConfig, Phase};

/// Name under which automatically created loss tops are listed.
const AUTOMATIC_TOP: &str = "(automatic)";

/// Serialized parameters of one layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerRecord {
    pub name: String,
    #[serde(rename = "type")]
    pub type_name: String,
    pub params: Vec<TensorRecord>,
}

/// Serialized parameters of a whole net.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetRecord {
    pub name: String,
    pub layers: Vec<LayerRecord>,
}

/// A network of layers over one tensor arena.
pub struct Net<T: WithDType> {
    name: String,
    phase: Phase,
    arena: TensorArena<T>,
    layers: Vec<Box<dyn Layer<T>>>,
    layer_names: Vec<String>,
    layer_names_index: HashMap<String, usize>,
    layer_need_backward: Vec<bool>,

    // Blobs are activations, indexed by position in blob_names.
    blob_names: Vec<String>,
    blob_tensors: Vec<TensorId>,
    blob_names_index: HashMap<String, usize>,
    blob_need_backward: Vec<bool>,
    bottom_vecs: Vec<Vec<TensorId>>,
    bottom_id_vecs: Vec<Vec<usize>>,
    bottom_need_backward: Vec<Vec<bool>>,
    top_vecs: Vec<Vec<TensorId>>,
    top_id_vecs: Vec<Vec<usize>>,
    /// (tensor, weight) for every top with a nonzero loss weight.
    loss_tops: Vec<(TensorId, f64)>,

    // Parameters, in the order layers declare them.
    params: Vec<TensorId>,
    param_display_names: Vec<String>,
    param_layer_indices: Vec<(usize, usize)>,
    param_names_index: HashMap<String, usize>,
    param_owners: Vec<Option<usize>>,
    learnable_params: Vec<TensorId>,
    learnable_param_ids: Vec<usize>,
    params_lr: Vec<f64>,
    params_weight_decay: Vec<f64>,

    net_input_blob_indices: Vec<usize>,
    net_output_blob_indices: Vec<usize>,
    debug_info: bool,
}

impl<T: WithDType> Net<T> {
    /// Build a net from the layers of `config` that run in `phase`.
    pub fn new(config: &NetConfig, phase: Phase, ctx: &mut Context) -> Result<Self> {
        Self::with_registry(config, phase, &LayerRegistry::with_builtins(), ctx)
    }

    /// Like [`Net::new`], resolving layer types through `registry`.
    pub fn with_registry(
        config: &NetConfig,
        phase: Phase,
        registry: &LayerRegistry<T>,
        ctx: &mut Context,
    ) -> Result<Self> {
        let config = config.filtered(phase);
        log::info!("Initializing net '{}' in phase {:?}", config.name, phase);
        let mut net = Net {
            name: config.name.clone(),
            phase,
            arena: ctx.new_arena(),
            layers: Vec::new(),
            layer_names: Vec::new(),
            layer_names_index: HashMap::new(),
            layer_need_backward: Vec::new(),
            blob_names: Vec::new(),
            blob_tensors: Vec::new(),
            blob_names_index: HashMap::new(),
            blob_need_backward: Vec::new(),
            bottom_vecs: Vec::new(),
            bottom_id_vecs: Vec::new(),
            bottom_need_backward: Vec::new(),
            top_vecs: Vec::new(),
            top_id_vecs: Vec::new(),
            loss_tops: Vec::new(),
            params: Vec::new(),
            param_display_names: Vec::new(),
            param_layer_indices: Vec::new(),
            param_names_index: HashMap::new(),
            param_owners: Vec::new(),
            learnable_params: Vec::new(),
            learnable_param_ids: Vec::new(),
            params_lr: Vec::new(),
            params_weight_decay: Vec::new(),
            net_input_blob_indices: Vec::new(),
            net_output_blob_indices: Vec::new(),
            debug_info: config.debug_info,
        };

        // Blobs produced so far and not yet consumed; what is left at the end
        // are the net outputs.
        let mut available: BTreeSet<usize> = BTreeSet::new();
        let mut memory_used = 0usize;

        for (layer_id, layer_cfg) in config.layers.iter().enumerate() {
            if net.layer_names_index.contains_key(&layer_cfg.name) {
                kiln_core::config_bail!("duplicate layer name '{}'", layer_cfg.name);
            }
            let mut layer = registry.create(layer_cfg, ctx)?;
            log::info!("Creating layer {}", layer_cfg.name);

            if !layer_cfg.propagate_down.is_empty()
                && layer_cfg.propagate_down.len() != layer_cfg.bottom.len()
            {
                kiln_core::config_bail!(
                    "layer '{}': propagate_down has {} entries for {} bottoms",
                    layer_cfg.name,
                    layer_cfg.propagate_down.len(),
                    layer_cfg.bottom.len()
                );
            }

            // Bottoms.
            let mut need_backward = false;
            let mut bottoms = Vec::new();
            let mut bottom_ids = Vec::new();
            let mut bottom_need = Vec::new();
            for (i, blob_name) in layer_cfg.bottom.iter().enumerate() {
                let blob_id = *net.blob_names_index.get(blob_name).ok_or_else(|| {
                    Error::Config(format!(
                        "unknown bottom blob '{blob_name}' (layer '{}', bottom index {i})",
                        layer_cfg.name
                    ))
                })?;
                log::info!("{} <- {}", layer_cfg.name, blob_name);
                available.remove(&blob_id);
                let propagate = layer_cfg.propagate_down.get(i).copied().unwrap_or(true);
                let need = net.blob_need_backward[blob_id] && propagate;
                need_backward |= need;
                bottoms.push(net.blob_tensors[blob_id]);
                bottom_ids.push(blob_id);
                bottom_need.push(need);
            }

            // Tops.
            let mut tops = Vec::new();
            let mut top_ids = Vec::new();
            for (i, blob_name) in layer_cfg.top.iter().enumerate() {
                let in_place = layer_cfg.bottom.get(i) == Some(blob_name);
                let blob_id = if in_place {
                    if !layer.allows_in_place() {
                        kiln_core::config_bail!(
                            "{} layer '{}' cannot run in place on '{blob_name}'",
                            layer.type_name(),
                            layer_cfg.name
                        );
                    }
                    log::info!("{} -> {} (in-place)", layer_cfg.name, blob_name);
                    bottom_ids[i]
                } else {
                    if net.blob_names_index.contains_key(blob_name) {
                        kiln_core::config_bail!(
                            "top blob '{blob_name}' produced by multiple sources (layer '{}')",
                            layer_cfg.name
                        );
                    }
                    log::info!("{} -> {}", layer_cfg.name, blob_name);
                    net.append_blob(blob_name, true)
                };
                available.insert(blob_id);
                tops.push(net.blob_tensors[blob_id]);
                top_ids.push(blob_id);
            }
            if layer_cfg.top.is_empty() && layer.is_loss() {
                let blob_id = net.append_blob(AUTOMATIC_TOP, false);
                available.insert(blob_id);
                tops.push(net.blob_tensors[blob_id]);
                top_ids.push(blob_id);
            }
            if layer.type_name() == "Input" {
                net.net_input_blob_indices.extend(top_ids.iter().copied());
            }

            log::info!("Setting up {}", layer_cfg.name);
            layer.setup(&mut net.arena, &bottoms, &tops)?;
            for (i, &id) in tops.iter().enumerate() {
                let t = net.arena.get(id);
                log::info!("Top shape: {}", t.shape_string());
                let weight = layer.loss_weight(i);
                if weight != 0.0 {
                    log::info!("    with loss weight {weight}");
                    net.loss_tops.push((id, weight));
                }
                memory_used += t.count();
            }

            net.layer_names_index.insert(layer_cfg.name.clone(), layer_id);
            net.layer_names.push(layer_cfg.name.clone());

            // Parameters.
            for (param_id, &param) in layer.params().iter().enumerate() {
                let spec = layer_cfg.param_spec(param_id);
                need_backward |= spec.lr_mult != 0.0;
                net.append_param(layer_id, &layer_cfg.name, param_id, param, &spec)?;
            }

            for &blob_id in &top_ids {
                net.blob_need_backward[blob_id] = need_backward;
            }
            net.layers.push(layer);
            net.layer_need_backward.push(need_backward);
            net.bottom_vecs.push(bottoms);
            net.bottom_id_vecs.push(bottom_ids);
            net.bottom_need_backward.push(bottom_need);
            net.top_vecs.push(tops);
            net.top_id_vecs.push(top_ids);
        }

        net.prune_backward(config.force_backward);
        net.net_output_blob_indices = available.into_iter().collect();
        for &i in &net.net_output_blob_indices {
            log::info!("This network produces output {}", net.blob_names[i]);
        }
        net.share_weights();
        log::info!(
            "Memory required for data: {} bytes",
            memory_used * std::mem::size_of::<T>()
        );
        log::info!("Network initialization done.");
        Ok(net)
    }

    fn append_blob(&mut self, name: &str, indexed: bool) -> usize {
        let blob_id = self.blob_names.len();
        self.blob_names.push(name.to_string());
        self.blob_tensors.push(self.arena.alloc());
        self.blob_need_backward.push(false);
        if indexed {
            self.blob_names_index.insert(name.to_string(), blob_id);
        }
        blob_id
    }

    fn append_param(
        &mut self,
        layer_id: usize,
        layer_name: &str,
        param_id: usize,
        tensor: TensorId,
        spec: &kiln_nn::ParamSpec,
    ) -> Result<()> {
        let net_param_id = self.params.len();
        let display = spec.name.clone().unwrap_or_else(|| param_id.to_string());
        self.params.push(tensor);
        self.param_display_names.push(display);
        self.param_layer_indices.push((layer_id, param_id));

        let owner = spec
            .name
            .as_ref()
            .filter(|n| !n.is_empty())
            .and_then(|n| self.param_names_index.get(n).copied());
        match owner {
            None => {
                self.param_owners.push(None);
                if let Some(name) = spec.name.as_ref().filter(|n| !n.is_empty()) {
                    self.param_names_index.insert(name.clone(), net_param_id);
                }
                self.learnable_param_ids.push(self.learnable_params.len());
                self.learnable_params.push(tensor);
                self.params_lr.push(spec.lr_mult);
                self.params_weight_decay.push(spec.decay_mult);
            }
            Some(owner_id) => {
                let name = spec.name.as_deref().unwrap_or_default();
                let (owner_layer, owner_param) = self.param_layer_indices[owner_id];
                log::info!(
                    "Sharing parameters '{name}' owned by layer '{}', param index {owner_param}",
                    self.layer_names[owner_layer]
                );
                let owner_shape = self.arena.get(self.params[owner_id]).shape().clone();
                let this_shape = self.arena.get(tensor).shape().clone();
                if owner_shape != this_shape {
                    kiln_core::config_bail!(
                        "cannot share param '{name}' owned by layer '{}' with layer '{layer_name}': shape {this_shape} differs from owner shape {owner_shape}",
                        self.layer_names[owner_layer]
                    );
                }
                let learnable_id = self.learnable_param_ids[owner_id];
                if self.params_lr[learnable_id] != spec.lr_mult {
                    log::warn!(
                        "Shared param '{name}' in layer '{layer_name}' has lr_mult {}, using the owner's {}",
                        spec.lr_mult,
                        self.params_lr[learnable_id]
                    );
                }
                if self.params_weight_decay[learnable_id] != spec.decay_mult {
                    log::warn!(
                        "Shared param '{name}' in layer '{layer_name}' has decay_mult {}, using the owner's {}",
                        spec.decay_mult,
                        self.params_weight_decay[learnable_id]
                    );
                }
                self.param_owners.push(Some(owner_id));
                self.learnable_param_ids.push(learnable_id);
            }
        }
        Ok(())
    }

    fn prune_backward(&mut self, force_backward: bool) {
        let mut under_loss: BTreeSet<usize> = BTreeSet::new();
        let mut skip_backprop: BTreeSet<usize> = BTreeSet::new();
        for layer_id in (0..self.layers.len()).rev() {
            let mut contributes = false;
            let mut skip_propagate_down = true;
            for (i, &blob_id) in self.top_id_vecs[layer_id].iter().enumerate() {
                if self.layers[layer_id].loss_weight(i) != 0.0 || under_loss.contains(&blob_id) {
                    contributes = true;
                }
                if !skip_backprop.contains(&blob_id) {
                    skip_propagate_down = false;
                }
            }
            if self.layer_need_backward[layer_id] && skip_propagate_down {
                self.layer_need_backward[layer_id] = false;
                self.bottom_need_backward[layer_id].iter_mut().for_each(|b| *b = false);
            }
            if !contributes {
                self.layer_need_backward[layer_id] = false;
            }
            if self.layer_need_backward[layer_id] {
                log::info!("{} needs backward computation.", self.layer_names[layer_id]);
            } else {
                log::info!("{} does not need backward computation.", self.layer_names[layer_id]);
            }
            for (i, &blob_id) in self.bottom_id_vecs[layer_id].iter().enumerate() {
                if contributes {
                    under_loss.insert(blob_id);
                } else {
                    self.bottom_need_backward[layer_id][i] = false;
                }
                if !self.bottom_need_backward[layer_id][i] {
                    skip_backprop.insert(blob_id);
                }
            }
        }
        if force_backward {
            for layer_id in 0..self.layers.len() {
                self.layer_need_backward[layer_id] = true;
                for i in 0..self.bottom_need_backward[layer_id].len() {
                    let forced = self.bottom_need_backward[layer_id][i]
                        || self.layers[layer_id].allow_force_backward(i);
                    self.bottom_need_backward[layer_id][i] = forced;
                    let blob_id = self.bottom_id_vecs[layer_id][i];
                    self.blob_need_backward[blob_id] |= forced;
                }
            }
        }
    }

    /// Point every sharing layer at its owner's tensor and free its own copy.
    fn share_weights(&mut self) {
        for i in 0..self.params.len() {
            let Some(owner) = self.param_owners[i] else {
                continue;
            };
            let (layer_id, param_id) = self.param_layer_indices[i];
            let own = self.params[i];
            let shared = self.params[owner];
            if own == shared {
                continue;
            }
            self.layers[layer_id].params_mut()[param_id] = shared;
            self.params[i] = shared;
            self.arena.release(own);
        }
    }

    // Execution

    /// Run layers `start..=end` forward and return their summed loss.
    ///
    /// Panics if the range is out of bounds.
    pub fn forward_from_to(&mut self, start: usize, end: usize) -> Result<T> {
        assert!(
            start <= end && end < self.layers.len(),
            "forward_from_to({start}, {end}) out of range for {} layers",
            self.layers.len()
        );
        let mut loss = T::zero();
        for i in start..=end {
            let layer_loss = self.layers[i].forward(&self.arena, &self.bottom_vecs[i], &self.top_vecs[i])?;
            loss += layer_loss;
            if self.debug_info {
                self.forward_debug_info(i)?;
            }
        }
        Ok(loss)
    }

    pub fn forward_from(&mut self, start: usize) -> Result<T> {
        let end = self.layers.len().saturating_sub(1);
        self.forward_from_to(start, end)
    }

    pub fn forward_to(&mut self, end: usize) -> Result<T> {
        self.forward_from_to(0, end)
    }

    /// Run every layer forward and return the total weighted loss.
    pub fn forward(&mut self) -> Result<T> {
        if self.layers.is_empty() {
            return Ok(T::zero());
        }
        let loss = self.forward_from_to(0, self.layers.len() - 1)?;
        if self.debug_info {
            log::info!("    [Forward] All net loss: {loss}");
        }
        Ok(loss)
    }

    /// Run every layer backward, from freshly seeded loss gradients.
    pub fn backward(&mut self) -> Result<()> {
        if self.layers.is_empty() {
            return Ok(());
        }
        for &id in &self.blob_tensors {
            let mut t = self.arena.get(id);
            if t.count() > 0 {
                t.mutable_diff()?.iter_mut().for_each(|d| *d = T::zero());
            }
        }
        for &(id, weight) in &self.loss_tops {
            let w = T::from_f64(weight);
            self.arena.get(id).mutable_diff()?.iter_mut().for_each(|d| *d = w);
        }
        self.run_backward(self.layers.len() - 1, 0)?;
        if self.debug_info {
            self.backward_summary()?;
        }
        Ok(())
    }

    /// Run layers `start` down to `end` backward.
    ///
    /// The tops of layer `start` keep whatever diffs they hold; the bottoms of
    /// every layer in the range are zeroed first. Panics if the range is out of
    /// bounds.
    pub fn backward_from_to(&mut self, start: usize, end: usize) -> Result<()> {
        assert!(
            end <= start && start < self.layers.len(),
            "backward_from_to({start}, {end}) out of range for {} layers",
            self.layers.len()
        );
        let keep: BTreeSet<TensorId> = self.top_vecs[start].iter().copied().collect();
        let mut cleared: BTreeSet<TensorId> = BTreeSet::new();
        for i in end..=start {
            for &id in &self.bottom_vecs[i] {
                if !keep.contains(&id) && cleared.insert(id) {
                    self.arena.get(id).mutable_diff()?.iter_mut().for_each(|d| *d = T::zero());
                }
            }
        }
        self.run_backward(start, end)
    }

    pub fn backward_from(&mut self, start: usize) -> Result<()> {
        self.backward_from_to(start, 0)
    }

    pub fn backward_to(&mut self, end: usize) -> Result<()> {
        let start = self.layers.len().saturating_sub(1);
        self.backward_from_to(start, end)
    }

    fn run_backward(&mut self, start: usize, end: usize) -> Result<()> {
        for i in (end..=start).rev() {
            if !self.layer_need_backward[i] {
                continue;
            }
            self.layers[i].backward(
                &self.arena,
                &self.top_vecs[i],
                &self.bottom_need_backward[i],
                &self.bottom_vecs[i],
            )?;
            if self.debug_info {
                self.backward_debug_info(i)?;
            }
        }
        Ok(())
    }

    /// forward() then backward(); returns the loss.
    pub fn forward_backward(&mut self) -> Result<T> {
        let loss = self.forward()?;
        self.backward()?;
        Ok(loss)
    }

    /// Propagate shapes through every layer after an input was reshaped.
    pub fn reshape(&mut self) -> Result<()> {
        for i in 0..self.layers.len() {
            self.layers[i].reshape(&self.arena, &self.bottom_vecs[i], &self.top_vecs[i])?;
        }
        Ok(())
    }

    /// Zero the gradient of every learnable parameter.
    pub fn clear_param_diffs(&mut self) -> Result<()> {
        for &id in &self.learnable_params {
            self.arena.get(id).mutable_diff()?.iter_mut().for_each(|d| *d = T::zero());
        }
        Ok(())
    }

    /// Apply `data -= diff` once to every learnable parameter.
    pub fn update(&mut self) -> Result<()> {
        if self.debug_info {
            self.update_debug_info()?;
        }
        for &id in &self.learnable_params {
            self.arena.get(id).update()?;
        }
        Ok(())
    }

    // Debug logging

    fn mean_abs(t: &mut Tensor<T>, diff: bool) -> Result<f64> {
        if t.count() == 0 {
            return Ok(0.0);
        }
        let asum = if diff { t.asum_diff()? } else { t.asum_data()? };
        Ok(asum.as_f64() / t.count() as f64)
    }

    fn forward_debug_info(&self, layer_id: usize) -> Result<()> {
        for (&id, &blob) in self.top_vecs[layer_id].iter().zip(&self.top_id_vecs[layer_id]) {
            let value = Self::mean_abs(&mut self.arena.get(id), false)?;
            log::info!(
                "    [Forward] Layer {}, top blob {} data: {value}",
                self.layer_names[layer_id],
                self.blob_names[blob]
            );
        }
        for (param_id, &id) in self.layers[layer_id].params().iter().enumerate() {
            let value = Self::mean_abs(&mut self.arena.get(id), false)?;
            log::info!(
                "    [Forward] Layer {}, param blob {param_id} data: {value}",
                self.layer_names[layer_id]
            );
        }
        Ok(())
    }

    fn backward_debug_info(&self, layer_id: usize) -> Result<()> {
        for (i, (&id, &blob)) in self.bottom_vecs[layer_id]
            .iter()
            .zip(&self.bottom_id_vecs[layer_id])
            .enumerate()
        {
            if !self.bottom_need_backward[layer_id][i] {
                continue;
            }
            let value = Self::mean_abs(&mut self.arena.get(id), true)?;
            log::info!(
                "    [Backward] Layer {}, bottom blob {} diff: {value}",
                self.layer_names[layer_id],
                self.blob_names[blob]
            );
        }
        for (param_id, &id) in self.layers[layer_id].params().iter().enumerate() {
            let value = Self::mean_abs(&mut self.arena.get(id), true)?;
            log::info!(
                "    [Backward] Layer {}, param blob {param_id} diff: {value}",
                self.layer_names[layer_id]
            );
        }
        Ok(())
    }

    fn backward_summary(&self) -> Result<()> {
        let (mut asum_data, mut asum_diff, mut sumsq_data, mut sumsq_diff) = (0.0, 0.0, 0.0, 0.0);
        for &id in &self.learnable_params {
            let mut t = self.arena.get(id);
            asum_data += t.asum_data()?.as_f64();
            asum_diff += t.asum_diff()?.as_f64();
            sumsq_data += t.sumsq_data()?.as_f64();
            sumsq_diff += t.sumsq_diff()?.as_f64();
        }
        log::info!(
            "    [Backward] All net params (data, diff): L1 norm = ({asum_data}, {asum_diff}); L2 norm = ({}, {})",
            sumsq_data.sqrt(),
            sumsq_diff.sqrt()
        );
        Ok(())
    }

    /// Log each learnable parameter's data and pending update magnitudes.
    pub fn update_debug_info(&self) -> Result<()> {
        for (i, &id) in self.params.iter().enumerate() {
            let (layer_id, _) = self.param_layer_indices[i];
            let mut t = self.arena.get(id);
            let data = Self::mean_abs(&mut t, false)?;
            match self.param_owners[i] {
                None => {
                    let diff = Self::mean_abs(&mut t, true)?;
                    log::info!(
                        "    [Update] Layer {}, param {} data: {data}; diff: {diff}",
                        self.layer_names[layer_id],
                        self.param_display_names[i]
                    );
                }
                Some(owner) => {
                    let (owner_layer, _) = self.param_layer_indices[owner];
                    log::info!(
                        "    [Update] Layer {}, param {} data: {data}; diff: shared with {}",
                        self.layer_names[layer_id],
                        self.param_display_names[i],
                        self.layer_names[owner_layer]
                    );
                }
            }
        }
        Ok(())
    }

    // Records

    /// Parameters of every layer, with gradients when `write_diff` is set.
    pub fn to_record(&self, write_diff: bool) -> Result<NetRecord> {
        let mut layers = Vec::with_capacity(self.layers.len());
        for (layer, name) in self.layers.iter().zip(&self.layer_names) {
            let mut params = Vec::with_capacity(layer.params().len());
            for &id in layer.params() {
                params.push(self.arena.get(id).to_record(write_diff)?);
            }
            layers.push(LayerRecord {
                name: name.clone(),
                type_name: layer.type_name().to_string(),
                params,
            });
        }
        Ok(NetRecord {
            name: self.name.clone(),
            layers,
        })
    }

    /// Load parameters from `record` into layers of the same name.
    ///
    /// Layers missing from this net are skipped. A parameter count or shape
    /// mismatch is an error.
    pub fn copy_trained_layers_from(&mut self, record: &NetRecord) -> Result<()> {
        // Every matched layer is checked before any parameter is written.
        let mut matched = Vec::new();
        for source in &record.layers {
            let Some(&layer_id) = self.layer_names_index.get(&source.name) else {
                log::info!("Ignoring source layer {}", source.name);
                continue;
            };
            let params = self.layers[layer_id].params();
            if params.len() != source.params.len() {
                kiln_core::config_bail!(
                    "incompatible number of params for layer '{}': {} in net, {} in record",
                    source.name,
                    params.len(),
                    source.params.len()
                );
            }
            for (&id, rec) in params.iter().zip(&source.params) {
                let t = self.arena.get(id);
                if let Err(e) = t.check_record(rec) {
                    log::error!(
                        "Cannot copy param of layer '{}'; shape mismatch. Source param shape is {}; target param shape is {}",
                        source.name,
                        rec.shape.to_shape(),
                        t.shape()
                    );
                    return Err(e);
                }
            }
            matched.push((layer_id, source));
        }
        for (layer_id, source) in matched {
            log::debug!("Copying source layer {}", source.name);
            for (&id, rec) in self.layers[layer_id].params().iter().zip(&source.params) {
                self.arena.get(id).from_record(rec, false)?;
            }
        }
        Ok(())
    }

    // Accessors

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn arena(&self) -> &TensorArena<T> {
        &self.arena
    }

    /// Borrow a tensor of this net by id.
    pub fn tensor(&self, id: TensorId) -> RefMut<'_, Tensor<T>> {
        self.arena.get(id)
    }

    pub fn layers(&self) -> &[Box<dyn Layer<T>>] {
        &self.layers
    }

    pub fn layer_names(&self) -> &[String] {
        &self.layer_names
    }

    pub fn blob_names(&self) -> &[String] {
        &self.blob_names
    }

    pub fn has_blob(&self, name: &str) -> bool {
        self.blob_names_index.contains_key(name)
    }

    pub fn blob_id(&self, name: &str) -> Option<TensorId> {
        self.blob_names_index.get(name).map(|&i| self.blob_tensors[i])
    }

    /// Borrow the blob called `name`.
    pub fn blob_by_name(&self, name: &str) -> Option<RefMut<'_, Tensor<T>>> {
        self.blob_id(name).map(|id| self.arena.get(id))
    }

    pub fn has_layer(&self, name: &str) -> bool {
        self.layer_names_index.contains_key(name)
    }

    pub fn layer_by_name(&self, name: &str) -> Option<&dyn Layer<T>> {
        self.layer_names_index.get(name).map(|&i| self.layers[i].as_ref())
    }

    pub fn layer_by_name_mut(&mut self, name: &str) -> Option<&mut dyn Layer<T>> {
        let i = *self.layer_names_index.get(name)?;
        Some(self.layers[i].as_mut())
    }

    /// Bottom tensors of layer `i`.
    pub fn bottom_ids(&self, i: usize) -> &[TensorId] {
        &self.bottom_vecs[i]
    }

    /// Top tensors of layer `i`.
    pub fn top_ids(&self, i: usize) -> &[TensorId] {
        &self.top_vecs[i]
    }

    pub fn layer_need_backward(&self) -> &[bool] {
        &self.layer_need_backward
    }

    pub fn bottom_need_backward(&self) -> &[Vec<bool>] {
        &self.bottom_need_backward
    }

    pub fn blob_need_backward(&self, name: &str) -> Option<bool> {
        self.blob_names_index.get(name).map(|&i| self.blob_need_backward[i])
    }

    /// Every parameter in declaration order, shared ones repeated.
    pub fn params(&self) -> &[TensorId] {
        &self.params
    }

    /// Parameters the solver updates: one entry per distinct tensor.
    pub fn learnable_params(&self) -> &[TensorId] {
        &self.learnable_params
    }

    pub fn params_lr(&self) -> &[f64] {
        &self.params_lr
    }

    pub fn params_weight_decay(&self) -> &[f64] {
        &self.params_weight_decay
    }

    /// For each entry of [`Net::params`], the index of its owner when shared.
    pub fn param_owners(&self) -> &[Option<usize>] {
        &self.param_owners
    }

    pub fn param_display_names(&self) -> &[String] {
        &self.param_display_names
    }

    pub fn input_blobs(&self) -> Vec<TensorId> {
        self.net_input_blob_indices.iter().map(|&i| self.blob_tensors[i]).collect()
    }

    pub fn output_blobs(&self) -> Vec<TensorId> {
        self.net_output_blob_indices.iter().map(|&i| self.blob_tensors[i]).collect()
    }

    pub fn input_blob_names(&self) -> Vec<&str> {
        self.net_input_blob_indices.iter().map(|&i| self.blob_names[i].as_str()).collect()
    }

    pub fn output_blob_names(&self) -> Vec<&str> {
        self.net_output_blob_indices.iter().map(|&i| self.blob_names[i].as_str()).collect()
    }

    pub fn set_debug_info(&mut self, debug_info: bool) {
        self.debug_info = debug_info;
    }
}

impl<T: WithDType> std::fmt::Debug for Net<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Net")
            .field("name", &self.name)
            .field("phase", &self.phase)
            .field("layers", &self.layer_names)
            .field("blobs", &self.blob_names)
            .field("learnable_params", &self.learnable_params.len())
            .finish()
    }
}
