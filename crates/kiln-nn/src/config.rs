// Configuration records for layers and nets
//
// These arrive already validated in shape (serde does the structural work);
// semantic checks such as arity, blob wiring, and hyper-parameter ranges
// happen when the layer or net is built and surface as Error::Config.
//
// JSON form of a layer:
//
//   {
//     "name": "ip1",
//     "kind": { "type": "InnerProduct", "num_output": 10,
//               "weight_filler": { "type": "xavier" } },
//     "bottom": ["data"],
//     "top": ["ip1"],
//     "params": [{ "name": "w", "lr_mult": 1.0 }, { "lr_mult": 2.0 }]
//   }

use serde::{Deserialize, Serialize};

use kiln_core::{Error, Result};

/// Whether a net is being trained or evaluated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Phase {
    #[default]
    Train,
    Test,
}

/// Per-parameter settings: sharing name and update multipliers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ParamSpec {
    /// Parameters with the same name are shared across layers.
    pub name: Option<String>,
    /// Multiplier on the solver's learning rate.
    pub lr_mult: f64,
    /// Multiplier on the solver's weight decay.
    pub decay_mult: f64,
}

impl Default for ParamSpec {
    fn default() -> Self {
        ParamSpec {
            name: None,
            lr_mult: 1.0,
            decay_mult: 1.0,
        }
    }
}

impl ParamSpec {
    pub fn named(name: impl Into<String>) -> Self {
        ParamSpec {
            name: Some(name.into()),
            ..Default::default()
        }
    }

    pub fn with_lr_mult(mut self, lr_mult: f64) -> Self {
        self.lr_mult = lr_mult;
        self
    }

    pub fn with_decay_mult(mut self, decay_mult: f64) -> Self {
        self.decay_mult = decay_mult;
        self
    }
}

/// Which fan a variance-scaling filler normalizes by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VarianceNorm {
    #[default]
    FanIn,
    FanOut,
    Average,
}

/// How a parameter tensor is initialized.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FillerConfig {
    Constant {
        #[serde(default)]
        value: f64,
    },
    Uniform {
        min: f64,
        max: f64,
    },
    Gaussian {
        #[serde(default)]
        mean: f64,
        std: f64,
    },
    Xavier {
        #[serde(default)]
        variance_norm: VarianceNorm,
    },
    Msra {
        #[serde(default)]
        variance_norm: VarianceNorm,
    },
}

impl Default for FillerConfig {
    fn default() -> Self {
        FillerConfig::Constant { value: 0.0 }
    }
}

// Kind-specific parameters

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct InputParams {
    /// One shape per top, or a single shape applied to every top.
    pub shape: Vec<Vec<usize>>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryDataParams {
    pub batch_size: usize,
    /// Shape of one sample (without the batch axis).
    pub sample_shape: Vec<usize>,
    /// Shape of one target (without the batch axis); empty for scalars.
    pub target_shape: Vec<usize>,
    /// Samples laid out back to back.
    pub data: Vec<f64>,
    pub targets: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InnerProductParams {
    pub num_output: usize,
    pub bias_term: bool,
    pub weight_filler: FillerConfig,
    pub bias_filler: FillerConfig,
    /// First axis to flatten into the inner product.
    pub axis: isize,
    /// Store the weight as [K, N] instead of [N, K].
    pub transpose: bool,
}

impl Default for InnerProductParams {
    fn default() -> Self {
        InnerProductParams {
            num_output: 0,
            bias_term: true,
            weight_filler: FillerConfig::default(),
            bias_filler: FillerConfig::default(),
            axis: 1,
            transpose: false,
        }
    }
}

/// What a softmax loss divides its summed loss by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LossNormalization {
    /// All outputs, including ignored ones.
    Full,
    /// Outputs whose label is not ignored.
    #[default]
    Valid,
    /// The batch size.
    BatchSize,
    None,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SoftmaxLossParams {
    pub axis: isize,
    pub ignore_label: Option<i64>,
    pub normalization: LossNormalization,
}

impl Default for SoftmaxLossParams {
    fn default() -> Self {
        SoftmaxLossParams {
            axis: 1,
            ignore_label: None,
            normalization: LossNormalization::Valid,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ReluParams {
    pub negative_slope: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClipParams {
    pub min: f64,
    pub max: f64,
}

/// `y = base ^ (shift + scale * x)`; a base of -1 means e.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExpParams {
    pub base: f64,
    pub scale: f64,
    pub shift: f64,
}

impl Default for ExpParams {
    fn default() -> Self {
        ExpParams {
            base: -1.0,
            scale: 1.0,
            shift: 0.0,
        }
    }
}

/// `y = log_base(shift + scale * x)`; a base of -1 means e.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogParams {
    pub base: f64,
    pub scale: f64,
    pub shift: f64,
}

impl Default for LogParams {
    fn default() -> Self {
        LogParams {
            base: -1.0,
            scale: 1.0,
            shift: 0.0,
        }
    }
}

/// `y = (shift + scale * x) ^ power`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PowerParams {
    pub power: f64,
    pub scale: f64,
    pub shift: f64,
}

impl Default for PowerParams {
    fn default() -> Self {
        PowerParams {
            power: 1.0,
            scale: 1.0,
            shift: 0.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DropoutParams {
    /// Probability of dropping an element.
    pub ratio: f64,
}

impl Default for DropoutParams {
    fn default() -> Self {
        DropoutParams { ratio: 0.5 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SliceParams {
    pub axis: isize,
    /// Indices along `axis` where each new top begins. Empty splits evenly.
    pub slice_points: Vec<usize>,
}

impl Default for SliceParams {
    fn default() -> Self {
        SliceParams {
            axis: 1,
            slice_points: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConcatParams {
    pub axis: isize,
}

impl Default for ConcatParams {
    fn default() -> Self {
        ConcatParams { axis: 1 }
    }
}

/// The layer kind tag plus its kind-specific parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum LayerKind {
    Input(InputParams),
    MemoryData(MemoryDataParams),
    InnerProduct(InnerProductParams),
    EuclideanLoss,
    SoftmaxWithLoss(SoftmaxLossParams),
    ReLU(ReluParams),
    Sigmoid,
    TanH,
    AbsVal,
    Clip(ClipParams),
    Exp(ExpParams),
    Log(LogParams),
    Power(PowerParams),
    Dropout(DropoutParams),
    Slice(SliceParams),
    Concat(ConcatParams),
    /// A kind registered at runtime; `params` is handed to its creator.
    Custom {
        type_name: String,
        #[serde(default)]
        params: serde_json::Value,
    },
}

impl LayerKind {
    /// The registry key for this kind.
    pub fn type_name(&self) -> &str {
        match self {
            LayerKind::Input(_) => "Input",
            LayerKind::MemoryData(_) => "MemoryData",
            LayerKind::InnerProduct(_) => "InnerProduct",
            LayerKind::EuclideanLoss => "EuclideanLoss",
            LayerKind::SoftmaxWithLoss(_) => "SoftmaxWithLoss",
            LayerKind::ReLU(_) => "ReLU",
            LayerKind::Sigmoid => "Sigmoid",
            LayerKind::TanH => "TanH",
            LayerKind::AbsVal => "AbsVal",
            LayerKind::Clip(_) => "Clip",
            LayerKind::Exp(_) => "Exp",
            LayerKind::Log(_) => "Log",
            LayerKind::Power(_) => "Power",
            LayerKind::Dropout(_) => "Dropout",
            LayerKind::Slice(_) => "Slice",
            LayerKind::Concat(_) => "Concat",
            LayerKind::Custom { type_name, .. } => type_name,
        }
    }
}

/// Configuration of one layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerConfig {
    pub name: String,
    pub kind: LayerKind,
    #[serde(default)]
    pub bottom: Vec<String>,
    #[serde(default)]
    pub top: Vec<String>,
    /// One entry per learnable parameter; missing entries use defaults.
    #[serde(default)]
    pub params: Vec<ParamSpec>,
    /// One weight per top; empty means the layer's default.
    #[serde(default)]
    pub loss_weight: Vec<f64>,
    /// One flag per bottom; empty means "as the net decides".
    #[serde(default)]
    pub propagate_down: Vec<bool>,
    /// Only build this layer in the given phase.
    #[serde(default)]
    pub include: Option<Phase>,
    /// The phase the layer runs in; set by the net.
    #[serde(default)]
    pub phase: Phase,
}

impl LayerConfig {
    pub fn new(name: impl Into<String>, kind: LayerKind) -> Self {
        LayerConfig {
            name: name.into(),
            kind,
            bottom: Vec::new(),
            top: Vec::new(),
            params: Vec::new(),
            loss_weight: Vec::new(),
            propagate_down: Vec::new(),
            include: None,
            phase: Phase::Train,
        }
    }

    pub fn with_bottom(mut self, name: impl Into<String>) -> Self {
        self.bottom.push(name.into());
        self
    }

    pub fn with_top(mut self, name: impl Into<String>) -> Self {
        self.top.push(name.into());
        self
    }

    pub fn with_param(mut self, spec: ParamSpec) -> Self {
        self.params.push(spec);
        self
    }

    pub fn with_loss_weight(mut self, weight: f64) -> Self {
        self.loss_weight.push(weight);
        self
    }

    pub fn with_propagate_down(mut self, flags: Vec<bool>) -> Self {
        self.propagate_down = flags;
        self
    }

    pub fn with_include(mut self, phase: Phase) -> Self {
        self.include = Some(phase);
        self
    }

    pub fn with_phase(mut self, phase: Phase) -> Self {
        self.phase = phase;
        self
    }

    /// The spec for parameter `index`, defaulted when not configured.
    pub fn param_spec(&self, index: usize) -> ParamSpec {
        self.params.get(index).cloned().unwrap_or_default()
    }

    /// The error a creator returns when handed the wrong kind.
    pub fn kind_mismatch(&self, expected: &str) -> Error {
        Error::Config(format!(
            "layer '{}' has type {} but was built as {}",
            self.name,
            self.kind.type_name(),
            expected
        ))
    }
}

/// Configuration of a whole net.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NetConfig {
    pub name: String,
    pub layers: Vec<LayerConfig>,
    /// Compute gradients for every bottom that allows it, even when no loss needs them.
    pub force_backward: bool,
    /// Log per-layer data and gradient magnitudes.
    pub debug_info: bool,
}

impl NetConfig {
    pub fn new(name: impl Into<String>) -> Self {
        NetConfig {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_layer(mut self, layer: LayerConfig) -> Self {
        self.layers.push(layer);
        self
    }

    pub fn with_force_backward(mut self, force: bool) -> Self {
        self.force_backward = force;
        self
    }

    pub fn with_debug_info(mut self, debug_info: bool) -> Self {
        self.debug_info = debug_info;
        self
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// The layers that run in `phase`, each stamped with that phase.
    pub fn filtered(&self, phase: Phase) -> NetConfig {
        let layers = self
            .layers
            .iter()
            .filter(|l| l.include.map_or(true, |p| p == phase))
            .cloned()
            .map(|l| l.with_phase(phase))
            .collect();
        NetConfig {
            name: self.name.clone(),
            layers,
            force_backward: self.force_backward,
            debug_info: self.debug_info,
        }
    }
}
