// SolverConfig: optimization hyper-parameters plus the net to train
//
// JSON form:
//
//   {
//     "net": { "name": "lsq", "layers": [ ... ] },
//     "type": "Adam",
//     "base_lr": 0.001,
//     "lr_policy": { "type": "step", "gamma": 0.1, "stepsize": 1000 },
//     "momentum": 0.9,
//     "max_iter": 10000,
//     "snapshot": 5000,
//     "snapshot_prefix": "runs/lsq"
//   }
//
// Every field except "net" has a default.

use serde::{Deserialize, Serialize};

use kiln_core::Result;
use kiln_nn::NetConfig;

use super::lr_policy::LrPolicy;

/// Which update rule the solver applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum SolverKind {
    #[default]
    #[serde(rename = "SGD")]
    Sgd,
    Nesterov,
    AdaGrad,
    #[serde(rename = "RMSProp")]
    RmsProp,
    AdaDelta,
    Adam,
}

impl SolverKind {
    pub fn name(&self) -> &'static str {
        match self {
            SolverKind::Sgd => "SGD",
            SolverKind::Nesterov => "Nesterov",
            SolverKind::AdaGrad => "AdaGrad",
            SolverKind::RmsProp => "RMSProp",
            SolverKind::AdaDelta => "AdaDelta",
            SolverKind::Adam => "Adam",
        }
    }
}

impl std::fmt::Display for SolverKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Penalty folded into the gradient before the update rule runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Regularization {
    #[default]
    L2,
    L1,
}

/// On-disk encoding of snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotFormat {
    #[default]
    Binary,
    Json,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SolverConfig {
    pub net: NetConfig,
    #[serde(rename = "type")]
    pub kind: SolverKind,
    pub base_lr: f64,
    pub lr_policy: LrPolicy,
    pub max_iter: usize,
    /// Momentum for SGD and Nesterov, decay for AdaDelta, beta1 for Adam.
    pub momentum: f64,
    /// Adam's beta2.
    pub momentum2: f64,
    /// Stability constant of the adaptive rules.
    pub delta: f64,
    /// RMSProp's decay of the squared-gradient average.
    pub rms_decay: f64,
    pub weight_decay: f64,
    pub regularization: Regularization,
    /// Scale gradients down when their global L2 norm exceeds this.
    pub clip_gradients: Option<f64>,
    /// Micro-batches accumulated per update.
    pub iter_size: usize,
    /// Log every `display` iterations; 0 disables.
    pub display: usize,
    /// Window of the smoothed loss.
    pub average_loss: usize,
    /// Snapshot every `snapshot` iterations; 0 disables.
    pub snapshot: usize,
    pub snapshot_prefix: String,
    pub snapshot_format: SnapshotFormat,
    /// Also write parameter gradients into model snapshots.
    pub snapshot_diff: bool,
    pub snapshot_after_train: bool,
    pub random_seed: Option<u64>,
    pub debug_info: bool,
}

impl Default for SolverConfig {
    fn default() -> Self {
        SolverConfig {
            net: NetConfig::default(),
            kind: SolverKind::Sgd,
            base_lr: 0.01,
            lr_policy: LrPolicy::Fixed,
            max_iter: 0,
            momentum: 0.0,
            momentum2: 0.999,
            delta: 1e-8,
            rms_decay: 0.95,
            weight_decay: 0.0,
            regularization: Regularization::L2,
            clip_gradients: None,
            iter_size: 1,
            display: 0,
            average_loss: 1,
            snapshot: 0,
            snapshot_prefix: String::new(),
            snapshot_format: SnapshotFormat::Binary,
            snapshot_diff: false,
            snapshot_after_train: true,
            random_seed: None,
            debug_info: false,
        }
    }
}

impl SolverConfig {
    pub fn new(net: NetConfig, kind: SolverKind) -> Self {
        SolverConfig {
            net,
            kind,
            ..Default::default()
        }
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn with_base_lr(mut self, base_lr: f64) -> Self {
        self.base_lr = base_lr;
        self
    }

    pub fn with_lr_policy(mut self, policy: LrPolicy) -> Self {
        self.lr_policy = policy;
        self
    }

    pub fn with_max_iter(mut self, max_iter: usize) -> Self {
        self.max_iter = max_iter;
        self
    }

    pub fn with_momentum(mut self, momentum: f64) -> Self {
        self.momentum = momentum;
        self
    }

    pub fn with_weight_decay(mut self, weight_decay: f64) -> Self {
        self.weight_decay = weight_decay;
        self
    }

    pub fn with_delta(mut self, delta: f64) -> Self {
        self.delta = delta;
        self
    }

    pub fn with_iter_size(mut self, iter_size: usize) -> Self {
        self.iter_size = iter_size;
        self
    }

    pub fn with_snapshot(mut self, every: usize, prefix: impl Into<String>) -> Self {
        self.snapshot = every;
        self.snapshot_prefix = prefix.into();
        self
    }

    pub fn with_random_seed(mut self, seed: u64) -> Self {
        self.random_seed = Some(seed);
        self
    }

    /// Reject hyper-parameters the update rules cannot work with.
    pub fn validate(&self) -> Result<()> {
        if !self.base_lr.is_finite() || self.base_lr < 0.0 {
            kiln_core::config_bail!("base_lr must be a non-negative number, got {}", self.base_lr);
        }
        if self.iter_size == 0 {
            kiln_core::config_bail!("iter_size must be at least 1");
        }
        if self.average_loss == 0 {
            kiln_core::config_bail!("average_loss must be at least 1");
        }
        if !self.momentum.is_finite() || self.momentum < 0.0 {
            kiln_core::config_bail!("momentum must be non-negative, got {}", self.momentum);
        }
        if matches!(self.kind, SolverKind::AdaDelta | SolverKind::Adam) && self.momentum >= 1.0 {
            kiln_core::config_bail!("{} needs momentum in [0, 1), got {}", self.kind, self.momentum);
        }
        if self.delta <= 0.0 {
            kiln_core::config_bail!("delta must be positive, got {}", self.delta);
        }
        if self.weight_decay < 0.0 {
            kiln_core::config_bail!("weight_decay must be non-negative, got {}", self.weight_decay);
        }
        if let Some(clip) = self.clip_gradients {
            if clip <= 0.0 {
                kiln_core::config_bail!("clip_gradients must be positive, got {clip}");
            }
        }
        match self.kind {
            SolverKind::AdaGrad | SolverKind::RmsProp if self.momentum != 0.0 => {
                kiln_core::config_bail!("Momentum cannot be used with {}.", self.kind)
            }
            SolverKind::RmsProp if !(0.0..=1.0).contains(&self.rms_decay) => {
                kiln_core::config_bail!("rms_decay must be in [0, 1], got {}", self.rms_decay)
            }
            SolverKind::Adam if !(0.0..1.0).contains(&self.momentum2) => {
                kiln_core::config_bail!("Adam needs momentum2 in [0, 1), got {}", self.momentum2)
            }
            _ => {}
        }
        self.lr_policy.validate(self.max_iter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_core::Error;

    #[test]
    fn test_from_json_defaults() -> Result<()> {
        let cfg = SolverConfig::from_json(
            r#"{ "net": { "name": "n" }, "type": "RMSProp", "base_lr": 0.5,
                 "lr_policy": { "type": "exp", "gamma": 0.9 } }"#,
        )?;
        assert_eq!(cfg.kind, SolverKind::RmsProp);
        assert_eq!(cfg.base_lr, 0.5);
        assert_eq!(cfg.lr_policy, LrPolicy::Exp { gamma: 0.9 });
        assert_eq!(cfg.rms_decay, 0.95);
        assert_eq!(cfg.momentum2, 0.999);
        assert_eq!(cfg.iter_size, 1);
        assert!(cfg.snapshot_after_train);
        cfg.validate()
    }

    #[test]
    fn test_momentum_rejected_for_adagrad_and_rmsprop() {
        for kind in [SolverKind::AdaGrad, SolverKind::RmsProp] {
            let cfg = SolverConfig::new(NetConfig::default(), kind).with_momentum(0.9);
            match cfg.validate() {
                Err(Error::Config(msg)) => assert!(msg.contains("Momentum cannot be used"), "{msg}"),
                other => panic!("expected a config error, got {other:?}"),
            }
        }
    }

    #[test]
    fn test_invalid_values() {
        let base = SolverConfig::new(NetConfig::default(), SolverKind::Sgd);
        assert!(base.clone().with_iter_size(0).validate().is_err());
        assert!(base.clone().with_base_lr(f64::NAN).validate().is_err());
        assert!(base.clone().with_delta(0.0).validate().is_err());
        let adam = SolverConfig::new(NetConfig::default(), SolverKind::Adam).with_momentum(1.0);
        assert!(adam.validate().is_err());
        assert!(base.validate().is_ok());
    }
}
