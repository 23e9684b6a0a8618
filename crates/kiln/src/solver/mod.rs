// Solver: drives a Net through gradient-based optimization
//
// One iteration of step():
//
//   1. clear parameter gradients
//   2. iter_size times: forward + backward, accumulating gradients
//   3. callbacks see the finished gradient (on_gradients_ready)
//   4. apply_update():
//        rate from the lr policy
//        clip gradients by global L2 norm (optional)
//        per learnable parameter: normalize by 1/iter_size, add the
//        regularization term, let the update rule turn the gradient into a
//        step (written into diff), then data -= diff
//   5. iter += 1, then poll the action source and snapshot / stop
//
// Stop requests are only honoured between iterations, so parameters are never
// left half-updated.
//
// HISTORY:
//
// Update rules keep per-parameter state in history tensors shaped like the
// parameters. Rules with two slots (AdaDelta, Adam) store slot 0 for every
// parameter, then slot 1 for every parameter; snapshot_state() flattens them
// in that order.

pub mod adadelta;
pub mod adagrad;
pub mod adam;
pub mod config;
pub mod lr_policy;
pub mod nesterov;
pub mod rmsprop;
pub mod sgd;

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use kiln_core::{Context, Result, Tensor, TensorRecord, WithDType};
use kiln_nn::{LayerRegistry, Phase};

use crate::net::Net;
use crate::snapshot;

pub use adadelta::AdaDelta;
pub use adagrad::AdaGrad;
pub use adam::Adam;
pub use config::{Regularization, SnapshotFormat, SolverConfig, SolverKind};
pub use lr_policy::LrPolicy;
pub use nesterov::Nesterov;
pub use rmsprop::RmsProp;
pub use sgd::Sgd;

/// Hyper-parameters of one parameter's update.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UpdateStep {
    /// Learning rate already scaled by the parameter's lr_mult.
    pub rate: f64,
    pub momentum: f64,
    pub momentum2: f64,
    pub delta: f64,
    pub rms_decay: f64,
    /// Number of the update being computed, counting from 1.
    pub t: usize,
}

impl Default for UpdateStep {
    fn default() -> Self {
        UpdateStep {
            rate: 0.0,
            momentum: 0.0,
            momentum2: 0.999,
            delta: 1e-8,
            rms_decay: 0.95,
            t: 1,
        }
    }
}

/// Turns a regularized gradient into the step `data -= diff` applies.
pub trait UpdateRule<T: WithDType> {
    fn kind(&self) -> SolverKind;

    /// History tensors kept per parameter.
    fn history_slots(&self) -> usize {
        1
    }

    /// Overwrite `diff` with the step, updating `history` (one slice per slot).
    fn compute_update(&self, step: &UpdateStep, diff: &mut [T], history: &mut [&mut [T]]);
}

pub fn update_rule<T: WithDType>(kind: SolverKind) -> Box<dyn UpdateRule<T>> {
    match kind {
        SolverKind::Sgd => Box::new(Sgd),
        SolverKind::Nesterov => Box::new(Nesterov),
        SolverKind::AdaGrad => Box::new(AdaGrad),
        SolverKind::RmsProp => Box::new(RmsProp),
        SolverKind::AdaDelta => Box::new(AdaDelta),
        SolverKind::Adam => Box::new(Adam),
    }
}

/// What the solver should do after the current iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SolverAction {
    #[default]
    None,
    Stop,
    Snapshot,
}

/// Hooks around each iteration.
///
/// on_gradients_ready runs after the gradient is complete and before the
/// update, which is where replicas reduce their gradients.
pub trait SolverCallback<T: WithDType> {
    fn on_start(&mut self, _net: &mut Net<T>) -> Result<()> {
        Ok(())
    }

    fn on_gradients_ready(&mut self, _net: &mut Net<T>) -> Result<()> {
        Ok(())
    }
}

/// Everything besides the parameters needed to resume training.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SolverState {
    pub iter: usize,
    pub current_step: usize,
    /// Model file written alongside this state.
    #[serde(default)]
    pub learned_net: Option<String>,
    pub history: Vec<TensorRecord>,
}

pub struct Solver<T: WithDType> {
    config: SolverConfig,
    net: Net<T>,
    rule: Box<dyn UpdateRule<T>>,
    /// history[slot][param]
    history: Vec<Vec<Tensor<T>>>,
    iter: usize,
    current_step: usize,
    losses: Vec<f64>,
    smoothed_loss: f64,
    callbacks: Vec<Box<dyn SolverCallback<T>>>,
    action: Option<Box<dyn FnMut() -> SolverAction>>,
    requested_early_exit: bool,
}

impl<T: WithDType> Solver<T> {
    pub fn new(config: SolverConfig, ctx: &mut Context) -> Result<Self> {
        Self::with_registry(config, &LayerRegistry::with_builtins(), ctx)
    }

    /// Build the training net from `config.net` and zeroed update history.
    ///
    /// A configured random_seed replaces `ctx`'s random stream for the net.
    pub fn with_registry(config: SolverConfig, registry: &LayerRegistry<T>, ctx: &mut Context) -> Result<Self> {
        config.validate()?;
        log::info!("Initializing {} solver for net '{}'", config.kind, config.net.name);
        let net = match config.random_seed {
            Some(seed) => {
                let mut seeded = Context::new(seed);
                if let Some(accelerator) = ctx.accelerator() {
                    seeded = seeded.with_accelerator(accelerator);
                }
                Net::with_registry(&config.net, Phase::Train, registry, &mut seeded)?
            }
            None => Net::with_registry(&config.net, Phase::Train, registry, ctx)?,
        };
        let rule = update_rule::<T>(config.kind);
        let mut solver = Solver {
            config,
            net,
            rule,
            history: Vec::new(),
            iter: 0,
            current_step: 0,
            losses: Vec::new(),
            smoothed_loss: 0.0,
            callbacks: Vec::new(),
            action: None,
            requested_early_exit: false,
        };
        solver.init_history();
        Ok(solver)
    }

    fn init_history(&mut self) {
        let accelerator = self.net.arena().accelerator().cloned();
        self.history = (0..self.rule.history_slots())
            .map(|_| {
                self.net
                    .learnable_params()
                    .iter()
                    .map(|&id| {
                        let mut h = Tensor::new_in(accelerator.clone());
                        h.reshape(self.net.tensor(id).shape());
                        h
                    })
                    .collect()
            })
            .collect();
    }

    pub fn config(&self) -> &SolverConfig {
        &self.config
    }

    pub fn kind(&self) -> SolverKind {
        self.rule.kind()
    }

    pub fn net(&self) -> &Net<T> {
        &self.net
    }

    pub fn net_mut(&mut self) -> &mut Net<T> {
        &mut self.net
    }

    /// Completed iterations.
    pub fn iter(&self) -> usize {
        self.iter
    }

    pub fn smoothed_loss(&self) -> f64 {
        self.smoothed_loss
    }

    pub fn history_slots(&self) -> usize {
        self.history.len()
    }

    /// History tensor of `slot` for learnable parameter `param`.
    pub fn history_tensor(&mut self, slot: usize, param: usize) -> &mut Tensor<T> {
        &mut self.history[slot][param]
    }

    pub fn add_callback(&mut self, callback: Box<dyn SolverCallback<T>>) {
        self.callbacks.push(callback);
    }

    /// Install the source polled for stop / snapshot requests after each iteration.
    pub fn set_action_function(&mut self, action: impl FnMut() -> SolverAction + 'static) {
        self.action = Some(Box::new(action));
    }

    fn requested_action(&mut self) -> SolverAction {
        self.action.as_mut().map_or(SolverAction::None, |f| f())
    }

    /// Learning rate for the current iteration.
    pub fn learning_rate(&mut self) -> f64 {
        self.config.lr_policy.rate(
            self.config.base_lr,
            self.iter,
            self.config.max_iter,
            &mut self.current_step,
        )
    }

    // Training loop

    /// Run `iters` iterations.
    pub fn step(&mut self, iters: usize) -> Result<()> {
        let start_iter = self.iter;
        let stop_iter = self.iter + iters;
        self.losses.clear();
        self.smoothed_loss = 0.0;

        while self.iter < stop_iter {
            self.net.clear_param_diffs()?;
            for callback in self.callbacks.iter_mut() {
                callback.on_start(&mut self.net)?;
            }
            let display = self.config.display > 0 && self.iter % self.config.display == 0;
            self.net.set_debug_info(display && self.config.debug_info);

            let mut loss = 0.0;
            for _ in 0..self.config.iter_size {
                loss += self.net.forward_backward()?.as_f64();
            }
            loss /= self.config.iter_size as f64;
            self.update_smoothed_loss(loss, start_iter);
            if display {
                log::info!("Iteration {}, loss = {}", self.iter, self.smoothed_loss);
                self.log_outputs()?;
            }
            for callback in self.callbacks.iter_mut() {
                callback.on_gradients_ready(&mut self.net)?;
            }
            self.apply_update()?;
            self.iter += 1;

            let request = self.requested_action();
            let scheduled = self.config.snapshot > 0 && self.iter % self.config.snapshot == 0;
            if scheduled || request == SolverAction::Snapshot {
                self.snapshot()?;
            }
            if request == SolverAction::Stop {
                self.requested_early_exit = true;
                break;
            }
        }
        Ok(())
    }

    /// Train until max_iter.
    pub fn solve(&mut self) -> Result<()> {
        log::info!("Solving {}", self.net.name());
        log::info!("Learning Rate Policy: {}", self.config.lr_policy.name());
        self.requested_early_exit = false;
        let start_iter = self.iter;
        let remaining = self.config.max_iter.saturating_sub(self.iter);
        self.step(remaining)?;

        let on_schedule = self.config.snapshot > 0 && self.iter % self.config.snapshot == 0;
        if self.config.snapshot_after_train && !on_schedule {
            self.snapshot()?;
        }
        if self.requested_early_exit {
            log::info!("Optimization stopped early.");
            return Ok(());
        }
        if self.config.display > 0 && self.iter % self.config.display == 0 {
            let loss = self.net.forward()?.as_f64();
            self.update_smoothed_loss(loss, start_iter);
            log::info!("Iteration {}, loss = {}", self.iter, self.smoothed_loss);
        }
        log::info!("Optimization Done.");
        Ok(())
    }

    /// Restore from a .solverstate file, then train until max_iter.
    pub fn solve_from(&mut self, resume_file: impl AsRef<Path>) -> Result<()> {
        self.restore(resume_file)?;
        self.solve()
    }

    fn update_smoothed_loss(&mut self, loss: f64, start_iter: usize) {
        let window = self.config.average_loss;
        if self.losses.len() < window {
            self.losses.push(loss);
            let size = self.losses.len() as f64;
            self.smoothed_loss = (self.smoothed_loss * (size - 1.0) + loss) / size;
        } else {
            let idx = (self.iter - start_iter) % window;
            self.smoothed_loss += (loss - self.losses[idx]) / window as f64;
            self.losses[idx] = loss;
        }
    }

    fn log_outputs(&self) -> Result<()> {
        let mut score_index = 0;
        for (name, id) in self.net.output_blob_names().into_iter().zip(self.net.output_blobs()) {
            let mut t = self.net.tensor(id);
            for v in t.data()? {
                log::info!("    Train net output #{score_index}: {name} = {v}");
                score_index += 1;
            }
        }
        Ok(())
    }

    // Update

    /// Turn the accumulated gradients into one parameter update.
    pub fn apply_update(&mut self) -> Result<()> {
        let rate = self.learning_rate();
        if self.config.display > 0 && self.iter % self.config.display == 0 {
            log::info!("Iteration {}, lr = {rate}", self.iter);
        }
        self.clip_gradients()?;
        for i in 0..self.net.learnable_params().len() {
            self.normalize(i)?;
            self.regularize(i)?;
            self.compute_update_value(i, rate)?;
        }
        self.net.update()
    }

    fn clip_gradients(&mut self) -> Result<()> {
        let Some(clip) = self.config.clip_gradients else {
            return Ok(());
        };
        let mut sumsq = 0.0;
        for &id in self.net.learnable_params() {
            sumsq += self.net.tensor(id).sumsq_diff()?.as_f64();
        }
        let l2norm = sumsq.sqrt();
        if l2norm > clip {
            let scale = clip / l2norm;
            log::info!(
                "Gradient clipping: scaling down gradients (L2 norm {l2norm} > {clip}) by scale factor {scale}"
            );
            for &id in self.net.learnable_params() {
                self.net.tensor(id).scale_diff(T::from_f64(scale))?;
            }
        }
        Ok(())
    }

    fn normalize(&mut self, param: usize) -> Result<()> {
        if self.config.iter_size == 1 {
            return Ok(());
        }
        let id = self.net.learnable_params()[param];
        let scale = T::from_f64(1.0 / self.config.iter_size as f64);
        self.net.tensor(id).scale_diff(scale)
    }

    fn regularize(&mut self, param: usize) -> Result<()> {
        let local_decay = self.config.weight_decay * self.net.params_weight_decay()[param];
        if local_decay == 0.0 {
            return Ok(());
        }
        let decay = T::from_f64(local_decay);
        let id = self.net.learnable_params()[param];
        let mut t = self.net.tensor(id);
        let (data, diff) = t.data_and_mutable_diff()?;
        match self.config.regularization {
            Regularization::L2 => {
                for (g, &w) in diff.iter_mut().zip(data) {
                    *g += decay * w;
                }
            }
            Regularization::L1 => {
                for (g, &w) in diff.iter_mut().zip(data) {
                    if w > T::zero() {
                        *g += decay;
                    } else if w < T::zero() {
                        *g -= decay;
                    }
                }
            }
        }
        Ok(())
    }

    fn compute_update_value(&mut self, param: usize, rate: f64) -> Result<()> {
        let step = UpdateStep {
            rate: rate * self.net.params_lr()[param],
            momentum: self.config.momentum,
            momentum2: self.config.momentum2,
            delta: self.config.delta,
            rms_decay: self.config.rms_decay,
            t: self.iter + 1,
        };
        let id = self.net.learnable_params()[param];
        let mut t = self.net.tensor(id);
        let diff = t.mutable_diff()?;
        let mut history = self
            .history
            .iter_mut()
            .map(|slot| slot[param].mutable_data())
            .collect::<Result<Vec<&mut [T]>>>()?;
        self.rule.compute_update(&step, diff, &mut history);
        Ok(())
    }

    // Snapshots

    fn snapshot_filename(&self, extension: &str) -> PathBuf {
        PathBuf::from(format!(
            "{}_iter_{}{extension}",
            self.config.snapshot_prefix, self.iter
        ))
    }

    /// Write the model and solver state for the current iteration.
    ///
    /// Returns the path of the .solverstate file.
    pub fn snapshot(&mut self) -> Result<PathBuf> {
        let format = self.config.snapshot_format;
        let model_path = self.snapshot_filename(".model");
        log::info!("Snapshotting to {format:?} file {}", model_path.display());
        let record = self.net.to_record(self.config.snapshot_diff)?;
        snapshot::save_net(&model_path, &record, format)?;

        let state_path = self.snapshot_filename(".solverstate");
        log::info!("Snapshotting solver state to {format:?} file {}", state_path.display());
        let mut state = self.snapshot_state()?;
        state.learned_net = Some(model_path.to_string_lossy().into_owned());
        snapshot::save_state(&state_path, &state, format)?;
        Ok(state_path)
    }

    /// The in-memory state record: iteration, multistep position, history.
    pub fn snapshot_state(&mut self) -> Result<SolverState> {
        let mut history = Vec::new();
        for slot in self.history.iter_mut() {
            for h in slot.iter_mut() {
                history.push(h.to_record(false)?);
            }
        }
        Ok(SolverState {
            iter: self.iter,
            current_step: self.current_step,
            learned_net: None,
            history,
        })
    }

    /// Load iteration, multistep position and history from `state`.
    ///
    /// History shapes must match this solver's parameters.
    pub fn restore_state(&mut self, state: &SolverState) -> Result<()> {
        self.check_state(state)?;
        self.commit_state(state)
    }

    fn check_state(&self, state: &SolverState) -> Result<()> {
        let expected: usize = self.history.iter().map(Vec::len).sum();
        if state.history.len() != expected {
            kiln_core::config_bail!(
                "incorrect length of history blobs: {} in state, {expected} expected",
                state.history.len()
            );
        }
        let tensors = self.history.iter().flat_map(|slot| slot.iter());
        for (h, record) in tensors.zip(&state.history) {
            h.check_record(record)?;
        }
        Ok(())
    }

    fn commit_state(&mut self, state: &SolverState) -> Result<()> {
        let tensors = self.history.iter_mut().flat_map(|slot| slot.iter_mut());
        for (h, record) in tensors.zip(&state.history) {
            h.from_record(record, false)?;
        }
        self.iter = state.iter;
        self.current_step = state.current_step;
        Ok(())
    }

    /// Resume from a .solverstate file and the model it names.
    pub fn restore(&mut self, state_file: impl AsRef<Path>) -> Result<()> {
        let state_file = state_file.as_ref();
        log::info!("Restoring previous solver status from {}", state_file.display());
        let state = snapshot::load_state(state_file)?;
        self.check_state(&state)?;
        if let Some(model) = &state.learned_net {
            let record = snapshot::load_net(model)?;
            self.net.copy_trained_layers_from(&record)?;
        }
        self.commit_state(&state)
    }
}

impl<T: WithDType> std::fmt::Debug for Solver<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Solver")
            .field("kind", &self.rule.kind())
            .field("net", &self.net.name())
            .field("iter", &self.iter)
            .field("history_slots", &self.history.len())
            .finish()
    }
}
