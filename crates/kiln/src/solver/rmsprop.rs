// RMSProp: rates from a decaying average of squared gradients
//
//   h <- rms_decay * h + (1 - rms_decay) * g^2
//   step = rate * g / (sqrt(h) + delta)

use kiln_core::WithDType;

use super::config::SolverKind;
use super::{UpdateRule, UpdateStep};

#[derive(Debug, Clone, Copy, Default)]
pub struct RmsProp;

impl<T: WithDType> UpdateRule<T> for RmsProp {
    fn kind(&self) -> SolverKind {
        SolverKind::RmsProp
    }

    fn compute_update(&self, step: &UpdateStep, diff: &mut [T], history: &mut [&mut [T]]) {
        let rate = T::from_f64(step.rate);
        let delta = T::from_f64(step.delta);
        let decay = T::from_f64(step.rms_decay);
        for (g, h) in diff.iter_mut().zip(history[0].iter_mut()) {
            *h = decay * *h + (T::one() - decay) * *g * *g;
            *g = rate * *g / (h.sqrt() + delta);
        }
    }
}
