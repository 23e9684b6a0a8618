// AdaGrad: per-element rates from the running sum of squared gradients
//
//   h <- h + g^2
//   step = rate * g / (sqrt(h) + delta)

use kiln_core::WithDType;

use super::config::SolverKind;
use super::{UpdateRule, UpdateStep};

#[derive(Debug, Clone, Copy, Default)]
pub struct AdaGrad;

impl<T: WithDType> UpdateRule<T> for AdaGrad {
    fn kind(&self) -> SolverKind {
        SolverKind::AdaGrad
    }

    fn compute_update(&self, step: &UpdateStep, diff: &mut [T], history: &mut [&mut [T]]) {
        let rate = T::from_f64(step.rate);
        let delta = T::from_f64(step.delta);
        for (g, h) in diff.iter_mut().zip(history[0].iter_mut()) {
            *h += *g * *g;
            *g = rate * *g / (h.sqrt() + delta);
        }
    }
}
