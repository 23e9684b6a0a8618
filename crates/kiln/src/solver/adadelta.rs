// AdaDelta: rates from the ratio of update and gradient running averages
//
//   h  <- momentum * h + (1 - momentum) * g^2
//   u   = g * sqrt((h2 + delta) / (h + delta))
//   h2 <- momentum * h2 + (1 - momentum) * u^2
//   step = rate * u
//
// History slot 0 holds h, slot 1 holds h2.

use kiln_core::WithDType;

use super::config::SolverKind;
use super::{UpdateRule, UpdateStep};

#[derive(Debug, Clone, Copy, Default)]
pub struct AdaDelta;

impl<T: WithDType> UpdateRule<T> for AdaDelta {
    fn kind(&self) -> SolverKind {
        SolverKind::AdaDelta
    }

    fn history_slots(&self) -> usize {
        2
    }

    fn compute_update(&self, step: &UpdateStep, diff: &mut [T], history: &mut [&mut [T]]) {
        let rate = T::from_f64(step.rate);
        let delta = T::from_f64(step.delta);
        let momentum = T::from_f64(step.momentum);
        let (grads, updates) = history.split_at_mut(1);
        let it = diff.iter_mut().zip(grads[0].iter_mut()).zip(updates[0].iter_mut());
        for ((g, h), h2) in it {
            *h = momentum * *h + (T::one() - momentum) * *g * *g;
            let u = *g * ((*h2 + delta) / (*h + delta)).sqrt();
            *h2 = momentum * *h2 + (T::one() - momentum) * u * u;
            *g = rate * u;
        }
    }
}
