// SGD: momentum-smoothed gradient descent
//
//   h <- momentum * h + rate * g
//   step = h

use kiln_core::WithDType;

use super::config::SolverKind;
use super::{UpdateRule, UpdateStep};

#[derive(Debug, Clone, Copy, Default)]
pub struct Sgd;

impl<T: WithDType> UpdateRule<T> for Sgd {
    fn kind(&self) -> SolverKind {
        SolverKind::Sgd
    }

    fn compute_update(&self, step: &UpdateStep, diff: &mut [T], history: &mut [&mut [T]]) {
        let rate = T::from_f64(step.rate);
        let momentum = T::from_f64(step.momentum);
        for (g, h) in diff.iter_mut().zip(history[0].iter_mut()) {
            *h = momentum * *h + rate * *g;
            *g = *h;
        }
    }
}
