// Nesterov: SGD with look-ahead momentum
//
//   h' <- momentum * h + rate * g
//   step = (1 + momentum) * h' - momentum * h

use kiln_core::WithDType;

use super::config::SolverKind;
use super::{UpdateRule, UpdateStep};

#[derive(Debug, Clone, Copy, Default)]
pub struct Nesterov;

impl<T: WithDType> UpdateRule<T> for Nesterov {
    fn kind(&self) -> SolverKind {
        SolverKind::Nesterov
    }

    fn compute_update(&self, step: &UpdateStep, diff: &mut [T], history: &mut [&mut [T]]) {
        let rate = T::from_f64(step.rate);
        let momentum = T::from_f64(step.momentum);
        for (g, h) in diff.iter_mut().zip(history[0].iter_mut()) {
            let previous = *h;
            *h = momentum * previous + rate * *g;
            *g = (T::one() + momentum) * *h - momentum * previous;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overstep() {
        let step = UpdateStep {
            rate: 0.5,
            momentum: 0.5,
            ..UpdateStep::default()
        };
        let mut h = vec![1.0f64];
        let mut g = vec![1.0];
        UpdateRule::<f64>::compute_update(&Nesterov, &step, &mut g, &mut [&mut h[..]]);
        // h' = 0.5 + 0.5 = 1.0; step = 1.5 * 1.0 - 0.5 * 1.0
        assert!((h[0] - 1.0).abs() < 1e-12);
        assert!((g[0] - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_zero_momentum_is_plain_sgd() {
        let step = UpdateStep {
            rate: 0.1,
            ..UpdateStep::default()
        };
        let mut h = vec![0.0f32; 2];
        let mut g = vec![3.0f32, -2.0];
        UpdateRule::<f32>::compute_update(&Nesterov, &step, &mut g, &mut [&mut h[..]]);
        assert!((g[0] - 0.3).abs() < 1e-6);
        assert!((g[1] + 0.2).abs() < 1e-6);
    }
}
