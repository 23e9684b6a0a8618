// Adam: bias-corrected first and second moment estimates
//
//   m <- beta1 * m + (1 - beta1) * g
//   v <- beta2 * v + (1 - beta2) * g^2
//   step = rate * sqrt(1 - beta2^t) / (1 - beta1^t) * m / (sqrt(v) + delta)
//
// beta1 is the solver momentum, beta2 is momentum2, and t counts updates from
// 1. History slot 0 holds m, slot 1 holds v.

use kiln_core::WithDType;

use super::config::SolverKind;
use super::{UpdateRule, UpdateStep};

#[derive(Debug, Clone, Copy, Default)]
pub struct Adam;

impl<T: WithDType> UpdateRule<T> for Adam {
    fn kind(&self) -> SolverKind {
        SolverKind::Adam
    }

    fn history_slots(&self) -> usize {
        2
    }

    fn compute_update(&self, step: &UpdateStep, diff: &mut [T], history: &mut [&mut [T]]) {
        let t = step.t as i32;
        let correction = (1.0 - step.momentum2.powi(t)).sqrt() / (1.0 - step.momentum.powi(t));
        let rate = T::from_f64(step.rate * correction);
        let beta1 = T::from_f64(step.momentum);
        let beta2 = T::from_f64(step.momentum2);
        let delta = T::from_f64(step.delta);
        let (first, second) = history.split_at_mut(1);
        let it = diff.iter_mut().zip(first[0].iter_mut()).zip(second[0].iter_mut());
        for ((g, m), v) in it {
            *m = beta1 * *m + (T::one() - beta1) * *g;
            *v = beta2 * *v + (T::one() - beta2) * *g * *g;
            *g = rate * *m / (v.sqrt() + delta);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_step_is_rate_times_sign() {
        let step = UpdateStep {
            rate: 0.001,
            momentum: 0.9,
            momentum2: 0.999,
            delta: 1e-8,
            t: 1,
            ..UpdateStep::default()
        };
        let mut m = vec![0.0f64; 2];
        let mut v = vec![0.0f64; 2];
        let mut g = vec![0.3, -7.0];
        UpdateRule::<f64>::compute_update(&Adam, &step, &mut g, &mut [&mut m[..], &mut v[..]]);
        assert!((g[0] - 0.001).abs() < 1e-8);
        assert!((g[1] + 0.001).abs() < 1e-8);
        assert!((m[1] + 0.7).abs() < 1e-12);
    }
}
