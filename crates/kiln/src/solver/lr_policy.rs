// Learning-rate policies
//
// Each policy maps the iteration counter to a rate derived from base_lr:
//
//   fixed      base_lr
//   step       base_lr * gamma ^ floor(iter / stepsize)
//   exp        base_lr * gamma ^ iter
//   inv        base_lr * (1 + gamma * iter) ^ (-power)
//   multistep  base_lr * gamma ^ (number of stepvalues already passed)
//   poly       base_lr * (1 - iter / max_iter) ^ power
//   sigmoid    base_lr / (1 + exp(-gamma * (iter - stepsize)))
//
// multistep keeps its position in the stepvalue list between calls; that
// position is part of the solver state written to snapshots.

use serde::{Deserialize, Serialize};

use kiln_core::Result;

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LrPolicy {
    #[default]
    Fixed,
    Step { gamma: f64, stepsize: usize },
    Exp { gamma: f64 },
    Inv { gamma: f64, power: f64 },
    Multistep { gamma: f64, stepvalue: Vec<usize> },
    Poly { power: f64 },
    Sigmoid { gamma: f64, stepsize: usize },
}

impl LrPolicy {
    pub fn name(&self) -> &'static str {
        match self {
            LrPolicy::Fixed => "fixed",
            LrPolicy::Step { .. } => "step",
            LrPolicy::Exp { .. } => "exp",
            LrPolicy::Inv { .. } => "inv",
            LrPolicy::Multistep { .. } => "multistep",
            LrPolicy::Poly { .. } => "poly",
            LrPolicy::Sigmoid { .. } => "sigmoid",
        }
    }

    pub(crate) fn validate(&self, max_iter: usize) -> Result<()> {
        match self {
            LrPolicy::Step { stepsize, .. } if *stepsize == 0 => {
                kiln_core::config_bail!("step lr policy needs a positive stepsize")
            }
            LrPolicy::Multistep { stepvalue, .. } if stepvalue.windows(2).any(|w| w[0] >= w[1]) => {
                kiln_core::config_bail!("multistep stepvalues must be strictly increasing, got {stepvalue:?}")
            }
            LrPolicy::Poly { .. } if max_iter == 0 => {
                kiln_core::config_bail!("poly lr policy needs max_iter > 0")
            }
            _ => Ok(()),
        }
    }

    /// The rate at iteration `iter`.
    ///
    /// `current_step` is the multistep position; it only ever advances.
    pub fn rate(&self, base_lr: f64, iter: usize, max_iter: usize, current_step: &mut usize) -> f64 {
        let it = iter as f64;
        match self {
            LrPolicy::Fixed => base_lr,
            LrPolicy::Step { gamma, stepsize } => {
                *current_step = iter / stepsize;
                base_lr * gamma.powi(*current_step as i32)
            }
            LrPolicy::Exp { gamma } => base_lr * gamma.powf(it),
            LrPolicy::Inv { gamma, power } => base_lr * (1.0 + gamma * it).powf(-power),
            LrPolicy::Multistep { gamma, stepvalue } => {
                while *current_step < stepvalue.len() && iter >= stepvalue[*current_step] {
                    *current_step += 1;
                    log::info!("MultiStep Status: Iteration {iter}, step = {current_step}");
                }
                base_lr * gamma.powi(*current_step as i32)
            }
            // Clamped at 0 past max_iter.
            LrPolicy::Poly { power } => base_lr * (1.0 - it / max_iter as f64).max(0.0).powf(*power),
            LrPolicy::Sigmoid { gamma, stepsize } => {
                base_lr / (1.0 + (-gamma * (it - *stepsize as f64)).exp())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rate(policy: &LrPolicy, iter: usize) -> f64 {
        policy.rate(0.1, iter, 100, &mut 0)
    }

    #[test]
    fn test_step_and_exp() {
        let step = LrPolicy::Step {
            gamma: 0.5,
            stepsize: 10,
        };
        assert_eq!(rate(&step, 9), 0.1);
        assert!((rate(&step, 10) - 0.05).abs() < 1e-12);
        assert!((rate(&step, 25) - 0.025).abs() < 1e-12);

        let exp = LrPolicy::Exp { gamma: 0.9 };
        assert!((rate(&exp, 2) - 0.081).abs() < 1e-12);
    }

    #[test]
    fn test_inv_poly_sigmoid() {
        let inv = LrPolicy::Inv {
            gamma: 1e-4,
            power: 0.75,
        };
        assert!((rate(&inv, 1000) - 0.1 * 1.1f64.powf(-0.75)).abs() < 1e-12);

        let poly = LrPolicy::Poly { power: 2.0 };
        assert!((rate(&poly, 50) - 0.025).abs() < 1e-12);
        assert_eq!(rate(&poly, 100), 0.0);
        let fractional = LrPolicy::Poly { power: 0.5 };
        assert_eq!(rate(&fractional, 150), 0.0);

        let sigmoid = LrPolicy::Sigmoid {
            gamma: 1.0,
            stepsize: 10,
        };
        assert!((rate(&sigmoid, 10) - 0.05).abs() < 1e-12);
    }

    #[test]
    fn test_multistep_advances_once() {
        let policy = LrPolicy::Multistep {
            gamma: 0.1,
            stepvalue: vec![5, 8],
        };
        let mut step = 0;
        assert_eq!(policy.rate(1.0, 4, 10, &mut step), 1.0);
        assert!((policy.rate(1.0, 5, 10, &mut step) - 0.1).abs() < 1e-12);
        assert_eq!(step, 1);
        assert!((policy.rate(1.0, 9, 10, &mut step) - 0.01).abs() < 1e-12);
        assert_eq!(step, 2);
    }

    #[test]
    fn test_validate() {
        assert!(LrPolicy::Step { gamma: 0.1, stepsize: 0 }.validate(10).is_err());
        assert!(LrPolicy::Poly { power: 1.0 }.validate(0).is_err());
        assert!(LrPolicy::Multistep {
            gamma: 0.1,
            stepvalue: vec![4, 4]
        }
        .validate(10)
        .is_err());
        assert!(LrPolicy::Fixed.validate(0).is_ok());
    }

    #[test]
    fn test_serde_tag() {
        let policy: LrPolicy = serde_json::from_str(r#"{"type":"step","gamma":0.1,"stepsize":3}"#).unwrap();
        assert_eq!(policy, LrPolicy::Step { gamma: 0.1, stepsize: 3 });
        assert_eq!(policy.name(), "step");
    }
}
