// Fillers: initial values for parameter tensors
//
//   constant(value)          every element = value
//   uniform(min, max)        U(min, max)
//   gaussian(mean, std)      N(mean, std)
//   xavier(variance_norm)    U(-a, a), a = sqrt(3 / n)
//   msra(variance_norm)      N(0, sqrt(2 / n))
//
// For xavier and msra, n is fan_in, fan_out, or their average. For a weight
// of shape [out, in, ...] fan_in = count / out and fan_out = count / in, which
// treats trailing axes as a receptive field.
//
// The generator is passed in so every layer draws from its own StdRng forked
// from the Context, and a net built twice from the same seed starts equal.

use rand::distributions::{Distribution, Uniform};
use rand::Rng;
use rand_distr::Normal;

use kiln_core::{Error, Result, Tensor, WithDType};

use crate::config::{FillerConfig, VarianceNorm};

/// (fan_in, fan_out) of a parameter tensor.
pub fn fans(dims: &[usize]) -> (usize, usize) {
    let count: usize = dims.iter().product();
    let fan_in = match dims.first() {
        Some(&d) if d > 0 => count / d,
        _ => count,
    };
    let fan_out = match dims.get(1) {
        Some(&d) if d > 0 => count / d,
        _ => count,
    };
    (fan_in, fan_out)
}

fn scale_denominator(dims: &[usize], norm: VarianceNorm) -> f64 {
    let (fan_in, fan_out) = fans(dims);
    let n = match norm {
        VarianceNorm::FanIn => fan_in as f64,
        VarianceNorm::FanOut => fan_out as f64,
        VarianceNorm::Average => (fan_in + fan_out) as f64 / 2.0,
    };
    n.max(1.0)
}

fn sample_into<T: WithDType, D: Distribution<f64>, R: Rng + ?Sized>(
    out: &mut [T],
    dist: D,
    rng: &mut R,
) {
    for v in out.iter_mut() {
        *v = T::from_f64(dist.sample(rng));
    }
}

fn normal(mean: f64, std: f64) -> Result<Normal<f64>> {
    Normal::new(mean, std)
        .map_err(|e| Error::Config(format!("gaussian filler with mean {mean}, std {std}: {e}")))
}

fn uniform(min: f64, max: f64) -> Result<Uniform<f64>> {
    if !min.is_finite() || !max.is_finite() || min > max {
        kiln_core::config_bail!("uniform filler needs finite min <= max, got [{min}, {max}]");
    }
    Ok(Uniform::new_inclusive(min, max))
}

/// Overwrite `tensor`'s data according to `filler`.
pub fn fill<T: WithDType, R: Rng + ?Sized>(
    filler: &FillerConfig,
    tensor: &mut Tensor<T>,
    rng: &mut R,
) -> Result<()> {
    let dims = tensor.dims().to_vec();
    let data = tensor.mutable_data()?;
    match *filler {
        FillerConfig::Constant { value } => {
            let v = T::from_f64(value);
            data.iter_mut().for_each(|d| *d = v);
        }
        FillerConfig::Uniform { min, max } => sample_into(data, uniform(min, max)?, rng),
        FillerConfig::Gaussian { mean, std } => sample_into(data, normal(mean, std)?, rng),
        FillerConfig::Xavier { variance_norm } => {
            let a = (3.0 / scale_denominator(&dims, variance_norm)).sqrt();
            sample_into(data, uniform(-a, a)?, rng);
        }
        FillerConfig::Msra { variance_norm } => {
            let std = (2.0 / scale_denominator(&dims, variance_norm)).sqrt();
            sample_into(data, normal(0.0, std)?, rng);
        }
    }
    Ok(())
}
