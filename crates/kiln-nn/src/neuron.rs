// Neuron layers: elementwise functions y = f(x)
//
// Every neuron layer has one bottom and one top of the same shape and no
// parameters. They share a single Layer implementation, NeuronLayer, which is
// generic over the function it applies:
//
//   ReLU      y = max(x, 0) + slope * min(x, 0)     dx = dy * (x > 0 ? 1 : slope)
//   Sigmoid   y = 1 / (1 + e^-x)                     dx = dy * y * (1 - y)
//   TanH      y = tanh(x)                            dx = dy * (1 - y^2)
//   AbsVal    y = |x|                                dx = dy * sign(x)
//   Clip      y = clamp(x, min, max)                 dx = dy * [min <= x <= max]
//   Exp       y = base^(shift + scale * x)           dx = dy * y * ln(base) * scale
//   Log       y = log_base(shift + scale * x)        dx = dy * scale / ((shift + scale * x) ln(base))
//   Power     y = (shift + scale * x)^power          dx = dy * power * scale * (shift + scale * x)^(power - 1)
//
// IN PLACE:
//
// A function whose gradient can be computed from y alone (or, for ReLU, from
// the sign of y, which equals the sign of x) may run with bottom == top. Then
// the "x" handed to backward is really y, and the layer overwrites the shared
// diff instead of accumulating into it.

use std::marker::PhantomData;

use kiln_core::{Result, TensorArena, TensorId, WithDType};

use crate::config::{LayerConfig, LayerKind};
use crate::layer::{Arity, Layer};

/// An elementwise function and its derivative.
pub trait NeuronFn {
    fn forward<T: WithDType>(&self, x: T) -> T;

    /// Bottom gradient for one element given its input, output, and top gradient.
    fn backward<T: WithDType>(&self, x: T, y: T, dy: T) -> T;

    /// Whether backward stays correct when `x` is overwritten by `y`.
    fn in_place_safe(&self) -> bool {
        false
    }
}

/// The layer applying a [`NeuronFn`] elementwise.
pub struct NeuronLayer<T: WithDType, F: NeuronFn> {
    config: LayerConfig,
    func: F,
    _dtype: PhantomData<T>,
}

impl<T: WithDType, F: NeuronFn> NeuronLayer<T, F> {
    pub fn new(config: LayerConfig, func: F) -> Self {
        NeuronLayer {
            config,
            func,
            _dtype: PhantomData,
        }
    }

    pub fn func(&self) -> &F {
        &self.func
    }
}

impl<T: WithDType, F: NeuronFn> Layer<T> for NeuronLayer<T, F> {
    fn config(&self) -> &LayerConfig {
        &self.config
    }

    fn arity(&self) -> Arity {
        Arity::exact(1, 1)
    }

    fn allows_in_place(&self) -> bool {
        self.func.in_place_safe()
    }

    fn reshape(&mut self, arena: &TensorArena<T>, bottom: &[TensorId], top: &[TensorId]) -> Result<()> {
        if bottom[0] != top[0] {
            let shape = arena.get(bottom[0]).shape().clone();
            arena.get(top[0]).reshape(shape);
        }
        Ok(())
    }

    fn forward_host(&mut self, arena: &TensorArena<T>, bottom: &[TensorId], top: &[TensorId]) -> Result<()> {
        let f = &self.func;
        if bottom[0] == top[0] {
            let mut t = arena.get(top[0]);
            t.mutable_data()?.iter_mut().for_each(|v| *v = f.forward(*v));
        } else {
            let mut b = arena.get(bottom[0]);
            let mut t = arena.get(top[0]);
            for (y, &x) in t.mutable_data()?.iter_mut().zip(b.data()?) {
                *y = f.forward(x);
            }
        }
        Ok(())
    }

    fn backward_host(
        &mut self,
        arena: &TensorArena<T>,
        top: &[TensorId],
        propagate_down: &[bool],
        bottom: &[TensorId],
    ) -> Result<()> {
        if !propagate_down[0] {
            return Ok(());
        }
        let f = &self.func;
        if bottom[0] == top[0] {
            let mut t = arena.get(top[0]);
            let (y, diff) = t.data_and_mutable_diff()?;
            for (d, &y) in diff.iter_mut().zip(y) {
                *d = f.backward(y, y, *d);
            }
        } else {
            let mut t = arena.get(top[0]);
            let mut b = arena.get(bottom[0]);
            let (y, dy) = t.data_and_diff()?;
            let (x, dx) = b.data_and_mutable_diff()?;
            for i in 0..dx.len() {
                dx[i] += f.backward(x[i], y[i], dy[i]);
            }
        }
        Ok(())
    }
}

fn c<T: WithDType>(v: f64) -> T {
    T::from_f64(v)
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Relu {
    pub negative_slope: f64,
}

impl NeuronFn for Relu {
    fn forward<T: WithDType>(&self, x: T) -> T {
        x.max(T::zero()) + c::<T>(self.negative_slope) * x.min(T::zero())
    }

    fn backward<T: WithDType>(&self, x: T, _y: T, dy: T) -> T {
        if x > T::zero() {
            dy
        } else {
            dy * c(self.negative_slope)
        }
    }

    fn in_place_safe(&self) -> bool {
        true
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Sigmoid;

impl NeuronFn for Sigmoid {
    fn forward<T: WithDType>(&self, x: T) -> T {
        T::one() / (T::one() + (-x).exp())
    }

    fn backward<T: WithDType>(&self, _x: T, y: T, dy: T) -> T {
        dy * y * (T::one() - y)
    }

    fn in_place_safe(&self) -> bool {
        true
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TanH;

impl NeuronFn for TanH {
    fn forward<T: WithDType>(&self, x: T) -> T {
        x.tanh()
    }

    fn backward<T: WithDType>(&self, _x: T, y: T, dy: T) -> T {
        dy * (T::one() - y * y)
    }

    fn in_place_safe(&self) -> bool {
        true
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AbsVal;

impl NeuronFn for AbsVal {
    fn forward<T: WithDType>(&self, x: T) -> T {
        x.abs()
    }

    fn backward<T: WithDType>(&self, x: T, _y: T, dy: T) -> T {
        if x > T::zero() {
            dy
        } else if x < T::zero() {
            -dy
        } else {
            T::zero()
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Clip {
    pub min: f64,
    pub max: f64,
}

impl NeuronFn for Clip {
    fn forward<T: WithDType>(&self, x: T) -> T {
        x.max(c(self.min)).min(c(self.max))
    }

    fn backward<T: WithDType>(&self, x: T, _y: T, dy: T) -> T {
        if x >= c(self.min) && x <= c(self.max) {
            dy
        } else {
            T::zero()
        }
    }
}

/// `base^(shift + scale * x)`, computed as `outer * e^(inner * x)`.
#[derive(Debug, Clone, Copy)]
pub struct Exp {
    inner_scale: f64,
    outer_scale: f64,
}

impl Exp {
    /// A base of -1 selects e.
    pub fn new(base: f64, scale: f64, shift: f64) -> Result<Self> {
        let log_base = log_of_base(base, "Exp")?;
        Ok(Exp {
            inner_scale: log_base * scale,
            outer_scale: if shift == 0.0 { 1.0 } else { (shift * log_base).exp() },
        })
    }
}

impl NeuronFn for Exp {
    fn forward<T: WithDType>(&self, x: T) -> T {
        c::<T>(self.outer_scale) * (c::<T>(self.inner_scale) * x).exp()
    }

    fn backward<T: WithDType>(&self, _x: T, y: T, dy: T) -> T {
        dy * y * c(self.inner_scale)
    }

    fn in_place_safe(&self) -> bool {
        true
    }
}

/// `log_base(shift + scale * x)`.
#[derive(Debug, Clone, Copy)]
pub struct Log {
    scale: f64,
    shift: f64,
    base_scale: f64,
}

impl Log {
    /// A base of -1 selects e.
    pub fn new(base: f64, scale: f64, shift: f64) -> Result<Self> {
        let log_base = log_of_base(base, "Log")?;
        Ok(Log {
            scale,
            shift,
            base_scale: 1.0 / log_base,
        })
    }
}

impl NeuronFn for Log {
    fn forward<T: WithDType>(&self, x: T) -> T {
        (c::<T>(self.shift) + c::<T>(self.scale) * x).ln() * c(self.base_scale)
    }

    fn backward<T: WithDType>(&self, x: T, _y: T, dy: T) -> T {
        let inner = c::<T>(self.shift) + c::<T>(self.scale) * x;
        dy * c::<T>(self.scale * self.base_scale) / inner
    }
}

fn log_of_base(base: f64, kind: &str) -> Result<f64> {
    if base == -1.0 {
        return Ok(1.0);
    }
    if base <= 0.0 || base == 1.0 || !base.is_finite() {
        kiln_core::config_bail!("{kind} base must be -1 (for e) or a positive number other than 1, got {base}");
    }
    Ok(base.ln())
}

#[derive(Debug, Clone, Copy)]
pub struct Power {
    pub power: f64,
    pub scale: f64,
    pub shift: f64,
}

impl NeuronFn for Power {
    fn forward<T: WithDType>(&self, x: T) -> T {
        (c::<T>(self.shift) + c::<T>(self.scale) * x).powf(c(self.power))
    }

    fn backward<T: WithDType>(&self, x: T, _y: T, dy: T) -> T {
        if self.power == 0.0 || self.scale == 0.0 {
            return T::zero();
        }
        if self.power == 1.0 {
            return dy * c(self.scale);
        }
        let inner = c::<T>(self.shift) + c::<T>(self.scale) * x;
        dy * c::<T>(self.power * self.scale) * inner.powf(c(self.power - 1.0))
    }
}

/// Build the neuron layer named by `config.kind`.
pub fn from_config<T: WithDType>(config: &LayerConfig) -> Result<Box<dyn Layer<T>>> {
    let cfg = config.clone();
    let layer: Box<dyn Layer<T>> = match &config.kind {
        LayerKind::ReLU(p) => Box::new(NeuronLayer::new(
            cfg,
            Relu {
                negative_slope: p.negative_slope,
            },
        )),
        LayerKind::Sigmoid => Box::new(NeuronLayer::new(cfg, Sigmoid)),
        LayerKind::TanH => Box::new(NeuronLayer::new(cfg, TanH)),
        LayerKind::AbsVal => Box::new(NeuronLayer::new(cfg, AbsVal)),
        LayerKind::Clip(p) => {
            if p.min > p.max {
                kiln_core::config_bail!(
                    "Clip layer '{}' has min {} > max {}",
                    config.name,
                    p.min,
                    p.max
                );
            }
            Box::new(NeuronLayer::new(
                cfg,
                Clip {
                    min: p.min,
                    max: p.max,
                },
            ))
        }
        LayerKind::Exp(p) => Box::new(NeuronLayer::new(cfg, Exp::new(p.base, p.scale, p.shift)?)),
        LayerKind::Log(p) => Box::new(NeuronLayer::new(cfg, Log::new(p.base, p.scale, p.shift)?)),
        LayerKind::Power(p) => Box::new(NeuronLayer::new(
            cfg,
            Power {
                power: p.power,
                scale: p.scale,
                shift: p.shift,
            },
        )),
        _ => return Err(config.kind_mismatch("a neuron layer")),
    };
    Ok(layer)
}
