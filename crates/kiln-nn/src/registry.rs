// LayerRegistry: build layers from their configuration's type tag
//
// The registry maps a type name ("InnerProduct", "ReLU", ...) to a creator
// function. Nets never name concrete layer types; they look up
// `config.kind.type_name()` here. User layers are added with register() and
// configured through LayerKind::Custom, whose `type_name` picks the creator.

use std::collections::HashMap;
use std::fmt;

use kiln_core::{Context, Error, Result, WithDType};

use crate::concat::Concat;
use crate::config::LayerConfig;
use crate::data::{Input, MemoryData};
use crate::dropout::Dropout;
use crate::inner_product::InnerProduct;
use crate::layer::Layer;
use crate::loss::{EuclideanLoss, SoftmaxWithLoss};
use crate::neuron;
use crate::slice::Slice;

/// A function building one kind of layer.
pub type LayerCreator<T> = Box<dyn Fn(&LayerConfig, &mut Context) -> Result<Box<dyn Layer<T>>>>;

/// Type name to creator map.
pub struct LayerRegistry<T: WithDType> {
    creators: HashMap<String, LayerCreator<T>>,
}

impl<T: WithDType> Default for LayerRegistry<T> {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl<T: WithDType> LayerRegistry<T> {
    /// A registry with no layer kinds.
    pub fn empty() -> Self {
        LayerRegistry {
            creators: HashMap::new(),
        }
    }

    /// A registry holding every built-in layer kind.
    pub fn with_builtins() -> Self {
        let mut r = Self::empty();
        r.insert("Input", |c, _| Ok(Box::new(Input::new(c.clone())?)));
        r.insert("MemoryData", |c, _| Ok(Box::new(MemoryData::<T>::new(c.clone())?)));
        r.insert("InnerProduct", |c, ctx| {
            Ok(Box::new(InnerProduct::new(c.clone(), ctx.fork_rng())?))
        });
        r.insert("EuclideanLoss", |c, _| Ok(Box::new(EuclideanLoss::<T>::new(c.clone())?)));
        r.insert("SoftmaxWithLoss", |c, _| {
            Ok(Box::new(SoftmaxWithLoss::<T>::new(c.clone())?))
        });
        r.insert("Dropout", |c, ctx| Ok(Box::new(Dropout::new(c.clone(), ctx.fork_rng())?)));
        r.insert("Slice", |c, _| Ok(Box::new(Slice::new(c.clone())?)));
        r.insert("Concat", |c, _| Ok(Box::new(Concat::new(c.clone())?)));
        for name in ["ReLU", "Sigmoid", "TanH", "AbsVal", "Clip", "Exp", "Log", "Power"] {
            r.insert(name, |c, _| neuron::from_config::<T>(c));
        }
        r
    }

    fn insert<F>(&mut self, type_name: &str, creator: F)
    where
        F: Fn(&LayerConfig, &mut Context) -> Result<Box<dyn Layer<T>>> + 'static,
    {
        self.creators.insert(type_name.to_string(), Box::new(creator));
    }

    /// Add a layer kind. Registering a name twice is an error.
    pub fn register<F>(&mut self, type_name: impl Into<String>, creator: F) -> Result<()>
    where
        F: Fn(&LayerConfig, &mut Context) -> Result<Box<dyn Layer<T>>> + 'static,
    {
        let type_name = type_name.into();
        if self.creators.contains_key(&type_name) {
            kiln_core::config_bail!("layer type {type_name} is already registered");
        }
        self.insert(&type_name, creator);
        Ok(())
    }

    pub fn contains(&self, type_name: &str) -> bool {
        self.creators.contains_key(type_name)
    }

    /// Registered type names, sorted.
    pub fn type_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.creators.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Build the layer `config` describes.
    pub fn create(&self, config: &LayerConfig, ctx: &mut Context) -> Result<Box<dyn Layer<T>>> {
        let type_name = config.kind.type_name();
        let creator = self.creators.get(type_name).ok_or_else(|| {
            Error::Config(format!(
                "unknown layer type {type_name} for layer '{}' (known types: {})",
                config.name,
                self.type_names().join(", ")
            ))
        })?;
        log::debug!("Creating layer {} of type {type_name}", config.name);
        creator(config, ctx)
    }
}

impl<T: WithDType> fmt::Debug for LayerRegistry<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LayerRegistry")
            .field("types", &self.type_names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{LayerKind, ReluParams};
    use kiln_core::{TensorArena, TensorId};

    struct Identity {
        config: LayerConfig,
    }

    impl Layer<f32> for Identity {
        fn config(&self) -> &LayerConfig {
            &self.config
        }
        fn reshape(&mut self, _: &TensorArena<f32>, _: &[TensorId], _: &[TensorId]) -> Result<()> {
            Ok(())
        }
        fn forward_host(&mut self, _: &TensorArena<f32>, _: &[TensorId], _: &[TensorId]) -> Result<()> {
            Ok(())
        }
        fn backward_host(&mut self, _: &TensorArena<f32>, _: &[TensorId], _: &[bool], _: &[TensorId]) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_builtins_create() -> Result<()> {
        let registry = LayerRegistry::<f32>::with_builtins();
        let mut ctx = Context::new(1701);
        let layer = registry.create(
            &LayerConfig::new("relu", LayerKind::ReLU(ReluParams::default())),
            &mut ctx,
        )?;
        assert_eq!(layer.type_name(), "ReLU");
        assert!(layer.allows_in_place());
        assert_eq!(registry.type_names().len(), 16);
        Ok(())
    }

    #[test]
    fn test_unknown_type() {
        let registry = LayerRegistry::<f32>::with_builtins();
        let cfg = LayerConfig::new(
            "x",
            LayerKind::Custom {
                type_name: "Mystery".into(),
                params: serde_json::Value::Null,
            },
        );
        match registry.create(&cfg, &mut Context::new(0)) {
            Err(Error::Config(msg)) => assert!(msg.contains("unknown layer type Mystery"), "{msg}"),
            Err(e) => panic!("unexpected error {e}"),
            Ok(_) => panic!("expected an error"),
        }
    }

    #[test]
    fn test_register_custom() -> Result<()> {
        let mut registry = LayerRegistry::<f32>::with_builtins();
        registry.register("Identity", |c, _| Ok(Box::new(Identity { config: c.clone() })))?;
        assert!(matches!(
            registry.register("Identity", |c, _| Ok(Box::new(Identity { config: c.clone() }))),
            Err(Error::Config(_))
        ));
        let cfg = LayerConfig::new(
            "id",
            LayerKind::Custom {
                type_name: "Identity".into(),
                params: serde_json::Value::Null,
            },
        );
        let layer = registry.create(&cfg, &mut Context::new(0))?;
        assert_eq!(layer.type_name(), "Identity");
        Ok(())
    }
}
