//! Backend registry.
//!
//! Maps backend names to factories that build the [`McuLink`] a device-side
//! endpoint serves. Constructed at startup and passed by value.

use sinter_common::catalog::CommandCatalog;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{LinkError, LinkResult};
use crate::link::McuLink;
use crate::simulation::{SimulatedMcu, SimulationOptions};

/// Inputs every backend factory receives.
#[derive(Debug, Clone)]
pub struct BackendOptions {
    pub catalog: Arc<CommandCatalog>,
    /// Clock-sync emission period.
    pub clock_sync_interval: Duration,
    /// Outstanding pooled commands before a leak warning.
    pub warn_threshold: usize,
}

/// Factory building a backend from [`BackendOptions`].
pub type BackendFactory = fn(&BackendOptions) -> LinkResult<Arc<dyn McuLink>>;

/// Registry of available backends.
pub struct BackendRegistry {
    factories: HashMap<&'static str, BackendFactory>,
}

impl BackendRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Registry with the builtin `"simulation"` backend.
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry
            .factories
            .insert("simulation", simulation_factory as BackendFactory);
        registry
    }

    /// Register a backend factory.
    ///
    /// # Errors
    /// Returns `LinkError::InvalidOperation` if the name is already taken.
    pub fn register(&mut self, name: &'static str, factory: BackendFactory) -> LinkResult<()> {
        if self.factories.contains_key(name) {
            return Err(LinkError::InvalidOperation(format!(
                "backend '{name}' is already registered"
            )));
        }
        self.factories.insert(name, factory);
        Ok(())
    }

    pub fn get_factory(&self, name: &str) -> Option<BackendFactory> {
        self.factories.get(name).copied()
    }

    /// Create a backend instance by name.
    ///
    /// # Errors
    /// Returns `LinkError::BackendNotFound` if no backend with the given name is registered.
    pub fn create(&self, name: &str, options: &BackendOptions) -> LinkResult<Arc<dyn McuLink>> {
        let factory = self
            .get_factory(name)
            .ok_or_else(|| LinkError::BackendNotFound(name.to_string()))?;
        factory(options)
    }

    /// Registered backend names, sorted.
    pub fn list(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.factories.keys().copied().collect();
        names.sort_unstable();
        names
    }
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::with_builtin()
    }
}

fn simulation_factory(options: &BackendOptions) -> LinkResult<Arc<dyn McuLink>> {
    let sim = SimulatedMcu::new(
        Arc::clone(&options.catalog),
        SimulationOptions {
            clock_sync_interval: Some(options.clock_sync_interval),
            warn_threshold: options.warn_threshold,
            ..Default::default()
        },
    )?;
    Ok(Arc::new(sim))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options() -> BackendOptions {
        BackendOptions {
            catalog: Arc::new(CommandCatalog::builtin()),
            clock_sync_interval: Duration::from_millis(50),
            warn_threshold: 100,
        }
    }

    fn failing(_: &BackendOptions) -> LinkResult<Arc<dyn McuLink>> {
        Err(LinkError::Unreachable("no hardware".into()))
    }

    #[test]
    fn builtin_simulation_is_available() {
        let registry = BackendRegistry::with_builtin();
        assert_eq!(registry.list(), vec!["simulation"]);
        let backend = registry.create("simulation", &options()).unwrap();
        assert!(backend.clock().is_ready());
    }

    #[test]
    fn unknown_backend_is_reported() {
        let registry = BackendRegistry::new();
        assert!(matches!(
            registry.create("usb", &options()),
            Err(LinkError::BackendNotFound(name)) if name == "usb"
        ));
    }

    #[test]
    fn duplicate_registration_rejected() {
        let mut registry = BackendRegistry::with_builtin();
        registry.register("serial", failing).unwrap();
        assert!(registry.register("serial", failing).is_err());
        assert!(registry.create("serial", &options()).is_err());
        assert_eq!(registry.list(), vec!["serial", "simulation"]);
    }
}
