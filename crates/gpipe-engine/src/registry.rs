//! Plugin registry
//!
//! Registration happens once at startup, before any task runs; afterwards
//! the registry is shared read-only, handing out a fresh plugin instance
//! per task so concurrent tasks never share plugin state.

use std::collections::HashMap;

use serde::Serialize;
use serde_json::Value;
use tracing::warn;

use crate::error::{EngineError, Result};
use crate::plugin::Plugin;

type PluginFactory = Box<dyn Fn() -> Box<dyn Plugin> + Send + Sync>;

/// Introspection snapshot of one registered plugin
#[derive(Debug, Clone, Serialize)]
pub struct PluginDescription {
    pub name: String,
    pub operation: String,
    pub streaming: bool,
    pub description: String,
    pub parameter_model: Value,
    pub affected_tables: Vec<String>,
}

#[derive(Default)]
pub struct PluginRegistry {
    factories: HashMap<String, PluginFactory>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a plugin under the name its instances report.
    ///
    /// Re-registering a name replaces the previous entry; the last
    /// registration wins.
    pub fn register<F>(&mut self, factory: F)
    where
        F: Fn() -> Box<dyn Plugin> + Send + Sync + 'static,
    {
        let name = factory().name().to_string();
        if self.factories.insert(name.clone(), Box::new(factory)).is_some() {
            warn!("plugin '{}' re-registered, replacing previous registration", name);
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Fresh instance of a registered plugin
    pub fn instantiate(&self, name: &str) -> Result<Box<dyn Plugin>> {
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| EngineError::PluginNotFound(name.to_string()))?;
        Ok(factory())
    }

    /// Registered names, sorted for stable output
    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.keys().cloned().collect();
        names.sort();
        names
    }

    /// Full introspection of one plugin.
    ///
    /// Each accessor is surfaced separately so a failure points at the
    /// accessor that raised it, not at introspection in general.
    pub fn describe(&self, name: &str) -> Result<PluginDescription> {
        let plugin = self.instantiate(name)?;

        let description = plugin
            .description()
            .map_err(|e| EngineError::introspection(name, "description", e))?;
        let parameter_model = plugin
            .parameter_model()
            .map_err(|e| EngineError::introspection(name, "parameter_model", e))?;
        let affected_tables = plugin
            .affected_tables()
            .map_err(|e| EngineError::introspection(name, "affected_tables", e))?;

        Ok(PluginDescription {
            name: plugin.name().to_string(),
            operation: plugin.operation().to_string(),
            streaming: plugin.streaming(),
            description,
            parameter_model,
            affected_tables,
        })
    }
}

impl std::fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginRegistry").field("plugins", &self.list()).finish()
    }
}
