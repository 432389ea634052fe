//! gpipe Built-in Plugins
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Plugins that ship with the engine. Site-specific plugin crates follow
//! the same shape: implement [`gpipe_engine::Plugin`] and register a
//! factory before the pipeline runs.

pub mod jsonl;

pub use jsonl::JsonlLoader;

use gpipe_engine::PluginRegistry;

/// Register every built-in plugin
pub fn register_builtins(registry: &mut PluginRegistry) {
    registry.register(|| Box::new(JsonlLoader::new()));
}
