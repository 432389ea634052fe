//! Engine error taxonomy
//!
//! One variant per failure class the orchestrator distinguishes. The
//! messages name the failing stage/task/plugin so an operator can act on a
//! log line without re-running with extra verbosity.

use thiserror::Error;

use crate::plugin::PluginError;
use crate::session::SessionError;

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors raised by the pipeline engine
#[derive(Error, Debug)]
pub enum EngineError {
    /// Invalid pipeline/stage/task definition. Raised before any stage runs.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A `${key}` placeholder had no value in the resolution scope. Fails
    /// the owning task only.
    #[error("interpolation error: no value for placeholder '${{{key}}}'")]
    Interpolation { key: String },

    /// Lookup of an unregistered plugin name. Fails the owning task only.
    #[error("plugin not found: '{0}' is not registered")]
    PluginNotFound(String),

    /// A metadata accessor failed during describe/list. Carries the
    /// accessor name so broken plugins can be diagnosed without running.
    #[error("plugin introspection error: plugin '{plugin}' failed in {accessor}: {source}")]
    PluginIntrospection {
        plugin: String,
        accessor: &'static str,
        #[source]
        source: PluginError,
    },

    /// extract/transform/load failure inside a task. Fails the task, its
    /// stage, and (by barrier semantics) the pipeline.
    #[error("task '{stage}.{task}' failed: {source}")]
    TaskExecution {
        stage: String,
        task: String,
        #[source]
        source: PluginError,
    },

    /// Commit or rollback failure. Always fatal to the task.
    #[error("transaction error: {0}")]
    Transaction(#[from] SessionError),
}

impl EngineError {
    /// Build a configuration error from anything displayable
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Build an introspection error attributing the failing accessor
    pub fn introspection(
        plugin: impl Into<String>,
        accessor: &'static str,
        source: PluginError,
    ) -> Self {
        Self::PluginIntrospection {
            plugin: plugin.into(),
            accessor,
            source,
        }
    }

    /// Build a task execution error naming the owning stage and task
    pub fn task_execution(
        stage: impl Into<String>,
        task: impl Into<String>,
        source: PluginError,
    ) -> Self {
        Self::TaskExecution {
            stage: stage.into(),
            task: task.into(),
            source,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn interpolation_error_names_the_key() {
        let err = EngineError::Interpolation {
            key: "end".to_string(),
        };
        assert!(err.to_string().contains("${end}"));
    }

    #[test]
    fn introspection_error_names_the_accessor() {
        let err = EngineError::introspection(
            "broken",
            "affected_tables",
            PluginError::message("boom"),
        );
        let text = err.to_string();
        assert!(text.contains("affected_tables"));
        assert!(text.contains("broken"));
    }
}
