//! Error types for the gpipe CLI
//!
//! Engine errors already carry the failing stage/task/plugin in their
//! messages and pass through unchanged; the variants here cover problems
//! that exist only at the command-line boundary.

use thiserror::Error;

/// Result type alias for CLI operations
pub type Result<T> = std::result::Result<T, CliError>;

#[derive(Error, Debug)]
pub enum CliError {
    /// Configuration, planning, or execution failure inside the engine
    #[error(transparent)]
    Engine(#[from] gpipe_engine::EngineError),

    /// Argument combination clap cannot reject on its own
    #[error("{0}")]
    Usage(String),

    /// A `--param` override is malformed
    #[error("invalid --param override: {0}. Pass KEY=VALUE pairs or one JSON object.")]
    InvalidParam(String),

    /// File system operation failed
    #[error("file operation failed: {0}")]
    Io(#[from] std::io::Error),

    /// Rendering structured output failed
    #[error("failed to render JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// Generic anyhow error wrapper
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl CliError {
    /// Create a usage error
    pub fn usage(msg: impl Into<String>) -> Self {
        Self::Usage(msg.into())
    }

    /// Create an invalid param error
    pub fn invalid_param(msg: impl Into<String>) -> Self {
        Self::InvalidParam(msg.into())
    }
}
