//! Error types shared across the gpipe workspace

use thiserror::Error;

/// Result type alias for common operations
pub type Result<T> = std::result::Result<T, CommonError>;

/// Errors raised by the shared infrastructure layers
#[derive(Error, Debug)]
pub enum CommonError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid {what}: {value}")]
    InvalidValue { what: &'static str, value: String },

    #[error("invalid log filter directive '{directive}': {message}")]
    FilterDirective { directive: String, message: String },

    #[error("logging already initialized or failed to initialize: {0}")]
    SubscriberInit(#[from] tracing_subscriber::util::TryInitError),
}

impl CommonError {
    /// Build an `InvalidValue` error for a rejected enum-ish string
    pub fn invalid_value(what: &'static str, value: impl Into<String>) -> Self {
        Self::InvalidValue {
            what,
            value: value.into(),
        }
    }
}
