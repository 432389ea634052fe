//! gpipe Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared error handling and logging setup for the gpipe workspace.
//!
//! # Overview
//!
//! This crate provides the functionality every gpipe workspace member needs
//! before it can do anything domain-specific:
//!
//! - **Error Handling**: the `CommonError` type and `Result` alias
//! - **Logging**: `LogConfig` and the tracing subscriber initialization
//!
//! # Example
//!
//! ```no_run
//! use gpipe_common::logging::{init_logging, LogConfig, LogLevel};
//!
//! fn main() -> gpipe_common::Result<()> {
//!     let config = LogConfig::builder().level(LogLevel::Debug).build();
//!     init_logging(&config)?;
//!     tracing::info!("ready");
//!     Ok(())
//! }
//! ```

pub mod error;
pub mod logging;

// Re-export commonly used types
pub use error::{CommonError, Result};
