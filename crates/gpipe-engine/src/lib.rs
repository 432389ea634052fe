//! gpipe Engine
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Stage-and-task pipeline orchestration with pluggable ETL logic.
//!
//! # Overview
//!
//! A pipeline definition (YAML or JSON) declares ordered stages of tasks.
//! This crate turns a definition plus CLI filters into an execution plan,
//! then drives it stage by stage:
//!
//! - **Config**: the definition model and its structural validation
//! - **Plan**: pure run/skip computation with resume and filter handling
//! - **Plugins**: the extract/transform/load contract and the registry
//! - **Sessions**: task-scoped database handles with explicit transactions
//! - **Manager**: barrier semantics, bounded parallelism, worker processes
//!
//! Execution modes keep rehearsal cheap: DRY_RUN simulates destructive
//! work, NON_COMMIT exercises the full write path but rolls every batch
//! back, and only COMMIT makes changes stick.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use gpipe_engine::{
//!     NullSessionProvider, PipelineConfig, PipelineManager, PluginRegistry, RunOptions,
//! };
//!
//! # async fn run() -> gpipe_engine::Result<()> {
//! let config = PipelineConfig::load("pipeline.yaml".as_ref())?;
//! let manager = PipelineManager::new(
//!     config,
//!     Arc::new(PluginRegistry::new()),
//!     Arc::new(NullSessionProvider),
//!     RunOptions::default(),
//! );
//! let report = manager.run().await?;
//! println!("{}", report.state);
//! # Ok(())
//! # }
//! ```

pub mod checkpoint;
pub mod commit;
pub mod config;
pub mod error;
pub mod interpolate;
pub mod manager;
pub mod plan;
pub mod plugin;
pub mod registry;
pub mod session;
pub mod status;
pub mod tasks;
pub mod test_helpers;

// Re-export commonly used types
pub use checkpoint::{Checkpoint, TaskSelector};
pub use commit::{CommitHelper, EtlMode, DEFAULT_COMMIT_AFTER};
pub use config::{
    FileAction, NotifyChannel, ParallelMode, ParamMap, PipelineConfig, StageConfig, TaskConfig,
    TaskType,
};
pub use error::{EngineError, Result};
pub use interpolate::{Interpolator, Scope};
pub use manager::{PipelineManager, RunOptions};
pub use plan::{build_plan, ExecutionPlan, PlannedStage, PlannedTask, RunFilters};
pub use plugin::{
    BatchStream, LoadContext, Operation, Plugin, PluginError, PluginResult, Record, RecordBatch,
    TaskContext,
};
pub use registry::{PluginDescription, PluginRegistry};
pub use session::{
    DbSession, MemorySession, NullSessionProvider, PgSessionProvider, SessionError,
    SessionProvider, SessionResult,
};
pub use status::{ExecutionReport, RunState, TaskCounters, TaskReport, TaskState};
pub use tasks::{execute_task, TaskEnv};
