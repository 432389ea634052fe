//! The plugin contract
//!
//! A plugin is the unit of reusable ETL logic: it extracts record batches
//! from somewhere, optionally transforms them, and loads them through a
//! task-scoped database session. The engine owns transaction boundaries
//! and checkpointing policy; the plugin owns the meaning of its input.

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::checkpoint::Checkpoint;
use crate::commit::{CommitHelper, EtlMode};
use crate::config::ParamMap;
use crate::session::{DbSession, SessionError};

pub type PluginResult<T> = std::result::Result<T, PluginError>;

/// Failures raised inside plugin code
#[derive(Debug, Error)]
pub enum PluginError {
    #[error("{0}")]
    Message(String),

    #[error("missing required param `{0}`")]
    MissingParam(String),

    #[error("invalid param `{param}`: {message}")]
    InvalidParam { param: String, message: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("malformed record: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error(transparent)]
    Session(#[from] SessionError),
}

impl PluginError {
    pub fn message(message: impl Into<String>) -> Self {
        PluginError::Message(message.into())
    }

    pub fn missing_param(param: impl Into<String>) -> Self {
        PluginError::MissingParam(param.into())
    }

    pub fn invalid_param(param: impl Into<String>, message: impl Into<String>) -> Self {
        PluginError::InvalidParam { param: param.into(), message: message.into() }
    }
}

/// A single extracted record
pub type Record = Value;

/// Records grouped for one load call
pub type RecordBatch = Vec<Record>;

/// What `extract` hands back: batches, produced lazily.
///
/// The stream owns its source; it must not borrow the plugin.
pub type BatchStream = Pin<Box<dyn Stream<Item = PluginResult<RecordBatch>> + Send + 'static>>;

/// What kind of change a plugin makes to its tables
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Insert,
    Update,
    Delete,
    Patch,
    Load,
}

impl Operation {
    pub fn as_str(&self) -> &str {
        match self {
            Operation::Insert => "INSERT",
            Operation::Update => "UPDATE",
            Operation::Delete => "DELETE",
            Operation::Patch => "PATCH",
            Operation::Load => "LOAD",
        }
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything a plugin may know about the task invoking it
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub run_id: Uuid,
    pub mode: EtlMode,
    pub stage: String,
    pub task: String,
    /// Task params with every placeholder already resolved
    pub params: ParamMap,
    /// Restart position, present only when this task is the resume target
    pub checkpoint: Option<Checkpoint>,
}

impl TaskContext {
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.stage, self.task)
    }

    pub fn param(&self, key: &str) -> Option<&Value> {
        self.params.get(key)
    }

    pub fn param_str(&self, key: &str) -> Option<&str> {
        self.params.get(key).and_then(Value::as_str)
    }

    pub fn require_str(&self, key: &str) -> PluginResult<&str> {
        self.param_str(key).ok_or_else(|| PluginError::missing_param(key))
    }

    pub fn param_u64(&self, key: &str) -> PluginResult<Option<u64>> {
        match self.params.get(key) {
            None => Ok(None),
            Some(value) => value
                .as_u64()
                .map(Some)
                .ok_or_else(|| PluginError::invalid_param(key, "expected a non-negative integer")),
        }
    }
}

/// Write-side surface handed to `load`.
///
/// Statements run in the session's open transaction; `track` feeds the
/// commit helper, which settles and reopens transactions by mode. Plugins
/// never commit or roll back themselves.
pub struct LoadContext<'a> {
    session: &'a mut dyn DbSession,
    helper: &'a mut CommitHelper,
}

impl<'a> LoadContext<'a> {
    pub fn new(session: &'a mut dyn DbSession, helper: &'a mut CommitHelper) -> Self {
        Self { session, helper }
    }

    pub fn mode(&self) -> EtlMode {
        self.helper.mode()
    }

    /// Records tracked so far for this task
    pub fn records_written(&self) -> u64 {
        self.helper.count()
    }

    pub async fn execute(&mut self, sql: &str, params: &[Value]) -> PluginResult<u64> {
        Ok(self.session.execute(sql, params).await?)
    }

    pub async fn query_scalar_i64(
        &mut self,
        sql: &str,
        params: &[Value],
    ) -> PluginResult<Option<i64>> {
        Ok(self.session.query_scalar_i64(sql, params).await?)
    }

    /// Report freshly written records; may settle the transaction
    pub async fn track(&mut self, written: u64, what: &str) -> PluginResult<()> {
        Ok(self.helper.track(&mut *self.session, written, what).await?)
    }
}

/// Reusable ETL logic, registered by name and invoked by PLUGIN tasks.
#[async_trait]
pub trait Plugin: Send + Sync {
    /// Registration name, unique per registry
    fn name(&self) -> &str;

    /// The kind of change `load` makes
    fn operation(&self) -> Operation;

    /// Whether extract yields incrementally or materializes everything
    fn streaming(&self) -> bool {
        false
    }

    /// One-line human description, surfaced by plugin listings
    fn description(&self) -> PluginResult<String>;

    /// The params this plugin understands, as a JSON object of
    /// name -> short description
    fn parameter_model(&self) -> PluginResult<Value>;

    /// Tables `load` writes to, for impact review before a COMMIT run
    fn affected_tables(&self) -> PluginResult<Vec<String>>;

    /// Identifier used to honor `id=` checkpoints. The default reads a
    /// top-level `id` field; plugins with other key shapes override this.
    fn record_id(&self, record: &Record) -> Option<String> {
        match record.get("id") {
            Some(Value::String(s)) => Some(s.clone()),
            Some(Value::Number(n)) => Some(n.to_string()),
            _ => None,
        }
    }

    /// Produce the input batches. A checkpoint in the context means
    /// already-processed input must be skipped; how is up to the plugin.
    async fn extract(&mut self, ctx: &TaskContext) -> PluginResult<BatchStream>;

    /// Reshape one batch. Pure: no I/O, no session access.
    fn transform(&self, batch: RecordBatch) -> PluginResult<RecordBatch> {
        Ok(batch)
    }

    /// Write one transformed batch, returning how many records went in.
    /// Implementations report progress through [`LoadContext::track`].
    async fn load(&mut self, batch: RecordBatch, ctx: &mut LoadContext<'_>) -> PluginResult<u64>;
}

impl std::fmt::Debug for dyn Plugin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Plugin").field("name", &self.name()).finish()
    }
}
