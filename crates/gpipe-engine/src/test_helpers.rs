//! Test helpers and fixtures for engine tests
//!
//! Canned plugins, a shared in-memory session provider, and builders that
//! cut setup boilerplate in task and pipeline tests.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::checkpoint::Checkpoint;
use crate::commit::EtlMode;
use crate::config::{ParamMap, TaskConfig, TaskType};
use crate::interpolate::{Interpolator, Scope};
use crate::plan::PlannedTask;
use crate::plugin::{
    BatchStream, LoadContext, Operation, Plugin, PluginError, PluginResult, RecordBatch,
    TaskContext,
};
use crate::registry::PluginRegistry;
use crate::session::{DbSession, MemorySession, SessionProvider, SessionResult};
use crate::tasks::TaskEnv;

/// Provider whose sessions all share one [`MemorySession`], so a test can
/// inspect the call log after tasks finish
#[derive(Clone, Default)]
pub struct SharedMemoryProvider {
    session: Arc<Mutex<MemorySession>>,
}

impl SharedMemoryProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_scalar_results(results: Vec<Option<i64>>) -> Self {
        Self { session: Arc::new(Mutex::new(MemorySession::with_scalar_results(results))) }
    }

    pub async fn log(&self) -> Vec<String> {
        self.session.lock().await.log.clone()
    }

    pub async fn count(&self, op: &str) -> usize {
        self.session.lock().await.count(op)
    }
}

struct SharedMemorySession(Arc<Mutex<MemorySession>>);

#[async_trait]
impl DbSession for SharedMemorySession {
    async fn begin(&mut self) -> SessionResult<()> {
        self.0.lock().await.begin().await
    }

    async fn execute(&mut self, sql: &str, params: &[Value]) -> SessionResult<u64> {
        self.0.lock().await.execute(sql, params).await
    }

    async fn query_scalar_i64(
        &mut self,
        sql: &str,
        params: &[Value],
    ) -> SessionResult<Option<i64>> {
        self.0.lock().await.query_scalar_i64(sql, params).await
    }

    async fn commit(&mut self) -> SessionResult<()> {
        self.0.lock().await.commit().await
    }

    async fn rollback(&mut self) -> SessionResult<()> {
        self.0.lock().await.rollback().await
    }
}

#[async_trait]
impl SessionProvider for SharedMemoryProvider {
    async fn open(&self) -> SessionResult<Box<dyn DbSession>> {
        Ok(Box::new(SharedMemorySession(self.session.clone())))
    }
}

/// Emits `batches` batches of `batch_size` synthetic records and inserts
/// each one, tracking progress record by record
pub struct CountingPlugin;

#[async_trait]
impl Plugin for CountingPlugin {
    fn name(&self) -> &str {
        "counting-loader"
    }

    fn operation(&self) -> Operation {
        Operation::Insert
    }

    fn streaming(&self) -> bool {
        true
    }

    fn description(&self) -> PluginResult<String> {
        Ok("emits synthetic records for tests".to_string())
    }

    fn parameter_model(&self) -> PluginResult<Value> {
        Ok(json!({"batches": "batch count", "batch_size": "records per batch"}))
    }

    fn affected_tables(&self) -> PluginResult<Vec<String>> {
        Ok(vec!["records".to_string()])
    }

    async fn extract(&mut self, ctx: &TaskContext) -> PluginResult<BatchStream> {
        let batches = ctx.param_u64("batches").ok().flatten().unwrap_or(1);
        let batch_size = ctx.param_u64("batch_size").ok().flatten().unwrap_or(1) as usize;

        let mut records: Vec<Value> =
            (0..batches * batch_size as u64).map(|i| json!({"id": i})).collect();
        match &ctx.checkpoint {
            Some(Checkpoint::Line(n)) => {
                records = records.split_off((*n as usize).min(records.len()));
            },
            Some(Checkpoint::Id(id)) => {
                if let Some(pos) = records.iter().position(|r| r["id"].to_string() == *id) {
                    records = records.split_off(pos + 1);
                }
            },
            None => {},
        }

        let all: Vec<PluginResult<RecordBatch>> =
            records.chunks(batch_size.max(1)).map(|chunk| Ok(chunk.to_vec())).collect();
        Ok(Box::pin(stream::iter(all)))
    }

    async fn load(&mut self, batch: RecordBatch, ctx: &mut LoadContext<'_>) -> PluginResult<u64> {
        for record in &batch {
            ctx.execute("INSERT INTO records (payload) VALUES ($1)", &[record.clone()]).await?;
            ctx.track(1, "records").await?;
        }
        Ok(batch.len() as u64)
    }
}

/// Extracts fine, fails on the first load call
pub struct ExplodingPlugin;

#[async_trait]
impl Plugin for ExplodingPlugin {
    fn name(&self) -> &str {
        "exploding-loader"
    }

    fn operation(&self) -> Operation {
        Operation::Insert
    }

    fn description(&self) -> PluginResult<String> {
        Ok("always fails during load".to_string())
    }

    fn parameter_model(&self) -> PluginResult<Value> {
        Ok(json!({}))
    }

    fn affected_tables(&self) -> PluginResult<Vec<String>> {
        Ok(vec![])
    }

    async fn extract(&mut self, _ctx: &TaskContext) -> PluginResult<BatchStream> {
        Ok(Box::pin(stream::iter(vec![Ok(vec![json!({"id": 1})])])))
    }

    async fn load(
        &mut self,
        _batch: RecordBatch,
        _ctx: &mut LoadContext<'_>,
    ) -> PluginResult<u64> {
        Err(PluginError::message("load blew up"))
    }
}

pub fn register_test_plugins(registry: &mut PluginRegistry) {
    registry.register(|| Box::new(CountingPlugin));
    registry.register(|| Box::new(ExplodingPlugin));
}

/// Environment with the test plugins and a fresh shared in-memory session
pub fn task_env(mode: EtlMode) -> TaskEnv {
    task_env_with_sessions(mode, SharedMemoryProvider::new())
}

pub fn task_env_with_sessions(mode: EtlMode, sessions: SharedMemoryProvider) -> TaskEnv {
    let mut registry = PluginRegistry::new();
    register_test_plugins(&mut registry);
    TaskEnv {
        registry: Arc::new(registry),
        sessions: Arc::new(sessions),
        http: reqwest::Client::new(),
        interpolator: Interpolator::new().expect("placeholder pattern compiles"),
        scope: Scope::new(),
        run_id: Uuid::new_v4(),
        mode,
        commit_after: None,
    }
}

/// Minimal task config; tests fill in the type-specific fields they need
pub fn base_task(name: &str, task_type: TaskType) -> TaskConfig {
    TaskConfig {
        name: name.to_string(),
        task_type,
        plugin: None,
        params: ParamMap::new(),
        skip: false,
        deprecated: false,
        command: None,
        path: None,
        action: None,
        channel: None,
        message: None,
        comment: None,
    }
}

/// Wrap a task config as a runnable planned task
pub fn planned(config: TaskConfig) -> PlannedTask {
    PlannedTask { config, will_run: true, reason: None, checkpoint: None }
}
