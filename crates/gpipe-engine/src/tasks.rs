//! Per-task runners
//!
//! One entry point per task type. Every runner resolves `${key}` placeholders
//! first, then applies the mode policy: COMMIT and NON_COMMIT really execute
//! (writes settle per mode at batch boundaries), DRY_RUN logs what would
//! happen for anything destructive while read-only checks still run for real.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use futures::StreamExt;
use serde_json::{json, Value};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::checkpoint::Checkpoint;
use crate::commit::{CommitHelper, EtlMode};
use crate::config::{FileAction, NotifyChannel, ParamMap, TaskConfig, TaskType};
use crate::error::{EngineError, Result};
use crate::interpolate::{Interpolator, Scope};
use crate::plan::PlannedTask;
use crate::plugin::{LoadContext, Plugin, PluginError, TaskContext};
use crate::registry::PluginRegistry;
use crate::session::{DbSession, SessionProvider};
use crate::status::{TaskCounters, TaskReport};

/// Everything a task needs to run, cloneable so parallel stages can hand a
/// copy to each worker
#[derive(Clone)]
pub struct TaskEnv {
    pub registry: Arc<PluginRegistry>,
    pub sessions: Arc<dyn SessionProvider>,
    pub http: reqwest::Client,
    pub interpolator: Interpolator,
    pub scope: Scope,
    pub run_id: Uuid,
    pub mode: EtlMode,
    /// Global commit cadence override from the CLI
    pub commit_after: Option<u64>,
}

/// Run one planned task to completion, folding any failure into the report
pub async fn execute_task(env: TaskEnv, stage: String, planned: PlannedTask) -> TaskReport {
    let task_name = planned.config.name.clone();
    let started = Instant::now();
    info!("task {}.{} starting ({})", stage, task_name, planned.config.task_type);

    let outcome = dispatch(&env, &stage, &planned.config, planned.checkpoint).await;
    let duration_ms = started.elapsed().as_millis() as u64;

    match outcome {
        Ok(counters) => {
            info!(
                "task {}.{} succeeded in {}ms ({} records)",
                stage, task_name, duration_ms, counters.records_written
            );
            TaskReport::success(stage, task_name, counters, duration_ms)
        },
        Err(e) => {
            warn!("task {}.{} failed: {}", stage, task_name, e);
            let counters = TaskCounters::default();
            TaskReport::failed(stage, task_name, e.to_string(), counters, duration_ms)
        },
    }
}

async fn dispatch(
    env: &TaskEnv,
    stage: &str,
    config: &TaskConfig,
    checkpoint: Option<Checkpoint>,
) -> Result<TaskCounters> {
    let params = env.interpolator.resolve_params(&config.params, &env.scope)?;

    match config.task_type {
        TaskType::Plugin => run_plugin(env, stage, config, params, checkpoint).await,
        TaskType::Shell => run_shell(env, stage, config).await,
        TaskType::File => run_file(env, stage, config, &params).await,
        TaskType::Validation => run_validation(env, stage, config, &params).await,
        TaskType::Notify => run_notify(env, stage, config, &params).await,
    }
}

// ============================================================================
// PLUGIN
// ============================================================================

async fn run_plugin(
    env: &TaskEnv,
    stage: &str,
    config: &TaskConfig,
    params: ParamMap,
    checkpoint: Option<Checkpoint>,
) -> Result<TaskCounters> {
    let name = config
        .plugin
        .as_deref()
        .ok_or_else(|| EngineError::configuration("PLUGIN task has no plugin name"))?;
    let mut plugin = env.registry.instantiate(name)?;

    let threshold = commit_threshold(env, &params)?;
    let ctx = TaskContext {
        run_id: env.run_id,
        mode: env.mode,
        stage: stage.to_string(),
        task: config.name.clone(),
        params,
        checkpoint,
    };

    let mut session = env.sessions.open().await?;
    session.begin().await?;
    let mut helper = CommitHelper::new(env.mode, threshold);

    let outcome = drive_plugin(
        plugin.as_mut(),
        &ctx,
        session.as_mut(),
        &mut helper,
        stage,
        &config.name,
    )
    .await;

    match outcome {
        Ok(()) => {
            helper.finish(session.as_mut(), "records").await?;
            Ok(helper.counters())
        },
        Err(e) => {
            // leave no transaction dangling behind a failed task
            if let Err(rollback_err) = session.rollback().await {
                warn!("rollback after task failure also failed: {rollback_err}");
            }
            Err(e)
        },
    }
}

async fn drive_plugin(
    plugin: &mut dyn Plugin,
    ctx: &TaskContext,
    session: &mut dyn DbSession,
    helper: &mut CommitHelper,
    stage: &str,
    task: &str,
) -> Result<()> {
    let fail = |e: PluginError| EngineError::task_execution(stage, task, e);

    let mut stream = plugin.extract(ctx).await.map_err(fail)?;
    while let Some(batch) = stream.next().await {
        let batch = batch.map_err(fail)?;
        let batch = plugin.transform(batch).map_err(fail)?;
        if batch.is_empty() {
            continue;
        }
        let mut load_ctx = LoadContext::new(&mut *session, &mut *helper);
        let written = plugin.load(batch, &mut load_ctx).await.map_err(fail)?;
        debug!("batch of {written} loaded by {}", ctx.qualified_name());
    }
    Ok(())
}

fn commit_threshold(env: &TaskEnv, params: &ParamMap) -> Result<Option<u64>> {
    // CLI override beats the per-task param
    if env.commit_after.is_some() {
        return Ok(env.commit_after);
    }
    match params.get("commit_after") {
        None => Ok(None),
        Some(value) => value.as_u64().map(Some).ok_or_else(|| {
            EngineError::configuration("task param `commit_after` must be a non-negative integer")
        }),
    }
}

// ============================================================================
// SHELL
// ============================================================================

async fn run_shell(env: &TaskEnv, stage: &str, config: &TaskConfig) -> Result<TaskCounters> {
    let raw = config
        .command
        .as_deref()
        .ok_or_else(|| EngineError::configuration("SHELL task has no command"))?;
    let command = env.interpolator.resolve_str(raw, &env.scope)?;

    if env.mode.is_dry_run() {
        info!("DRY RUN: would execute `{command}`");
        return Ok(TaskCounters::default());
    }

    let fail = |e: PluginError| EngineError::task_execution(stage, &config.name, e);
    let shown = command.clone();
    let output = tokio::task::spawn_blocking(move || {
        std::process::Command::new("sh").arg("-c").arg(&command).output()
    })
    .await
    .map_err(|e| fail(PluginError::message(format!("command worker failed: {e}"))))?
    .map_err(|e| fail(PluginError::Io(e)))?;

    let stdout = String::from_utf8_lossy(&output.stdout);
    if !stdout.trim().is_empty() {
        debug!("`{shown}` stdout: {}", stdout.trim());
    }

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(fail(PluginError::message(format!(
            "`{shown}` exited with {}: {}",
            output.status,
            stderr.trim()
        ))));
    }
    Ok(TaskCounters::default())
}

// ============================================================================
// FILE
// ============================================================================

async fn run_file(
    env: &TaskEnv,
    stage: &str,
    config: &TaskConfig,
    params: &ParamMap,
) -> Result<TaskCounters> {
    let fail = |e: PluginError| EngineError::task_execution(stage, &config.name, e);

    let raw = config
        .path
        .as_ref()
        .ok_or_else(|| EngineError::configuration("FILE task has no path"))?;
    let path = PathBuf::from(env.interpolator.resolve_str(&raw.to_string_lossy(), &env.scope)?);
    let action = config
        .action
        .ok_or_else(|| EngineError::configuration("FILE task has no action"))?;

    match action {
        // read-only, runs in every mode
        FileAction::Exists => {
            if tokio::fs::metadata(&path).await.is_err() {
                return Err(fail(PluginError::message(format!(
                    "file not found: {}",
                    path.display()
                ))));
            }
            debug!("file exists: {}", path.display());
        },
        FileAction::Copy | FileAction::Move => {
            let dest = params
                .get("dest")
                .and_then(Value::as_str)
                .ok_or_else(|| EngineError::configuration("file action requires a `dest` param"))?;
            let dest = PathBuf::from(dest);
            if env.mode.is_dry_run() {
                info!(
                    "DRY RUN: would {} {} to {}",
                    action.as_str(),
                    path.display(),
                    dest.display()
                );
                return Ok(TaskCounters::default());
            }
            match action {
                FileAction::Copy => {
                    tokio::fs::copy(&path, &dest).await.map_err(|e| fail(PluginError::Io(e)))?;
                },
                _ => {
                    tokio::fs::rename(&path, &dest).await.map_err(|e| fail(PluginError::Io(e)))?;
                },
            }
            info!("{} {} to {}", action.as_str(), path.display(), dest.display());
        },
        FileAction::Delete => {
            if env.mode.is_dry_run() {
                info!("DRY RUN: would delete {}", path.display());
                return Ok(TaskCounters::default());
            }
            tokio::fs::remove_file(&path).await.map_err(|e| fail(PluginError::Io(e)))?;
            info!("deleted {}", path.display());
        },
    }
    Ok(TaskCounters::default())
}

// ============================================================================
// VALIDATION
// ============================================================================

/// Read-only data checks; these run for real in every mode
async fn run_validation(
    env: &TaskEnv,
    stage: &str,
    config: &TaskConfig,
    params: &ParamMap,
) -> Result<TaskCounters> {
    let fail = |message: String| {
        EngineError::task_execution(stage, &config.name, PluginError::message(message))
    };

    let check = params
        .get("check")
        .and_then(Value::as_str)
        .ok_or_else(|| EngineError::configuration("VALIDATION task has no `check` param"))?;

    match check {
        "file_exists" => {
            let file = params.get("file").and_then(Value::as_str).ok_or_else(|| {
                EngineError::configuration("file_exists check needs a `file` param")
            })?;
            if tokio::fs::metadata(file).await.is_err() {
                return Err(fail(format!("validation file_exists failed: {file} does not exist")));
            }
            info!("validation file_exists passed: {file}");
        },
        "row_count" => {
            let table = params.get("table").and_then(Value::as_str).ok_or_else(|| {
                EngineError::configuration("row_count check needs a `table` param")
            })?;
            if table.is_empty()
                || !table.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.')
            {
                return Err(EngineError::configuration(format!(
                    "row_count check: invalid table name '{table}'"
                )));
            }
            let min_rows = params.get("min_rows").and_then(Value::as_i64).unwrap_or(1);

            let mut session = env.sessions.open().await?;
            session.begin().await?;
            let counted = session
                .query_scalar_i64(&format!("SELECT count(*) FROM {table}"), &[])
                .await;
            // read-only, nothing to keep either way
            if let Err(rollback_err) = session.rollback().await {
                warn!("rollback after validation failed: {rollback_err}");
            }

            let count = counted?.unwrap_or(0);
            if count < min_rows {
                return Err(fail(format!(
                    "validation row_count failed: {table} has {count} rows, \
                     expected at least {min_rows}"
                )));
            }
            info!("validation row_count passed: {table} has {count} rows");
        },
        other => {
            return Err(EngineError::configuration(format!("unknown validation check '{other}'")))
        },
    }
    Ok(TaskCounters::default())
}

// ============================================================================
// NOTIFY
// ============================================================================

async fn run_notify(
    env: &TaskEnv,
    stage: &str,
    config: &TaskConfig,
    params: &ParamMap,
) -> Result<TaskCounters> {
    let raw = config
        .message
        .as_deref()
        .ok_or_else(|| EngineError::configuration("NOTIFY task has no message"))?;
    let message = env.interpolator.resolve_str(raw, &env.scope)?;

    match config.channel.unwrap_or_default() {
        NotifyChannel::Log => {
            info!("NOTIFY: {message}");
        },
        NotifyChannel::Webhook => {
            let url = params
                .get("url")
                .and_then(Value::as_str)
                .ok_or_else(|| EngineError::configuration("webhook notify needs a `url` param"))?;

            if env.mode.is_dry_run() {
                info!("DRY RUN: would POST notification to {url}");
                return Ok(TaskCounters::default());
            }

            let payload = json!({
                "run_id": env.run_id,
                "stage": stage,
                "task": config.name,
                "message": message,
                "sent_at": chrono::Utc::now(),
            });
            env.http
                .post(url)
                .json(&payload)
                .send()
                .await
                .and_then(|r| r.error_for_status())
                .map_err(|e| {
                    EngineError::task_execution(
                        stage,
                        &config.name,
                        PluginError::message(format!("webhook delivery failed: {e}")),
                    )
                })?;
            info!("notification delivered to {url}");
        },
    }
    Ok(TaskCounters::default())
}
