//! Run lifecycle states and the end-of-run execution report

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::commit::EtlMode;

/// Lifecycle of a whole run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RunState {
    /// Plan computed, nothing dispatched yet
    Planned,
    /// Stages executing in order
    Running,
    /// Every planned stage finished without task failure
    Completed,
    /// A stage failed; later stages never started
    Aborted,
}

impl RunState {
    pub fn as_str(&self) -> &str {
        match self {
            RunState::Planned => "PLANNED",
            RunState::Running => "RUNNING",
            RunState::Completed => "COMPLETED",
            RunState::Aborted => "ABORTED",
        }
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of a single task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    Success,
    Failed,
    /// Excluded before execution (flags or CLI filters)
    Skipped,
    /// Planned but never dispatched because the run aborted first
    NotStarted,
}

impl TaskState {
    pub fn as_str(&self) -> &str {
        match self {
            TaskState::Success => "SUCCESS",
            TaskState::Failed => "FAILED",
            TaskState::Skipped => "SKIPPED",
            TaskState::NotStarted => "NOT_STARTED",
        }
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Write-side counters accumulated while a task runs
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TaskCounters {
    pub records_written: u64,
    pub commits: u64,
    pub rollbacks: u64,
}

/// One row of the execution report
#[derive(Debug, Clone, Serialize)]
pub struct TaskReport {
    pub stage: String,
    pub task: String,
    pub state: TaskState,
    #[serde(flatten)]
    pub counters: TaskCounters,
    pub duration_ms: u64,
    /// Failure message, present iff `state` is FAILED
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Why a task was skipped or never started
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl TaskReport {
    pub fn success(
        stage: impl Into<String>,
        task: impl Into<String>,
        counters: TaskCounters,
        duration_ms: u64,
    ) -> Self {
        Self {
            stage: stage.into(),
            task: task.into(),
            state: TaskState::Success,
            counters,
            duration_ms,
            error: None,
            reason: None,
        }
    }

    pub fn failed(
        stage: impl Into<String>,
        task: impl Into<String>,
        error: impl Into<String>,
        counters: TaskCounters,
        duration_ms: u64,
    ) -> Self {
        Self {
            stage: stage.into(),
            task: task.into(),
            state: TaskState::Failed,
            counters,
            duration_ms,
            error: Some(error.into()),
            reason: None,
        }
    }

    pub fn skipped(
        stage: impl Into<String>,
        task: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            stage: stage.into(),
            task: task.into(),
            state: TaskState::Skipped,
            counters: TaskCounters::default(),
            duration_ms: 0,
            error: None,
            reason: Some(reason.into()),
        }
    }

    pub fn not_started(
        stage: impl Into<String>,
        task: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            stage: stage.into(),
            task: task.into(),
            state: TaskState::NotStarted,
            counters: TaskCounters::default(),
            duration_ms: 0,
            error: None,
            reason: Some(reason.into()),
        }
    }
}

/// Everything a run produced, in task dispatch order
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionReport {
    pub run_id: Uuid,
    pub mode: EtlMode,
    pub state: RunState,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    pub tasks: Vec<TaskReport>,
}

impl ExecutionReport {
    pub fn new(run_id: Uuid, mode: EtlMode) -> Self {
        Self {
            run_id,
            mode,
            state: RunState::Planned,
            started_at: Utc::now(),
            finished_at: None,
            tasks: Vec::new(),
        }
    }

    pub fn push(&mut self, task: TaskReport) {
        self.tasks.push(task);
    }

    pub fn finish(&mut self, state: RunState) {
        self.state = state;
        self.finished_at = Some(Utc::now());
    }

    /// True only for a COMPLETED run; the process exit code keys off this
    pub fn succeeded(&self) -> bool {
        self.state == RunState::Completed
    }

    pub fn records_written(&self) -> u64 {
        self.tasks.iter().map(|t| t.counters.records_written).sum()
    }

    pub fn failed_tasks(&self) -> impl Iterator<Item = &TaskReport> {
        self.tasks.iter().filter(|t| t.state == TaskState::Failed)
    }
}
