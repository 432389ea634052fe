//! Pipeline definition model
//!
//! A pipeline is an ordered list of stages, each an ordered list of tasks.
//! Definitions load from YAML or JSON (chosen by file extension) and are
//! validated in full before anything executes; the model is read-only for
//! the rest of the run.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{EngineError, Result};

/// Parameter mapping as it appears in pipeline definitions
pub type ParamMap = serde_json::Map<String, Value>;

/// How tasks within a stage are dispatched
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum ParallelMode {
    /// Strictly sequential, declared order
    #[default]
    #[serde(alias = "none")]
    None,
    /// Bounded concurrent tasks inside this process
    #[serde(alias = "thread")]
    Thread,
    /// Bounded concurrent child processes
    #[serde(alias = "process")]
    Process,
}

impl ParallelMode {
    pub fn as_str(&self) -> &str {
        match self {
            ParallelMode::None => "NONE",
            ParallelMode::Thread => "THREAD",
            ParallelMode::Process => "PROCESS",
        }
    }
}

impl std::fmt::Display for ParallelMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The unit-of-work kind a task dispatches to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TaskType {
    /// Invoke a registered plugin's extract/transform/load
    #[serde(alias = "plugin")]
    Plugin,
    /// Run a shell command
    #[serde(alias = "shell")]
    Shell,
    /// Filesystem action (exists/copy/move/delete)
    #[serde(alias = "file")]
    File,
    /// Read-only data check
    #[serde(alias = "validation")]
    Validation,
    /// Emit a message to a log or webhook channel
    #[serde(alias = "notify")]
    Notify,
}

impl TaskType {
    pub fn as_str(&self) -> &str {
        match self {
            TaskType::Plugin => "PLUGIN",
            TaskType::Shell => "SHELL",
            TaskType::File => "FILE",
            TaskType::Validation => "VALIDATION",
            TaskType::Notify => "NOTIFY",
        }
    }
}

impl std::fmt::Display for TaskType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Action for FILE tasks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileAction {
    Exists,
    Copy,
    Move,
    Delete,
}

impl FileAction {
    pub fn as_str(&self) -> &str {
        match self {
            FileAction::Exists => "exists",
            FileAction::Copy => "copy",
            FileAction::Move => "move",
            FileAction::Delete => "delete",
        }
    }
}

/// Delivery channel for NOTIFY tasks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum NotifyChannel {
    #[default]
    Log,
    Webhook,
}

impl NotifyChannel {
    pub fn as_str(&self) -> &str {
        match self {
            NotifyChannel::Log => "log",
            NotifyChannel::Webhook => "webhook",
        }
    }
}

/// Top-level pipeline definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Pipeline-wide parameter defaults, overridable from the CLI
    #[serde(default)]
    pub params: ParamMap,

    /// Stages in execution order
    pub stages: Vec<StageConfig>,

    /// Free-text annotation, ignored by the engine
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

/// One stage: a barrier of tasks
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageConfig {
    /// Unique within the pipeline
    pub name: String,

    /// Task dispatch mode for this stage
    #[serde(default)]
    pub parallel_mode: ParallelMode,

    /// Worker bound; required when `parallel_mode` is not NONE
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrency: Option<usize>,

    /// Tasks in declared order; never empty
    pub tasks: Vec<TaskConfig>,

    #[serde(default)]
    pub skip: bool,

    #[serde(default)]
    pub deprecated: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

impl StageConfig {
    /// Look up a task by name
    pub fn find_task(&self, name: &str) -> Option<&TaskConfig> {
        self.tasks.iter().find(|t| t.name == name)
    }

    /// Whether this stage is excluded from execution by its own flags
    pub fn excluded(&self) -> bool {
        self.skip || self.deprecated
    }

    /// Worker bound in effect for this stage (1 for NONE)
    pub fn effective_concurrency(&self) -> usize {
        match self.parallel_mode {
            ParallelMode::None => 1,
            ParallelMode::Thread | ParallelMode::Process => {
                self.max_concurrency.unwrap_or(1).max(1)
            },
        }
    }
}

/// One task: the smallest schedulable unit
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskConfig {
    /// Unique within the owning stage
    pub name: String,

    /// Dispatch kind
    #[serde(rename = "type")]
    pub task_type: TaskType,

    /// Registered plugin name; required iff `type` is PLUGIN
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plugin: Option<String>,

    /// Task parameters; string values may contain `${key}` placeholders
    #[serde(default)]
    pub params: ParamMap,

    #[serde(default)]
    pub skip: bool,

    #[serde(default)]
    pub deprecated: bool,

    /// SHELL only: the command line to run
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,

    /// FILE only: the path the action applies to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,

    /// FILE only: what to do with `path`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<FileAction>,

    /// NOTIFY only: delivery channel (defaults to log)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<NotifyChannel>,

    /// NOTIFY only: the message to deliver
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

impl TaskConfig {
    /// Whether this task is excluded from execution by its own flags
    pub fn excluded(&self) -> bool {
        self.skip || self.deprecated
    }
}

/// Known VALIDATION checks, referenced by the `check` task param
pub const VALIDATION_CHECKS: &[&str] = &["file_exists", "row_count"];

impl PipelineConfig {
    /// Load and validate a pipeline definition from a YAML or JSON file
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            EngineError::configuration(format!(
                "cannot read pipeline definition {}: {e}",
                path.display()
            ))
        })?;

        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default()
            .to_lowercase();

        let config: Self = match extension.as_str() {
            "yaml" | "yml" => serde_yaml::from_str(&contents).map_err(|e| {
                EngineError::configuration(format!("invalid YAML in {}: {e}", path.display()))
            })?,
            "json" => serde_json::from_str(&contents).map_err(|e| {
                EngineError::configuration(format!("invalid JSON in {}: {e}", path.display()))
            })?,
            other => {
                return Err(EngineError::configuration(format!(
                    "unsupported pipeline definition format '.{other}' for {}: \
                     expected .yaml, .yml, or .json",
                    path.display()
                )))
            },
        };

        config.validate()?;
        Ok(config)
    }

    /// Look up a stage by name
    pub fn find_stage(&self, name: &str) -> Option<&StageConfig> {
        self.stages.iter().find(|s| s.name == name)
    }

    /// Check every structural invariant, before anything executes
    pub fn validate(&self) -> Result<()> {
        let mut seen_stages = HashSet::new();
        for stage in &self.stages {
            if !seen_stages.insert(stage.name.as_str()) {
                return Err(EngineError::configuration(format!(
                    "duplicate stage name '{}'",
                    stage.name
                )));
            }
            stage.validate()?;
        }
        Ok(())
    }
}

impl StageConfig {
    fn validate(&self) -> Result<()> {
        if self.tasks.is_empty() {
            return Err(EngineError::configuration(format!(
                "stage '{}' has no tasks",
                self.name
            )));
        }

        if self.parallel_mode != ParallelMode::None {
            match self.max_concurrency {
                Some(n) if n >= 1 => {},
                Some(_) => {
                    return Err(EngineError::configuration(format!(
                        "stage '{}': max_concurrency must be at least 1 for parallel_mode {}",
                        self.name, self.parallel_mode
                    )))
                },
                None => {
                    return Err(EngineError::configuration(format!(
                        "stage '{}': max_concurrency is required for parallel_mode {}",
                        self.name, self.parallel_mode
                    )))
                },
            }
        }

        let mut seen_tasks = HashSet::new();
        for task in &self.tasks {
            if !seen_tasks.insert(task.name.as_str()) {
                return Err(EngineError::configuration(format!(
                    "stage '{}': duplicate task name '{}'",
                    self.name, task.name
                )));
            }
            task.validate(&self.name)?;
        }
        Ok(())
    }
}

impl TaskConfig {
    fn validate(&self, stage: &str) -> Result<()> {
        let missing = |field: &str| {
            EngineError::configuration(format!(
                "stage '{stage}' task '{}': {} task requires `{field}`",
                self.name, self.task_type
            ))
        };

        match self.task_type {
            TaskType::Plugin => {
                if self.plugin.as_deref().unwrap_or("").is_empty() {
                    return Err(missing("plugin"));
                }
            },
            TaskType::Shell => {
                if self.command.as_deref().unwrap_or("").is_empty() {
                    return Err(missing("command"));
                }
            },
            TaskType::File => {
                if self.path.is_none() {
                    return Err(missing("path"));
                }
                let action = self.action.ok_or_else(|| missing("action"))?;
                if matches!(action, FileAction::Copy | FileAction::Move)
                    && !self.params.contains_key("dest")
                {
                    return Err(EngineError::configuration(format!(
                        "stage '{stage}' task '{}': file action '{}' requires a `dest` param",
                        self.name,
                        action.as_str()
                    )));
                }
            },
            TaskType::Validation => {
                let check = self.params.get("check").and_then(Value::as_str);
                match check {
                    Some(c) if VALIDATION_CHECKS.contains(&c) => {},
                    Some(c) => {
                        return Err(EngineError::configuration(format!(
                            "stage '{stage}' task '{}': unknown validation check '{c}' (known: {})",
                            self.name,
                            VALIDATION_CHECKS.join(", ")
                        )))
                    },
                    None => {
                        return Err(EngineError::configuration(format!(
                            "stage '{stage}' task '{}': VALIDATION task requires a `check` param",
                            self.name
                        )))
                    },
                }
            },
            TaskType::Notify => {
                if self.message.as_deref().unwrap_or("").is_empty() {
                    return Err(missing("message"));
                }
                if self.channel == Some(NotifyChannel::Webhook)
                    && !self.params.contains_key("url")
                {
                    return Err(EngineError::configuration(format!(
                        "stage '{stage}' task '{}': webhook notify requires a `url` param",
                        self.name
                    )));
                }
            },
        }
        Ok(())
    }
}
