//! Restart checkpoints and stage/task selectors

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::EngineError;

/// A restart position inside a single task's input.
///
/// The engine carries a checkpoint to the task named by `--resume-at` and
/// otherwise never looks inside it; how to seek is the plugin's business.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Checkpoint {
    /// Skip input up to and including this 1-based line number
    Line(u64),
    /// Skip input up to and including the record with this identifier
    Id(String),
}

impl Checkpoint {
    pub fn as_line(&self) -> Option<u64> {
        match self {
            Checkpoint::Line(n) => Some(*n),
            Checkpoint::Id(_) => None,
        }
    }

    pub fn as_id(&self) -> Option<&str> {
        match self {
            Checkpoint::Line(_) => None,
            Checkpoint::Id(id) => Some(id),
        }
    }
}

impl FromStr for Checkpoint {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('=') {
            Some(("line", n)) => {
                let n: u64 = n.parse().map_err(|_| {
                    EngineError::configuration(format!(
                        "invalid checkpoint '{s}': line must be a non-negative integer"
                    ))
                })?;
                Ok(Checkpoint::Line(n))
            },
            Some(("id", v)) if !v.is_empty() => Ok(Checkpoint::Id(v.to_string())),
            _ => Err(EngineError::configuration(format!(
                "invalid checkpoint '{s}': expected line=<n> or id=<value>"
            ))),
        }
    }
}

impl fmt::Display for Checkpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Checkpoint::Line(n) => write!(f, "line={n}"),
            Checkpoint::Id(id) => write!(f, "id={id}"),
        }
    }
}

/// A `Stage` or `Stage.Task` reference, as written on the command line
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSelector {
    pub stage: String,
    pub task: Option<String>,
}

impl TaskSelector {
    pub fn stage(stage: impl Into<String>) -> Self {
        Self { stage: stage.into(), task: None }
    }

    pub fn task(stage: impl Into<String>, task: impl Into<String>) -> Self {
        Self { stage: stage.into(), task: Some(task.into()) }
    }

    /// True when this selector names the whole stage
    pub fn is_stage(&self) -> bool {
        self.task.is_none()
    }

    /// Whether the given stage/task pair falls under this selector.
    ///
    /// A bare stage selector covers every task in that stage; a
    /// `Stage.Task` selector covers exactly one.
    pub fn covers(&self, stage: &str, task: &str) -> bool {
        self.stage == stage && self.task.as_deref().map(|t| t == task).unwrap_or(true)
    }
}

impl FromStr for TaskSelector {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || {
            EngineError::configuration(format!(
                "invalid selector '{s}': expected Stage or Stage.Task"
            ))
        };
        match s.split_once('.') {
            None if !s.is_empty() => Ok(TaskSelector::stage(s)),
            Some((stage, task)) if !stage.is_empty() && !task.is_empty() => {
                Ok(TaskSelector::task(stage, task))
            },
            _ => Err(invalid()),
        }
    }
}

impl fmt::Display for TaskSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.task {
            Some(task) => write!(f, "{}.{task}", self.stage),
            None => f.write_str(&self.stage),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_checkpoint_line_parsing() {
        let cp: Checkpoint = "line=1500".parse().unwrap();
        assert_eq!(cp, Checkpoint::Line(1500));
        assert_eq!(cp.as_line(), Some(1500));
        assert_eq!(cp.to_string(), "line=1500");
    }

    #[test]
    fn test_checkpoint_id_parsing() {
        let cp: Checkpoint = "id=rs12345".parse().unwrap();
        assert_eq!(cp.as_id(), Some("rs12345"));
        assert_eq!(cp.to_string(), "id=rs12345");
    }

    #[test]
    fn test_checkpoint_id_with_equals_in_value() {
        let cp: Checkpoint = "id=a=b".parse().unwrap();
        assert_eq!(cp.as_id(), Some("a=b"));
    }

    #[test]
    fn test_checkpoint_rejects_garbage() {
        assert!("line=abc".parse::<Checkpoint>().is_err());
        assert!("offset=3".parse::<Checkpoint>().is_err());
        assert!("id=".parse::<Checkpoint>().is_err());
        assert!("".parse::<Checkpoint>().is_err());
    }

    #[test]
    fn test_selector_stage_only() {
        let sel: TaskSelector = "Load".parse().unwrap();
        assert!(sel.is_stage());
        assert!(sel.covers("Load", "Variants"));
        assert!(sel.covers("Load", "Frequencies"));
        assert!(!sel.covers("Prepare", "Variants"));
    }

    #[test]
    fn test_selector_stage_and_task() {
        let sel: TaskSelector = "Load.Variants".parse().unwrap();
        assert!(!sel.is_stage());
        assert!(sel.covers("Load", "Variants"));
        assert!(!sel.covers("Load", "Frequencies"));
        assert_eq!(sel.to_string(), "Load.Variants");
    }

    #[test]
    fn test_selector_rejects_malformed() {
        assert!("".parse::<TaskSelector>().is_err());
        assert!(".Task".parse::<TaskSelector>().is_err());
        assert!("Stage.".parse::<TaskSelector>().is_err());
    }
}
