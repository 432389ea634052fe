//! Execution plan computation
//!
//! Planning is pure: the pipeline definition plus CLI filters map to a plan
//! listing every task with a run/skip decision and the reason for each
//! exclusion. `--plan-only` prints this plan; a real run executes exactly
//! what the plan says, so the rehearsal and the run can never disagree.

use serde::Serialize;

use crate::checkpoint::{Checkpoint, TaskSelector};
use crate::config::{ParallelMode, PipelineConfig, StageConfig, TaskConfig, TaskType};
use crate::error::{EngineError, Result};
use crate::interpolate::{Interpolator, Scope};

/// CLI-level selection applied on top of the pipeline definition
#[derive(Debug, Clone, Default)]
pub struct RunFilters {
    /// Run only tasks covered by one of these selectors (empty = all)
    pub only: Vec<TaskSelector>,
    /// Exclude tasks covered by one of these selectors; wins over `only`
    pub skip: Vec<TaskSelector>,
    /// Skip everything strictly before this point
    pub resume_at: Option<TaskSelector>,
    /// Restart position inside the resume target task
    pub checkpoint: Option<Checkpoint>,
}

impl RunFilters {
    pub fn none() -> Self {
        Self::default()
    }
}

/// One task with its run/skip decision
#[derive(Debug, Clone, Serialize)]
pub struct PlannedTask {
    pub config: TaskConfig,
    pub will_run: bool,
    /// Why the task is excluded, absent when it runs
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Present only on the resume target
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checkpoint: Option<Checkpoint>,
}

/// One stage with its dispatch settings resolved
#[derive(Debug, Clone, Serialize)]
pub struct PlannedStage {
    pub name: String,
    pub parallel_mode: ParallelMode,
    pub max_concurrency: usize,
    pub tasks: Vec<PlannedTask>,
}

impl PlannedStage {
    pub fn runnable(&self) -> impl Iterator<Item = &PlannedTask> {
        self.tasks.iter().filter(|t| t.will_run)
    }
}

/// The full decision table for a run
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionPlan {
    pub stages: Vec<PlannedStage>,
}

impl ExecutionPlan {
    pub fn runnable_count(&self) -> usize {
        self.stages.iter().map(|s| s.runnable().count()).sum()
    }

    /// Human-readable plan listing, one line per stage and task
    pub fn render(&self) -> String {
        self.render_lines(None)
    }

    /// [`render`](Self::render) plus the effective parameters of every task
    /// that will run, resolved best-effort against `scope`
    pub fn render_with_params(&self, interpolator: &Interpolator, scope: &Scope) -> String {
        self.render_lines(Some((interpolator, scope)))
    }

    fn render_lines(&self, resolve: Option<(&Interpolator, &Scope)>) -> String {
        let mut out = String::new();
        for stage in &self.stages {
            match stage.parallel_mode {
                ParallelMode::None => {
                    out.push_str(&format!("stage {} [{}]\n", stage.name, stage.parallel_mode));
                },
                _ => {
                    out.push_str(&format!(
                        "stage {} [{}, max {}]\n",
                        stage.name, stage.parallel_mode, stage.max_concurrency
                    ));
                },
            }
            for task in &stage.tasks {
                let kind = match (&task.config.task_type, &task.config.plugin) {
                    (TaskType::Plugin, Some(plugin)) => format!("PLUGIN {plugin}"),
                    (other, _) => other.to_string(),
                };
                let decision = match (&task.will_run, &task.reason) {
                    (true, _) => "[run]".to_string(),
                    (false, Some(reason)) => format!("[skip: {reason}]"),
                    (false, None) => "[skip]".to_string(),
                };
                out.push_str(&format!("  {:<24} {:<24} {decision}", task.config.name, kind));
                if let Some(cp) = &task.checkpoint {
                    out.push_str(&format!(" resume from {cp}"));
                }
                out.push('\n');
                if let Some((interpolator, scope)) = resolve {
                    if task.will_run && !task.config.params.is_empty() {
                        let params = interpolator.preview_params(&task.config.params, scope);
                        out.push_str(&format!(
                            "    params {}\n",
                            serde_json::Value::Object(params)
                        ));
                    }
                }
            }
        }
        out.push_str(&format!("{} task(s) will run\n", self.runnable_count()));
        out
    }
}

/// Compute the plan for a run, validating every filter first
pub fn build_plan(config: &PipelineConfig, filters: &RunFilters) -> Result<ExecutionPlan> {
    validate_filters(config, filters)?;

    let mut resume_reached = filters.resume_at.is_none();
    let mut stages = Vec::with_capacity(config.stages.len());

    for stage in &config.stages {
        let mut tasks = Vec::with_capacity(stage.tasks.len());
        for task in &stage.tasks {
            if let Some(resume) = &filters.resume_at {
                let at_point = match &resume.task {
                    None => resume.stage == stage.name,
                    Some(t) => resume.stage == stage.name && *t == task.name,
                };
                if at_point {
                    resume_reached = true;
                }
            }

            let reason = exclusion_reason(stage, task, filters, resume_reached);
            let is_resume_target = filters
                .resume_at
                .as_ref()
                .map(|r| !r.is_stage() && r.covers(&stage.name, &task.name))
                .unwrap_or(false);

            tasks.push(PlannedTask {
                config: task.clone(),
                will_run: reason.is_none(),
                checkpoint: if is_resume_target && reason.is_none() {
                    filters.checkpoint.clone()
                } else {
                    None
                },
                reason,
            });
        }

        stages.push(PlannedStage {
            name: stage.name.clone(),
            parallel_mode: stage.parallel_mode,
            max_concurrency: stage.effective_concurrency(),
            tasks,
        });
    }

    Ok(ExecutionPlan { stages })
}

fn exclusion_reason(
    stage: &StageConfig,
    task: &TaskConfig,
    filters: &RunFilters,
    resume_reached: bool,
) -> Option<String> {
    if stage.deprecated {
        return Some("stage deprecated".to_string());
    }
    if stage.skip {
        return Some("stage skip flag".to_string());
    }
    if task.deprecated {
        return Some("deprecated".to_string());
    }
    if task.skip {
        return Some("skip flag".to_string());
    }
    if filters.skip.iter().any(|s| s.covers(&stage.name, &task.name)) {
        return Some("--skip".to_string());
    }
    if !filters.only.is_empty() && !filters.only.iter().any(|s| s.covers(&stage.name, &task.name))
    {
        return Some("not selected by --only".to_string());
    }
    if !resume_reached {
        return Some("before resume point".to_string());
    }
    None
}

fn validate_filters(config: &PipelineConfig, filters: &RunFilters) -> Result<()> {
    for (flag, selectors) in [("--only", &filters.only), ("--skip", &filters.skip)] {
        for selector in selectors {
            resolve_selector(config, selector, flag)?;
        }
    }

    if let Some(resume) = &filters.resume_at {
        let (stage, task) = resolve_selector(config, resume, "--resume-at")?;

        let excluded_by_flags = match task {
            Some(task) => stage.excluded() || task.excluded(),
            None => stage.excluded(),
        };
        if excluded_by_flags {
            return Err(EngineError::configuration(format!(
                "cannot resume at '{resume}': it is marked skip or deprecated"
            )));
        }

        let target_covered = |selectors: &[TaskSelector]| {
            selectors.iter().any(|s| match &resume.task {
                Some(task) => s.covers(&resume.stage, task),
                None => s.stage == resume.stage,
            })
        };
        if target_covered(&filters.skip) {
            return Err(EngineError::configuration(format!(
                "cannot resume at '{resume}': it is excluded by --skip"
            )));
        }
        if !filters.only.is_empty() && !target_covered(&filters.only) {
            return Err(EngineError::configuration(format!(
                "cannot resume at '{resume}': it is not selected by --only"
            )));
        }

        if filters.checkpoint.is_some() && resume.is_stage() {
            return Err(EngineError::configuration(format!(
                "a checkpoint needs a Stage.Task resume target, got '{resume}'"
            )));
        }
    } else if filters.checkpoint.is_some() {
        return Err(EngineError::configuration(
            "a checkpoint requires --resume-at".to_string(),
        ));
    }

    Ok(())
}

fn resolve_selector<'c>(
    config: &'c PipelineConfig,
    selector: &TaskSelector,
    flag: &str,
) -> Result<(&'c StageConfig, Option<&'c TaskConfig>)> {
    let stage = config.find_stage(&selector.stage).ok_or_else(|| {
        EngineError::configuration(format!("{flag}: unknown stage '{}'", selector.stage))
    })?;
    let task = match &selector.task {
        None => None,
        Some(name) => Some(stage.find_task(name).ok_or_else(|| {
            EngineError::configuration(format!(
                "{flag}: unknown task '{name}' in stage '{}'",
                selector.stage
            ))
        })?),
    };
    Ok((stage, task))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::config::ParamMap;
    use serde_json::json;

    fn notify(name: &str) -> TaskConfig {
        TaskConfig {
            name: name.to_string(),
            task_type: TaskType::Notify,
            plugin: None,
            params: ParamMap::new(),
            skip: false,
            deprecated: false,
            command: None,
            path: None,
            action: None,
            channel: None,
            message: Some(format!("from {name}")),
            comment: None,
        }
    }

    fn stage(name: &str, tasks: Vec<TaskConfig>) -> StageConfig {
        StageConfig {
            name: name.to_string(),
            parallel_mode: ParallelMode::None,
            max_concurrency: None,
            tasks,
            skip: false,
            deprecated: false,
            comment: None,
        }
    }

    fn pipeline() -> PipelineConfig {
        PipelineConfig {
            params: ParamMap::new(),
            stages: vec![
                stage("Prepare", vec![notify("Fetch"), notify("Unpack")]),
                stage("Load", vec![notify("Variants"), notify("Frequencies")]),
                stage("Verify", vec![notify("Counts")]),
            ],
            comment: None,
        }
    }

    fn decisions(plan: &ExecutionPlan) -> Vec<(String, bool)> {
        plan.stages
            .iter()
            .flat_map(|s| {
                s.tasks
                    .iter()
                    .map(move |t| (format!("{}.{}", s.name, t.config.name), t.will_run))
            })
            .collect()
    }

    #[test]
    fn test_no_filters_runs_everything() {
        let plan = build_plan(&pipeline(), &RunFilters::none()).unwrap();
        assert_eq!(plan.runnable_count(), 5);
        assert!(plan.stages.iter().all(|s| s.tasks.iter().all(|t| t.reason.is_none())));
    }

    #[test]
    fn test_only_stage_selects_its_tasks() {
        let filters = RunFilters {
            only: vec!["Load".parse().unwrap()],
            ..RunFilters::none()
        };
        let plan = build_plan(&pipeline(), &filters).unwrap();
        let decisions = decisions(&plan);
        assert!(decisions.contains(&("Load.Variants".to_string(), true)));
        assert!(decisions.contains(&("Load.Frequencies".to_string(), true)));
        assert!(decisions.contains(&("Prepare.Fetch".to_string(), false)));
        assert!(decisions.contains(&("Verify.Counts".to_string(), false)));
    }

    #[test]
    fn test_skip_composes_with_only() {
        let filters = RunFilters {
            only: vec!["Load".parse().unwrap()],
            skip: vec!["Load.Frequencies".parse().unwrap()],
            ..RunFilters::none()
        };
        let plan = build_plan(&pipeline(), &filters).unwrap();
        assert_eq!(plan.runnable_count(), 1);
        let skipped = &plan.stages[1].tasks[1];
        assert_eq!(skipped.reason.as_deref(), Some("--skip"));
    }

    #[test]
    fn test_resume_at_skips_everything_before() {
        let filters = RunFilters {
            resume_at: Some("Load.Frequencies".parse().unwrap()),
            ..RunFilters::none()
        };
        let plan = build_plan(&pipeline(), &filters).unwrap();
        let decisions = decisions(&plan);
        assert!(decisions.contains(&("Prepare.Fetch".to_string(), false)));
        assert!(decisions.contains(&("Load.Variants".to_string(), false)));
        assert!(decisions.contains(&("Load.Frequencies".to_string(), true)));
        // resume does not imply --only: later work still runs
        assert!(decisions.contains(&("Verify.Counts".to_string(), true)));

        let before = &plan.stages[0].tasks[0];
        assert_eq!(before.reason.as_deref(), Some("before resume point"));
    }

    #[test]
    fn test_resume_at_whole_stage() {
        let filters = RunFilters {
            resume_at: Some("Load".parse().unwrap()),
            ..RunFilters::none()
        };
        let plan = build_plan(&pipeline(), &filters).unwrap();
        let decisions = decisions(&plan);
        assert!(decisions.contains(&("Prepare.Unpack".to_string(), false)));
        assert!(decisions.contains(&("Load.Variants".to_string(), true)));
    }

    #[test]
    fn test_checkpoint_attaches_only_to_resume_target() {
        let filters = RunFilters {
            resume_at: Some("Load.Variants".parse().unwrap()),
            checkpoint: Some(Checkpoint::Line(1500)),
            ..RunFilters::none()
        };
        let plan = build_plan(&pipeline(), &filters).unwrap();
        let with_checkpoint: Vec<_> = plan
            .stages
            .iter()
            .flat_map(|s| s.tasks.iter())
            .filter(|t| t.checkpoint.is_some())
            .collect();
        assert_eq!(with_checkpoint.len(), 1);
        assert_eq!(with_checkpoint[0].config.name, "Variants");
    }

    #[test]
    fn test_checkpoint_requires_task_level_resume() {
        let filters = RunFilters {
            resume_at: Some("Load".parse().unwrap()),
            checkpoint: Some(Checkpoint::Line(10)),
            ..RunFilters::none()
        };
        let err = build_plan(&pipeline(), &filters).unwrap_err();
        assert!(err.to_string().contains("Stage.Task"));

        let orphan = RunFilters {
            checkpoint: Some(Checkpoint::Line(10)),
            ..RunFilters::none()
        };
        assert!(build_plan(&pipeline(), &orphan).is_err());
    }

    #[test]
    fn test_unknown_selector_rejected() {
        let filters = RunFilters {
            only: vec!["Nowhere".parse().unwrap()],
            ..RunFilters::none()
        };
        let err = build_plan(&pipeline(), &filters).unwrap_err();
        assert!(err.to_string().contains("--only"));
        assert!(err.to_string().contains("Nowhere"));

        let filters = RunFilters {
            skip: vec!["Load.Ghost".parse().unwrap()],
            ..RunFilters::none()
        };
        let err = build_plan(&pipeline(), &filters).unwrap_err();
        assert!(err.to_string().contains("Ghost"));
    }

    #[test]
    fn test_resume_target_must_be_runnable() {
        let mut config = pipeline();
        config.stages[1].tasks[0].deprecated = true;

        let filters = RunFilters {
            resume_at: Some("Load.Variants".parse().unwrap()),
            ..RunFilters::none()
        };
        let err = build_plan(&config, &filters).unwrap_err();
        assert!(err.to_string().contains("skip or deprecated"));

        let filters = RunFilters {
            resume_at: Some("Load.Frequencies".parse().unwrap()),
            skip: vec!["Load".parse().unwrap()],
            ..RunFilters::none()
        };
        let err = build_plan(&pipeline(), &filters).unwrap_err();
        assert!(err.to_string().contains("--skip"));
    }

    #[test]
    fn test_flag_annotations_are_distinct() {
        let mut config = pipeline();
        config.stages[0].tasks[0].skip = true;
        config.stages[0].tasks[1].deprecated = true;
        config.stages[2].skip = true;

        let plan = build_plan(&config, &RunFilters::none()).unwrap();
        assert_eq!(plan.stages[0].tasks[0].reason.as_deref(), Some("skip flag"));
        assert_eq!(plan.stages[0].tasks[1].reason.as_deref(), Some("deprecated"));
        assert_eq!(plan.stages[2].tasks[0].reason.as_deref(), Some("stage skip flag"));
    }

    #[test]
    fn test_render_mentions_decisions() {
        let filters = RunFilters {
            skip: vec!["Verify".parse().unwrap()],
            ..RunFilters::none()
        };
        let plan = build_plan(&pipeline(), &filters).unwrap();
        let rendered = plan.render();
        assert!(rendered.contains("stage Load [NONE]"));
        assert!(rendered.contains("[skip: --skip]"));
        assert!(rendered.contains("4 task(s) will run"));
    }

    #[test]
    fn test_render_with_params_shows_effective_values() {
        let mut config = pipeline();
        config.stages[1].tasks[0].params =
            json!({"file": "${dir}/in.jsonl", "tag": "${run_id}"}).as_object().unwrap().clone();

        let plan = build_plan(&config, &RunFilters::none()).unwrap();
        let mut scope = Scope::new();
        scope.set("dir", json!("/data"));

        let rendered = plan.render_with_params(&Interpolator::new().unwrap(), &scope);
        assert!(rendered.contains(r#"params {"file":"/data/in.jsonl","tag":"${run_id}"}"#));
        assert!(!plan.render().contains("params"));
    }
}
