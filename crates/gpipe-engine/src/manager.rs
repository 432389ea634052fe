//! Pipeline manager
//!
//! Drives a plan stage by stage. Stages are barriers: every task of a stage
//! settles before the next stage starts, and a failed stage aborts the run
//! with everything after it marked as never started. Within a stage the
//! dispatch mode decides sequencing; a failure never interrupts tasks that
//! are already in flight, it only prevents new ones from starting.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use serde_json::json;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::checkpoint::{Checkpoint, TaskSelector};
use crate::commit::EtlMode;
use crate::config::{ParallelMode, ParamMap, PipelineConfig};
use crate::error::{EngineError, Result};
use crate::interpolate::{Interpolator, Scope};
use crate::plan::{build_plan, ExecutionPlan, PlannedStage, PlannedTask, RunFilters};
use crate::registry::PluginRegistry;
use crate::session::SessionProvider;
use crate::status::{ExecutionReport, RunState, TaskCounters, TaskReport, TaskState};
use crate::tasks::{execute_task, TaskEnv};

/// Per-run settings resolved by the caller
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub mode: EtlMode,
    /// Global commit cadence override
    pub commit_after: Option<u64>,
    /// Highest-precedence scope layer, from `--param`
    pub cli_params: ParamMap,
    pub filters: RunFilters,
    /// Definition file path, required for PROCESS stages so workers can
    /// re-read it
    pub config_path: Option<PathBuf>,
}

pub struct PipelineManager {
    config: PipelineConfig,
    registry: Arc<PluginRegistry>,
    sessions: Arc<dyn SessionProvider>,
    options: RunOptions,
}

impl PipelineManager {
    pub fn new(
        config: PipelineConfig,
        registry: Arc<PluginRegistry>,
        sessions: Arc<dyn SessionProvider>,
        options: RunOptions,
    ) -> Self {
        Self { config, registry, sessions, options }
    }

    /// Compute the plan without executing anything
    pub fn plan(&self) -> Result<ExecutionPlan> {
        build_plan(&self.config, &self.options.filters)
    }

    /// Render the plan with effective task parameters.
    ///
    /// Resolution uses everything known before a run exists, so pipeline
    /// params and `${mode}` substitute while `${run_id}` stays verbatim.
    pub fn render_plan(&self) -> Result<String> {
        let plan = self.plan()?;
        let mut seeds = ParamMap::new();
        seeds.insert("mode".to_string(), json!(self.options.mode.as_str()));
        Ok(plan.render_with_params(&Interpolator::new()?, &self.scope(&seeds)))
    }

    /// Execute the full pipeline and report every task outcome
    pub async fn run(&self) -> Result<ExecutionReport> {
        let plan = self.plan()?;
        let run_id = Uuid::new_v4();
        let env = self.build_env(run_id)?;

        let mut report = ExecutionReport::new(run_id, self.options.mode);
        report.state = RunState::Running;
        info!(
            "run {} starting in {} mode: {} of {} task(s) will run",
            run_id,
            self.options.mode,
            plan.runnable_count(),
            plan.stages.iter().map(|s| s.tasks.len()).sum::<usize>()
        );

        let mut aborted_after: Option<usize> = None;
        for (index, stage) in plan.stages.iter().enumerate() {
            info!("stage '{}' starting [{}]", stage.name, stage.parallel_mode);

            let stage_reports = match stage.parallel_mode {
                ParallelMode::None => self.run_stage_sequential(&env, stage).await,
                ParallelMode::Thread => self.run_stage_threaded(&env, stage).await,
                ParallelMode::Process => self.run_stage_process(&env, stage).await?,
            };

            let stage_failed = stage_reports.iter().any(|r| r.state == TaskState::Failed);
            for task_report in stage_reports {
                report.push(task_report);
            }

            if stage_failed {
                warn!("stage '{}' failed; aborting run", stage.name);
                aborted_after = Some(index + 1);
                break;
            }
            info!("stage '{}' complete", stage.name);
        }

        match aborted_after {
            Some(from) => {
                for stage in &plan.stages[from..] {
                    for task in &stage.tasks {
                        report.push(match (&task.will_run, &task.reason) {
                            (true, _) => TaskReport::not_started(
                                stage.name.clone(),
                                task.config.name.clone(),
                                "run aborted",
                            ),
                            (false, reason) => TaskReport::skipped(
                                stage.name.clone(),
                                task.config.name.clone(),
                                reason.clone().unwrap_or_else(|| "skipped".to_string()),
                            ),
                        });
                    }
                }
                report.finish(RunState::Aborted);
            },
            None => report.finish(RunState::Completed),
        }

        info!(
            "run {} finished: {} ({} records written)",
            run_id,
            report.state,
            report.records_written()
        );
        Ok(report)
    }

    /// Child-process entry: execute exactly one task of the definition.
    ///
    /// Used by PROCESS stages, whose parent re-invokes the binary per task.
    pub async fn run_worker(
        &self,
        selector: &TaskSelector,
        checkpoint: Option<Checkpoint>,
    ) -> Result<ExecutionReport> {
        let task_name = selector.task.as_deref().ok_or_else(|| {
            EngineError::configuration(format!(
                "worker task must name Stage.Task, got '{selector}'"
            ))
        })?;
        let stage = self.config.find_stage(&selector.stage).ok_or_else(|| {
            EngineError::configuration(format!("worker task: unknown stage '{}'", selector.stage))
        })?;
        let task = stage.find_task(task_name).ok_or_else(|| {
            EngineError::configuration(format!(
                "worker task: unknown task '{task_name}' in stage '{}'",
                selector.stage
            ))
        })?;

        let run_id = Uuid::new_v4();
        let env = self.build_env(run_id)?;
        let mut report = ExecutionReport::new(run_id, self.options.mode);
        report.state = RunState::Running;

        let planned =
            PlannedTask { config: task.clone(), will_run: true, reason: None, checkpoint };
        let task_report = execute_task(env, stage.name.clone(), planned).await;
        let succeeded = task_report.state == TaskState::Success;
        report.push(task_report);
        report.finish(if succeeded { RunState::Completed } else { RunState::Aborted });
        Ok(report)
    }

    // engine seeds < pipeline params < CLI overrides
    fn scope(&self, seeds: &ParamMap) -> Scope {
        Scope::new()
            .with_layer(seeds)
            .with_layer(&self.config.params)
            .with_layer(&self.options.cli_params)
    }

    fn build_env(&self, run_id: Uuid) -> Result<TaskEnv> {
        let mut seeds = ParamMap::new();
        seeds.insert("run_id".to_string(), json!(run_id.to_string()));
        seeds.insert("mode".to_string(), json!(self.options.mode.as_str()));

        Ok(TaskEnv {
            registry: self.registry.clone(),
            sessions: self.sessions.clone(),
            http: reqwest::Client::new(),
            interpolator: Interpolator::new()?,
            scope: self.scope(&seeds),
            run_id,
            mode: self.options.mode,
            commit_after: self.options.commit_after,
        })
    }

    async fn run_stage_sequential(&self, env: &TaskEnv, stage: &PlannedStage) -> Vec<TaskReport> {
        let mut reports = Vec::with_capacity(stage.tasks.len());
        let mut failed = false;

        for task in &stage.tasks {
            if !task.will_run {
                reports.push(skip_report(&stage.name, task));
                continue;
            }
            if failed {
                reports.push(TaskReport::not_started(
                    stage.name.clone(),
                    task.config.name.clone(),
                    "earlier task in stage failed",
                ));
                continue;
            }
            let report = execute_task(env.clone(), stage.name.clone(), task.clone()).await;
            failed = failed || report.state == TaskState::Failed;
            reports.push(report);
        }
        reports
    }

    async fn run_stage_threaded(&self, env: &TaskEnv, stage: &PlannedStage) -> Vec<TaskReport> {
        let mut reports = Vec::with_capacity(stage.tasks.len());
        let semaphore = Arc::new(Semaphore::new(stage.max_concurrency));
        let failure = Arc::new(AtomicBool::new(false));
        let mut join_set = JoinSet::new();

        for task in &stage.tasks {
            if !task.will_run {
                reports.push(skip_report(&stage.name, task));
                continue;
            }
            let env = env.clone();
            let stage_name = stage.name.clone();
            let task = task.clone();
            let semaphore = semaphore.clone();
            let failure = failure.clone();

            join_set.spawn(async move {
                let name = task.config.name.clone();
                match semaphore.acquire_owned().await {
                    Err(_) => TaskReport::not_started(stage_name, name, "worker pool closed"),
                    Ok(_permit) => {
                        // a failure elsewhere stops new starts, never in-flight work
                        if failure.load(Ordering::SeqCst) {
                            return TaskReport::not_started(
                                stage_name,
                                name,
                                "earlier task in stage failed",
                            );
                        }
                        let report = execute_task(env, stage_name, task).await;
                        if report.state == TaskState::Failed {
                            failure.store(true, Ordering::SeqCst);
                        }
                        report
                    },
                }
            });
        }

        let mut finished = Vec::new();
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok(report) => finished.push(report),
                Err(e) => {
                    error!("stage '{}' worker panicked: {e}", stage.name);
                    finished.push(TaskReport::failed(
                        stage.name.clone(),
                        "unknown",
                        format!("worker panicked: {e}"),
                        TaskCounters::default(),
                        0,
                    ));
                },
            }
        }
        sort_into_plan_order(stage, &mut finished);
        reports.extend(finished);
        reports
    }

    async fn run_stage_process(
        &self,
        env: &TaskEnv,
        stage: &PlannedStage,
    ) -> Result<Vec<TaskReport>> {
        let config_path = self.options.config_path.clone().ok_or_else(|| {
            EngineError::configuration(format!(
                "stage '{}': PROCESS dispatch needs the pipeline definition path",
                stage.name
            ))
        })?;
        let exe = std::env::current_exe().map_err(|e| {
            EngineError::configuration(format!("cannot locate worker executable: {e}"))
        })?;

        let mut reports = Vec::with_capacity(stage.tasks.len());
        let semaphore = Arc::new(Semaphore::new(stage.max_concurrency));
        let failure = Arc::new(AtomicBool::new(false));
        let mut join_set = JoinSet::new();

        for task in &stage.tasks {
            if !task.will_run {
                reports.push(skip_report(&stage.name, task));
                continue;
            }
            let worker = WorkerCommand {
                exe: exe.clone(),
                config_path: config_path.clone(),
                mode: env.mode,
                commit_after: self.options.commit_after,
                cli_params: self.options.cli_params.clone(),
            };
            let stage_name = stage.name.clone();
            let task = task.clone();
            let semaphore = semaphore.clone();
            let failure = failure.clone();

            join_set.spawn(async move {
                let name = task.config.name.clone();
                match semaphore.acquire_owned().await {
                    Err(_) => TaskReport::not_started(stage_name, name, "worker pool closed"),
                    Ok(_permit) => {
                        if failure.load(Ordering::SeqCst) {
                            return TaskReport::not_started(
                                stage_name,
                                name,
                                "earlier task in stage failed",
                            );
                        }
                        let report = worker.run(stage_name, task).await;
                        if report.state == TaskState::Failed {
                            failure.store(true, Ordering::SeqCst);
                        }
                        report
                    },
                }
            });
        }

        let mut finished = Vec::new();
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok(report) => finished.push(report),
                Err(e) => {
                    error!("stage '{}' worker panicked: {e}", stage.name);
                    finished.push(TaskReport::failed(
                        stage.name.clone(),
                        "unknown",
                        format!("worker panicked: {e}"),
                        TaskCounters::default(),
                        0,
                    ));
                },
            }
        }
        sort_into_plan_order(stage, &mut finished);
        reports.extend(finished);
        Ok(reports)
    }
}

fn skip_report(stage: &str, task: &PlannedTask) -> TaskReport {
    TaskReport::skipped(
        stage,
        task.config.name.clone(),
        task.reason.clone().unwrap_or_else(|| "skipped".to_string()),
    )
}

fn sort_into_plan_order(stage: &PlannedStage, reports: &mut [TaskReport]) {
    let order: HashMap<&str, usize> = stage
        .tasks
        .iter()
        .enumerate()
        .map(|(i, t)| (t.config.name.as_str(), i))
        .collect();
    reports.sort_by_key(|r| order.get(r.task.as_str()).copied().unwrap_or(usize::MAX));
}

/// Everything needed to re-invoke the binary for one task
struct WorkerCommand {
    exe: PathBuf,
    config_path: PathBuf,
    mode: EtlMode,
    commit_after: Option<u64>,
    cli_params: ParamMap,
}

impl WorkerCommand {
    /// Spawn the child, inheriting stdio so its log lines surface inline
    async fn run(self, stage: String, task: PlannedTask) -> TaskReport {
        let name = task.config.name.clone();
        let selector = format!("{stage}.{name}");
        let started = Instant::now();

        let mut command = std::process::Command::new(&self.exe);
        command
            .arg(&self.config_path)
            .arg("--mode")
            .arg(self.mode.as_str())
            .arg("--worker-task")
            .arg(&selector);
        if let Some(checkpoint) = &task.checkpoint {
            command.arg("--worker-checkpoint").arg(checkpoint.to_string());
        }
        if let Some(commit_after) = self.commit_after {
            command.arg("--commit-after").arg(commit_after.to_string());
        }
        if !self.cli_params.is_empty() {
            command.arg("--param").arg(serde_json::Value::Object(self.cli_params).to_string());
        }

        info!("spawning worker for {selector}");
        let status = tokio::task::spawn_blocking(move || command.status()).await;
        let duration_ms = started.elapsed().as_millis() as u64;

        match status {
            Ok(Ok(status)) if status.success() => {
                TaskReport::success(stage, name, TaskCounters::default(), duration_ms)
            },
            Ok(Ok(status)) => TaskReport::failed(
                stage,
                name,
                format!("worker for {selector} exited with {status}"),
                TaskCounters::default(),
                duration_ms,
            ),
            Ok(Err(e)) => TaskReport::failed(
                stage,
                name,
                format!("cannot spawn worker for {selector}: {e}"),
                TaskCounters::default(),
                duration_ms,
            ),
            Err(e) => TaskReport::failed(
                stage,
                name,
                format!("worker join failed for {selector}: {e}"),
                TaskCounters::default(),
                duration_ms,
            ),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::config::{StageConfig, TaskConfig, TaskType};
    use crate::test_helpers::{base_task, register_test_plugins, SharedMemoryProvider};
    use serde_json::json;

    fn notify(name: &str) -> TaskConfig {
        let mut task = base_task(name, TaskType::Notify);
        task.message = Some(format!("from {name}"));
        task
    }

    fn shell(name: &str, command: &str) -> TaskConfig {
        let mut task = base_task(name, TaskType::Shell);
        task.command = Some(command.to_string());
        task
    }

    fn stage(name: &str, mode: ParallelMode, tasks: Vec<TaskConfig>) -> StageConfig {
        StageConfig {
            name: name.to_string(),
            parallel_mode: mode,
            max_concurrency: match mode {
                ParallelMode::None => None,
                _ => Some(1),
            },
            tasks,
            skip: false,
            deprecated: false,
            comment: None,
        }
    }

    fn manager(stages: Vec<StageConfig>, options: RunOptions) -> PipelineManager {
        let config = PipelineConfig { params: ParamMap::new(), stages, comment: None };
        let mut registry = PluginRegistry::new();
        register_test_plugins(&mut registry);
        PipelineManager::new(
            config,
            Arc::new(registry),
            Arc::new(SharedMemoryProvider::new()),
            options,
        )
    }

    fn states(report: &ExecutionReport) -> Vec<(String, TaskState)> {
        report
            .tasks
            .iter()
            .map(|t| (format!("{}.{}", t.stage, t.task), t.state))
            .collect()
    }

    #[tokio::test]
    async fn test_completed_run_in_order() {
        let manager = manager(
            vec![
                stage("Prepare", ParallelMode::None, vec![notify("A"), notify("B")]),
                stage("Load", ParallelMode::None, vec![notify("C")]),
            ],
            RunOptions { mode: EtlMode::NonCommit, ..RunOptions::default() },
        );

        let report = manager.run().await.unwrap();
        assert!(report.succeeded());
        assert_eq!(report.state, RunState::Completed);
        assert_eq!(
            states(&report),
            vec![
                ("Prepare.A".to_string(), TaskState::Success),
                ("Prepare.B".to_string(), TaskState::Success),
                ("Load.C".to_string(), TaskState::Success),
            ]
        );
    }

    #[tokio::test]
    async fn test_sequential_stage_stops_at_first_failure() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("late");
        let manager = manager(
            vec![stage(
                "Only",
                ParallelMode::None,
                vec![
                    shell("Bad", "exit 2"),
                    shell("Late", &format!("touch {}", marker.display())),
                ],
            )],
            RunOptions { mode: EtlMode::NonCommit, ..RunOptions::default() },
        );

        let report = manager.run().await.unwrap();
        assert_eq!(report.state, RunState::Aborted);
        assert_eq!(report.tasks[0].state, TaskState::Failed);
        assert_eq!(report.tasks[1].state, TaskState::NotStarted);
        assert_eq!(report.tasks[1].reason.as_deref(), Some("earlier task in stage failed"));
        assert!(!marker.exists());
    }

    #[tokio::test]
    async fn test_failed_stage_aborts_later_stages() {
        let manager = manager(
            vec![
                stage("First", ParallelMode::None, vec![shell("Bad", "exit 1")]),
                stage("Second", ParallelMode::None, vec![notify("Never")]),
            ],
            RunOptions { mode: EtlMode::NonCommit, ..RunOptions::default() },
        );

        let report = manager.run().await.unwrap();
        assert_eq!(report.state, RunState::Aborted);
        let never = &report.tasks[1];
        assert_eq!(never.task, "Never");
        assert_eq!(never.state, TaskState::NotStarted);
        assert_eq!(never.reason.as_deref(), Some("run aborted"));
    }

    #[tokio::test]
    async fn test_threaded_stage_completes() {
        let mut thread_stage =
            stage("Fan", ParallelMode::Thread, vec![notify("A"), notify("B"), notify("C")]);
        thread_stage.max_concurrency = Some(3);
        let manager = manager(
            vec![thread_stage],
            RunOptions { mode: EtlMode::NonCommit, ..RunOptions::default() },
        );

        let report = manager.run().await.unwrap();
        assert!(report.succeeded());
        // back in declared order regardless of join order
        assert_eq!(
            report.tasks.iter().map(|t| t.task.clone()).collect::<Vec<_>>(),
            vec!["A", "B", "C"]
        );
    }

    #[tokio::test]
    async fn test_threaded_failure_blocks_new_starts() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("late");
        // max_concurrency 1 serializes the queue, so the failure lands
        // before the second task gets a permit
        let manager = manager(
            vec![stage(
                "Fan",
                ParallelMode::Thread,
                vec![
                    shell("Bad", "exit 3"),
                    shell("Late", &format!("touch {}", marker.display())),
                ],
            )],
            RunOptions { mode: EtlMode::NonCommit, ..RunOptions::default() },
        );

        let report = manager.run().await.unwrap();
        assert_eq!(report.state, RunState::Aborted);
        assert_eq!(report.tasks[0].state, TaskState::Failed);
        assert_eq!(report.tasks[1].state, TaskState::NotStarted);
        assert!(!marker.exists());
    }

    #[tokio::test]
    async fn test_skipped_tasks_reported_even_after_abort() {
        let mut second = stage("Second", ParallelMode::None, vec![notify("Flagged")]);
        second.tasks[0].skip = true;
        let manager = manager(
            vec![
                stage("First", ParallelMode::None, vec![shell("Bad", "false")]),
                second,
            ],
            RunOptions { mode: EtlMode::NonCommit, ..RunOptions::default() },
        );

        let report = manager.run().await.unwrap();
        assert_eq!(report.tasks[1].state, TaskState::Skipped);
        assert_eq!(report.tasks[1].reason.as_deref(), Some("skip flag"));
    }

    #[tokio::test]
    async fn test_process_stage_requires_config_path() {
        let manager = manager(
            vec![stage("Fan", ParallelMode::Process, vec![notify("A")])],
            RunOptions { mode: EtlMode::NonCommit, ..RunOptions::default() },
        );

        let err = manager.run().await.unwrap_err();
        assert!(err.to_string().contains("definition path"));
    }

    #[tokio::test]
    async fn test_plugin_counters_surface_in_run_report() {
        let mut task = base_task("Load", TaskType::Plugin);
        task.plugin = Some("counting-loader".to_string());
        task.params = json!({"batches": 3, "batch_size": 2})
            .as_object()
            .cloned()
            .unwrap_or_default();

        let manager = manager(
            vec![stage("Load", ParallelMode::None, vec![task])],
            RunOptions { mode: EtlMode::NonCommit, ..RunOptions::default() },
        );

        let report = manager.run().await.unwrap();
        assert!(report.succeeded());
        assert_eq!(report.records_written(), 6);
    }

    #[tokio::test]
    async fn test_run_worker_single_task() {
        let manager = manager(
            vec![stage("Load", ParallelMode::None, vec![notify("A"), notify("B")])],
            RunOptions { mode: EtlMode::NonCommit, ..RunOptions::default() },
        );

        let selector: TaskSelector = "Load.B".parse().unwrap();
        let report = manager.run_worker(&selector, None).await.unwrap();
        assert!(report.succeeded());
        assert_eq!(report.tasks.len(), 1);
        assert_eq!(report.tasks[0].task, "B");

        let missing: TaskSelector = "Load.Ghost".parse().unwrap();
        assert!(manager.run_worker(&missing, None).await.is_err());

        let stage_only: TaskSelector = "Load".parse().unwrap();
        assert!(manager.run_worker(&stage_only, None).await.is_err());
    }

    #[tokio::test]
    async fn test_run_with_filters_skips_and_annotates() {
        let manager = manager(
            vec![
                stage("Prepare", ParallelMode::None, vec![notify("A")]),
                stage("Load", ParallelMode::None, vec![notify("B"), notify("C")]),
            ],
            RunOptions {
                mode: EtlMode::NonCommit,
                filters: RunFilters {
                    only: vec!["Load".parse().unwrap()],
                    skip: vec!["Load.C".parse().unwrap()],
                    ..RunFilters::none()
                },
                ..RunOptions::default()
            },
        );

        let report = manager.run().await.unwrap();
        assert!(report.succeeded());
        assert_eq!(
            states(&report),
            vec![
                ("Prepare.A".to_string(), TaskState::Skipped),
                ("Load.B".to_string(), TaskState::Success),
                ("Load.C".to_string(), TaskState::Skipped),
            ]
        );
    }

    #[test]
    fn test_render_plan_resolves_known_keys_only() {
        let mut task = base_task("Pull", TaskType::Plugin);
        task.plugin = Some("counting-loader".to_string());
        task.params = json!({"file": "${data_dir}/in.jsonl", "tag": "${run_id}"})
            .as_object()
            .cloned()
            .unwrap_or_default();

        let manager = manager(
            vec![stage("Load", ParallelMode::None, vec![task])],
            RunOptions {
                mode: EtlMode::NonCommit,
                cli_params: json!({"data_dir": "/data"}).as_object().cloned().unwrap_or_default(),
                ..RunOptions::default()
            },
        );

        let rendered = manager.render_plan().unwrap();
        assert!(rendered.contains("Pull"));
        assert!(rendered.contains(r#"params {"file":"/data/in.jsonl","tag":"${run_id}"}"#));
    }
}
