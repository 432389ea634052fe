//! Command dispatch
//!
//! Wires parsed arguments into the engine: builds the plugin registry and
//! the session provider, then either inspects plugins, prints a plan, runs
//! a single worker task, or runs the whole pipeline. Returns the process
//! exit code; only a completed run maps to zero.

use std::sync::Arc;

use colored::Colorize;
use gpipe_engine::{
    EngineError, ExecutionReport, NullSessionProvider, PgSessionProvider, PipelineConfig,
    PipelineManager, PluginRegistry, RunFilters, RunOptions, SessionProvider, TaskState,
};

use crate::error::{CliError, Result};
use crate::params::parse_params;
use crate::Cli;

pub async fn execute(cli: &Cli) -> Result<i32> {
    let mut registry = PluginRegistry::new();
    gpipe_plugins::register_builtins(&mut registry);

    if cli.list_plugins {
        for name in registry.list() {
            println!("{name}");
        }
        return Ok(0);
    }

    if let Some(name) = &cli.describe_plugin {
        print_plugin(&registry, name)?;
        return Ok(0);
    }

    let Some(config_path) = &cli.config else {
        return Err(CliError::usage(
            "a pipeline definition path is required unless --list-plugins or \
             --describe-plugin is used",
        ));
    };

    let config = PipelineConfig::load(config_path)?;
    let options = RunOptions {
        mode: cli.mode,
        commit_after: cli.commit_after,
        cli_params: parse_params(&cli.params)?,
        filters: RunFilters {
            only: cli.only.clone(),
            skip: cli.skip.clone(),
            resume_at: cli.resume_at.clone(),
            checkpoint: cli.resume_checkpoint.clone(),
        },
        config_path: Some(config_path.clone()),
    };
    let sessions = session_provider(cli).await?;
    let manager = PipelineManager::new(config, Arc::new(registry), sessions, options);

    if cli.plan_only {
        print!("{}", manager.render_plan()?);
        return Ok(0);
    }

    let report = if let Some(selector) = &cli.worker_task {
        manager.run_worker(selector, cli.worker_checkpoint.clone()).await?
    } else {
        manager.run().await?
    };

    print_report(&report);
    Ok(if report.succeeded() { 0 } else { 1 })
}

/// Real Postgres sessions when a connection string is given, otherwise a
/// provider whose statements fail with a pointer at DATABASE_URL
async fn session_provider(cli: &Cli) -> Result<Arc<dyn SessionProvider>> {
    match &cli.database_url {
        Some(url) => {
            let provider =
                PgSessionProvider::connect(url).await.map_err(EngineError::from)?;
            Ok(Arc::new(provider))
        },
        None => Ok(Arc::new(NullSessionProvider)),
    }
}

fn print_plugin(registry: &PluginRegistry, name: &str) -> Result<()> {
    let plugin = registry.describe(name)?;

    println!("{}", plugin.name.cyan().bold());
    println!("  {}", plugin.description);
    println!("  Operation: {}", plugin.operation);
    println!("  Streaming: {}", plugin.streaming);
    if plugin.affected_tables.is_empty() {
        println!("  Affected tables: (declared per task)");
    } else {
        println!("  Affected tables: {}", plugin.affected_tables.join(", "));
    }

    match plugin.parameter_model.as_object() {
        Some(params) if !params.is_empty() => {
            println!("  Parameters:");
            for (key, doc) in params {
                let doc = doc.as_str().map(str::to_string).unwrap_or_else(|| doc.to_string());
                println!("    {key:<12} {doc}");
            }
        },
        _ => println!("  Parameters: {}", plugin.parameter_model),
    }
    Ok(())
}

fn print_report(report: &ExecutionReport) {
    println!();
    println!("{}", format!("Run {} [{}]", report.run_id, report.mode).cyan().bold());

    for task in &report.tasks {
        let name = format!("{}.{}", task.stage, task.task);
        match task.state {
            TaskState::Success => println!(
                "  {:<32} {}  {} records, {} commits, {} rollbacks",
                name,
                "SUCCESS".green(),
                task.counters.records_written,
                task.counters.commits,
                task.counters.rollbacks,
            ),
            TaskState::Failed => {
                println!("  {:<32} {}", name, "FAILED".red());
                if let Some(error) = &task.error {
                    println!("    {error}");
                }
            },
            TaskState::Skipped => println!(
                "  {:<32} {} ({})",
                name,
                "SKIPPED".yellow(),
                task.reason.as_deref().unwrap_or("skipped"),
            ),
            TaskState::NotStarted => println!(
                "  {:<32} {} ({})",
                name,
                "NOT_STARTED".yellow(),
                task.reason.as_deref().unwrap_or("not started"),
            ),
        }
    }

    println!();
    let state = if report.succeeded() {
        report.state.to_string().green().bold()
    } else {
        report.state.to_string().red().bold()
    };
    println!("{state}: {} records written", report.records_written());
}
