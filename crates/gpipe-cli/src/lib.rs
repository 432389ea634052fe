//! gpipe CLI Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Command-line runner for gpipe ETL pipelines.
//!
//! # Overview
//!
//! One binary, one job: take a pipeline definition and drive it through the
//! engine under the selected execution mode.
//!
//! - **Run**: `gpipe pipeline.yaml --mode COMMIT`
//! - **Rehearse**: `gpipe pipeline.yaml` (DRY_RUN is the default)
//! - **Preview**: `gpipe pipeline.yaml --plan-only`
//! - **Select**: `--only`, `--skip`, `--resume-at`, `--resume-checkpoint`
//! - **Inspect plugins**: `gpipe --list-plugins`, `gpipe --describe-plugin <name>`
//!
//! The process exits 0 only when the run completes; any aborted stage,
//! unknown plugin, or invalid definition exits non-zero.

pub mod error;
pub mod params;
pub mod run;

// Re-export commonly used types
pub use error::{CliError, Result};

use std::path::PathBuf;

use clap::Parser;
use gpipe_engine::{Checkpoint, EngineError, EtlMode, TaskSelector};

/// gpipe - staged ETL pipeline runner
#[derive(Parser, Debug)]
#[command(name = "gpipe")]
#[command(author, version, about, long_about = None)]
#[command(arg_required_else_help = true)]
pub struct Cli {
    /// Pipeline definition file (.yaml, .yml, or .json)
    pub config: Option<PathBuf>,

    /// Execution mode: COMMIT, NON_COMMIT, or DRY_RUN
    #[arg(long, default_value = "DRY_RUN", value_parser = parse_mode)]
    pub mode: EtlMode,

    /// Run only these Stage or Stage.Task names (comma separated, repeatable)
    #[arg(long, value_delimiter = ',', value_parser = parse_selector)]
    pub only: Vec<TaskSelector>,

    /// Exclude these Stage or Stage.Task names; wins over --only
    #[arg(long, value_delimiter = ',', value_parser = parse_selector)]
    pub skip: Vec<TaskSelector>,

    /// Skip everything before this Stage or Stage.Task
    #[arg(long, value_parser = parse_selector)]
    pub resume_at: Option<TaskSelector>,

    /// Restart position inside the resume target: line=N or id=VALUE
    #[arg(long, value_parser = parse_checkpoint, requires = "resume_at")]
    pub resume_checkpoint: Option<Checkpoint>,

    /// Pipeline parameter override: KEY=VALUE (repeatable) or one JSON object
    #[arg(long = "param", value_name = "KEY=VALUE")]
    pub params: Vec<String>,

    /// Records per transaction before commit/rollback (overrides task settings)
    #[arg(long)]
    pub commit_after: Option<u64>,

    /// Postgres connection string; without it database work is unavailable
    #[arg(long, env = "DATABASE_URL")]
    pub database_url: Option<String>,

    /// Write logs to this file in addition to the console
    #[arg(long)]
    pub log_file: Option<PathBuf>,

    /// Print the resolved execution plan and exit without running
    #[arg(long)]
    pub plan_only: bool,

    /// List registered plugin names, one per line, and exit
    #[arg(long)]
    pub list_plugins: bool,

    /// Describe one plugin (parameters, affected tables) and exit
    #[arg(long, value_name = "NAME")]
    pub describe_plugin: Option<String>,

    /// Verbose output
    #[arg(short, long)]
    pub verbose: bool,

    /// Print help as markdown (used for docs generation)
    #[arg(long, hide = true)]
    pub markdown_help: bool,

    /// Run a single Stage.Task in this process (PROCESS dispatch re-entry)
    #[arg(long, hide = true, value_parser = parse_selector)]
    pub worker_task: Option<TaskSelector>,

    /// Checkpoint handed to the worker task
    #[arg(long, hide = true, value_parser = parse_checkpoint, requires = "worker_task")]
    pub worker_checkpoint: Option<Checkpoint>,
}

fn parse_mode(s: &str) -> std::result::Result<EtlMode, String> {
    s.parse().map_err(|e: EngineError| e.to_string())
}

fn parse_selector(s: &str) -> std::result::Result<TaskSelector, String> {
    s.parse().map_err(|e: EngineError| e.to_string())
}

fn parse_checkpoint(s: &str) -> std::result::Result<Checkpoint, String> {
    s.parse().map_err(|e: EngineError| e.to_string())
}
