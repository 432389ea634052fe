//! Execution modes and the batch commit helper
//!
//! Every write path runs inside explicit transactions; the mode decides what
//! happens at each batch boundary. COMMIT commits, NON_COMMIT exercises the
//! full write path but rolls every batch back, and DRY_RUN additionally
//! keeps side effects (shell, files, webhooks) simulated elsewhere. Nothing
//! is ever committed outside COMMIT mode.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::EngineError;
use crate::session::{DbSession, SessionResult};
use crate::status::TaskCounters;

/// Commit cadence when a task does not override it
pub const DEFAULT_COMMIT_AFTER: u64 = 5000;

/// How destructive a run is allowed to be
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EtlMode {
    /// Commit batches as they complete
    Commit,
    /// Run the full write path, roll back every batch
    NonCommit,
    /// Rehearsal: writes roll back and external side effects are simulated
    #[default]
    DryRun,
}

impl EtlMode {
    pub fn as_str(&self) -> &str {
        match self {
            EtlMode::Commit => "COMMIT",
            EtlMode::NonCommit => "NON_COMMIT",
            EtlMode::DryRun => "DRY_RUN",
        }
    }

    /// True only for COMMIT; every other mode rolls back
    pub fn commits(&self) -> bool {
        matches!(self, EtlMode::Commit)
    }

    pub fn is_dry_run(&self) -> bool {
        matches!(self, EtlMode::DryRun)
    }
}

impl fmt::Display for EtlMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EtlMode {
    type Err = EngineError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_uppercase().replace('-', "_").as_str() {
            "COMMIT" => Ok(EtlMode::Commit),
            "NON_COMMIT" => Ok(EtlMode::NonCommit),
            "DRY_RUN" => Ok(EtlMode::DryRun),
            _ => Err(EngineError::configuration(format!(
                "invalid mode '{s}': expected COMMIT, NON_COMMIT, or DRY_RUN"
            ))),
        }
    }
}

/// Tracks written records for one task and settles transactions at batch
/// boundaries according to the mode.
///
/// The decision is pure arithmetic: a boundary is reached when the running
/// count is a multiple of `commit_after`, or unconditionally at the residual
/// flush that ends the task.
#[derive(Debug)]
pub struct CommitHelper {
    mode: EtlMode,
    commit_after: u64,
    count: u64,
    commits: u64,
    rollbacks: u64,
}

impl CommitHelper {
    pub fn new(mode: EtlMode, commit_after: Option<u64>) -> Self {
        Self {
            mode,
            commit_after: commit_after.unwrap_or(DEFAULT_COMMIT_AFTER).max(1),
            count: 0,
            commits: 0,
            rollbacks: 0,
        }
    }

    pub fn mode(&self) -> EtlMode {
        self.mode
    }

    /// Records tracked since the task started
    pub fn count(&self) -> u64 {
        self.count
    }

    /// Snapshot for the execution report
    pub fn counters(&self) -> TaskCounters {
        TaskCounters {
            records_written: self.count,
            commits: self.commits,
            rollbacks: self.rollbacks,
        }
    }

    /// Add freshly written records and settle the transaction if the count
    /// just crossed a batch boundary. A zero increment never settles.
    pub async fn track(
        &mut self,
        session: &mut dyn DbSession,
        written: u64,
        what: &str,
    ) -> SessionResult<()> {
        if written == 0 {
            return Ok(());
        }
        self.count += written;
        self.commit_or_rollback(session, self.count, false, what).await
    }

    /// Settle the open transaction when `count` sits on a batch boundary or
    /// `residual` forces it. COMMIT commits, everything else rolls back; a
    /// non-residual settle reopens the transaction for the next batch.
    pub async fn commit_or_rollback(
        &mut self,
        session: &mut dyn DbSession,
        count: u64,
        residual: bool,
        what: &str,
    ) -> SessionResult<()> {
        if count % self.commit_after != 0 && !residual {
            return Ok(());
        }

        if self.mode.commits() {
            session.commit().await?;
            self.commits += 1;
            info!("COMMITTED: {} {}", count, what);
        } else {
            session.rollback().await?;
            self.rollbacks += 1;
            info!("ROLLED BACK: {} {}", count, what);
        }

        if !residual {
            session.begin().await?;
        }
        Ok(())
    }

    /// Residual flush at end of task; always settles, never reopens
    pub async fn finish(&mut self, session: &mut dyn DbSession, what: &str) -> SessionResult<()> {
        self.commit_or_rollback(session, self.count, true, what).await
    }
}
