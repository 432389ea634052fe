//! Database sessions
//!
//! Plugins never talk to sqlx directly; they get a [`DbSession`] scoped to
//! their task, and the commit helper drives its transaction boundaries.
//! Statements take positional `$n` parameters as JSON values so plugin
//! crates stay decoupled from driver types.

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use sqlx::postgres::{PgArguments, PgPoolOptions};
use sqlx::query::Query;
use sqlx::{PgPool, Postgres, Transaction};
use thiserror::Error;
use tracing::debug;

pub type SessionResult<T> = std::result::Result<T, SessionError>;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Transaction protocol misuse, e.g. commit without begin
    #[error("session state error: {0}")]
    State(String),

    /// No database was configured for this run
    #[error("no database configured: {0}")]
    Unavailable(String),
}

impl SessionError {
    pub fn state(message: impl Into<String>) -> Self {
        SessionError::State(message.into())
    }
}

/// A task-scoped database handle with explicit transaction boundaries
#[async_trait]
pub trait DbSession: Send {
    /// Open a transaction; fails if one is already open
    async fn begin(&mut self) -> SessionResult<()>;

    /// Run a statement inside the open transaction, returning rows affected
    async fn execute(&mut self, sql: &str, params: &[Value]) -> SessionResult<u64>;

    /// Fetch a single optional integer, for count-style checks
    async fn query_scalar_i64(
        &mut self,
        sql: &str,
        params: &[Value],
    ) -> SessionResult<Option<i64>>;

    /// Commit and close the open transaction
    async fn commit(&mut self) -> SessionResult<()>;

    /// Roll back and close the open transaction
    async fn rollback(&mut self) -> SessionResult<()>;
}

/// Hands out independent sessions, one per task
#[async_trait]
pub trait SessionProvider: Send + Sync {
    async fn open(&self) -> SessionResult<Box<dyn DbSession>>;
}

// ============================================================================
// Postgres
// ============================================================================

/// Postgres-backed provider sharing one connection pool
#[derive(Debug, Clone)]
pub struct PgSessionProvider {
    pool: PgPool,
}

impl PgSessionProvider {
    pub async fn connect(database_url: &str) -> SessionResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(30))
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SessionProvider for PgSessionProvider {
    async fn open(&self) -> SessionResult<Box<dyn DbSession>> {
        Ok(Box::new(PgSession { pool: self.pool.clone(), tx: None }))
    }
}

struct PgSession {
    pool: PgPool,
    tx: Option<Transaction<'static, Postgres>>,
}

fn bind_params<'q>(
    mut query: Query<'q, Postgres, PgArguments>,
    params: &'q [Value],
) -> Query<'q, Postgres, PgArguments> {
    for param in params {
        query = match param {
            Value::Null => query.bind(Option::<String>::None),
            Value::Bool(b) => query.bind(*b),
            Value::Number(n) if n.is_i64() => query.bind(n.as_i64()),
            Value::Number(n) => query.bind(n.as_f64()),
            Value::String(s) => query.bind(s.as_str()),
            other => query.bind(sqlx::types::Json(other.clone())),
        };
    }
    query
}

#[async_trait]
impl DbSession for PgSession {
    async fn begin(&mut self) -> SessionResult<()> {
        if self.tx.is_some() {
            return Err(SessionError::state("transaction already open"));
        }
        self.tx = Some(self.pool.begin().await?);
        Ok(())
    }

    async fn execute(&mut self, sql: &str, params: &[Value]) -> SessionResult<u64> {
        let tx = self
            .tx
            .as_mut()
            .ok_or_else(|| SessionError::state("execute outside a transaction"))?;
        let result = bind_params(sqlx::query(sql), params).execute(&mut **tx).await?;
        Ok(result.rows_affected())
    }

    async fn query_scalar_i64(
        &mut self,
        sql: &str,
        params: &[Value],
    ) -> SessionResult<Option<i64>> {
        let tx = self
            .tx
            .as_mut()
            .ok_or_else(|| SessionError::state("query outside a transaction"))?;
        let mut query = sqlx::query_scalar::<_, i64>(sql);
        for param in params {
            query = match param {
                Value::Null => query.bind(Option::<String>::None),
                Value::Bool(b) => query.bind(*b),
                Value::Number(n) if n.is_i64() => query.bind(n.as_i64()),
                Value::Number(n) => query.bind(n.as_f64()),
                Value::String(s) => query.bind(s.as_str()),
                other => query.bind(sqlx::types::Json(other.clone())),
            };
        }
        Ok(query.fetch_optional(&mut **tx).await?)
    }

    async fn commit(&mut self) -> SessionResult<()> {
        let tx = self
            .tx
            .take()
            .ok_or_else(|| SessionError::state("commit outside a transaction"))?;
        tx.commit().await?;
        Ok(())
    }

    async fn rollback(&mut self) -> SessionResult<()> {
        let tx = self
            .tx
            .take()
            .ok_or_else(|| SessionError::state("rollback outside a transaction"))?;
        tx.rollback().await?;
        Ok(())
    }
}

// ============================================================================
// No database configured
// ============================================================================

/// Provider used when the run has no database URL.
///
/// Transaction boundaries become no-ops so tasks that never touch the
/// database still run; any actual statement fails with a clear message.
#[derive(Debug, Clone, Default)]
pub struct NullSessionProvider;

#[async_trait]
impl SessionProvider for NullSessionProvider {
    async fn open(&self) -> SessionResult<Box<dyn DbSession>> {
        Ok(Box::new(NullSession))
    }
}

struct NullSession;

fn no_database() -> SessionError {
    SessionError::Unavailable(
        "pass --database-url or set DATABASE_URL to run database statements".to_string(),
    )
}

#[async_trait]
impl DbSession for NullSession {
    async fn begin(&mut self) -> SessionResult<()> {
        debug!("no database configured, begin is a no-op");
        Ok(())
    }

    async fn execute(&mut self, _sql: &str, _params: &[Value]) -> SessionResult<u64> {
        Err(no_database())
    }

    async fn query_scalar_i64(
        &mut self,
        _sql: &str,
        _params: &[Value],
    ) -> SessionResult<Option<i64>> {
        Err(no_database())
    }

    async fn commit(&mut self) -> SessionResult<()> {
        debug!("no database configured, commit is a no-op");
        Ok(())
    }

    async fn rollback(&mut self) -> SessionResult<()> {
        debug!("no database configured, rollback is a no-op");
        Ok(())
    }
}

// ============================================================================
// In-memory session for tests
// ============================================================================

/// Session that records every call instead of talking to a database.
///
/// `query_scalar_i64` pops from `scalar_results`; `execute` fails when
/// `fail_execute` is set, for error-path tests.
#[derive(Debug, Default)]
pub struct MemorySession {
    pub log: Vec<String>,
    pub scalar_results: VecDeque<Option<i64>>,
    pub fail_execute: bool,
    in_tx: bool,
}

impl MemorySession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_scalar_results(results: Vec<Option<i64>>) -> Self {
        Self { scalar_results: results.into(), ..Self::default() }
    }

    pub fn count(&self, op: &str) -> usize {
        let prefix = format!("{op}:");
        self.log
            .iter()
            .filter(|entry| entry.as_str() == op || entry.starts_with(&prefix))
            .count()
    }
}

#[async_trait]
impl DbSession for MemorySession {
    async fn begin(&mut self) -> SessionResult<()> {
        if self.in_tx {
            return Err(SessionError::state("transaction already open"));
        }
        self.in_tx = true;
        self.log.push("begin".to_string());
        Ok(())
    }

    async fn execute(&mut self, sql: &str, params: &[Value]) -> SessionResult<u64> {
        if !self.in_tx {
            return Err(SessionError::state("execute outside a transaction"));
        }
        if self.fail_execute {
            return Err(SessionError::state("injected execute failure"));
        }
        self.log.push(format!("execute:{sql}"));
        let _ = params;
        Ok(1)
    }

    async fn query_scalar_i64(
        &mut self,
        sql: &str,
        _params: &[Value],
    ) -> SessionResult<Option<i64>> {
        if !self.in_tx {
            return Err(SessionError::state("query outside a transaction"));
        }
        self.log.push(format!("query:{sql}"));
        Ok(self.scalar_results.pop_front().flatten())
    }

    async fn commit(&mut self) -> SessionResult<()> {
        if !self.in_tx {
            return Err(SessionError::state("commit outside a transaction"));
        }
        self.in_tx = false;
        self.log.push("commit".to_string());
        Ok(())
    }

    async fn rollback(&mut self) -> SessionResult<()> {
        if !self.in_tx {
            return Err(SessionError::state("rollback outside a transaction"));
        }
        self.in_tx = false;
        self.log.push("rollback".to_string());
        Ok(())
    }
}
