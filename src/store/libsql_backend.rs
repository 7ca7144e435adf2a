//! libSQL backend for `JobStore` and `ConfigStore`.
//!
//! Supports local file and in-memory databases. The claim is one
//! `UPDATE ... RETURNING` statement; SQLite's write lock serializes it
//! against every other writer on the same database, including writers in
//! other processes.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info};

use crate::error::DatabaseError;
use crate::jobs::lease::LeasePolicy;
use crate::jobs::model::Job;
use crate::jobs::state::JobState;
use crate::store::migrations;
use crate::store::traits::{ConfigStore, JobStore, JobUpdate, UpdateGuard};

/// How long a file-backed connection waits on another writer's lock.
const BUSY_TIMEOUT_MS: u64 = 5_000;

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        conn.execute_batch(&format!("PRAGMA busy_timeout = {BUSY_TIMEOUT_MS};"))
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to set busy timeout: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.init_schema().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.init_schema().await?;
        Ok(backend)
    }

    /// Run all pending schema migrations.
    pub async fn init_schema(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(self.conn()).await
    }

    /// Get the connection.
    fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Run a statement that returns job rows and collect them.
    async fn query_jobs(
        &self,
        context: &str,
        rows: Result<libsql::Rows, libsql::Error>,
    ) -> Result<Vec<Job>, DatabaseError> {
        let mut rows = rows.map_err(|e| DatabaseError::Query(format!("{context}: {e}")))?;
        let mut jobs = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("{context}: {e}")))?
        {
            jobs.push(row_to_job(&row)?);
        }
        Ok(jobs)
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Canonical write format: fixed-width RFC 3339 UTC with milliseconds, so
/// lexical order in SQL equals chronological order.
fn fmt_ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn opt_ts(dt: Option<DateTime<Utc>>) -> libsql::Value {
    match dt {
        Some(dt) => libsql::Value::Text(fmt_ts(&dt)),
        None => libsql::Value::Null,
    }
}

fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

fn opt_int(n: Option<u32>) -> libsql::Value {
    match n {
        Some(n) => libsql::Value::Integer(i64::from(n)),
        None => libsql::Value::Null,
    }
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>, DatabaseError> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return Ok(ndt.and_utc());
    }
    Err(DatabaseError::Serialization(format!("invalid timestamp {s:?}")))
}

fn parse_optional_datetime(s: Option<String>) -> Result<Option<DateTime<Utc>>, DatabaseError> {
    s.map(|s| parse_datetime(&s)).transpose()
}

fn row_err(e: libsql::Error) -> DatabaseError {
    DatabaseError::Query(format!("row_to_job: {e}"))
}

/// Map a write error, surfacing uniqueness violations as `Constraint`.
fn write_err(context: &str, e: libsql::Error) -> DatabaseError {
    let msg = e.to_string();
    if msg.contains("UNIQUE constraint failed") {
        DatabaseError::Constraint(format!("{context}: {msg}"))
    } else {
        DatabaseError::Query(format!("{context}: {msg}"))
    }
}

/// Map a libsql Row to a Job. Column order matches `JOB_COLUMNS`.
fn row_to_job(row: &libsql::Row) -> Result<Job, DatabaseError> {
    let state_str: String = row.get(2).map_err(row_err)?;
    let created_str: String = row.get(11).map_err(row_err)?;
    let updated_str: String = row.get(12).map_err(row_err)?;

    Ok(Job {
        id: row.get(0).map_err(row_err)?,
        command: row.get(1).map_err(row_err)?,
        state: state_str
            .parse::<JobState>()
            .map_err(DatabaseError::Serialization)?,
        attempts: u32::try_from(row.get::<i64>(3).map_err(row_err)?).unwrap_or(0),
        max_retries: u32::try_from(row.get::<i64>(4).map_err(row_err)?).unwrap_or(0),
        priority: row.get(5).map_err(row_err)?,
        next_retry_at: parse_optional_datetime(row.get(6).ok())?,
        output: row.get(7).unwrap_or_default(),
        error: row.get(8).unwrap_or_default(),
        locked_at: parse_optional_datetime(row.get(9).ok())?,
        locked_by: row.get(10).ok(),
        created_at: parse_datetime(&created_str)?,
        updated_at: parse_datetime(&updated_str)?,
        completed_at: parse_optional_datetime(row.get(13).ok())?,
    })
}

// ── Trait implementation ────────────────────────────────────────────

const JOB_COLUMNS: &str = "id, command, state, attempts, max_retries, priority, next_retry_at, output, error, locked_at, locked_by, created_at, updated_at, completed_at";

/// Claim eligibility in SQL. `?1` = now, `?3` = lease expiry cutoff.
/// A lease taken exactly at the cutoff is still held (`LeasePolicy::is_expired`).
const CLAIMABLE: &str = "((state IN ('pending', 'failed') \
      AND (locked_at IS NULL OR locked_at < ?3) \
      AND (next_retry_at IS NULL OR next_retry_at <= ?1)) \
     OR (state = 'processing' AND locked_at IS NOT NULL AND locked_at < ?3))";

#[async_trait]
impl JobStore for LibSqlBackend {
    async fn insert_job(&self, job: &Job) -> Result<(), DatabaseError> {
        let conn = self.conn();
        conn.execute(
            &format!(
                "INSERT INTO jobs ({JOB_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)"
            ),
            params![
                job.id.clone(),
                job.command.clone(),
                job.state.as_str(),
                i64::from(job.attempts),
                i64::from(job.max_retries),
                job.priority,
                opt_ts(job.next_retry_at),
                job.output.clone(),
                job.error.clone(),
                opt_ts(job.locked_at),
                opt_text(job.locked_by.as_deref()),
                fmt_ts(&job.created_at),
                fmt_ts(&job.updated_at),
                opt_ts(job.completed_at),
            ],
        )
        .await
        .map_err(|e| write_err("insert_job", e))?;

        debug!(job_id = %job.id, "Inserted job");
        Ok(())
    }

    async fn claim_next(
        &self,
        worker_id: &str,
        lease_timeout: Duration,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, DatabaseError> {
        let conn = self.conn();
        let cutoff = LeasePolicy::new(lease_timeout).expiry_cutoff(now);

        let sql = format!(
            "UPDATE jobs
             SET state = 'processing', locked_at = ?1, locked_by = ?2, updated_at = ?1
             WHERE id = (
                 SELECT id FROM jobs
                 WHERE {CLAIMABLE}
                 ORDER BY priority DESC, created_at ASC, rowid ASC
                 LIMIT 1
             )
             AND {CLAIMABLE}
             RETURNING {JOB_COLUMNS}"
        );

        let mut rows = conn
            .query(&sql, params![fmt_ts(&now), worker_id, fmt_ts(&cutoff)])
            .await
            .map_err(|e| DatabaseError::Query(format!("claim_next: {e}")))?;

        let claimed = match rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("claim_next: {e}")))?
        {
            Some(row) => Some(row_to_job(&row)?),
            None => None,
        };

        if let Some(ref job) = claimed {
            debug!(job_id = %job.id, worker_id, "Claimed job");
        }
        Ok(claimed)
    }

    async fn transition(
        &self,
        job_id: &str,
        update: &JobUpdate,
    ) -> Result<Option<Job>, DatabaseError> {
        let from = update.guard.source_state();
        if !from.can_transition_to(update.state) {
            return Err(DatabaseError::Constraint(format!(
                "transition: {job_id} cannot move from {from} to {}",
                update.state
            )));
        }

        let conn = self.conn();
        let now = fmt_ts(&Utc::now());

        let guard_sql = match update.guard {
            UpdateGuard::Holder(_) => "AND state = 'processing' AND locked_by = ?9",
            UpdateGuard::State(_) => "AND state = ?9",
        };
        let sql = format!(
            "UPDATE jobs
             SET state = ?1,
                 attempts = COALESCE(?2, attempts),
                 output = COALESCE(?3, output),
                 error = COALESCE(?4, error),
                 next_retry_at = ?5,
                 completed_at = COALESCE(?6, completed_at),
                 locked_at = NULL,
                 locked_by = NULL,
                 updated_at = ?7
             WHERE id = ?8 {guard_sql}
             RETURNING {JOB_COLUMNS}"
        );

        let state = update.state.as_str();
        let attempts = opt_int(update.attempts);
        let output = opt_text(update.output.as_deref());
        let error = opt_text(update.error.as_deref());
        let next_retry_at = opt_ts(update.next_retry_at);
        let completed_at = opt_ts(update.completed_at);

        let rows = match &update.guard {
            UpdateGuard::Holder(worker_id) => {
                conn.query(
                    &sql,
                    params![
                        state,
                        attempts,
                        output,
                        error,
                        next_retry_at,
                        completed_at,
                        now,
                        job_id,
                        worker_id.as_str()
                    ],
                )
                .await
            }
            UpdateGuard::State(expected) => {
                conn.query(
                    &sql,
                    params![
                        state,
                        attempts,
                        output,
                        error,
                        next_retry_at,
                        completed_at,
                        now,
                        job_id,
                        expected.as_str()
                    ],
                )
                .await
            }
        };

        let mut jobs = self.query_jobs("transition", rows).await?;
        Ok(jobs.pop())
    }

    async fn release_lease(&self, job_id: &str, worker_id: &str) -> Result<bool, DatabaseError> {
        let conn = self.conn();
        let count = conn
            .execute(
                "UPDATE jobs
                 SET state = 'pending',
                     locked_at = NULL,
                     locked_by = NULL,
                     updated_at = ?3
                 WHERE id = ?1 AND state = 'processing' AND locked_by = ?2",
                params![job_id, worker_id, fmt_ts(&Utc::now())],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("release_lease: {e}")))?;
        Ok(count > 0)
    }

    async fn get_job(&self, job_id: &str) -> Result<Option<Job>, DatabaseError> {
        let conn = self.conn();
        let rows = conn
            .query(
                &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"),
                params![job_id],
            )
            .await;
        let mut jobs = self.query_jobs("get_job", rows).await?;
        Ok(jobs.pop())
    }

    async fn list_jobs(
        &self,
        state: Option<JobState>,
        limit: usize,
    ) -> Result<Vec<Job>, DatabaseError> {
        let conn = self.conn();
        let limit = limit as i64;
        let rows = match state {
            Some(state) => {
                conn.query(
                    &format!(
                        "SELECT {JOB_COLUMNS} FROM jobs WHERE state = ?1 ORDER BY created_at DESC, rowid DESC LIMIT ?2"
                    ),
                    params![state.as_str(), limit],
                )
                .await
            }
            None => {
                conn.query(
                    &format!(
                        "SELECT {JOB_COLUMNS} FROM jobs ORDER BY created_at DESC, rowid DESC LIMIT ?1"
                    ),
                    params![limit],
                )
                .await
            }
        };
        self.query_jobs("list_jobs", rows).await
    }

    async fn list_dead_letters(&self, limit: usize) -> Result<Vec<Job>, DatabaseError> {
        let conn = self.conn();
        let rows = conn
            .query(
                &format!(
                    "SELECT {JOB_COLUMNS} FROM jobs WHERE state = 'dead' ORDER BY updated_at DESC, rowid DESC LIMIT ?1"
                ),
                params![limit as i64],
            )
            .await;
        self.query_jobs("list_dead_letters", rows).await
    }

    async fn list_retryable(
        &self,
        lease_timeout: Duration,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Job>, DatabaseError> {
        let conn = self.conn();
        let cutoff = LeasePolicy::new(lease_timeout).expiry_cutoff(now);
        let rows = conn
            .query(
                &format!(
                    "SELECT {JOB_COLUMNS} FROM jobs
                     WHERE state = 'failed'
                       AND next_retry_at IS NOT NULL AND next_retry_at <= ?1
                       AND (locked_at IS NULL OR locked_at < ?2)
                     ORDER BY next_retry_at ASC
                     LIMIT ?3"
                ),
                params![fmt_ts(&now), fmt_ts(&cutoff), limit as i64],
            )
            .await;
        self.query_jobs("list_retryable", rows).await
    }

    async fn delete_job(
        &self,
        job_id: &str,
        only_state: Option<JobState>,
    ) -> Result<bool, DatabaseError> {
        let conn = self.conn();
        let count = match only_state {
            Some(state) => {
                conn.execute(
                    "DELETE FROM jobs WHERE id = ?1 AND state = ?2",
                    params![job_id, state.as_str()],
                )
                .await
            }
            None => {
                conn.execute("DELETE FROM jobs WHERE id = ?1", params![job_id])
                    .await
            }
        }
        .map_err(|e| DatabaseError::Query(format!("delete_job: {e}")))?;
        Ok(count > 0)
    }

    async fn delete_by_state(&self, state: JobState) -> Result<u64, DatabaseError> {
        let conn = self.conn();
        conn.execute("DELETE FROM jobs WHERE state = ?1", params![state.as_str()])
            .await
            .map_err(|e| DatabaseError::Query(format!("delete_by_state: {e}")))
    }

    async fn count_by_state(&self) -> Result<Vec<(JobState, u64)>, DatabaseError> {
        let conn = self.conn();
        let mut rows = conn
            .query("SELECT state, COUNT(*) FROM jobs GROUP BY state", ())
            .await
            .map_err(|e| DatabaseError::Query(format!("count_by_state: {e}")))?;

        let mut counts = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("count_by_state: {e}")))?
        {
            let state_str: String = row.get(0).map_err(row_err)?;
            let count: i64 = row.get(1).map_err(row_err)?;
            let state = state_str
                .parse::<JobState>()
                .map_err(DatabaseError::Serialization)?;
            counts.push((state, u64::try_from(count).unwrap_or(0)));
        }
        Ok(counts)
    }
}

#[async_trait]
impl ConfigStore for LibSqlBackend {
    async fn get_config(&self, key: &str) -> Result<Option<serde_json::Value>, DatabaseError> {
        let conn = self.conn();
        let mut rows = conn
            .query("SELECT value FROM config WHERE key = ?1", params![key])
            .await
            .map_err(|e| DatabaseError::Query(format!("get_config: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let value_str: String = row.get(0).unwrap_or_else(|_| "null".to_string());
                let value = serde_json::from_str(&value_str)
                    .map_err(|e| DatabaseError::Serialization(format!("config {key}: {e}")))?;
                Ok(Some(value))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_config: {e}"))),
        }
    }

    async fn set_config(&self, key: &str, value: &serde_json::Value) -> Result<(), DatabaseError> {
        let conn = self.conn();
        let now = fmt_ts(&Utc::now());
        let value_str = serde_json::to_string(value)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;

        conn.execute(
            "INSERT INTO config (key, value, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT (key) DO UPDATE SET value = ?2, updated_at = ?3",
            params![key, value_str, now],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("set_config: {e}")))?;

        Ok(())
    }

    async fn all_config(&self) -> Result<HashMap<String, serde_json::Value>, DatabaseError> {
        let conn = self.conn();
        let mut rows = conn
            .query("SELECT key, value FROM config ORDER BY key", ())
            .await
            .map_err(|e| DatabaseError::Query(format!("all_config: {e}")))?;

        let mut all = HashMap::new();
        while let Ok(Some(row)) = rows.next().await {
            let key: String = match row.get(0) {
                Ok(k) => k,
                Err(_) => continue,
            };
            let value_str: String = row.get(1).unwrap_or_else(|_| "null".to_string());
            let value = serde_json::from_str(&value_str).unwrap_or(serde_json::Value::Null);
            all.insert(key, value);
        }
        Ok(all)
    }
}
