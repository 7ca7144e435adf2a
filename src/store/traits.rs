//! Persistence contracts for the queue engine.
//!
//! `JobStore::claim_next` is the single atomic primitive the engine relies on
//! for mutual exclusion; every implementation must guarantee that concurrent
//! callers (in this process or any other sharing the store) never claim the
//! same job.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::DatabaseError;
use crate::jobs::model::Job;
use crate::jobs::state::JobState;

/// Precondition for a state transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateGuard {
    /// Job must be `processing` and leased to this worker.
    Holder(String),
    /// Job must currently be in this state.
    State(JobState),
}

impl UpdateGuard {
    /// The state a guarded job is in when the write applies.
    pub fn source_state(&self) -> JobState {
        match self {
            Self::Holder(_) => JobState::Processing,
            Self::State(state) => *state,
        }
    }
}

/// A state transition. Every transition clears the lease fields and stamps
/// `updated_at`. `None` leaves `attempts`/`output`/`error`/`completed_at`
/// untouched; `next_retry_at` is always written.
#[derive(Debug, Clone, PartialEq)]
pub struct JobUpdate {
    pub state: JobState,
    pub attempts: Option<u32>,
    pub output: Option<String>,
    pub error: Option<String>,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub guard: UpdateGuard,
}

impl JobUpdate {
    pub fn new(state: JobState, guard: UpdateGuard) -> Self {
        Self {
            state,
            attempts: None,
            output: None,
            error: None,
            next_retry_at: None,
            completed_at: None,
            guard,
        }
    }

    pub fn attempts(mut self, attempts: u32) -> Self {
        self.attempts = Some(attempts);
        self
    }

    pub fn output(mut self, output: impl Into<String>) -> Self {
        self.output = Some(output.into());
        self
    }

    pub fn error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn next_retry_at(mut self, at: DateTime<Utc>) -> Self {
        self.next_retry_at = Some(at);
        self
    }

    pub fn completed_at(mut self, at: DateTime<Utc>) -> Self {
        self.completed_at = Some(at);
        self
    }
}

/// Backend-agnostic job persistence.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a new job. Fails with `Constraint` if the id is taken.
    async fn insert_job(&self, job: &Job) -> Result<(), DatabaseError>;

    /// Atomically claim the highest-priority, oldest eligible job.
    ///
    /// Sets `state = processing`, `locked_at = now`, `locked_by = worker_id`
    /// and returns the updated record, or `None` if nothing is eligible.
    async fn claim_next(
        &self,
        worker_id: &str,
        lease_timeout: Duration,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, DatabaseError>;

    /// Apply a transition if its guard holds. `None` when the job is missing
    /// or the guard rejected the write. A transition the state machine does
    /// not allow fails with `Constraint` before touching the store.
    async fn transition(&self, job_id: &str, update: &JobUpdate)
    -> Result<Option<Job>, DatabaseError>;

    /// Hand a `processing` job leased to `worker_id` back to `pending`.
    /// `false` when the job is gone or its lease now belongs to someone else.
    async fn release_lease(&self, job_id: &str, worker_id: &str) -> Result<bool, DatabaseError>;

    async fn get_job(&self, job_id: &str) -> Result<Option<Job>, DatabaseError>;

    /// Jobs newest-created first, optionally filtered by state.
    async fn list_jobs(
        &self,
        state: Option<JobState>,
        limit: usize,
    ) -> Result<Vec<Job>, DatabaseError>;

    /// Dead jobs, most recently updated first.
    async fn list_dead_letters(&self, limit: usize) -> Result<Vec<Job>, DatabaseError>;

    /// Failed jobs whose retry time has passed and whose lease is free,
    /// soonest retry first.
    async fn list_retryable(
        &self,
        lease_timeout: Duration,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Job>, DatabaseError>;

    /// Delete a job, optionally only if it is in `only_state`.
    async fn delete_job(
        &self,
        job_id: &str,
        only_state: Option<JobState>,
    ) -> Result<bool, DatabaseError>;

    /// Delete every job in `state`. Returns the number removed.
    async fn delete_by_state(&self, state: JobState) -> Result<u64, DatabaseError>;

    /// Job count per state (states with no jobs may be omitted).
    async fn count_by_state(&self) -> Result<Vec<(JobState, u64)>, DatabaseError>;
}

/// Key/value persistence for settings. Values are JSON.
#[async_trait]
pub trait ConfigStore: Send + Sync {
    async fn get_config(&self, key: &str) -> Result<Option<serde_json::Value>, DatabaseError>;

    async fn set_config(&self, key: &str, value: &serde_json::Value) -> Result<(), DatabaseError>;

    async fn all_config(&self) -> Result<HashMap<String, serde_json::Value>, DatabaseError>;
}
