//! Outcome routing: completion, retry with backoff, or dead-lettering.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::config::Settings;
use crate::error::{JobError, Result};
use crate::jobs::backoff::{format_duration, next_retry_time};
use crate::jobs::dlq::DeadLetterQueue;
use crate::jobs::model::Job;
use crate::jobs::state::JobState;
use crate::store::{JobStore, JobUpdate, UpdateGuard};

/// Error recorded when a retryable failure carries no message.
pub const UNKNOWN_ERROR: &str = "Unknown error";

/// What happens to a job after a failed attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum FailureDecision {
    Retry {
        attempts: u32,
        next_retry_at: DateTime<Utc>,
        error: String,
    },
    Dead {
        attempts: u32,
        error: String,
    },
}

/// Decide the next state for a job whose current attempt just failed.
///
/// `job.attempts` is the count before this failure.
pub fn decide_failure(job: &Job, error: &str, base: f64, now: DateTime<Utc>) -> FailureDecision {
    let attempts = job.attempts.saturating_add(1);
    if attempts >= job.max_retries {
        FailureDecision::Dead {
            attempts,
            error: error.to_string(),
        }
    } else {
        let error = if error.trim().is_empty() {
            UNKNOWN_ERROR.to_string()
        } else {
            error.to_string()
        };
        FailureDecision::Retry {
            attempts,
            next_retry_at: next_retry_time(attempts, base, now),
            error,
        }
    }
}

/// Applies execution outcomes to the store.
#[derive(Clone)]
pub struct RetryManager {
    store: Arc<dyn JobStore>,
    settings: Arc<Settings>,
    dlq: DeadLetterQueue,
}

impl RetryManager {
    pub fn new(store: Arc<dyn JobStore>, settings: Arc<Settings>) -> Self {
        let dlq = DeadLetterQueue::new(Arc::clone(&store));
        Self {
            store,
            settings,
            dlq,
        }
    }

    /// Mark a held job `completed`. `None` if the lease was lost.
    pub async fn complete(&self, job: &Job, worker_id: &str, output: &str) -> Result<Option<Job>> {
        let update = JobUpdate::new(JobState::Completed, UpdateGuard::Holder(worker_id.to_string()))
            .output(output)
            .completed_at(Utc::now());

        let done = self.store.transition(&job.id, &update).await?;
        match &done {
            Some(_) => info!(job_id = %job.id, worker_id, "Job completed"),
            None => warn!(job_id = %job.id, worker_id, "Lease lost before completion, outcome discarded"),
        }
        Ok(done)
    }

    /// Route a failed attempt to `failed` (with backoff) or `dead`.
    pub async fn handle_failure(
        &self,
        job: &Job,
        worker_id: &str,
        error: &str,
    ) -> Result<Option<Job>> {
        let base = self.settings.backoff_base().await;
        match decide_failure(job, error, base, Utc::now()) {
            FailureDecision::Retry {
                attempts,
                next_retry_at,
                error,
            } => {
                self.schedule_retry(&job.id, worker_id, attempts, &error, next_retry_at)
                    .await
            }
            FailureDecision::Dead { attempts, error } => {
                self.dlq
                    .move_to_dead_letter(&job.id, worker_id, attempts, &error)
                    .await
            }
        }
    }

    /// Put a held job into `failed` until `next_retry_at`.
    pub async fn schedule_retry(
        &self,
        job_id: &str,
        worker_id: &str,
        attempts: u32,
        error: &str,
        next_retry_at: DateTime<Utc>,
    ) -> Result<Option<Job>> {
        let update = JobUpdate::new(JobState::Failed, UpdateGuard::Holder(worker_id.to_string()))
            .attempts(attempts)
            .error(error)
            .next_retry_at(next_retry_at);

        let job = self.store.transition(job_id, &update).await?;
        match &job {
            Some(job) => info!(
                job_id,
                attempts,
                max_retries = job.max_retries,
                retry_in = %format_duration(next_retry_at - Utc::now()),
                "Job failed, retry scheduled"
            ),
            None => warn!(job_id, worker_id, "Lease lost before retry scheduling, outcome discarded"),
        }
        Ok(job)
    }

    /// Manually reset a `failed` or `dead` job to `pending`.
    pub async fn reset_for_retry(&self, job_id: &str) -> Result<Job> {
        let job = self
            .store
            .get_job(job_id)
            .await?
            .ok_or_else(|| JobError::NotFound {
                id: job_id.to_string(),
            })?;

        if !matches!(job.state, JobState::Failed | JobState::Dead) {
            return Err(JobError::InvalidTransition {
                id: job_id.to_string(),
                state: job.state.to_string(),
                target: JobState::Pending.to_string(),
            }
            .into());
        }

        let update = JobUpdate::new(JobState::Pending, UpdateGuard::State(job.state))
            .attempts(0)
            .error("");

        self.store
            .transition(job_id, &update)
            .await?
            .ok_or_else(|| {
                // Claimed or reset by someone else in the meantime.
                JobError::InvalidTransition {
                    id: job_id.to_string(),
                    state: job.state.to_string(),
                    target: JobState::Pending.to_string(),
                }
                .into()
            })
    }

    /// Failed jobs whose retry time has passed, soonest first.
    pub async fn retryable_jobs(&self, limit: usize) -> Result<Vec<Job>> {
        let lease = self.settings.lock_timeout().await;
        Ok(self.store.list_retryable(lease, Utc::now(), limit).await?)
    }
}
