//! Dead-letter queue: jobs that exhausted their retry budget.

use std::sync::Arc;

use tracing::{info, warn};

use crate::error::{JobError, Result};
use crate::jobs::model::Job;
use crate::jobs::state::JobState;
use crate::store::{JobStore, JobUpdate, UpdateGuard};

/// Error recorded when a job dies without an underlying message.
pub const MAX_RETRIES_EXCEEDED: &str = "Max retries exceeded";

/// Dead-letter management over a job store.
#[derive(Clone)]
pub struct DeadLetterQueue {
    store: Arc<dyn JobStore>,
}

impl DeadLetterQueue {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self { store }
    }

    /// Move a job held by `worker_id` to `dead`. `None` if the lease was lost.
    pub async fn move_to_dead_letter(
        &self,
        job_id: &str,
        worker_id: &str,
        attempts: u32,
        error: &str,
    ) -> Result<Option<Job>> {
        let error = if error.trim().is_empty() {
            MAX_RETRIES_EXCEEDED
        } else {
            error
        };
        let update = JobUpdate::new(JobState::Dead, UpdateGuard::Holder(worker_id.to_string()))
            .attempts(attempts)
            .error(error);

        let job = self.store.transition(job_id, &update).await?;
        match &job {
            Some(_) => warn!(job_id, attempts, error, "Job moved to dead letter queue"),
            None => warn!(job_id, worker_id, "Lease lost before dead-lettering, outcome discarded"),
        }
        Ok(job)
    }

    /// Dead jobs, most recently updated first.
    pub async fn list(&self, limit: usize) -> Result<Vec<Job>> {
        Ok(self.store.list_dead_letters(limit).await?)
    }

    /// Reset a dead job to `pending` with a fresh retry budget.
    pub async fn retry(&self, job_id: &str) -> Result<Job> {
        let update = JobUpdate::new(JobState::Pending, UpdateGuard::State(JobState::Dead))
            .attempts(0)
            .error("");

        match self.store.transition(job_id, &update).await? {
            Some(job) => {
                info!(job_id, "Dead job requeued");
                Ok(job)
            }
            None => Err(JobError::NotInDeadLetter {
                id: job_id.to_string(),
            }
            .into()),
        }
    }

    /// Delete a dead job. Jobs in any other state are left alone.
    pub async fn delete(&self, job_id: &str) -> Result<bool> {
        Ok(self.store.delete_job(job_id, Some(JobState::Dead)).await?)
    }

    /// Delete every dead job. Returns how many were removed.
    pub async fn clear(&self) -> Result<u64> {
        let removed = self.store.delete_by_state(JobState::Dead).await?;
        info!(removed, "Dead letter queue cleared");
        Ok(removed)
    }

    /// Number of dead jobs.
    pub async fn stats(&self) -> Result<u64> {
        let counts = self.store.count_by_state().await?;
        Ok(counts
            .into_iter()
            .filter(|(state, _)| *state == JobState::Dead)
            .map(|(_, n)| n)
            .sum())
    }
}
