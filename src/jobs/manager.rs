//! Job creation and lookups.

use std::sync::Arc;

use tracing::info;

use crate::config::Settings;
use crate::error::{DatabaseError, JobError, Result};
use crate::jobs::model::{Job, JobStats, NewJob, generate_job_id};
use crate::jobs::state::JobState;
use crate::store::JobStore;

/// Default page size for listings.
pub const DEFAULT_LIST_LIMIT: usize = 100;

/// Front door for creating and inspecting jobs.
#[derive(Clone)]
pub struct JobManager {
    store: Arc<dyn JobStore>,
    settings: Arc<Settings>,
}

impl JobManager {
    pub fn new(store: Arc<dyn JobStore>, settings: Arc<Settings>) -> Self {
        Self { store, settings }
    }

    /// Validate and enqueue a job in `pending`.
    pub async fn create(&self, request: NewJob) -> Result<Job> {
        let command = request.command.trim();
        if command.is_empty() {
            return Err(JobError::InvalidInput("command is required".into()).into());
        }
        let id = match request.id {
            Some(id) if id.trim().is_empty() => {
                return Err(JobError::InvalidInput("id must not be empty".into()).into());
            }
            Some(id) => id,
            None => generate_job_id(),
        };

        let max_retries = match request.max_retries {
            Some(n) => n,
            None => self.settings.max_retries().await,
        };
        let job = Job::new(id, command, max_retries).with_priority(request.priority.unwrap_or(0));

        self.store.insert_job(&job).await.map_err(|e| match e {
            DatabaseError::Constraint(_) => {
                JobError::InvalidInput(format!("job {} already exists", job.id)).into()
            }
            other => crate::error::Error::from(other),
        })?;

        info!(job_id = %job.id, command = %job.command, priority = job.priority, "Job created");
        Ok(job)
    }

    pub async fn get(&self, job_id: &str) -> Result<Job> {
        self.store
            .get_job(job_id)
            .await?
            .ok_or_else(|| {
                JobError::NotFound {
                    id: job_id.to_string(),
                }
                .into()
            })
    }

    /// Jobs newest-created first.
    pub async fn list(&self, state: Option<JobState>, limit: usize) -> Result<Vec<Job>> {
        Ok(self.store.list_jobs(state, limit).await?)
    }

    pub async fn delete(&self, job_id: &str) -> Result<bool> {
        let deleted = self.store.delete_job(job_id, None).await?;
        if deleted {
            info!(job_id, "Job deleted");
        }
        Ok(deleted)
    }

    pub async fn stats(&self) -> Result<JobStats> {
        Ok(JobStats::from_counts(self.store.count_by_state().await?))
    }
}
