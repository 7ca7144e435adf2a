//! Per-worker polling loop.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{RwLock, watch};
use tracing::{error, info, warn};

use crate::config::Settings;
use crate::error::Result;
use crate::jobs::RetryManager;
use crate::store::JobStore;
use crate::worker::executor::CommandExecutor;

/// Shared dependencies for worker loops.
#[derive(Clone)]
pub struct WorkerDeps {
    pub store: Arc<dyn JobStore>,
    pub settings: Arc<Settings>,
    pub retry: RetryManager,
    pub executor: CommandExecutor,
}

impl WorkerDeps {
    pub fn new(store: Arc<dyn JobStore>, settings: Arc<Settings>) -> Self {
        let retry = RetryManager::new(Arc::clone(&store), Arc::clone(&settings));
        Self {
            store,
            settings,
            retry,
            executor: CommandExecutor::new(),
        }
    }
}

/// Read-only snapshot of a live worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkerInfo {
    pub id: String,
    /// Job being executed, `None` when idle.
    pub current_job: Option<String>,
    pub processed_count: u64,
    pub started_at: DateTime<Utc>,
}

/// Pool-side view of a worker: stop signal plus live status.
pub struct WorkerHandle {
    id: String,
    stop_tx: watch::Sender<bool>,
    current_job: RwLock<Option<String>>,
    processed: AtomicU64,
    running: AtomicBool,
    started_at: DateTime<Utc>,
}

impl WorkerHandle {
    pub fn new(id: impl Into<String>) -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            id: id.into(),
            stop_tx,
            current_job: RwLock::new(None),
            processed: AtomicU64::new(0),
            running: AtomicBool::new(true),
            started_at: Utc::now(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Ask the loop to exit after its current cycle.
    pub fn stop(&self) {
        self.stop_tx.send_replace(true);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub(crate) fn mark_stopped(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub async fn current_job(&self) -> Option<String> {
        self.current_job.read().await.clone()
    }

    async fn set_current_job(&self, job_id: Option<String>) {
        *self.current_job.write().await = job_id;
    }

    pub fn processed_count(&self) -> u64 {
        self.processed.load(Ordering::SeqCst)
    }

    pub async fn info(&self) -> WorkerInfo {
        WorkerInfo {
            id: self.id.clone(),
            current_job: self.current_job().await,
            processed_count: self.processed_count(),
            started_at: self.started_at,
        }
    }

    fn subscribe(&self) -> watch::Receiver<bool> {
        self.stop_tx.subscribe()
    }
}

/// A worker's claim → execute → record loop.
pub struct WorkerLoop {
    handle: Arc<WorkerHandle>,
    deps: WorkerDeps,
    stop_rx: watch::Receiver<bool>,
}

impl WorkerLoop {
    pub fn new(handle: Arc<WorkerHandle>, deps: WorkerDeps) -> Self {
        let stop_rx = handle.subscribe();
        Self {
            handle,
            deps,
            stop_rx,
        }
    }

    fn worker_id(&self) -> &str {
        self.handle.id()
    }

    fn stop_requested(&self) -> bool {
        *self.stop_rx.borrow()
    }

    /// Run until stopped. Errors inside a cycle are logged and followed by a
    /// poll-interval pause; they never end the loop.
    pub async fn run(mut self) {
        let poll_interval = self.deps.settings.poll_interval().await;
        info!(worker_id = %self.worker_id(), ?poll_interval, "Worker started");

        while !self.stop_requested() {
            match self.run_cycle().await {
                Ok(true) => {}
                Ok(false) => self.idle(poll_interval).await,
                Err(e) => {
                    error!(worker_id = %self.worker_id(), error = %e, "Worker cycle failed");
                    self.handle.set_current_job(None).await;
                    self.idle(poll_interval).await;
                }
            }
        }

        self.handle.mark_stopped();
        info!(
            worker_id = %self.worker_id(),
            processed = self.handle.processed_count(),
            "Worker stopped"
        );
    }

    /// Sleep for `interval`, waking early on stop.
    async fn idle(&mut self, interval: Duration) {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = self.stop_rx.changed() => {}
        }
    }

    /// One cycle. `Ok(false)` when there was nothing to claim.
    pub async fn run_cycle(&self) -> Result<bool> {
        let worker_id = self.worker_id();
        let lease = self.deps.settings.lock_timeout().await;

        let Some(job) = self.deps.store.claim_next(worker_id, lease, Utc::now()).await? else {
            return Ok(false);
        };

        self.handle.set_current_job(Some(job.id.clone())).await;
        info!(worker_id, job_id = %job.id, command = %job.command, "Executing job");

        let timeout = self.deps.settings.command_timeout().await;
        match self.deps.executor.run(&job.command, timeout).await {
            Ok(output) => {
                self.deps.retry.complete(&job, worker_id, &output).await?;
            }
            Err(e) => {
                warn!(worker_id, job_id = %job.id, error = %e, "Job failed");
                self.deps
                    .retry
                    .handle_failure(&job, worker_id, &e.to_string())
                    .await?;
            }
        }

        self.handle.processed.fetch_add(1, Ordering::SeqCst);
        self.handle.set_current_job(None).await;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use async_trait::async_trait;

    use crate::config::{Defaults, keys};
    use crate::error::DatabaseError;
    use crate::jobs::{Job, JobState};
    use crate::store::{JobUpdate, LibSqlBackend};

    async fn setup() -> (Arc<LibSqlBackend>, WorkerDeps) {
        let db = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let settings = Arc::new(Settings::with_defaults(db.clone(), Defaults::default()));
        (db.clone(), WorkerDeps::new(db, settings))
    }

    #[tokio::test]
    async fn cycle_completes_job() {
        let (db, deps) = setup().await;
        db.insert_job(&Job::new("job_a", "echo hello", 3)).await.unwrap();

        let handle = Arc::new(WorkerHandle::new("w1"));
        let worker = WorkerLoop::new(handle.clone(), deps);
        assert!(worker.run_cycle().await.unwrap());

        let job = db.get_job("job_a").await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Completed);
        assert_eq!(job.output, "hello");
        assert_eq!(handle.processed_count(), 1);
        assert!(handle.current_job().await.is_none());
    }

    #[tokio::test]
    async fn cycle_with_nothing_to_do() {
        let (_db, deps) = setup().await;
        let handle = Arc::new(WorkerHandle::new("w1"));
        let worker = WorkerLoop::new(handle.clone(), deps);
        assert!(!worker.run_cycle().await.unwrap());
        assert_eq!(handle.processed_count(), 0);
    }

    #[tokio::test]
    async fn failure_counts_as_processed() {
        let (db, deps) = setup().await;
        db.insert_job(&Job::new("job_a", "fail", 3)).await.unwrap();

        let handle = Arc::new(WorkerHandle::new("w1"));
        let worker = WorkerLoop::new(handle.clone(), deps);
        assert!(worker.run_cycle().await.unwrap());

        let job = db.get_job("job_a").await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Failed);
        assert_eq!(job.attempts, 1);
        assert_eq!(job.error, "Simulated job failure for testing retries/DLQ");
        assert_eq!(handle.processed_count(), 1);
    }

    #[tokio::test]
    async fn stop_ends_idle_loop() {
        let (_db, deps) = setup().await;
        deps.settings
            .set(keys::WORKER_POLL_INTERVAL, serde_json::json!(60_000))
            .await;

        let handle = Arc::new(WorkerHandle::new("w1"));
        let task = tokio::spawn(WorkerLoop::new(handle.clone(), deps).run());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(handle.is_running());

        handle.stop();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
        assert!(!handle.is_running());
    }

    /// Delegates to libSQL but fails the first `failures` claims.
    struct FlakyStore {
        inner: Arc<LibSqlBackend>,
        failures: AtomicU64,
    }

    #[async_trait]
    impl JobStore for FlakyStore {
        async fn insert_job(&self, job: &Job) -> std::result::Result<(), DatabaseError> {
            self.inner.insert_job(job).await
        }
        async fn claim_next(
            &self,
            worker_id: &str,
            lease_timeout: Duration,
            now: DateTime<Utc>,
        ) -> std::result::Result<Option<Job>, DatabaseError> {
            let left = self.failures.load(Ordering::SeqCst);
            if left > 0 {
                self.failures.store(left - 1, Ordering::SeqCst);
                return Err(DatabaseError::Query("database is locked".into()));
            }
            self.inner.claim_next(worker_id, lease_timeout, now).await
        }
        async fn transition(
            &self,
            job_id: &str,
            update: &JobUpdate,
        ) -> std::result::Result<Option<Job>, DatabaseError> {
            self.inner.transition(job_id, update).await
        }
        async fn release_lease(
            &self,
            job_id: &str,
            worker_id: &str,
        ) -> std::result::Result<bool, DatabaseError> {
            self.inner.release_lease(job_id, worker_id).await
        }
        async fn get_job(&self, job_id: &str) -> std::result::Result<Option<Job>, DatabaseError> {
            self.inner.get_job(job_id).await
        }
        async fn list_jobs(
            &self,
            state: Option<JobState>,
            limit: usize,
        ) -> std::result::Result<Vec<Job>, DatabaseError> {
            self.inner.list_jobs(state, limit).await
        }
        async fn list_dead_letters(&self, limit: usize) -> std::result::Result<Vec<Job>, DatabaseError> {
            self.inner.list_dead_letters(limit).await
        }
        async fn list_retryable(
            &self,
            lease_timeout: Duration,
            now: DateTime<Utc>,
            limit: usize,
        ) -> std::result::Result<Vec<Job>, DatabaseError> {
            self.inner.list_retryable(lease_timeout, now, limit).await
        }
        async fn delete_job(
            &self,
            job_id: &str,
            only_state: Option<JobState>,
        ) -> std::result::Result<bool, DatabaseError> {
            self.inner.delete_job(job_id, only_state).await
        }
        async fn delete_by_state(&self, state: JobState) -> std::result::Result<u64, DatabaseError> {
            self.inner.delete_by_state(state).await
        }
        async fn count_by_state(&self) -> std::result::Result<Vec<(JobState, u64)>, DatabaseError> {
            self.inner.count_by_state().await
        }
    }

    #[tokio::test]
    async fn store_errors_do_not_end_loop() {
        let db = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let settings = Arc::new(Settings::with_defaults(db.clone(), Defaults::default()));
        settings
            .set(keys::WORKER_POLL_INTERVAL, serde_json::json!(20))
            .await;
        let store = Arc::new(FlakyStore {
            inner: db.clone(),
            failures: AtomicU64::new(2),
        });
        db.insert_job(&Job::new("job_a", "echo survived", 3)).await.unwrap();

        let handle = Arc::new(WorkerHandle::new("w1"));
        let deps = WorkerDeps::new(store.clone(), settings);
        let task = tokio::spawn(WorkerLoop::new(handle.clone(), deps).run());

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let job = db.get_job("job_a").await.unwrap().unwrap();
            if job.state == JobState::Completed {
                assert_eq!(job.output, "survived");
                break;
            }
            assert!(tokio::time::Instant::now() < deadline, "job never completed");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        assert_eq!(store.failures.load(Ordering::SeqCst), 0);
        assert!(handle.is_running());
        assert_eq!(handle.processed_count(), 1);

        handle.stop();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn info_snapshot() {
        let handle = WorkerHandle::new("w9");
        let info = handle.info().await;
        assert_eq!(info.id, "w9");
        assert!(info.current_job.is_none());
        assert_eq!(info.processed_count, 0);
    }
}
