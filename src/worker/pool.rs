//! Worker pool: starts loops, tracks them, and drains them on stop.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::RwLock;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::Settings;
use crate::store::JobStore;
use crate::worker::executor::CommandExecutor;
use crate::worker::worker::{WorkerDeps, WorkerHandle, WorkerInfo, WorkerLoop};

/// Default time `stop()` waits for in-flight jobs.
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_millis(30_000);

/// Longest pause between drain checks.
const DRAIN_POLL: Duration = Duration::from_secs(1);

type Registry = Arc<RwLock<HashMap<String, Arc<WorkerHandle>>>>;

/// Owns the live worker registry.
pub struct WorkerPool {
    deps: WorkerDeps,
    workers: Registry,
    drain_timeout: Duration,
}

impl WorkerPool {
    pub fn new(store: Arc<dyn JobStore>, settings: Arc<Settings>) -> Self {
        Self {
            deps: WorkerDeps::new(store, settings),
            workers: Arc::new(RwLock::new(HashMap::new())),
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
        }
    }

    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    pub fn with_executor(mut self, executor: CommandExecutor) -> Self {
        self.deps.executor = executor;
        self
    }

    /// Spawn `count` workers and return their ids.
    pub async fn start(&self, count: usize) -> Vec<String> {
        info!(count, "Starting workers");
        let mut ids = Vec::with_capacity(count);

        for index in 0..count {
            let id = worker_id(index);
            let handle = Arc::new(WorkerHandle::new(id.clone()));
            self.workers
                .write()
                .await
                .insert(id.clone(), Arc::clone(&handle));

            let worker = WorkerLoop::new(Arc::clone(&handle), self.deps.clone());
            let task = tokio::spawn(worker.run());

            // Supervisor: a panicking loop is logged and dropped from the registry.
            let workers = Arc::clone(&self.workers);
            tokio::spawn(async move {
                if let Err(e) = task.await {
                    handle.mark_stopped();
                    if e.is_panic() {
                        error!(worker_id = %handle.id(), "Worker crashed");
                    }
                    workers.write().await.remove(handle.id());
                }
            });

            ids.push(id);
        }

        info!(count, "Workers active");
        ids
    }

    /// Signal every worker, wait for in-flight jobs up to the drain timeout,
    /// then release whatever is still held.
    pub async fn stop(&self) {
        let handles: Vec<Arc<WorkerHandle>> = self.workers.read().await.values().cloned().collect();
        if handles.is_empty() {
            info!("No workers running");
            return;
        }

        info!(count = handles.len(), "Stopping workers");
        for handle in &handles {
            handle.stop();
        }

        let started = tokio::time::Instant::now();
        loop {
            let active = handles.iter().filter(|h| h.is_running()).count();
            if active == 0 {
                break;
            }
            let elapsed = started.elapsed();
            if elapsed >= self.drain_timeout {
                warn!(active, "Drain timeout reached");
                break;
            }
            info!(active, "Waiting for active jobs");
            tokio::time::sleep(DRAIN_POLL.min(self.drain_timeout - elapsed)).await;
        }

        for handle in &handles {
            let Some(job_id) = handle.current_job().await else {
                continue;
            };
            match self.deps.store.release_lease(&job_id, handle.id()).await {
                Ok(true) => warn!(worker_id = %handle.id(), job_id = %job_id, "Released lease of unfinished job"),
                Ok(false) => info!(worker_id = %handle.id(), job_id = %job_id, "Lease already settled or taken over"),
                Err(e) => error!(worker_id = %handle.id(), job_id = %job_id, error = %e, "Failed to release lease"),
            }
        }

        let mut workers = self.workers.write().await;
        for handle in &handles {
            workers.remove(handle.id());
        }
        info!("All workers stopped");
    }

    /// Snapshot of live workers, ordered by id.
    pub async fn info(&self) -> Vec<WorkerInfo> {
        let handles: Vec<Arc<WorkerHandle>> = self.workers.read().await.values().cloned().collect();
        let mut infos = Vec::with_capacity(handles.len());
        for handle in handles {
            infos.push(handle.info().await);
        }
        infos.sort_by(|a, b| a.id.cmp(&b.id));
        infos
    }

    /// Number of live workers.
    pub async fn len(&self) -> usize {
        self.workers.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

/// `worker_<millis>_<index>_<8 hex>`, unique across concurrent `start` calls.
fn worker_id(index: usize) -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!(
        "worker_{}_{}_{}",
        Utc::now().timestamp_millis(),
        index,
        &suffix[..8]
    )
}
