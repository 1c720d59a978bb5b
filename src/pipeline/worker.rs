use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

use super::limits::TimeLimits;
use super::orchestrator::Orchestrator;
use crate::db::{RetentionManager, TaskQueue};
use crate::error::Result;
use crate::models::{TaskRecord, TaskSpec};

/// Claims tasks from the queue and runs them. Each worker handles one task
/// at a time; a pool of N workers bounds task concurrency to N.
pub struct Worker {
    queue: TaskQueue,
    orchestrator: Arc<Orchestrator>,
    retention: RetentionManager,
    limits: TimeLimits,
    task_retention: chrono::Duration,
}

impl Worker {
    pub fn new(
        queue: TaskQueue,
        orchestrator: Arc<Orchestrator>,
        retention: RetentionManager,
        limits: TimeLimits,
        task_retention: chrono::Duration,
    ) -> Self {
        Self {
            queue,
            orchestrator,
            retention,
            limits,
            task_retention,
        }
    }

    /// Claims and runs one task. Returns `false` when the queue was empty.
    pub async fn run_next(&self) -> Result<bool> {
        let Some(task) = self.queue.claim_next().await? else {
            return Ok(false);
        };
        self.run(task).await?;
        Ok(true)
    }

    async fn run(&self, task: TaskRecord) -> Result<()> {
        let name = task.spec.name();
        info!(task_id = %task.id, task = %name, "Task started");

        match self.execute(&task.spec).await {
            Ok(result) => {
                info!(task_id = %task.id, task = %name, "Task succeeded");
                self.queue.succeed(task.id, result).await
            }
            Err(e) => {
                error!(task_id = %task.id, task = %name, "Task failed: {}", e);
                self.queue.fail(task.id, &e.to_string()).await
            }
        }
    }

    async fn execute(&self, spec: &TaskSpec) -> Result<serde_json::Value> {
        match spec {
            TaskSpec::Refresh { source, owner_id } => {
                let summary = self.orchestrator.refresh_owner(*source, *owner_id).await?;
                Ok(serde_json::to_value(summary)?)
            }
            TaskSpec::RefreshAll { source } => {
                let summary = self.orchestrator.refresh_all(*source).await?;
                Ok(serde_json::to_value(summary)?)
            }
            TaskSpec::Purge { max_age_hours } => {
                let max_age = chrono::Duration::hours(*max_age_hours as i64);
                self.limits
                    .run("purge", async {
                        let items = self.retention.purge_older_than(max_age).await?;
                        let cache_entries = self.retention.purge_expired_cache().await?;
                        let tasks = self.retention.purge_finished_tasks(self.task_retention).await?;
                        Ok(json!({
                            "items_deleted": items,
                            "cache_entries_deleted": cache_entries,
                            "tasks_deleted": tasks,
                        }))
                    })
                    .await
            }
        }
    }
}

/// Runs `workers` copies of the claim loop until shutdown is signalled.
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
    shutdown: watch::Sender<bool>,
}

impl WorkerPool {
    pub fn start(worker: Arc<Worker>, workers: usize, poll: Duration) -> Self {
        let (shutdown, rx) = watch::channel(false);
        let handles = (0..workers.max(1))
            .map(|n| {
                let worker = worker.clone();
                let mut rx = rx.clone();
                tokio::spawn(async move {
                    info!(worker = n, "Worker started");
                    loop {
                        if *rx.borrow() {
                            break;
                        }
                        match worker.run_next().await {
                            Ok(true) => continue,
                            Ok(false) => {}
                            Err(e) => error!(worker = n, "Queue error: {}", e),
                        }
                        tokio::select! {
                            _ = worker.queue.wait_for_work(poll) => {}
                            _ = rx.changed() => {}
                        }
                    }
                    info!(worker = n, "Worker stopped");
                })
            })
            .collect();
        Self { handles, shutdown }
    }

    /// Lets in-flight tasks finish, then stops every worker.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for handle in self.handles {
            if let Err(e) = handle.await {
                error!("Worker panicked: {}", e);
            }
        }
    }
}
