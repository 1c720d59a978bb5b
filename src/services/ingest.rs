use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use crate::config::Config;
use crate::db::{CategoryStore, JobTracker, RetentionManager, TaskQueue};
use crate::error::{AppError, Result};
use crate::models::{FeedItem, IngestionJob, JobStatus, Source, TaskRecord, TaskSpec};

/// Trigger and status operations. Triggers only enqueue; a worker in this or
/// any other process sharing the database does the work.
pub struct IngestService {
    config: Arc<Config>,
    queue: TaskQueue,
    jobs: JobTracker,
    store: CategoryStore,
    retention: RetentionManager,
}

impl IngestService {
    pub fn new(
        config: Arc<Config>,
        queue: TaskQueue,
        jobs: JobTracker,
        store: CategoryStore,
        retention: RetentionManager,
    ) -> Self {
        Self {
            config,
            queue,
            jobs,
            store,
            retention,
        }
    }

    /// Refreshes one owner, or every owner when `owner_id` is `None`.
    pub async fn refresh(&self, source: Source, owner_id: Option<i64>) -> Result<Uuid> {
        self.config.check_source(source)?;
        let spec = match owner_id {
            Some(owner_id) => TaskSpec::Refresh { source, owner_id },
            None => TaskSpec::RefreshAll { source },
        };
        self.queue.enqueue(&spec).await
    }

    pub async fn refresh_all(&self, source: Source) -> Result<Uuid> {
        self.refresh(source, None).await
    }

    /// Queues an age-based purge using the configured threshold unless one
    /// is given.
    pub async fn purge(&self, max_age_hours: Option<u64>) -> Result<Uuid> {
        let max_age_hours = max_age_hours.unwrap_or(self.config.retention.max_age_hours);
        self.queue.enqueue(&TaskSpec::Purge { max_age_hours }).await
    }

    /// Immediately deletes one source's items across an owner's categories.
    pub async fn purge_owner_source(&self, owner_id: i64, source: Source) -> Result<usize> {
        self.retention.purge_by_source_for_owner(owner_id, source).await
    }

    /// Immediately deletes one source's items for one category.
    pub async fn purge_category_source(&self, source: Source, category_id: i64) -> Result<usize> {
        self.retention.purge_by_category(source, category_id).await
    }

    pub async fn task_status(&self, id: Uuid) -> Result<TaskRecord> {
        self.queue
            .get(id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("task {}", id)))
    }

    /// Polls until the task finishes or `timeout` passes.
    pub async fn wait_for(&self, id: Uuid, poll: Duration, timeout: Duration) -> Result<TaskRecord> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let task = self.task_status(id).await?;
            if task.status.is_finished() {
                return Ok(task);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(AppError::TimeLimit(timeout));
            }
            tokio::time::sleep(poll).await;
        }
    }

    pub async fn jobs(
        &self,
        limit: usize,
        kind: Option<String>,
        status: Option<JobStatus>,
    ) -> Result<Vec<IngestionJob>> {
        self.jobs.list(limit, kind, status).await
    }

    pub async fn feed(&self, category_id: i64, limit: usize, offset: usize) -> Result<Vec<FeedItem>> {
        self.store.list_by_category(category_id, limit, offset).await
    }
}
