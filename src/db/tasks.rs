use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rusqlite::{params, OptionalExtension, Row};
use tokio::sync::Notify;
use tokio_rusqlite::Connection;
use uuid::Uuid;

use crate::error::Result;
use crate::models::{TaskRecord, TaskSpec, TaskStatus};

use super::repository::{fmt_ts, json_column, ts_column, Repository};

const TASK_COLUMNS: &str = "id, spec, status, result, error, created_at, updated_at";

/// Durable work queue backed by the `tasks` table.
///
/// Any process sharing the database can enqueue and claim. Workers in the
/// process that enqueued are woken at once; others find the row on their
/// next poll.
#[derive(Clone)]
pub struct TaskQueue {
    conn: Connection,
    notify: Arc<Notify>,
}

impl TaskQueue {
    pub fn new(repo: &Repository) -> Self {
        Self {
            conn: repo.conn.clone(),
            notify: Arc::new(Notify::new()),
        }
    }

    pub async fn enqueue(&self, spec: &TaskSpec) -> Result<Uuid> {
        let id = Uuid::new_v4();
        let body = serde_json::to_string(spec)?;
        let now = fmt_ts(Utc::now());
        let task_id = id.to_string();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO tasks (id, spec, status, created_at, updated_at) VALUES (?1, ?2, 'pending', ?3, ?3)",
                    params![task_id, body, now],
                )?;
                Ok(())
            })
            .await?;
        tracing::info!(task_id = %id, task = %spec.name(), "Task enqueued");
        self.notify.notify_one();
        Ok(id)
    }

    /// Atomically moves the oldest pending task to `running` and returns it.
    pub async fn claim_next(&self) -> Result<Option<TaskRecord>> {
        let now = fmt_ts(Utc::now());
        let task = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    r#"UPDATE tasks SET status = 'running', updated_at = ?1
                       WHERE id = (
                           SELECT id FROM tasks WHERE status = 'pending'
                           ORDER BY created_at, rowid LIMIT 1
                       )
                       RETURNING {}"#,
                    TASK_COLUMNS
                ))?;
                let task = stmt.query_row(params![now], task_from_row).optional()?;
                Ok(task)
            })
            .await?;
        Ok(task)
    }

    pub async fn succeed(&self, id: Uuid, result: serde_json::Value) -> Result<()> {
        self.finish(id, TaskStatus::Succeeded, Some(result.to_string()), None)
            .await
    }

    pub async fn fail(&self, id: Uuid, error: &str) -> Result<()> {
        self.finish(id, TaskStatus::Failed, None, Some(error.to_string()))
            .await
    }

    async fn finish(
        &self,
        id: Uuid,
        status: TaskStatus,
        result: Option<String>,
        error: Option<String>,
    ) -> Result<()> {
        let now = fmt_ts(Utc::now());
        let task_id = id.to_string();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "UPDATE tasks SET status = ?2, result = ?3, error = ?4, updated_at = ?5 WHERE id = ?1",
                    params![task_id, status.as_str(), result, error, now],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    pub async fn get(&self, id: Uuid) -> Result<Option<TaskRecord>> {
        let task_id = id.to_string();
        let task = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM tasks WHERE id = ?1",
                    TASK_COLUMNS
                ))?;
                let task = stmt.query_row(params![task_id], task_from_row).optional()?;
                Ok(task)
            })
            .await?;
        Ok(task)
    }

    /// Puts tasks left `running` by a process that died back in the queue.
    /// Only call this before any worker of the current process has started.
    pub async fn requeue_interrupted(&self) -> Result<usize> {
        let now = fmt_ts(Utc::now());
        let requeued = self
            .conn
            .call(move |conn| {
                let n = conn.execute(
                    "UPDATE tasks SET status = 'pending', updated_at = ?1 WHERE status = 'running'",
                    params![now],
                )?;
                Ok(n)
            })
            .await?;
        if requeued > 0 {
            tracing::warn!(requeued, "Requeued interrupted tasks");
        }
        Ok(requeued)
    }

    /// Waits until a task is enqueued in this process or `poll` elapses.
    pub async fn wait_for_work(&self, poll: Duration) {
        let _ = tokio::time::timeout(poll, self.notify.notified()).await;
    }
}

fn task_from_row(row: &Row) -> rusqlite::Result<TaskRecord> {
    let id: String = row.get(0)?;
    let id = Uuid::parse_str(&id).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })?;
    let spec: String = row.get(1)?;
    let spec = serde_json::from_str(&spec).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(1, rusqlite::types::Type::Text, Box::new(e))
    })?;
    let status: String = row.get(2)?;
    let status = status.parse().map_err(|_| {
        rusqlite::Error::InvalidColumnType(2, "status".to_string(), rusqlite::types::Type::Text)
    })?;

    Ok(TaskRecord {
        id,
        spec,
        status,
        result: json_column(row, 3)?,
        error: row.get(4)?,
        created_at: ts_column(row, 5)?.unwrap_or_default(),
        updated_at: ts_column(row, 6)?.unwrap_or_default(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Source;

    async fn queue() -> TaskQueue {
        let repo = Repository::open_in_memory().await.unwrap();
        TaskQueue::new(&repo)
    }

    #[tokio::test]
    async fn claims_in_fifo_order_once() {
        let queue = queue().await;
        let first = queue
            .enqueue(&TaskSpec::RefreshAll { source: Source::Perplexity })
            .await
            .unwrap();
        let second = queue
            .enqueue(&TaskSpec::Purge { max_age_hours: 24 })
            .await
            .unwrap();

        let claimed = queue.claim_next().await.unwrap().unwrap();
        assert_eq!(claimed.id, first);
        assert_eq!(claimed.status, TaskStatus::Running);
        assert_eq!(claimed.spec, TaskSpec::RefreshAll { source: Source::Perplexity });

        assert_eq!(queue.claim_next().await.unwrap().unwrap().id, second);
        assert!(queue.claim_next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn records_outcomes() {
        let queue = queue().await;
        let ok = queue
            .enqueue(&TaskSpec::Refresh { source: Source::Reddit, owner_id: 3 })
            .await
            .unwrap();
        let bad = queue
            .enqueue(&TaskSpec::Refresh { source: Source::NewsApi, owner_id: 3 })
            .await
            .unwrap();

        assert_eq!(queue.get(ok).await.unwrap().unwrap().status, TaskStatus::Pending);

        queue
            .succeed(ok, serde_json::json!({"job_id": 1, "created": 4}))
            .await
            .unwrap();
        queue.fail(bad, "provider down").await.unwrap();

        let ok = queue.get(ok).await.unwrap().unwrap();
        assert_eq!(ok.status, TaskStatus::Succeeded);
        assert_eq!(ok.result.unwrap()["created"], 4);

        let bad = queue.get(bad).await.unwrap().unwrap();
        assert_eq!(bad.status, TaskStatus::Failed);
        assert_eq!(bad.error.as_deref(), Some("provider down"));

        assert!(queue.get(Uuid::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn requeues_running_tasks() {
        let queue = queue().await;
        let id = queue
            .enqueue(&TaskSpec::Purge { max_age_hours: 24 })
            .await
            .unwrap();
        queue.claim_next().await.unwrap();
        assert_eq!(queue.requeue_interrupted().await.unwrap(), 1);
        assert_eq!(queue.claim_next().await.unwrap().unwrap().id, id);
    }

    #[tokio::test]
    async fn enqueue_wakes_a_waiting_worker() {
        let queue = queue().await;
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move {
                let started = std::time::Instant::now();
                queue.wait_for_work(Duration::from_secs(30)).await;
                started.elapsed()
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue
            .enqueue(&TaskSpec::Purge { max_age_hours: 1 })
            .await
            .unwrap();
        let waited = waiter.await.unwrap();
        assert!(waited < Duration::from_secs(30));
    }
}
