use chrono::Utc;
use rusqlite::{params, OptionalExtension, Row};
use tokio_rusqlite::Connection;

use crate::error::{AppError, Result};
use crate::models::{IngestionJob, JobStatus, RunCounts};

use super::repository::{fmt_ts, json_column, ts_column, Repository};

const JOB_COLUMNS: &str = "id, kind, status, parameters, started_at, completed_at, items_created, items_updated, error, created_at";

/// Records the lifecycle of ingestion runs. Status only ever moves forward;
/// a job in a terminal status rejects further transitions.
#[derive(Clone)]
pub struct JobTracker {
    conn: Connection,
}

impl JobTracker {
    pub fn new(repo: &Repository) -> Self {
        Self {
            conn: repo.conn.clone(),
        }
    }

    pub async fn create(&self, kind: &str, parameters: Option<serde_json::Value>) -> Result<i64> {
        let kind = kind.to_string();
        let parameters = parameters.map(|p| p.to_string());
        let now = fmt_ts(Utc::now());
        let id = self
            .conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO ingestion_jobs (kind, status, parameters, created_at) VALUES (?1, 'pending', ?2, ?3)",
                    params![kind, parameters, now],
                )?;
                Ok(conn.last_insert_rowid())
            })
            .await?;
        tracing::debug!(job_id = id, "Created ingestion job");
        Ok(id)
    }

    pub async fn start(&self, id: i64) -> Result<()> {
        self.transition(id, JobStatus::Running, None, None).await
    }

    pub async fn complete(&self, id: i64, counts: RunCounts) -> Result<()> {
        self.transition(id, JobStatus::Completed, Some(counts), None)
            .await
    }

    pub async fn fail(&self, id: i64, error: &str) -> Result<()> {
        self.transition(id, JobStatus::Failed, None, Some(error.to_string()))
            .await
    }

    async fn transition(
        &self,
        id: i64,
        next: JobStatus,
        counts: Option<RunCounts>,
        error: Option<String>,
    ) -> Result<()> {
        let now = fmt_ts(Utc::now());
        let allowed = JobStatus::predecessors(next)
            .iter()
            .map(|s| format!("'{}'", s.as_str()))
            .collect::<Vec<_>>()
            .join(", ");
        let stamp_column = match next {
            JobStatus::Running => "started_at",
            _ => "completed_at",
        };
        let sql = format!(
            r#"UPDATE ingestion_jobs
               SET status = ?2, {} = ?3,
                   items_created = COALESCE(?4, items_created),
                   items_updated = COALESCE(?5, items_updated),
                   error = COALESCE(?6, error)
               WHERE id = ?1 AND status IN ({})"#,
            stamp_column, allowed
        );

        let current = self
            .conn
            .call(move |conn| {
                let changed = conn.execute(
                    &sql,
                    params![
                        id,
                        next.as_str(),
                        now,
                        counts.map(|c| c.created),
                        counts.map(|c| c.updated),
                        error,
                    ],
                )?;
                if changed > 0 {
                    return Ok(None);
                }
                let current = conn
                    .query_row(
                        "SELECT status FROM ingestion_jobs WHERE id = ?1",
                        params![id],
                        |row| row.get::<_, String>(0),
                    )
                    .optional()?;
                Ok(Some(current))
            })
            .await?;

        match current {
            None => {
                tracing::debug!(job_id = id, status = %next, "Job transitioned");
                Ok(())
            }
            Some(None) => Err(AppError::NotFound(format!("job {}", id))),
            Some(Some(from)) => Err(AppError::InvalidTransition {
                job_id: id,
                from,
                to: next.as_str().to_string(),
            }),
        }
    }

    pub async fn get(&self, id: i64) -> Result<Option<IngestionJob>> {
        let job = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM ingestion_jobs WHERE id = ?1",
                    JOB_COLUMNS
                ))?;
                let job = stmt.query_row(params![id], job_from_row).optional()?;
                Ok(job)
            })
            .await?;
        Ok(job)
    }

    /// Most recent jobs first, optionally filtered by kind and status.
    pub async fn list(
        &self,
        limit: usize,
        kind: Option<String>,
        status: Option<JobStatus>,
    ) -> Result<Vec<IngestionJob>> {
        let status = status.map(|s| s.as_str());
        let jobs = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    r#"SELECT {} FROM ingestion_jobs
                       WHERE (?1 IS NULL OR kind = ?1) AND (?2 IS NULL OR status = ?2)
                       ORDER BY created_at DESC, id DESC
                       LIMIT ?3"#,
                    JOB_COLUMNS
                ))?;
                let jobs = stmt
                    .query_map(params![kind, status, limit as i64], job_from_row)?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(jobs)
            })
            .await?;
        Ok(jobs)
    }
}

fn job_from_row(row: &Row) -> rusqlite::Result<IngestionJob> {
    let status: String = row.get(2)?;
    let status = status.parse().map_err(|_| {
        rusqlite::Error::InvalidColumnType(2, "status".to_string(), rusqlite::types::Type::Text)
    })?;

    Ok(IngestionJob {
        id: row.get(0)?,
        kind: row.get(1)?,
        status,
        parameters: json_column(row, 3)?,
        started_at: ts_column(row, 4)?,
        completed_at: ts_column(row, 5)?,
        items_created: row.get(6)?,
        items_updated: row.get(7)?,
        error: row.get(8)?,
        created_at: ts_column(row, 9)?.unwrap_or_default(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn tracker() -> JobTracker {
        let repo = Repository::open_in_memory().await.unwrap();
        JobTracker::new(&repo)
    }

    #[tokio::test]
    async fn runs_through_the_lifecycle() {
        let jobs = tracker().await;
        let id = jobs
            .create("perplexity_all_users", Some(serde_json::json!({"source": "perplexity"})))
            .await
            .unwrap();
        let job = jobs.get(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert!(job.started_at.is_none());

        jobs.start(id).await.unwrap();
        jobs.complete(id, RunCounts { created: 5, updated: 1 }).await.unwrap();

        let job = jobs.get(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.items_created, 5);
        assert_eq!(job.items_updated, 1);
        assert!(job.started_at.is_some());
        assert!(job.completed_at.is_some());
        assert_eq!(job.parameters.unwrap()["source"], "perplexity");
    }

    #[tokio::test]
    async fn terminal_jobs_reject_transitions() {
        let jobs = tracker().await;
        let id = jobs.create("reddit", None).await.unwrap();
        jobs.start(id).await.unwrap();
        jobs.fail(id, "no credential").await.unwrap();

        let err = jobs.complete(id, RunCounts::default()).await.unwrap_err();
        assert!(matches!(err, AppError::InvalidTransition { ref from, .. } if from == "failed"));
        assert!(jobs.start(id).await.is_err());

        let job = jobs.get(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error.as_deref(), Some("no credential"));
    }

    #[tokio::test]
    async fn pending_job_can_fail_but_not_complete() {
        let jobs = tracker().await;
        let id = jobs.create("newsapi", None).await.unwrap();
        assert!(jobs.complete(id, RunCounts::default()).await.is_err());
        jobs.fail(id, "source 'newsapi' is not active").await.unwrap();

        assert!(matches!(
            jobs.start(9999).await.unwrap_err(),
            AppError::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn lists_newest_first_with_filters() {
        let jobs = tracker().await;
        let a = jobs.create("perplexity_all_users", None).await.unwrap();
        let b = jobs.create("reddit", None).await.unwrap();
        let c = jobs.create("perplexity_all_users", None).await.unwrap();
        jobs.start(c).await.unwrap();

        let all = jobs.list(10, None, None).await.unwrap();
        assert_eq!(all.iter().map(|j| j.id).collect::<Vec<_>>(), vec![c, b, a]);

        let kind = jobs
            .list(10, Some("perplexity_all_users".into()), None)
            .await
            .unwrap();
        assert_eq!(kind.len(), 2);

        let running = jobs.list(10, None, Some(JobStatus::Running)).await.unwrap();
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].id, c);

        assert_eq!(jobs.list(1, None, None).await.unwrap().len(), 1);
    }
}
