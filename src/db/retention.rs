use std::sync::Arc;

use chrono::Duration;
use rusqlite::params;
use tokio_rusqlite::Connection;

use crate::clock::Clock;
use crate::error::Result;
use crate::models::Source;

use super::repository::{fmt_ts, Repository};

/// Age-based and scoped deletion of stored items.
#[derive(Clone)]
pub struct RetentionManager {
    conn: Connection,
    clock: Arc<dyn Clock>,
}

impl RetentionManager {
    pub fn new(repo: &Repository, clock: Arc<dyn Clock>) -> Self {
        Self {
            conn: repo.conn.clone(),
            clock,
        }
    }

    /// Deletes every item fetched more than `max_age` ago.
    pub async fn purge_older_than(&self, max_age: Duration) -> Result<usize> {
        let cutoff = fmt_ts(self.clock.now() - max_age);
        let deleted = self
            .conn
            .call(move |conn| {
                let deleted =
                    conn.execute("DELETE FROM feed_items WHERE fetched_at < ?1", params![cutoff])?;
                Ok(deleted)
            })
            .await?;
        tracing::info!(deleted, max_age_hours = max_age.num_hours(), "Purged aged items");
        Ok(deleted)
    }

    /// Deletes one source's items across all of an owner's categories.
    pub async fn purge_by_source_for_owner(&self, owner_id: i64, source: Source) -> Result<usize> {
        let deleted = self
            .conn
            .call(move |conn| {
                let deleted = conn.execute(
                    r#"DELETE FROM feed_items
                       WHERE source = ?1
                         AND category_id IN (SELECT id FROM categories WHERE owner_id = ?2)"#,
                    params![source.as_str(), owner_id],
                )?;
                Ok(deleted)
            })
            .await?;
        tracing::debug!(owner_id, source = %source, deleted, "Purged owner items");
        Ok(deleted)
    }

    /// Deletes one source's items for one category. Rows written by other
    /// sources are never touched.
    pub async fn purge_by_category(&self, source: Source, category_id: i64) -> Result<usize> {
        let deleted = self
            .conn
            .call(move |conn| Ok(delete_source_rows(conn, source, category_id)?))
            .await?;
        tracing::debug!(category_id, source = %source, deleted, "Purged category items");
        Ok(deleted)
    }

    /// Drops cache entries that have already expired. Reads treat them as
    /// misses either way; this only reclaims space.
    pub async fn purge_expired_cache(&self) -> Result<usize> {
        let now = fmt_ts(self.clock.now());
        let deleted = self
            .conn
            .call(move |conn| {
                let deleted =
                    conn.execute("DELETE FROM content_cache WHERE expires_at <= ?1", params![now])?;
                Ok(deleted)
            })
            .await?;
        Ok(deleted)
    }

    /// Drops task records that finished more than `max_age` ago. Pending and
    /// running tasks are kept whatever their age.
    pub async fn purge_finished_tasks(&self, max_age: Duration) -> Result<usize> {
        let cutoff = fmt_ts(self.clock.now() - max_age);
        let deleted = self
            .conn
            .call(move |conn| {
                let deleted = conn.execute(
                    "DELETE FROM tasks WHERE status IN ('succeeded', 'failed') AND updated_at < ?1",
                    params![cutoff],
                )?;
                Ok(deleted)
            })
            .await?;
        tracing::debug!(deleted, "Purged finished tasks");
        Ok(deleted)
    }
}

pub(super) fn delete_source_rows(
    conn: &rusqlite::Connection,
    source: Source,
    category_id: i64,
) -> rusqlite::Result<usize> {
    conn.execute(
        "DELETE FROM feed_items WHERE source = ?1 AND category_id = ?2",
        params![source.as_str(), category_id],
    )
}
