use std::collections::HashSet;
use std::sync::Arc;

use rusqlite::{params, Row, Transaction};
use tokio_rusqlite::Connection;

use crate::clock::Clock;
use crate::error::Result;
use crate::models::{FeedItem, RunCounts, ScoredItem, Source, WriteMode};

use super::repository::{fmt_ts, json_column, ts_column, Repository};
use super::retention::delete_source_rows;

const ITEM_COLUMNS: &str = r#"id, category_id, source, source_name, title, summary, content, url, image_url,
    engagement_score, published_at, fetched_at, is_relevant, relevance_reason, raw_payload"#;

/// Persists a category's item batches.
///
/// A write never merges: it removes the rows it supersedes and inserts the
/// fresh batch in one transaction, so a failed insert leaves the previous
/// batch in place. Nothing is held between fetch and write, so two
/// overlapping refreshes of one category are last-writer-wins.
///
/// `created`/`updated` in the returned counts split the inserted rows by
/// whether their URL was present in the superseded rows.
#[derive(Clone)]
pub struct CategoryStore {
    conn: Connection,
    clock: Arc<dyn Clock>,
}

impl CategoryStore {
    pub fn new(repo: &Repository, clock: Arc<dyn Clock>) -> Self {
        Self {
            conn: repo.conn.clone(),
            clock,
        }
    }

    pub async fn write(
        &self,
        category_id: i64,
        source: Source,
        mode: WriteMode,
        items: Vec<ScoredItem>,
    ) -> Result<RunCounts> {
        match mode {
            WriteMode::Replace => self.replace(category_id, source, items).await,
            WriteMode::SourceScoped => self.replace_from_source(category_id, source, items).await,
        }
    }

    /// Deletes every item stored under the category, whatever its source,
    /// then inserts `items`.
    pub async fn replace(
        &self,
        category_id: i64,
        source: Source,
        items: Vec<ScoredItem>,
    ) -> Result<RunCounts> {
        self.swap(category_id, source, items, WriteMode::Replace)
            .await
    }

    /// Deletes only this source's prior items for the category, then inserts
    /// `items`. Rows from other sources are left alone.
    pub async fn replace_from_source(
        &self,
        category_id: i64,
        source: Source,
        items: Vec<ScoredItem>,
    ) -> Result<RunCounts> {
        self.swap(category_id, source, items, WriteMode::SourceScoped)
            .await
    }

    async fn swap(
        &self,
        category_id: i64,
        source: Source,
        items: Vec<ScoredItem>,
        mode: WriteMode,
    ) -> Result<RunCounts> {
        let fetched_at = fmt_ts(self.clock.now());
        let rows = items
            .into_iter()
            .map(|scored| {
                let raw = scored
                    .item
                    .raw_payload
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()?;
                Ok((scored, raw))
            })
            .collect::<Result<Vec<_>>>()?;

        let counts = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;

                let previous_urls = urls_in_scope(&tx, category_id, source, mode)?;
                let deleted = match mode {
                    WriteMode::Replace => tx.execute(
                        "DELETE FROM feed_items WHERE category_id = ?1",
                        params![category_id],
                    )?,
                    WriteMode::SourceScoped => delete_source_rows(&tx, source, category_id)?,
                };

                let mut counts = RunCounts::default();
                {
                    let mut stmt = tx.prepare(
                        r#"INSERT INTO feed_items (category_id, source, source_name, title, summary, content, url,
                               image_url, engagement_score, published_at, fetched_at, is_relevant,
                               relevance_reason, raw_payload)
                           VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)"#,
                    )?;
                    for (scored, raw) in &rows {
                        let item = &scored.item;
                        stmt.execute(params![
                            category_id,
                            source.as_str(),
                            item.source_name,
                            item.title,
                            item.summary,
                            item.content,
                            item.url,
                            item.image_url,
                            item.engagement_score,
                            item.published_at.map(fmt_ts),
                            fetched_at,
                            scored.is_relevant,
                            scored.relevance_reason,
                            raw,
                        ])?;
                        match &item.url {
                            Some(url) if previous_urls.contains(url) => counts.updated += 1,
                            _ => counts.created += 1,
                        }
                    }
                }

                tx.commit()?;
                tracing::debug!(
                    category_id,
                    source = %source,
                    deleted,
                    inserted = rows.len(),
                    "Stored item batch"
                );
                Ok(counts)
            })
            .await?;
        Ok(counts)
    }

    /// Relevant items only, newest first.
    pub async fn list_by_category(
        &self,
        category_id: i64,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<FeedItem>> {
        let items = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    r#"SELECT {} FROM feed_items
                       WHERE category_id = ?1 AND is_relevant = 1
                       ORDER BY published_at DESC, fetched_at DESC, id
                       LIMIT ?2 OFFSET ?3"#,
                    ITEM_COLUMNS
                ))?;
                let items = stmt
                    .query_map(
                        params![category_id, limit as i64, offset as i64],
                        item_from_row,
                    )?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(items)
            })
            .await?;
        Ok(items)
    }

    /// Every stored item of the category, including ones judged irrelevant.
    pub async fn list_all_for_category(&self, category_id: i64) -> Result<Vec<FeedItem>> {
        let items = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM feed_items WHERE category_id = ?1 ORDER BY id",
                    ITEM_COLUMNS
                ))?;
                let items = stmt
                    .query_map(params![category_id], item_from_row)?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(items)
            })
            .await?;
        Ok(items)
    }
}

fn urls_in_scope(
    tx: &Transaction,
    category_id: i64,
    source: Source,
    mode: WriteMode,
) -> rusqlite::Result<HashSet<String>> {
    let urls = match mode {
        WriteMode::Replace => {
            let mut stmt = tx.prepare(
                "SELECT url FROM feed_items WHERE category_id = ?1 AND url IS NOT NULL",
            )?;
            let urls = stmt
                .query_map(params![category_id], |row| row.get(0))?
                .collect::<std::result::Result<HashSet<String>, _>>()?;
            urls
        }
        WriteMode::SourceScoped => {
            let mut stmt = tx.prepare(
                "SELECT url FROM feed_items WHERE category_id = ?1 AND source = ?2 AND url IS NOT NULL",
            )?;
            let urls = stmt
                .query_map(params![category_id, source.as_str()], |row| row.get(0))?
                .collect::<std::result::Result<HashSet<String>, _>>()?;
            urls
        }
    };
    Ok(urls)
}

fn item_from_row(row: &Row) -> rusqlite::Result<FeedItem> {
    let source: String = row.get(2)?;
    let source = source.parse().map_err(|_| {
        rusqlite::Error::InvalidColumnType(2, "source".to_string(), rusqlite::types::Type::Text)
    })?;

    Ok(FeedItem {
        id: row.get(0)?,
        category_id: row.get(1)?,
        source,
        source_name: row.get(3)?,
        title: row.get(4)?,
        summary: row.get(5)?,
        content: row.get(6)?,
        url: row.get(7)?,
        image_url: row.get(8)?,
        engagement_score: row.get(9)?,
        published_at: ts_column(row, 10)?,
        fetched_at: ts_column(row, 11)?.unwrap_or_default(),
        is_relevant: row.get::<_, i64>(12)? != 0,
        relevance_reason: row.get(13)?,
        raw_payload: json_column(row, 14)?,
    })
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone, Utc};

    use super::*;
    use crate::clock::testing::ManualClock;
    use crate::db::test_support::category;
    use crate::error::ErrorKind;
    use crate::models::NewItem;

    fn item(title: &str, url: &str, hours_ago: i64) -> ScoredItem {
        let mut item = NewItem::new(title, "test");
        item.url = Some(url.to_string());
        item.published_at = Some(Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap() - Duration::hours(hours_ago));
        ScoredItem::relevant(item)
    }

    async fn setup() -> (Repository, CategoryStore, i64) {
        let repo = Repository::open_in_memory().await.unwrap();
        let clock = Arc::new(ManualClock::at(Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()));
        let store = CategoryStore::new(&repo, clock);
        let id = category(&repo, 1, "Rust").await.id;
        (repo, store, id)
    }

    fn titles(items: &[FeedItem]) -> Vec<&str> {
        items.iter().map(|i| i.title.as_str()).collect()
    }

    #[tokio::test]
    async fn replace_leaves_exactly_the_new_batch() {
        let (_repo, store, id) = setup().await;
        store
            .replace(id, Source::Perplexity, vec![item("a", "u:a", 1), item("b", "u:b", 2)])
            .await
            .unwrap();
        store
            .replace_from_source(id, Source::Reddit, vec![item("r", "u:r", 3)])
            .await
            .unwrap();

        let counts = store
            .replace(id, Source::Perplexity, vec![item("b", "u:b", 2), item("c", "u:c", 0)])
            .await
            .unwrap();
        assert_eq!(counts, RunCounts { created: 1, updated: 1 });

        let all = store.list_all_for_category(id).await.unwrap();
        assert_eq!(titles(&all), vec!["b", "c"]);
    }

    #[tokio::test]
    async fn rerunning_a_refresh_does_not_accumulate() {
        let (_repo, store, id) = setup().await;
        for _ in 0..2 {
            store
                .replace(id, Source::Perplexity, vec![item("a", "u:a", 1), item("b", "u:b", 2)])
                .await
                .unwrap();
        }
        let all = store.list_all_for_category(id).await.unwrap();
        assert_eq!(all.len(), 2);
    }

    #[tokio::test]
    async fn failed_insert_keeps_the_previous_batch() {
        let (repo, store, id) = setup().await;
        store
            .replace(id, Source::Perplexity, vec![item("a", "u:a", 1), item("b", "u:b", 2)])
            .await
            .unwrap();
        store
            .replace_from_source(id, Source::Reddit, vec![item("r", "u:r", 3)])
            .await
            .unwrap();
        repo.conn
            .call(|conn| {
                conn.execute_batch(
                    r#"CREATE TRIGGER reject_poison BEFORE INSERT ON feed_items
                       WHEN NEW.title = 'poison'
                       BEGIN SELECT RAISE(ABORT, 'rejected'); END;"#,
                )?;
                Ok(())
            })
            .await
            .unwrap();

        for mode in [WriteMode::Replace, WriteMode::SourceScoped] {
            let err = store
                .write(id, Source::Perplexity, mode, vec![item("c", "u:c", 0), item("poison", "u:p", 0)])
                .await
                .unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Persistence);

            let mut all = titles(&store.list_all_for_category(id).await.unwrap())
                .into_iter()
                .map(str::to_string)
                .collect::<Vec<_>>();
            all.sort();
            assert_eq!(all, vec!["a", "b", "r"]);
        }
    }

    #[tokio::test]
    async fn source_scoped_write_keeps_other_sources() {
        let (_repo, store, id) = setup().await;
        store
            .replace(id, Source::Perplexity, vec![item("p", "u:p", 1)])
            .await
            .unwrap();
        store
            .replace_from_source(id, Source::NewsApi, vec![item("n1", "u:n1", 2)])
            .await
            .unwrap();
        let counts = store
            .write(id, Source::NewsApi, WriteMode::SourceScoped, vec![item("n2", "u:n2", 3)])
            .await
            .unwrap();
        assert_eq!(counts.created, 1);

        let mut all = titles(&store.list_all_for_category(id).await.unwrap())
            .into_iter()
            .map(str::to_string)
            .collect::<Vec<_>>();
        all.sort();
        assert_eq!(all, vec!["n2", "p"]);
    }

    #[tokio::test]
    async fn listing_is_relevant_only_and_newest_first() {
        let (_repo, store, id) = setup().await;
        let mut hidden = item("hidden", "u:h", 0);
        hidden.is_relevant = false;
        hidden.relevance_reason = Some("off topic".into());
        store
            .replace(
                id,
                Source::Perplexity,
                vec![item("old", "u:o", 10), hidden, item("new", "u:n", 1), item("mid", "u:m", 5)],
            )
            .await
            .unwrap();

        let listed = store.list_by_category(id, 10, 0).await.unwrap();
        assert_eq!(titles(&listed), vec!["new", "mid", "old"]);

        let page = store.list_by_category(id, 1, 1).await.unwrap();
        assert_eq!(titles(&page), vec!["mid"]);

        // filtered-out rows are kept for audit
        let all = store.list_all_for_category(id).await.unwrap();
        let hidden = all.iter().find(|i| i.title == "hidden").unwrap();
        assert!(!hidden.is_relevant);
        assert_eq!(hidden.relevance_reason.as_deref(), Some("off topic"));
    }

    #[tokio::test]
    async fn stores_item_metadata() {
        let (_repo, store, id) = setup().await;
        let mut scored = item("post", "https://reddit.com/r/rust/1", 1);
        scored.item.source_name = "Reddit r/rust".into();
        scored.item.engagement_score = Some(42.0);
        scored.item.raw_payload = Some(serde_json::json!({"id": "abc"}));
        store.replace(id, Source::Reddit, vec![scored]).await.unwrap();

        let stored = &store.list_by_category(id, 10, 0).await.unwrap()[0];
        assert_eq!(stored.source, Source::Reddit);
        assert_eq!(stored.source_name, "Reddit r/rust");
        assert_eq!(stored.engagement_score, Some(42.0));
        assert_eq!(stored.raw_payload.as_ref().unwrap()["id"], "abc");
        assert_eq!(stored.category_id, id);
    }
}
