use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, OptionalExtension, Row};
use tokio_rusqlite::Connection;

use crate::error::Result;
use crate::models::{Category, NewCategory, MAX_ACTIVE_CATEGORIES};

use super::schema::SCHEMA;

/// Handle to the relational store. Cheap to clone; every clone talks to the
/// same background connection.
#[derive(Clone)]
pub struct Repository {
    pub(crate) conn: Connection,
}

/// Outcome of inserting a category under the per-owner cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CategoryInsert {
    Inserted(i64),
    LimitReached,
    Duplicate,
}

const CATEGORY_COLUMNS: &str = "id, owner_id, name, derived_summary, derived_subreddits, derived_handles, active, created_at";

impl Repository {
    pub async fn new(db_path: &str) -> Result<Self> {
        let conn = Connection::open(db_path).await?;
        Self::init(conn).await
    }

    pub async fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().await?;
        Self::init(conn).await
    }

    async fn init(conn: Connection) -> Result<Self> {
        conn.call(|conn| {
            conn.execute_batch(SCHEMA)?;
            Ok(())
        })
        .await?;

        Ok(Self { conn })
    }

    // Category operations

    /// Inserts a category unless the owner already has the maximum number of
    /// active categories or an active one with the same name. The check and
    /// the insert run in one transaction.
    pub async fn insert_category(&self, category: NewCategory) -> Result<CategoryInsert> {
        let now = fmt_ts(Utc::now());
        let subreddits = serde_json::to_string(&category.metadata.subreddits)?;
        let handles = serde_json::to_string(&category.metadata.handles)?;

        let outcome = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                let active: i64 = tx.query_row(
                    "SELECT COUNT(*) FROM categories WHERE owner_id = ?1 AND active = 1",
                    params![category.owner_id],
                    |row| row.get(0),
                )?;
                if active >= MAX_ACTIVE_CATEGORIES as i64 {
                    return Ok(CategoryInsert::LimitReached);
                }
                let exists: i64 = tx.query_row(
                    "SELECT COUNT(*) FROM categories WHERE owner_id = ?1 AND name = ?2 AND active = 1",
                    params![category.owner_id, category.name],
                    |row| row.get(0),
                )?;
                if exists > 0 {
                    return Ok(CategoryInsert::Duplicate);
                }
                tx.execute(
                    r#"INSERT INTO categories (owner_id, name, derived_summary, derived_subreddits, derived_handles, active, created_at)
                       VALUES (?1, ?2, ?3, ?4, ?5, 1, ?6)"#,
                    params![
                        category.owner_id,
                        category.name,
                        category.metadata.summary,
                        subreddits,
                        handles,
                        now,
                    ],
                )?;
                let id = tx.last_insert_rowid();
                tx.commit()?;
                Ok(CategoryInsert::Inserted(id))
            })
            .await?;
        Ok(outcome)
    }

    pub async fn get_category(&self, id: i64) -> Result<Option<Category>> {
        let category = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM categories WHERE id = ?1",
                    CATEGORY_COLUMNS
                ))?;
                let category = stmt.query_row(params![id], category_from_row).optional()?;
                Ok(category)
            })
            .await?;
        Ok(category)
    }

    pub async fn categories_for_owner(
        &self,
        owner_id: i64,
        active_only: bool,
    ) -> Result<Vec<Category>> {
        let categories = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM categories WHERE owner_id = ?1 AND (?2 = 0 OR active = 1) ORDER BY id",
                    CATEGORY_COLUMNS
                ))?;
                let categories = stmt
                    .query_map(params![owner_id, active_only], category_from_row)?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(categories)
            })
            .await?;
        Ok(categories)
    }

    /// Every active category, ordered by owner then id.
    pub async fn active_categories(&self) -> Result<Vec<Category>> {
        let categories = self
            .conn
            .call(|conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM categories WHERE active = 1 ORDER BY owner_id, id",
                    CATEGORY_COLUMNS
                ))?;
                let categories = stmt
                    .query_map([], category_from_row)?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(categories)
            })
            .await?;
        Ok(categories)
    }

    /// Returns false when no category has that id.
    pub async fn deactivate_category(&self, id: i64) -> Result<bool> {
        let changed = self
            .conn
            .call(move |conn| {
                let changed = conn.execute(
                    "UPDATE categories SET active = 0 WHERE id = ?1",
                    params![id],
                )?;
                Ok(changed)
            })
            .await?;
        Ok(changed > 0)
    }

    /// Resolves a string reference to one of the owner's categories: an exact
    /// name match wins over a derived-summary match, an active category over
    /// an inactive one, and the lowest id after that.
    pub async fn resolve_category(
        &self,
        owner_id: i64,
        reference: &str,
    ) -> Result<Option<Category>> {
        let reference = reference.trim().to_string();
        let category = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    r#"SELECT {} FROM categories
                       WHERE owner_id = ?1 AND (name = ?2 OR derived_summary = ?2)
                       ORDER BY CASE WHEN name = ?2 THEN 0 ELSE 1 END, active DESC, id
                       LIMIT 1"#,
                    CATEGORY_COLUMNS
                ))?;
                let category = stmt
                    .query_row(params![owner_id, reference], category_from_row)
                    .optional()?;
                Ok(category)
            })
            .await?;
        Ok(category)
    }
}

/// Timestamps are stored as fixed-width RFC 3339 UTC strings so that they
/// compare correctly as text.
pub(crate) fn fmt_ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_datetime(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    // SQLite datetime format (e.g., "2026-01-11 12:34:56")
    if let Ok(naive) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return Some(naive.and_utc());
    }
    None
}

pub(crate) fn ts_column(row: &Row, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    Ok(row
        .get::<_, Option<String>>(idx)?
        .and_then(|s| parse_datetime(&s)))
}

pub(crate) fn json_column(row: &Row, idx: usize) -> rusqlite::Result<Option<serde_json::Value>> {
    Ok(row
        .get::<_, Option<String>>(idx)?
        .and_then(|s| serde_json::from_str(&s).ok()))
}

fn string_list(raw: Option<String>) -> Vec<String> {
    raw.and_then(|s| serde_json::from_str(&s).ok())
        .unwrap_or_default()
}

fn category_from_row(row: &Row) -> rusqlite::Result<Category> {
    Ok(Category {
        id: row.get(0)?,
        owner_id: row.get(1)?,
        name: row.get(2)?,
        derived_summary: row.get(3)?,
        derived_subreddits: string_list(row.get(4)?),
        derived_handles: string_list(row.get(5)?),
        active: row.get::<_, i64>(6)? != 0,
        created_at: ts_column(row, 7)?.unwrap_or_else(Utc::now),
    })
}
