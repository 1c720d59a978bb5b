use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::Source;

/// A normalized item produced by a connector, before it is persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewItem {
    pub title: String,
    pub summary: Option<String>,
    pub content: Option<String>,
    pub url: Option<String>,
    pub image_url: Option<String>,
    /// Display origin, e.g. "Reddit r/rust" or "NewsAPI - BBC News".
    pub source_name: String,
    pub engagement_score: Option<f64>,
    pub published_at: Option<DateTime<Utc>>,
    pub raw_payload: Option<serde_json::Value>,
}

impl NewItem {
    pub fn new(title: impl Into<String>, source_name: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            summary: None,
            content: None,
            url: None,
            image_url: None,
            source_name: source_name.into(),
            engagement_score: None,
            published_at: None,
            raw_payload: None,
        }
    }
}

/// An item ready to be written: a connector item plus its relevance verdict.
#[derive(Debug, Clone)]
pub struct ScoredItem {
    pub item: NewItem,
    pub is_relevant: bool,
    pub relevance_reason: Option<String>,
}

impl ScoredItem {
    pub fn relevant(item: NewItem) -> Self {
        Self {
            item,
            is_relevant: true,
            relevance_reason: None,
        }
    }
}

/// A persisted feed item.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedItem {
    pub id: i64,
    pub category_id: i64,
    pub source: Source,
    pub source_name: String,
    pub title: String,
    pub summary: Option<String>,
    pub content: Option<String>,
    pub url: Option<String>,
    pub image_url: Option<String>,
    pub engagement_score: Option<f64>,
    pub published_at: Option<DateTime<Utc>>,
    pub fetched_at: DateTime<Utc>,
    pub is_relevant: bool,
    pub relevance_reason: Option<String>,
    pub raw_payload: Option<serde_json::Value>,
}
