use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};

pub const MAX_CATEGORY_NAME_CHARS: usize = 140;
pub const MAX_ACTIVE_CATEGORIES: usize = 5;
pub const MAX_SUMMARY_WORDS: usize = 4;

/// A user-defined topic that drives personalized fetches.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Category {
    pub id: i64,
    pub owner_id: i64,
    pub name: String,
    pub derived_summary: Option<String>,
    pub derived_subreddits: Vec<String>,
    pub derived_handles: Vec<String>,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewCategory {
    pub owner_id: i64,
    pub name: String,
    pub metadata: DerivedMetadata,
}

/// Output of the derivatives call made once when a category is created.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DerivedMetadata {
    pub summary: String,
    #[serde(default)]
    pub subreddits: Vec<String>,
    #[serde(default)]
    pub handles: Vec<String>,
}

impl DerivedMetadata {
    /// Metadata used when the derivatives call is unavailable.
    pub fn fallback(name: &str) -> Self {
        Self {
            summary: clamp_summary(name),
            subreddits: Vec::new(),
            handles: Vec::new(),
        }
    }
}

/// Keep at most four words.
pub fn clamp_summary(text: &str) -> String {
    text.split_whitespace()
        .take(MAX_SUMMARY_WORDS)
        .collect::<Vec<_>>()
        .join(" ")
}

pub fn validate_name(name: &str) -> Result<String> {
    let name = name.trim();
    if name.is_empty() {
        return Err(AppError::Validation("category name must not be empty".into()));
    }
    if name.chars().count() > MAX_CATEGORY_NAME_CHARS {
        return Err(AppError::Validation(format!(
            "category name must be {} characters or less",
            MAX_CATEGORY_NAME_CHARS
        )));
    }
    Ok(name.to_string())
}

/// What a connector needs to know about the category it is fetching for.
#[derive(Debug, Clone)]
pub struct CategoryContext {
    pub category_id: i64,
    pub owner_id: i64,
    pub name: String,
    pub summary: Option<String>,
    pub subreddits: Vec<String>,
    pub handles: Vec<String>,
}

impl From<&Category> for CategoryContext {
    fn from(category: &Category) -> Self {
        Self {
            category_id: category.id,
            owner_id: category.owner_id,
            name: category.name.clone(),
            summary: category.derived_summary.clone(),
            subreddits: category.derived_subreddits.clone(),
            handles: category.derived_handles.clone(),
        }
    }
}

impl CategoryContext {
    /// The derived summary if present, otherwise the name.
    pub fn summary_or_name(&self) -> &str {
        self.summary
            .as_deref()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or(&self.name)
    }
}
