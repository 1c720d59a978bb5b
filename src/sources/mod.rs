mod newsapi;
mod perplexity;
mod rate_limit;
mod reddit;

use async_trait::async_trait;

use crate::error::Result;
use crate::models::{CategoryContext, NewItem, Source};

pub use newsapi::NewsApiConnector;
pub use perplexity::PerplexityConnector;
pub use rate_limit::RateLimiter;
pub use reddit::RedditConnector;

/// Per-source adapter: fetches raw content for one category and normalizes it.
#[async_trait]
pub trait Connector: Send + Sync {
    fn source(&self) -> Source;

    /// Whether this connector has anything to fetch for the category.
    fn applies_to(&self, _category: &CategoryContext) -> bool {
        true
    }

    /// Network and timeout errors are returned for the caller's retry
    /// policy. Malformed payloads degrade to an empty or partial list.
    async fn fetch(&self, category: &CategoryContext) -> Result<Vec<NewItem>>;
}

pub(crate) fn non_empty(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

pub(crate) fn truncate_chars(text: &str, max: usize) -> String {
    text.chars().take(max).collect()
}

#[cfg(test)]
pub(crate) fn context(name: &str, subreddits: &[&str]) -> CategoryContext {
    CategoryContext {
        category_id: 1,
        owner_id: 1,
        name: name.to_string(),
        summary: None,
        subreddits: subreddits.iter().map(|s| s.to_string()).collect(),
        handles: Vec::new(),
    }
}
