use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{debug, warn};

use super::{non_empty, truncate_chars, Connector, RateLimiter};
use crate::ai::{message_content, strip_json_fences, ChatProvider, ChatRequest};
use crate::clock::Clock;
use crate::db::ResponseCache;
use crate::error::Result;
use crate::models::{CategoryContext, NewItem, Source};

const SOURCE_NAME: &str = "Perplexity AI";
const MIN_FALLBACK_LINE_CHARS: usize = 20;
const FALLBACK_TITLE_CHARS: usize = 100;

const SYSTEM_PROMPT: &str = r#"You are a helpful assistant that provides concise, informative summaries of current events and trending topics. Focus on factual information and provide relevant context. Respond with JSON only, using this exact structure: {"news_items": [{"title": "Brief headline", "summary": "Detailed description", "url": "https://example.com"}]}. Each news item has a title, a summary and optionally a url."#;

/// AI-summarization connector. Responses are cached per query, model and
/// calendar day, so a category costs at most one paid call per day.
///
/// Summaries carry no publication date of their own; items are dated with
/// the time of the fetch.
pub struct PerplexityConnector {
    chat: Arc<dyn ChatProvider>,
    cache: Arc<ResponseCache>,
    clock: Arc<dyn Clock>,
    limiter: RateLimiter,
    model: String,
    max_tokens: u32,
}

impl PerplexityConnector {
    pub fn new(
        chat: Arc<dyn ChatProvider>,
        cache: Arc<ResponseCache>,
        clock: Arc<dyn Clock>,
        limiter: RateLimiter,
        model: impl Into<String>,
        max_tokens: u32,
    ) -> Self {
        Self {
            chat,
            cache,
            clock,
            limiter,
            model: model.into(),
            max_tokens,
        }
    }

    /// Asks about the derived summary when the category has one, otherwise
    /// about the name. A summary that is only the name cut short does not
    /// count.
    pub fn query_for(category: &CategoryContext) -> String {
        match category.summary.as_deref().map(str::trim) {
            Some(summary) if !summary.is_empty() && !category.name.starts_with(summary) => {
                format!("What are the latest news and developments about {}?", summary)
            }
            _ => format!("What are the latest news and developments in {}?", category.name),
        }
    }
}

#[async_trait]
impl Connector for PerplexityConnector {
    fn source(&self) -> Source {
        Source::Perplexity
    }

    async fn fetch(&self, category: &CategoryContext) -> Result<Vec<NewItem>> {
        let query = Self::query_for(category);
        let key = self.cache.key(&query, &self.model);
        let request = ChatRequest {
            model: self.model.clone(),
            system: SYSTEM_PROMPT.to_string(),
            prompt: query,
            max_tokens: self.max_tokens,
            temperature: 0.7,
        };

        let chat = &self.chat;
        let limiter = &self.limiter;
        let request = &request;
        let (body, hit) = self
            .cache
            .get_or_fetch(&key, Source::Perplexity, || async move {
                limiter.wait().await;
                chat.complete(request).await
            })
            .await?;

        let items = parse_response(&body, self.clock.now());
        debug!(category = %category.name, cached = hit, items = items.len(), "Perplexity fetch done");
        Ok(items)
    }
}

/// Items from a raw completion body, all dated `fetched_at`. A body without
/// usable content yields no items; content that is not the expected JSON
/// goes through the line heuristic.
pub fn parse_response(body: &str, fetched_at: DateTime<Utc>) -> Vec<NewItem> {
    let content = match message_content("perplexity", body) {
        Ok(content) => content,
        Err(e) => {
            warn!("Perplexity response unusable: {}", e);
            return Vec::new();
        }
    };

    let mut items = match serde_json::from_str::<Value>(strip_json_fences(&content)) {
        Ok(parsed) => items_from_json(&parsed),
        Err(e) => {
            warn!("Perplexity content is not JSON ({}), using line fallback", e);
            items_from_lines(&content)
        }
    };
    for item in &mut items {
        item.published_at = Some(fetched_at);
    }
    items
}

fn items_from_json(parsed: &Value) -> Vec<NewItem> {
    let entries = match parsed {
        Value::Object(map) => map.get("news_items").and_then(Value::as_array),
        Value::Array(entries) => Some(entries),
        _ => None,
    };
    let Some(entries) = entries else {
        warn!("Perplexity JSON has no news_items array");
        return Vec::new();
    };

    entries
        .iter()
        .filter(|entry| entry.is_object())
        .map(|entry| {
            let title = non_empty(entry.get("title").and_then(Value::as_str))
                .unwrap_or_else(|| "Untitled".to_string());
            let mut item = NewItem::new(title, SOURCE_NAME);
            item.summary = non_empty(entry.get("summary").and_then(Value::as_str));
            item.url = non_empty(entry.get("url").and_then(Value::as_str));
            item.raw_payload = Some(entry.clone());
            item
        })
        .collect()
}

fn items_from_lines(content: &str) -> Vec<NewItem> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| line.chars().count() > MIN_FALLBACK_LINE_CHARS)
        .map(|line| {
            let title = if line.chars().count() > FALLBACK_TITLE_CHARS {
                format!("{}...", truncate_chars(line, FALLBACK_TITLE_CHARS))
            } else {
                line.to_string()
            };
            let mut item = NewItem::new(title, SOURCE_NAME);
            item.summary = Some(line.to_string());
            item
        })
        .collect()
}
