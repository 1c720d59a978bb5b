use std::sync::OnceLock;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::Regex;
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};
use url::Url;

use super::{non_empty, truncate_chars, Connector, RateLimiter};
use crate::config::NewsApiConfig;
use crate::error::{AppError, Result};
use crate::models::{CategoryContext, NewItem, Source};

const MAX_TITLE_CHARS: usize = 500;

/// Article fields that may carry an image, in order of preference.
const IMAGE_FIELDS: [&str; 2] = ["urlToImage", "url"];

#[derive(Debug, Deserialize)]
struct SearchResponse {
    status: String,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    articles: Vec<Value>,
}

/// Headline-search connector: searches articles by category name. Not cached.
pub struct NewsApiConnector {
    client: Client,
    base_url: String,
    api_key: String,
    page_size: u32,
    language: String,
    sort_by: String,
    limiter: RateLimiter,
}

impl NewsApiConnector {
    pub fn new(config: &NewsApiConfig, api_key: String) -> Result<Self> {
        let client = Client::builder().timeout(Duration::from_secs(30)).build()?;
        Ok(Self {
            client,
            base_url: config.settings.base_url.trim_end_matches('/').to_string(),
            api_key,
            page_size: config.page_size,
            language: config.language.clone(),
            sort_by: config.sort_by.clone(),
            limiter: RateLimiter::new(config.settings.request_interval()),
        })
    }

    fn search_url(&self, query: &str) -> Result<Url> {
        let mut url = Url::parse(&format!("{}/everything", self.base_url))
            .map_err(|e| AppError::Config(format!("invalid newsapi base_url: {}", e)))?;
        url.query_pairs_mut()
            .append_pair("q", query)
            .append_pair("language", &self.language)
            .append_pair("sortBy", &self.sort_by)
            .append_pair("pageSize", &self.page_size.to_string());
        Ok(url)
    }
}

#[async_trait]
impl Connector for NewsApiConnector {
    fn source(&self) -> Source {
        Source::NewsApi
    }

    async fn fetch(&self, category: &CategoryContext) -> Result<Vec<NewItem>> {
        let url = self.search_url(&category.name)?;

        self.limiter.wait().await;
        let response = self
            .client
            .get(url)
            .header("X-Api-Key", &self.api_key)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(AppError::Provider {
                provider: "newsapi".to_string(),
                status: status.as_u16(),
                message: body,
            });
        }

        let parsed: SearchResponse = match serde_json::from_str(&body) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!(category = %category.name, "Malformed NewsAPI response: {}", e);
                return Ok(Vec::new());
            }
        };
        if parsed.status != "ok" {
            warn!(
                category = %category.name,
                "NewsAPI returned status '{}': {}",
                parsed.status,
                parsed.message.unwrap_or_default()
            );
            return Ok(Vec::new());
        }

        let items: Vec<NewItem> = parsed.articles.into_iter().filter_map(to_item).collect();
        debug!(category = %category.name, items = items.len(), "NewsAPI fetch done");
        Ok(items)
    }
}

fn to_item(article: Value) -> Option<NewItem> {
    let title = non_empty(article.get("title").and_then(Value::as_str))?;
    // removed articles come back as placeholders
    if title == "[Removed]" {
        return None;
    }

    let source = article
        .get("source")
        .and_then(|s| s.get("name"))
        .and_then(Value::as_str)
        .unwrap_or("Unknown");

    let mut item = NewItem::new(
        truncate_chars(&title, MAX_TITLE_CHARS),
        format!("NewsAPI - {}", source),
    );
    item.summary = non_empty(article.get("description").and_then(Value::as_str)).map(|d| clean_text(&d));
    item.content = non_empty(article.get("content").and_then(Value::as_str)).map(|c| clean_text(&c));
    item.url = non_empty(article.get("url").and_then(Value::as_str));
    item.image_url = extract_image_url(&article);
    item.published_at = article
        .get("publishedAt")
        .and_then(Value::as_str)
        .and_then(|p| DateTime::parse_from_rfc3339(p).ok())
        .map(|dt| dt.with_timezone(&Utc));
    item.raw_payload = Some(article);
    Some(item)
}

/// First populated candidate field, taken as is.
pub fn extract_image_url(article: &Value) -> Option<String> {
    IMAGE_FIELDS
        .iter()
        .find_map(|field| non_empty(article.get(*field).and_then(Value::as_str)))
}

fn chars_marker() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\s*…?\s*\[\+\d+ chars\]\s*$").ok())
        .as_ref()
}

/// Plain text without markup or the truncation marker NewsAPI appends.
pub fn clean_text(text: &str) -> String {
    let text = if text.contains('<') {
        match html2text::from_read(text.as_bytes(), 10_000) {
            Ok(plain) => plain,
            Err(e) => {
                debug!("Failed to convert HTML to text: {}", e);
                text.to_string()
            }
        }
    } else {
        text.to_string()
    };
    match chars_marker() {
        Some(re) => re.replace(text.trim(), "").trim().to_string(),
        None => text.trim().to_string(),
    }
}
