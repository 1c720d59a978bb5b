use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use tracing::{debug, warn};

use super::{non_empty, Connector, RateLimiter};
use crate::config::RedditConfig;
use crate::error::{AppError, Result};
use crate::models::{CategoryContext, NewItem, Source};

#[derive(Debug, Deserialize)]
struct Listing {
    data: ListingData,
}

#[derive(Debug, Deserialize)]
struct ListingData {
    #[serde(default)]
    children: Vec<Thing>,
}

#[derive(Debug, Deserialize)]
struct Thing {
    data: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct Post {
    id: String,
    #[serde(default)]
    title: String,
    #[serde(default)]
    selftext: String,
    #[serde(default)]
    permalink: String,
    #[serde(default)]
    score: f64,
    created_utc: Option<f64>,
    thumbnail: Option<String>,
}

/// Link-aggregator connector: the top posts of each hinted subreddit for a
/// time window, each with its top comment. Not cached.
pub struct RedditConnector {
    client: Client,
    base_url: String,
    limit: u32,
    time_filter: String,
    fetch_top_comment: bool,
    limiter: RateLimiter,
}

impl RedditConnector {
    pub fn new(config: &RedditConfig) -> Result<Self> {
        let mut headers = HeaderMap::new();
        let agent = HeaderValue::from_str(&config.user_agent)
            .map_err(|e| AppError::Config(format!("invalid reddit user_agent: {}", e)))?;
        headers.insert(USER_AGENT, agent);

        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .default_headers(headers)
            .build()?;

        Ok(Self {
            client,
            base_url: config.settings.base_url.trim_end_matches('/').to_string(),
            limit: config.posts_per_subreddit,
            time_filter: config.time_filter.clone(),
            fetch_top_comment: config.fetch_top_comment,
            limiter: RateLimiter::new(config.settings.request_interval()),
        })
    }

    /// `Ok(None)` for responses that mean "nothing here" (private, banned or
    /// missing subreddit); rate limits and server errors are errors.
    async fn get(&self, url: &str) -> Result<Option<String>> {
        self.limiter.wait().await;
        let response = self.client.get(url).send().await?;
        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            return Err(AppError::Provider {
                provider: "reddit".to_string(),
                status: status.as_u16(),
                message: response.text().await.unwrap_or_default(),
            });
        }
        if !status.is_success() {
            debug!(url, status = status.as_u16(), "Reddit request skipped");
            return Ok(None);
        }
        Ok(Some(response.text().await?))
    }

    async fn top_posts(&self, subreddit: &str) -> Result<Vec<(Post, serde_json::Value)>> {
        let url = format!(
            "{}/r/{}/top.json?limit={}&t={}",
            self.base_url,
            urlencoding::encode(subreddit),
            self.limit,
            urlencoding::encode(&self.time_filter)
        );
        let Some(body) = self.get(&url).await? else {
            return Ok(Vec::new());
        };
        let listing: Listing = match serde_json::from_str(&body) {
            Ok(listing) => listing,
            Err(e) => {
                warn!(subreddit, "Malformed Reddit listing: {}", e);
                return Ok(Vec::new());
            }
        };

        Ok(listing
            .data
            .children
            .into_iter()
            .filter_map(|thing| match serde_json::from_value::<Post>(thing.data.clone()) {
                Ok(post) => Some((post, thing.data)),
                Err(e) => {
                    debug!(subreddit, "Skipping malformed post: {}", e);
                    None
                }
            })
            .collect())
    }

    /// Item-level: any failure here just leaves the comment out.
    async fn top_comment(&self, subreddit: &str, post_id: &str) -> Option<String> {
        let url = format!(
            "{}/r/{}/comments/{}.json?limit=1",
            self.base_url,
            urlencoding::encode(subreddit),
            urlencoding::encode(post_id)
        );
        let body = match self.get(&url).await {
            Ok(Some(body)) => body,
            Ok(None) => return None,
            Err(e) => {
                debug!(subreddit, post_id, "Top comment unavailable: {}", e);
                return None;
            }
        };
        let listings: Vec<Listing> = serde_json::from_str(&body).ok()?;
        let comment = listings.get(1)?.data.children.first()?;
        non_empty(comment.data.get("body").and_then(|b| b.as_str()))
    }
}

#[async_trait]
impl Connector for RedditConnector {
    fn source(&self) -> Source {
        Source::Reddit
    }

    fn applies_to(&self, category: &CategoryContext) -> bool {
        !category.subreddits.is_empty()
    }

    async fn fetch(&self, category: &CategoryContext) -> Result<Vec<NewItem>> {
        let mut items = Vec::new();
        for subreddit in &category.subreddits {
            let posts = self.top_posts(subreddit).await?;
            for (post, raw) in posts {
                let content = if self.fetch_top_comment {
                    self.top_comment(subreddit, &post.id).await
                } else {
                    None
                };
                items.push(to_item(subreddit, post, content, raw));
            }
        }
        debug!(category = %category.name, items = items.len(), "Reddit fetch done");
        Ok(items)
    }
}

fn to_item(subreddit: &str, post: Post, content: Option<String>, raw: serde_json::Value) -> NewItem {
    let title = non_empty(Some(post.title.as_str())).unwrap_or_else(|| "Untitled".to_string());
    let mut item = NewItem::new(title, format!("Reddit r/{}", subreddit));
    item.summary = non_empty(Some(post.selftext.as_str()));
    item.content = content;
    item.url = Some(format!("https://reddit.com{}", post.permalink));
    item.image_url = post
        .thumbnail
        .filter(|t| t.starts_with("http://") || t.starts_with("https://"));
    item.engagement_score = Some(post.score);
    item.published_at = post
        .created_utc
        .and_then(|ts| DateTime::<Utc>::from_timestamp(ts as i64, 0));
    item.raw_payload = Some(raw);
    item
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::sources::context;

    fn listing(posts: serde_json::Value) -> serde_json::Value {
        json!({"kind": "Listing", "data": {"children": posts}})
    }

    fn post(id: &str, title: &str, score: i64) -> serde_json::Value {
        json!({"kind": "t3", "data": {
            "id": id,
            "title": title,
            "selftext": "",
            "permalink": format!("/r/rust/comments/{}/slug/", id),
            "score": score,
            "created_utc": 1767225600.0,
            "thumbnail": "self"
        }})
    }

    fn connector(server: &MockServer, fetch_top_comment: bool) -> RedditConnector {
        let mut config = RedditConfig::default();
        config.settings.base_url = server.uri();
        config.settings.rate_limit_per_minute = 0;
        config.fetch_top_comment = fetch_top_comment;
        RedditConnector::new(&config).unwrap()
    }

    #[tokio::test]
    async fn maps_top_posts_with_comments() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/r/rust/top.json"))
            .and(query_param("limit", "3"))
            .and(query_param("t", "day"))
            .respond_with(ResponseTemplate::new(200).set_body_json(listing(json!([
                post("a1", "Rust 2.0 announced", 900),
                post("b2", "Async traits stabilized", 450)
            ]))))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/r/rust/comments/a1.json"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                listing(json!([post("a1", "Rust 2.0 announced", 900)])),
                listing(json!([{"kind": "t1", "data": {"body": "Finally!"}}]))
            ])))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/r/rust/comments/b2.json"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let items = connector(&server, true)
            .fetch(&context("Rust", &["rust"]))
            .await
            .unwrap();

        assert_eq!(items.len(), 2);
        assert_eq!(items[0].title, "Rust 2.0 announced");
        assert_eq!(items[0].source_name, "Reddit r/rust");
        assert_eq!(items[0].engagement_score, Some(900.0));
        assert_eq!(items[0].content.as_deref(), Some("Finally!"));
        assert_eq!(
            items[0].url.as_deref(),
            Some("https://reddit.com/r/rust/comments/a1/slug/")
        );
        assert!(items[0].published_at.is_some());
        assert!(items[0].image_url.is_none());
        assert!(items[1].content.is_none());
    }

    #[tokio::test]
    async fn missing_subreddit_is_skipped() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/r/gone/top.json"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/r/rust/top.json"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(listing(json!([post("c3", "Hi", 1)]))),
            )
            .mount(&server)
            .await;

        let items = connector(&server, false)
            .fetch(&context("Rust", &["gone", "rust"]))
            .await
            .unwrap();
        assert_eq!(items.len(), 1);
    }

    #[tokio::test]
    async fn rate_limit_is_retryable() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(429))
            .mount(&server)
            .await;

        let err = connector(&server, false)
            .fetch(&context("Rust", &["rust"]))
            .await
            .unwrap_err();
        assert!(err.is_retryable());
    }

    #[test]
    fn applies_only_with_subreddit_hints() {
        let connector = RedditConnector::new(&RedditConfig::default()).unwrap();
        assert!(!connector.applies_to(&context("AI policy", &[])));
        assert!(connector.applies_to(&context("Rust", &["rust"])));
    }
}
