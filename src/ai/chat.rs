use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};

/// One chat-completion request: a system instruction and a user prompt.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub model: String,
    pub system: String,
    pub prompt: String,
    pub max_tokens: u32,
    pub temperature: f32,
}

/// A chat-completion backend. Returns the raw response body so callers can
/// cache it verbatim; use [`message_content`] to get at the text.
#[async_trait]
pub trait ChatProvider: Send + Sync {
    async fn complete(&self, request: &ChatRequest) -> Result<String>;
}

#[derive(Debug, Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    messages: Vec<Message<'a>>,
    max_tokens: u32,
    temperature: f32,
}

#[derive(Debug, Serialize)]
struct Message<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

/// OpenAI-style chat-completions client (Perplexity speaks this format).
pub struct ChatClient {
    client: Client,
    endpoint: String,
    api_key: String,
    provider: &'static str,
}

impl ChatClient {
    pub fn new(provider: &'static str, endpoint: &str, api_key: String) -> Result<Self> {
        let client = Client::builder().timeout(Duration::from_secs(30)).build()?;
        Ok(Self {
            client,
            endpoint: endpoint.to_string(),
            api_key,
            provider,
        })
    }
}

#[async_trait]
impl ChatProvider for ChatClient {
    async fn complete(&self, request: &ChatRequest) -> Result<String> {
        let body = CompletionRequest {
            model: &request.model,
            messages: vec![
                Message {
                    role: "system",
                    content: &request.system,
                },
                Message {
                    role: "user",
                    content: &request.prompt,
                },
            ],
            max_tokens: request.max_tokens,
            temperature: request.temperature,
        };

        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            return Err(AppError::Provider {
                provider: self.provider.to_string(),
                status: status.as_u16(),
                message: text,
            });
        }

        tracing::debug!(provider = self.provider, bytes = text.len(), "Chat completion received");
        Ok(text)
    }
}

/// Pulls the first choice's message text out of a raw completion body.
pub fn message_content(provider: &str, body: &str) -> Result<String> {
    let response: CompletionResponse = serde_json::from_str(body)
        .map_err(|e| AppError::malformed(provider, format!("completion body: {}", e)))?;
    response
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.message.content)
        .filter(|c| !c.trim().is_empty())
        .ok_or_else(|| AppError::malformed(provider, "completion has no message content"))
}

/// Strips ```json ... ``` or ``` ... ``` fences models like to wrap JSON in.
pub fn strip_json_fences(text: &str) -> &str {
    let text = text.trim();
    let inner = text
        .strip_prefix("```json")
        .or_else(|| text.strip_prefix("```"));
    match inner {
        Some(stripped) => stripped
            .trim_start()
            .strip_suffix("```")
            .map(str::trim)
            .unwrap_or_else(|| stripped.trim()),
        None => text,
    }
}


#[cfg(test)]
mod tests {
    use wiremock::matchers::{header, method};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    fn request() -> ChatRequest {
        ChatRequest {
            model: "sonar".into(),
            system: "be brief".into(),
            prompt: "news?".into(),
            max_tokens: 100,
            temperature: 0.7,
        }
    }

    #[test]
    fn strips_fences() {
        assert_eq!(strip_json_fences("```json\n{\"a\": 1}\n```"), "{\"a\": 1}");
        assert_eq!(strip_json_fences("```\n[1]\n```"), "[1]");
        assert_eq!(strip_json_fences("  {\"a\": 1} "), "{\"a\": 1}");
    }

    #[test]
    fn extracts_message_content() {
        let body = testing::completion("hello");
        assert_eq!(message_content("perplexity", &body).unwrap(), "hello");

        let err = message_content("perplexity", r#"{"choices": []}"#).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Malformed);
        assert!(message_content("perplexity", "not json").is_err());
    }

    #[tokio::test]
    async fn posts_bearer_request_and_returns_raw_body() {
        let server = MockServer::start().await;
        let body = testing::completion("[]");
        Mock::given(method("POST"))
            .and(header("authorization", "Bearer pplx-test"))
            .respond_with(ResponseTemplate::new(200).set_body_string(body.clone()))
            .expect(1)
            .mount(&server)
            .await;

        let client = ChatClient::new("perplexity", &server.uri(), "pplx-test".into()).unwrap();
        assert_eq!(client.complete(&request()).await.unwrap(), body);
    }

    #[tokio::test]
    async fn server_errors_are_transient() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503).set_body_string("overloaded"))
            .mount(&server)
            .await;

        let client = ChatClient::new("perplexity", &server.uri(), "k".into()).unwrap();
        let err = client.complete(&request()).await.unwrap_err();
        assert!(err.is_retryable());
        assert!(err.to_string().contains("503"));
    }
}
