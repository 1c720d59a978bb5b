use std::sync::Arc;

use serde::Deserialize;

use super::chat::{message_content, strip_json_fences, ChatProvider, ChatRequest};
use crate::error::{AppError, Result};
use crate::models::{clamp_summary, DerivedMetadata};

const SYSTEM_PROMPT: &str = "You help configure a personal news feed. Answer with JSON only.";

const MAX_HINTS: usize = 5;

#[derive(Debug, Deserialize)]
struct RawDerivatives {
    summary: String,
    #[serde(default)]
    subreddits: Vec<String>,
    #[serde(default)]
    handles: Vec<String>,
}

/// Produces the derived summary and source hints stored on a new category.
pub struct MetadataDeriver {
    chat: Arc<dyn ChatProvider>,
    model: String,
}

impl MetadataDeriver {
    pub fn new(chat: Arc<dyn ChatProvider>, model: impl Into<String>) -> Self {
        Self {
            chat,
            model: model.into(),
        }
    }

    /// Never fails: falls back to the first words of the name and no hints.
    pub async fn derive(&self, category_name: &str) -> DerivedMetadata {
        match self.try_derive(category_name).await {
            Ok(metadata) => metadata,
            Err(e) => {
                tracing::warn!(category = category_name, "Deriving category metadata failed: {}", e);
                DerivedMetadata::fallback(category_name)
            }
        }
    }

    pub async fn try_derive(&self, category_name: &str) -> Result<DerivedMetadata> {
        let request = ChatRequest {
            model: self.model.clone(),
            system: SYSTEM_PROMPT.to_string(),
            prompt: format!(
                r#"A reader wants to follow the topic "{}".
Return a JSON object with:
- "summary": the topic in at most four words
- "subreddits": up to five subreddit names (without the r/ prefix) where the topic is discussed
- "handles": up to five social media handles (without @) that post about it"#,
                category_name
            ),
            max_tokens: 300,
            temperature: 0.2,
        };
        let body = self.chat.complete(&request).await?;
        let content = message_content("derivatives", &body)?;
        let raw: RawDerivatives = serde_json::from_str(strip_json_fences(&content))
            .map_err(|e| AppError::malformed("derivatives", e.to_string()))?;

        let summary = clamp_summary(&raw.summary);
        if summary.is_empty() {
            return Err(AppError::malformed("derivatives", "empty summary"));
        }
        Ok(DerivedMetadata {
            summary,
            subreddits: clean_hints(raw.subreddits, &["/r/", "r/"]),
            handles: clean_hints(raw.handles, &["@"]),
        })
    }
}

fn clean_hints(hints: Vec<String>, prefixes: &[&str]) -> Vec<String> {
    let mut cleaned: Vec<String> = Vec::new();
    for hint in hints {
        let mut hint = hint.trim();
        for prefix in prefixes {
            if let Some(rest) = hint.strip_prefix(prefix) {
                hint = rest;
                break;
            }
        }
        if !hint.is_empty() && !hint.contains(char::is_whitespace) && !cleaned.iter().any(|h| h == hint)
        {
            cleaned.push(hint.to_string());
        }
    }
    cleaned.truncate(MAX_HINTS);
    cleaned
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai::chat::testing::{completion, ScriptedChat};

    #[tokio::test]
    async fn derives_and_cleans_hints() {
        let content = r#"{"summary": "Rust programming language news",
            "subreddits": ["r/rust", "/r/learnrust", "rust", "not valid"],
            "handles": ["@rustlang"]}"#;
        let chat = Arc::new(ScriptedChat::with(vec![Ok(completion(content))]));
        let deriver = MetadataDeriver::new(chat, "sonar");

        let meta = deriver.derive("The Rust programming language").await;
        assert_eq!(meta.summary, "Rust programming language news");
        assert_eq!(meta.subreddits, vec!["rust", "learnrust"]);
        assert_eq!(meta.handles, vec!["rustlang"]);
    }

    #[tokio::test]
    async fn clamps_summary_to_four_words() {
        let content = r#"{"summary": "one two three four five"}"#;
        let chat = Arc::new(ScriptedChat::with(vec![Ok(completion(content))]));
        let meta = MetadataDeriver::new(chat, "sonar").derive("x").await;
        assert_eq!(meta.summary, "one two three four");
        assert!(meta.subreddits.is_empty());
    }

    #[tokio::test]
    async fn falls_back_when_unavailable() {
        let chat = Arc::new(ScriptedChat::with(vec![Ok(completion("no json here"))]));
        let meta = MetadataDeriver::new(chat, "sonar")
            .derive("Artificial intelligence policy in Europe")
            .await;
        assert_eq!(meta, DerivedMetadata::fallback("Artificial intelligence policy in Europe"));
        assert_eq!(meta.summary, "Artificial intelligence policy in");
    }
}
