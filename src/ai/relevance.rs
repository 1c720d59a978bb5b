use std::sync::Arc;

use serde::Deserialize;
use tracing::{debug, warn};

use super::chat::{message_content, strip_json_fences, ChatProvider, ChatRequest};
use crate::error::{AppError, Result};
use crate::models::{CategoryContext, NewItem, ScoredItem};

/// Reason recorded on every item when the filter could not give a verdict.
pub const FAIL_OPEN_REASON: &str = "Relevance check unavailable; kept by default";

const MAX_CONTENT_CHARS: usize = 500;

const SYSTEM_PROMPT: &str = "You are a content filtering expert. You judge whether feed items are relevant to a topic and answer with JSON only.";

/// Verdict for the item at `index` (zero-based) of the evaluated batch.
#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    pub index: usize,
    pub is_relevant: bool,
    pub reason: String,
}

#[derive(Debug, Deserialize)]
struct FilterResponse {
    evaluations: Vec<RawEvaluation>,
}

#[derive(Debug, Deserialize)]
struct RawEvaluation {
    item_number: usize,
    is_relevant: bool,
    reason: String,
}

/// Judges a batch of freshly fetched items against a category's intent in a
/// single call. Never empties a category: any failure keeps every item.
pub struct RelevanceFilter {
    chat: Arc<dyn ChatProvider>,
    model: String,
}

impl RelevanceFilter {
    pub fn new(chat: Arc<dyn ChatProvider>, model: impl Into<String>) -> Self {
        Self {
            chat,
            model: model.into(),
        }
    }

    /// Exactly one evaluation per item, in item order. Falls back to
    /// "relevant" for the whole batch when the call or its output fails.
    pub async fn evaluate(
        &self,
        category_name: &str,
        category_summary: &str,
        items: &[NewItem],
    ) -> Vec<Evaluation> {
        if items.is_empty() {
            return Vec::new();
        }
        match self
            .try_evaluate(category_name, category_summary, items)
            .await
        {
            Ok(evaluations) => evaluations,
            Err(e) => {
                warn!(category = category_name, items = items.len(), "Relevance filter failed open: {}", e);
                fail_open(items.len())
            }
        }
    }

    /// The strict call: any deviation from the expected structure is an error.
    pub async fn try_evaluate(
        &self,
        category_name: &str,
        category_summary: &str,
        items: &[NewItem],
    ) -> Result<Vec<Evaluation>> {
        let request = ChatRequest {
            model: self.model.clone(),
            system: SYSTEM_PROMPT.to_string(),
            prompt: build_prompt(category_name, category_summary, items),
            max_tokens: 2000,
            temperature: 0.0,
        };
        let body = self
            .chat
            .complete(&request)
            .await
            .map_err(|e| AppError::Relevance(e.to_string()))?;
        let content =
            message_content("relevance", &body).map_err(|e| AppError::Relevance(e.to_string()))?;
        let evaluations = parse_evaluations(&content, items.len())?;

        debug!(
            category = category_name,
            relevant = evaluations.iter().filter(|e| e.is_relevant).count(),
            total = evaluations.len(),
            "Relevance evaluated"
        );
        Ok(evaluations)
    }

    /// Attaches verdicts to a batch for the given category.
    pub async fn apply(&self, category: &CategoryContext, items: Vec<NewItem>) -> Vec<ScoredItem> {
        let evaluations = self
            .evaluate(&category.name, category.summary_or_name(), &items)
            .await;
        items
            .into_iter()
            .zip(evaluations)
            .map(|(item, evaluation)| ScoredItem {
                item,
                is_relevant: evaluation.is_relevant,
                relevance_reason: Some(evaluation.reason),
            })
            .collect()
    }
}

fn fail_open(len: usize) -> Vec<Evaluation> {
    (0..len)
        .map(|index| Evaluation {
            index,
            is_relevant: true,
            reason: FAIL_OPEN_REASON.to_string(),
        })
        .collect()
}

fn truncate_chars(text: &str, max: usize) -> String {
    if text.chars().count() > max {
        let cut: String = text.chars().take(max).collect();
        format!("{}...", cut)
    } else {
        text.to_string()
    }
}

pub fn build_prompt(category_name: &str, category_summary: &str, items: &[NewItem]) -> String {
    let items_block = items
        .iter()
        .enumerate()
        .map(|(i, item)| {
            format!(
                "Item {}:\n- Title: {}\n- Summary: {}\n- Content: {}\n- Source: {}\n",
                i + 1,
                item.title,
                item.summary.as_deref().unwrap_or(""),
                truncate_chars(item.content.as_deref().unwrap_or(""), MAX_CONTENT_CHARS),
                item.source_name,
            )
        })
        .collect::<Vec<_>>()
        .join("\n");

    format!(
        r#"Determine which feed items are relevant to a specific category.

CATEGORY INFORMATION:
- Category Name: "{name}"
- Category Summary: "{summary}"

FEED ITEMS TO EVALUATE:
{items}

For every item decide whether it would be valuable for someone interested in this category and give a short reason.
If in doubt, err on the side of relevance.

Return a JSON object with exactly {count} evaluations, one per item, in this format:
{{
    "evaluations": [
        {{"item_number": 1, "is_relevant": true, "reason": "..."}}
    ],
    "summary": {{"total_items": {count}, "relevant_items": <number>, "irrelevant_items": <number>}}
}}"#,
        name = category_name,
        summary = category_summary,
        items = items_block,
        count = items.len(),
    )
}

/// Validates the model output against the batch: every item numbered
/// `1..=expected` exactly once.
pub fn parse_evaluations(content: &str, expected: usize) -> Result<Vec<Evaluation>> {
    let parsed: FilterResponse = serde_json::from_str(strip_json_fences(content))
        .map_err(|e| AppError::Relevance(format!("invalid evaluation payload: {}", e)))?;

    if parsed.evaluations.len() != expected {
        return Err(AppError::Relevance(format!(
            "expected {} evaluations, got {}",
            expected,
            parsed.evaluations.len()
        )));
    }

    let mut slots: Vec<Option<Evaluation>> = vec![None; expected];
    for raw in parsed.evaluations {
        if raw.item_number == 0 || raw.item_number > expected {
            return Err(AppError::Relevance(format!(
                "item_number {} out of range 1..={}",
                raw.item_number, expected
            )));
        }
        let slot = &mut slots[raw.item_number - 1];
        if slot.is_some() {
            return Err(AppError::Relevance(format!(
                "item_number {} evaluated twice",
                raw.item_number
            )));
        }
        *slot = Some(Evaluation {
            index: raw.item_number - 1,
            is_relevant: raw.is_relevant,
            reason: raw.reason,
        });
    }

    Ok(slots.into_iter().flatten().collect())
}
