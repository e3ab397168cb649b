//! `summarize` step: LLM summary of the aggregated conversation.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::StepError;
use crate::llm::{ChatMessage, CompletionRequest, LlmProvider};
use crate::pipeline::Step;
use crate::store::{Database, MessageEntity, OutputKind};

pub const NAME: &str = "summarize";

/// Conversation text beyond this many characters is cut before prompting.
const MAX_PROMPT_CHARS: usize = 48_000;

const SYSTEM_PROMPT: &str = "You summarize email conversations. \
Respond with a single JSON object and nothing else, shaped exactly as: \
{\"summary\": string, \"key_points\": [string], \"action_items\": [string]}. \
The summary is two to four sentences. Use empty arrays when there is nothing to list. \
Placeholders such as [EMAIL] or [PHONE] stand for redacted data; keep them as they are.";

/// Validated model output, persisted as the `summary` output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Summary {
    pub summary: String,
    pub key_points: Vec<String>,
    pub action_items: Vec<String>,
}

/// Parse and validate a model response.
///
/// Accepts a bare JSON object or one wrapped in a fenced code block.
pub fn parse_summary(response: &str) -> Result<Summary, StepError> {
    let json = extract_json_object(response);
    let mut parsed: Summary = serde_json::from_str(&json)
        .map_err(|e| StepError::InvalidOutput(format!("summary is not valid JSON: {e}")))?;

    parsed.summary = parsed.summary.trim().to_string();
    if parsed.summary.is_empty() {
        return Err(StepError::InvalidOutput("summary text is empty".to_string()));
    }
    parsed.key_points = normalize_list(parsed.key_points);
    parsed.action_items = normalize_list(parsed.action_items);
    Ok(parsed)
}

fn normalize_list(items: Vec<String>) -> Vec<String> {
    items
        .into_iter()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn extract_json_object(text: &str) -> String {
    let trimmed = text.trim();

    if trimmed.starts_with('{') {
        return trimmed.to_string();
    }

    // Fenced code block, with or without a language tag
    if let Some(start) = trimmed.find("```") {
        let after = &trimmed[start + 3..];
        let after = after.strip_prefix("json").unwrap_or(after);
        if let Some(end) = after.find("```") {
            let inner = after[..end].trim();
            if inner.starts_with('{') {
                return inner.to_string();
            }
        }
    }

    if let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}'))
        && end > start
    {
        return trimmed[start..=end].to_string();
    }

    trimmed.to_string()
}

/// Cut `text` to at most `max` characters on a char boundary.
fn truncate_chars(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

/// Sends the entity's `conversation` output to the model and saves the
/// validated summary.
pub struct SummarizeStep {
    db: Arc<dyn Database>,
    llm: Arc<dyn LlmProvider>,
}

impl SummarizeStep {
    pub fn new(db: Arc<dyn Database>, llm: Arc<dyn LlmProvider>) -> Self {
        Self { db, llm }
    }
}

#[async_trait]
impl Step for SummarizeStep {
    async fn run(&self, entity: &MessageEntity) -> Result<(), StepError> {
        let conversation = self
            .db
            .get_output(&entity.id, OutputKind::Conversation)
            .await?
            .ok_or_else(|| {
                StepError::Failed("no conversation output to summarize".to_string())
            })?;
        if conversation.trim().is_empty() {
            return Err(StepError::Failed("conversation is empty".to_string()));
        }

        let prompt = truncate_chars(&conversation, MAX_PROMPT_CHARS);
        let request = CompletionRequest::new(vec![
            ChatMessage::system(SYSTEM_PROMPT),
            ChatMessage::user(prompt),
        ])
        .with_max_tokens(1024)
        .with_temperature(0.2);

        let response = self.llm.complete(request).await?;
        tracing::debug!(
            entity = %entity.id,
            model = %self.llm.model_name(),
            input_tokens = response.input_tokens,
            output_tokens = response.output_tokens,
            "Summary generated"
        );

        let summary = parse_summary(&response.content)?;
        let json = serde_json::to_string(&summary)
            .map_err(|e| StepError::Failed(format!("failed to encode summary: {e}")))?;

        self.db
            .save_output(&entity.id, OutputKind::Summary, &json)
            .await?;
        Ok(())
    }
}
