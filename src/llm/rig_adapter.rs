//! Bridges rig's `CompletionModel` to our `LlmProvider` trait.

use async_trait::async_trait;
use rig::completion::{AssistantContent, CompletionModel, Message};

use crate::error::LlmError;
use crate::llm::provider::{
    ChatMessage, CompletionRequest, CompletionResponse, FinishReason, LlmProvider, Role,
};

/// Wraps any rig completion model.
pub struct RigAdapter<M> {
    model: M,
    model_name: String,
}

impl<M: CompletionModel> RigAdapter<M> {
    pub fn new(model: M, model_name: &str) -> Self {
        Self {
            model,
            model_name: model_name.to_string(),
        }
    }
}

/// A request split the way rig wants it: system preamble, prior turns, and
/// the final prompt.
#[derive(Debug, PartialEq)]
struct RigParts<'a> {
    preamble: Option<String>,
    history: Vec<&'a ChatMessage>,
    prompt: &'a ChatMessage,
}

fn split_request(request: &CompletionRequest) -> Option<RigParts<'_>> {
    let system: Vec<&str> = request
        .messages
        .iter()
        .filter(|m| m.role == Role::System)
        .map(|m| m.content.as_str())
        .collect();

    let mut turns: Vec<&ChatMessage> = request
        .messages
        .iter()
        .filter(|m| m.role != Role::System)
        .collect();
    let prompt = turns.pop()?;

    Some(RigParts {
        preamble: (!system.is_empty()).then(|| system.join("\n\n")),
        history: turns,
        prompt,
    })
}

fn to_rig_message(message: &ChatMessage) -> Message {
    match message.role {
        Role::Assistant => Message::assistant(message.content.clone()),
        Role::System | Role::User => Message::user(message.content.clone()),
    }
}

#[async_trait]
impl<M> LlmProvider for RigAdapter<M>
where
    M: CompletionModel + Send + Sync + 'static,
{
    fn model_name(&self) -> &str {
        &self.model_name
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        let parts = split_request(&request).ok_or_else(|| LlmError::RequestFailed {
            provider: self.model_name.clone(),
            reason: "request has no user or assistant message".to_string(),
        })?;

        let mut builder = self
            .model
            .completion_request(to_rig_message(parts.prompt))
            .messages(parts.history.into_iter().map(to_rig_message).collect());
        if let Some(preamble) = parts.preamble {
            builder = builder.preamble(preamble);
        }
        if let Some(max_tokens) = request.max_tokens {
            builder = builder.max_tokens(u64::from(max_tokens));
        }
        if let Some(temperature) = request.temperature {
            builder = builder.temperature(f64::from(temperature));
        }

        let response = builder.send().await.map_err(|e| LlmError::RequestFailed {
            provider: self.model_name.clone(),
            reason: e.to_string(),
        })?;

        let content = response
            .choice
            .iter()
            .filter_map(|c| match c {
                AssistantContent::Text(text) => Some(text.text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("");

        let input_tokens = u32::try_from(response.usage.input_tokens).unwrap_or(u32::MAX);
        let output_tokens = u32::try_from(response.usage.output_tokens).unwrap_or(u32::MAX);

        // rig does not surface the stop reason generically.
        let finish_reason = match request.max_tokens {
            Some(max) if output_tokens >= max => FinishReason::Length,
            _ => FinishReason::Stop,
        };

        tracing::debug!(
            model = %self.model_name,
            input_tokens,
            output_tokens,
            "LLM completion finished"
        );

        Ok(CompletionResponse {
            content,
            input_tokens,
            output_tokens,
            finish_reason,
            response_id: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_messages_become_preamble() {
        let request = CompletionRequest::new(vec![
            ChatMessage::system("Be terse."),
            ChatMessage::user("First."),
            ChatMessage::assistant("Ok."),
            ChatMessage::system("No lists."),
            ChatMessage::user("Summarize this."),
        ]);

        let parts = split_request(&request).unwrap();
        assert_eq!(parts.preamble.as_deref(), Some("Be terse.\n\nNo lists."));
        assert_eq!(parts.prompt.content, "Summarize this.");
        assert_eq!(
            parts
                .history
                .iter()
                .map(|m| m.content.as_str())
                .collect::<Vec<_>>(),
            vec!["First.", "Ok."]
        );
    }

    #[test]
    fn single_prompt_has_no_history() {
        let request = CompletionRequest::new(vec![ChatMessage::user("hi")]);
        let parts = split_request(&request).unwrap();
        assert!(parts.preamble.is_none());
        assert!(parts.history.is_empty());
        assert_eq!(parts.prompt.role, Role::User);
    }

    #[test]
    fn system_only_request_is_rejected() {
        let request = CompletionRequest::new(vec![ChatMessage::system("rules")]);
        assert!(split_request(&request).is_none());
    }
}
