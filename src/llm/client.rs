//! LLM client trait and message types.

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};

use crate::types::{Result, TokenUsage};

/// Role of a chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    /// System instructions.
    System,
    /// User content.
    User,
    /// Assistant output.
    Assistant,
    /// Tool result fed back to the model.
    Tool,
}

/// One message in an ordered chat request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Sender role.
    pub role: ChatRole,
    /// Message text.
    pub content: String,
}

impl ChatMessage {
    /// Build a system message.
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::System,
            content: content.into(),
        }
    }

    /// Build a user message.
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }

    /// Build an assistant message.
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
        }
    }
}

/// Per-call options. Every call carries a deadline.
#[derive(Debug, Clone)]
pub struct ChatOptions {
    /// Sampling temperature.
    pub temperature: f32,
    /// Completion token cap.
    pub max_tokens: Option<u32>,
    /// Ask the provider for a JSON object response.
    pub json_mode: bool,
    /// Wall-clock deadline for the whole call.
    pub deadline: Duration,
}

impl Default for ChatOptions {
    fn default() -> Self {
        Self {
            temperature: 0.3,
            max_tokens: None,
            json_mode: false,
            deadline: Duration::from_secs(60),
        }
    }
}

impl ChatOptions {
    /// Low-temperature JSON-mode options used by extraction calls.
    pub fn json(max_tokens: u32, deadline: Duration) -> Self {
        Self {
            temperature: 0.0,
            max_tokens: Some(max_tokens),
            json_mode: true,
            deadline,
        }
    }
}

/// A completed, non-streaming chat call.
#[derive(Debug, Clone)]
pub struct ChatCompletion {
    /// Generated text.
    pub content: String,
    /// Token usage; estimated when the provider omitted it.
    pub usage: TokenUsage,
    /// Model that produced the completion.
    pub model: String,
}

/// Streaming call shape: a sequence of string deltas. The stream ends when
/// the provider emits its terminal marker; usage is estimated by the caller.
pub type TokenStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

/// Generic LLM client trait.
///
/// Implementations map provider failures onto the typed error kinds:
/// retryable conditions surface as `LlmTransient` (retried once inside the
/// client), hard failures as `LlmUpstream`, deadline expiry as `LlmTimeout`.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Run a chat completion to the end.
    async fn complete(
        &self,
        messages: &[ChatMessage],
        options: &ChatOptions,
    ) -> Result<ChatCompletion>;

    /// Stream completion deltas.
    async fn stream(&self, messages: &[ChatMessage], options: &ChatOptions)
        -> Result<TokenStream>;

    /// Model identifier used by this client.
    fn model_name(&self) -> &str;
}

/// Estimate token usage from raw text when the provider does not report it.
///
/// Whitespace-token count scaled by 1.3, flagged as an estimate.
pub fn estimate_usage(prompt_text: &str, completion_text: &str) -> TokenUsage {
    let prompt = (prompt_text.split_whitespace().count() as f64 * 1.3).ceil() as u64;
    let completion = (completion_text.split_whitespace().count() as f64 * 1.3).ceil() as u64;
    TokenUsage {
        prompt,
        completion,
        total: prompt + completion,
        estimated: true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_constructors() {
        let m = ChatMessage::system("be helpful");
        assert_eq!(m.role, ChatRole::System);
        assert_eq!(m.content, "be helpful");
        assert_eq!(ChatMessage::user("hi").role, ChatRole::User);
        assert_eq!(ChatMessage::assistant("ok").role, ChatRole::Assistant);
    }

    #[test]
    fn test_estimate_usage_scales() {
        let usage = estimate_usage("one two three four", "five six");
        assert!(usage.estimated);
        assert_eq!(usage.prompt, 6); // ceil(4 * 1.3)
        assert_eq!(usage.completion, 3); // ceil(2 * 1.3)
        assert_eq!(usage.total, usage.prompt + usage.completion);
    }

    #[test]
    fn test_json_options() {
        let opts = ChatOptions::json(200, Duration::from_secs(10));
        assert!(opts.json_mode);
        assert_eq!(opts.max_tokens, Some(200));
        assert_eq!(opts.temperature, 0.0);
    }
}
