//! OpenAI-compatible chat client.
//!
//! Works against any endpoint speaking the OpenAI chat completions wire
//! format (OpenAI, Azure, Ollama's `/v1`, vLLM, ...). Non-streaming calls
//! return the provider-reported usage; streaming parses `data:` lines until
//! the literal `[DONE]` terminator and leaves usage estimation to callers.

use std::time::Duration;

use async_stream::try_stream;
use futures::StreamExt;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::llm::client::{
    estimate_usage, ChatCompletion, ChatMessage, ChatOptions, LlmClient, TokenStream,
};
use crate::types::{AppError, Result, TokenUsage};

// ============================================================================
// Wire Types
// ============================================================================

#[derive(Serialize)]
struct ApiRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    stream: bool,
}

#[derive(Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    format_type: &'static str,
}

#[derive(Deserialize)]
struct ApiResponse {
    choices: Vec<ApiChoice>,
    usage: Option<ApiUsage>,
    model: Option<String>,
}

#[derive(Deserialize)]
struct ApiChoice {
    message: ApiMessage,
}

#[derive(Deserialize)]
struct ApiMessage {
    content: Option<String>,
}

#[derive(Deserialize)]
struct ApiUsage {
    prompt_tokens: u64,
    completion_tokens: u64,
    total_tokens: u64,
}

#[derive(Deserialize)]
struct StreamChunk {
    choices: Vec<StreamChoice>,
}

#[derive(Deserialize)]
struct StreamChoice {
    delta: StreamDelta,
}

#[derive(Deserialize)]
struct StreamDelta {
    content: Option<String>,
}

// ============================================================================
// Client
// ============================================================================

/// Chat client for OpenAI-compatible endpoints.
pub struct OpenAiClient {
    http: reqwest::Client,
    api_base: String,
    api_key: Option<String>,
    model: String,
}

impl OpenAiClient {
    /// Create a client for the given base URL and model.
    pub fn new(api_base: impl Into<String>, api_key: Option<String>, model: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_base: api_base.into().trim_end_matches('/').to_string(),
            api_key,
            model: model.into(),
        }
    }

    fn completions_url(&self) -> String {
        format!("{}/chat/completions", self.api_base)
    }

    fn request_builder(&self) -> reqwest::RequestBuilder {
        let mut builder = self.http.post(self.completions_url());
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }
        builder
    }

    fn map_send_error(err: reqwest::Error) -> AppError {
        if err.is_timeout() || err.is_connect() {
            AppError::LlmTransient(err.to_string())
        } else {
            AppError::LlmUpstream(err.to_string())
        }
    }

    async fn classify_status(response: reqwest::Response) -> Result<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        let message = format!("{}: {}", status, body);
        if status.as_u16() == 429 || status.is_server_error() {
            Err(AppError::LlmTransient(message))
        } else {
            Err(AppError::LlmUpstream(message))
        }
    }

    async fn try_complete(
        &self,
        messages: &[ChatMessage],
        options: &ChatOptions,
    ) -> Result<ChatCompletion> {
        let body = ApiRequest {
            model: &self.model,
            messages,
            temperature: options.temperature,
            max_tokens: options.max_tokens,
            response_format: options.json_mode.then_some(ResponseFormat {
                format_type: "json_object",
            }),
            stream: false,
        };

        let send = async {
            let response = self
                .request_builder()
                .json(&body)
                .send()
                .await
                .map_err(Self::map_send_error)?;
            let response = Self::classify_status(response).await?;
            response
                .json::<ApiResponse>()
                .await
                .map_err(|e| AppError::LlmUpstream(format!("malformed completion: {}", e)))
        };

        let parsed = tokio::time::timeout(options.deadline, send)
            .await
            .map_err(|_| {
                AppError::LlmTimeout(format!(
                    "chat completion exceeded {:.1}s deadline",
                    options.deadline.as_secs_f64()
                ))
            })??;

        let content = parsed
            .choices
            .first()
            .and_then(|c| c.message.content.clone())
            .unwrap_or_default();

        let usage = match parsed.usage {
            Some(u) => TokenUsage {
                prompt: u.prompt_tokens,
                completion: u.completion_tokens,
                total: u.total_tokens,
                estimated: false,
            },
            None => {
                let prompt_text: String = messages
                    .iter()
                    .map(|m| m.content.as_str())
                    .collect::<Vec<_>>()
                    .join(" ");
                estimate_usage(&prompt_text, &content)
            }
        };

        Ok(ChatCompletion {
            content,
            usage,
            model: parsed.model.unwrap_or_else(|| self.model.clone()),
        })
    }
}

#[async_trait::async_trait]
impl LlmClient for OpenAiClient {
    async fn complete(
        &self,
        messages: &[ChatMessage],
        options: &ChatOptions,
    ) -> Result<ChatCompletion> {
        match self.try_complete(messages, options).await {
            Err(AppError::LlmTransient(msg)) => {
                let jitter = rand::rng().random_range(50..250u64);
                tracing::warn!(error = %msg, retry_in_ms = jitter, "transient LLM failure, retrying once");
                tokio::time::sleep(Duration::from_millis(jitter)).await;
                self.try_complete(messages, options).await
            }
            other => other,
        }
    }

    async fn stream(
        &self,
        messages: &[ChatMessage],
        options: &ChatOptions,
    ) -> Result<TokenStream> {
        let body = ApiRequest {
            model: &self.model,
            messages,
            temperature: options.temperature,
            max_tokens: options.max_tokens,
            response_format: options.json_mode.then_some(ResponseFormat {
                format_type: "json_object",
            }),
            stream: true,
        };

        let response = tokio::time::timeout(
            options.deadline,
            self.request_builder().json(&body).send(),
        )
        .await
        .map_err(|_| AppError::LlmTimeout("stream connect deadline exceeded".into()))?
        .map_err(Self::map_send_error)?;
        let response = Self::classify_status(response).await?;

        let mut bytes = response.bytes_stream();
        let stream = try_stream! {
            let mut buffer = String::new();
            let mut done = false;
            while !done {
                let Some(chunk) = bytes.next().await else {
                    break;
                };
                let chunk = chunk.map_err(|e| AppError::LlmTransient(e.to_string()))?;
                buffer.push_str(&String::from_utf8_lossy(&chunk));

                while let Some(newline) = buffer.find('\n') {
                    let line: String = buffer.drain(..=newline).collect();
                    let line = line.trim();
                    let Some(payload) = line.strip_prefix("data:") else {
                        continue;
                    };
                    let payload = payload.trim();
                    if payload == "[DONE]" {
                        done = true;
                        break;
                    }
                    if payload.is_empty() {
                        continue;
                    }
                    let parsed: StreamChunk = serde_json::from_str(payload)
                        .map_err(|e| AppError::LlmUpstream(format!("malformed delta: {}", e)))?;
                    if let Some(delta) = parsed
                        .choices
                        .first()
                        .and_then(|c| c.delta.content.clone())
                    {
                        if !delta.is_empty() {
                            yield delta;
                        }
                    }
                }
            }
        };

        Ok(Box::pin(stream))
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_serialization_json_mode() {
        let messages = vec![ChatMessage::user("hi")];
        let body = ApiRequest {
            model: "gpt-4o-mini",
            messages: &messages,
            temperature: 0.0,
            max_tokens: Some(100),
            response_format: Some(ResponseFormat {
                format_type: "json_object",
            }),
            stream: false,
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["response_format"]["type"], "json_object");
        assert_eq!(json["messages"][0]["role"], "user");
        // stream:false is omitted from the wire body
        assert!(json.get("stream").is_none());
    }

    #[test]
    fn test_response_parsing_with_usage() {
        let raw = r#"{
            "choices": [{"message": {"content": "hello"}}],
            "usage": {"prompt_tokens": 7, "completion_tokens": 2, "total_tokens": 9},
            "model": "gpt-4o-mini-2024"
        }"#;
        let parsed: ApiResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed.choices[0].message.content.as_deref(), Some("hello"));
        assert_eq!(parsed.usage.unwrap().total_tokens, 9);
    }

    #[test]
    fn test_stream_chunk_parsing() {
        let raw = r#"{"choices":[{"delta":{"content":"wo"}}]}"#;
        let parsed: StreamChunk = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed.choices[0].delta.content.as_deref(), Some("wo"));
    }

    #[test]
    fn test_base_url_normalized() {
        let client = OpenAiClient::new("http://localhost:11434/v1/", None, "llama3.2");
        assert_eq!(
            client.completions_url(),
            "http://localhost:11434/v1/chat/completions"
        );
    }
}
