//! LLM provider abstraction for Autoforge.
//!
//! The orchestrator treats the model as a pure function from a chat request
//! to text. This crate defines that seam ([`LlmProvider`]) together with the
//! wire types of the chat-completions protocol, an HTTP implementation with
//! bounded retries ([`http::OpenAiCompatProvider`]), and a deterministic
//! scripted implementation for tests and offline runs
//! ([`scripted::ScriptedProvider`]).

pub mod http;
pub mod scripted;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// A single chat message in a completion request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatMessage {
    /// `"system"`, `"user"`, or `"assistant"`.
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

/// A chat-completions request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub stream: bool,
}

impl ChatRequest {
    /// A non-streaming request with a system and a user message.
    pub fn new(model: impl Into<String>, system: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            messages: vec![ChatMessage::system(system), ChatMessage::user(user)],
            temperature: None,
            max_tokens: None,
            stream: false,
        }
    }

    /// Total character count of all message contents, used for token
    /// estimation when the provider reports no usage.
    pub fn prompt_chars(&self) -> usize {
        self.messages.iter().map(|m| m.content.len()).sum()
    }
}

/// Token accounting reported by a provider, when available.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TokenUsage {
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub completion_tokens: u64,
    #[serde(default)]
    pub total_tokens: u64,
}

/// A completed (possibly streamed-and-assembled) model response.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LlmResponse {
    pub content: String,
    pub model: String,
    pub usage: Option<TokenUsage>,
    pub finish_reason: Option<String>,
}

/// Errors surfaced by LLM providers.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("malformed provider response: {0}")]
    Protocol(String),

    #[error("no API key configured for provider {0}")]
    MissingApiKey(String),

    #[error("retries exhausted after {attempts} attempts: {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },
}

/// Result type for provider operations.
pub type LlmResult<T> = std::result::Result<T, LlmError>;

/// The seam between the orchestrator and a concrete model backend.
///
/// Implementations must be stateless between calls; conversation continuity
/// is carried entirely inside the request.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Provider name for logs and reports.
    fn name(&self) -> &str;

    /// Perform a single completion call.
    async fn complete(&self, request: &ChatRequest) -> LlmResult<LlmResponse>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chat_request_serializes_expected_fields() {
        let req = ChatRequest {
            model: "test-model".into(),
            messages: vec![ChatMessage::user("hi")],
            temperature: Some(0.2),
            max_tokens: Some(64),
            stream: false,
        };
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["model"], "test-model");
        assert_eq!(json["messages"][0]["role"], "user");
        assert_eq!(json["temperature"], 0.2);
        assert_eq!(json["max_tokens"], 64);
        assert_eq!(json["stream"], false);
    }

    #[test]
    fn test_chat_request_omits_unset_sampling_params() {
        let req = ChatRequest::new("m", "sys", "usr");
        let json = serde_json::to_string(&req).unwrap();
        assert!(!json.contains("temperature"));
        assert!(!json.contains("max_tokens"));
    }

    #[test]
    fn test_prompt_chars_sums_all_messages() {
        let req = ChatRequest::new("m", "abcd", "efgh");
        assert_eq!(req.prompt_chars(), 8);
    }

    #[test]
    fn test_usage_deserializes_with_missing_fields() {
        let usage: TokenUsage = serde_json::from_str(r#"{"total_tokens": 42}"#).unwrap();
        assert_eq!(usage.total_tokens, 42);
        assert_eq!(usage.prompt_tokens, 0);
    }
}
