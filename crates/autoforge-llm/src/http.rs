//! OpenAI-compatible chat-completions client.
//!
//! Speaks the `POST {base_url}/chat/completions` protocol with bearer
//! authentication. Server errors (HTTP >= 500) and connection errors are
//! retried up to three times with exponential backoff (base 1 s, cap 10 s)
//! plus up to 10% jitter; 4xx responses are never retried.

use std::time::Duration;

use futures::StreamExt;
use rand::Rng;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::{ChatRequest, LlmError, LlmProvider, LlmResponse, LlmResult, TokenUsage};

const MAX_RETRIES: u32 = 3;
const BASE_DELAY_MS: u64 = 1_000;
const MAX_DELAY_MS: u64 = 10_000;
const REQUEST_TIMEOUT_SECS: u64 = 30;

/// HTTP provider for any OpenAI-compatible chat-completions endpoint.
#[derive(Debug, Clone)]
pub struct OpenAiCompatProvider {
    name: String,
    base_url: String,
    api_key: String,
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct CompletionBody {
    #[serde(default)]
    model: Option<String>,
    choices: Vec<CompletionChoice>,
    #[serde(default)]
    usage: Option<TokenUsage>,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    message: CompletionMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CompletionMessage {
    #[serde(default)]
    content: String,
}

#[derive(Debug, Deserialize)]
struct StreamChunk {
    choices: Vec<StreamChoice>,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    usage: Option<TokenUsage>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: StreamDelta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
}

impl OpenAiCompatProvider {
    /// Create a provider for `base_url` (without the `/chat/completions`
    /// suffix), e.g. `https://api.openai.com/v1`.
    pub fn new(
        name: impl Into<String>,
        base_url: impl Into<String>,
        api_key: impl Into<String>,
    ) -> LlmResult<Self> {
        let name = name.into();
        let api_key = api_key.into();
        if api_key.is_empty() {
            return Err(LlmError::MissingApiKey(name));
        }
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .map_err(|e| LlmError::Transport(e.to_string()))?;
        Ok(Self {
            name,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
            client,
        })
    }

    fn completions_url(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }

    /// Backoff for the given zero-based attempt, with jitter applied.
    fn backoff_delay(attempt: u32) -> Duration {
        let base = BASE_DELAY_MS.saturating_mul(2u64.pow(attempt)).min(MAX_DELAY_MS);
        let jitter = rand::thread_rng().gen_range(0.0..=0.1);
        Duration::from_millis(base + (base as f64 * jitter) as u64)
    }

    async fn send_once(&self, request: &ChatRequest) -> LlmResult<reqwest::Response> {
        self.client
            .post(self.completions_url())
            .bearer_auth(&self.api_key)
            .json(request)
            .send()
            .await
            .map_err(|e| LlmError::Transport(e.to_string()))
    }

    /// One request with retry-on-5xx/connection-error semantics. Returns the
    /// first non-retryable response.
    async fn send_with_retries(&self, request: &ChatRequest) -> LlmResult<reqwest::Response> {
        let mut last_error = String::new();

        for attempt in 0..=MAX_RETRIES {
            match self.send_once(request).await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_server_error() {
                        let body = response.text().await.unwrap_or_default();
                        last_error = format!("HTTP {}: {}", status.as_u16(), body);
                        if attempt < MAX_RETRIES {
                            let delay = Self::backoff_delay(attempt);
                            warn!(
                                provider = %self.name,
                                status = status.as_u16(),
                                attempt = attempt + 1,
                                "server error, retrying in {:?}",
                                delay
                            );
                            tokio::time::sleep(delay).await;
                            continue;
                        }
                        return Err(LlmError::Status {
                            status: status.as_u16(),
                            body,
                        });
                    }
                    if status.is_client_error() {
                        let body = response.text().await.unwrap_or_default();
                        return Err(LlmError::Status {
                            status: status.as_u16(),
                            body,
                        });
                    }
                    return Ok(response);
                }
                Err(e) => {
                    last_error = e.to_string();
                    if attempt < MAX_RETRIES {
                        let delay = Self::backoff_delay(attempt);
                        warn!(
                            provider = %self.name,
                            attempt = attempt + 1,
                            "connection error, retrying in {:?}: {}",
                            delay,
                            last_error
                        );
                        tokio::time::sleep(delay).await;
                        continue;
                    }
                }
            }
        }

        Err(LlmError::RetriesExhausted {
            attempts: MAX_RETRIES + 1,
            last_error,
        })
    }

    async fn complete_blocking(&self, request: &ChatRequest) -> LlmResult<LlmResponse> {
        let response = self.send_with_retries(request).await?;
        let body: CompletionBody = response
            .json()
            .await
            .map_err(|e| LlmError::Protocol(e.to_string()))?;

        let choice = body
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| LlmError::Protocol("response carried no choices".to_string()))?;

        Ok(LlmResponse {
            content: choice.message.content,
            model: body.model.unwrap_or_else(|| request.model.clone()),
            usage: body.usage,
            finish_reason: choice.finish_reason,
        })
    }

    /// Consume a `data: {...}`-framed SSE body until `data: [DONE]`,
    /// assembling the deltas into a full response.
    async fn complete_streaming(&self, request: &ChatRequest) -> LlmResult<LlmResponse> {
        let response = self.send_with_retries(request).await?;
        let mut stream = response.bytes_stream();

        let mut buffer = String::new();
        let mut content = String::new();
        let mut model = request.model.clone();
        let mut usage = None;
        let mut finish_reason = None;

        'outer: while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| LlmError::Transport(e.to_string()))?;
            buffer.push_str(&String::from_utf8_lossy(&chunk));

            while let Some(boundary) = buffer.find("\n\n") {
                let frame = buffer[..boundary].trim().to_string();
                buffer.drain(..boundary + 2);

                let Some(data) = frame.strip_prefix("data: ") else {
                    continue;
                };
                if data == "[DONE]" {
                    break 'outer;
                }
                let parsed: StreamChunk = match serde_json::from_str(data) {
                    Ok(parsed) => parsed,
                    // Tolerate keep-alive noise between frames.
                    Err(_) => continue,
                };
                if let Some(m) = parsed.model {
                    model = m;
                }
                if parsed.usage.is_some() {
                    usage = parsed.usage;
                }
                if let Some(choice) = parsed.choices.into_iter().next() {
                    if let Some(delta) = choice.delta.content {
                        content.push_str(&delta);
                    }
                    if choice.finish_reason.is_some() {
                        finish_reason = choice.finish_reason;
                    }
                }
            }
        }

        debug!(provider = %self.name, chars = content.len(), "assembled streamed response");

        Ok(LlmResponse {
            content,
            model,
            usage,
            finish_reason,
        })
    }
}

#[async_trait::async_trait]
impl LlmProvider for OpenAiCompatProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn complete(&self, request: &ChatRequest) -> LlmResult<LlmResponse> {
        if request.stream {
            self.complete_streaming(request).await
        } else {
            self.complete_blocking(request).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_rejects_empty_api_key() {
        let result = OpenAiCompatProvider::new("openai", "https://api.example.com/v1", "");
        assert!(matches!(result, Err(LlmError::MissingApiKey(_))));
    }

    #[test]
    fn test_completions_url_trims_trailing_slash() {
        let provider =
            OpenAiCompatProvider::new("openai", "https://api.example.com/v1/", "sk-test").unwrap();
        assert_eq!(
            provider.completions_url(),
            "https://api.example.com/v1/chat/completions"
        );
    }

    #[test]
    fn test_backoff_delay_is_bounded() {
        for attempt in 0..6 {
            let delay = OpenAiCompatProvider::backoff_delay(attempt);
            // cap + 10% jitter
            assert!(delay <= Duration::from_millis(MAX_DELAY_MS + MAX_DELAY_MS / 10));
            assert!(delay >= Duration::from_millis(BASE_DELAY_MS));
        }
    }

    #[test]
    fn test_completion_body_parses_minimal_response() {
        let body: CompletionBody = serde_json::from_str(
            r#"{"choices":[{"message":{"content":"hello"},"finish_reason":"stop"}]}"#,
        )
        .unwrap();
        assert_eq!(body.choices[0].message.content, "hello");
        assert_eq!(body.choices[0].finish_reason.as_deref(), Some("stop"));
        assert!(body.usage.is_none());
    }

    #[test]
    fn test_stream_chunk_parses_delta() {
        let chunk: StreamChunk =
            serde_json::from_str(r#"{"choices":[{"delta":{"content":"hi"}}]}"#).unwrap();
        assert_eq!(chunk.choices[0].delta.content.as_deref(), Some("hi"));
    }
}
