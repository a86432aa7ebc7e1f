//! Deterministic provider that replays a fixed sequence of responses.
//!
//! Used by integration tests and offline dry-runs where the control loop
//! must be driven without network access. Each `complete` call pops the
//! next scripted response; exhausting the script is an error so tests fail
//! loudly when the loop makes more model calls than expected.

use std::sync::Mutex;

use crate::{ChatRequest, LlmError, LlmProvider, LlmResponse, LlmResult};

/// Replays canned responses in order and records the requests it saw.
pub struct ScriptedProvider {
    responses: Mutex<Vec<String>>,
    requests: Mutex<Vec<ChatRequest>>,
    cursor: Mutex<usize>,
}

impl ScriptedProvider {
    pub fn new(responses: Vec<String>) -> Self {
        Self {
            responses: Mutex::new(responses),
            requests: Mutex::new(Vec::new()),
            cursor: Mutex::new(0),
        }
    }

    /// Convenience constructor from string literals.
    pub fn from_slices(responses: &[&str]) -> Self {
        Self::new(responses.iter().map(|s| s.to_string()).collect())
    }

    /// Requests observed so far, in call order.
    pub fn seen_requests(&self) -> Vec<ChatRequest> {
        self.requests.lock().unwrap().clone()
    }

    /// Number of completions served.
    pub fn calls_made(&self) -> usize {
        *self.cursor.lock().unwrap()
    }
}

#[async_trait::async_trait]
impl LlmProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn complete(&self, request: &ChatRequest) -> LlmResult<LlmResponse> {
        self.requests.lock().unwrap().push(request.clone());

        let mut cursor = self.cursor.lock().unwrap();
        let responses = self.responses.lock().unwrap();
        let Some(content) = responses.get(*cursor) else {
            return Err(LlmError::Protocol(format!(
                "script exhausted after {} responses",
                responses.len()
            )));
        };
        *cursor += 1;

        Ok(LlmResponse {
            content: content.clone(),
            model: request.model.clone(),
            usage: None,
            finish_reason: Some("stop".to_string()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scripted_provider_replays_in_order() {
        let provider = ScriptedProvider::from_slices(&["first", "second"]);
        let req = ChatRequest::new("m", "sys", "usr");

        let a = provider.complete(&req).await.unwrap();
        let b = provider.complete(&req).await.unwrap();
        assert_eq!(a.content, "first");
        assert_eq!(b.content, "second");
        assert_eq!(provider.calls_made(), 2);
    }

    #[tokio::test]
    async fn test_scripted_provider_errors_when_exhausted() {
        let provider = ScriptedProvider::from_slices(&["only"]);
        let req = ChatRequest::new("m", "sys", "usr");

        provider.complete(&req).await.unwrap();
        let err = provider.complete(&req).await.unwrap_err();
        assert!(matches!(err, LlmError::Protocol(_)));
    }

    #[tokio::test]
    async fn test_scripted_provider_records_requests() {
        let provider = ScriptedProvider::from_slices(&["ok"]);
        let req = ChatRequest::new("m", "system prompt", "user prompt");
        provider.complete(&req).await.unwrap();

        let seen = provider.seen_requests();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].messages[1].content, "user prompt");
    }
}
