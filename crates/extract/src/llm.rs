use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use crate::prompt;

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("language model unreachable: {0}")]
    Transport(String),
    #[error("language model request timed out")]
    Timeout,
    #[error("language model rate limited the request")]
    RateLimited,
    #[error("language model returned status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("language model returned invalid JSON: {0}")]
    InvalidJson(String),
}

impl LlmError {
    /// Connection problems, timeouts, rate limits and server-side errors
    /// are expected to clear up on their own.
    pub fn is_transient(&self) -> bool {
        match self {
            LlmError::Transport(_) | LlmError::Timeout | LlmError::RateLimited => true,
            LlmError::Status { status, .. } => *status >= 500,
            LlmError::InvalidJson(_) => false,
        }
    }
}

impl From<reqwest::Error> for LlmError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            LlmError::Timeout
        } else if e.is_decode() {
            LlmError::InvalidJson(e.to_string())
        } else {
            LlmError::Transport(e.to_string())
        }
    }
}

/// Text-generation capability used by the classifier and the extractor.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    async fn generate(&self, prompt: &str) -> Result<String, LlmError>;

    /// Generate and parse a JSON object, asking the model to repair its own
    /// output up to `max_repairs` times when it is not valid JSON.
    async fn generate_json(
        &self,
        prompt: &str,
        max_repairs: usize,
    ) -> Result<serde_json::Value, LlmError> {
        let mut response = self.generate(prompt).await?;
        let mut repairs = 0;
        loop {
            if let Some(value) = parse_json_object(&response) {
                return Ok(value);
            }
            if repairs >= max_repairs {
                return Err(LlmError::InvalidJson(truncate(&response, 200)));
            }
            repairs += 1;
            debug!(attempt = repairs, "Asking model to repair invalid JSON");
            response = self.generate(&prompt::build_retry_prompt(&response)).await?;
        }
    }
}

/// Accepts a bare JSON object or one wrapped in prose or code fences.
pub fn parse_json_object(response: &str) -> Option<serde_json::Value> {
    let start = response.find('{')?;
    let end = response.rfind('}')?;
    if end < start {
        return None;
    }
    match serde_json::from_str::<serde_json::Value>(&response[start..=end]) {
        Ok(value) if value.is_object() => Some(value),
        _ => None,
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

#[derive(Clone)]
pub struct OllamaClient {
    base_url: String,
    model: String,
    client: reqwest::Client,
}

#[derive(Serialize)]
struct OllamaRequest {
    model: String,
    prompt: String,
    stream: bool,
    format: String, // "json" for structured output
}

#[derive(Deserialize)]
struct OllamaResponse {
    response: String,
}

impl OllamaClient {
    pub fn new(base_url: String, model: String, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            base_url,
            model,
            client,
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }
}

#[async_trait]
impl LanguageModel for OllamaClient {
    async fn generate(&self, prompt: &str) -> Result<String, LlmError> {
        let url = format!("{}/api/generate", self.base_url);

        let request = OllamaRequest {
            model: self.model.clone(),
            prompt: prompt.to_string(),
            stream: false,
            format: "json".to_string(), // Force JSON output
        };

        let response = self.client.post(&url).json(&request).send().await?;

        let status = response.status();
        if status.as_u16() == 429 {
            return Err(LlmError::RateLimited);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let ollama_response: OllamaResponse = response.json().await?;
        Ok(ollama_response.response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Replies(Mutex<Vec<String>>);

    #[async_trait]
    impl LanguageModel for Replies {
        async fn generate(&self, _prompt: &str) -> Result<String, LlmError> {
            Ok(self.0.lock().unwrap().remove(0))
        }
    }

    #[test]
    fn parses_json_wrapped_in_prose() {
        let value = parse_json_object("Sure! ```json\n{\"type\": \"invoice\"}\n```").unwrap();
        assert_eq!(value["type"], "invoice");
        assert!(parse_json_object("no json here").is_none());
        assert!(parse_json_object("[1, 2]").is_none());
    }

    #[tokio::test]
    async fn repairs_invalid_json_once() {
        let model = Replies(Mutex::new(vec![
            "{\"type\": ".to_string(),
            "{\"type\": \"contract\"}".to_string(),
        ]));
        let value = model.generate_json("classify", 1).await.unwrap();
        assert_eq!(value["type"], "contract");
    }

    #[tokio::test]
    async fn gives_up_after_repairs_are_spent() {
        let model = Replies(Mutex::new(vec!["nope".to_string(), "still nope".to_string()]));
        let err = model.generate_json("classify", 1).await.unwrap_err();
        assert!(matches!(err, LlmError::InvalidJson(_)));
        assert!(!err.is_transient());
    }

    #[test]
    fn transient_classification() {
        assert!(LlmError::RateLimited.is_transient());
        assert!(LlmError::Status { status: 503, body: String::new() }.is_transient());
        assert!(!LlmError::Status { status: 400, body: String::new() }.is_transient());
    }
}
