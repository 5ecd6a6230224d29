//! OpenAI-compatible chat completions backend.

use crate::config::LlmConfig;
use crate::error::{AnalysisError, ConfigError};
use crate::models::truncate_chars;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// Message in a chat request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
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

#[derive(Debug, Clone, PartialEq)]
pub struct ChatRequest {
    pub messages: Vec<ChatMessage>,
    pub temperature: f32,
    pub max_tokens: u32,
}

impl ChatRequest {
    /// Content of the first message with the given role.
    #[cfg(test)]
    pub fn content_of(&self, role: &str) -> Option<&str> {
        self.messages
            .iter()
            .find(|m| m.role == role)
            .map(|m| m.content.as_str())
    }
}

/// A completion endpoint. Returns the assistant message content verbatim.
#[async_trait]
pub trait LlmBackend: Send + Sync {
    fn model(&self) -> &str;

    async fn complete(&self, request: &ChatRequest) -> Result<String, AnalysisError>;
}

#[derive(Debug, Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    temperature: f32,
    max_tokens: u32,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

/// Chat completions client with bearer authentication.
pub struct ChatClient {
    http: reqwest::Client,
    base_url: String,
    model: String,
    api_key: String,
    timeout_seconds: u64,
}

impl ChatClient {
    /// Fails before any network call when the credential is missing.
    pub fn new(config: &LlmConfig) -> Result<Self, ConfigError> {
        let api_key = config.api_key()?;
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()
            .map_err(|e| ConfigError::Invalid {
                field: "llm",
                reason: format!("failed to create HTTP client: {}", e),
            })?;

        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            api_key,
            timeout_seconds: config.timeout_seconds,
        })
    }
}

#[async_trait]
impl LlmBackend for ChatClient {
    fn model(&self) -> &str {
        &self.model
    }

    async fn complete(&self, request: &ChatRequest) -> Result<String, AnalysisError> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = CompletionRequest {
            model: &self.model,
            messages: &request.messages,
            temperature: request.temperature,
            max_tokens: request.max_tokens,
            stream: false,
        };

        debug!("Sending chat request with {} messages", request.messages.len());

        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    AnalysisError::Timeout(self.timeout_seconds)
                } else if e.is_connect() {
                    AnalysisError::Transport(format!("cannot connect to {}", self.base_url))
                } else {
                    AnalysisError::Transport(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status.as_u16(), truncate_chars(body.trim(), 300)));
        }

        let parsed: CompletionResponse = response.json().await.map_err(|e| {
            if e.is_timeout() {
                AnalysisError::Timeout(self.timeout_seconds)
            } else {
                AnalysisError::Malformed(format!("unreadable completion body: {}", e))
            }
        })?;

        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .filter(|c| !c.trim().is_empty())
            .ok_or_else(|| AnalysisError::Malformed("completion has no content".to_string()))
    }
}

/// Map a non-success status onto the error taxonomy.
fn classify_status(status: u16, body: String) -> AnalysisError {
    match status {
        401 | 403 => AnalysisError::Auth(body),
        // 402 is how some providers report an exhausted balance.
        402 | 429 => AnalysisError::RateLimited(body),
        _ => AnalysisError::Http { status, body },
    }
}
