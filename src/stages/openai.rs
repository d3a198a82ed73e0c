//! Minimal OpenAI-compatible chat-completions client.
//!
//! Both model endpoints speak this dialect (Groq cloud for planning, a local
//! LM Studio server for generation), so one client serves both adapters.

use std::time::Duration;

use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::errors::{GenerationError, PlanningError};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(120);
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(60);

/// Deadlines that turn a silent endpoint into a retryable transport error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChatTimeouts {
    /// Limit on a whole non-streamed exchange.
    pub request: Duration,
    /// Longest silence allowed between reads, including between stream chunks.
    pub read: Duration,
}

impl Default for ChatTimeouts {
    fn default() -> Self {
        Self {
            request: DEFAULT_REQUEST_TIMEOUT,
            read: DEFAULT_READ_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".into(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".into(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ResponseFormat {
    #[serde(rename = "type")]
    pub kind: String,
}

impl ResponseFormat {
    pub fn json_object() -> Self {
        Self {
            kind: "json_object".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_format: Option<ResponseFormat>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub stream: bool,
}

#[derive(Debug, Deserialize)]
pub struct ChatResponse {
    #[serde(default)]
    pub choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
pub struct Choice {
    pub message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
pub struct ResponseMessage {
    #[serde(default)]
    pub content: Option<String>,
}

impl ChatResponse {
    /// Text of the first choice, if any.
    pub fn first_content(&self) -> Option<&str> {
        self.choices
            .first()
            .and_then(|c| c.message.content.as_deref())
    }
}

/// One `data:` event of a streamed completion.
#[derive(Debug, Deserialize)]
pub struct StreamChunk {
    #[serde(default)]
    pub choices: Vec<StreamChoice>,
    #[serde(default)]
    pub error: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
pub struct StreamChoice {
    #[serde(default)]
    pub delta: Delta,
}

#[derive(Debug, Default, Deserialize)]
pub struct Delta {
    #[serde(default)]
    pub content: Option<String>,
}

/// Failures shared by both adapters before any body is decoded.
#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    #[error("HTTP error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("API error (status {status}): {body}")]
    Api { status: u16, body: String },
}

impl From<ChatError> for PlanningError {
    fn from(err: ChatError) -> Self {
        match err {
            ChatError::Transport(e) => PlanningError::Transport(e),
            ChatError::Api { status, body } => PlanningError::Api { status, body },
        }
    }
}

impl From<ChatError> for GenerationError {
    fn from(err: ChatError) -> Self {
        match err {
            ChatError::Transport(e) => GenerationError::Transport(e),
            ChatError::Api { status, body } => GenerationError::Api { status, body },
        }
    }
}

#[derive(Debug, Clone)]
pub struct ChatClient {
    http: Client,
    base_url: String,
    api_key: String,
    timeouts: ChatTimeouts,
}

impl ChatClient {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Result<Self, ChatError> {
        Self::with_timeouts(base_url, api_key, ChatTimeouts::default())
    }

    pub fn with_timeouts(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        timeouts: ChatTimeouts,
    ) -> Result<Self, ChatError> {
        let http = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .read_timeout(timeouts.read)
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.into(),
            api_key: api_key.into(),
            timeouts,
        })
    }

    pub fn timeouts(&self) -> ChatTimeouts {
        self.timeouts
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn completions_url(&self) -> String {
        format!("{}/chat/completions", self.base_url.trim_end_matches('/'))
    }

    /// POST a chat request; non-2xx statuses become `ChatError::Api` with the body text.
    pub async fn send(&self, request: &ChatRequest) -> Result<reqwest::Response, ChatError> {
        let url = self.completions_url();
        tracing::debug!(url = %url, model = %request.model, stream = request.stream, "chat request");

        let mut builder = self.http.post(&url).bearer_auth(&self.api_key).json(request);
        // A stream may run for minutes; it is bounded by the read timeout alone.
        if !request.stream {
            builder = builder.timeout(self.timeouts.request);
        }
        let response = builder.send().await?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "(no body)".into());
            return Err(ChatError::Api {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }
}
