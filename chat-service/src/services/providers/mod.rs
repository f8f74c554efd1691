//! Upstream model provider abstractions.
//!
//! The relay only depends on [`ChatProvider`]; the OpenAI-compatible HTTP
//! implementation and the scripted mock both plug in behind it.

pub mod mock;
pub mod openai;

use super::credentials::ModelCredentials;
use super::decoder::DecodedEvent;
use async_trait::async_trait;
use serde::Serialize;
use service_core::protocol::{Message, Role};
use std::pin::Pin;
use thiserror::Error;
use tokio_stream::Stream;
use tokio_util::sync::CancellationToken;

/// Error type for provider operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProviderError {
    #[error("Model not configured: {0}")]
    ModelNotFound(String),

    #[error("Upstream returned status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Upstream request timed out")]
    Timeout,

    #[error("Network error: {0}")]
    Network(String),

    #[error("Invalid upstream response: {0}")]
    InvalidResponse(String),

    #[error("Request cancelled")]
    Cancelled,
}

impl ProviderError {
    /// The fixed message shown to the user for this failure.
    pub fn user_message(&self) -> &'static str {
        match self {
            ProviderError::ModelNotFound(_) => "Model not found.",
            ProviderError::Status { status, .. } => match status {
                401 => "Unauthorized.",
                404 => "Model not found.",
                429 => "Rate limit exceeded.",
                500 => "Internal server error.",
                502 => "Bad gateway.",
                503 => "Service unavailable.",
                504 => "Gateway timeout.",
                _ => "An error occurred.",
            },
            ProviderError::Timeout => "Gateway timeout.",
            ProviderError::Network(_)
            | ProviderError::InvalidResponse(_)
            | ProviderError::Cancelled => "An error occurred.",
        }
    }

    /// Metric label for the error category.
    pub fn category(&self) -> &'static str {
        match self.user_message() {
            "Unauthorized." => "unauthorized",
            "Model not found." => "not_found",
            "Rate limit exceeded." => "rate_limited",
            "Internal server error." => "server_error",
            "Bad gateway." => "bad_gateway",
            "Service unavailable." => "unavailable",
            "Gateway timeout." => "timeout",
            _ => "generic",
        }
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ProviderError::Timeout
        } else if let Some(status) = err.status() {
            ProviderError::Status {
                status: status.as_u16(),
                body: err.to_string(),
            }
        } else {
            ProviderError::Network(err.to_string())
        }
    }
}

/// Type alias for decoded provider streams.
pub type ProviderStream =
    Pin<Box<dyn Stream<Item = Result<DecodedEvent, ProviderError>> + Send>>;

/// A message in the upstream chat-completions format.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UpstreamMessage {
    pub role: String,
    pub content: UpstreamContent,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum UpstreamContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ImageUrl {
    pub url: String,
}

impl UpstreamMessage {
    pub fn system(text: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: UpstreamContent::Text(text.into()),
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User.as_str().to_string(),
            content: UpstreamContent::Text(text.into()),
        }
    }
}

impl From<&Message> for UpstreamMessage {
    /// Text first, then every attachment inlined as a data URL image part.
    fn from(message: &Message) -> Self {
        let mut parts = Vec::with_capacity(1 + message.attachments.len());
        parts.push(ContentPart::Text {
            text: message.content.clone(),
        });
        parts.extend(message.attachments.iter().map(|a| ContentPart::ImageUrl {
            image_url: ImageUrl {
                url: format!("data:{};base64,{}", a.mime_type, a.data),
            },
        }));

        Self {
            role: message.role.as_str().to_string(),
            content: UpstreamContent::Parts(parts),
        }
    }
}

/// Optional sampling parameters forwarded verbatim.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SamplingParams {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CompletionRequest {
    pub messages: Vec<UpstreamMessage>,
    pub params: SamplingParams,
}

/// A chat-completions backend.
#[async_trait]
pub trait ChatProvider: Send + Sync {
    /// Start a streaming completion. Resolves once the upstream has accepted
    /// the request; `cancel` abandons a connect that is still pending.
    async fn stream_chat(
        &self,
        model: &ModelCredentials,
        request: &CompletionRequest,
        cancel: &CancellationToken,
    ) -> Result<ProviderStream, ProviderError>;

    /// One-shot, non-streaming completion returning the message text.
    async fn complete(
        &self,
        model: &ModelCredentials,
        request: &CompletionRequest,
    ) -> Result<String, ProviderError>;
}
