//! Wire types shared by the relay server and its clients.
//!
//! Field names follow the JSON the HTTP surface speaks (camelCase), so the
//! same structs serialize into the server's store and the client's replica.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use validator::Validate;

/// Header carrying the caller identity on every `/api` request.
pub const USER_ID_HEADER: &str = "X-User-ID";

/// Placeholder title of a chat that has not been summarized yet.
pub const SENTINEL_TITLE: &str = "New chat";

/// Appended to an assistant message whose generation was interrupted.
pub const STOPPED_MARKER: &str = "\n\n**⛔ Stopped**";

/// Render a user-facing error the way it appears inside an assistant turn.
pub fn error_content(message: &str) -> String {
    format!("**⚠️ {}**", message)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

/// An inline file carried with a message, base64 encoded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    #[validate(length(min = 1))]
    pub file_name: String,
    #[validate(length(min = 1))]
    pub mime_type: String,
    pub data: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    #[validate(length(min = 1))]
    pub id: String,
    pub role: Role,
    pub content: String,
    #[serde(default)]
    #[validate(nested)]
    pub attachments: Vec<Attachment>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_id: Option<String>,
}

impl Message {
    pub fn user(id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            role: Role::User,
            content: content.into(),
            attachments: Vec::new(),
            model_id: None,
        }
    }

    /// A fresh assistant message with a random id.
    pub fn assistant(content: impl Into<String>, model_id: Option<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            role: Role::Assistant,
            content: content.into(),
            attachments: Vec::new(),
            model_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Chat {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub messages: Vec<Message>,
    pub created_by: String,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub created_at: DateTime<Utc>,
}

impl Chat {
    /// An empty chat carrying the sentinel title.
    pub fn new(id: impl Into<String>, created_by: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: SENTINEL_TITLE.to_string(),
            messages: Vec::new(),
            created_by: created_by.into(),
            created_at: Utc::now(),
        }
    }

    pub fn has_sentinel_title(&self) -> bool {
        self.title == SENTINEL_TITLE
    }
}

/// One normalized event of a response stream.
///
/// A stream is a run of `done: false` events closed by exactly one
/// `done: true` event. Errors travel as that closing event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatEvent {
    pub id: String,
    pub role: Role,
    pub content: Option<String>,
    pub done: bool,
}

impl ChatEvent {
    pub fn token(request_id: &str, content: impl Into<String>) -> Self {
        Self {
            id: request_id.to_string(),
            role: Role::Assistant,
            content: Some(content.into()),
            done: false,
        }
    }

    /// Terminal event; `content` is appended to what the client has so far.
    pub fn finished(request_id: &str, content: impl Into<String>) -> Self {
        Self {
            id: request_id.to_string(),
            role: Role::Assistant,
            content: Some(content.into()),
            done: true,
        }
    }

    pub fn error(request_id: &str, message: &str) -> Self {
        Self::finished(request_id, error_content(message))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct ModelSelection {
    #[validate(length(min = 1))]
    pub id: String,
    #[serde(default)]
    pub custom_instructions: String,
}

/// Body of `POST /api/chat`.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct ChatRequest {
    #[validate(length(min = 1))]
    pub chat_id: String,
    #[validate(length(min = 1))]
    pub request_id: String,
    #[validate(nested)]
    pub model: ModelSelection,
    #[validate(nested)]
    pub messages: Vec<Message>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct GenerateTitleRequest {
    #[validate(length(min = 1))]
    pub chat_id: String,
    #[validate(length(min = 1))]
    pub model_id: String,
    #[validate(nested)]
    pub messages: Vec<Message>,
}

/// `generated` is false when the chat already had a real title, which is
/// returned unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerateTitleResponse {
    pub title: String,
    pub generated: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct RenameChatRequest {
    #[validate(length(min = 1, max = 200))]
    pub title: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct DeleteChatRequest {
    #[validate(length(min = 1))]
    pub id: String,
}

/// A configured model as exposed to clients, without credentials.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelInfo {
    pub id: String,
    pub model: String,
    pub provider: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncResponse {
    pub models: Vec<ModelInfo>,
    pub chats: Vec<Chat>,
}
