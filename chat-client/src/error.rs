use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Server responded with {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Malformed event: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("Response stream ended before a terminal event")]
    StreamClosed,

    #[error("A request is already active for chat {0}")]
    AlreadyActive(String),

    #[error("Chat {0} not found in the replica")]
    ChatNotFound(String),

    #[error("Message {0} not found")]
    MessageNotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Request task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl ClientError {
    /// Whether the server answered 404.
    pub fn is_not_found(&self) -> bool {
        matches!(self, ClientError::Status { status: 404, .. })
    }
}
