//! Durable chat storage.

pub mod memory;
pub mod mongo;

pub use memory::MemoryChatStore;
pub use mongo::MongoChatStore;

use async_trait::async_trait;
use service_core::error::AppError;
use service_core::protocol::{Chat, Message};

#[async_trait]
pub trait ChatStore: Send + Sync {
    /// Return the chat, creating it with the sentinel title if absent.
    async fn get_or_create(&self, chat_id: &str, user_id: &str) -> Result<Chat, AppError>;

    async fn get(&self, chat_id: &str) -> Result<Option<Chat>, AppError>;

    /// Replace the chat's whole message sequence.
    async fn save_messages(&self, chat_id: &str, messages: &[Message]) -> Result<(), AppError>;

    /// Set the title only while it is still the sentinel. Returns whether the
    /// write happened.
    async fn set_title_if_sentinel(&self, chat_id: &str, title: &str) -> Result<bool, AppError>;

    /// Unconditional rename by the owner. Returns false for unknown chats.
    async fn rename(&self, chat_id: &str, user_id: &str, title: &str) -> Result<bool, AppError>;

    /// The user's chats, newest first.
    async fn list_for_user(&self, user_id: &str) -> Result<Vec<Chat>, AppError>;

    async fn delete(&self, chat_id: &str, user_id: &str) -> Result<bool, AppError>;

    async fn delete_all_for_user(&self, user_id: &str) -> Result<u64, AppError>;

    async fn health_check(&self) -> Result<(), AppError>;
}
