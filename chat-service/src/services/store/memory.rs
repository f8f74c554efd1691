use super::ChatStore;
use async_trait::async_trait;
use service_core::error::AppError;
use service_core::protocol::{Chat, Message};
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Process-local store for development and tests.
#[derive(Default)]
pub struct MemoryChatStore {
    chats: RwLock<HashMap<String, Chat>>,
}

impl MemoryChatStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn not_found(chat_id: &str) -> AppError {
    AppError::NotFound(anyhow::anyhow!("Chat {} not found", chat_id))
}

#[async_trait]
impl ChatStore for MemoryChatStore {
    async fn get_or_create(&self, chat_id: &str, user_id: &str) -> Result<Chat, AppError> {
        let mut chats = self.chats.write().await;
        Ok(chats
            .entry(chat_id.to_string())
            .or_insert_with(|| Chat::new(chat_id, user_id))
            .clone())
    }

    async fn get(&self, chat_id: &str) -> Result<Option<Chat>, AppError> {
        Ok(self.chats.read().await.get(chat_id).cloned())
    }

    async fn save_messages(&self, chat_id: &str, messages: &[Message]) -> Result<(), AppError> {
        let mut chats = self.chats.write().await;
        let chat = chats.get_mut(chat_id).ok_or_else(|| not_found(chat_id))?;
        chat.messages = messages.to_vec();
        Ok(())
    }

    async fn set_title_if_sentinel(&self, chat_id: &str, title: &str) -> Result<bool, AppError> {
        let mut chats = self.chats.write().await;
        match chats.get_mut(chat_id) {
            Some(chat) if chat.has_sentinel_title() => {
                chat.title = title.to_string();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn rename(&self, chat_id: &str, user_id: &str, title: &str) -> Result<bool, AppError> {
        let mut chats = self.chats.write().await;
        match chats.get_mut(chat_id) {
            Some(chat) if chat.created_by == user_id => {
                chat.title = title.to_string();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn list_for_user(&self, user_id: &str) -> Result<Vec<Chat>, AppError> {
        let chats = self.chats.read().await;
        let mut owned: Vec<Chat> = chats
            .values()
            .filter(|c| c.created_by == user_id)
            .cloned()
            .collect();
        owned.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(owned)
    }

    async fn delete(&self, chat_id: &str, user_id: &str) -> Result<bool, AppError> {
        let mut chats = self.chats.write().await;
        if chats.get(chat_id).is_some_and(|c| c.created_by == user_id) {
            chats.remove(chat_id);
            return Ok(true);
        }
        Ok(false)
    }

    async fn delete_all_for_user(&self, user_id: &str) -> Result<u64, AppError> {
        let mut chats = self.chats.write().await;
        let before = chats.len();
        chats.retain(|_, c| c.created_by != user_id);
        Ok((before - chats.len()) as u64)
    }

    async fn health_check(&self) -> Result<(), AppError> {
        Ok(())
    }
}
