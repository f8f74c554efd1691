pub mod chat;
pub mod chats;
pub mod health;

use crate::startup::AppState;
use service_core::error::AppError;
use service_core::protocol::Chat;

/// Load a chat the caller owns. Chats of other users look absent.
pub(crate) async fn owned_chat(
    state: &AppState,
    chat_id: &str,
    user_id: &str,
) -> Result<Chat, AppError> {
    match state.store.get(chat_id).await? {
        Some(chat) if chat.created_by == user_id => Ok(chat),
        _ => Err(AppError::NotFound(anyhow::anyhow!("Chat not found."))),
    }
}
