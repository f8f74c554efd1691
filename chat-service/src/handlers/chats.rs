use crate::middleware::UserId;
use crate::startup::AppState;
use axum::{extract::State, Json};
use service_core::error::AppError;
use service_core::protocol::{Chat, ModelInfo, SyncResponse};

/// `GET /api/chats`
pub async fn list_chats(
    State(state): State<AppState>,
    UserId(user_id): UserId,
) -> Result<Json<Vec<Chat>>, AppError> {
    Ok(Json(state.store.list_for_user(&user_id).await?))
}

/// `DELETE /api/chats`
pub async fn delete_chats(
    State(state): State<AppState>,
    UserId(user_id): UserId,
) -> Result<Json<bool>, AppError> {
    let owned = state.store.list_for_user(&user_id).await?;
    let deleted = state.store.delete_all_for_user(&user_id).await?;
    for chat in &owned {
        state.relay.forget_chat(&chat.id);
    }
    tracing::info!(user_id = %user_id, deleted, "Deleted all chats");
    Ok(Json(true))
}

/// `GET /api/models`
pub async fn list_models(
    State(state): State<AppState>,
    UserId(_): UserId,
) -> Result<Json<Vec<ModelInfo>>, AppError> {
    Ok(Json(state.credentials.list_models().await?))
}

/// `GET /api/sync`: everything a client replica needs to bootstrap.
pub async fn sync(
    State(state): State<AppState>,
    UserId(user_id): UserId,
) -> Result<Json<SyncResponse>, AppError> {
    let models = state.credentials.list_models().await?;
    let chats = state.store.list_for_user(&user_id).await?;
    Ok(Json(SyncResponse { models, chats }))
}
