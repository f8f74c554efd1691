use super::owned_chat;
use crate::middleware::UserId;
use crate::services::SessionRequest;
use crate::startup::AppState;
use axum::{
    extract::{Path, State},
    response::sse::{Event, KeepAlive, Sse},
    Json,
};
use futures::{Stream, StreamExt};
use serde_json::{json, Value};
use service_core::error::AppError;
use service_core::protocol::{
    ChatRequest, DeleteChatRequest, GenerateTitleRequest, GenerateTitleResponse,
    RenameChatRequest,
};
use validator::Validate;

/// `POST /api/chat`: relay one chat turn as a server-sent event stream.
pub async fn post_chat(
    State(state): State<AppState>,
    UserId(user_id): UserId,
    Json(body): Json<ChatRequest>,
) -> Result<Sse<impl Stream<Item = Result<Event, axum::Error>>>, AppError> {
    body.validate()?;

    tracing::info!(
        chat_id = %body.chat_id,
        request_id = %body.request_id,
        model_id = %body.model.id,
        message_count = body.messages.len(),
        "Chat request accepted"
    );

    let events = state.relay.run_session(SessionRequest::new(body, user_id));

    Ok(Sse::new(events.map(|event| Event::default().json_data(event)))
        .keep_alive(KeepAlive::default()))
}

/// `POST /api/chat/generate-title`
pub async fn generate_title(
    State(state): State<AppState>,
    UserId(user_id): UserId,
    Json(body): Json<GenerateTitleRequest>,
) -> Result<Json<GenerateTitleResponse>, AppError> {
    body.validate()?;
    owned_chat(&state, &body.chat_id, &user_id).await?;

    let outcome = state
        .relay
        .generate_title(&body.chat_id, &body.model_id, &body.messages)
        .await?;

    Ok(Json(outcome))
}

/// `POST /api/chat/:chat_id/stop`
pub async fn stop_chat(
    State(state): State<AppState>,
    UserId(user_id): UserId,
    Path(chat_id): Path<String>,
) -> Result<Json<Value>, AppError> {
    owned_chat(&state, &chat_id, &user_id).await?;

    state
        .relay
        .cancel(&chat_id)
        .map_err(|e| AppError::NotFound(anyhow::anyhow!(e)))?;

    tracing::info!(chat_id = %chat_id, "Stop requested");
    Ok(Json(json!({ "stopped": true })))
}

/// `PATCH /api/chat/:chat_id/title`
pub async fn rename_chat(
    State(state): State<AppState>,
    UserId(user_id): UserId,
    Path(chat_id): Path<String>,
    Json(body): Json<RenameChatRequest>,
) -> Result<Json<Value>, AppError> {
    body.validate()?;
    let title = body.title.trim();

    if !state.store.rename(&chat_id, &user_id, title).await? {
        return Err(AppError::NotFound(anyhow::anyhow!("Chat not found.")));
    }

    Ok(Json(json!({ "id": chat_id, "title": title })))
}

/// `DELETE /api/chat`
pub async fn delete_chat(
    State(state): State<AppState>,
    UserId(user_id): UserId,
    Json(body): Json<DeleteChatRequest>,
) -> Result<Json<bool>, AppError> {
    body.validate()?;

    let deleted = state.store.delete(&body.id, &user_id).await?;
    if deleted {
        // A session still streaming into a deleted chat has nowhere to land.
        let _ = state.relay.cancel(&body.id);
        state.relay.forget_chat(&body.id);
    }

    Ok(Json(deleted))
}
