//! Message history and the non-live send path.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::auth::Ctx;
use crate::config::AppState;
use crate::error::{ChatError, Result};
use crate::models::{Pagination, SendMessageInput};
use crate::protocol::MessageData;

#[derive(Debug, Deserialize)]
pub struct ListMessagesQuery {
    #[serde(default = "default_page")]
    pub page: u32,
    #[serde(default = "default_limit")]
    pub limit: u32,
}

fn default_page() -> u32 {
    1
}

fn default_limit() -> u32 {
    50
}

#[derive(Debug, Serialize)]
pub struct MessageListResponse {
    pub messages: Vec<MessageData>,
    pub pagination: Pagination,
}

#[derive(Debug, Serialize)]
pub struct SendMessageResponse {
    pub message: MessageData,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ai_reply: Option<MessageData>,
}

/// GET /chat/rooms/{room_id}/messages
///
/// Paginated history, oldest first within the returned page. Page 1 is
/// the newest page, so disconnected subscribers catch up from the tail.
pub async fn list_messages(
    State(state): State<AppState>,
    ctx: Ctx,
    Path(room_id): Path<String>,
    Query(query): Query<ListMessagesQuery>,
) -> Result<Json<MessageListResponse>> {
    info!("GET /chat/rooms/{room_id}/messages");

    let room = state
        .store
        .find_room(&room_id)
        .await?
        .filter(|r| r.is_active)
        .ok_or(ChatError::RoomNotFound)?;

    if room.active_participant(ctx.user_id()).is_none() {
        return Err(ChatError::NotAMember);
    }

    let limit = query.limit.clamp(1, 100);
    let page = query.page.max(1);
    let (messages, total) = state.store.messages_page(&room_id, page, limit).await?;

    Ok(Json(MessageListResponse {
        messages: messages.iter().map(MessageData::from).collect(),
        pagination: Pagination::new(page, limit, total),
    }))
}

/// POST /chat/rooms/{room_id}/messages
///
/// Non-live fallback path, identical in contract to the live
/// `send_message` event.
pub async fn send_message(
    State(state): State<AppState>,
    ctx: Ctx,
    Path(room_id): Path<String>,
    Json(input): Json<SendMessageInput>,
) -> Result<(StatusCode, Json<SendMessageResponse>)> {
    info!("POST /chat/rooms/{room_id}/messages - {}", ctx.user_id());

    let outcome = state
        .dispatcher
        .send(&room_id, ctx.user_id(), &input.content, input.message_type)
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(SendMessageResponse {
            message: MessageData::from(&outcome.message),
            ai_reply: outcome.ai_reply.as_ref().map(MessageData::from),
        }),
    ))
}
