//! Room management endpoints.

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
use crate::models::{ChatRoom, CreateRoomInput, Pagination, RoomKind};

#[derive(Debug, Deserialize)]
pub struct ListRoomsQuery {
    #[serde(default = "default_page")]
    pub page: u32,
    #[serde(default = "default_limit")]
    pub limit: u32,
    pub kind: Option<RoomKind>,
}

fn default_page() -> u32 {
    1
}

fn default_limit() -> u32 {
    20
}

#[derive(Debug, Serialize)]
pub struct RoomListResponse {
    pub rooms: Vec<ChatRoom>,
    pub pagination: Pagination,
}

#[derive(Debug, Serialize)]
pub struct JoinResponse {
    pub room_id: String,
    pub is_new_participant: bool,
}

/// POST /chat/rooms
pub async fn create_room(
    State(state): State<AppState>,
    ctx: Ctx,
    Json(input): Json<CreateRoomInput>,
) -> Result<(StatusCode, Json<ChatRoom>)> {
    info!("POST /chat/rooms - {}", ctx.user_id());

    let room = state.guard.create_room(ctx.user_id(), input).await?;
    Ok((StatusCode::CREATED, Json(room)))
}

/// GET /chat/rooms
///
/// The caller's rooms, most recently active first.
pub async fn list_rooms(
    State(state): State<AppState>,
    ctx: Ctx,
    Query(query): Query<ListRoomsQuery>,
) -> Result<Json<RoomListResponse>> {
    info!("GET /chat/rooms - {}", ctx.user_id());

    let limit = query.limit.clamp(1, 100);
    let page = query.page.max(1);
    let (rooms, total) = state
        .store
        .rooms_for_user(ctx.user_id(), query.kind, page, limit)
        .await?;

    Ok(Json(RoomListResponse {
        rooms,
        pagination: Pagination::new(page, limit, total),
    }))
}

/// GET /chat/rooms/{room_id}
pub async fn get_room(
    State(state): State<AppState>,
    ctx: Ctx,
    Path(room_id): Path<String>,
) -> Result<Json<ChatRoom>> {
    info!("GET /chat/rooms/{room_id}");

    let room = state
        .store
        .find_room(&room_id)
        .await?
        .filter(|r| r.is_active)
        .ok_or(ChatError::RoomNotFound)?;

    if room.active_participant(ctx.user_id()).is_none() {
        return Err(ChatError::NotAMember);
    }

    Ok(Json(room))
}

/// POST /chat/rooms/{room_id}/join
pub async fn join_room(
    State(state): State<AppState>,
    ctx: Ctx,
    Path(room_id): Path<String>,
) -> Result<Json<JoinResponse>> {
    info!("POST /chat/rooms/{room_id}/join - {}", ctx.user_id());

    let outcome = state.guard.join(&room_id, ctx.user_id()).await?;
    Ok(Json(JoinResponse {
        room_id: outcome.room.id,
        is_new_participant: outcome.is_new_participant,
    }))
}

/// POST /chat/rooms/{room_id}/leave
pub async fn leave_room(
    State(state): State<AppState>,
    ctx: Ctx,
    Path(room_id): Path<String>,
) -> Result<StatusCode> {
    info!("POST /chat/rooms/{room_id}/leave - {}", ctx.user_id());

    state.guard.leave(&room_id, ctx.user_id()).await?;
    Ok(StatusCode::OK)
}
