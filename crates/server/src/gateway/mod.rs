//! Connection gateway.
//!
//! One long-lived task per WebSocket connection. The credential is
//! validated before the upgrade completes; a rejected connection never
//! creates any state. Once admitted, the connection registers its
//! presence locator, then moves between at most one room subscription
//! at a time until the transport closes.
//!
//! Handler errors are caught here and converted into an `error` event
//! to the originating connection only; they never tear down the
//! connection or affect anyone else's.

pub mod registry;

pub use registry::ConnectionRegistry;

use axum::{
    extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
    extract::{Query, State},
    http::HeaderMap,
    response::{IntoResponse, Response},
};
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::auth::bearer_token;
use crate::config::AppState;
use crate::error::{ChatError, Result};
use crate::models::{Author, Identity};
use crate::protocol::{ClientEvent, ServerEvent};

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    pub token: Option<String>,
}

/// GET /ws
///
/// Upgrades to the persistent connection. The bearer token comes from
/// the `token` query parameter or the Authorization header.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<WsQuery>,
    headers: HeaderMap,
    State(state): State<AppState>,
) -> Response {
    let token = query.token.or_else(|| bearer_token(&headers));

    let identity = match state.auth.authenticate(token.as_deref()).await {
        Ok(identity) => identity,
        // Refused before any connection state exists.
        Err(e) => return e.into_response(),
    };

    ws.on_upgrade(move |socket| handle_connection(socket, identity, state))
}

async fn handle_connection(socket: WebSocket, identity: Identity, state: AppState) {
    let conn_id = Uuid::new_v4().to_string();
    info!("[Gateway] {} connected ({})", identity.username, conn_id);

    let (mut ws_tx, mut ws_rx) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerEvent>();

    state.registry.register(&conn_id, tx.clone());
    if let Err(e) = state.presence.register(&identity.id, &conn_id).await {
        warn!("[Gateway] Presence registration failed for {}: {e}", identity.id);
    }

    // Writer task: drains the outbound channel onto the socket.
    let mut writer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let Ok(json) = serde_json::to_string(&event) else {
                continue;
            };
            if ws_tx.send(WsMessage::Text(json.into())).await.is_err() {
                break;
            }
        }
    });

    loop {
        tokio::select! {
            incoming = ws_rx.next() => match incoming {
                Some(Ok(WsMessage::Text(text))) => {
                    let event = match serde_json::from_str::<ClientEvent>(&text) {
                        Ok(event) => event,
                        Err(e) => {
                            let _ = tx.send(ServerEvent::error(format!("invalid event: {e}")));
                            continue;
                        }
                    };
                    if let Err(e) = handle_event(event, &conn_id, &identity, &state).await {
                        let _ = tx.send(ServerEvent::error(e.to_string()));
                    }
                }
                Some(Ok(WsMessage::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!("[Gateway] Socket error on {conn_id}: {e}");
                    break;
                }
            },
            _ = &mut writer => break,
        }
    }

    // Teardown: drop the subscription, tell the room, release presence.
    if let Some(room_id) = state.registry.deregister(&conn_id) {
        state.registry.broadcast(
            &room_id,
            ServerEvent::UserLeft {
                user_id: identity.id.clone(),
                username: identity.username.clone(),
                timestamp: Utc::now(),
            },
            None,
        );
    }
    if let Err(e) = state.presence.deregister(&identity.id).await {
        warn!("[Gateway] Presence deregistration failed for {}: {e}", identity.id);
    }
    writer.abort();

    info!("[Gateway] {} disconnected ({})", identity.username, conn_id);
}

async fn handle_event(
    event: ClientEvent,
    conn_id: &str,
    identity: &Identity,
    state: &AppState,
) -> Result<()> {
    match event {
        ClientEvent::JoinRoom { room_id } => {
            let outcome = state.guard.join(&room_id, &identity.id).await?;

            // A connection holds at most one room subscription; joining
            // replaces the previous one.
            state.registry.subscribe(conn_id, &room_id);

            state.registry.broadcast(
                &room_id,
                ServerEvent::UserJoined {
                    user_id: identity.id.clone(),
                    username: identity.username.clone(),
                    timestamp: Utc::now(),
                },
                Some(conn_id),
            );
            state.registry.send_to(
                conn_id,
                ServerEvent::RoomJoined {
                    room_id: room_id.clone(),
                    room_name: outcome.room.name.clone(),
                    participants: outcome.room.active_participants(),
                },
            );
            Ok(())
        }

        ClientEvent::SendMessage {
            room_id,
            content,
            message_type,
        } => {
            if state.registry.current_room(conn_id).as_deref() != Some(room_id.as_str()) {
                return Err(ChatError::bad_request("you are not in this room"));
            }
            state
                .dispatcher
                .send(&room_id, &identity.id, &content, message_type)
                .await?;
            Ok(())
        }

        ClientEvent::TypingStart { room_id } => {
            if state.registry.current_room(conn_id).as_deref() == Some(room_id.as_str()) {
                state.registry.broadcast(
                    &room_id,
                    ServerEvent::UserTyping {
                        user_id: identity.id.clone(),
                        username: identity.username.clone(),
                    },
                    Some(conn_id),
                );
            }
            Ok(())
        }

        ClientEvent::TypingStop { room_id } => {
            if state.registry.current_room(conn_id).as_deref() == Some(room_id.as_str()) {
                state.registry.broadcast(
                    &room_id,
                    ServerEvent::UserStoppedTyping {
                        user_id: identity.id.clone(),
                    },
                    Some(conn_id),
                );
            }
            Ok(())
        }

        ClientEvent::MarkMessageRead { message_id } => {
            let Some(message) = state.store.find_message(&message_id).await? else {
                return Ok(());
            };

            let read_at = Utc::now();
            state.store.mark_read(&message_id, &identity.id, read_at).await?;

            // Best-effort read notification to the author, if their
            // connection can currently be located. Assistant messages
            // have no author to notify.
            if let Author::Human(author_id) = &message.author {
                if let Ok(Some(locator)) = state.presence.locate(author_id).await {
                    state.registry.send_to(
                        &locator,
                        ServerEvent::MessageRead {
                            message_id,
                            read_by: identity.id.clone(),
                            read_at,
                        },
                    );
                }
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai::risk::test_oracles::CannedOracle;
    use crate::ai::{RiskPipeline, RiskTables};
    use crate::auth::Authenticator;
    use crate::config::ServerConfig;
    use crate::dispatch::MessageDispatcher;
    use crate::models::{ChatRoom, MessageKind, Participant, ParticipantRole, RoomKind};
    use crate::presence::PresenceTracker;
    use crate::rooms::MembershipGuard;
    use crate::store::ChatStore;
    use std::sync::Arc;
    use tempfile::TempDir;

    async fn test_state() -> (AppState, TempDir) {
        let dir = TempDir::new().unwrap();
        let config = ServerConfig {
            db_path: dir.path().join("gateway.sqlite"),
            ..ServerConfig::default()
        };
        let store = Arc::new(ChatStore::new(&config.db_path).await.unwrap());
        let registry = Arc::new(ConnectionRegistry::new());
        let guard = Arc::new(MembershipGuard::new(
            store.clone(),
            config.default_room_capacity,
        ));
        let pipeline = Arc::new(RiskPipeline::new(
            RiskTables::default(),
            Arc::new(CannedOracle("ok")),
            config.history_window,
        ));
        let dispatcher = Arc::new(MessageDispatcher::new(
            store.clone(),
            registry.clone(),
            guard.clone(),
            pipeline,
            config.max_content_len,
            config.history_window,
        ));
        let state = AppState {
            auth: Arc::new(Authenticator::new(store.clone())),
            presence: Arc::new(PresenceTracker::new(
                store.clone(),
                config.presence_ttl_secs,
            )),
            registry,
            guard,
            dispatcher,
            store,
            config,
        };
        (state, dir)
    }

    fn identity(id: &str, username: &str) -> Identity {
        Identity {
            id: id.to_string(),
            email: format!("{username}@example.com"),
            username: username.to_string(),
            is_active: true,
        }
    }

    fn connect(state: &AppState, conn_id: &str) -> mpsc::UnboundedReceiver<ServerEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        state.registry.register(conn_id, tx);
        rx
    }

    async fn seed_room(state: &AppState, members: &[&str]) -> ChatRoom {
        let mut room = ChatRoom::new("room", RoomKind::Group, members[0], 50);
        for member in members {
            room.participants.push(Participant {
                user_id: member.to_string(),
                role: ParticipantRole::Member,
                joined_at: Utc::now(),
                is_active: true,
            });
        }
        state.store.insert_room(&room).await.unwrap();
        room
    }

    #[tokio::test]
    async fn join_confirms_to_self_and_announces_to_others() {
        let (state, _dir) = test_state().await;
        let room = seed_room(&state, &["u1", "u2"]).await;

        let mut rx1 = connect(&state, "c1");
        let mut rx2 = connect(&state, "c2");
        state.registry.subscribe("c2", &room.id);

        handle_event(
            ClientEvent::JoinRoom {
                room_id: room.id.clone(),
            },
            "c1",
            &identity("u1", "ada"),
            &state,
        )
        .await
        .unwrap();

        match rx1.try_recv().unwrap() {
            ServerEvent::RoomJoined {
                room_id,
                participants,
                ..
            } => {
                assert_eq!(room_id, room.id);
                assert_eq!(participants, 2);
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert!(matches!(
            rx2.try_recv().unwrap(),
            ServerEvent::UserJoined { user_id, .. } if user_id == "u1"
        ));
    }

    #[tokio::test]
    async fn sending_requires_a_live_subscription() {
        let (state, _dir) = test_state().await;
        let room = seed_room(&state, &["u1"]).await;
        let _rx = connect(&state, "c1");

        let err = handle_event(
            ClientEvent::SendMessage {
                room_id: room.id.clone(),
                content: "hi".into(),
                message_type: None,
            },
            "c1",
            &identity("u1", "ada"),
            &state,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ChatError::BadRequest(_)));

        state.registry.subscribe("c1", &room.id);
        handle_event(
            ClientEvent::SendMessage {
                room_id: room.id.clone(),
                content: "hi".into(),
                message_type: Some(MessageKind::Text),
            },
            "c1",
            &identity("u1", "ada"),
            &state,
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn typing_indicators_reach_everyone_else_unpersisted() {
        let (state, _dir) = test_state().await;
        let room = seed_room(&state, &["u1", "u2"]).await;

        let mut rx1 = connect(&state, "c1");
        let mut rx2 = connect(&state, "c2");
        state.registry.subscribe("c1", &room.id);
        state.registry.subscribe("c2", &room.id);

        handle_event(
            ClientEvent::TypingStart {
                room_id: room.id.clone(),
            },
            "c1",
            &identity("u1", "ada"),
            &state,
        )
        .await
        .unwrap();

        assert!(rx1.try_recv().is_err());
        assert!(matches!(
            rx2.try_recv().unwrap(),
            ServerEvent::UserTyping { user_id, .. } if user_id == "u1"
        ));

        // Nothing was persisted for the indicator.
        let (_, total) = state.store.messages_page(&room.id, 1, 50).await.unwrap();
        assert_eq!(total, 0);
    }

    #[tokio::test]
    async fn read_receipts_notify_a_located_author_and_stay_idempotent() {
        let (state, _dir) = test_state().await;
        let room = seed_room(&state, &["u1", "u2"]).await;

        let mut rx_author = connect(&state, "c-author");
        state.presence.register("u1", "c-author").await.unwrap();

        let message = crate::models::Message::user(&room.id, "u1", "hello", MessageKind::Text);
        state.store.insert_message(&message).await.unwrap();

        let reader = identity("u2", "bo");
        for _ in 0..2 {
            handle_event(
                ClientEvent::MarkMessageRead {
                    message_id: message.id.clone(),
                },
                "c-reader",
                &reader,
                &state,
            )
            .await
            .unwrap();
        }

        let receipts = state.store.read_receipts(&message.id).await.unwrap();
        assert_eq!(receipts.len(), 1);

        // Author got notified (twice located, but one receipt row).
        assert!(matches!(
            rx_author.try_recv().unwrap(),
            ServerEvent::MessageRead { read_by, .. } if read_by == "u2"
        ));

        // Unlocated author: silent no-op.
        state.presence.deregister("u1").await.unwrap();
        handle_event(
            ClientEvent::MarkMessageRead {
                message_id: message.id.clone(),
            },
            "c-reader",
            &identity("u3", "cy"),
            &state,
        )
        .await
        .unwrap();
    }
}
