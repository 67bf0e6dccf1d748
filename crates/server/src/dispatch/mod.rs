//! Message dispatcher.
//!
//! Orchestrates a send: persist, bump room activity, fan out, and (for
//! AI-enabled rooms) run the risk pipeline and deliver the assistant's
//! reply. All sends into one room are serialized through a per-room
//! mutex so persistence order, broadcast order, and history order
//! agree; sends to different rooms proceed concurrently. The pipeline
//! itself runs outside that boundary so a hung oracle call cannot stall
//! the room.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{info, warn};

use crate::ai::RiskPipeline;
use crate::error::{ChatError, Result};
use crate::gateway::ConnectionRegistry;
use crate::models::{Message, MessageKind};
use crate::protocol::ServerEvent;
use crate::rooms::MembershipGuard;
use crate::store::ChatStore;

#[derive(Debug)]
pub struct SendOutcome {
    pub message: Message,
    pub ai_reply: Option<Message>,
}

pub struct MessageDispatcher {
    store: Arc<ChatStore>,
    registry: Arc<ConnectionRegistry>,
    guard: Arc<MembershipGuard>,
    pipeline: Arc<RiskPipeline>,
    room_locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
    max_content_len: usize,
    history_window: usize,
}

impl MessageDispatcher {
    pub fn new(
        store: Arc<ChatStore>,
        registry: Arc<ConnectionRegistry>,
        guard: Arc<MembershipGuard>,
        pipeline: Arc<RiskPipeline>,
        max_content_len: usize,
        history_window: usize,
    ) -> Self {
        Self {
            store,
            registry,
            guard,
            pipeline,
            room_locks: Mutex::new(HashMap::new()),
            max_content_len,
            history_window,
        }
    }

    /// Accepts, persists, and fans out one message; produces the
    /// assistant's reply for AI-enabled rooms.
    ///
    /// A persistence failure aborts the call before anything is
    /// broadcast. Everything after the user message is durable is
    /// best-effort: activity-bump and pipeline failures are logged and
    /// the already-delivered message stands.
    pub async fn send(
        &self,
        room_id: &str,
        sender_id: &str,
        content: &str,
        kind: Option<MessageKind>,
    ) -> Result<SendOutcome> {
        let content = content.trim();
        if content.is_empty() {
            return Err(ChatError::bad_request("message content is empty"));
        }
        if content.len() > self.max_content_len {
            return Err(ChatError::bad_request("message content too long"));
        }

        let room = self
            .store
            .find_room(room_id)
            .await?
            .filter(|r| r.is_active)
            .ok_or(ChatError::RoomNotFound)?;

        if !self.guard.authorize(room_id, sender_id).await? {
            return Err(ChatError::NotAMember);
        }

        let kind = kind.unwrap_or_default();
        let lock = self.room_lock(room_id);

        let message = {
            let _serial = lock.lock().await;

            let message = Message::user(room_id, sender_id, content, kind);
            self.store.insert_message(&message).await?;

            if let Err(e) = self.store.touch_room_activity(room_id).await {
                warn!("[Dispatch] Failed to bump activity for room {room_id}: {e}");
            }

            self.registry
                .broadcast(room_id, ServerEvent::new_message(&message), None);
            message
        };

        info!(
            "[Dispatch] Message {} from {} in room {}",
            message.id, sender_id, room_id
        );

        let ai_reply = if room.assistant_enabled() {
            self.assistant_turn(room_id, &message).await
        } else {
            None
        };

        Ok(SendOutcome { message, ai_reply })
    }

    /// Runs the risk pipeline for one user message and delivers the
    /// assistant's reply. Never fails the surrounding send: any error
    /// here is logged and surfaces only as the absence of a reply.
    async fn assistant_turn(&self, room_id: &str, user_message: &Message) -> Option<Message> {
        let history = match self
            .store
            .recent_messages(room_id, self.history_window as u32 + 1)
            .await
        {
            Ok(messages) => messages,
            Err(e) => {
                warn!("[Dispatch] Could not load context for room {room_id}: {e}");
                Vec::new()
            }
        };
        // Prior messages only; the triggering message is the prompt.
        let context: Vec<Message> = history
            .into_iter()
            .filter(|m| m.id != user_message.id)
            .collect();

        let assessment = self.pipeline.analyze(&user_message.content, &context).await;
        if assessment.crisis.requires_intervention {
            warn!(
                "[Dispatch] Crisis intervention in room {room_id} (score {})",
                assessment.crisis.risk_score
            );
        }

        let reply = Message::assistant(room_id, &assessment);

        let lock = self.room_lock(room_id);
        let _serial = lock.lock().await;
        match self.store.insert_message(&reply).await {
            Ok(()) => {
                self.registry
                    .broadcast(room_id, ServerEvent::new_message(&reply), None);
                Some(reply)
            }
            Err(e) => {
                warn!("[Dispatch] Assistant reply for room {room_id} dropped: {e}");
                None
            }
        }
    }

    fn room_lock(&self, room_id: &str) -> Arc<AsyncMutex<()>> {
        self.room_locks
            .lock()
            .entry(room_id.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai::risk::test_oracles::{CannedOracle, FailingOracle};
    use crate::ai::risk::{FALLBACK_REPLY, RiskTables};
    use crate::ai::SupportOracle;
    use crate::models::{Author, ChatRoom, Participant, ParticipantRole, RoomKind};
    use crate::protocol::ServerEvent;
    use chrono::Utc;
    use tempfile::TempDir;
    use tokio::sync::mpsc;

    struct Fixture {
        store: Arc<ChatStore>,
        registry: Arc<ConnectionRegistry>,
        dispatcher: MessageDispatcher,
        _dir: TempDir,
    }

    async fn fixture(oracle: Arc<dyn SupportOracle>) -> Fixture {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(
            ChatStore::new(&dir.path().join("dispatch.sqlite"))
                .await
                .unwrap(),
        );
        let registry = Arc::new(ConnectionRegistry::new());
        let guard = Arc::new(MembershipGuard::new(store.clone(), 50));
        let pipeline = Arc::new(RiskPipeline::new(RiskTables::default(), oracle, 10));
        let dispatcher = MessageDispatcher::new(
            store.clone(),
            registry.clone(),
            guard,
            pipeline,
            2000,
            10,
        );
        Fixture {
            store,
            registry,
            dispatcher,
            _dir: dir,
        }
    }

    async fn seed_room(store: &ChatStore, kind: RoomKind, members: &[&str]) -> ChatRoom {
        let mut room = ChatRoom::new("room", kind, members[0], 50);
        for member in members {
            room.participants.push(Participant {
                user_id: member.to_string(),
                role: ParticipantRole::Member,
                joined_at: Utc::now(),
                is_active: true,
            });
        }
        store.insert_room(&room).await.unwrap();
        room
    }

    fn subscribe(fixture: &Fixture, conn_id: &str, room_id: &str) -> mpsc::UnboundedReceiver<ServerEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        fixture.registry.register(conn_id, tx);
        fixture.registry.subscribe(conn_id, room_id);
        rx
    }

    #[tokio::test]
    async fn plain_rooms_get_exactly_one_message_and_no_assistant() {
        let fx = fixture(Arc::new(CannedOracle("should never appear"))).await;
        let room = seed_room(&fx.store, RoomKind::Group, &["u1", "u2"]).await;
        let mut rx = subscribe(&fx, "c1", &room.id);

        let outcome = fx
            .dispatcher
            .send(&room.id, "u1", "hello everyone", None)
            .await
            .unwrap();

        assert!(outcome.ai_reply.is_none());
        assert_eq!(outcome.message.content, "hello everyone");

        let (messages, total) = fx.store.messages_page(&room.id, 1, 50).await.unwrap();
        assert_eq!(total, 1);
        assert!(messages.iter().all(|m| m.kind != MessageKind::AiResponse));

        // Exactly one live event.
        assert!(matches!(rx.try_recv().unwrap(), ServerEvent::NewMessage(_)));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn ai_rooms_deliver_user_message_then_reply() {
        let fx = fixture(Arc::new(CannedOracle("I'm glad you shared that."))).await;
        let room = seed_room(&fx.store, RoomKind::AiChat, &["u1"]).await;
        let mut rx = subscribe(&fx, "c1", &room.id);

        let outcome = fx
            .dispatcher
            .send(&room.id, "u1", "Feeling a bit better today", None)
            .await
            .unwrap();

        let reply = outcome.ai_reply.expect("assistant reply");
        assert_eq!(reply.content, "I'm glad you shared that.");
        assert_eq!(reply.kind, MessageKind::AiResponse);
        assert!(reply.author.is_assistant());
        assert!(reply.metadata.is_some());

        // User message strictly precedes the reply, live and in history.
        match rx.try_recv().unwrap() {
            ServerEvent::NewMessage(data) => assert!(!data.is_ai),
            other => panic!("unexpected event: {other:?}"),
        }
        match rx.try_recv().unwrap() {
            ServerEvent::NewMessage(data) => assert!(data.is_ai),
            other => panic!("unexpected event: {other:?}"),
        }

        let (messages, total) = fx.store.messages_page(&room.id, 1, 50).await.unwrap();
        assert_eq!(total, 2);
        assert!(matches!(messages[0].author, Author::Human(_)));
        assert!(messages[1].author.is_assistant());
    }

    #[tokio::test]
    async fn crisis_content_uses_the_fixed_template() {
        let fx = fixture(Arc::new(CannedOracle("free-form text"))).await;
        let room = seed_room(&fx.store, RoomKind::AiChat, &["u1"]).await;

        let outcome = fx
            .dispatcher
            .send(&room.id, "u1", "I want to kill myself tonight", None)
            .await
            .unwrap();

        let reply = outcome.ai_reply.expect("assistant reply");
        assert!(reply.content.starts_with("I'm really concerned about you right now."));
        assert_ne!(reply.content, "free-form text");
    }

    #[tokio::test]
    async fn oracle_outage_never_fails_the_send() {
        let fx = fixture(Arc::new(FailingOracle)).await;
        let room = seed_room(&fx.store, RoomKind::AiChat, &["u1"]).await;

        let outcome = fx
            .dispatcher
            .send(&room.id, "u1", "I feel okay today", None)
            .await
            .unwrap();

        let reply = outcome.ai_reply.expect("fallback reply still produced");
        assert_eq!(reply.content, FALLBACK_REPLY);
    }

    #[tokio::test]
    async fn sends_to_one_room_keep_their_order() {
        let fx = fixture(Arc::new(CannedOracle("unused"))).await;
        let room = seed_room(&fx.store, RoomKind::Group, &["u1", "u2"]).await;
        let mut rx = subscribe(&fx, "c1", &room.id);

        fx.dispatcher.send(&room.id, "u1", "A", None).await.unwrap();
        fx.dispatcher.send(&room.id, "u2", "B", None).await.unwrap();

        let (messages, _) = fx.store.messages_page(&room.id, 1, 50).await.unwrap();
        let history: Vec<_> = messages.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(history, vec!["A", "B"]);

        let mut live = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let ServerEvent::NewMessage(data) = event {
                live.push(data.content);
            }
        }
        assert_eq!(live, vec!["A", "B"]);
    }

    #[tokio::test]
    async fn inactive_participants_cannot_send() {
        let fx = fixture(Arc::new(CannedOracle("unused"))).await;
        let room = seed_room(&fx.store, RoomKind::Group, &["u1", "u2"]).await;
        fx.store.deactivate_participant(&room.id, "u2").await.unwrap();

        let err = fx
            .dispatcher
            .send(&room.id, "u2", "still here?", None)
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::NotAMember));

        let (_, total) = fx.store.messages_page(&room.id, 1, 50).await.unwrap();
        assert_eq!(total, 0);
    }

    #[tokio::test]
    async fn blank_content_is_rejected() {
        let fx = fixture(Arc::new(CannedOracle("unused"))).await;
        let room = seed_room(&fx.store, RoomKind::Group, &["u1"]).await;

        let err = fx
            .dispatcher
            .send(&room.id, "u1", "   \n  ", None)
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::BadRequest(_)));
    }

    #[tokio::test]
    async fn message_counter_tracks_user_sends() {
        let fx = fixture(Arc::new(CannedOracle("unused"))).await;
        let room = seed_room(&fx.store, RoomKind::Group, &["u1"]).await;

        fx.dispatcher.send(&room.id, "u1", "one", None).await.unwrap();
        fx.dispatcher.send(&room.id, "u1", "two", None).await.unwrap();

        let found = fx.store.find_room(&room.id).await.unwrap().unwrap();
        assert_eq!(found.message_count, 2);
    }
}
