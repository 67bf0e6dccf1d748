//! Room membership guard.
//!
//! Enforces who may join, post into, and leave a room. Membership
//! records are soft-state: leaving deactivates the record and a later
//! rejoin reactivates the same record with its role intact.

use std::sync::Arc;

use chrono::Utc;
use tracing::info;

use crate::error::{ChatError, Result};
use crate::models::{ChatRoom, CreateRoomInput, Participant, ParticipantRole, RoomKind};
use crate::store::ChatStore;

#[derive(Debug)]
pub struct JoinOutcome {
    pub room: ChatRoom,
    pub is_new_participant: bool,
}

pub struct MembershipGuard {
    store: Arc<ChatStore>,
    default_capacity: i64,
}

impl MembershipGuard {
    pub fn new(store: Arc<ChatStore>, default_capacity: i64) -> Self {
        Self {
            store,
            default_capacity,
        }
    }

    /// Admits a user into a room.
    ///
    /// An existing (possibly inactive) participant record is reactivated
    /// with a fresh joined-at; the role survives leave/rejoin cycles.
    /// New participants are admitted as `member` subject to capacity.
    pub async fn join(&self, room_id: &str, user_id: &str) -> Result<JoinOutcome> {
        let mut room = self
            .store
            .find_room(room_id)
            .await?
            .filter(|r| r.is_active)
            .ok_or(ChatError::RoomNotFound)?;

        let now = Utc::now();

        if let Some(existing) = room
            .participants
            .iter_mut()
            .find(|p| p.user_id == user_id)
        {
            if !existing.is_active {
                existing.is_active = true;
                existing.joined_at = now;
                self.store
                    .reactivate_participant(room_id, user_id, now)
                    .await?;
                info!("[Rooms] {user_id} rejoined {room_id} as {}", existing.role.as_str());
            }
            return Ok(JoinOutcome {
                room,
                is_new_participant: false,
            });
        }

        if room.active_participants() as i64 >= room.max_participants {
            return Err(ChatError::RoomFull);
        }

        let participant = Participant {
            user_id: user_id.to_string(),
            role: ParticipantRole::Member,
            joined_at: now,
            is_active: true,
        };
        self.store.insert_participant(room_id, &participant).await?;
        room.participants.push(participant);

        info!("[Rooms] {user_id} joined {room_id}");
        Ok(JoinOutcome {
            room,
            is_new_participant: true,
        })
    }

    /// True iff the user holds an active participant record. Gates both
    /// room subscription and posting.
    pub async fn authorize(&self, room_id: &str, user_id: &str) -> Result<bool> {
        self.store.is_active_participant(room_id, user_id).await
    }

    /// Deactivates the membership record. The record itself is retained
    /// for history.
    pub async fn leave(&self, room_id: &str, user_id: &str) -> Result<()> {
        let room = self
            .store
            .find_room(room_id)
            .await?
            .ok_or(ChatError::RoomNotFound)?;

        match room.participant(user_id) {
            Some(p) if p.is_active => {
                self.store.deactivate_participant(room_id, user_id).await?;
                info!("[Rooms] {user_id} left {room_id}");
                Ok(())
            }
            _ => Err(ChatError::NotAMember),
        }
    }

    /// Creates a room with the creator as `admin` plus any valid initial
    /// participants as `member`.
    pub async fn create_room(&self, creator_id: &str, input: CreateRoomInput) -> Result<ChatRoom> {
        let name = input.name.trim();
        if name.is_empty() {
            return Err(ChatError::bad_request("room name is required"));
        }
        if name.len() > 100 {
            return Err(ChatError::bad_request("room name too long"));
        }
        if input
            .description
            .as_deref()
            .is_some_and(|d| d.len() > 500)
        {
            return Err(ChatError::bad_request("room description too long"));
        }

        let capacity = input.max_participants.unwrap_or(self.default_capacity);
        if capacity < 1 {
            return Err(ChatError::bad_request("room capacity must be positive"));
        }

        let mut room = ChatRoom::new(name, input.kind, creator_id, capacity);
        room.description = input.description.filter(|d| !d.trim().is_empty());
        room.is_private = input.is_private;
        room.ai_enabled = input.kind == RoomKind::AiChat || input.ai_enabled;

        let now = Utc::now();
        room.participants.push(Participant {
            user_id: creator_id.to_string(),
            role: ParticipantRole::Admin,
            joined_at: now,
            is_active: true,
        });

        for user_id in &input.participants {
            if user_id == creator_id || room.participant(user_id).is_some() {
                continue;
            }
            // Only known, active identities become initial participants.
            let valid = self
                .store
                .identity(user_id)
                .await?
                .is_some_and(|identity| identity.is_active);
            if valid {
                room.participants.push(Participant {
                    user_id: user_id.clone(),
                    role: ParticipantRole::Member,
                    joined_at: now,
                    is_active: true,
                });
            }
        }

        self.store.insert_room(&room).await?;
        Ok(room)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn guard() -> (MembershipGuard, Arc<ChatStore>, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(
            ChatStore::new(&dir.path().join("rooms.sqlite"))
                .await
                .unwrap(),
        );
        (MembershipGuard::new(store.clone(), 50), store, dir)
    }

    async fn seed_room(store: &ChatStore, capacity: i64) -> ChatRoom {
        let mut room = ChatRoom::new("support circle", RoomKind::Group, "creator", capacity);
        room.participants.push(Participant {
            user_id: "creator".into(),
            role: ParticipantRole::Admin,
            joined_at: Utc::now(),
            is_active: true,
        });
        store.insert_room(&room).await.unwrap();
        room
    }

    #[tokio::test]
    async fn join_unknown_room_fails() {
        let (guard, _store, _dir) = guard().await;
        let err = guard.join("nope", "u1").await.unwrap_err();
        assert!(matches!(err, ChatError::RoomNotFound));
    }

    #[tokio::test]
    async fn full_room_rejects_and_count_is_unchanged() {
        let (guard, store, _dir) = guard().await;
        let room = seed_room(&store, 2).await;

        let outcome = guard.join(&room.id, "u1").await.unwrap();
        assert!(outcome.is_new_participant);

        let err = guard.join(&room.id, "u2").await.unwrap_err();
        assert!(matches!(err, ChatError::RoomFull));

        let found = store.find_room(&room.id).await.unwrap().unwrap();
        assert_eq!(found.active_participants(), 2);
    }

    #[tokio::test]
    async fn rejoin_reactivates_same_record_with_original_role() {
        let (guard, store, _dir) = guard().await;
        let mut room = ChatRoom::new("therapy", RoomKind::TherapySession, "t1", 10);
        room.participants.push(Participant {
            user_id: "t1".into(),
            role: ParticipantRole::Therapist,
            joined_at: Utc::now(),
            is_active: true,
        });
        store.insert_room(&room).await.unwrap();

        guard.leave(&room.id, "t1").await.unwrap();
        assert!(!guard.authorize(&room.id, "t1").await.unwrap());

        let outcome = guard.join(&room.id, "t1").await.unwrap();
        assert!(!outcome.is_new_participant);

        let found = store.find_room(&room.id).await.unwrap().unwrap();
        let participant = found.participant("t1").unwrap();
        assert!(participant.is_active);
        // A demoted or promoted role persists across leave/rejoin.
        assert_eq!(participant.role, ParticipantRole::Therapist);
        assert_eq!(found.participants.len(), 1);
    }

    #[tokio::test]
    async fn leave_requires_active_membership() {
        let (guard, store, _dir) = guard().await;
        let room = seed_room(&store, 10).await;

        let err = guard.leave(&room.id, "stranger").await.unwrap_err();
        assert!(matches!(err, ChatError::NotAMember));

        guard.leave(&room.id, "creator").await.unwrap();
        let err = guard.leave(&room.id, "creator").await.unwrap_err();
        assert!(matches!(err, ChatError::NotAMember));

        // Record is retained, only deactivated.
        let found = store.find_room(&room.id).await.unwrap().unwrap();
        assert!(found.participant("creator").is_some());
        assert_eq!(found.active_participants(), 0);
    }

    #[tokio::test]
    async fn create_room_seeds_creator_as_admin() {
        let (guard, store, _dir) = guard().await;
        store.seed_identity("u2", "bo", true).await;
        store.seed_identity("u3", "cy", false).await;

        let room = guard
            .create_room(
                "u1",
                CreateRoomInput {
                    name: "evening check-in".into(),
                    description: Some("Daily group".into()),
                    kind: RoomKind::PeerSupport,
                    participants: vec!["u1".into(), "u2".into(), "u3".into(), "ghost".into()],
                    is_private: false,
                    max_participants: None,
                    ai_enabled: false,
                },
            )
            .await
            .unwrap();

        assert_eq!(room.participant("u1").unwrap().role, ParticipantRole::Admin);
        // Only the known active identity was added alongside the creator.
        assert_eq!(room.participants.len(), 2);
        assert!(room.participant("u2").is_some());
    }
}
