//! Wire protocol for the persistent connection.
//!
//! Events are JSON objects tagged with `type`. Client events arrive on
//! the socket; server events are pushed back out, either to one
//! connection or fanned out to a room.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{Message, MessageKind, MessageMetadata};

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientEvent {
    JoinRoom {
        room_id: String,
    },
    SendMessage {
        room_id: String,
        content: String,
        #[serde(default)]
        message_type: Option<MessageKind>,
    },
    TypingStart {
        room_id: String,
    },
    TypingStop {
        room_id: String,
    },
    MarkMessageRead {
        message_id: String,
    },
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    RoomJoined {
        room_id: String,
        room_name: String,
        participants: usize,
    },
    UserJoined {
        user_id: String,
        username: String,
        timestamp: DateTime<Utc>,
    },
    NewMessage(MessageData),
    UserTyping {
        user_id: String,
        username: String,
    },
    UserStoppedTyping {
        user_id: String,
    },
    MessageRead {
        message_id: String,
        read_by: String,
        read_at: DateTime<Utc>,
    },
    UserLeft {
        user_id: String,
        username: String,
        timestamp: DateTime<Utc>,
    },
    Error {
        message: String,
    },
}

impl ServerEvent {
    pub fn new_message(message: &Message) -> Self {
        ServerEvent::NewMessage(MessageData::from(message))
    }

    pub fn error(message: impl Into<String>) -> Self {
        ServerEvent::Error {
            message: message.into(),
        }
    }
}

/// Message payload as delivered to clients, shared by the live event
/// and the HTTP history surface. `sender` is null exactly for the
/// assistant.
#[derive(Debug, Clone, Serialize)]
pub struct MessageData {
    pub id: String,
    pub room_id: String,
    pub content: String,
    pub message_type: MessageKind,
    pub sender: Option<String>,
    pub is_ai: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<MessageMetadata>,
    pub created_at: DateTime<Utc>,
}

impl From<&Message> for MessageData {
    fn from(message: &Message) -> Self {
        Self {
            id: message.id.clone(),
            room_id: message.room_id.clone(),
            content: message.content.clone(),
            message_type: message.kind,
            sender: message.author.user_id().map(str::to_string),
            is_ai: message.author.is_assistant(),
            metadata: message.metadata.clone(),
            created_at: message.created_at,
        }
    }
}
