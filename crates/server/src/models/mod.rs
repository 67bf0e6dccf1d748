use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A user identity as owned by the external auth service. Read-only here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Identity {
    pub id: String,
    pub email: String,
    pub username: String,
    pub is_active: bool,
}

/// Role a participant holds within a room. Preserved across leave/rejoin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParticipantRole {
    Member,
    Moderator,
    Therapist,
    Admin,
}

impl ParticipantRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            ParticipantRole::Member => "member",
            ParticipantRole::Moderator => "moderator",
            ParticipantRole::Therapist => "therapist",
            ParticipantRole::Admin => "admin",
        }
    }

    pub fn parse(raw: &str) -> Self {
        match raw {
            "moderator" => ParticipantRole::Moderator,
            "therapist" => ParticipantRole::Therapist,
            "admin" => ParticipantRole::Admin,
            _ => ParticipantRole::Member,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoomKind {
    OneOnOne,
    Group,
    AiChat,
    TherapySession,
    PeerSupport,
}

impl RoomKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RoomKind::OneOnOne => "one_on_one",
            RoomKind::Group => "group",
            RoomKind::AiChat => "ai_chat",
            RoomKind::TherapySession => "therapy_session",
            RoomKind::PeerSupport => "peer_support",
        }
    }

    pub fn parse(raw: &str) -> Self {
        match raw {
            "one_on_one" => RoomKind::OneOnOne,
            "ai_chat" => RoomKind::AiChat,
            "therapy_session" => RoomKind::TherapySession,
            "peer_support" => RoomKind::PeerSupport,
            _ => RoomKind::Group,
        }
    }
}

/// A user's membership record within a room. Deactivated on leave,
/// reactivated (same record, same role) on rejoin, never deleted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Participant {
    pub user_id: String,
    pub role: ParticipantRole,
    pub joined_at: DateTime<Utc>,
    pub is_active: bool,
}

/// A chat room and its membership.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRoom {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub kind: RoomKind,
    pub participants: Vec<Participant>,
    pub max_participants: i64,
    pub is_private: bool,
    pub ai_enabled: bool,
    pub last_activity: DateTime<Utc>,
    pub message_count: i64,
    pub is_active: bool,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
}

impl ChatRoom {
    pub fn new(
        name: impl Into<String>,
        kind: RoomKind,
        created_by: impl Into<String>,
        max_participants: i64,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            description: None,
            kind,
            participants: Vec::new(),
            max_participants,
            is_private: false,
            ai_enabled: kind == RoomKind::AiChat,
            last_activity: now,
            message_count: 0,
            is_active: true,
            created_by: created_by.into(),
            created_at: now,
        }
    }

    /// Rooms of kind `ai_chat` carry the assistant regardless of the flag.
    pub fn assistant_enabled(&self) -> bool {
        self.ai_enabled || self.kind == RoomKind::AiChat
    }

    pub fn active_participants(&self) -> usize {
        self.participants.iter().filter(|p| p.is_active).count()
    }

    pub fn participant(&self, user_id: &str) -> Option<&Participant> {
        self.participants.iter().find(|p| p.user_id == user_id)
    }

    pub fn active_participant(&self, user_id: &str) -> Option<&Participant> {
        self.participant(user_id).filter(|p| p.is_active)
    }
}

/// Who authored a message. The assistant has no user record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Author {
    Human(String),
    Assistant,
}

impl Author {
    pub fn user_id(&self) -> Option<&str> {
        match self {
            Author::Human(id) => Some(id),
            Author::Assistant => None,
        }
    }

    pub fn is_assistant(&self) -> bool {
        matches!(self, Author::Assistant)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    #[default]
    Text,
    Image,
    File,
    AiResponse,
    System,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Text => "text",
            MessageKind::Image => "image",
            MessageKind::File => "file",
            MessageKind::AiResponse => "ai_response",
            MessageKind::System => "system",
        }
    }

    pub fn parse(raw: &str) -> Self {
        match raw {
            "image" => MessageKind::Image,
            "file" => MessageKind::File,
            "ai_response" => MessageKind::AiResponse,
            "system" => MessageKind::System,
            _ => MessageKind::Text,
        }
    }
}

/// Five-level mood classification from the sentiment score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MoodClass {
    VeryPositive,
    Positive,
    Neutral,
    Negative,
    VeryNegative,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SentimentAssessment {
    pub score: i32,
    pub classification: MoodClass,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrisisAssessment {
    pub risk_level: RiskLevel,
    pub risk_score: u32,
    pub triggered_keywords: Vec<String>,
    pub requires_intervention: bool,
}

/// Coarse emotional read returned by the oracle. The `concernLevel`
/// alias accepts the oracle's raw JSON shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmotionAssessment {
    pub emotion: String,
    pub intensity: u8,
    #[serde(alias = "concernLevel")]
    pub concern_level: RiskLevel,
}

impl Default for EmotionAssessment {
    fn default() -> Self {
        Self {
            emotion: "neutral".to_string(),
            intensity: 5,
            concern_level: RiskLevel::Low,
        }
    }
}

/// Full pipeline output for one analyzed message. Ephemeral: attached to
/// the assistant reply's metadata and never independently persisted.
#[derive(Debug, Clone)]
pub struct RiskAssessment {
    pub sentiment: SentimentAssessment,
    pub crisis: CrisisAssessment,
    pub emotion: EmotionAssessment,
    pub reply: String,
    pub model: String,
}

/// Analysis metadata, present only on assistant messages. User messages
/// carry no AI fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MessageMetadata {
    Assistant {
        sentiment: SentimentAssessment,
        emotion: EmotionAssessment,
        crisis: CrisisAssessment,
        model: String,
    },
}

/// A single chat message. Append-only apart from read receipts and the
/// soft edit/delete flags.
#[derive(Debug, Clone)]
pub struct Message {
    pub id: String,
    pub room_id: String,
    pub author: Author,
    pub content: String,
    pub kind: MessageKind,
    pub metadata: Option<MessageMetadata>,
    pub is_edited: bool,
    pub edited_at: Option<DateTime<Utc>>,
    pub is_deleted: bool,
    pub deleted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Message {
    pub fn user(
        room_id: impl Into<String>,
        sender_id: impl Into<String>,
        content: impl Into<String>,
        kind: MessageKind,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            room_id: room_id.into(),
            author: Author::Human(sender_id.into()),
            content: content.into(),
            kind,
            metadata: None,
            is_edited: false,
            edited_at: None,
            is_deleted: false,
            deleted_at: None,
            created_at: Utc::now(),
        }
    }

    pub fn assistant(room_id: impl Into<String>, assessment: &RiskAssessment) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            room_id: room_id.into(),
            author: Author::Assistant,
            content: assessment.reply.clone(),
            kind: MessageKind::AiResponse,
            metadata: Some(MessageMetadata::Assistant {
                sentiment: assessment.sentiment.clone(),
                emotion: assessment.emotion.clone(),
                crisis: assessment.crisis.clone(),
                model: assessment.model.clone(),
            }),
            is_edited: false,
            edited_at: None,
            is_deleted: false,
            deleted_at: None,
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadReceipt {
    pub user_id: String,
    pub read_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Pagination {
    pub current: u32,
    pub pages: u32,
    pub total: i64,
}

impl Pagination {
    pub fn new(current: u32, limit: u32, total: i64) -> Self {
        let pages = if limit == 0 {
            0
        } else {
            ((total as f64) / (limit as f64)).ceil() as u32
        };
        Self { current, pages, total }
    }
}

/// Input for creating a room over HTTP.
#[derive(Debug, Deserialize)]
pub struct CreateRoomInput {
    pub name: String,
    pub description: Option<String>,
    pub kind: RoomKind,
    #[serde(default)]
    pub participants: Vec<String>,
    #[serde(default)]
    pub is_private: bool,
    pub max_participants: Option<i64>,
    #[serde(default)]
    pub ai_enabled: bool,
}

/// Input for the non-live send path.
#[derive(Debug, Deserialize)]
pub struct SendMessageInput {
    pub content: String,
    #[serde(default)]
    pub message_type: Option<MessageKind>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ai_chat_rooms_always_carry_the_assistant() {
        let room = ChatRoom::new("check-in", RoomKind::AiChat, "u1", 50);
        assert!(room.assistant_enabled());

        let mut group = ChatRoom::new("peers", RoomKind::Group, "u1", 50);
        assert!(!group.assistant_enabled());
        group.ai_enabled = true;
        assert!(group.assistant_enabled());
    }

    #[test]
    fn assistant_messages_carry_metadata_and_no_sender() {
        let assessment = RiskAssessment {
            sentiment: SentimentAssessment {
                score: -2,
                classification: MoodClass::Negative,
            },
            crisis: CrisisAssessment {
                risk_level: RiskLevel::Low,
                risk_score: 0,
                triggered_keywords: vec![],
                requires_intervention: false,
            },
            emotion: EmotionAssessment::default(),
            reply: "I hear you.".to_string(),
            model: "test-model".to_string(),
        };
        let msg = Message::assistant("room-1", &assessment);
        assert!(msg.author.is_assistant());
        assert_eq!(msg.author.user_id(), None);
        assert_eq!(msg.kind, MessageKind::AiResponse);
        assert!(msg.metadata.is_some());
    }

    #[test]
    fn emotion_parse_accepts_oracle_shape() {
        let parsed: EmotionAssessment = serde_json::from_str(
            r#"{"emotion": "lonely", "intensity": 7, "concernLevel": "medium"}"#,
        )
        .unwrap();
        assert_eq!(parsed.emotion, "lonely");
        assert_eq!(parsed.intensity, 7);
        assert_eq!(parsed.concern_level, RiskLevel::Medium);
    }
}
