//! Sqlite-backed chat store.
//!
//! One pool, schema created on init. Rooms and messages are owned by
//! this store; the engine holds ids and the current request's working
//! set only. Users and auth sessions are written by the external auth
//! service and read here.

use std::path::Path;

use chrono::{DateTime, Duration, SecondsFormat, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use tracing::{info, warn};

use crate::error::Result;
use crate::models::{
    Author, ChatRoom, Identity, Message, MessageKind, MessageMetadata, Participant,
    ParticipantRole, ReadReceipt, RoomKind,
};

pub struct ChatStore {
    pool: SqlitePool,
}

/// Timestamps are stored as fixed-width RFC3339 so that the text
/// ordering in sqlite equals chronological ordering.
fn fmt_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(raw: &str) -> DateTime<Utc> {
    raw.parse().unwrap_or_else(|_| Utc::now())
}

impl ChatStore {
    pub async fn new(db_path: &Path) -> anyhow::Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new().connect_with(options).await?;

        let store = Self { pool };
        store.init_schema().await?;

        info!("[Store] Initialized at {:?}", db_path);
        Ok(store)
    }

    async fn init_schema(&self) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS users (
                id TEXT PRIMARY KEY,
                email TEXT UNIQUE NOT NULL,
                username TEXT NOT NULL,
                is_active INTEGER NOT NULL DEFAULT 1,
                created_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS auth_sessions (
                token TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                created_at TEXT NOT NULL,
                expires_at TEXT NOT NULL,
                FOREIGN KEY (user_id) REFERENCES users(id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS rooms (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                description TEXT,
                kind TEXT NOT NULL,
                max_participants INTEGER NOT NULL DEFAULT 50,
                is_private INTEGER NOT NULL DEFAULT 0,
                ai_enabled INTEGER NOT NULL DEFAULT 0,
                last_activity TEXT NOT NULL,
                message_count INTEGER NOT NULL DEFAULT 0,
                is_active INTEGER NOT NULL DEFAULT 1,
                created_by TEXT NOT NULL,
                created_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // One record per (room, user); leave/rejoin flips is_active on
        // the same row.
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS participants (
                room_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                role TEXT NOT NULL DEFAULT 'member',
                joined_at TEXT NOT NULL,
                is_active INTEGER NOT NULL DEFAULT 1,
                PRIMARY KEY (room_id, user_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS messages (
                id TEXT PRIMARY KEY,
                room_id TEXT NOT NULL,
                sender TEXT,
                content TEXT NOT NULL,
                kind TEXT NOT NULL DEFAULT 'text',
                metadata TEXT,
                is_edited INTEGER NOT NULL DEFAULT 0,
                edited_at TEXT,
                is_deleted INTEGER NOT NULL DEFAULT 0,
                deleted_at TEXT,
                created_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS read_receipts (
                message_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                read_at TEXT NOT NULL,
                PRIMARY KEY (message_id, user_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS presence (
                user_id TEXT PRIMARY KEY,
                locator TEXT NOT NULL,
                expires_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_messages_room ON messages (room_id, created_at)",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_participants_user ON participants (user_id)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    // === Identity / auth session reads (auth service owns the writes) ===

    pub async fn identity(&self, user_id: &str) -> Result<Option<Identity>> {
        let row: Option<(String, String, String, bool)> =
            sqlx::query_as("SELECT id, email, username, is_active FROM users WHERE id = ?")
                .bind(user_id)
                .fetch_optional(&self.pool)
                .await?;

        Ok(row.map(|(id, email, username, is_active)| Identity {
            id,
            email,
            username,
            is_active,
        }))
    }

    /// Returns `(user_id, expires_at)` for a credential token, if known.
    pub async fn auth_session(&self, token: &str) -> Result<Option<(String, DateTime<Utc>)>> {
        let row: Option<(String, String)> =
            sqlx::query_as("SELECT user_id, expires_at FROM auth_sessions WHERE token = ?")
                .bind(token)
                .fetch_optional(&self.pool)
                .await?;

        Ok(row.map(|(user_id, expires_at)| {
            let expires = expires_at
                .parse()
                .unwrap_or_else(|_| DateTime::<Utc>::UNIX_EPOCH);
            (user_id, expires)
        }))
    }

    // === Rooms ===

    pub async fn insert_room(&self, room: &ChatRoom) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO rooms
                (id, name, description, kind, max_participants, is_private, ai_enabled,
                 last_activity, message_count, is_active, created_by, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&room.id)
        .bind(&room.name)
        .bind(&room.description)
        .bind(room.kind.as_str())
        .bind(room.max_participants)
        .bind(room.is_private)
        .bind(room.ai_enabled)
        .bind(fmt_ts(room.last_activity))
        .bind(room.message_count)
        .bind(room.is_active)
        .bind(&room.created_by)
        .bind(fmt_ts(room.created_at))
        .execute(&self.pool)
        .await?;

        for participant in &room.participants {
            self.insert_participant(&room.id, participant).await?;
        }

        info!("[Store] Created room {} ({})", room.name, room.id);
        Ok(())
    }

    pub async fn find_room(&self, room_id: &str) -> Result<Option<ChatRoom>> {
        type RoomRow = (
            String,
            String,
            Option<String>,
            String,
            i64,
            bool,
            bool,
            String,
            i64,
            bool,
            String,
            String,
        );

        let row: Option<RoomRow> = sqlx::query_as(
            r#"
            SELECT id, name, description, kind, max_participants, is_private, ai_enabled,
                   last_activity, message_count, is_active, created_by, created_at
            FROM rooms WHERE id = ?
            "#,
        )
        .bind(room_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let participants = self.room_participants(room_id).await?;
        Ok(Some(Self::room_from_row(row, participants)))
    }

    /// Active rooms where the user holds an active membership, most
    /// recently active first.
    pub async fn rooms_for_user(
        &self,
        user_id: &str,
        kind: Option<RoomKind>,
        page: u32,
        limit: u32,
    ) -> Result<(Vec<ChatRoom>, i64)> {
        let offset = (page.saturating_sub(1) as i64) * limit as i64;
        let kind_filter = kind.map(|k| k.as_str().to_string());

        let mut select = String::from(
            r#"
            SELECT r.id, r.name, r.description, r.kind, r.max_participants, r.is_private,
                   r.ai_enabled, r.last_activity, r.message_count, r.is_active,
                   r.created_by, r.created_at
            FROM rooms r
            JOIN participants p ON p.room_id = r.id
            WHERE p.user_id = ? AND p.is_active = 1 AND r.is_active = 1
            "#,
        );
        let mut count = String::from(
            r#"
            SELECT COUNT(*)
            FROM rooms r
            JOIN participants p ON p.room_id = r.id
            WHERE p.user_id = ? AND p.is_active = 1 AND r.is_active = 1
            "#,
        );
        if kind_filter.is_some() {
            select.push_str(" AND r.kind = ?");
            count.push_str(" AND r.kind = ?");
        }
        select.push_str(" ORDER BY r.last_activity DESC LIMIT ? OFFSET ?");

        type RoomRow = (
            String,
            String,
            Option<String>,
            String,
            i64,
            bool,
            bool,
            String,
            i64,
            bool,
            String,
            String,
        );

        let mut select_query = sqlx::query_as::<_, RoomRow>(&select).bind(user_id);
        let mut count_query = sqlx::query_as::<_, (i64,)>(&count).bind(user_id);
        if let Some(ref k) = kind_filter {
            select_query = select_query.bind(k);
            count_query = count_query.bind(k);
        }

        let rows = select_query
            .bind(limit as i64)
            .bind(offset)
            .fetch_all(&self.pool)
            .await?;
        let (total,) = count_query.fetch_one(&self.pool).await?;

        let mut rooms = Vec::with_capacity(rows.len());
        for row in rows {
            let participants = self.room_participants(&row.0).await?;
            rooms.push(Self::room_from_row(row, participants));
        }

        Ok((rooms, total))
    }

    async fn room_participants(&self, room_id: &str) -> Result<Vec<Participant>> {
        let rows: Vec<(String, String, String, bool)> = sqlx::query_as(
            r#"
            SELECT user_id, role, joined_at, is_active
            FROM participants WHERE room_id = ?
            ORDER BY joined_at, user_id
            "#,
        )
        .bind(room_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(user_id, role, joined_at, is_active)| Participant {
                user_id,
                role: ParticipantRole::parse(&role),
                joined_at: parse_ts(&joined_at),
                is_active,
            })
            .collect())
    }

    #[allow(clippy::type_complexity)]
    fn room_from_row(
        row: (
            String,
            String,
            Option<String>,
            String,
            i64,
            bool,
            bool,
            String,
            i64,
            bool,
            String,
            String,
        ),
        participants: Vec<Participant>,
    ) -> ChatRoom {
        let (
            id,
            name,
            description,
            kind,
            max_participants,
            is_private,
            ai_enabled,
            last_activity,
            message_count,
            is_active,
            created_by,
            created_at,
        ) = row;

        ChatRoom {
            id,
            name,
            description,
            kind: RoomKind::parse(&kind),
            participants,
            max_participants,
            is_private,
            ai_enabled,
            last_activity: parse_ts(&last_activity),
            message_count,
            is_active,
            created_by,
            created_at: parse_ts(&created_at),
        }
    }

    // === Participants ===

    pub async fn insert_participant(&self, room_id: &str, participant: &Participant) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO participants (room_id, user_id, role, joined_at, is_active)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(room_id)
        .bind(&participant.user_id)
        .bind(participant.role.as_str())
        .bind(fmt_ts(participant.joined_at))
        .bind(participant.is_active)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Reactivates an existing membership record, resetting joined-at.
    /// The role column is deliberately untouched.
    pub async fn reactivate_participant(
        &self,
        room_id: &str,
        user_id: &str,
        joined_at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE participants SET is_active = 1, joined_at = ? WHERE room_id = ? AND user_id = ?",
        )
        .bind(fmt_ts(joined_at))
        .bind(room_id)
        .bind(user_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn deactivate_participant(&self, room_id: &str, user_id: &str) -> Result<()> {
        sqlx::query("UPDATE participants SET is_active = 0 WHERE room_id = ? AND user_id = ?")
            .bind(room_id)
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn is_active_participant(&self, room_id: &str, user_id: &str) -> Result<bool> {
        let row: Option<(i64,)> = sqlx::query_as(
            "SELECT 1 FROM participants WHERE room_id = ? AND user_id = ? AND is_active = 1",
        )
        .bind(room_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.is_some())
    }

    /// Bumps last-activity and the message counter in one statement.
    pub async fn touch_room_activity(&self, room_id: &str) -> Result<()> {
        sqlx::query(
            "UPDATE rooms SET last_activity = ?, message_count = message_count + 1 WHERE id = ?",
        )
        .bind(fmt_ts(Utc::now()))
        .bind(room_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // === Messages ===

    pub async fn insert_message(&self, message: &Message) -> Result<()> {
        let metadata = match &message.metadata {
            Some(meta) => Some(serde_json::to_string(meta).map_err(|e| {
                crate::error::ChatError::bad_request(format!("unencodable metadata: {e}"))
            })?),
            None => None,
        };

        sqlx::query(
            r#"
            INSERT INTO messages
                (id, room_id, sender, content, kind, metadata,
                 is_edited, edited_at, is_deleted, deleted_at, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&message.id)
        .bind(&message.room_id)
        .bind(message.author.user_id())
        .bind(&message.content)
        .bind(message.kind.as_str())
        .bind(metadata)
        .bind(message.is_edited)
        .bind(message.edited_at.map(fmt_ts))
        .bind(message.is_deleted)
        .bind(message.deleted_at.map(fmt_ts))
        .bind(fmt_ts(message.created_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn find_message(&self, message_id: &str) -> Result<Option<Message>> {
        let row: Option<MessageRow> = sqlx::query_as(
            r#"
            SELECT id, room_id, sender, content, kind, metadata,
                   is_edited, edited_at, is_deleted, deleted_at, created_at
            FROM messages WHERE id = ?
            "#,
        )
        .bind(message_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(message_from_row))
    }

    /// One page of non-deleted room messages, oldest first within the
    /// page; `page = 1` is the newest page, as the HTTP surface expects.
    pub async fn messages_page(
        &self,
        room_id: &str,
        page: u32,
        limit: u32,
    ) -> Result<(Vec<Message>, i64)> {
        let offset = (page.saturating_sub(1) as i64) * limit as i64;

        let rows: Vec<MessageRow> = sqlx::query_as(
            r#"
            SELECT id, room_id, sender, content, kind, metadata,
                   is_edited, edited_at, is_deleted, deleted_at, created_at
            FROM messages
            WHERE room_id = ? AND is_deleted = 0
            ORDER BY created_at DESC, rowid DESC
            LIMIT ? OFFSET ?
            "#,
        )
        .bind(room_id)
        .bind(limit as i64)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        let (total,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM messages WHERE room_id = ? AND is_deleted = 0")
                .bind(room_id)
                .fetch_one(&self.pool)
                .await?;

        let mut messages: Vec<Message> = rows.into_iter().map(message_from_row).collect();
        messages.reverse();
        Ok((messages, total))
    }

    /// Newest `limit` messages in chronological order, for the oracle's
    /// conversational context window.
    pub async fn recent_messages(&self, room_id: &str, limit: u32) -> Result<Vec<Message>> {
        let rows: Vec<MessageRow> = sqlx::query_as(
            r#"
            SELECT id, room_id, sender, content, kind, metadata,
                   is_edited, edited_at, is_deleted, deleted_at, created_at
            FROM messages
            WHERE room_id = ? AND is_deleted = 0
            ORDER BY created_at DESC, rowid DESC
            LIMIT ?
            "#,
        )
        .bind(room_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut messages: Vec<Message> = rows.into_iter().map(message_from_row).collect();
        messages.reverse();
        Ok(messages)
    }

    // === Read receipts ===

    /// Records that a user read a message. Returns false when the
    /// receipt already existed; marking twice never duplicates.
    pub async fn mark_read(
        &self,
        message_id: &str,
        user_id: &str,
        read_at: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            "INSERT OR IGNORE INTO read_receipts (message_id, user_id, read_at) VALUES (?, ?, ?)",
        )
        .bind(message_id)
        .bind(user_id)
        .bind(fmt_ts(read_at))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn read_receipts(&self, message_id: &str) -> Result<Vec<ReadReceipt>> {
        let rows: Vec<(String, String)> =
            sqlx::query_as("SELECT user_id, read_at FROM read_receipts WHERE message_id = ?")
                .bind(message_id)
                .fetch_all(&self.pool)
                .await?;

        Ok(rows
            .into_iter()
            .map(|(user_id, read_at)| ReadReceipt {
                user_id,
                read_at: parse_ts(&read_at),
            })
            .collect())
    }

    // === Presence locators (the session-store contract) ===

    /// Upserts the connection locator for a user with a fixed expiry.
    /// Last writer wins across devices.
    pub async fn set_locator(&self, user_id: &str, locator: &str, ttl: Duration) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO presence (user_id, locator, expires_at)
            VALUES (?, ?, ?)
            ON CONFLICT(user_id) DO UPDATE
            SET locator = excluded.locator, expires_at = excluded.expires_at
            "#,
        )
        .bind(user_id)
        .bind(locator)
        .bind(fmt_ts(Utc::now() + ttl))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Best-effort lookup; expired rows count as absent.
    pub async fn locator(&self, user_id: &str) -> Result<Option<String>> {
        let row: Option<(String, String)> =
            sqlx::query_as("SELECT locator, expires_at FROM presence WHERE user_id = ?")
                .bind(user_id)
                .fetch_optional(&self.pool)
                .await?;

        Ok(row.and_then(|(locator, expires_at)| {
            let expires = expires_at
                .parse::<DateTime<Utc>>()
                .unwrap_or_else(|e| {
                    warn!("[Store] Unparseable presence expiry for {user_id}: {e}");
                    DateTime::<Utc>::UNIX_EPOCH
                });
            (expires > Utc::now()).then_some(locator)
        }))
    }

    pub async fn delete_locator(&self, user_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM presence WHERE user_id = ?")
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // === Test seeding (the auth service owns these writes in production) ===

    #[cfg(test)]
    pub(crate) async fn seed_identity(&self, id: &str, username: &str, is_active: bool) {
        sqlx::query(
            "INSERT INTO users (id, email, username, is_active, created_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(id)
        .bind(format!("{username}@example.com"))
        .bind(username)
        .bind(is_active)
        .bind(fmt_ts(Utc::now()))
        .execute(&self.pool)
        .await
        .unwrap();
    }

    #[cfg(test)]
    pub(crate) async fn seed_auth_session(&self, token: &str, user_id: &str, ttl: Duration) {
        sqlx::query(
            "INSERT INTO auth_sessions (token, user_id, created_at, expires_at) VALUES (?, ?, ?, ?)",
        )
        .bind(token)
        .bind(user_id)
        .bind(fmt_ts(Utc::now()))
        .bind(fmt_ts(Utc::now() + ttl))
        .execute(&self.pool)
        .await
        .unwrap();
    }
}

type MessageRow = (
    String,
    String,
    Option<String>,
    String,
    String,
    Option<String>,
    bool,
    Option<String>,
    bool,
    Option<String>,
    String,
);

fn message_from_row(row: MessageRow) -> Message {
    let (
        id,
        room_id,
        sender,
        content,
        kind,
        metadata,
        is_edited,
        edited_at,
        is_deleted,
        deleted_at,
        created_at,
    ) = row;

    let metadata = metadata.as_deref().and_then(|raw| {
        serde_json::from_str::<MessageMetadata>(raw)
            .map_err(|e| warn!("[Store] Dropping unreadable metadata on message {id}: {e}"))
            .ok()
    });

    Message {
        author: match sender {
            Some(user_id) => Author::Human(user_id),
            None => Author::Assistant,
        },
        id,
        room_id,
        content,
        kind: MessageKind::parse(&kind),
        metadata,
        is_edited,
        edited_at: edited_at.as_deref().map(parse_ts),
        is_deleted,
        deleted_at: deleted_at.as_deref().map(parse_ts),
        created_at: parse_ts(&created_at),
    }
}
