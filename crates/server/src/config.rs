//! Server configuration and shared state.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use crate::auth::Authenticator;
use crate::dispatch::MessageDispatcher;
use crate::gateway::ConnectionRegistry;
use crate::presence::PresenceTracker;
use crate::rooms::MembershipGuard;
use crate::store::ChatStore;

#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Sqlite database shared with the auth service.
    pub db_path: PathBuf,
    pub bind_addr: SocketAddr,
    /// Expiry for presence locator entries, refreshed on registration.
    pub presence_ttl_secs: i64,
    /// Model handed to the generative oracle.
    pub oracle_model: String,
    /// How many prior messages the oracle sees as context.
    pub history_window: usize,
    /// Upper bound on message content, in bytes.
    pub max_content_len: usize,
    /// Capacity applied to rooms created without an explicit limit.
    pub default_room_capacity: i64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("haven.sqlite"),
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 3001)),
            presence_ttl_secs: 3600,
            oracle_model: "gemini-1.5-flash".to_string(),
            history_window: 10,
            max_content_len: 2000,
            default_room_capacity: 50,
        }
    }
}

impl ServerConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(path) = std::env::var("HAVEN_DB") {
            config.db_path = PathBuf::from(path);
        }
        if let Ok(addr) = std::env::var("HAVEN_ADDR") {
            if let Ok(parsed) = addr.parse() {
                config.bind_addr = parsed;
            }
        }
        if let Ok(model) = std::env::var("HAVEN_AI_MODEL") {
            config.oracle_model = model;
        }
        config
    }
}

/// App state shared across all handlers and gateway connections.
#[derive(Clone)]
pub struct AppState {
    pub config: ServerConfig,
    pub store: Arc<ChatStore>,
    pub auth: Arc<Authenticator>,
    pub presence: Arc<PresenceTracker>,
    pub registry: Arc<ConnectionRegistry>,
    pub guard: Arc<MembershipGuard>,
    pub dispatcher: Arc<MessageDispatcher>,
}
