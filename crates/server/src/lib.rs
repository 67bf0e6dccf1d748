//! Haven Chat Server Library
//!
//! Real-time support-chat engine: authenticated WebSocket connections,
//! room membership, presence, live fan-out, and an AI companion that
//! screens every message for emotional risk.

pub mod ai;
pub mod auth;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod gateway;
pub mod handlers;
pub mod models;
pub mod presence;
pub mod protocol;
pub mod rooms;
pub mod store;

use std::sync::Arc;

use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

use ai::{GenAiOracle, RiskPipeline, RiskTables, SupportOracle};
use auth::{mw_require_auth, Authenticator};
use config::{AppState, ServerConfig};
use dispatch::MessageDispatcher;
use gateway::{ws_handler, ConnectionRegistry};
use handlers::{
    create_room, get_room, join_room, leave_room, list_messages, list_rooms, send_message,
};
use presence::PresenceTracker;
use rooms::MembershipGuard;
use store::ChatStore;

pub async fn run() -> anyhow::Result<()> {
    // Initialize tracing
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if tracing_subscriber::fmt().with_env_filter(filter).try_init().is_err() {
        // Already set, ignore
    }

    info!("=== Haven Chat Server ===");
    info!("Features: Auth | Rooms | Presence | Live Fan-out | AI Risk Screening");

    let config = ServerConfig::from_env();
    info!("Database: {:?}", config.db_path);

    // Failure to open the shared store (which also backs the presence
    // tracker) is the one fatal startup condition.
    let store = Arc::new(ChatStore::new(&config.db_path).await?);

    let auth = Arc::new(Authenticator::new(store.clone()));
    let presence = Arc::new(PresenceTracker::new(store.clone(), config.presence_ttl_secs));
    let registry = Arc::new(ConnectionRegistry::new());
    let guard = Arc::new(MembershipGuard::new(
        store.clone(),
        config.default_room_capacity,
    ));

    let oracle: Arc<dyn SupportOracle> = Arc::new(GenAiOracle::new(&config.oracle_model));
    let pipeline = Arc::new(RiskPipeline::new(
        RiskTables::default(),
        oracle,
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

    let app_state = AppState {
        config: config.clone(),
        store,
        auth,
        presence,
        registry,
        guard,
        dispatcher,
    };

    let app = router(app_state);

    let listener = tokio::net::TcpListener::bind(config.bind_addr).await?;
    info!("Listening on http://{}", config.bind_addr);
    info!("WebSocket endpoint: ws://{}/ws", config.bind_addr);

    axum::serve(listener, app).await?;

    Ok(())
}

/// Builds the full router over the given state.
pub fn router(app_state: AppState) -> Router {
    Router::new()
        // Room management + history (bearer-authenticated)
        .route("/chat/rooms", post(create_room).get(list_rooms))
        .route("/chat/rooms/{room_id}", get(get_room))
        .route(
            "/chat/rooms/{room_id}/messages",
            get(list_messages).post(send_message),
        )
        .route("/chat/rooms/{room_id}/join", post(join_room))
        .route("/chat/rooms/{room_id}/leave", post(leave_room))
        .route_layer(middleware::from_fn_with_state(
            app_state.clone(),
            mw_require_auth,
        ))
        // Persistent connection (authenticates at upgrade)
        .route("/ws", get(ws_handler))
        // Health check
        .route("/health", get(health_check))
        .with_state(app_state)
        .layer(tower_http::cors::CorsLayer::permissive())
        .layer(tower_http::trace::TraceLayer::new_for_http())
}

async fn health_check() -> &'static str {
    "OK - Haven Chat Server"
}
