//! Connection authentication.
//!
//! Credentials are opaque bearer tokens issued by the external auth
//! service into the shared store; this module only validates them.
//! A rejected credential leaves no connection state behind.

use std::sync::Arc;

use axum::{
    extract::{FromRequestParts, Request, State},
    http::{header, request::Parts, HeaderMap},
    middleware::Next,
    response::Response,
};
use chrono::Utc;
use tracing::{debug, warn};

use crate::config::AppState;
use crate::error::{ChatError, Result};
use crate::models::Identity;
use crate::store::ChatStore;

pub struct Authenticator {
    store: Arc<ChatStore>,
}

impl Authenticator {
    pub fn new(store: Arc<ChatStore>) -> Self {
        Self { store }
    }

    /// Resolves a bearer token to an active identity. Missing, unknown,
    /// or expired tokens and inactive users all map to `Unauthenticated`.
    pub async fn authenticate(&self, token: Option<&str>) -> Result<Identity> {
        let token = token
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or(ChatError::Unauthenticated)?;

        let (user_id, expires_at) = self
            .store
            .auth_session(token)
            .await?
            .ok_or(ChatError::Unauthenticated)?;

        if expires_at <= Utc::now() {
            debug!("[Auth] Expired token for user {user_id}");
            return Err(ChatError::Unauthenticated);
        }

        let identity = self
            .store
            .identity(&user_id)
            .await?
            .ok_or(ChatError::Unauthenticated)?;

        if !identity.is_active {
            warn!("[Auth] Rejected token for deactivated user {user_id}");
            return Err(ChatError::Unauthenticated);
        }

        Ok(identity)
    }
}

/// Extracts the token from an `Authorization: Bearer <token>` header.
pub fn bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(|token| token.to_string())
}

/// Authenticated request context, stored in request extensions by
/// `mw_require_auth`.
#[derive(Clone, Debug)]
pub struct Ctx {
    user_id: String,
}

impl Ctx {
    pub fn new(user_id: String) -> Self {
        Self { user_id }
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }
}

impl<S> FromRequestParts<S> for Ctx
where
    S: Send + Sync,
{
    type Rejection = ChatError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self> {
        parts
            .extensions
            .get::<Ctx>()
            .cloned()
            .ok_or(ChatError::Unauthenticated)
    }
}

pub async fn mw_require_auth(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response> {
    debug!("MIDDLEWARE: require_auth");

    let token = bearer_token(req.headers()).ok_or(ChatError::Unauthenticated)?;
    let identity = state.auth.authenticate(Some(&token)).await?;

    req.extensions_mut().insert(Ctx::new(identity.id));

    Ok(next.run(req).await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use tempfile::TempDir;

    async fn authenticator() -> (Authenticator, Arc<ChatStore>, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(
            ChatStore::new(&dir.path().join("auth.sqlite"))
                .await
                .unwrap(),
        );
        (Authenticator::new(store.clone()), store, dir)
    }

    #[tokio::test]
    async fn valid_token_resolves_identity() {
        let (auth, store, _dir) = authenticator().await;
        store.seed_identity("u1", "ada", true).await;
        store
            .seed_auth_session("tok-1", "u1", Duration::hours(1))
            .await;

        let identity = auth.authenticate(Some("tok-1")).await.unwrap();
        assert_eq!(identity.id, "u1");
        assert_eq!(identity.username, "ada");
    }

    #[tokio::test]
    async fn missing_unknown_expired_and_inactive_are_all_rejected() {
        let (auth, store, _dir) = authenticator().await;
        store.seed_identity("u1", "ada", true).await;
        store.seed_identity("u2", "bob", false).await;
        store
            .seed_auth_session("expired", "u1", Duration::seconds(-10))
            .await;
        store
            .seed_auth_session("inactive", "u2", Duration::hours(1))
            .await;

        for token in [None, Some(""), Some("unknown"), Some("expired"), Some("inactive")] {
            let err = auth.authenticate(token).await.unwrap_err();
            assert!(matches!(err, ChatError::Unauthenticated), "token {token:?}");
        }
    }

    #[test]
    fn bearer_header_parsing() {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, "Bearer tok-9".parse().unwrap());
        assert_eq!(bearer_token(&headers).as_deref(), Some("tok-9"));

        headers.insert(header::AUTHORIZATION, "Basic abc".parse().unwrap());
        assert_eq!(bearer_token(&headers), None);
    }
}
