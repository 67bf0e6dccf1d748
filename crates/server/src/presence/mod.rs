//! Presence tracking.
//!
//! Maps a user to their current live connection locator through the
//! expiring locator table. The entry is a lookup hint for out-of-band
//! notification, never an authority on membership or liveness: the
//! owning connection may vanish without deregistering, so a located
//! connection is only ever a best-effort send target.

use std::sync::Arc;

use chrono::Duration;
use tracing::debug;

use crate::error::Result;
use crate::store::ChatStore;

pub struct PresenceTracker {
    store: Arc<ChatStore>,
    ttl: Duration,
}

impl PresenceTracker {
    pub fn new(store: Arc<ChatStore>, ttl_secs: i64) -> Self {
        Self {
            store,
            ttl: Duration::seconds(ttl_secs),
        }
    }

    /// Upserts the user's locator with the fixed expiry. Re-registration
    /// refreshes the expiry; concurrent registrations resolve
    /// last-writer-wins on the single canonical locator.
    pub async fn register(&self, user_id: &str, locator: &str) -> Result<()> {
        self.store.set_locator(user_id, locator, self.ttl).await?;
        debug!("[Presence] {user_id} -> {locator}");
        Ok(())
    }

    pub async fn locate(&self, user_id: &str) -> Result<Option<String>> {
        self.store.locator(user_id).await
    }

    /// Removes the user's locator. Safe to call twice.
    pub async fn deregister(&self, user_id: &str) -> Result<()> {
        self.store.delete_locator(user_id).await?;
        debug!("[Presence] {user_id} deregistered");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn tracker() -> (PresenceTracker, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(
            ChatStore::new(&dir.path().join("presence.sqlite"))
                .await
                .unwrap(),
        );
        (PresenceTracker::new(store, 3600), dir)
    }

    #[tokio::test]
    async fn register_locate_deregister() {
        let (tracker, _dir) = tracker().await;

        assert_eq!(tracker.locate("u1").await.unwrap(), None);

        tracker.register("u1", "conn-1").await.unwrap();
        assert_eq!(tracker.locate("u1").await.unwrap().as_deref(), Some("conn-1"));

        // Re-registration is an idempotent refresh.
        tracker.register("u1", "conn-1").await.unwrap();
        assert_eq!(tracker.locate("u1").await.unwrap().as_deref(), Some("conn-1"));

        tracker.deregister("u1").await.unwrap();
        tracker.deregister("u1").await.unwrap();
        assert_eq!(tracker.locate("u1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn second_device_takes_over_locator() {
        let (tracker, _dir) = tracker().await;

        tracker.register("u1", "conn-a").await.unwrap();
        tracker.register("u1", "conn-b").await.unwrap();
        assert_eq!(tracker.locate("u1").await.unwrap().as_deref(), Some("conn-b"));
    }
}
