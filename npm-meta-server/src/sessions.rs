//! Login session registry
//!
//! Maps opaque session ids handed to API clients onto upstream `Session`s.
//! The upstream token itself never leaves the server.

use chrono::{DateTime, Utc};
use npm_meta_lib::Session;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::RwLock;

struct Entry {
    session: Session,
    expires_at: DateTime<Utc>,
}

/// In-memory session table; sessions do not survive a restart.
#[derive(Default)]
pub struct SessionRegistry {
    entries: RwLock<HashMap<String, Entry>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session and return its id and expiry.
    pub async fn issue(&self, session: Session, ttl: Duration) -> (String, DateTime<Utc>) {
        let id = uuid::Uuid::new_v4().simple().to_string();
        let ttl = chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::days(7));
        let now = Utc::now();
        let expires_at = now + ttl;

        let mut entries = self.entries.write().await;
        entries.retain(|_, entry| entry.expires_at > now);
        entries.insert(id.clone(), Entry { session, expires_at });
        (id, expires_at)
    }

    /// Look up a live session. Expired entries are dropped on sight.
    pub async fn get(&self, id: &str) -> Option<Session> {
        let now = Utc::now();
        {
            let entries = self.entries.read().await;
            match entries.get(id) {
                Some(entry) if entry.expires_at > now => return Some(entry.session.clone()),
                Some(_) => {}
                None => return None,
            }
        }
        self.entries.write().await.remove(id);
        None
    }

    /// Remove a session, returning it if it existed.
    pub async fn revoke(&self, id: &str) -> Option<Session> {
        self.entries.write().await.remove(id).map(|entry| entry.session)
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_issue_and_get() {
        let registry = SessionRegistry::new();
        let (id, expires_at) = registry
            .issue(Session::from_token("admin", "tok"), Duration::from_secs(60))
            .await;

        assert!(expires_at > Utc::now());
        let session = registry.get(&id).await.expect("session should exist");
        assert_eq!(session.token(), "tok");
        assert!(registry.get("unknown").await.is_none());
    }

    #[tokio::test]
    async fn test_expired_session_is_dropped() {
        let registry = SessionRegistry::new();
        let (id, _) = registry
            .issue(Session::from_token("admin", "tok"), Duration::ZERO)
            .await;

        assert!(registry.get(&id).await.is_none());
        assert_eq!(registry.len().await, 0);
    }

    #[tokio::test]
    async fn test_revoke() {
        let registry = SessionRegistry::new();
        let (id, _) = registry
            .issue(Session::from_token("admin", "tok"), Duration::from_secs(60))
            .await;

        assert!(registry.revoke(&id).await.is_some());
        assert!(registry.get(&id).await.is_none());
        assert!(registry.revoke(&id).await.is_none());
    }

    #[tokio::test]
    async fn test_ids_are_unique() {
        let registry = SessionRegistry::new();
        let (a, _) = registry
            .issue(Session::from_token("admin", "tok"), Duration::from_secs(60))
            .await;
        let (b, _) = registry
            .issue(Session::from_token("admin", "tok"), Duration::from_secs(60))
            .await;
        assert_ne!(a, b);
        assert_eq!(registry.len().await, 2);
    }
}
