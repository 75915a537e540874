//! Active session records: bearer token -> user, with expiry.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use uuid::Uuid;

use crate::error::AuthError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionRecord {
    pub user_id: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, SessionRecord>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mint a fresh token for `user_id`, valid for `ttl`.
    pub fn issue(&self, user_id: &str, ttl: Duration) -> String {
        let token = Uuid::new_v4().simple().to_string();
        self.insert(&token, user_id, Utc::now() + ttl);
        token
    }

    pub fn insert(&self, token: &str, user_id: &str, expires_at: DateTime<Utc>) {
        self.sessions.write().insert(
            token.to_string(),
            SessionRecord {
                user_id: user_id.to_string(),
                expires_at,
            },
        );
    }

    /// Resolve a token to its user. Expired records are dropped.
    pub fn authenticate(&self, token: &str) -> Result<String, AuthError> {
        let record = self
            .sessions
            .read()
            .get(token)
            .cloned()
            .ok_or(AuthError::InvalidToken)?;
        if record.expires_at <= Utc::now() {
            self.sessions.write().remove(token);
            return Err(AuthError::Expired);
        }
        Ok(record.user_id)
    }

    pub fn revoke(&self, token: &str) -> bool {
        self.sessions.write().remove(token).is_some()
    }

    /// Drop all expired records. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Utc::now();
        let mut sessions = self.sessions.write();
        let before = sessions.len();
        sessions.retain(|_, s| s.expires_at > now);
        before - sessions.len()
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }
}
