//! Session Management
//!
//! Onboarding sessions are ephemeral handles that own at most one order. The
//! checkout core only reads them; the onboarding flow creates and edits them.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::{Result, StoreError};
use crate::order::OrderId;

/// Default session lifetime
pub const SESSION_TTL_DAYS: i64 = 7;

/// Unique session identifier
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An onboarding session
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Session {
    /// Unique identifier
    pub id: SessionId,

    /// Order submitted from this session, if any
    pub order_id: Option<OrderId>,

    /// Draft form data, free-form
    #[serde(default)]
    pub form_data: serde_json::Value,

    /// Email verification codes sent
    pub verification_attempts: u32,

    /// Whether the contact email has been verified
    pub email_verified: bool,

    /// Creation timestamp
    pub created_at: DateTime<Utc>,

    /// Last activity timestamp
    pub updated_at: DateTime<Utc>,

    /// Session is unusable after this instant
    pub expires_at: DateTime<Utc>,
}

impl Session {
    /// Create a new session with the default lifetime
    pub fn new() -> Self {
        let now = Utc::now();
        Self {
            id: SessionId::new(),
            order_id: None,
            form_data: serde_json::Value::Object(serde_json::Map::new()),
            verification_attempts: 0,
            email_verified: false,
            created_at: now,
            updated_at: now,
            expires_at: now + Duration::days(SESSION_TTL_DAYS),
        }
    }

    /// Create with specific ID
    pub fn with_id(id: SessionId) -> Self {
        let mut session = Self::new();
        session.id = id;
        session
    }

    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }

    /// Update the activity timestamp
    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

/// Session store
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Load a session by ID
    async fn get(&self, id: &SessionId) -> Result<Option<Session>>;

    /// Replace an existing session
    async fn update(&self, session: &Session) -> Result<()>;

    /// Insert a new session
    async fn insert(&self, session: &Session) -> Result<()>;
}

/// In-memory session store (for development/testing)
#[derive(Default)]
pub struct MemorySessionStore {
    sessions: RwLock<HashMap<SessionId, Session>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn get(&self, id: &SessionId) -> Result<Option<Session>> {
        let sessions = self.sessions.read().await;
        Ok(sessions.get(id).filter(|s| !s.is_expired()).cloned())
    }

    async fn update(&self, session: &Session) -> Result<()> {
        let mut sessions = self.sessions.write().await;
        match sessions.get_mut(&session.id) {
            Some(existing) => {
                *existing = session.clone();
                existing.touch();
                Ok(())
            }
            None => Err(StoreError::NotFound(session.id.to_string())),
        }
    }

    async fn insert(&self, session: &Session) -> Result<()> {
        let mut sessions = self.sessions.write().await;
        if sessions.contains_key(&session.id) {
            return Err(StoreError::UniqueViolation(session.id.to_string()));
        }
        sessions.insert(session.id.clone(), session.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_lifetime_is_seven_days() {
        let session = Session::new();
        assert_eq!(session.expires_at - session.created_at, Duration::days(7));
        assert!(!session.is_expired());
    }

    #[tokio::test]
    async fn test_expired_sessions_are_invisible() {
        let store = MemorySessionStore::new();
        let mut session = Session::new();
        session.expires_at = Utc::now() - Duration::seconds(1);
        store.insert(&session).await.unwrap();

        assert!(store.get(&session.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_update_requires_existing_row() {
        let store = MemorySessionStore::new();
        let session = Session::new();
        assert!(matches!(store.update(&session).await, Err(StoreError::NotFound(_))));

        store.insert(&session).await.unwrap();
        let mut edited = session.clone();
        edited.verification_attempts = 2;
        store.update(&edited).await.unwrap();
        assert_eq!(store.get(&session.id).await.unwrap().unwrap().verification_attempts, 2);
    }
}
