//! Registry of live sessions

use dashmap::DashMap;

use sx_protocol::SessionId;

use super::Session;

/// Tracks every open session across all connections
pub struct SessionRegistry {
    /// Sessions indexed by session ID
    sessions: DashMap<SessionId, Session>,
}

impl SessionRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
        }
    }

    /// Register a session
    pub fn insert(&self, session: Session) {
        self.sessions.insert(session.id(), session);
    }

    /// Unregister a session
    pub fn remove(&self, id: &SessionId) -> Option<Session> {
        self.sessions.remove(id).map(|(_, session)| session)
    }

    /// Get a session by ID
    pub fn get(&self, id: &SessionId) -> Option<Session> {
        self.sessions.get(id).map(|r| r.value().clone())
    }

    /// IDs of all open sessions
    pub fn ids(&self) -> Vec<SessionId> {
        self.sessions.iter().map(|r| *r.key()).collect()
    }

    /// Disconnect every open session
    pub async fn disconnect_all(&self) {
        // Collect first so no shard lock is held across an await
        let sessions: Vec<Session> = self.sessions.iter().map(|r| r.value().clone()).collect();

        futures::future::join_all(sessions.iter().map(|session| async move {
            if let Err(e) = session.disconnect().await {
                tracing::debug!("Disconnect of {} failed: {}", session.id(), e);
            }
        }))
        .await;
    }

    /// Number of open sessions
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
