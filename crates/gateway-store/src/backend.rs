//! Backend Trait

use async_trait::async_trait;

use gateway_core::{Message, Session, SessionId};

use crate::error::Result;

/// Storage backend for sessions
///
/// Backends only store and fetch; retry, ordering, and fallback policy
/// live in the [`PersistenceManager`](crate::PersistenceManager).
#[async_trait]
pub trait SessionBackend: Send + Sync {
    /// Insert or replace a whole session record
    async fn put_session(&self, session: &Session) -> Result<()>;

    /// Fetch a session by id
    async fn get_session(&self, id: &SessionId) -> Result<Option<Session>>;

    /// List all sessions, newest activity first
    async fn list_sessions(&self) -> Result<Vec<Session>>;

    /// Delete a session and its messages
    async fn delete_session(&self, id: &SessionId) -> Result<()>;

    /// Append a message to an existing session
    async fn append_message(&self, id: &SessionId, message: &Message) -> Result<()>;
}
