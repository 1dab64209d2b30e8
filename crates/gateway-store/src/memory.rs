//! In-Memory Backend
//!
//! Used directly for development and tests, and by the persistence
//! manager as the degraded-mode fallback when the durable backend is
//! unavailable.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;

use gateway_core::{Message, Session, SessionId};

use crate::backend::SessionBackend;
use crate::error::{Result, StoreError};

/// RwLock<HashMap> session store
#[derive(Default)]
pub struct MemoryBackend {
    sessions: RwLock<HashMap<SessionId, Session>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionBackend for MemoryBackend {
    async fn put_session(&self, session: &Session) -> Result<()> {
        let mut sessions = self
            .sessions
            .write()
            .map_err(|_| StoreError::Backend("lock poisoned".into()))?;
        sessions.insert(session.id.clone(), session.clone());
        Ok(())
    }

    async fn get_session(&self, id: &SessionId) -> Result<Option<Session>> {
        let sessions = self
            .sessions
            .read()
            .map_err(|_| StoreError::Backend("lock poisoned".into()))?;
        Ok(sessions.get(id).cloned())
    }

    async fn list_sessions(&self) -> Result<Vec<Session>> {
        let sessions = self
            .sessions
            .read()
            .map_err(|_| StoreError::Backend("lock poisoned".into()))?;
        let mut list: Vec<Session> = sessions.values().cloned().collect();
        list.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(list)
    }

    async fn delete_session(&self, id: &SessionId) -> Result<()> {
        let mut sessions = self
            .sessions
            .write()
            .map_err(|_| StoreError::Backend("lock poisoned".into()))?;
        sessions.remove(id);
        Ok(())
    }

    async fn append_message(&self, id: &SessionId, message: &Message) -> Result<()> {
        let mut sessions = self
            .sessions
            .write()
            .map_err(|_| StoreError::Backend("lock poisoned".into()))?;
        let session = sessions
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        session.append(message.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_round_trip() {
        let backend = MemoryBackend::new();
        let session = Session::new(Message::user("hello"), "ollama-qwen2.5");
        let id = session.id.clone();

        backend.put_session(&session).await.unwrap();

        let loaded = backend.get_session(&id).await.unwrap().unwrap();
        assert_eq!(loaded.messages[0].content, "hello");
        assert_eq!(loaded.model, "ollama-qwen2.5");
    }

    #[tokio::test]
    async fn test_append_to_missing_session_is_not_found() {
        let backend = MemoryBackend::new();
        let err = backend
            .append_message(&SessionId::new(), &Message::user("x"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_list_orders_by_recent_activity() {
        let backend = MemoryBackend::new();
        let first = Session::new(Message::user("first"), "auto");
        let second = Session::new(Message::user("second"), "auto");
        let second_id = second.id.clone();

        backend.put_session(&first).await.unwrap();
        backend.put_session(&second).await.unwrap();
        backend
            .append_message(&second_id, &Message::assistant("reply"))
            .await
            .unwrap();

        let list = backend.list_sessions().await.unwrap();
        assert_eq!(list[0].id, second_id);
    }
}
