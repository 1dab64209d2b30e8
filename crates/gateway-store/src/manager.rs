//! Persistence Manager
//!
//! Policy layer over a [`SessionBackend`]: bounded retry with backoff
//! for transient failures, per-session serialization of appends, and
//! an in-memory fallback so a struggling durable store never loses
//! conversation data or fails a chat turn.
//!
//! Ordering: appends within one session are serialized through a
//! session-scoped async mutex (FIFO), so concurrent turns on the same
//! session persist in submission order. Writes to different sessions
//! proceed fully concurrently.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::Serialize;

use gateway_core::{GatewayError, Message, RetryPolicy, Session, SessionId};

use crate::backend::SessionBackend;
use crate::memory::MemoryBackend;

/// Listing view of a session (no message bodies)
#[derive(Clone, Debug, Serialize)]
pub struct SessionSummary {
    pub id: String,
    pub title: String,
    pub preview: String,
    pub model: String,
    pub message_count: usize,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<&Session> for SessionSummary {
    fn from(session: &Session) -> Self {
        Self {
            id: session.id.to_string(),
            title: session.title.clone(),
            preview: session.preview(),
            model: session.model.clone(),
            message_count: session.message_count(),
            created_at: session.created_at,
            updated_at: session.updated_at,
        }
    }
}

/// Durable session store with retry, ordering, and degraded mode
pub struct PersistenceManager {
    primary: Arc<dyn SessionBackend>,
    fallback: MemoryBackend,
    retry: RetryPolicy,
    locks: Mutex<HashMap<SessionId, Arc<tokio::sync::Mutex<()>>>>,
}

impl PersistenceManager {
    pub fn new(primary: Arc<dyn SessionBackend>) -> Self {
        Self::with_retry(primary, RetryPolicy::persistence())
    }

    pub fn with_retry(primary: Arc<dyn SessionBackend>, retry: RetryPolicy) -> Self {
        Self {
            primary,
            fallback: MemoryBackend::new(),
            retry,
            locks: Mutex::new(HashMap::new()),
        }
    }

    fn lock_for(&self, id: &SessionId) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        locks.entry(id.clone()).or_default().clone()
    }

    /// Create a session seeded with its first user message.
    ///
    /// If the durable backend is down after retries, the session lives
    /// in the in-memory fallback and the call still succeeds; the data
    /// loss window is the process lifetime, which is the documented
    /// degraded mode.
    pub async fn create_session(
        &self,
        first_message: Message,
        model: impl Into<String>,
    ) -> gateway_core::Result<Session> {
        let session = Session::new(first_message, model);

        let write = self
            .retry
            .run(|| {
                let session = session.clone();
                async move { self.primary.put_session(&session).await.map_err(Into::into) }
            })
            .await;

        if let Err(err) = write {
            tracing::warn!(session = %session.id, error = %err, "durable create failed, degrading to memory");
            self.fallback
                .put_session(&session)
                .await
                .map_err(GatewayError::from)?;
        }

        Ok(session)
    }

    /// Append a message, serialized per session.
    ///
    /// After retries are exhausted the message is stashed in the
    /// in-memory fallback and a `PersistenceTransient` error is
    /// returned so the caller can surface a warning — the caller's
    /// turn must still succeed.
    pub async fn append_message(
        &self,
        id: &SessionId,
        message: Message,
    ) -> gateway_core::Result<()> {
        let lock = self.lock_for(id);
        let _guard = lock.lock().await;

        let write = self
            .retry
            .run(|| {
                let message = message.clone();
                async move {
                    self.primary
                        .append_message(id, &message)
                        .await
                        .map_err(Into::into)
                }
            })
            .await;

        match write {
            Ok(()) => Ok(()),
            Err(err) if err.is_retryable() => {
                tracing::warn!(session = %id, error = %err, "durable append failed, stashing in memory");
                self.stash_in_fallback(id, message).await;
                Err(GatewayError::PersistenceTransient(err.to_string()))
            }
            Err(err) => Err(err),
        }
    }

    /// Fetch a session, preferring whichever copy saw activity last
    pub async fn get_session(&self, id: &SessionId) -> gateway_core::Result<Option<Session>> {
        let primary = match self.primary.get_session(id).await {
            Ok(found) => found,
            Err(err) => {
                tracing::warn!(session = %id, error = %err, "durable read failed, consulting fallback");
                None
            }
        };
        let shadow = self.fallback.get_session(id).await.ok().flatten();

        Ok(match (primary, shadow) {
            (Some(p), Some(s)) => Some(if s.updated_at > p.updated_at { s } else { p }),
            (Some(p), None) => Some(p),
            (None, Some(s)) => Some(s),
            (None, None) => None,
        })
    }

    /// List sessions across both copies, newest activity first
    pub async fn list_sessions(&self) -> gateway_core::Result<Vec<SessionSummary>> {
        let mut merged: HashMap<SessionId, Session> = HashMap::new();

        match self.primary.list_sessions().await {
            Ok(sessions) => {
                for session in sessions {
                    merged.insert(session.id.clone(), session);
                }
            }
            Err(err) => {
                tracing::warn!(error = %err, "durable list failed, serving fallback only");
            }
        }
        for session in self.fallback.list_sessions().await.map_err(GatewayError::from)? {
            match merged.get(&session.id) {
                Some(existing) if existing.updated_at >= session.updated_at => {}
                _ => {
                    merged.insert(session.id.clone(), session);
                }
            }
        }

        let mut sessions: Vec<Session> = merged.into_values().collect();
        sessions.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(sessions.iter().map(SessionSummary::from).collect())
    }

    /// Delete a session from both copies
    pub async fn delete_session(&self, id: &SessionId) -> gateway_core::Result<()> {
        let _ = self.fallback.delete_session(id).await;
        self.retry
            .run(|| async move { self.primary.delete_session(id).await.map_err(Into::into) })
            .await?;
        self.locks
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(id);
        Ok(())
    }

    /// Make sure the fallback holds the session (copied from primary
    /// if possible) and append the message there.
    async fn stash_in_fallback(&self, id: &SessionId, message: Message) {
        let have = self.fallback.get_session(id).await.ok().flatten().is_some();
        if !have {
            if let Ok(Some(session)) = self.primary.get_session(id).await {
                let _ = self.fallback.put_session(&session).await;
            }
        }
        if self.fallback.append_message(id, &message).await.is_err() {
            // Nothing known about this session anywhere; keep at least
            // the message by materializing a shell session.
            let mut shell = Session::new(message.clone(), "unknown");
            shell.id = id.clone();
            let _ = self.fallback.put_session(&shell).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Result as StoreResult, StoreError};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    /// Backend that fails the first `fail_first` calls, then delegates
    /// to an inner memory backend.
    struct FlakyBackend {
        inner: MemoryBackend,
        fail_first: u32,
        calls: AtomicU32,
    }

    impl FlakyBackend {
        fn new(fail_first: u32) -> Self {
            Self {
                inner: MemoryBackend::new(),
                fail_first,
                calls: AtomicU32::new(0),
            }
        }

        fn trip(&self) -> StoreResult<()> {
            if self.calls.fetch_add(1, Ordering::SeqCst) < self.fail_first {
                Err(StoreError::Transient("backend down".into()))
            } else {
                Ok(())
            }
        }
    }

    #[async_trait]
    impl SessionBackend for FlakyBackend {
        async fn put_session(&self, session: &Session) -> StoreResult<()> {
            self.trip()?;
            self.inner.put_session(session).await
        }

        async fn get_session(&self, id: &SessionId) -> StoreResult<Option<Session>> {
            self.inner.get_session(id).await
        }

        async fn list_sessions(&self) -> StoreResult<Vec<Session>> {
            self.inner.list_sessions().await
        }

        async fn delete_session(&self, id: &SessionId) -> StoreResult<()> {
            self.trip()?;
            self.inner.delete_session(id).await
        }

        async fn append_message(&self, id: &SessionId, message: &Message) -> StoreResult<()> {
            self.trip()?;
            self.inner.append_message(id, message).await
        }
    }

    fn fast_retry() -> RetryPolicy {
        RetryPolicy::new(3, Duration::from_millis(1), gateway_core::retry::Backoff::Fixed)
    }

    #[tokio::test]
    async fn test_create_then_get_round_trips() {
        let manager = PersistenceManager::new(Arc::new(MemoryBackend::new()));
        let session = manager
            .create_session(Message::user("first"), "ollama-qwen2.5")
            .await
            .unwrap();

        let loaded = manager.get_session(&session.id).await.unwrap().unwrap();
        assert_eq!(loaded.messages[0].content, "first");
        assert_eq!(loaded.model, "ollama-qwen2.5");
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried_through() {
        let manager =
            PersistenceManager::with_retry(Arc::new(FlakyBackend::new(2)), fast_retry());

        // First call fails twice then succeeds within the 3-attempt bound
        let session = manager
            .create_session(Message::user("written eventually"), "auto")
            .await
            .unwrap();
        let loaded = manager.get_session(&session.id).await.unwrap();
        assert!(loaded.is_some());
    }

    #[tokio::test]
    async fn test_backend_down_degrades_to_memory() {
        let manager =
            PersistenceManager::with_retry(Arc::new(FlakyBackend::new(u32::MAX)), fast_retry());

        let session = manager
            .create_session(Message::user("kept in memory"), "auto")
            .await
            .unwrap();

        // Append surfaces a transient warning but the data survives
        let err = manager
            .append_message(&session.id, Message::assistant("also kept"))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::PersistenceTransient(_)));

        let loaded = manager.get_session(&session.id).await.unwrap().unwrap();
        assert_eq!(loaded.message_count(), 2);
        assert_eq!(loaded.messages[1].content, "also kept");
    }

    #[tokio::test]
    async fn test_concurrent_appends_keep_submission_order() {
        let manager = Arc::new(PersistenceManager::new(Arc::new(MemoryBackend::new())));
        let session = manager
            .create_session(Message::user("start"), "auto")
            .await
            .unwrap();

        let mut handles = Vec::new();
        for i in 0..8u32 {
            let manager = manager.clone();
            let id = session.id.clone();
            handles.push(tokio::spawn(async move {
                // Stagger submissions so arrival order is deterministic
                tokio::time::sleep(Duration::from_millis(u64::from(i) * 20)).await;
                manager
                    .append_message(&id, Message::assistant(format!("message {i}")))
                    .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let loaded = manager.get_session(&session.id).await.unwrap().unwrap();
        assert_eq!(loaded.message_count(), 9);
        for (i, message) in loaded.messages[1..].iter().enumerate() {
            assert_eq!(message.content, format!("message {i}"));
        }
    }

    #[tokio::test]
    async fn test_delete_removes_both_copies() {
        let manager = PersistenceManager::new(Arc::new(MemoryBackend::new()));
        let session = manager
            .create_session(Message::user("bye"), "auto")
            .await
            .unwrap();

        manager.delete_session(&session.id).await.unwrap();
        assert!(manager.get_session(&session.id).await.unwrap().is_none());
        assert!(manager.list_sessions().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_list_summarizes_sessions() {
        let manager = PersistenceManager::new(Arc::new(MemoryBackend::new()));
        manager
            .create_session(Message::user("What's the weather in Paris today?"), "auto")
            .await
            .unwrap();

        let list = manager.list_sessions().await.unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].message_count, 1);
        assert!(list[0].preview.contains("Paris"));
    }
}
