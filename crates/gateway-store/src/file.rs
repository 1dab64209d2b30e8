//! File Backend
//!
//! One JSON document per session under a data directory. Writes go to
//! a temp file then rename, so readers never observe a half-written
//! session. Suits single-process deployments; the manager's
//! per-session serialization is the only writer coordination.

use std::path::{Path, PathBuf};

use async_trait::async_trait;

use gateway_core::{Message, Session, SessionId};

use crate::backend::SessionBackend;
use crate::error::{Result, StoreError};

pub struct FileBackend {
    dir: PathBuf,
}

impl FileBackend {
    /// Open (creating if needed) a session directory
    pub async fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self { dir })
    }

    fn path_for(&self, id: &SessionId) -> PathBuf {
        // Session ids are uuids; no traversal risk, but reject
        // separators anyway.
        let safe: String = id
            .as_str()
            .chars()
            .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
            .collect();
        self.dir.join(format!("{safe}.json"))
    }

    async fn write_session(&self, session: &Session) -> Result<()> {
        let path = self.path_for(&session.id);
        let tmp = path.with_extension("json.tmp");
        let body = serde_json::to_vec_pretty(session)?;
        tokio::fs::write(&tmp, body).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn read_session(&self, id: &SessionId) -> Result<Option<Session>> {
        let path = self.path_for(id);
        match tokio::fs::read(&path).await {
            Ok(body) => Ok(Some(serde_json::from_slice(&body)?)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }
}

#[async_trait]
impl SessionBackend for FileBackend {
    async fn put_session(&self, session: &Session) -> Result<()> {
        self.write_session(session).await
    }

    async fn get_session(&self, id: &SessionId) -> Result<Option<Session>> {
        self.read_session(id).await
    }

    async fn list_sessions(&self) -> Result<Vec<Session>> {
        let mut sessions = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match tokio::fs::read(&path).await {
                Ok(body) => match serde_json::from_slice::<Session>(&body) {
                    Ok(session) => sessions.push(session),
                    Err(err) => {
                        tracing::warn!(path = %path.display(), error = %err, "skipping unreadable session file");
                    }
                },
                Err(err) => {
                    tracing::warn!(path = %path.display(), error = %err, "skipping session file");
                }
            }
        }
        sessions.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(sessions)
    }

    async fn delete_session(&self, id: &SessionId) -> Result<()> {
        let path = self.path_for(id);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    async fn append_message(&self, id: &SessionId, message: &Message) -> Result<()> {
        let mut session = self
            .read_session(id)
            .await?
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        session.append(message.clone());
        self.write_session(&session).await
    }
}
