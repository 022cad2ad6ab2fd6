/*
    session_store.rs - Session records and the current-session pointer

    Layout:
    - session:{id}           one serialized ChatSession
    - sessionIndex           JSON array of every ChatSession, rewritten on
                             each save
    - currentSessionPointer  raw id of the current session

    Every read-modify-write of a session or the index runs under
    `write_lock`, so concurrent appends cannot lose counter updates.
*/

use super::model::ChatSession;
use crate::error::{StorageError, StorageResult};
use crate::kv::{keys, KvStore};
use crate::metrics;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

/// CRUD for sessions plus the current-session pointer
pub struct SessionStore {
    kv: Arc<dyn KvStore>,
    /// Cached pointer; `None` until loaded or set
    current_id: RwLock<Option<String>>,
    write_lock: Mutex<()>,
}

impl SessionStore {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self {
            kv,
            current_id: RwLock::new(None),
            write_lock: Mutex::new(()),
        }
    }

    /// Create, persist and point at a new session
    pub async fn create_session(&self, name: Option<&str>) -> StorageResult<ChatSession> {
        let _guard = self.write_lock.lock().await;
        self.create_session_locked(name).await
    }

    /// Resolve the current session, creating one if none resolves
    ///
    /// Resolution is repeated under the write lock before creating, so
    /// concurrent first writers all land in the same session.
    pub async fn current_session(&self) -> StorageResult<ChatSession> {
        if let Some(session) = self.resolve_current().await? {
            return Ok(session);
        }

        let _guard = self.write_lock.lock().await;
        if let Some(session) = self.resolve_current().await? {
            return Ok(session);
        }
        self.create_session_locked(None).await
    }

    async fn resolve_current(&self) -> StorageResult<Option<ChatSession>> {
        if self.current_id.read().await.is_none() {
            self.load_current_pointer().await;
        }

        let current_id = self.current_id.read().await.clone();
        let Some(id) = current_id else {
            return Ok(None);
        };

        let session = self.get_session(&id).await?;
        if session.is_none() {
            warn!(session_id = %id, "Current session pointer is dangling");
        }
        Ok(session)
    }

    async fn create_session_locked(&self, name: Option<&str>) -> StorageResult<ChatSession> {
        let session = ChatSession::new(name);
        self.save_session_locked(&session).await?;
        self.set_pointer(&session.id).await?;

        metrics::record_counter(metrics::SESSIONS_CREATED, 1);
        info!(session_id = %session.id, name = %session.name, "Created chat session");
        Ok(session)
    }

    /// Load the persisted pointer into the cache (best-effort)
    pub async fn load_current_pointer(&self) {
        match self.kv.get(keys::CURRENT_SESSION_POINTER).await {
            Ok(pointer) => *self.current_id.write().await = pointer,
            Err(e) => warn!(error = %e, "Error loading current session pointer"),
        }
    }

    /// Id the pointer currently holds, if any
    pub async fn current_session_id(&self) -> Option<String> {
        self.current_id.read().await.clone()
    }

    /// Point at an existing session; other fields are untouched
    pub async fn switch_current_session(&self, session_id: &str) -> StorageResult<ChatSession> {
        let _guard = self.write_lock.lock().await;
        let session = self
            .get_session(session_id)
            .await?
            .ok_or_else(|| StorageError::SessionNotFound(session_id.to_string()))?;

        self.set_pointer(&session.id).await?;
        debug!(session_id, "Switched current session");
        Ok(session)
    }

    /// Load one session; a corrupt record reads as absent
    pub async fn get_session(&self, session_id: &str) -> StorageResult<Option<ChatSession>> {
        let Some(raw) = self.kv.get(&keys::session(session_id)).await? else {
            return Ok(None);
        };

        match serde_json::from_str(&raw) {
            Ok(session) => Ok(Some(session)),
            Err(e) => {
                warn!(session_id, error = %e, "Corrupt session record");
                Ok(None)
            }
        }
    }

    /// Every session in the index, best-effort
    ///
    /// Read failures yield an empty list; individual corrupt entries are
    /// skipped.
    pub async fn all_sessions(&self) -> Vec<ChatSession> {
        match self.load_index().await {
            Ok(sessions) => sessions,
            Err(e) => {
                warn!(error = %e, "Error getting all sessions");
                Vec::new()
            }
        }
    }

    /// Upsert into the session record and the index
    pub async fn save_session(&self, session: &ChatSession) -> StorageResult<()> {
        let _guard = self.write_lock.lock().await;
        self.save_session_locked(session).await
    }

    /// Read-modify-write one session under the write lock
    pub async fn update_session<F>(&self, session_id: &str, mutate: F) -> StorageResult<ChatSession>
    where
        F: FnOnce(&mut ChatSession) + Send,
    {
        let _guard = self.write_lock.lock().await;

        let mut session = self
            .get_session(session_id)
            .await?
            .ok_or_else(|| StorageError::SessionNotFound(session_id.to_string()))?;
        mutate(&mut session);
        self.save_session_locked(&session).await?;
        Ok(session)
    }

    /// Bump the counters after a message was appended
    pub async fn record_append(
        &self,
        session_id: &str,
        at: DateTime<Utc>,
    ) -> StorageResult<ChatSession> {
        self.update_session(session_id, |session| {
            session.message_count += 1;
            session.last_message_at = at;
        })
        .await
    }

    /// Remove the session record and its index entry
    ///
    /// Chunks are owned by the chunk store and removed separately.
    pub async fn delete_session(&self, session_id: &str) -> StorageResult<()> {
        let _guard = self.write_lock.lock().await;

        self.kv.remove(&keys::session(session_id)).await?;

        let mut sessions = self.load_index().await?;
        sessions.retain(|s| s.id != session_id);
        self.write_index(&sessions).await?;

        let mut current = self.current_id.write().await;
        if current.as_deref() == Some(session_id) {
            self.kv.remove(keys::CURRENT_SESSION_POINTER).await?;
            *current = None;
        }

        debug!(session_id, "Deleted session record");
        Ok(())
    }

    /// Drop the index and the pointer
    pub async fn clear(&self) -> StorageResult<()> {
        let _guard = self.write_lock.lock().await;

        self.kv.remove(keys::SESSION_INDEX).await?;
        self.kv.remove(keys::CURRENT_SESSION_POINTER).await?;
        *self.current_id.write().await = None;
        Ok(())
    }

    async fn save_session_locked(&self, session: &ChatSession) -> StorageResult<()> {
        self.kv
            .set(&keys::session(&session.id), &serde_json::to_string(session)?)
            .await?;

        let mut sessions = self.load_index().await?;
        sessions.retain(|s| s.id != session.id);
        sessions.push(session.clone());
        self.write_index(&sessions).await
    }

    async fn set_pointer(&self, session_id: &str) -> StorageResult<()> {
        self.kv
            .set(keys::CURRENT_SESSION_POINTER, session_id)
            .await?;
        *self.current_id.write().await = Some(session_id.to_string());
        Ok(())
    }

    /// Read the index; I/O errors propagate so a failed read never wipes it
    async fn load_index(&self) -> StorageResult<Vec<ChatSession>> {
        let Some(raw) = self.kv.get(keys::SESSION_INDEX).await? else {
            return Ok(Vec::new());
        };

        let entries: Vec<serde_json::Value> = serde_json::from_str(&raw)?;
        let sessions = entries
            .into_iter()
            .filter_map(|entry| match serde_json::from_value::<ChatSession>(entry) {
                Ok(session) => Some(session),
                Err(e) => {
                    warn!(error = %e, "Skipping corrupt session index entry");
                    None
                }
            })
            .collect();
        Ok(sessions)
    }

    async fn write_index(&self, sessions: &[ChatSession]) -> StorageResult<()> {
        self.kv
            .set(keys::SESSION_INDEX, &serde_json::to_string(sessions)?)
            .await
    }
}
