/*
    facade.rs - ChatStorage, the entry point collaborators talk to

    Lifecycle is explicit: a ChatStorage starts Uninitialized and every
    operation except `initialize` fails with NotInitialized until it has
    run. `initialize` is idempotent.

    Write paths (send, update_config, clear) propagate errors. Read paths
    degrade to best-effort results and log what they skipped.
*/

use crate::config::{ConfigStore, StorageConfig, StorageConfigUpdate, VaultSettings};
use crate::crypto::{
    CipherCodec, KeyBackingStore, KeyManager, ObfuscatedFallbackStore, SecureBackingStore,
};
use crate::error::{StorageError, StorageResult};
use crate::health::{ComponentHealth, HealthReport};
use crate::kv::{keys, FileKvStore, KvStore, MemoryKvStore, TimeoutKvStore};
use crate::metrics;
use crate::store::{
    ChatMessage, ChatSession, ChunkStore, MaintenanceReport, MaintenanceScheduler, SessionStore,
    StoredChatMessage,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, RwLock};
use tracing::{debug, info, warn};

/// Times `send_message` re-resolves the current session after it vanished
const SEND_ATTEMPTS: usize = 3;

/// Aggregate counters over every session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageStats {
    pub total_sessions: usize,
    /// Sum of `message_count` across sessions
    pub total_messages: u64,
    pub archived_sessions: usize,
    pub encryption_enabled: bool,
}

/// Session metadata snapshot, without message bodies
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatExport {
    pub sessions: Vec<ChatSession>,
    pub stats: StorageStats,
    pub export_date: DateTime<Utc>,
}

#[derive(Clone)]
struct ReadyState {
    config: StorageConfig,
    codec: CipherCodec,
}

enum Lifecycle {
    Uninitialized,
    Ready(ReadyState),
}

/// Encrypted chat history storage
pub struct ChatStorage {
    kv: Arc<dyn KvStore>,
    keys: KeyManager,
    config_store: ConfigStore,
    sessions: Arc<SessionStore>,
    chunks: Arc<ChunkStore>,
    maintenance: MaintenanceScheduler,
    state: RwLock<Lifecycle>,
}

impl ChatStorage {
    pub fn new(kv: Arc<dyn KvStore>, keys: KeyManager) -> Self {
        let sessions = Arc::new(SessionStore::new(kv.clone()));
        let chunks = Arc::new(ChunkStore::new(kv.clone()));

        Self {
            config_store: ConfigStore::new(kv.clone()),
            maintenance: MaintenanceScheduler::new(sessions.clone(), chunks.clone()),
            kv,
            keys,
            sessions,
            chunks,
            state: RwLock::new(Lifecycle::Uninitialized),
        }
    }

    /// File-backed storage from process settings
    ///
    /// Records live under `data_dir` behind the I/O deadline. The key goes
    /// to `key_dir` when set, else to the obfuscated fallback record.
    pub fn open(settings: &VaultSettings) -> StorageResult<Self> {
        let file_store = FileKvStore::new(&settings.data_dir)?;
        let kv: Arc<dyn KvStore> = Arc::new(TimeoutKvStore::new(file_store, settings.io_timeout));

        let secure: Arc<dyn KeyBackingStore> = match &settings.key_dir {
            Some(dir) => Arc::new(SecureBackingStore::new(dir)),
            None => Arc::new(SecureBackingStore::unavailable()),
        };
        let fallback = Arc::new(ObfuscatedFallbackStore::new(kv.clone()));

        info!(data_dir = %settings.data_dir.display(), "Opening chat storage");
        Ok(Self::new(kv, KeyManager::new(secure, fallback)))
    }

    /// Volatile storage with the key in the fallback record
    pub fn in_memory() -> Self {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new());
        let keys = KeyManager::new(
            Arc::new(SecureBackingStore::unavailable()),
            Arc::new(ObfuscatedFallbackStore::new(kv.clone())),
        );
        Self::new(kv, keys)
    }

    /// Load config, establish key material and the current-session pointer
    ///
    /// Safe to call repeatedly; only the first call does any work.
    pub async fn initialize(&self) -> StorageResult<()> {
        let mut state = self.state.write().await;
        if matches!(*state, Lifecycle::Ready(_)) {
            return Ok(());
        }

        let ready = self.bootstrap().await;
        self.sessions.load_current_pointer().await;

        info!(
            encryption = ready.codec.is_active(),
            max_messages_per_chunk = ready.config.max_messages_per_chunk,
            "Chat storage initialized"
        );
        *state = Lifecycle::Ready(ready);
        Ok(())
    }

    pub async fn is_initialized(&self) -> bool {
        matches!(*self.state.read().await, Lifecycle::Ready(_))
    }

    async fn bootstrap(&self) -> ReadyState {
        let mut config = self.config_store.load().await;
        let codec = if config.encryption_enabled {
            self.codec_for_new_key(&mut config).await
        } else {
            CipherCodec::passthrough()
        };
        ReadyState { config, codec }
    }

    /// Acquire the key; on failure run unencrypted for this process
    async fn codec_for_new_key(&self, config: &mut StorageConfig) -> CipherCodec {
        match self.keys.acquire_key().await {
            Ok(key) => CipherCodec::new(Some(key)),
            Err(e) => {
                warn!(error = %e, "Key material unavailable, encryption disabled");
                config.encryption_enabled = false;
                CipherCodec::passthrough()
            }
        }
    }

    async fn ready(&self) -> StorageResult<ReadyState> {
        match &*self.state.read().await {
            Lifecycle::Ready(ready) => Ok(ready.clone()),
            Lifecycle::Uninitialized => Err(StorageError::NotInitialized),
        }
    }

    /// Persist a new message in the current session
    ///
    /// The append and the counter update run under the session's chunk
    /// lock. A session deleted before the lock was taken is never written
    /// to; the message goes to whichever session is current afterwards. If
    /// the counter update fails the appended message is taken back out.
    pub async fn send_message(&self, text: &str, is_user: bool) -> StorageResult<ChatMessage> {
        let ready = self.ready().await?;
        let message = ChatMessage::new(text, is_user);
        let mut last_session_id = String::new();

        for _ in 0..SEND_ATTEMPTS {
            let session = self.sessions.current_session().await?;
            let lock = self.chunks.lock_session(&session.id).await;
            if self.sessions.get_session(&session.id).await?.is_none() {
                debug!(session_id = %session.id, "Session removed before append, resolving again");
                last_session_id = session.id;
                continue;
            }

            let stored = StoredChatMessage::seal(&message, &session.id, &ready.codec);
            let append = self
                .chunks
                .append_locked(&lock, stored, &ready.codec, ready.config.max_messages_per_chunk)
                .await?;

            if let Err(e) = self
                .sessions
                .record_append(&session.id, message.timestamp)
                .await
            {
                warn!(session_id = %session.id, error = %e, "Session update failed, undoing append");
                if let Err(undo) = self.chunks.restore_locked(&lock, append.previous).await {
                    warn!(session_id = %session.id, error = %undo, "Error undoing append");
                }
                return Err(e);
            }

            debug!(
                session_id = %session.id,
                message_id = %message.id,
                chunk_index = append.placement.chunk_index,
                "Message stored"
            );
            return Ok(message);
        }

        Err(StorageError::SessionNotFound(last_session_id))
    }

    pub async fn add_user_message(&self, text: &str) -> StorageResult<ChatMessage> {
        self.send_message(text, true).await
    }

    pub async fn add_coach_response(&self, text: &str) -> StorageResult<ChatMessage> {
        self.send_message(text, false).await
    }

    /// Most recent `limit` messages of the current session, oldest first
    pub async fn get_recent_messages(&self, limit: usize) -> StorageResult<Vec<ChatMessage>> {
        let ready = self.ready().await?;
        let session = self.sessions.current_session().await?;
        Ok(self.chunks.messages(&session.id, &ready.codec, Some(limit)).await)
    }

    /// Every message of the current session, oldest first
    pub async fn get_all_messages(&self) -> StorageResult<Vec<ChatMessage>> {
        let ready = self.ready().await?;
        let session = self.sessions.current_session().await?;
        Ok(self.chunks.messages(&session.id, &ready.codec, None).await)
    }

    pub async fn get_session_messages(
        &self,
        session_id: &str,
        limit: Option<usize>,
    ) -> StorageResult<Vec<ChatMessage>> {
        let ready = self.ready().await?;
        Ok(self.chunks.messages(session_id, &ready.codec, limit).await)
    }

    /// Every session, most recently active first
    pub async fn get_all_sessions(&self) -> StorageResult<Vec<ChatSession>> {
        self.ready().await?;
        let mut sessions = self.sessions.all_sessions().await;
        sessions.sort_by(|a, b| b.last_message_at.cmp(&a.last_message_at));
        Ok(sessions)
    }

    /// Create a session and make it current
    pub async fn create_new_session(&self, name: Option<&str>) -> StorageResult<ChatSession> {
        self.ready().await?;
        self.sessions.create_session(name).await
    }

    pub async fn current_session(&self) -> StorageResult<ChatSession> {
        self.ready().await?;
        self.sessions.current_session().await
    }

    pub async fn switch_to_session(&self, session_id: &str) -> StorageResult<ChatSession> {
        self.ready().await?;
        self.sessions.switch_current_session(session_id).await
    }

    pub async fn get_storage_stats(&self) -> StorageResult<StorageStats> {
        let ready = self.ready().await?;
        let sessions = self.sessions.all_sessions().await;

        metrics::record_gauge(metrics::SESSIONS_TOTAL, sessions.len() as f64);
        Ok(StorageStats {
            total_sessions: sessions.len(),
            total_messages: sessions.iter().map(|s| s.message_count).sum(),
            archived_sessions: sessions.iter().filter(|s| s.archived).count(),
            encryption_enabled: ready.codec.is_active(),
        })
    }

    pub async fn config(&self) -> StorageResult<StorageConfig> {
        Ok(self.ready().await?.config)
    }

    /// Validate and persist a partial config update
    ///
    /// A rejected update leaves the active and stored config untouched.
    /// Turning encryption on acquires key material; messages written under
    /// the other setting are not migrated.
    pub async fn update_config(&self, update: StorageConfigUpdate) -> StorageResult<StorageConfig> {
        let mut state = self.state.write().await;
        let Lifecycle::Ready(ready) = &mut *state else {
            return Err(StorageError::NotInitialized);
        };

        let mut config = self.config_store.update(&ready.config, &update).await?;

        let codec = match (config.encryption_enabled, ready.codec.is_active()) {
            (true, false) => self.codec_for_new_key(&mut config).await,
            (false, true) => CipherCodec::passthrough(),
            _ => ready.codec.clone(),
        };

        info!(?update, "Storage config updated");
        *ready = ReadyState { config, codec };
        Ok(config)
    }

    /// Archive stale sessions, then prune archived ones beyond retention
    pub async fn perform_maintenance(&self) -> StorageResult<MaintenanceReport> {
        let ready = self.ready().await?;
        let timer = metrics::Timer::new(metrics::MAINTENANCE_DURATION_MS);

        let report = self
            .maintenance
            .run(
                ready.config.archive_after_days,
                ready.config.max_sessions_to_keep,
            )
            .await;

        timer.stop();
        info!(archived = report.archived, pruned = report.pruned, "Maintenance complete");
        Ok(report)
    }

    /// Delete every session, chunk, the config, the pointer and the key
    ///
    /// Storage stays usable afterwards, starting over with default config
    /// and fresh key material.
    pub async fn clear_all_data(&self) -> StorageResult<()> {
        let mut state = self.state.write().await;
        if matches!(*state, Lifecycle::Uninitialized) {
            return Err(StorageError::NotInitialized);
        }

        for session in self.sessions.all_sessions().await {
            let lock = self.chunks.lock_session(&session.id).await;
            self.chunks.delete_locked(&lock).await?;
            self.sessions.delete_session(&session.id).await?;
        }

        // Records missing from the index
        for key in self.kv.keys().await? {
            if key.starts_with(keys::SESSION_PREFIX)
                || key.starts_with(keys::CHUNKS_PREFIX)
                || key.starts_with(keys::HEALTH_CHECK_PREFIX)
            {
                self.kv.remove(&key).await?;
            }
        }

        self.sessions.clear().await?;
        self.config_store.clear().await?;
        self.keys.delete_key().await?;

        *state = Lifecycle::Ready(self.bootstrap().await);
        info!("All chat data cleared");
        Ok(())
    }

    /// Write and read back a sample message through the active codec
    ///
    /// Each call uses its own scratch record, so concurrent checks never
    /// see or remove each other's writes.
    pub async fn health_check(&self) -> HealthReport {
        let ready = match self.ready().await {
            Ok(ready) => ready,
            Err(e) => {
                return HealthReport::from_components(
                    false,
                    false,
                    vec![e.to_string()],
                    vec![ComponentHealth::unhealthy("storage", e.to_string())],
                )
            }
        };

        let mut errors = Vec::new();
        let check_id = uuid::Uuid::new_v4().to_string();
        let record_key = keys::health_check(&check_id);
        let sample = ChatMessage::new(format!("health-check-{}", check_id), true);
        let sealed = StoredChatMessage::seal(&sample, "health-check", &ready.codec);

        let round_trip = self.write_and_read_back(&record_key, &sealed).await;
        if let Err(e) = self.kv.remove(&record_key).await {
            warn!(key = %record_key, error = %e, "Error removing health check record");
        }

        let storage_working = match &round_trip {
            Ok(read_back) if *read_back == sealed => true,
            Ok(_) => {
                errors.push("Health check record read back differs from what was written".to_string());
                false
            }
            Err(e) => {
                errors.push(format!("Storage round trip failed: {}", e));
                false
            }
        };

        let encryption_working = if ready.codec.is_active() {
            let ciphertext_hides_text = sealed.text.is_empty()
                && sealed
                    .encrypted_content
                    .as_deref()
                    .is_some_and(|token| !token.contains(&sample.text));
            let decrypts = sealed
                .clone()
                .open(&ready.codec)
                .is_ok_and(|opened| opened.text == sample.text);

            if !ciphertext_hides_text {
                errors.push("Encrypted sample exposes plaintext".to_string());
            }
            if !decrypts {
                errors.push("Encrypted sample did not decrypt to its plaintext".to_string());
            }
            ciphertext_hides_text && decrypts
        } else {
            false
        };

        let components = vec![
            if storage_working {
                ComponentHealth::healthy("storage")
            } else {
                ComponentHealth::unhealthy("storage", errors.join("; "))
            },
            match (ready.codec.is_active(), encryption_working) {
                (true, true) => ComponentHealth::healthy("encryption"),
                (true, false) => {
                    ComponentHealth::unhealthy("encryption", "Encryption round trip failed")
                }
                (false, _) => ComponentHealth::degraded("encryption", "Encryption disabled"),
            },
        ];

        let report = HealthReport::from_components(storage_working, encryption_working, errors, components);
        debug!(status = ?report.status, "Health check complete");
        report
    }

    async fn write_and_read_back(
        &self,
        key: &str,
        sealed: &StoredChatMessage,
    ) -> StorageResult<StoredChatMessage> {
        self.kv.set(key, &serde_json::to_string(sealed)?).await?;
        let raw = self
            .kv
            .get(key)
            .await?
            .ok_or_else(|| StorageError::Io("Health check record missing after write".to_string()))?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Session metadata and stats, without message bodies
    pub async fn export_chat_data(&self) -> StorageResult<ChatExport> {
        Ok(ChatExport {
            sessions: self.get_all_sessions().await?,
            stats: self.get_storage_stats().await?,
            export_date: Utc::now(),
        })
    }

    /// Recent messages of the current session as `User:` / `Coach:` lines
    pub async fn conversation_context(&self, limit: usize) -> StorageResult<String> {
        let messages = self.get_recent_messages(limit).await?;
        Ok(render_context(&messages).join("\n"))
    }
}

/// One `User: ...` or `Coach: ...` line per message
pub fn render_context(messages: &[ChatMessage]) -> Vec<String> {
    messages
        .iter()
        .map(|m| format!("{}: {}", if m.is_user { "User" } else { "Coach" }, m.text))
        .collect()
}

/// Run maintenance every `interval` until `shutdown` flips to true
pub async fn maintenance_loop(
    storage: Arc<ChatStorage>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(interval = ?interval, "Maintenance loop scheduled");
    let mut ticker = tokio::time::interval(interval);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => break,
        }

        if *shutdown.borrow() {
            break;
        }

        if let Err(e) = storage.perform_maintenance().await {
            warn!(error = %e, "Maintenance run failed");
        }
    }

    debug!("Maintenance loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::backing::FALLBACK_KEY_ALIAS;
    use crate::test_utils::{backdate_session, BrokenKeyStore, FailingKvStore};

    async fn ready_storage() -> ChatStorage {
        let storage = ChatStorage::in_memory();
        storage.initialize().await.unwrap();
        storage
    }

    #[tokio::test]
    async fn test_operations_require_initialize() {
        let storage = ChatStorage::in_memory();

        assert!(matches!(
            storage.send_message("hi", true).await,
            Err(StorageError::NotInitialized)
        ));
        assert!(matches!(
            storage.get_all_sessions().await,
            Err(StorageError::NotInitialized)
        ));
        assert!(matches!(
            storage.clear_all_data().await,
            Err(StorageError::NotInitialized)
        ));
        assert!(!storage.health_check().await.storage_working);

        storage.initialize().await.unwrap();
        storage.initialize().await.unwrap();
        assert!(storage.is_initialized().await);
    }

    #[tokio::test]
    async fn test_send_updates_session_counters() {
        let storage = ready_storage().await;

        let first = storage.add_user_message("I slept badly").await.unwrap();
        let reply = storage.add_coach_response("Let's look at why").await.unwrap();
        assert!(first.is_user);
        assert!(!reply.is_user);

        let session = storage.current_session().await.unwrap();
        assert_eq!(session.message_count, 2);
        assert_eq!(session.last_message_at, reply.timestamp);

        let messages = storage.get_all_messages().await.unwrap();
        assert_eq!(messages, vec![first, reply]);
    }

    #[tokio::test]
    async fn test_messages_are_encrypted_at_rest() {
        let kv = Arc::new(MemoryKvStore::new());
        let storage = ChatStorage::new(
            kv.clone(),
            KeyManager::new(
                Arc::new(SecureBackingStore::unavailable()),
                Arc::new(ObfuscatedFallbackStore::new(kv.clone())),
            ),
        );
        storage.initialize().await.unwrap();
        storage.send_message("very private words", true).await.unwrap();

        let session = storage.current_session().await.unwrap();
        let raw = kv.get(&keys::chunks(&session.id)).await.unwrap().unwrap();
        assert!(!raw.contains("very private words"));
        assert!(kv.get(FALLBACK_KEY_ALIAS).await.unwrap().is_some());

        let recent = storage.get_recent_messages(1).await.unwrap();
        assert_eq!(recent[0].text, "very private words");
    }

    #[tokio::test]
    async fn test_key_failure_disables_encryption() {
        let kv = Arc::new(MemoryKvStore::new());
        let storage = ChatStorage::new(
            kv.clone(),
            KeyManager::new(
                Arc::new(BrokenKeyStore::available()),
                Arc::new(BrokenKeyStore::available()),
            ),
        );
        storage.initialize().await.unwrap();

        let stats = storage.get_storage_stats().await.unwrap();
        assert!(!stats.encryption_enabled);

        storage.send_message("plain", true).await.unwrap();
        let session = storage.current_session().await.unwrap();
        let raw = kv.get(&keys::chunks(&session.id)).await.unwrap().unwrap();
        assert!(raw.contains("plain"));
        assert_eq!(storage.get_all_messages().await.unwrap()[0].text, "plain");

        // Disabled in memory only
        assert!(kv.get(keys::CONFIG).await.unwrap().is_none());

        let report = storage.health_check().await;
        assert!(report.storage_working);
        assert!(!report.encryption_working);
        assert_eq!(report.status, crate::health::HealthStatus::Degraded);
    }

    #[tokio::test]
    async fn test_rejected_config_update_keeps_config() {
        let storage = ready_storage().await;
        let before = storage.config().await.unwrap();

        let result = storage
            .update_config(StorageConfigUpdate {
                max_messages_per_chunk: Some(0),
                ..Default::default()
            })
            .await;
        assert!(matches!(result, Err(StorageError::ConfigValidation(_))));
        assert_eq!(storage.config().await.unwrap(), before);

        let updated = storage
            .update_config(StorageConfigUpdate {
                max_messages_per_chunk: Some(2),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(updated.max_messages_per_chunk, 2);
        assert_eq!(updated.archive_after_days, before.archive_after_days);
    }

    #[tokio::test]
    async fn test_toggling_encryption() {
        let storage = ready_storage().await;

        storage
            .update_config(StorageConfigUpdate {
                encryption_enabled: Some(false),
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(!storage.get_storage_stats().await.unwrap().encryption_enabled);

        storage
            .update_config(StorageConfigUpdate {
                encryption_enabled: Some(true),
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(storage.get_storage_stats().await.unwrap().encryption_enabled);
    }

    #[tokio::test]
    async fn test_sessions_switch_and_isolate_messages() {
        let storage = ready_storage().await;

        let first = storage.create_new_session(Some("Sleep")).await.unwrap();
        storage.send_message("about sleep", true).await.unwrap();

        let second = storage.create_new_session(Some("Stress")).await.unwrap();
        storage.send_message("about stress", true).await.unwrap();
        assert_eq!(storage.current_session().await.unwrap().id, second.id);

        storage.switch_to_session(&first.id).await.unwrap();
        let texts: Vec<String> = storage
            .get_all_messages()
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.text)
            .collect();
        assert_eq!(texts, vec!["about sleep".to_string()]);

        assert_eq!(
            storage
                .get_session_messages(&second.id, None)
                .await
                .unwrap()
                .len(),
            1
        );
        assert!(matches!(
            storage.switch_to_session("nope").await,
            Err(StorageError::SessionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_stats_and_export() {
        let storage = ready_storage().await;
        storage.send_message("one", true).await.unwrap();
        storage.send_message("two", false).await.unwrap();
        storage.create_new_session(None).await.unwrap();
        storage.send_message("three", true).await.unwrap();

        let stats = storage.get_storage_stats().await.unwrap();
        assert_eq!(
            stats,
            StorageStats {
                total_sessions: 2,
                total_messages: 3,
                archived_sessions: 0,
                encryption_enabled: true,
            }
        );

        let export = storage.export_chat_data().await.unwrap();
        assert_eq!(export.sessions.len(), 2);
        assert_eq!(export.stats, stats);
        let json = serde_json::to_string(&export).unwrap();
        assert!(json.contains("exportDate"));
        assert!(!json.contains("three"));
    }

    #[tokio::test]
    async fn test_clear_all_data() {
        let kv = Arc::new(MemoryKvStore::new());
        let storage = ChatStorage::new(
            kv.clone(),
            KeyManager::new(
                Arc::new(SecureBackingStore::unavailable()),
                Arc::new(ObfuscatedFallbackStore::new(kv.clone())),
            ),
        );
        storage.initialize().await.unwrap();
        let old_key = kv.get(FALLBACK_KEY_ALIAS).await.unwrap();

        storage.send_message("a", true).await.unwrap();
        storage.create_new_session(None).await.unwrap();
        storage.send_message("b", true).await.unwrap();
        storage
            .update_config(StorageConfigUpdate {
                max_sessions_to_keep: Some(3),
                ..Default::default()
            })
            .await
            .unwrap();

        storage.clear_all_data().await.unwrap();

        assert!(storage.get_all_sessions().await.unwrap().is_empty());
        assert_eq!(storage.get_storage_stats().await.unwrap().total_sessions, 0);
        assert_eq!(storage.config().await.unwrap(), StorageConfig::default());

        let remaining = kv.keys().await.unwrap();
        assert!(remaining
            .iter()
            .all(|k| !k.starts_with(keys::SESSION_PREFIX) && !k.starts_with(keys::CHUNKS_PREFIX)));
        assert!(!remaining.contains(&keys::CURRENT_SESSION_POINTER.to_string()));
        assert_ne!(kv.get(FALLBACK_KEY_ALIAS).await.unwrap(), old_key);

        // Still usable
        storage.send_message("fresh start", true).await.unwrap();
        assert_eq!(storage.get_all_messages().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_health_check_on_fresh_store() {
        let storage = ready_storage().await;
        let report = storage.health_check().await;

        assert!(report.storage_working);
        assert!(report.encryption_working);
        assert!(report.errors.is_empty());
        assert!(report.is_healthy());
        assert!(storage.get_all_sessions().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_health_check_reports_storage_failure() {
        let kv = Arc::new(FailingKvStore::new());
        let storage = ChatStorage::new(
            kv.clone(),
            KeyManager::new(
                Arc::new(SecureBackingStore::unavailable()),
                Arc::new(ObfuscatedFallbackStore::new(kv.clone())),
            ),
        );
        storage.initialize().await.unwrap();
        kv.fail_writes(true);

        let report = storage.health_check().await;
        assert!(!report.storage_working);
        assert_eq!(report.status, crate::health::HealthStatus::Unhealthy);
        assert!(!report.errors.is_empty());

        assert!(storage.send_message("lost", true).await.is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_health_checks_are_independent() {
        let kv = Arc::new(MemoryKvStore::new());
        let storage = Arc::new(ChatStorage::new(
            kv.clone(),
            KeyManager::new(
                Arc::new(SecureBackingStore::unavailable()),
                Arc::new(ObfuscatedFallbackStore::new(kv.clone())),
            ),
        ));
        storage.initialize().await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..16 {
            let storage = storage.clone();
            handles.push(tokio::spawn(async move { storage.health_check().await }));
        }
        for handle in handles {
            let report = handle.await.unwrap();
            assert!(report.storage_working, "{:?}", report.errors);
        }

        let stored = kv.keys().await.unwrap();
        assert!(stored.iter().all(|k| !k.starts_with(keys::HEALTH_CHECK_PREFIX)));
    }

    #[tokio::test]
    async fn test_send_never_revives_a_pruned_session() {
        let kv = Arc::new(MemoryKvStore::new());
        let storage = Arc::new(ChatStorage::new(
            kv.clone(),
            KeyManager::new(
                Arc::new(SecureBackingStore::unavailable()),
                Arc::new(ObfuscatedFallbackStore::new(kv.clone())),
            ),
        ));
        storage.initialize().await.unwrap();
        let doomed = storage.current_session().await.unwrap();

        // Hold the session's chunk lock the way a prune does
        let lock = storage.chunks.lock_session(&doomed.id).await;
        let send = tokio::spawn({
            let storage = storage.clone();
            async move { storage.send_message("after prune", true).await }
        });
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert!(!send.is_finished());

        storage.chunks.delete_locked(&lock).await.unwrap();
        storage.sessions.delete_session(&doomed.id).await.unwrap();
        drop(lock);

        let message = send.await.unwrap().unwrap();
        assert!(kv.get(&keys::chunks(&doomed.id)).await.unwrap().is_none());
        assert!(kv.get(&keys::session(&doomed.id)).await.unwrap().is_none());

        let current = storage.current_session().await.unwrap();
        assert_ne!(current.id, doomed.id);
        assert_eq!(current.message_count, 1);
        assert_eq!(storage.get_all_messages().await.unwrap(), vec![message]);
    }

    #[tokio::test]
    async fn test_failed_counter_update_undoes_append() {
        let kv = Arc::new(FailingKvStore::new());
        let storage = ChatStorage::new(
            kv.clone(),
            KeyManager::new(
                Arc::new(SecureBackingStore::unavailable()),
                Arc::new(ObfuscatedFallbackStore::new(kv.clone())),
            ),
        );
        storage.initialize().await.unwrap();
        storage.send_message("counted", true).await.unwrap();

        kv.fail_writes_to(keys::SESSION_PREFIX);
        assert!(storage.send_message("uncounted", true).await.is_err());

        let session = storage.current_session().await.unwrap();
        assert_eq!(session.message_count, 1);
        let texts: Vec<String> = storage
            .get_all_messages()
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.text)
            .collect();
        assert_eq!(texts, vec!["counted".to_string()]);
    }

    #[tokio::test]
    async fn test_perform_maintenance() {
        let storage = ready_storage().await;
        backdate_session(&storage.sessions, "old", 35).await;
        backdate_session(&storage.sessions, "mid", 20).await;
        backdate_session(&storage.sessions, "new", 5).await;

        let report = storage.perform_maintenance().await.unwrap();
        assert_eq!(report, MaintenanceReport { archived: 1, pruned: 0 });
        assert_eq!(storage.get_storage_stats().await.unwrap().archived_sessions, 1);
    }

    #[tokio::test]
    async fn test_conversation_context() {
        let storage = ready_storage().await;
        storage.add_user_message("hello").await.unwrap();
        storage.add_coach_response("hi there").await.unwrap();
        storage.add_user_message("how are you").await.unwrap();

        let context = storage.conversation_context(2).await.unwrap();
        assert_eq!(context, "Coach: hi there\nUser: how are you");
    }

    #[tokio::test(start_paused = true)]
    async fn test_maintenance_loop_stops_on_shutdown() {
        let storage = Arc::new(ready_storage().await);
        backdate_session(&storage.sessions, "old", 60).await;

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(maintenance_loop(
            storage.clone(),
            Duration::from_secs(3600),
            rx,
        ));

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(storage.get_storage_stats().await.unwrap().archived_sessions, 1);

        tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
