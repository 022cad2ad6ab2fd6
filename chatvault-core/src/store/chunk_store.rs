/*
    chunk_store.rs - Capacity-bounded, per-chunk encrypted message storage

    Each session owns a list of chunks stored under `chunks:{sessionId}`,
    ordered by a dense `chunkIndex` starting at 0. Only the highest-index
    chunk accepts new messages, and only while it holds fewer than
    `maxMessagesPerChunk` messages.

    An append decrypts the whole last chunk, pushes the message,
    re-encrypts the full list and rewrites the chunk. That cost is bounded
    by the chunk capacity; it is not a delta log.

    Writes to the same session are serialized by a per-session mutex.
    Callers that must keep other records consistent with the chunks (the
    session counters, or the session record itself on prune) take that
    mutex through `lock_session` and use the `*_locked` operations.
    Mutex entries live as long as the store.
*/

use super::model::{ChatChunk, ChatMessage, StoredChatMessage};
use crate::crypto::CipherCodec;
use crate::error::StorageResult;
use crate::kv::{keys, KvStore};
use crate::metrics;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, warn};

/// Where an appended message landed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkPlacement {
    pub chunk_index: u32,
    /// Messages in that chunk after the append
    pub chunk_len: usize,
}

/// Result of a locked append
#[derive(Debug, Clone)]
pub struct ChunkAppend {
    pub placement: ChunkPlacement,
    /// Raw chunk list before the append, for [`ChunkStore::restore_locked`]
    pub previous: Option<String>,
}

/// Exclusive write access to one session's chunks
pub struct SessionChunkLock {
    session_id: String,
    _guard: OwnedMutexGuard<()>,
}

impl SessionChunkLock {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }
}

/// Append-only chunked message storage
pub struct ChunkStore {
    kv: Arc<dyn KvStore>,
    session_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl ChunkStore {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self {
            kv,
            session_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Wait for exclusive write access to a session's chunks
    pub async fn lock_session(&self, session_id: &str) -> SessionChunkLock {
        let lock = self
            .session_locks
            .lock()
            .await
            .entry(session_id.to_string())
            .or_default()
            .clone();

        SessionChunkLock {
            session_id: session_id.to_string(),
            _guard: lock.lock_owned().await,
        }
    }

    /// Append a message to its session's last chunk, opening a new chunk
    /// when the last one is full
    pub async fn append_message(
        &self,
        message: StoredChatMessage,
        codec: &CipherCodec,
        max_messages_per_chunk: u32,
    ) -> StorageResult<ChunkPlacement> {
        let lock = self.lock_session(&message.session_id).await;
        let append = self
            .append_locked(&lock, message, codec, max_messages_per_chunk)
            .await?;
        Ok(append.placement)
    }

    /// [`append_message`](Self::append_message) for a caller already
    /// holding the session's lock
    pub async fn append_locked(
        &self,
        lock: &SessionChunkLock,
        message: StoredChatMessage,
        codec: &CipherCodec,
        max_messages_per_chunk: u32,
    ) -> StorageResult<ChunkAppend> {
        let session_id = lock.session_id();
        debug_assert_eq!(message.session_id, session_id);

        let previous = self.kv.get(&keys::chunks(session_id)).await?;
        let mut chunks = parse_chunks(previous.as_deref())?;
        let capacity = max_messages_per_chunk as usize;

        let (mut chunk, mut messages) = match chunks.last() {
            None => (self.open_new_chunk(session_id, 0, codec), Vec::new()),
            Some(last) => match open_chunk(last, codec) {
                Ok(existing) if existing.len() < capacity => (last.clone(), existing),
                Ok(_) => (
                    self.open_new_chunk(session_id, last.chunk_index + 1, codec),
                    Vec::new(),
                ),
                Err(e) => {
                    // Never overwrite a chunk that cannot be read back
                    warn!(
                        session_id,
                        chunk_index = last.chunk_index,
                        error = %e,
                        "Last chunk unreadable, starting a new one"
                    );
                    (
                        self.open_new_chunk(session_id, last.chunk_index + 1, codec),
                        Vec::new(),
                    )
                }
            },
        };

        messages.push(message);
        chunk.encrypted_messages = codec.encrypt(&serde_json::to_string(&messages)?);
        chunk.timestamp = Utc::now();

        let placement = ChunkPlacement {
            chunk_index: chunk.chunk_index,
            chunk_len: messages.len(),
        };

        chunks.retain(|c| c.id != chunk.id);
        chunks.push(chunk);
        chunks.sort_by_key(|c| c.chunk_index);
        self.write_chunks(session_id, &chunks).await?;

        metrics::record_counter(metrics::MESSAGES_APPENDED, 1);
        Ok(ChunkAppend { placement, previous })
    }

    /// Put back the chunk list an append replaced
    pub async fn restore_locked(
        &self,
        lock: &SessionChunkLock,
        previous: Option<String>,
    ) -> StorageResult<()> {
        let key = keys::chunks(lock.session_id());
        match previous {
            Some(raw) => self.kv.set(&key, &raw).await,
            None => self.kv.remove(&key).await,
        }
    }

    fn open_new_chunk(&self, session_id: &str, chunk_index: u32, codec: &CipherCodec) -> ChatChunk {
        metrics::record_counter(metrics::CHUNKS_CREATED, 1);
        debug!(session_id, chunk_index, "Creating new chunk");
        ChatChunk::new(session_id, chunk_index, codec)
    }

    /// All messages of a session, oldest first, with plaintext text
    ///
    /// With `limit`, only the most recent `limit` messages are returned.
    /// Unreadable chunks or messages are logged and skipped.
    pub async fn messages(
        &self,
        session_id: &str,
        codec: &CipherCodec,
        limit: Option<usize>,
    ) -> Vec<ChatMessage> {
        let chunks = match self.session_chunks(session_id).await {
            Ok(chunks) => chunks,
            Err(e) => {
                warn!(session_id, error = %e, "Error getting session chunks");
                return Vec::new();
            }
        };

        let mut stored = Vec::new();
        for chunk in &chunks {
            match open_chunk(chunk, codec) {
                Ok(messages) => stored.extend(messages),
                Err(e) => warn!(
                    session_id,
                    chunk_index = chunk.chunk_index,
                    error = %e,
                    "Error getting messages from chunk"
                ),
            }
        }

        // Chunk order alone does not guarantee timestamp order
        stored.sort_by_key(|m| m.timestamp);

        let mut messages: Vec<ChatMessage> = stored
            .into_iter()
            .filter_map(|m| {
                let id = m.id.clone();
                match m.open(codec) {
                    Ok(message) => Some(message),
                    Err(e) => {
                        warn!(session_id, message_id = %id, error = %e, "Error decrypting message");
                        None
                    }
                }
            })
            .collect();

        if let Some(limit) = limit {
            let skip = messages.len().saturating_sub(limit);
            messages.drain(..skip);
        }
        messages
    }

    /// Chunk list of a session in ascending index order
    pub async fn session_chunks(&self, session_id: &str) -> StorageResult<Vec<ChatChunk>> {
        let raw = self.kv.get(&keys::chunks(session_id)).await?;
        parse_chunks(raw.as_deref())
    }

    /// Drop every chunk of a session
    pub async fn delete_session_chunks(&self, session_id: &str) -> StorageResult<()> {
        let lock = self.lock_session(session_id).await;
        self.delete_locked(&lock).await
    }

    pub async fn delete_locked(&self, lock: &SessionChunkLock) -> StorageResult<()> {
        self.kv.remove(&keys::chunks(lock.session_id())).await?;
        debug!(session_id = lock.session_id(), "Deleted session chunks");
        Ok(())
    }

    async fn write_chunks(&self, session_id: &str, chunks: &[ChatChunk]) -> StorageResult<()> {
        self.kv
            .set(&keys::chunks(session_id), &serde_json::to_string(chunks)?)
            .await
    }
}

fn parse_chunks(raw: Option<&str>) -> StorageResult<Vec<ChatChunk>> {
    let Some(raw) = raw else {
        return Ok(Vec::new());
    };

    let mut chunks: Vec<ChatChunk> = serde_json::from_str(raw)?;
    chunks.sort_by_key(|c| c.chunk_index);
    Ok(chunks)
}

/// Decrypt and parse the message array of one chunk
pub fn open_chunk(chunk: &ChatChunk, codec: &CipherCodec) -> StorageResult<Vec<StoredChatMessage>> {
    let json = codec.decrypt(&chunk.encrypted_messages)?;
    Ok(serde_json::from_str(&json)?)
}
