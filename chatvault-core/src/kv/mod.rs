//! Persistent key/value boundary
//!
//! Every record the engine writes goes through [`KvStore`], a flat
//! key -> JSON-string store. Each call is an await point; the engine holds
//! no transaction across calls.

use crate::error::StorageResult;
use async_trait::async_trait;

pub mod file_store;
pub mod memory_store;
pub mod timeout;

pub use file_store::FileKvStore;
pub use memory_store::MemoryKvStore;
pub use timeout::TimeoutKvStore;

/// Record keys used by the engine
pub mod keys {
    /// Serialized `StorageConfig`
    pub const CONFIG: &str = "config";

    /// JSON array of every `ChatSession`
    pub const SESSION_INDEX: &str = "sessionIndex";

    /// Raw id of the current session
    pub const CURRENT_SESSION_POINTER: &str = "currentSessionPointer";

    /// Scratch records written and removed by the health check
    pub const HEALTH_CHECK_PREFIX: &str = "healthCheck:";

    pub const SESSION_PREFIX: &str = "session:";
    pub const CHUNKS_PREFIX: &str = "chunks:";

    /// Per-session record key
    pub fn session(session_id: &str) -> String {
        format!("{}{}", SESSION_PREFIX, session_id)
    }

    /// Per-session chunk list key
    pub fn chunks(session_id: &str) -> String {
        format!("{}{}", CHUNKS_PREFIX, session_id)
    }

    /// Scratch record key for one health check
    pub fn health_check(check_id: &str) -> String {
        format!("{}{}", HEALTH_CHECK_PREFIX, check_id)
    }
}

/// Abstract flat key/value store
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Read a record, `None` if absent
    async fn get(&self, key: &str) -> StorageResult<Option<String>>;

    /// Create or overwrite a record
    async fn set(&self, key: &str, value: &str) -> StorageResult<()>;

    /// Delete a record; deleting an absent key is not an error
    async fn remove(&self, key: &str) -> StorageResult<()>;

    /// List every key currently stored
    async fn keys(&self) -> StorageResult<Vec<String>>;
}
