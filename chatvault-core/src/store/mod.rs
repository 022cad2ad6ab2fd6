//! Session and chunk persistence
//!
//! - [`model`]: records as they are serialized
//! - [`session_store`]: sessions, the session index and the current pointer
//! - [`chunk_store`]: encrypted, capacity-bounded message chunks
//! - [`maintenance`]: archival and retention passes

pub mod chunk_store;
pub mod maintenance;
pub mod model;
pub mod session_store;

pub use chunk_store::{ChunkAppend, ChunkPlacement, ChunkStore, SessionChunkLock};
pub use maintenance::{MaintenanceReport, MaintenanceScheduler};
pub use model::{ChatChunk, ChatMessage, ChatSession, MessageMetadata, StoredChatMessage};
pub use session_store::SessionStore;
