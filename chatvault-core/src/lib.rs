//! Encrypted, on-device chat history storage
//!
//! [`ChatStorage`] is the entry point: it persists chat messages into
//! sessions, splits each session into capacity-bounded encrypted chunks,
//! and archives and prunes old sessions. Everything is stored as JSON
//! strings in a flat [`kv::KvStore`].

pub mod coach;
pub mod config;
pub mod crypto;
pub mod error;
pub mod facade;
pub mod health;
pub mod kv;
pub mod logging;
pub mod metrics;
pub mod store;

#[cfg(test)]
pub(crate) mod test_utils;

pub use coach::{CoachError, CoachSession, ResponseGenerator};
pub use config::{StorageConfig, StorageConfigUpdate, VaultSettings};
pub use error::{StorageError, StorageResult};
pub use facade::{maintenance_loop, ChatExport, ChatStorage, StorageStats};
pub use health::{HealthReport, HealthStatus};
pub use logging::{init_logging, LogLevel};
pub use store::{ChatMessage, ChatSession, MaintenanceReport};
