/*
    error.rs - Error types for the chat storage engine

    Covers every failure the engine can surface:
    - Rejected configuration updates
    - Malformed cipher tokens
    - Key material that cannot be established
    - Persistent store I/O and timeouts
*/

use std::time::Duration;
use thiserror::Error;

/// Errors that can occur in the storage engine
#[derive(Debug, Error)]
pub enum StorageError {
    /// A configuration update was rejected; the prior config is retained
    #[error("Configuration validation failed: {0}")]
    ConfigValidation(String),

    /// Cipher token could not be parsed
    #[error("Decryption error: {0}")]
    Decrypt(String),

    /// Every key backing store failed
    #[error("Key unavailable: {0}")]
    KeyUnavailable(String),

    /// Underlying persistent store read/write failure
    #[error("Storage I/O error: {0}")]
    Io(String),

    /// Persistent store call exceeded its deadline
    #[error("Storage operation timed out after {0:?}")]
    Timeout(Duration),

    /// Record could not be (de)serialized
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// An operation ran before `initialize()`
    #[error("Storage has not been initialized")]
    NotInitialized,

    /// No session record for the given id
    #[error("Session not found: {0}")]
    SessionNotFound(String),
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

impl From<std::io::Error> for StorageError {
    fn from(err: std::io::Error) -> Self {
        StorageError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}
