//! Logging subsystem errors

use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum LoggingError {
    /// A global subscriber was already installed, or install failed
    #[error("Failed to initialize logging: {0}")]
    InitializationFailed(String),
}
