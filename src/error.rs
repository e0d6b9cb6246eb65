//! Error types for the OTA gateway

use thiserror::Error;

/// Result type alias for gateway operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the OTA gateway
#[derive(Debug, Error)]
pub enum Error {
    /// Missing or malformed identity/target on a request
    #[error("validation error: {0}")]
    Validation(String),

    /// Lookup by id or identity failed
    #[error("not found: {0}")]
    NotFound(String),

    /// Push to a specific session failed
    #[error("transport error: {0}")]
    Transport(String),

    /// Durable store unavailable
    #[error("storage error: {0}")]
    Storage(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Shorthand for a validation failure
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Shorthand for a missing resource
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }
}
