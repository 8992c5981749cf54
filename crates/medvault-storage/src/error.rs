//! Error types

/// Message for a field or backup that fails tag verification.
pub const WRONG_KEY_MESSAGE: &str = "Decryption failed - wrong key or corrupted data";

/// Message for a portable export that fails tag verification.
///
/// Shown verbatim by the import UI.
pub const WRONG_PASSWORD_MESSAGE: &str = "Invalid password or corrupted data";

/// Storage errors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Database error
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Required secret missing or below its minimum strength
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// AEAD tag verification failed (wrong key/password, truncated or tampered data)
    #[error("{0}")]
    Authentication(&'static str),

    /// Encryption error
    #[error("Encryption error: {0}")]
    Encryption(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Validation error
    #[error("Validation error: {0}")]
    Validation(String),

    /// Blocking task failed to complete
    #[error("Background task failed: {0}")]
    Task(String),
}

impl Error {
    /// True when the error comes from a failed authentication tag.
    pub fn is_authentication_failure(&self) -> bool {
        matches!(self, Error::Authentication(_))
    }

    /// True when a secret is missing or too weak.
    pub fn is_configuration_error(&self) -> bool {
        matches!(self, Error::Configuration(_))
    }
}

/// Result type
pub type Result<T> = std::result::Result<T, Error>;
