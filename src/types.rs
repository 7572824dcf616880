//! Shared error and result types for Warden

use thiserror::Error;

/// Errors that can occur in Warden
#[derive(Error, Debug)]
pub enum WardenError {
    /// Filesystem errors (snapshots, backups, key file)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// Key loading or cipher setup failed
    #[error("Crypto error: {0}")]
    Crypto(String),

    /// Authentication tag verification failed (tampered data or wrong key)
    #[error("Decryption failed: {0}")]
    Decrypt(String),

    /// Input was not an encryption envelope at all
    #[error("Value is not encrypted: {0}")]
    NotEncrypted(String),

    /// Refused to encrypt a record that is already encrypted
    #[error("Value is already encrypted: {0}")]
    AlreadyEncrypted(String),

    /// Invalid configuration or settings input
    #[error("Configuration error: {0}")]
    Config(String),

    /// Session-level failures (unknown session, bad lifecycle transition)
    #[error("Session error: {0}")]
    Session(String),

    /// Errors surfaced by the external session client
    #[error("Client error: {0}")]
    Client(String),

    /// Internal invariant violations
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for Warden operations
pub type Result<T> = std::result::Result<T, WardenError>;
