//! Storage error types.

/// Errors that can occur during storage operations.
///
/// Variants name the key or prefix involved; values never appear in errors.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Failed to open or connect to the backend.
    #[error("failed to open storage '{target}': {reason}")]
    Open { target: String, reason: String },

    /// Failed to read a value.
    #[error("failed to read key '{key}': {reason}")]
    Read { key: String, reason: String },

    /// Failed to write a value.
    #[error("failed to write key '{key}': {reason}")]
    Write { key: String, reason: String },

    /// Failed to delete a key.
    #[error("failed to delete key '{key}': {reason}")]
    Delete { key: String, reason: String },

    /// Failed to list keys under a prefix.
    #[error("failed to list keys with prefix '{prefix}': {reason}")]
    List { prefix: String, reason: String },

    /// A stored key was not valid UTF-8.
    #[error("invalid key encoding: {reason}")]
    InvalidKey { reason: String },
}
