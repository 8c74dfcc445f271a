// Credstore — Top-level error types
//
// Aggregates errors from the encryption, store and config modules into a
// single error enum for the application boundary.

use thiserror::Error;

/// Top-level error type for all Credstore operations.
#[derive(Debug, Error)]
pub enum CredstoreError {
    #[error("Encryption error: {0}")]
    Encryption(#[from] crate::encryption::EncryptionError),

    #[error("Store error: {0}")]
    Store(#[from] crate::store::StoreError),

    #[error("Config error: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, CredstoreError>;
