// Credstore — Store error types

use thiserror::Error;

use crate::encryption::EncryptionError;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Encryption(#[from] EncryptionError),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("{0}")]
    Other(String),
}

impl StoreError {
    pub fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }

    pub fn is_decryption_failure(&self) -> bool {
        matches!(self, Self::Encryption(e) if e.is_decryption_failure())
    }
}
