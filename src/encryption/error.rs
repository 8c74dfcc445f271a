// Credstore — Encryption error types

use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum EncryptionError {
    #[error("Decryption failed: {0}")]
    Decryption(String),

    #[error("Decryption failed: no loaded key for uuid {0}")]
    UnknownKey(Uuid),

    #[error("Encryption failed: {0}")]
    Encryption(String),

    #[error("Invalid key material: {0}")]
    InvalidKeyMaterial(String),

    #[error("Key derivation error: {0}")]
    Derivation(String),

    #[error("Keyring error: {0}")]
    Keyring(String),

    #[error("Canary {0} is decrypted by more than one configured key (duplicate key material)")]
    DuplicateKey(Uuid),

    #[error("Invalid key configuration: {0}")]
    Configuration(String),

    #[error("Encryption provider '{0}' is not available in this build")]
    UnsupportedProvider(String),
}

impl EncryptionError {
    /// True when the error means the ciphertext could not be turned back into plaintext.
    pub fn is_decryption_failure(&self) -> bool {
        matches!(self, Self::Decryption(_) | Self::UnknownKey(_))
    }
}
