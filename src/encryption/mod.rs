// Credstore — Encryption Module
//
// Key material providers, the canary-backed key ring, and the AES-256-GCM
// encryptor every persisted secret goes through.

mod encryptor;
mod error;
mod key;
mod key_ring;
mod provider;

pub use encryptor::{EncryptedField, Encryptor, Envelope};
pub use error::EncryptionError;
pub use key::{EncryptionKey, ProviderKind, KEY_LEN, NONCE_LEN};
pub use key_ring::{KeyRing, CANARY_VALUE};
pub use provider::{
    KdfParams, KeyMaterialProvider, KeyringKeyProvider, PassphraseKeyProvider, StaticKeyProvider,
    MIN_PASSPHRASE_LEN,
};
