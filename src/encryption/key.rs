// Credstore — Encryption keys
//
// A configured key is 256 bits of AES-GCM key material plus the provider it
// came from and whether it is the active key. Keys never leave process
// memory: only their canaries are persisted.

use std::fmt;

use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::Aes256Gcm;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use super::EncryptionError;

/// Length of the AES-256 key material in bytes.
pub const KEY_LEN: usize = 32;

/// Length of the AES-GCM nonce in bytes (96 bits).
pub const NONCE_LEN: usize = 12;

/// Where a key's material comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// Raw hex-encoded material supplied in configuration.
    Internal,
    /// Material derived from a passphrase with Argon2id.
    Passphrase,
    /// Material held in the platform keyring.
    Keyring,
    /// Hardware security module. Recognised in configuration only.
    Hsm,
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Internal => "internal",
            Self::Passphrase => "passphrase",
            Self::Keyring => "keyring",
            Self::Hsm => "hsm",
        };
        f.write_str(name)
    }
}

/// A configured encryption key. The material is zeroized on drop.
pub struct EncryptionKey {
    material: Zeroizing<[u8; KEY_LEN]>,
    provider: ProviderKind,
    active: bool,
    label: String,
}

impl EncryptionKey {
    pub fn new(
        material: Zeroizing<[u8; KEY_LEN]>,
        provider: ProviderKind,
        active: bool,
        label: impl Into<String>,
    ) -> Self {
        Self {
            material,
            provider,
            active,
            label: label.into(),
        }
    }

    /// Generate a random key. Used by tests and by `credstore keys --generate`.
    pub fn generate(active: bool, label: impl Into<String>) -> Self {
        let mut material = Zeroizing::new([0u8; KEY_LEN]);
        rand::rng().fill_bytes(&mut *material);
        Self::new(material, ProviderKind::Internal, active, label)
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn provider(&self) -> ProviderKind {
        self.provider
    }

    /// Human-readable identifier for logs, e.g. `keys[1]`.
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Hex encoding of the material, for printing a freshly generated key.
    pub fn to_hex(&self) -> Zeroizing<String> {
        Zeroizing::new(hex::encode(&self.material[..]))
    }

    /// Encrypt with a fresh random nonce. Returns `(nonce, ciphertext_with_tag)`.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<(Vec<u8>, Vec<u8>), EncryptionError> {
        let cipher = Aes256Gcm::new(GenericArray::from_slice(&self.material[..]));

        let mut nonce = [0u8; NONCE_LEN];
        rand::rng().fill_bytes(&mut nonce);

        let ciphertext = cipher
            .encrypt(GenericArray::from_slice(&nonce), plaintext)
            .map_err(|e| EncryptionError::Encryption(format!("AES-256-GCM encryption failed: {e}")))?;

        Ok((nonce.to_vec(), ciphertext))
    }

    /// Decrypt and authenticate. Fails on a wrong key or tampered data.
    pub fn decrypt(
        &self,
        nonce: &[u8],
        ciphertext: &[u8],
    ) -> Result<Zeroizing<Vec<u8>>, EncryptionError> {
        if nonce.len() != NONCE_LEN {
            return Err(EncryptionError::Decryption(format!(
                "nonce must be {NONCE_LEN} bytes, got {}",
                nonce.len()
            )));
        }

        let cipher = Aes256Gcm::new(GenericArray::from_slice(&self.material[..]));
        cipher
            .decrypt(GenericArray::from_slice(nonce), ciphertext)
            .map(Zeroizing::new)
            .map_err(|e| EncryptionError::Decryption(format!("AES-256-GCM decryption failed: {e}")))
    }
}

#[cfg(test)]
impl EncryptionKey {
    /// The same material configured with a different active flag, as after
    /// an operator edits the key list.
    pub(crate) fn reconfigured(&self, active: bool, label: &str) -> Self {
        Self::new(self.material.clone(), self.provider, active, label)
    }
}

/// Never reveals key material.
impl fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncryptionKey")
            .field("label", &self.label)
            .field("provider", &self.provider)
            .field("active", &self.active)
            .field("material", &"[REDACTED]")
            .finish()
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
