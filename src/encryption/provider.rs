// Credstore — Key material providers
//
// Turns one entry of the key configuration into 256 bits of key material.
//
// Providers:
//   - `StaticKeyProvider`     — hex material written directly in the config
//   - `PassphraseKeyProvider` — Argon2id over a passphrase with a deterministic salt
//   - `KeyringKeyProvider`    — material kept in the OS keyring, created on first use
//
// The salt for passphrase derivation is fixed per installation domain, so the
// same passphrase always yields the same key and can find its canary again.

use argon2::{Algorithm, Argon2, Params, Version};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

use super::key::KEY_LEN;
use super::EncryptionError;

// ─── Constants ───────────────────────────────────────────────────────────────

/// Domain string hashed into the Argon2id salt.
const SALT_DOMAIN: &str = "credstore-encryption-key";

/// Shortest passphrase accepted for key derivation.
pub const MIN_PASSPHRASE_LEN: usize = 8;

// Argon2id defaults: m=65536 (64 MiB), t=3, p=4
const ARGON2_M_COST: u32 = 65536;
const ARGON2_T_COST: u32 = 3;
const ARGON2_P_COST: u32 = 4;

// ─── Trait ───────────────────────────────────────────────────────────────────

/// Source of key material for one configured key.
pub trait KeyMaterialProvider {
    fn load_material(&self) -> Result<Zeroizing<[u8; KEY_LEN]>, EncryptionError>;
}

/// Argon2id cost parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KdfParams {
    pub memory_kib: u32,
    pub iterations: u32,
    pub parallelism: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            memory_kib: ARGON2_M_COST,
            iterations: ARGON2_T_COST,
            parallelism: ARGON2_P_COST,
        }
    }
}

// ─── Static ──────────────────────────────────────────────────────────────────

pub struct StaticKeyProvider {
    hex_material: Zeroizing<String>,
}

impl StaticKeyProvider {
    pub fn new(hex_material: &str) -> Self {
        Self {
            hex_material: Zeroizing::new(hex_material.trim().to_string()),
        }
    }
}

impl KeyMaterialProvider for StaticKeyProvider {
    fn load_material(&self) -> Result<Zeroizing<[u8; KEY_LEN]>, EncryptionError> {
        decode_hex_material(&self.hex_material)
    }
}

// ─── Passphrase ──────────────────────────────────────────────────────────────

pub struct PassphraseKeyProvider {
    passphrase: Zeroizing<String>,
    params: KdfParams,
}

impl PassphraseKeyProvider {
    pub fn new(passphrase: &str, params: KdfParams) -> Self {
        Self {
            passphrase: Zeroizing::new(passphrase.to_string()),
            params,
        }
    }

    /// Salt = SHA-256(SALT_DOMAIN)
    fn build_salt() -> Vec<u8> {
        let mut hasher = Sha256::new();
        hasher.update(SALT_DOMAIN.as_bytes());
        hasher.finalize().to_vec()
    }
}

impl KeyMaterialProvider for PassphraseKeyProvider {
    fn load_material(&self) -> Result<Zeroizing<[u8; KEY_LEN]>, EncryptionError> {
        if self.passphrase.len() < MIN_PASSPHRASE_LEN {
            return Err(EncryptionError::Derivation(format!(
                "passphrase must be at least {MIN_PASSPHRASE_LEN} bytes"
            )));
        }

        let params = Params::new(
            self.params.memory_kib,
            self.params.iterations,
            self.params.parallelism,
            Some(KEY_LEN),
        )
        .map_err(|e| EncryptionError::Derivation(format!("invalid Argon2 params: {}", e)))?;

        let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

        let mut material = Zeroizing::new([0u8; KEY_LEN]);
        argon2
            .hash_password_into(self.passphrase.as_bytes(), &Self::build_salt(), &mut *material)
            .map_err(|e| EncryptionError::Derivation(format!("Argon2id hash failed: {}", e)))?;

        Ok(material)
    }
}

// ─── Platform keyring ────────────────────────────────────────────────────────

/// Material stored hex-encoded in the platform keyring under `service`/`user`.
/// Dispatches to the D-Bus Secret Service, macOS Keychain or Windows
/// Credential Manager through the `keyring` crate.
pub struct KeyringKeyProvider {
    service: String,
    user: String,
}

impl KeyringKeyProvider {
    pub fn new(service: &str, user: &str) -> Self {
        Self {
            service: service.to_string(),
            user: user.to_string(),
        }
    }

    fn entry(&self) -> Result<keyring::Entry, EncryptionError> {
        keyring::Entry::new(&self.service, &self.user)
            .map_err(|e| EncryptionError::Keyring(format!("failed to create keyring entry: {}", e)))
    }
}

impl KeyMaterialProvider for KeyringKeyProvider {
    fn load_material(&self) -> Result<Zeroizing<[u8; KEY_LEN]>, EncryptionError> {
        let entry = self.entry()?;

        match entry.get_password() {
            Ok(hex_material) => {
                tracing::debug!(service = %self.service, user = %self.user, "Loaded key material from keyring");
                decode_hex_material(&Zeroizing::new(hex_material))
            }
            Err(keyring::Error::NoEntry) => {
                tracing::info!(service = %self.service, user = %self.user, "No key material in keyring; generating new key");
                let mut material = Zeroizing::new([0u8; KEY_LEN]);
                rand::rng().fill_bytes(&mut *material);

                let encoded = Zeroizing::new(hex::encode(&material[..]));
                entry.set_password(&encoded).map_err(|e| {
                    EncryptionError::Keyring(format!("failed to store key material: {}", e))
                })?;
                Ok(material)
            }
            Err(e) => Err(EncryptionError::Keyring(format!(
                "failed to retrieve key material: {}",
                e
            ))),
        }
    }
}

// ─── Helpers ─────────────────────────────────────────────────────────────────

fn decode_hex_material(hex_material: &str) -> Result<Zeroizing<[u8; KEY_LEN]>, EncryptionError> {
    let bytes = Zeroizing::new(
        hex::decode(hex_material)
            .map_err(|e| EncryptionError::InvalidKeyMaterial(format!("not valid hex: {}", e)))?,
    );

    if bytes.len() != KEY_LEN {
        return Err(EncryptionError::InvalidKeyMaterial(format!(
            "expected {} bytes of key material, got {}",
            KEY_LEN,
            bytes.len()
        )));
    }

    let mut material = Zeroizing::new([0u8; KEY_LEN]);
    material.copy_from_slice(&bytes);
    Ok(material)
}

// ─── Tests ───────────────────────────────────────────────────────────────────
