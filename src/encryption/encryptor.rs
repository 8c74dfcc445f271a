// Credstore — Encryptor
//
// Seals plaintext under the key ring's active key and opens envelopes under
// whichever loaded key they name. `EncryptedField` is the setter contract
// credential versions use: it remembers the plaintext it last sealed so a
// no-op write does not pay for another encryption.

use std::fmt;
use std::sync::Arc;

use uuid::Uuid;
use zeroize::Zeroizing;

use super::{EncryptionError, KeyRing};

/// The persisted form of one encrypted value.
#[derive(Clone, PartialEq, Eq)]
pub struct Envelope {
    pub key_uuid: Uuid,
    pub nonce: Vec<u8>,
    pub encrypted_value: Vec<u8>,
}

impl fmt::Debug for Envelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Envelope")
            .field("key_uuid", &self.key_uuid)
            .field("nonce_len", &self.nonce.len())
            .field("ciphertext_len", &self.encrypted_value.len())
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct Encryptor {
    key_ring: Arc<KeyRing>,
}

impl Encryptor {
    pub fn new(key_ring: Arc<KeyRing>) -> Self {
        Self { key_ring }
    }

    pub fn key_ring(&self) -> &KeyRing {
        &self.key_ring
    }

    /// Encrypt under the active key with a fresh nonce.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Envelope, EncryptionError> {
        let (key_uuid, key) = self.key_ring.active();
        let (nonce, encrypted_value) = key.encrypt(plaintext)?;
        Ok(Envelope {
            key_uuid,
            nonce,
            encrypted_value,
        })
    }

    /// Decrypt with the key the envelope names. An envelope whose key is not
    /// loaded is a decryption failure, never an empty result.
    pub fn decrypt(&self, envelope: &Envelope) -> Result<Zeroizing<Vec<u8>>, EncryptionError> {
        let key = self
            .key_ring
            .key_for_uuid(&envelope.key_uuid)
            .ok_or(EncryptionError::UnknownKey(envelope.key_uuid))?;
        key.decrypt(&envelope.nonce, &envelope.encrypted_value)
    }

    pub fn decrypt_string(&self, envelope: &Envelope) -> Result<Zeroizing<String>, EncryptionError> {
        let bytes = self.decrypt(envelope)?;
        String::from_utf8(bytes.to_vec())
            .map(Zeroizing::new)
            .map_err(|_| EncryptionError::Decryption("plaintext is not valid UTF-8".to_string()))
    }
}

/// An encrypted value plus the plaintext it was last set to in this process.
#[derive(Clone)]
pub struct EncryptedField {
    envelope: Envelope,
    last_plaintext: Option<Zeroizing<Vec<u8>>>,
}

impl EncryptedField {
    pub fn encrypt(encryptor: &Encryptor, plaintext: &[u8]) -> Result<Self, EncryptionError> {
        Ok(Self {
            envelope: encryptor.encrypt(plaintext)?,
            last_plaintext: Some(Zeroizing::new(plaintext.to_vec())),
        })
    }

    /// Wrap an envelope read back from storage.
    pub fn from_envelope(envelope: Envelope) -> Self {
        Self {
            envelope,
            last_plaintext: None,
        }
    }

    pub fn envelope(&self) -> &Envelope {
        &self.envelope
    }

    /// Set a new plaintext. Returns false, without encrypting, when it equals
    /// the plaintext this field was last set to.
    pub fn set(&mut self, encryptor: &Encryptor, plaintext: &[u8]) -> Result<bool, EncryptionError> {
        if let Some(previous) = &self.last_plaintext {
            if previous.as_slice() == plaintext {
                return Ok(false);
            }
        }

        self.envelope = encryptor.encrypt(plaintext)?;
        self.last_plaintext = Some(Zeroizing::new(plaintext.to_vec()));
        Ok(true)
    }

    pub fn decrypt(&self, encryptor: &Encryptor) -> Result<Zeroizing<Vec<u8>>, EncryptionError> {
        encryptor.decrypt(&self.envelope)
    }

    /// Re-seal the same plaintext under the active key. Returns false if the
    /// field is already under the active key.
    pub fn reencrypt(&mut self, encryptor: &Encryptor) -> Result<bool, EncryptionError> {
        if self.envelope.key_uuid == encryptor.key_ring().active_uuid() {
            return Ok(false);
        }

        let plaintext = encryptor.decrypt(&self.envelope)?;
        self.envelope = encryptor.encrypt(&plaintext)?;
        self.last_plaintext = Some(plaintext);
        Ok(true)
    }
}

impl fmt::Debug for EncryptedField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncryptedField")
            .field("envelope", &self.envelope)
            .finish_non_exhaustive()
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encryption::EncryptionKey;
    use crate::store::{Database, SqliteCanaryStore};

    fn setup_encryptor() -> (Database, Encryptor) {
        let db = Database::open_in_memory().unwrap();
        let key_ring = KeyRing::load(
            vec![EncryptionKey::generate(true, "keys[0]")],
            &SqliteCanaryStore::new(&db),
        )
        .unwrap();
        (db, Encryptor::new(Arc::new(key_ring)))
    }

    #[test]
    fn test_roundtrip() {
        let (_db, encryptor) = setup_encryptor();
        let envelope = encryptor.encrypt(b"my-password").unwrap();

        assert_eq!(envelope.key_uuid, encryptor.key_ring().active_uuid());
        assert_eq!(encryptor.decrypt(&envelope).unwrap().as_slice(), b"my-password");
    }

    #[test]
    fn test_roundtrip_large_payload() {
        let (_db, encryptor) = setup_encryptor();
        let certificate = "A".repeat(7000);

        let envelope = encryptor.encrypt(certificate.as_bytes()).unwrap();
        let decrypted = encryptor.decrypt_string(&envelope).unwrap();
        assert_eq!(decrypted.as_str(), certificate);
    }

    #[test]
    fn test_encrypting_twice_gives_different_envelopes() {
        let (_db, encryptor) = setup_encryptor();
        let first = encryptor.encrypt(b"same plaintext").unwrap();
        let second = encryptor.encrypt(b"same plaintext").unwrap();

        assert_ne!(first.nonce, second.nonce);
        assert_ne!(first.encrypted_value, second.encrypted_value);
        assert_eq!(
            encryptor.decrypt(&first).unwrap().as_slice(),
            encryptor.decrypt(&second).unwrap().as_slice()
        );
    }

    #[test]
    fn test_unknown_key_is_a_decryption_error() {
        let (_db, encryptor) = setup_encryptor();
        let mut envelope = encryptor.encrypt(b"secret").unwrap();
        let missing = Uuid::new_v4();
        envelope.key_uuid = missing;

        let err = encryptor.decrypt(&envelope).unwrap_err();
        assert!(matches!(err, EncryptionError::UnknownKey(id) if id == missing));
        assert!(err.is_decryption_failure());
    }

    #[test]
    fn test_set_same_plaintext_skips_encryption() {
        let (_db, encryptor) = setup_encryptor();
        let mut field = EncryptedField::encrypt(&encryptor, b"value-1").unwrap();
        let original = field.envelope().clone();

        let changed = field.set(&encryptor, b"value-1").unwrap();
        assert!(!changed, "Setting the current plaintext must not re-encrypt");
        assert_eq!(field.envelope(), &original);

        let changed = field.set(&encryptor, b"value-2").unwrap();
        assert!(changed);
        assert_ne!(field.envelope(), &original);
        assert_eq!(field.decrypt(&encryptor).unwrap().as_slice(), b"value-2");
    }

    #[test]
    fn test_field_loaded_from_storage_encrypts_on_set() {
        let (_db, encryptor) = setup_encryptor();
        let envelope = encryptor.encrypt(b"value").unwrap();
        let mut field = EncryptedField::from_envelope(envelope.clone());

        assert!(field.set(&encryptor, b"value").unwrap());
        assert_ne!(field.envelope(), &envelope);
    }

    #[test]
    fn test_reencrypt_under_active_key_is_noop() {
        let (_db, encryptor) = setup_encryptor();
        let mut field = EncryptedField::encrypt(&encryptor, b"value").unwrap();
        let original = field.envelope().clone();

        assert!(!field.reencrypt(&encryptor).unwrap());
        assert_eq!(field.envelope(), &original);
    }

    #[test]
    fn test_envelope_debug_hides_bytes() {
        let (_db, encryptor) = setup_encryptor();
        let envelope = encryptor.encrypt(b"secret").unwrap();
        let debug_output = format!("{:?}", envelope);
        assert!(debug_output.contains("ciphertext_len"));
        assert!(!debug_output.contains("encrypted_value"));
    }
}
