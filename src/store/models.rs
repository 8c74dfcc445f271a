// Credstore — Credential data models
//
// SECURITY: secret fields only ever exist inside `EncryptedField`s on a
// `CredentialVersion`. Plaintext is produced on demand by `value()` and is
// never included in Debug output or log messages.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use super::StoreError;
use crate::encryption::{EncryptedField, EncryptionError, Encryptor, Envelope};

// ─── Canary ──────────────────────────────────────────────────────────────────

/// A row whose plaintext is `CANARY_VALUE`. Identifies a key without storing it.
#[derive(Clone)]
pub struct EncryptionKeyCanary {
    pub uuid: Uuid,
    pub encrypted_value: Vec<u8>,
    pub nonce: Vec<u8>,
}

impl fmt::Debug for EncryptionKeyCanary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncryptionKeyCanary")
            .field("uuid", &self.uuid)
            .finish_non_exhaustive()
    }
}

// ─── Names ───────────────────────────────────────────────────────────────────

/// A named credential. Owns its versions; deleting it deletes them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub uuid: Uuid,
    /// Always starts with `/`. Casing is whatever was written first.
    pub name: String,
}

// ─── Kinds ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CredentialKind {
    Password,
    Value,
    Json,
    Ssh,
    Rsa,
    Certificate,
    User,
}

impl CredentialKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Password => "password",
            Self::Value => "value",
            Self::Json => "json",
            Self::Ssh => "ssh",
            Self::Rsa => "rsa",
            Self::Certificate => "certificate",
            Self::User => "user",
        }
    }
}

impl fmt::Display for CredentialKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CredentialKind {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "password" => Ok(Self::Password),
            "value" => Ok(Self::Value),
            "json" => Ok(Self::Json),
            "ssh" => Ok(Self::Ssh),
            "rsa" => Ok(Self::Rsa),
            "certificate" => Ok(Self::Certificate),
            "user" => Ok(Self::User),
            other => Err(StoreError::Validation(format!(
                "unknown credential type '{}'",
                other
            ))),
        }
    }
}

// ─── Plaintext values ────────────────────────────────────────────────────────

/// The decrypted content of a version, one variant per kind.
#[derive(Clone, PartialEq)]
pub enum CredentialValue {
    Password {
        password: String,
        /// Generation parameters, encrypted alongside the password.
        parameters: Option<JsonValue>,
    },
    Value(String),
    Json(JsonValue),
    Ssh {
        public_key: String,
        private_key: String,
    },
    Rsa {
        public_key: String,
        private_key: String,
    },
    Certificate {
        ca_name: Option<String>,
        ca: Option<String>,
        certificate: String,
        private_key: String,
        transitional: bool,
    },
    User {
        username: Option<String>,
        password: String,
        salt: String,
        parameters: Option<JsonValue>,
    },
}

impl CredentialValue {
    pub fn kind(&self) -> CredentialKind {
        match self {
            Self::Password { .. } => CredentialKind::Password,
            Self::Value(_) => CredentialKind::Value,
            Self::Json(_) => CredentialKind::Json,
            Self::Ssh { .. } => CredentialKind::Ssh,
            Self::Rsa { .. } => CredentialKind::Rsa,
            Self::Certificate { .. } => CredentialKind::Certificate,
            Self::User { .. } => CredentialKind::User,
        }
    }

    /// Split into the plaintext attributes stored in the clear, the secret,
    /// and the optional generation parameters.
    fn into_parts(self) -> Result<(VersionAttributes, String, Option<String>), StoreError> {
        let mut attributes = VersionAttributes::default();
        let parts = match self {
            Self::Password {
                password,
                parameters,
            } => (password, parameters.map(|p| p.to_string())),
            Self::Value(value) => (value, None),
            Self::Json(value) => (serde_json::to_string(&value)?, None),
            Self::Ssh {
                public_key,
                private_key,
            }
            | Self::Rsa {
                public_key,
                private_key,
            } => {
                attributes.public_key = Some(public_key);
                (private_key, None)
            }
            Self::Certificate {
                ca_name,
                ca,
                certificate,
                private_key,
                transitional,
            } => {
                attributes.ca_name = ca_name.map(|name| canonicalize(&name));
                attributes.ca = ca;
                attributes.certificate = Some(certificate);
                attributes.transitional = transitional;
                (private_key, None)
            }
            Self::User {
                username,
                password,
                salt,
                parameters,
            } => {
                attributes.username = username;
                attributes.salt = Some(salt);
                (password, parameters.map(|p| p.to_string()))
            }
        };
        Ok((attributes, parts.0, parts.1))
    }

    fn from_parts(
        kind: CredentialKind,
        attributes: &VersionAttributes,
        secret: String,
        parameters: Option<String>,
    ) -> Result<Self, StoreError> {
        let parameters = parameters
            .map(|p| serde_json::from_str::<JsonValue>(&p))
            .transpose()?;

        let value = match kind {
            CredentialKind::Password => Self::Password {
                password: secret,
                parameters,
            },
            CredentialKind::Value => Self::Value(secret),
            CredentialKind::Json => Self::Json(serde_json::from_str(&secret)?),
            CredentialKind::Ssh => Self::Ssh {
                public_key: attributes.public_key.clone().unwrap_or_default(),
                private_key: secret,
            },
            CredentialKind::Rsa => Self::Rsa {
                public_key: attributes.public_key.clone().unwrap_or_default(),
                private_key: secret,
            },
            CredentialKind::Certificate => Self::Certificate {
                ca_name: attributes.ca_name.clone(),
                ca: attributes.ca.clone(),
                certificate: attributes.certificate.clone().unwrap_or_default(),
                private_key: secret,
                transitional: attributes.transitional,
            },
            CredentialKind::User => Self::User {
                username: attributes.username.clone(),
                password: secret,
                salt: attributes.salt.clone().unwrap_or_default(),
                parameters,
            },
        };
        Ok(value)
    }
}

/// Custom Debug that NEVER reveals the secret.
impl fmt::Debug for CredentialValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialValue")
            .field("kind", &self.kind())
            .field("secret", &"[REDACTED]")
            .finish()
    }
}

/// Kind-specific fields that are not secret, stored as JSON next to the envelope.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionAttributes {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub salt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certificate: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub transitional: bool,
}

// ─── Versions ────────────────────────────────────────────────────────────────

/// Input for a write: the name to write under and the plaintext value.
pub struct VersionDraft {
    pub name: String,
    pub value: CredentialValue,
}

impl VersionDraft {
    pub fn new(name: impl Into<String>, value: CredentialValue) -> Self {
        Self {
            name: name.into(),
            value,
        }
    }
}

/// One immutable version of a named credential. Only the envelopes change
/// after creation, when rotation moves them to the active key.
#[derive(Debug, Clone)]
pub struct CredentialVersion {
    pub uuid: Uuid,
    pub credential_uuid: Uuid,
    pub name: String,
    pub kind: CredentialKind,
    pub created_at: DateTime<Utc>,
    pub attributes: VersionAttributes,
    value: EncryptedField,
    parameters: Option<EncryptedField>,
    /// Storage row id; orders versions created in the same instant and
    /// serves as the slice cursor. Zero until persisted.
    pub(crate) row_id: i64,
}

impl CredentialVersion {
    /// Build a new, unsaved version, sealing its secrets with the active key.
    pub fn new(
        encryptor: &Encryptor,
        credential: &Credential,
        value: CredentialValue,
    ) -> Result<Self, StoreError> {
        let kind = value.kind();
        let (attributes, secret, parameters) = value.into_parts()?;

        let value = EncryptedField::encrypt(encryptor, secret.as_bytes())?;
        let parameters = parameters
            .map(|p| EncryptedField::encrypt(encryptor, p.as_bytes()))
            .transpose()?;

        Ok(Self {
            uuid: Uuid::new_v4(),
            credential_uuid: credential.uuid,
            name: credential.name.clone(),
            kind,
            created_at: Utc::now(),
            attributes,
            value,
            parameters,
            row_id: 0,
        })
    }

    /// Rebuild a version from a stored row.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn from_row(
        row_id: i64,
        uuid: Uuid,
        credential_uuid: Uuid,
        name: String,
        kind: CredentialKind,
        created_at: DateTime<Utc>,
        attributes: VersionAttributes,
        value: Envelope,
        parameters: Option<Envelope>,
    ) -> Self {
        Self {
            uuid,
            credential_uuid,
            name,
            kind,
            created_at,
            attributes,
            value: EncryptedField::from_envelope(value),
            parameters: parameters.map(EncryptedField::from_envelope),
            row_id,
        }
    }

    /// Replace the content of an unsaved version. The kind may not change.
    /// Secrets equal to the ones already held are not re-encrypted.
    pub fn set_value(
        &mut self,
        encryptor: &Encryptor,
        value: CredentialValue,
    ) -> Result<(), StoreError> {
        if value.kind() != self.kind {
            return Err(StoreError::Validation(format!(
                "cannot change type of a {} version to {}",
                self.kind,
                value.kind()
            )));
        }

        let (attributes, secret, parameters) = value.into_parts()?;
        self.attributes = attributes;
        self.value.set(encryptor, secret.as_bytes())?;
        self.parameters = match (self.parameters.take(), parameters) {
            (Some(mut field), Some(p)) => {
                field.set(encryptor, p.as_bytes())?;
                Some(field)
            }
            (None, Some(p)) => Some(EncryptedField::encrypt(encryptor, p.as_bytes())?),
            (_, None) => None,
        };
        Ok(())
    }

    /// Decrypt and reassemble the plaintext value.
    pub fn value(&self, encryptor: &Encryptor) -> Result<CredentialValue, StoreError> {
        let secret = encryptor.decrypt_string(self.value.envelope())?;
        let parameters = self
            .parameters
            .as_ref()
            .map(|field| encryptor.decrypt_string(field.envelope()))
            .transpose()?
            .map(|p| p.to_string());

        CredentialValue::from_parts(self.kind, &self.attributes, secret.to_string(), parameters)
    }

    pub fn envelope(&self) -> &Envelope {
        self.value.envelope()
    }

    pub fn parameters_envelope(&self) -> Option<&Envelope> {
        self.parameters.as_ref().map(EncryptedField::envelope)
    }

    /// Every key uuid this version's envelopes reference.
    pub fn key_uuids(&self) -> Vec<Uuid> {
        let mut uuids = vec![self.value.envelope().key_uuid];
        if let Some(params) = self.parameters_envelope() {
            if params.key_uuid != uuids[0] {
                uuids.push(params.key_uuid);
            }
        }
        uuids
    }

    /// Re-seal every envelope under the active key, primary and parameters
    /// together. Returns false if nothing needed to move.
    pub fn rotate(&mut self, encryptor: &Encryptor) -> Result<bool, EncryptionError> {
        let mut value = self.value.clone();
        let mut parameters = self.parameters.clone();

        let mut changed = value.reencrypt(encryptor)?;
        if let Some(field) = parameters.as_mut() {
            changed |= field.reencrypt(encryptor)?;
        }

        // Only commit once both fields re-encrypted.
        self.value = value;
        self.parameters = parameters;
        Ok(changed)
    }
}

/// Prepend `/` to a credential name when missing.
pub fn canonicalize(name: &str) -> String {
    if name.starts_with('/') {
        name.to_string()
    } else {
        format!("/{}", name)
    }
}

// ─── Query results ───────────────────────────────────────────────────────────

/// One bounded page of a larger result.
#[derive(Debug, Clone)]
pub struct Slice<T> {
    pub items: Vec<T>,
    /// Whether another page may follow.
    pub has_more: bool,
    /// Pass to the `_after` query to fetch the next page.
    pub next_cursor: Option<i64>,
}

impl<T> Slice<T> {
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }
}

/// How many versions sit under each class of key.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyUsage {
    pub active: u64,
    pub inactive: u64,
    pub unknown: u64,
}

// ─── Tests ───────────────────────────────────────────────────────────────────
