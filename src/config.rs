// Credstore — Configuration
//
// A JSON document naming the database and the ordered list of encryption
// keys. Validation runs at load time so a bad key list fails the process
// before it touches the database.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

use crate::encryption::{
    EncryptionError, EncryptionKey, KdfParams, KeyMaterialProvider, KeyringKeyProvider,
    PassphraseKeyProvider, ProviderKind, StaticKeyProvider, MIN_PASSPHRASE_LEN,
};
use crate::store::{DEFAULT_PAGE_SIZE, MAX_PAGE_SIZE};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed config: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),

    #[error(transparent)]
    Encryption(#[from] EncryptionError),
}

// ─── Schema ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Defaults to `<data dir>/credstore/credstore.db`.
    #[serde(default)]
    pub database_path: Option<PathBuf>,

    #[serde(default = "default_page_size")]
    pub rotation_page_size: usize,

    pub encryption: EncryptionConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EncryptionConfig {
    pub keys: Vec<KeyConfig>,

    #[serde(default)]
    pub kdf: KdfParams,
}

#[derive(Debug, Clone, Deserialize)]
pub struct KeyConfig {
    #[serde(flatten)]
    pub source: KeySource,

    #[serde(default)]
    pub active: bool,
}

/// Where one key's material comes from, tagged by `provider`.
#[derive(Clone, Deserialize)]
#[serde(tag = "provider", rename_all = "lowercase")]
pub enum KeySource {
    Internal { encryption_key: String },
    Passphrase { encryption_password: String },
    Keyring { service: String, user: String },
    Hsm { encryption_key_name: String },
}

impl KeySource {
    pub fn kind(&self) -> ProviderKind {
        match self {
            Self::Internal { .. } => ProviderKind::Internal,
            Self::Passphrase { .. } => ProviderKind::Passphrase,
            Self::Keyring { .. } => ProviderKind::Keyring,
            Self::Hsm { .. } => ProviderKind::Hsm,
        }
    }
}

impl fmt::Debug for KeySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Keyring { service, user } => f
                .debug_struct("Keyring")
                .field("service", service)
                .field("user", user)
                .finish(),
            Self::Hsm { encryption_key_name } => f
                .debug_struct("Hsm")
                .field("encryption_key_name", encryption_key_name)
                .finish(),
            other => write!(f, "{}([REDACTED])", other.kind()),
        }
    }
}

fn default_page_size() -> usize {
    DEFAULT_PAGE_SIZE
}

// ─── Loading ─────────────────────────────────────────────────────────────────

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        let config = Self::from_json(&raw)?;
        tracing::debug!(path = %path.display(), keys = config.encryption.keys.len(), "Config loaded");
        Ok(config)
    }

    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.rotation_page_size == 0 || self.rotation_page_size > MAX_PAGE_SIZE {
            return Err(ConfigError::Invalid(format!(
                "rotation_page_size must be between 1 and {MAX_PAGE_SIZE}"
            )));
        }

        let keys = &self.encryption.keys;
        if keys.is_empty() {
            return Err(ConfigError::Invalid(
                "encryption.keys must list at least one key".to_string(),
            ));
        }

        let active = keys.iter().filter(|key| key.active).count();
        if active != 1 {
            return Err(ConfigError::Invalid(format!(
                "exactly one encryption key must be active, found {}",
                active
            )));
        }

        for (index, key) in keys.iter().enumerate() {
            match &key.source {
                KeySource::Internal { encryption_key } => {
                    StaticKeyProvider::new(encryption_key)
                        .load_material()
                        .map_err(|e| ConfigError::Invalid(format!("keys[{index}]: {e}")))?;
                }
                KeySource::Passphrase { encryption_password }
                    if encryption_password.len() < MIN_PASSPHRASE_LEN =>
                {
                    return Err(ConfigError::Invalid(format!(
                        "keys[{index}]: encryption_password must be at least {MIN_PASSPHRASE_LEN} bytes"
                    )));
                }
                _ => {}
            }
        }

        Ok(())
    }

    /// The configured database path, or the platform default.
    pub fn database_path(&self) -> PathBuf {
        self.database_path.clone().unwrap_or_else(default_database_path)
    }

    /// Load material for every configured key, in configuration order.
    pub fn build_keys(&self) -> Result<Vec<EncryptionKey>, ConfigError> {
        let mut keys = Vec::with_capacity(self.encryption.keys.len());

        for (index, key) in self.encryption.keys.iter().enumerate() {
            let provider: Box<dyn KeyMaterialProvider> = match &key.source {
                KeySource::Internal { encryption_key } => {
                    Box::new(StaticKeyProvider::new(encryption_key))
                }
                KeySource::Passphrase { encryption_password } => Box::new(
                    PassphraseKeyProvider::new(encryption_password, self.encryption.kdf),
                ),
                KeySource::Keyring { service, user } => {
                    Box::new(KeyringKeyProvider::new(service, user))
                }
                KeySource::Hsm { .. } => {
                    return Err(EncryptionError::UnsupportedProvider(format!(
                        "keys[{index}]: hsm is not available in this build"
                    ))
                    .into());
                }
            };

            let material = provider.load_material()?;
            keys.push(EncryptionKey::new(
                material,
                key.source.kind(),
                key.active,
                format!("keys[{index}]"),
            ));
        }

        Ok(keys)
    }
}

fn default_database_path() -> PathBuf {
    dirs_next::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("credstore")
        .join("credstore.db")
}

// ─── Tests ───────────────────────────────────────────────────────────────────
