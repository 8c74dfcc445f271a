// Credstore — Store Module
//
// Persistence for canaries, credential names and credential versions.
// Secret columns only ever hold envelopes produced by the encryptor.

mod canaries;
mod db;
mod error;
mod models;
mod names;
mod repository;

pub use canaries::{CanaryStore, SqliteCanaryStore};
pub use db::Database;
pub use error::StoreError;
pub use models::{
    canonicalize, Credential, CredentialKind, CredentialValue, CredentialVersion,
    EncryptionKeyCanary, KeyUsage, Slice, VersionAttributes, VersionDraft,
};
pub use names::NameRegistry;
pub use repository::{
    CredentialVersionStore, SqliteCredentialVersionStore, DEFAULT_PAGE_SIZE, MAX_PAGE_SIZE,
};
