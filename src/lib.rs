// Credstore — Library root
//
// Re-exports the encryption, store, rotation, config and CLI modules.

pub mod cli;
pub mod config;
pub mod encryption;
pub mod error;
pub mod rotation;
pub mod store;

pub use error::{CredstoreError, Result};
