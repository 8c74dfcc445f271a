// Credstore — Canary repository

use rusqlite::{params, OptionalExtension};
use uuid::Uuid;

use super::db::Database;
use super::models::EncryptionKeyCanary;
use super::StoreError;

/// Persistence for encryption key canaries.
pub trait CanaryStore {
    /// All canaries, oldest first.
    fn find_all(&self) -> Result<Vec<EncryptionKeyCanary>, StoreError>;

    fn find_by_uuid(&self, uuid: &Uuid) -> Result<Option<EncryptionKeyCanary>, StoreError>;

    fn save(&self, canary: &EncryptionKeyCanary) -> Result<(), StoreError>;

    /// Replace a canary's envelope, but only if it still carries
    /// `previous_nonce`. Returns whether the row was updated.
    fn update_envelope(
        &self,
        canary: &EncryptionKeyCanary,
        previous_nonce: &[u8],
    ) -> Result<bool, StoreError>;
}

pub struct SqliteCanaryStore<'a> {
    db: &'a Database,
}

impl<'a> SqliteCanaryStore<'a> {
    pub fn new(db: &'a Database) -> Self {
        Self { db }
    }

    fn row_to_canary(row: &rusqlite::Row<'_>) -> rusqlite::Result<EncryptionKeyCanary> {
        let uuid_str: String = row.get(0)?;
        let uuid = Uuid::parse_str(&uuid_str).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
        })?;

        Ok(EncryptionKeyCanary {
            uuid,
            encrypted_value: row.get(1)?,
            nonce: row.get(2)?,
        })
    }
}

impl<'a> CanaryStore for SqliteCanaryStore<'a> {
    fn find_all(&self) -> Result<Vec<EncryptionKeyCanary>, StoreError> {
        let mut stmt = self.db.conn().prepare(
            "SELECT uuid, encrypted_value, nonce FROM encryption_key_canary ORDER BY id ASC",
        )?;

        let rows = stmt.query_map([], Self::row_to_canary)?;

        let mut canaries = Vec::new();
        for row in rows {
            canaries.push(row?);
        }
        Ok(canaries)
    }

    fn find_by_uuid(&self, uuid: &Uuid) -> Result<Option<EncryptionKeyCanary>, StoreError> {
        let canary = self
            .db
            .conn()
            .query_row(
                "SELECT uuid, encrypted_value, nonce FROM encryption_key_canary WHERE uuid = ?1",
                params![uuid.to_string()],
                Self::row_to_canary,
            )
            .optional()?;
        Ok(canary)
    }

    fn save(&self, canary: &EncryptionKeyCanary) -> Result<(), StoreError> {
        self.db.conn().execute(
            "INSERT INTO encryption_key_canary (uuid, encrypted_value, nonce) VALUES (?1, ?2, ?3)",
            params![canary.uuid.to_string(), canary.encrypted_value, canary.nonce],
        )?;
        tracing::debug!(canary_uuid = %canary.uuid, "Canary stored");
        Ok(())
    }

    fn update_envelope(
        &self,
        canary: &EncryptionKeyCanary,
        previous_nonce: &[u8],
    ) -> Result<bool, StoreError> {
        let affected = self.db.conn().execute(
            "UPDATE encryption_key_canary SET encrypted_value = ?1, nonce = ?2
             WHERE uuid = ?3 AND nonce = ?4",
            params![
                canary.encrypted_value,
                canary.nonce,
                canary.uuid.to_string(),
                previous_nonce
            ],
        )?;
        Ok(affected > 0)
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
