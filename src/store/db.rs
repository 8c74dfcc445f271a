// Credstore — Database Management
//
// Opens a SQLite database and brings its schema up to date. Secrets are
// already sealed by the encryptor before they reach a row, so the file itself
// is plain SQLite. Every process, and every request thread, opens its own
// connection; writers serialize through `BEGIN IMMEDIATE`.

use std::time::Duration;

use rusqlite::{Connection, Transaction, TransactionBehavior};

use super::StoreError;

/// How long a connection waits on another writer's lock before failing.
const BUSY_TIMEOUT: Duration = Duration::from_secs(10);

/// Wrapper around one SQLite connection.
pub struct Database {
    conn: Connection,
}

impl Database {
    /// Open (or create) the database at the given path.
    pub fn open(path: &std::path::Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;

        let db = Self { conn };
        db.configure()?;
        db.run_migrations()?;

        tracing::debug!(path = %path.display(), "Database opened");
        Ok(db)
    }

    /// Open an in-memory database (for testing only).
    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        let db = Self { conn };
        db.configure()?;
        db.run_migrations()?;
        Ok(db)
    }

    /// Get a reference to the underlying connection.
    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Start a transaction that takes the write lock up front, so two writers
    /// never both read "absent" and then race to insert.
    pub fn write_transaction(&self) -> Result<Transaction<'_>, StoreError> {
        Ok(Transaction::new_unchecked(
            &self.conn,
            TransactionBehavior::Immediate,
        )?)
    }

    fn configure(&self) -> Result<(), StoreError> {
        self.conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        Ok(())
    }

    /// Run schema migrations to create or update tables.
    fn run_migrations(&self) -> Result<(), StoreError> {
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS encryption_key_canary (
                id                  INTEGER PRIMARY KEY AUTOINCREMENT,
                uuid                TEXT NOT NULL UNIQUE,
                encrypted_value     BLOB NOT NULL,
                nonce               BLOB NOT NULL
            );

            CREATE TABLE IF NOT EXISTS credential (
                uuid                TEXT PRIMARY KEY,
                name                TEXT NOT NULL COLLATE NOCASE UNIQUE
            );

            CREATE TABLE IF NOT EXISTS credential_version (
                id                          INTEGER PRIMARY KEY AUTOINCREMENT,
                uuid                        TEXT NOT NULL UNIQUE,
                credential_uuid             TEXT NOT NULL,
                type                        TEXT NOT NULL,
                encryption_key_uuid         TEXT NOT NULL,
                encrypted_value             BLOB NOT NULL,
                nonce                       BLOB NOT NULL,
                parameters_key_uuid         TEXT,
                parameters_encrypted_value  BLOB,
                parameters_nonce            BLOB,
                attributes                  TEXT NOT NULL DEFAULT '{}',
                ca_name                     TEXT COLLATE NOCASE,
                version_created_at          INTEGER NOT NULL,
                FOREIGN KEY(credential_uuid) REFERENCES credential(uuid) ON DELETE CASCADE
            );

            CREATE INDEX IF NOT EXISTS idx_version_credential
                ON credential_version(credential_uuid, version_created_at);

            CREATE INDEX IF NOT EXISTS idx_version_key
                ON credential_version(encryption_key_uuid);

            CREATE INDEX IF NOT EXISTS idx_version_parameters_key
                ON credential_version(parameters_key_uuid);

            CREATE INDEX IF NOT EXISTS idx_version_ca_name
                ON credential_version(ca_name);
            ",
        )?;

        tracing::debug!("Database migrations completed successfully");
        Ok(())
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
