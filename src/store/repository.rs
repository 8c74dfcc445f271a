// Credstore — Credential Version Repository
//
// Appends and reads immutable versions of named credentials. Every write
// resolves the name, checks the existing type, and inserts inside a single
// immediate transaction, so a "no-overwrite" write of a brand-new name by two
// callers at once produces exactly one version.

use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use uuid::Uuid;

use super::db::Database;
use super::models::{
    canonicalize, CredentialKind, CredentialVersion, KeyUsage, Slice, VersionAttributes,
    VersionDraft,
};
use super::names::NameRegistry;
use super::StoreError;
use crate::encryption::{Encryptor, Envelope};

/// Versions fetched per slice when none is configured.
pub const DEFAULT_PAGE_SIZE: usize = 1000;

/// Largest slice the rotator will request in one query.
pub const MAX_PAGE_SIZE: usize = 1_000_000;

/// Column list shared by every version query. `c` is the credential table.
pub(crate) const SELECT_VERSION: &str = "SELECT v.id, v.uuid, v.credential_uuid, c.name, v.type,
            v.encryption_key_uuid, v.encrypted_value, v.nonce,
            v.parameters_key_uuid, v.parameters_encrypted_value, v.parameters_nonce,
            v.attributes, v.version_created_at
     FROM credential_version v
     JOIN credential c ON c.uuid = v.credential_uuid";

// ─── Trait ───────────────────────────────────────────────────────────────────

/// Abstraction over credential version storage.
pub trait CredentialVersionStore {
    /// Append a new version under the draft's name, creating the name if needed.
    /// Fails with a validation error if the name already holds another type.
    fn save(&self, draft: VersionDraft) -> Result<CredentialVersion, StoreError>;

    /// Like `save`, but if the name already has a version, return the latest
    /// one unchanged instead of writing.
    fn save_if_absent(&self, draft: VersionDraft) -> Result<CredentialVersion, StoreError>;

    fn find_most_recent(&self, name: &str) -> Result<Option<CredentialVersion>, StoreError>;

    fn find_by_uuid(&self, uuid: &Uuid) -> Result<Option<CredentialVersion>, StoreError>;

    fn find_all_by_name(&self, name: &str) -> Result<Vec<CredentialVersion>, StoreError>;

    /// The `n` newest versions. Negative `n` is a validation error.
    fn find_n_by_name(&self, name: &str, n: i64) -> Result<Vec<CredentialVersion>, StoreError>;

    /// First slice of versions encrypted under a known-inactive key.
    fn find_encrypted_with_available_inactive_key(
        &self,
    ) -> Result<Slice<CredentialVersion>, StoreError> {
        self.find_encrypted_with_available_inactive_key_after(None)
    }

    /// Slice of versions encrypted under a known-inactive key, past `cursor`.
    fn find_encrypted_with_available_inactive_key_after(
        &self,
        cursor: Option<i64>,
    ) -> Result<Slice<CredentialVersion>, StoreError>;

    /// Names of certificates signed by the named CA.
    fn find_all_certificate_credentials_by_ca_name(
        &self,
        ca_name: &str,
    ) -> Result<Vec<String>, StoreError>;

    /// Persist `rotated`'s envelopes, provided the row still holds the
    /// envelope it was read with. Returns whether the row was updated.
    fn update_envelopes(
        &self,
        original: &CredentialVersion,
        rotated: &CredentialVersion,
    ) -> Result<bool, StoreError>;

    /// Version counts by key class.
    fn count_by_encryption_key(&self) -> Result<KeyUsage, StoreError>;

    /// Versions with any envelope under `key_uuid`.
    fn count_referencing_key(&self, key_uuid: &Uuid) -> Result<u64, StoreError>;
}

// ─── SQLite Implementation ──────────────────────────────────────────────────

pub struct SqliteCredentialVersionStore<'a> {
    db: &'a Database,
    encryptor: &'a Encryptor,
    page_size: usize,
}

impl<'a> SqliteCredentialVersionStore<'a> {
    pub fn new(db: &'a Database, encryptor: &'a Encryptor) -> Self {
        Self {
            db,
            encryptor,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.clamp(1, MAX_PAGE_SIZE);
        self
    }

    pub fn names(&self) -> NameRegistry<'a> {
        NameRegistry::new(self.db)
    }

    /// Delete a name and all of its versions.
    pub fn delete(&self, name: &str) -> Result<bool, StoreError> {
        self.names().delete(name)
    }

    fn write(&self, draft: VersionDraft, skip_if_present: bool) -> Result<CredentialVersion, StoreError> {
        let tx = self.db.write_transaction()?;

        let credential = NameRegistry::find_or_create(&tx, &draft.name)?;
        let latest = Self::find_latest_for(&tx, &credential.uuid)?;

        if let Some(existing) = latest {
            let requested = draft.value.kind();
            if existing.kind != requested {
                return Err(StoreError::Validation(format!(
                    "credential '{}' is of type {}; cannot write a {} version",
                    credential.name, existing.kind, requested
                )));
            }
            if skip_if_present {
                tx.commit()?;
                tracing::debug!(credential_name = %credential.name, "Version exists; not overwriting");
                return Ok(existing);
            }
        }

        let mut version = CredentialVersion::new(self.encryptor, &credential, draft.value)?;
        version.row_id = Self::insert(&tx, &version)?;
        tx.commit()?;

        tracing::info!(
            credential_name = %version.name,
            version_uuid = %version.uuid,
            kind = %version.kind,
            "Credential version stored"
        );
        Ok(version)
    }

    fn insert(conn: &Connection, version: &CredentialVersion) -> Result<i64, StoreError> {
        let value = version.envelope();
        let parameters = version.parameters_envelope();
        let attributes = serde_json::to_string(&version.attributes)?;

        conn.execute(
            "INSERT INTO credential_version
                (uuid, credential_uuid, type, encryption_key_uuid, encrypted_value, nonce,
                 parameters_key_uuid, parameters_encrypted_value, parameters_nonce,
                 attributes, ca_name, version_created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                version.uuid.to_string(),
                version.credential_uuid.to_string(),
                version.kind.as_str(),
                value.key_uuid.to_string(),
                value.encrypted_value,
                value.nonce,
                parameters.map(|p| p.key_uuid.to_string()),
                parameters.map(|p| p.encrypted_value.clone()),
                parameters.map(|p| p.nonce.clone()),
                attributes,
                version.attributes.ca_name,
                version.created_at.timestamp_micros(),
            ],
        )?;

        Ok(conn.last_insert_rowid())
    }

    fn find_latest_for(
        conn: &Connection,
        credential_uuid: &Uuid,
    ) -> Result<Option<CredentialVersion>, StoreError> {
        let sql = format!(
            "{SELECT_VERSION}
             WHERE v.credential_uuid = ?1
             ORDER BY v.version_created_at DESC, v.id DESC
             LIMIT 1"
        );
        let version = conn
            .query_row(&sql, params![credential_uuid.to_string()], row_to_version)
            .optional()?;
        Ok(version)
    }

    fn find_by_name_limited(
        &self,
        name: &str,
        limit: Option<i64>,
    ) -> Result<Vec<CredentialVersion>, StoreError> {
        let sql = format!(
            "{SELECT_VERSION}
             WHERE c.name = ?1
             ORDER BY v.version_created_at DESC, v.id DESC
             LIMIT ?2"
        );

        let mut stmt = self.db.conn().prepare(&sql)?;
        // SQLite treats a negative LIMIT as "no limit".
        let rows = stmt.query_map(
            params![canonicalize(name), limit.unwrap_or(-1)],
            row_to_version,
        )?;

        let mut versions = Vec::new();
        for row in rows {
            versions.push(row?);
        }
        Ok(versions)
    }
}

impl<'a> CredentialVersionStore for SqliteCredentialVersionStore<'a> {
    fn save(&self, draft: VersionDraft) -> Result<CredentialVersion, StoreError> {
        self.write(draft, false)
    }

    fn save_if_absent(&self, draft: VersionDraft) -> Result<CredentialVersion, StoreError> {
        self.write(draft, true)
    }

    fn find_most_recent(&self, name: &str) -> Result<Option<CredentialVersion>, StoreError> {
        Ok(self.find_by_name_limited(name, Some(1))?.into_iter().next())
    }

    fn find_by_uuid(&self, uuid: &Uuid) -> Result<Option<CredentialVersion>, StoreError> {
        let sql = format!("{SELECT_VERSION} WHERE v.uuid = ?1");
        let version = self
            .db
            .conn()
            .query_row(&sql, params![uuid.to_string()], row_to_version)
            .optional()?;
        Ok(version)
    }

    fn find_all_by_name(&self, name: &str) -> Result<Vec<CredentialVersion>, StoreError> {
        self.find_by_name_limited(name, None)
    }

    fn find_n_by_name(&self, name: &str, n: i64) -> Result<Vec<CredentialVersion>, StoreError> {
        if n < 0 {
            return Err(StoreError::Validation(format!(
                "number of versions must not be negative, got {}",
                n
            )));
        }
        if n == 0 {
            return Ok(Vec::new());
        }
        self.find_by_name_limited(name, Some(n))
    }

    fn find_encrypted_with_available_inactive_key_after(
        &self,
        cursor: Option<i64>,
    ) -> Result<Slice<CredentialVersion>, StoreError> {
        let inactive = self
            .encryptor
            .key_ring()
            .canary_uuids_with_known_and_inactive_keys();

        if inactive.is_empty() {
            return Ok(Slice {
                items: Vec::new(),
                has_more: false,
                next_cursor: None,
            });
        }

        let placeholders = (0..inactive.len())
            .map(|i| format!("?{}", i + 3))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "{SELECT_VERSION}
             WHERE v.id > ?1
               AND (v.encryption_key_uuid IN ({placeholders})
                    OR v.parameters_key_uuid IN ({placeholders}))
             ORDER BY v.id ASC
             LIMIT ?2"
        );

        // One extra row tells us whether another slice follows.
        let limit = i64::try_from(self.page_size)
            .ok()
            .and_then(|n| n.checked_add(1))
            .ok_or_else(|| {
                StoreError::Validation(format!("page size {} is out of range", self.page_size))
            })?;
        let mut values = vec![SqlValue::Integer(cursor.unwrap_or(0)), SqlValue::Integer(limit)];
        values.extend(inactive.iter().map(|uuid| SqlValue::Text(uuid.to_string())));

        let mut stmt = self.db.conn().prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(values), row_to_version)?;

        let mut items = Vec::new();
        for row in rows {
            items.push(row?);
        }

        let has_more = items.len() > self.page_size;
        items.truncate(self.page_size);
        let next_cursor = items.last().map(|version| version.row_id);

        Ok(Slice {
            items,
            has_more,
            next_cursor,
        })
    }

    fn find_all_certificate_credentials_by_ca_name(
        &self,
        ca_name: &str,
    ) -> Result<Vec<String>, StoreError> {
        let mut stmt = self.db.conn().prepare(
            "SELECT DISTINCT c.name
             FROM credential_version v
             JOIN credential c ON c.uuid = v.credential_uuid
             WHERE v.type = ?1 AND v.ca_name = ?2
             ORDER BY c.name ASC",
        )?;

        let rows = stmt.query_map(
            params![CredentialKind::Certificate.as_str(), canonicalize(ca_name)],
            |row| row.get::<_, String>(0),
        )?;

        let mut names = Vec::new();
        for row in rows {
            names.push(row?);
        }
        Ok(names)
    }

    fn update_envelopes(
        &self,
        original: &CredentialVersion,
        rotated: &CredentialVersion,
    ) -> Result<bool, StoreError> {
        let value = rotated.envelope();
        let parameters = rotated.parameters_envelope();

        let affected = self.db.conn().execute(
            "UPDATE credential_version
             SET encryption_key_uuid = ?1, encrypted_value = ?2, nonce = ?3,
                 parameters_key_uuid = ?4, parameters_encrypted_value = ?5, parameters_nonce = ?6
             WHERE uuid = ?7 AND encryption_key_uuid = ?8 AND nonce = ?9",
            params![
                value.key_uuid.to_string(),
                value.encrypted_value,
                value.nonce,
                parameters.map(|p| p.key_uuid.to_string()),
                parameters.map(|p| p.encrypted_value.clone()),
                parameters.map(|p| p.nonce.clone()),
                rotated.uuid.to_string(),
                original.envelope().key_uuid.to_string(),
                original.envelope().nonce,
            ],
        )?;

        Ok(affected > 0)
    }

    fn count_by_encryption_key(&self) -> Result<KeyUsage, StoreError> {
        let mut stmt = self.db.conn().prepare(
            "SELECT encryption_key_uuid, count(*) FROM credential_version
             GROUP BY encryption_key_uuid",
        )?;
        let rows = stmt.query_map([], |row| {
            let key_uuid: String = row.get(0)?;
            let count: i64 = row.get(1)?;
            Ok((key_uuid, count))
        })?;

        let key_ring = self.encryptor.key_ring();
        let active = key_ring.active_uuid();

        let mut usage = KeyUsage::default();
        for row in rows {
            let (key_uuid, count) = row?;
            let count = count.max(0) as u64;
            match Uuid::parse_str(&key_uuid) {
                Ok(uuid) if uuid == active => usage.active += count,
                Ok(uuid) if key_ring.key_for_uuid(&uuid).is_some() => usage.inactive += count,
                _ => usage.unknown += count,
            }
        }
        Ok(usage)
    }

    fn count_referencing_key(&self, key_uuid: &Uuid) -> Result<u64, StoreError> {
        let count: i64 = self.db.conn().query_row(
            "SELECT count(*) FROM credential_version
             WHERE encryption_key_uuid = ?1 OR parameters_key_uuid = ?1",
            params![key_uuid.to_string()],
            |row| row.get(0),
        )?;
        Ok(count.max(0) as u64)
    }
}

// ─── Row mapping ─────────────────────────────────────────────────────────────

fn conversion_error<E>(column: usize, e: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(column, rusqlite::types::Type::Text, Box::new(e))
}

fn parse_uuid(row: &rusqlite::Row<'_>, column: usize) -> rusqlite::Result<Uuid> {
    let text: String = row.get(column)?;
    Uuid::parse_str(&text).map_err(|e| conversion_error(column, e))
}

/// Parse a row selected with `SELECT_VERSION`.
pub(crate) fn row_to_version(row: &rusqlite::Row<'_>) -> rusqlite::Result<CredentialVersion> {
    let row_id: i64 = row.get(0)?;
    let uuid = parse_uuid(row, 1)?;
    let credential_uuid = parse_uuid(row, 2)?;
    let name: String = row.get(3)?;

    let kind_str: String = row.get(4)?;
    let kind = kind_str.parse::<CredentialKind>().map_err(|e| conversion_error(4, e))?;

    let value = Envelope {
        key_uuid: parse_uuid(row, 5)?,
        encrypted_value: row.get(6)?,
        nonce: row.get(7)?,
    };

    let parameters_key: Option<String> = row.get(8)?;
    let parameters_value: Option<Vec<u8>> = row.get(9)?;
    let parameters_nonce: Option<Vec<u8>> = row.get(10)?;
    let parameters = match (parameters_key, parameters_value, parameters_nonce) {
        (Some(key), Some(encrypted_value), Some(nonce)) => Some(Envelope {
            key_uuid: Uuid::parse_str(&key).map_err(|e| conversion_error(8, e))?,
            encrypted_value,
            nonce,
        }),
        _ => None,
    };

    let attributes_json: String = row.get(11)?;
    let attributes: VersionAttributes =
        serde_json::from_str(&attributes_json).map_err(|e| conversion_error(11, e))?;

    let created_micros: i64 = row.get(12)?;
    let created_at = chrono::DateTime::from_timestamp_micros(created_micros).ok_or_else(|| {
        rusqlite::Error::IntegralValueOutOfRange(12, created_micros)
    })?;

    Ok(CredentialVersion::from_row(
        row_id,
        uuid,
        credential_uuid,
        name,
        kind,
        created_at,
        attributes,
        value,
        parameters,
    ))
}

// ─── Tests ───────────────────────────────────────────────────────────────────
