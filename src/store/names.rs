// Credstore — Name registry
//
// Credential names are canonicalized to start with `/` and are unique
// ignoring case. The first writer's casing is kept. Creation uses an
// explicit two-step protocol: insert, and if the unique constraint already
// holds a row for the name, read that row back and use it.

use std::collections::BTreeSet;

use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

use super::db::Database;
use super::models::{canonicalize, Credential, CredentialVersion};
use super::repository::{row_to_version, SELECT_VERSION};
use super::StoreError;

pub struct NameRegistry<'a> {
    db: &'a Database,
}

impl<'a> NameRegistry<'a> {
    pub fn new(db: &'a Database) -> Self {
        Self { db }
    }

    pub fn find(&self, name: &str) -> Result<Option<Credential>, StoreError> {
        Self::find_in(self.db.conn(), &canonicalize(name))
    }

    fn find_in(conn: &Connection, canonical: &str) -> Result<Option<Credential>, StoreError> {
        let found = conn
            .query_row(
                "SELECT uuid, name FROM credential WHERE name = ?1",
                params![canonical],
                |row| {
                    let uuid_str: String = row.get(0)?;
                    let name: String = row.get(1)?;
                    Ok((uuid_str, name))
                },
            )
            .optional()?;

        match found {
            Some((uuid_str, name)) => {
                let uuid = Uuid::parse_str(&uuid_str)
                    .map_err(|e| StoreError::Other(format!("corrupt credential uuid: {}", e)))?;
                Ok(Some(Credential { uuid, name }))
            }
            None => Ok(None),
        }
    }

    /// Resolve a name, creating it if absent. Runs on the caller's connection
    /// so it can take part in the caller's transaction.
    pub(crate) fn find_or_create(conn: &Connection, name: &str) -> Result<Credential, StoreError> {
        let canonical = canonicalize(name);
        if let Some(existing) = Self::find_in(conn, &canonical)? {
            return Ok(existing);
        }

        let inserted = conn.execute(
            "INSERT INTO credential (uuid, name) VALUES (?1, ?2) ON CONFLICT DO NOTHING",
            params![Uuid::new_v4().to_string(), canonical],
        )?;
        if inserted == 0 {
            tracing::debug!(credential_name = %canonical, "Name created concurrently; using existing row");
        }

        Self::find_in(conn, &canonical)?.ok_or_else(|| {
            StoreError::Other(format!("credential '{}' missing after insert", canonical))
        })
    }

    /// Delete a name and, by cascade, all its versions. Returns true if it existed.
    pub fn delete(&self, name: &str) -> Result<bool, StoreError> {
        let canonical = canonicalize(name);
        let affected = self.db.conn().execute(
            "DELETE FROM credential WHERE name = ?1",
            params![canonical],
        )?;

        if affected > 0 {
            tracing::info!(credential_name = %canonical, "Credential deleted");
        }
        Ok(affected > 0)
    }

    /// Every directory implied by stored names, sorted and deduplicated.
    /// `/a/b/c` yields `/`, `/a/`, `/a/b/`; a top-level leaf yields nothing.
    pub fn find_all_paths(&self) -> Result<Vec<String>, StoreError> {
        let mut stmt = self.db.conn().prepare("SELECT name FROM credential")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;

        let mut paths = BTreeSet::new();
        for row in rows {
            let name = row?;
            let segments: Vec<&str> = name.trim_start_matches('/').split('/').collect();
            if segments.len() < 2 {
                continue;
            }

            let mut prefix = String::from("/");
            paths.insert(prefix.clone());
            for segment in &segments[..segments.len() - 1] {
                prefix.push_str(segment);
                prefix.push('/');
                paths.insert(prefix.clone());
            }
        }

        Ok(paths.into_iter().collect())
    }

    /// Latest version of every name under `path`, newest first.
    pub fn find_starting_with_path(&self, path: &str) -> Result<Vec<CredentialVersion>, StoreError> {
        let path = normalize_path(path);
        self.find_latest_matching(&format!("{}%", escape_like(&path)))
    }

    /// Latest version of every name containing `fragment`, ignoring case, newest first.
    pub fn find_containing_name(&self, fragment: &str) -> Result<Vec<CredentialVersion>, StoreError> {
        self.find_latest_matching(&format!("%{}%", escape_like(fragment)))
    }

    fn find_latest_matching(&self, pattern: &str) -> Result<Vec<CredentialVersion>, StoreError> {
        let sql = format!(
            "{SELECT_VERSION}
             WHERE c.name LIKE ?1 ESCAPE '\\'
               AND v.id = (SELECT v2.id FROM credential_version v2
                           WHERE v2.credential_uuid = v.credential_uuid
                           ORDER BY v2.version_created_at DESC, v2.id DESC
                           LIMIT 1)
             ORDER BY v.version_created_at DESC, v.id DESC"
        );

        let mut stmt = self.db.conn().prepare(&sql)?;
        let rows = stmt.query_map(params![pattern], row_to_version)?;

        let mut versions = Vec::new();
        for row in rows {
            versions.push(row?);
        }
        Ok(versions)
    }
}

/// `a/b`, `/a/b` and `/a/b/` all become `/a/b/`; empty becomes `/`.
fn normalize_path(path: &str) -> String {
    let trimmed = path.strip_prefix('/').unwrap_or(path);
    let mut normalized = format!("/{}", trimmed);
    if !normalized.ends_with('/') {
        normalized.push('/');
    }
    normalized
}

/// Make `%`, `_` and `\` match literally under `ESCAPE '\'`.
fn escape_like(input: &str) -> String {
    let mut escaped = String::with_capacity(input.len());
    for c in input.chars() {
        if matches!(c, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

// ─── Tests ───────────────────────────────────────────────────────────────────
