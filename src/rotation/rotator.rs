// Credstore — Key Rotator
//
// Moves every credential version encrypted under a known-inactive key onto
// the active key, then re-seals the inactive keys' canaries. Data under
// unreachable canaries is never selected and is left exactly as found.
//
// Each row is rewritten on its own, conditioned on the envelope it was read
// with, so a rotation can be interrupted between rows or run next to live
// writers without losing either side's update.

use std::collections::HashSet;

use serde::Serialize;
use uuid::Uuid;

use crate::encryption::Encryptor;
use crate::store::{CanaryStore, CredentialVersion, CredentialVersionStore, StoreError};

/// Outcome of one rotation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RotationSummary {
    pub versions_rotated: u64,
    /// Rows that could not be decrypted or written; left in place.
    pub versions_failed: u64,
    /// Rows another writer changed between our read and our update.
    pub versions_superseded: u64,
    pub canaries_rotated: u64,
    /// Versions under canaries no configured key opens.
    pub skipped_unreachable: u64,
}

pub struct KeyRotator<'a> {
    encryptor: &'a Encryptor,
    versions: &'a dyn CredentialVersionStore,
    canaries: &'a dyn CanaryStore,
}

impl<'a> KeyRotator<'a> {
    pub fn new(
        encryptor: &'a Encryptor,
        versions: &'a dyn CredentialVersionStore,
        canaries: &'a dyn CanaryStore,
    ) -> Self {
        Self {
            encryptor,
            versions,
            canaries,
        }
    }

    /// Run one full pass. Idempotent: with nothing eligible it writes nothing.
    pub fn rotate(&self) -> Result<RotationSummary, StoreError> {
        let key_ring = self.encryptor.key_ring();
        key_ring.remap(self.canaries)?;

        let mut summary = RotationSummary::default();
        for uuid in key_ring.unreachable_canary_uuids() {
            summary.skipped_unreachable += self.versions.count_referencing_key(&uuid)?;
        }
        if summary.skipped_unreachable > 0 {
            tracing::warn!(
                versions = summary.skipped_unreachable,
                "Versions under unreachable keys will not be rotated"
            );
        }

        let inactive = key_ring.canary_uuids_with_known_and_inactive_keys();
        tracing::info!(
            active_uuid = %key_ring.active_uuid(),
            inactive_keys = inactive.len(),
            "Starting key rotation"
        );

        let mut failed_keys: HashSet<Uuid> = HashSet::new();
        let mut cursor = None;
        loop {
            let slice = self
                .versions
                .find_encrypted_with_available_inactive_key_after(cursor)?;
            if slice.is_empty() {
                break;
            }

            for version in &slice.items {
                self.rotate_version(version, &mut summary, &mut failed_keys);
            }

            tracing::debug!(
                rows = slice.len(),
                rotated = summary.versions_rotated,
                "Rotated slice"
            );

            // The cursor only moves forward, so rows that failed are not seen again.
            cursor = slice.next_cursor;
            if !slice.has_more {
                break;
            }
        }

        for uuid in inactive {
            if self.rotate_canary(&uuid, &failed_keys)? {
                summary.canaries_rotated += 1;
            }
        }
        if summary.canaries_rotated > 0 {
            key_ring.remap(self.canaries)?;
        }

        tracing::info!(
            versions_rotated = summary.versions_rotated,
            versions_failed = summary.versions_failed,
            versions_superseded = summary.versions_superseded,
            canaries_rotated = summary.canaries_rotated,
            skipped_unreachable = summary.skipped_unreachable,
            "Key rotation finished"
        );
        Ok(summary)
    }

    fn rotate_version(
        &self,
        version: &CredentialVersion,
        summary: &mut RotationSummary,
        failed_keys: &mut HashSet<Uuid>,
    ) {
        let mut rotated = version.clone();
        let result = rotated
            .rotate(self.encryptor)
            .map_err(StoreError::from)
            .and_then(|changed| {
                if changed {
                    self.versions.update_envelopes(version, &rotated).map(Some)
                } else {
                    Ok(None)
                }
            });

        match result {
            Ok(Some(true)) => {
                summary.versions_rotated += 1;
                tracing::debug!(version_uuid = %version.uuid, "Version rotated");
            }
            Ok(Some(false)) => {
                summary.versions_superseded += 1;
                tracing::debug!(
                    version_uuid = %version.uuid,
                    "Version changed during rotation; keeping the newer envelope"
                );
            }
            Ok(None) => {}
            Err(e) => {
                summary.versions_failed += 1;
                failed_keys.extend(version.key_uuids());
                tracing::error!(
                    version_uuid = %version.uuid,
                    credential_name = %version.name,
                    error = %e,
                    "Failed to rotate version"
                );
            }
        }
    }

    /// Re-seal an inactive key's canary once none of its data remains.
    fn rotate_canary(&self, uuid: &Uuid, failed_keys: &HashSet<Uuid>) -> Result<bool, StoreError> {
        if failed_keys.contains(uuid) {
            tracing::warn!(canary_uuid = %uuid, "Keeping canary: some versions failed to rotate");
            return Ok(false);
        }

        let remaining = self.versions.count_referencing_key(uuid)?;
        if remaining > 0 {
            tracing::warn!(
                canary_uuid = %uuid,
                remaining,
                "Keeping canary: versions still reference it"
            );
            return Ok(false);
        }

        let Some(canary) = self.canaries.find_by_uuid(uuid)? else {
            return Ok(false);
        };

        let resealed = match self.encryptor.key_ring().reseal_canary(&canary) {
            Ok(resealed) => resealed,
            Err(e) => {
                tracing::error!(canary_uuid = %uuid, error = %e, "Failed to rotate canary");
                return Ok(false);
            }
        };

        let updated = self.canaries.update_envelope(&resealed, &canary.nonce)?;
        if updated {
            tracing::warn!(
                canary_uuid = %uuid,
                active_uuid = %self.encryptor.key_ring().active_uuid(),
                "Canary rotated to active key; instances still running with the old active key must restart"
            );
        }
        Ok(updated)
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::encryption::{EncryptionKey, KeyRing};
    use crate::store::{
        CredentialValue, Database, KeyUsage, Slice, SqliteCanaryStore,
        SqliteCredentialVersionStore, VersionDraft,
    };

    fn encryptor_for(db: &Database, keys: Vec<EncryptionKey>) -> Encryptor {
        let ring = KeyRing::load(keys, &SqliteCanaryStore::new(db)).unwrap();
        Encryptor::new(Arc::new(ring))
    }

    fn value(v: &str) -> CredentialValue {
        CredentialValue::Value(v.to_string())
    }

    fn password(p: &str) -> CredentialValue {
        CredentialValue::Password {
            password: p.to_string(),
            parameters: Some(serde_json::json!({"length": 24})),
        }
    }

    /// Write versions under `key` as the only configured key.
    fn write_under(db: &Database, key: &EncryptionKey, drafts: Vec<VersionDraft>) {
        let encryptor = encryptor_for(db, vec![key.reconfigured(true, key.label())]);
        let store = SqliteCredentialVersionStore::new(db, &encryptor);
        for draft in drafts {
            store.save(draft).unwrap();
        }
    }

    fn rotate(db: &Database, encryptor: &Encryptor, page_size: usize) -> RotationSummary {
        let versions = SqliteCredentialVersionStore::new(db, encryptor).with_page_size(page_size);
        let canaries = SqliteCanaryStore::new(db);
        KeyRotator::new(encryptor, &versions, &canaries).rotate().unwrap()
    }

    #[test]
    fn test_rotation_converges_and_leaves_unreachable_data_alone() {
        let db = Database::open_in_memory().unwrap();
        let lost = EncryptionKey::generate(true, "lost");
        let old = EncryptionKey::generate(true, "old");

        write_under(
            &db,
            &lost,
            vec![
                VersionDraft::new("/lost/a", value("la")),
                VersionDraft::new("/lost/b", value("lb")),
            ],
        );
        write_under(
            &db,
            &old,
            vec![
                VersionDraft::new("/old/a", value("oa")),
                VersionDraft::new("/old/b", password("ob")),
                VersionDraft::new("/old/a", value("oa2")),
            ],
        );
        let lost_uuids: Vec<Uuid> = {
            let encryptor = encryptor_for(&db, vec![lost.reconfigured(true, "lost")]);
            let store = SqliteCredentialVersionStore::new(&db, &encryptor);
            ["/lost/a", "/lost/b"]
                .iter()
                .map(|name| store.find_most_recent(name).unwrap().unwrap().envelope().key_uuid)
                .collect()
        };

        let encryptor = encryptor_for(
            &db,
            vec![EncryptionKey::generate(true, "new"), old.reconfigured(false, "old")],
        );
        let summary = rotate(&db, &encryptor, 1000);

        assert_eq!(summary.versions_rotated, 3);
        assert_eq!(summary.versions_failed, 0);
        assert_eq!(summary.versions_superseded, 0);
        assert_eq!(summary.canaries_rotated, 1);
        assert_eq!(summary.skipped_unreachable, 2);

        let store = SqliteCredentialVersionStore::new(&db, &encryptor);
        let active = encryptor.key_ring().active_uuid();
        for name in ["/old/a", "/old/b"] {
            for version in store.find_all_by_name(name).unwrap() {
                assert!(version.key_uuids().iter().all(|uuid| *uuid == active));
                assert!(version.value(&encryptor).is_ok());
            }
        }
        assert!(store.find_most_recent("/old/a").unwrap().unwrap().value(&encryptor).unwrap() == value("oa2"));

        for (name, uuid) in ["/lost/a", "/lost/b"].iter().zip(&lost_uuids) {
            let version = store.find_most_recent(name).unwrap().unwrap();
            assert_eq!(version.envelope().key_uuid, *uuid, "Unreachable data must not be touched");
        }

        assert!(store.find_encrypted_with_available_inactive_key().unwrap().is_empty());
        assert!(encryptor.key_ring().canary_uuids_with_known_and_inactive_keys().is_empty());
        assert_eq!(
            store.count_by_encryption_key().unwrap(),
            KeyUsage { active: 3, inactive: 0, unknown: 2 }
        );

        let second = rotate(&db, &encryptor, 1000);
        assert_eq!(
            second,
            RotationSummary {
                skipped_unreachable: 2,
                ..RotationSummary::default()
            },
            "A second pass must write nothing"
        );
    }

    #[test]
    fn test_rotated_canary_opens_only_under_active_key() {
        let db = Database::open_in_memory().unwrap();
        let old = EncryptionKey::generate(true, "old");

        let stale = encryptor_for(&db, vec![old.reconfigured(true, "old")]);
        let stale_store = SqliteCredentialVersionStore::new(&db, &stale);
        let old_uuid = stale_store
            .save(VersionDraft::new("/early", value("e")))
            .unwrap()
            .envelope()
            .key_uuid;

        let encryptor = encryptor_for(
            &db,
            vec![EncryptionKey::generate(true, "new"), old.reconfigured(false, "old")],
        );
        let summary = rotate(&db, &encryptor, 1000);
        assert_eq!(summary.canaries_rotated, 1);

        let (_, active) = encryptor.key_ring().active();
        let owner = encryptor.key_ring().key_for_uuid(&old_uuid).unwrap();
        assert!(Arc::ptr_eq(&owner, &active), "Re-sealed canary must belong to the active key");

        // An instance that kept the old key active still tags writes with the old uuid.
        let late = stale_store.save(VersionDraft::new("/late", value("l"))).unwrap();
        assert_eq!(late.envelope().key_uuid, old_uuid);

        let store = SqliteCredentialVersionStore::new(&db, &encryptor);
        let found = store.find_most_recent("/late").unwrap().unwrap();
        assert!(found.value(&encryptor).is_err(), "Stale writes cannot be opened once the canary moved");
        assert!(store.find_most_recent("/early").unwrap().unwrap().value(&encryptor).unwrap() == value("e"));
    }

    #[test]
    fn test_rotation_moves_parameters_envelope() {
        let db = Database::open_in_memory().unwrap();
        let old = EncryptionKey::generate(true, "old");
        write_under(&db, &old, vec![VersionDraft::new("/pw", password("secret"))]);

        let encryptor = encryptor_for(
            &db,
            vec![EncryptionKey::generate(true, "new"), old.reconfigured(false, "old")],
        );
        rotate(&db, &encryptor, 1000);

        let store = SqliteCredentialVersionStore::new(&db, &encryptor);
        let version = store.find_most_recent("/pw").unwrap().unwrap();
        let active = encryptor.key_ring().active_uuid();
        assert_eq!(version.envelope().key_uuid, active);
        assert_eq!(version.parameters_envelope().unwrap().key_uuid, active);
        assert!(version.value(&encryptor).unwrap() == password("secret"));
    }

    #[test]
    fn test_rotation_walks_every_page() {
        let db = Database::open_in_memory().unwrap();
        let old = EncryptionKey::generate(true, "old");
        let drafts = (0..7)
            .map(|i| VersionDraft::new(format!("/paged/{i}"), value("v")))
            .collect();
        write_under(&db, &old, drafts);

        let encryptor = encryptor_for(
            &db,
            vec![EncryptionKey::generate(true, "new"), old.reconfigured(false, "old")],
        );
        let summary = rotate(&db, &encryptor, 2);

        assert_eq!(summary.versions_rotated, 7);
        assert_eq!(summary.canaries_rotated, 1);
    }

    #[test]
    fn test_corrupt_row_is_skipped_and_keeps_its_canary() {
        let db = Database::open_in_memory().unwrap();
        let old = EncryptionKey::generate(true, "old");
        let drafts = (0..4)
            .map(|i| VersionDraft::new(format!("/rows/{i}"), value("v")))
            .collect();
        write_under(&db, &old, drafts);

        db.conn()
            .execute(
                "UPDATE credential_version SET encrypted_value = x'00112233'
                 WHERE credential_uuid = (SELECT uuid FROM credential WHERE name = '/rows/1')",
                [],
            )
            .unwrap();

        let encryptor = encryptor_for(
            &db,
            vec![EncryptionKey::generate(true, "new"), old.reconfigured(false, "old")],
        );
        let summary = rotate(&db, &encryptor, 1);

        assert_eq!(summary.versions_rotated, 3);
        assert_eq!(summary.versions_failed, 1);
        assert_eq!(summary.canaries_rotated, 0, "Canary must stay while its key still has data");

        let store = SqliteCredentialVersionStore::new(&db, &encryptor);
        let left = store.find_encrypted_with_available_inactive_key().unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left.items[0].name, "/rows/1");

        let again = rotate(&db, &encryptor, 1);
        assert_eq!(again.versions_rotated, 0);
        assert_eq!(again.versions_failed, 1);
    }

    #[test]
    fn test_nothing_to_rotate_writes_nothing() {
        let db = Database::open_in_memory().unwrap();
        let encryptor = encryptor_for(&db, vec![EncryptionKey::generate(true, "only")]);
        SqliteCredentialVersionStore::new(&db, &encryptor)
            .save(VersionDraft::new("/fresh", value("v")))
            .unwrap();

        assert_eq!(rotate(&db, &encryptor, 1000), RotationSummary::default());
    }

    /// Rotates each row itself just before the rotator's own update lands,
    /// as a concurrent rotation in another process would.
    struct RacingStore<'a> {
        inner: SqliteCredentialVersionStore<'a>,
        encryptor: &'a Encryptor,
    }

    impl CredentialVersionStore for RacingStore<'_> {
        fn save(&self, draft: VersionDraft) -> Result<CredentialVersion, StoreError> {
            self.inner.save(draft)
        }

        fn save_if_absent(&self, draft: VersionDraft) -> Result<CredentialVersion, StoreError> {
            self.inner.save_if_absent(draft)
        }

        fn find_most_recent(&self, name: &str) -> Result<Option<CredentialVersion>, StoreError> {
            self.inner.find_most_recent(name)
        }

        fn find_by_uuid(&self, uuid: &Uuid) -> Result<Option<CredentialVersion>, StoreError> {
            self.inner.find_by_uuid(uuid)
        }

        fn find_all_by_name(&self, name: &str) -> Result<Vec<CredentialVersion>, StoreError> {
            self.inner.find_all_by_name(name)
        }

        fn find_n_by_name(&self, name: &str, n: i64) -> Result<Vec<CredentialVersion>, StoreError> {
            self.inner.find_n_by_name(name, n)
        }

        fn find_encrypted_with_available_inactive_key_after(
            &self,
            cursor: Option<i64>,
        ) -> Result<Slice<CredentialVersion>, StoreError> {
            self.inner.find_encrypted_with_available_inactive_key_after(cursor)
        }

        fn find_all_certificate_credentials_by_ca_name(
            &self,
            ca_name: &str,
        ) -> Result<Vec<String>, StoreError> {
            self.inner.find_all_certificate_credentials_by_ca_name(ca_name)
        }

        fn update_envelopes(
            &self,
            original: &CredentialVersion,
            rotated: &CredentialVersion,
        ) -> Result<bool, StoreError> {
            let mut competing = original.clone();
            competing.rotate(self.encryptor)?;
            assert!(self.inner.update_envelopes(original, &competing)?);
            self.inner.update_envelopes(original, rotated)
        }

        fn count_by_encryption_key(&self) -> Result<KeyUsage, StoreError> {
            self.inner.count_by_encryption_key()
        }

        fn count_referencing_key(&self, key_uuid: &Uuid) -> Result<u64, StoreError> {
            self.inner.count_referencing_key(key_uuid)
        }
    }

    #[test]
    fn test_lost_race_counts_as_superseded() {
        let db = Database::open_in_memory().unwrap();
        let old = EncryptionKey::generate(true, "old");
        write_under(
            &db,
            &old,
            vec![
                VersionDraft::new("/race/a", value("a")),
                VersionDraft::new("/race/b", password("b")),
            ],
        );

        let encryptor = encryptor_for(
            &db,
            vec![EncryptionKey::generate(true, "new"), old.reconfigured(false, "old")],
        );
        let versions = RacingStore {
            inner: SqliteCredentialVersionStore::new(&db, &encryptor),
            encryptor: &encryptor,
        };
        let canaries = SqliteCanaryStore::new(&db);
        let summary = KeyRotator::new(&encryptor, &versions, &canaries).rotate().unwrap();

        assert_eq!(summary.versions_rotated, 0);
        assert_eq!(summary.versions_superseded, 2);
        assert_eq!(summary.versions_failed, 0);
        assert_eq!(summary.canaries_rotated, 1, "The competing writer already moved the data");

        let store = SqliteCredentialVersionStore::new(&db, &encryptor);
        assert!(store.find_most_recent("/race/b").unwrap().unwrap().value(&encryptor).unwrap() == password("b"));
    }
}
