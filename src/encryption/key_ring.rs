// Credstore — Key ring
//
// Classifies configured keys by probing the persisted canaries. A canary is
// a row whose plaintext is a fixed constant; whichever configured key opens
// it owns that canary's uuid, and every envelope naming that uuid.
//
//   active:         the one key used for new writes
//   known-inactive: configured, not active, owns at least one canary
//   unreachable:    a canary no configured key opens; its data is parked
//
// The classification is derived only from configuration and canary rows, so
// any process can recompute it with `remap()`.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use uuid::Uuid;

use super::{EncryptionError, EncryptionKey};
use crate::store::{CanaryStore, EncryptionKeyCanary, StoreError};

/// Plaintext sealed inside every canary.
pub const CANARY_VALUE: &str = "credstore:encryption-key-canary:v1";

#[derive(Debug, Clone)]
struct KeyRingState {
    /// Canary uuid → index into `KeyRing::keys`.
    owners: HashMap<Uuid, usize>,
    active_uuid: Uuid,
    known_inactive: Vec<Uuid>,
    unreachable: Vec<Uuid>,
}

pub struct KeyRing {
    keys: Vec<Arc<EncryptionKey>>,
    active_index: usize,
    state: RwLock<KeyRingState>,
}

impl KeyRing {
    /// Validate the configured keys and map them onto the stored canaries,
    /// creating a canary for the active key if it has none yet.
    pub fn load(keys: Vec<EncryptionKey>, canaries: &dyn CanaryStore) -> Result<Self, StoreError> {
        let active: Vec<usize> = keys
            .iter()
            .enumerate()
            .filter(|(_, key)| key.is_active())
            .map(|(index, _)| index)
            .collect();

        let active_index = match active.as_slice() {
            [index] => *index,
            [] => {
                return Err(EncryptionError::Configuration(
                    "exactly one key must be marked active, found none".to_string(),
                )
                .into())
            }
            many => {
                return Err(EncryptionError::Configuration(format!(
                    "exactly one key must be marked active, found {}",
                    many.len()
                ))
                .into())
            }
        };

        let keys: Vec<Arc<EncryptionKey>> = keys.into_iter().map(Arc::new).collect();
        let state = Self::map_uuids_to_keys(&keys, active_index, canaries)?;

        Ok(Self {
            keys,
            active_index,
            state: RwLock::new(state),
        })
    }

    /// Recompute the classification from the current canary rows.
    pub fn remap(&self, canaries: &dyn CanaryStore) -> Result<(), StoreError> {
        let state = Self::map_uuids_to_keys(&self.keys, self.active_index, canaries)?;
        *self.state.write().unwrap_or_else(PoisonError::into_inner) = state;
        Ok(())
    }

    fn map_uuids_to_keys(
        keys: &[Arc<EncryptionKey>],
        active_index: usize,
        canaries: &dyn CanaryStore,
    ) -> Result<KeyRingState, StoreError> {
        let stored = canaries.find_all()?;
        let mut owners: HashMap<Uuid, usize> = HashMap::new();

        for (index, key) in keys.iter().enumerate() {
            for canary in &stored {
                if !Self::opens(key, canary) {
                    continue;
                }
                if let Some(&owner) = owners.get(&canary.uuid) {
                    if owner != index {
                        tracing::error!(
                            canary_uuid = %canary.uuid,
                            first = %keys[owner].label(),
                            second = %key.label(),
                            "Two configured keys decrypt the same canary"
                        );
                        return Err(EncryptionError::DuplicateKey(canary.uuid).into());
                    }
                }
                owners.insert(canary.uuid, index);
            }
        }

        // Canaries come back oldest first; the newest canary the active key
        // owns is its own, older ones were rewritten by rotation.
        let owned_by_active = stored
            .iter()
            .rev()
            .find(|canary| owners.get(&canary.uuid) == Some(&active_index))
            .map(|canary| canary.uuid);

        let active_uuid = match owned_by_active {
            Some(uuid) => uuid,
            None => {
                let canary = Self::create_canary(&keys[active_index])?;
                canaries.save(&canary)?;
                tracing::info!(
                    canary_uuid = %canary.uuid,
                    key = %keys[active_index].label(),
                    "Created canary for new active key"
                );
                owners.insert(canary.uuid, active_index);
                canary.uuid
            }
        };

        let known_inactive: Vec<Uuid> = stored
            .iter()
            .filter(|canary| matches!(owners.get(&canary.uuid), Some(&owner) if owner != active_index))
            .map(|canary| canary.uuid)
            .collect();

        let unreachable: Vec<Uuid> = stored
            .iter()
            .filter(|canary| !owners.contains_key(&canary.uuid))
            .map(|canary| canary.uuid)
            .collect();

        for (index, key) in keys.iter().enumerate() {
            if index != active_index && !owners.values().any(|&owner| owner == index) {
                tracing::warn!(key = %key.label(), "Configured key matches no canary");
            }
        }
        if !unreachable.is_empty() {
            tracing::warn!(
                count = unreachable.len(),
                "Canaries with no configured key; their data cannot be decrypted"
            );
        }

        tracing::info!(
            active_uuid = %active_uuid,
            known_inactive = known_inactive.len(),
            unreachable = unreachable.len(),
            "Mapped encryption keys to canaries"
        );

        Ok(KeyRingState {
            owners,
            active_uuid,
            known_inactive,
            unreachable,
        })
    }

    fn opens(key: &EncryptionKey, canary: &EncryptionKeyCanary) -> bool {
        match key.decrypt(&canary.nonce, &canary.encrypted_value) {
            Ok(plaintext) if plaintext.as_slice() == CANARY_VALUE.as_bytes() => true,
            Ok(_) => {
                tracing::warn!(
                    canary_uuid = %canary.uuid,
                    key = %key.label(),
                    "Canary decrypted to an unexpected value"
                );
                false
            }
            Err(_) => false,
        }
    }

    fn create_canary(key: &EncryptionKey) -> Result<EncryptionKeyCanary, EncryptionError> {
        let (nonce, encrypted_value) = key.encrypt(CANARY_VALUE.as_bytes())?;
        Ok(EncryptionKeyCanary {
            uuid: Uuid::new_v4(),
            encrypted_value,
            nonce,
        })
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, KeyRingState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn active_uuid(&self) -> Uuid {
        self.read().active_uuid
    }

    /// The active key together with the uuid new envelopes are tagged with.
    pub fn active(&self) -> (Uuid, Arc<EncryptionKey>) {
        let state = self.read();
        (state.active_uuid, Arc::clone(&self.keys[self.active_index]))
    }

    pub fn key_for_uuid(&self, uuid: &Uuid) -> Option<Arc<EncryptionKey>> {
        let state = self.read();
        state.owners.get(uuid).map(|&index| Arc::clone(&self.keys[index]))
    }

    /// Canary uuids owned by configured, non-active keys: the rotation sources.
    pub fn canary_uuids_with_known_and_inactive_keys(&self) -> Vec<Uuid> {
        self.read().known_inactive.clone()
    }

    /// Canary uuids no configured key can open.
    pub fn unreachable_canary_uuids(&self) -> Vec<Uuid> {
        self.read().unreachable.clone()
    }

    pub fn configured_keys(&self) -> &[Arc<EncryptionKey>] {
        &self.keys
    }

    /// Re-seal a canary under the active key, keeping its uuid. The canary
    /// must open under the key that currently owns it.
    pub fn reseal_canary(
        &self,
        canary: &EncryptionKeyCanary,
    ) -> Result<EncryptionKeyCanary, EncryptionError> {
        let owner = self
            .key_for_uuid(&canary.uuid)
            .ok_or(EncryptionError::UnknownKey(canary.uuid))?;
        if !Self::opens(&owner, canary) {
            return Err(EncryptionError::Decryption(format!(
                "canary {} does not open under its owning key",
                canary.uuid
            )));
        }

        let (_, active) = self.active();
        let (nonce, encrypted_value) = active.encrypt(CANARY_VALUE.as_bytes())?;
        Ok(EncryptionKeyCanary {
            uuid: canary.uuid,
            encrypted_value,
            nonce,
        })
    }
}

impl fmt::Debug for KeyRing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.read();
        f.debug_struct("KeyRing")
            .field("keys", &self.keys)
            .field("active_uuid", &state.active_uuid)
            .field("known_inactive", &state.known_inactive)
            .field("unreachable", &state.unreachable)
            .finish()
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
