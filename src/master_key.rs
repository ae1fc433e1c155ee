use crate::auth::{AuthGate, CancelToken};
use crate::keystore::{InsertOutcome, KeystoreBackend, Namespace, StoredEntry};
use crate::storage::StorageError;
use chrono::{DateTime, Utc};
use rand::{rngs::OsRng, RngCore};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Reserved keystore key holding the master key. Callers of
/// `SecureRecordStore` cannot read or write it.
pub const MASTER_KEY_NAME: &str = "__master_key";

pub const MASTER_KEY_LEN: usize = 32;

#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct MasterKey([u8; MASTER_KEY_LEN]);

impl MasterKey {
    pub fn generate() -> Result<Self, StorageError> {
        let mut key = [0u8; MASTER_KEY_LEN];
        OsRng
            .try_fill_bytes(&mut key)
            .map_err(|_| StorageError::Unavailable("system randomness unavailable".to_string()))?;
        Ok(MasterKey(key))
    }

    pub fn from_bytes(bytes: [u8; MASTER_KEY_LEN]) -> Self {
        MasterKey(bytes)
    }

    pub(crate) fn as_bytes(&self) -> &[u8; MASTER_KEY_LEN] {
        &self.0
    }

    fn from_slice(bytes: &[u8]) -> Result<Self, StorageError> {
        if bytes.len() != MASTER_KEY_LEN {
            return Err(StorageError::InvalidFormat(
                "stored master key has the wrong length".to_string(),
            ));
        }
        let mut key = [0u8; MASTER_KEY_LEN];
        key.copy_from_slice(bytes);
        Ok(MasterKey(key))
    }

    fn to_entry(&self) -> StoredEntry {
        // Protected by the OS keystore's own access control only
        StoredEntry {
            require_device_auth: true,
            encrypted: false,
            blob: self.0.to_vec(),
        }
    }
}

impl fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("MasterKey(..)")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RotationReport {
    pub records_migrated: usize,
    pub keys: Vec<String>,
    pub rotated_at: DateTime<Utc>,
}

/// Owns the single master key of an installation.
///
/// `get_or_create` is serialised by a mutex and backed by the keystore's
/// create-if-absent write, so concurrent first use yields exactly one key.
/// The unlocked key is cached in memory until `lock` is called.
pub struct MasterKeyManager {
    backend: Arc<dyn KeystoreBackend>,
    gate: Arc<AuthGate>,
    storage_key: String,
    cached: Mutex<Option<MasterKey>>,
}

impl MasterKeyManager {
    pub fn new(backend: Arc<dyn KeystoreBackend>, gate: Arc<AuthGate>, namespace: &Namespace) -> Self {
        MasterKeyManager {
            backend,
            gate,
            storage_key: namespace.scoped(MASTER_KEY_NAME),
            cached: Mutex::new(None),
        }
    }

    pub fn get_or_create(&self) -> Result<MasterKey, StorageError> {
        self.get_or_create_with(&CancelToken::new())
    }

    pub fn get_or_create_with(&self, cancel: &CancelToken) -> Result<MasterKey, StorageError> {
        let mut cached = self.lock_cache()?;
        if let Some(key) = cached.as_ref() {
            return Ok(key.clone());
        }

        if let Some(key) = self.load(cancel)? {
            *cached = Some(key.clone());
            return Ok(key);
        }

        let key = MasterKey::generate()?;
        match self.backend.insert_if_absent(&self.storage_key, key.to_entry())? {
            InsertOutcome::Inserted => {
                log::info!("Created new master key");
                *cached = Some(key.clone());
                Ok(key)
            }
            InsertOutcome::AlreadyPresent => {
                // Another writer created it between our read and insert; use theirs
                log::debug!("Master key created concurrently, reading back the stored key");
                let stored = self.load(cancel)?.ok_or_else(|| {
                    StorageError::Concurrency(
                        "master key vanished after concurrent creation".to_string(),
                    )
                })?;
                *cached = Some(stored.clone());
                Ok(stored)
            }
        }
    }

    /// Returns the existing key without creating one.
    pub fn get(&self, cancel: &CancelToken) -> Result<Option<MasterKey>, StorageError> {
        self.get_inner(cancel, false)
    }

    /// Like `get`, for a caller that already passed the device-auth gate in
    /// the same operation.
    pub(crate) fn get_preauthorized(&self, cancel: &CancelToken) -> Result<Option<MasterKey>, StorageError> {
        self.get_inner(cancel, true)
    }

    fn get_inner(&self, cancel: &CancelToken, preauthorized: bool) -> Result<Option<MasterKey>, StorageError> {
        let mut cached = self.lock_cache()?;
        if let Some(key) = cached.as_ref() {
            return Ok(Some(key.clone()));
        }

        let loaded = self.load_with(cancel, preauthorized)?;
        if let Some(key) = loaded.as_ref() {
            *cached = Some(key.clone());
        }
        Ok(loaded)
    }

    pub fn exists(&self) -> Result<bool, StorageError> {
        self.backend.contains(&self.storage_key)
    }

    /// Swaps in `new_key`. `stage` receives the old and new keys and returns
    /// every re-encrypted entry; those entries and the new master key are
    /// written in one batch, so either all of them land or none do.
    pub fn rotate<F>(&self, new_key: MasterKey, cancel: &CancelToken, stage: F) -> Result<RotationReport, StorageError>
    where
        F: FnOnce(&MasterKey, &MasterKey) -> Result<Vec<(String, StoredEntry)>, StorageError>,
    {
        let mut cached = self.lock_cache()?;
        let old_key = match cached.as_ref() {
            Some(key) => key.clone(),
            None => self.load(cancel)?.ok_or(StorageError::MissingMasterKey)?,
        };

        if old_key == new_key {
            return Err(StorageError::InvalidKey(
                "new master key must differ from the current one".to_string(),
            ));
        }

        let mut staged = stage(&old_key, &new_key)?;
        let keys: Vec<String> = staged.iter().map(|(key, _)| key.clone()).collect();
        let records_migrated = staged.len();
        staged.push((self.storage_key.clone(), new_key.to_entry()));

        self.backend.apply_batch(staged)?;
        *cached = Some(new_key);

        log::info!("Rotated master key, re-encrypted {} records", records_migrated);
        Ok(RotationReport {
            records_migrated,
            keys,
            rotated_at: Utc::now(),
        })
    }

    /// Deletes the master key. Every record encrypted under it becomes
    /// permanently undecryptable.
    pub fn destroy(&self) -> Result<(), StorageError> {
        let mut cached = self.lock_cache()?;
        log::warn!("Destroying master key; all envelope-encrypted records become unreadable");
        self.backend.remove(&self.storage_key)?;
        *cached = None;
        Ok(())
    }

    /// Drops the in-memory copy; the next use reads it back through the gate.
    pub fn lock(&self) {
        if let Ok(mut cached) = self.cached.lock() {
            *cached = None;
        }
    }

    fn load(&self, cancel: &CancelToken) -> Result<Option<MasterKey>, StorageError> {
        self.load_with(cancel, false)
    }

    fn load_with(&self, cancel: &CancelToken, preauthorized: bool) -> Result<Option<MasterKey>, StorageError> {
        let entry = match self.backend.read(&self.storage_key)? {
            Some(entry) => entry,
            None => return Ok(None),
        };

        if entry.require_device_auth && !preauthorized {
            self.gate.authorize("unlock wallet storage", cancel)?;
        }

        MasterKey::from_slice(&entry.blob).map(Some)
    }

    fn lock_cache(&self) -> Result<MutexGuard<'_, Option<MasterKey>>, StorageError> {
        self.cached
            .lock()
            .map_err(|_| StorageError::Unavailable("master key lock poisoned".to_string()))
    }
}

impl fmt::Debug for MasterKeyManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MasterKeyManager")
            .field("storage_key", &self.storage_key)
            .finish()
    }
}
