use crate::auth::{AlwaysAllow, AuthError, AuthGate, CancelToken, DeviceAuthenticator};
use crate::cipher::{self, DecryptError, EncryptError, EncryptedRecord};
use crate::config::VaultConfig;
use crate::keystore::{validate_key, KeystoreBackend, Namespace, StoredEntry};
use crate::master_key::{MasterKey, MasterKeyManager, RotationReport, MASTER_KEY_NAME};
use serde_json::Value;
use std::collections::BTreeSet;
use std::error::Error;
use std::fmt;
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard};
use std::time::Duration;
use zeroize::Zeroizing;

/// Reserved key of the explicit record index.
pub const INDEX_KEY: &str = "__record_index";

#[derive(Debug)]
pub enum StorageError {
    Io(std::io::Error),
    Unavailable(String),
    Auth(AuthError),
    Encrypt(EncryptError),
    /// The entry exists but cannot be decrypted.
    Decrypt { key: String, source: DecryptError },
    InvalidKey(String),
    ReservedKey(String),
    InvalidFormat(String),
    MissingMasterKey,
    Concurrency(String),
}

impl StorageError {
    /// Whether the same call may succeed if the caller tries again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StorageError::Io(_)
                | StorageError::Unavailable(_)
                | StorageError::Auth(_)
                | StorageError::Concurrency(_)
        )
    }
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            StorageError::Io(e) => write!(f, "IO error: {}", e),
            StorageError::Unavailable(reason) => write!(f, "Keystore unavailable: {}", reason),
            StorageError::Auth(e) => write!(f, "{}", e),
            StorageError::Encrypt(e) => write!(f, "Failed to encrypt data: {}", e),
            StorageError::Decrypt { key, source } => {
                write!(f, "Failed to decrypt record '{}': {}", key, source)
            }
            StorageError::InvalidKey(key) => write!(f, "Invalid record key: {}", key),
            StorageError::ReservedKey(key) => write!(f, "Record key is reserved: {}", key),
            StorageError::InvalidFormat(reason) => write!(f, "Invalid keystore format: {}", reason),
            StorageError::MissingMasterKey => write!(f, "No master key has been created"),
            StorageError::Concurrency(reason) => write!(f, "Concurrent update conflict: {}", reason),
        }
    }
}

impl Error for StorageError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            StorageError::Io(e) => Some(e),
            StorageError::Auth(e) => Some(e),
            StorageError::Encrypt(e) => Some(e),
            StorageError::Decrypt { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl From<std::io::Error> for StorageError {
    fn from(err: std::io::Error) -> Self {
        StorageError::Io(err)
    }
}

impl From<AuthError> for StorageError {
    fn from(err: AuthError) -> Self {
        StorageError::Auth(err)
    }
}

impl From<EncryptError> for StorageError {
    fn from(err: EncryptError) -> Self {
        StorageError::Encrypt(err)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PutOptions {
    /// Reads must pass device authentication first.
    pub require_device_auth: bool,
    /// Wrap the value in an `EncryptedRecord` under the master key.
    pub encrypt: bool,
}

impl PutOptions {
    pub fn secret() -> Self {
        PutOptions {
            require_device_auth: true,
            encrypt: true,
        }
    }

    pub fn encrypted() -> Self {
        PutOptions {
            require_device_auth: false,
            encrypt: true,
        }
    }

    pub fn plain() -> Self {
        PutOptions::default()
    }
}

/// Key/value store over an OS keystore with optional envelope encryption and
/// device-auth gating.
///
/// Keys are namespaced before they reach the backend. Every key written
/// through the store is listed in an index entry, which backs `keys` and
/// master key rotation. Rotation holds a write lock that excludes every
/// other operation, so no record is written under a key being retired.
pub struct SecureRecordStore {
    backend: Arc<dyn KeystoreBackend>,
    gate: Arc<AuthGate>,
    master: Arc<MasterKeyManager>,
    namespace: Namespace,
    index_lock: Mutex<()>,
    rotation: RwLock<()>,
}

impl SecureRecordStore {
    pub fn new(
        backend: Arc<dyn KeystoreBackend>,
        gate: Arc<AuthGate>,
        master: Arc<MasterKeyManager>,
        namespace: Namespace,
    ) -> Self {
        SecureRecordStore {
            backend,
            gate,
            master,
            namespace,
            index_lock: Mutex::new(()),
            rotation: RwLock::new(()),
        }
    }

    /// Wires gate, master key manager and store from `config`.
    pub fn open(
        backend: Arc<dyn KeystoreBackend>,
        authenticator: Arc<dyn DeviceAuthenticator>,
        config: &VaultConfig,
    ) -> Result<Self, StorageError> {
        let namespace = Namespace::new(&config.namespace)?;
        let gate = Arc::new(AuthGate::new(
            authenticator,
            Duration::from_secs(config.auth_validity_secs),
        ));
        let master = Arc::new(MasterKeyManager::new(backend.clone(), gate.clone(), &namespace));
        Ok(Self::new(backend, gate, master, namespace))
    }

    /// In-memory store with no device authentication.
    pub fn in_memory() -> Self {
        let backend: Arc<dyn KeystoreBackend> = Arc::new(crate::keystore::MemoryKeystore::new());
        let gate = Arc::new(AuthGate::new(Arc::new(AlwaysAllow), Duration::from_secs(30)));
        let namespace = Namespace(VaultConfig::DEFAULT_NAMESPACE.to_string());
        let master = Arc::new(MasterKeyManager::new(backend.clone(), gate.clone(), &namespace));
        Self::new(backend, gate, master, namespace)
    }

    pub fn master_key_manager(&self) -> &Arc<MasterKeyManager> {
        &self.master
    }

    pub fn put(&self, key: &str, value: &[u8], opts: PutOptions) -> Result<(), StorageError> {
        check_user_key(key)?;
        let _guard = self.read_guard()?;

        let entry = self.build_entry(value, opts)?;
        self.write_indexed(key, entry)
    }

    /// Seals `secret` and lets `build` embed the resulting record in the value
    /// that is stored under `key`, all under one rotation guard.
    pub fn put_sealed<F>(&self, key: &str, secret: &[u8], opts: PutOptions, build: F) -> Result<(), StorageError>
    where
        F: FnOnce(EncryptedRecord) -> Result<Vec<u8>, StorageError>,
    {
        check_user_key(key)?;
        let _guard = self.read_guard()?;

        let master = self.master.get_or_create()?;
        let record = cipher::encrypt(master.as_bytes(), secret)?;
        let value = Zeroizing::new(build(record)?);

        let entry = self.build_entry(&value, opts)?;
        self.write_indexed(key, entry)
    }

    pub fn get(&self, key: &str) -> Result<Option<Zeroizing<Vec<u8>>>, StorageError> {
        self.get_with(key, &CancelToken::new())
    }

    /// Like `get`; a cancelled device-auth prompt returns `Auth(Cancelled)`
    /// and leaves the store untouched.
    pub fn get_with(&self, key: &str, cancel: &CancelToken) -> Result<Option<Zeroizing<Vec<u8>>>, StorageError> {
        check_user_key(key)?;
        let _guard = self.read_guard()?;
        Ok(self.read_entry(key, cancel)?.map(|(value, _)| value))
    }

    /// Reads the value under `key`, lets `extract` pull a sealed record out of
    /// it and returns the extracted value with the unsealed secret.
    pub fn get_sealed<T, F>(
        &self,
        key: &str,
        cancel: &CancelToken,
        extract: F,
    ) -> Result<Option<(T, Zeroizing<Vec<u8>>)>, StorageError>
    where
        F: FnOnce(&[u8]) -> Result<(T, EncryptedRecord), StorageError>,
    {
        self.open_sealed(key, cancel, extract, cipher::decrypt)
    }

    /// Like `get_sealed` for secrets that must be non-empty UTF-8 text. Any
    /// other payload is reported as `Decrypt`.
    pub fn get_sealed_text<T, F>(
        &self,
        key: &str,
        cancel: &CancelToken,
        extract: F,
    ) -> Result<Option<(T, Zeroizing<String>)>, StorageError>
    where
        F: FnOnce(&[u8]) -> Result<(T, EncryptedRecord), StorageError>,
    {
        self.open_sealed(key, cancel, extract, cipher::decrypt_text)
    }

    pub fn seal(&self, secret: &[u8]) -> Result<EncryptedRecord, StorageError> {
        let _guard = self.read_guard()?;
        let master = self.master.get_or_create()?;
        Ok(cipher::encrypt(master.as_bytes(), secret)?)
    }

    /// `label` names the record in errors and logs.
    pub fn unseal(&self, label: &str, record: &EncryptedRecord) -> Result<Zeroizing<Vec<u8>>, StorageError> {
        let _guard = self.read_guard()?;
        self.open_record(label, record, &CancelToken::new(), false, cipher::decrypt)
    }

    pub fn delete(&self, key: &str) -> Result<(), StorageError> {
        check_user_key(key)?;
        let _guard = self.read_guard()?;

        // Unlist before removing: a stored entry is never missing from `keys`
        let mut was_listed = false;
        self.update_index(|index| {
            was_listed = index.remove(key);
            was_listed
        })?;

        if let Err(e) = self.backend.remove(&self.namespace.scoped(key)) {
            if was_listed {
                if let Err(restore_err) = self.update_index(|index| index.insert(key.to_string())) {
                    log::error!("Failed to relist record {} after removal failure: {}", key, restore_err);
                }
            }
            return Err(e);
        }

        log::debug!("Deleted record {}", key);
        Ok(())
    }

    pub fn exists(&self, key: &str) -> Result<bool, StorageError> {
        check_user_key(key)?;
        self.backend.contains(&self.namespace.scoped(key))
    }

    /// Keys written through this store that start with `prefix`, sorted.
    pub fn keys(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let _index_guard = self.lock_index()?;
        Ok(self
            .read_index()?
            .into_iter()
            .filter(|key| key.starts_with(prefix))
            .collect())
    }

    /// Re-encrypts every envelope record, including records nested in plain
    /// JSON values, under `new_key`. All-or-nothing.
    pub fn rotate_master_key(&self, new_key: MasterKey) -> Result<RotationReport, StorageError> {
        let _guard = self
            .rotation
            .write()
            .map_err(|_| StorageError::Unavailable("rotation lock poisoned".to_string()))?;

        self.master
            .rotate(new_key, &CancelToken::new(), |old, new| self.stage_reencryption(old, new))
    }

    /// See `MasterKeyManager::destroy`.
    pub fn destroy_master_key(&self) -> Result<(), StorageError> {
        let _guard = self
            .rotation
            .write()
            .map_err(|_| StorageError::Unavailable("rotation lock poisoned".to_string()))?;
        self.master.destroy()
    }

    /// Forgets the unlocked master key and the last device-auth success.
    pub fn lock(&self) {
        self.master.lock();
        self.gate.lock();
    }

    fn build_entry(&self, value: &[u8], opts: PutOptions) -> Result<StoredEntry, StorageError> {
        let blob = if opts.encrypt {
            let master = self.master.get_or_create()?;
            let record = cipher::encrypt(master.as_bytes(), value)?;
            record
                .to_json()
                .map_err(|e| StorageError::InvalidFormat(e.to_string()))?
        } else {
            value.to_vec()
        };

        Ok(StoredEntry {
            require_device_auth: opts.require_device_auth,
            encrypted: opts.encrypt,
            blob,
        })
    }

    fn write_indexed(&self, key: &str, entry: StoredEntry) -> Result<(), StorageError> {
        let scoped = self.namespace.scoped(key);
        let prior = self.backend.read(&scoped)?;
        let encrypted = entry.encrypted;

        self.backend.write(&scoped, entry)?;
        if let Err(e) = self.update_index(|index| index.insert(key.to_string())) {
            let restored = match prior {
                Some(prior) => self.backend.write(&scoped, prior),
                None => self.backend.remove(&scoped),
            };
            if let Err(restore_err) = restored {
                log::error!("Failed to restore record {} after index failure: {}", key, restore_err);
            }
            return Err(e);
        }

        log::debug!("Stored record {} (encrypted: {})", key, encrypted);
        Ok(())
    }

    fn open_sealed<T, R, F, O>(
        &self,
        key: &str,
        cancel: &CancelToken,
        extract: F,
        open: O,
    ) -> Result<Option<(T, R)>, StorageError>
    where
        F: FnOnce(&[u8]) -> Result<(T, EncryptedRecord), StorageError>,
        O: FnOnce(&[u8], &EncryptedRecord) -> Result<R, DecryptError>,
    {
        check_user_key(key)?;
        let _guard = self.read_guard()?;

        let (value, authorized) = match self.read_entry(key, cancel)? {
            Some(read) => read,
            None => return Ok(None),
        };
        let (extracted, record) = extract(&value)?;
        let secret = self.open_record(key, &record, cancel, authorized, open)?;
        Ok(Some((extracted, secret)))
    }

    /// Returns the plaintext value and whether this read already passed the
    /// device-auth gate. One gated read prompts at most once.
    fn read_entry(
        &self,
        key: &str,
        cancel: &CancelToken,
    ) -> Result<Option<(Zeroizing<Vec<u8>>, bool)>, StorageError> {
        let entry = match self.backend.read(&self.namespace.scoped(key))? {
            Some(entry) => entry,
            None => return Ok(None),
        };

        let authorized = entry.require_device_auth;
        if authorized {
            self.gate.authorize(&format!("read {}", key), cancel)?;
        }

        if !entry.encrypted {
            return Ok(Some((Zeroizing::new(entry.blob.clone()), authorized)));
        }

        let record = EncryptedRecord::from_json(&entry.blob).map_err(|source| StorageError::Decrypt {
            key: key.to_string(),
            source,
        })?;
        let value = self.open_record(key, &record, cancel, authorized, cipher::decrypt)?;
        Ok(Some((value, authorized)))
    }

    fn open_record<R, O>(
        &self,
        label: &str,
        record: &EncryptedRecord,
        cancel: &CancelToken,
        authorized: bool,
        open: O,
    ) -> Result<R, StorageError>
    where
        O: FnOnce(&[u8], &EncryptedRecord) -> Result<R, DecryptError>,
    {
        let master = if authorized {
            self.master.get_preauthorized(cancel)?
        } else {
            self.master.get(cancel)?
        };
        let master = match master {
            Some(master) => master,
            None => {
                log::error!("Record {} is encrypted but no master key exists", label);
                return Err(StorageError::Decrypt {
                    key: label.to_string(),
                    source: DecryptError::InvalidKeyOrCorruptData,
                });
            }
        };

        open(&master.as_bytes()[..], record).map_err(|source| StorageError::Decrypt {
            key: label.to_string(),
            source,
        })
    }

    fn stage_reencryption(
        &self,
        old: &MasterKey,
        new: &MasterKey,
    ) -> Result<Vec<(String, StoredEntry)>, StorageError> {
        let _index_guard = self.lock_index()?;
        let mut staged = Vec::new();

        for key in self.read_index()? {
            let scoped = self.namespace.scoped(&key);
            let entry = match self.backend.read(&scoped)? {
                Some(entry) => entry,
                None => continue,
            };

            if entry.encrypted {
                let record = EncryptedRecord::from_json(&entry.blob).map_err(|source| {
                    StorageError::Decrypt {
                        key: key.clone(),
                        source,
                    }
                })?;
                let resealed = reseal(&key, &record, old, new)?;
                staged.push((
                    scoped,
                    StoredEntry {
                        require_device_auth: entry.require_device_auth,
                        encrypted: true,
                        blob: resealed
                            .to_json()
                            .map_err(|e| StorageError::InvalidFormat(e.to_string()))?,
                    },
                ));
                continue;
            }

            let mut value: Value = match serde_json::from_slice(&entry.blob) {
                Ok(value) => value,
                Err(_) => continue,
            };
            if reseal_nested(&key, &mut value, old, new)? {
                let blob = serde_json::to_vec(&value)
                    .map_err(|e| StorageError::InvalidFormat(e.to_string()))?;
                staged.push((
                    scoped,
                    StoredEntry {
                        require_device_auth: entry.require_device_auth,
                        encrypted: false,
                        blob,
                    },
                ));
            }
        }

        Ok(staged)
    }

    fn read_guard(&self) -> Result<RwLockReadGuard<'_, ()>, StorageError> {
        self.rotation
            .read()
            .map_err(|_| StorageError::Unavailable("rotation lock poisoned".to_string()))
    }

    fn lock_index(&self) -> Result<std::sync::MutexGuard<'_, ()>, StorageError> {
        self.index_lock
            .lock()
            .map_err(|_| StorageError::Unavailable("index lock poisoned".to_string()))
    }

    fn read_index(&self) -> Result<BTreeSet<String>, StorageError> {
        match self.backend.read(&self.namespace.scoped(INDEX_KEY))? {
            Some(entry) => serde_json::from_slice(&entry.blob)
                .map_err(|e| StorageError::InvalidFormat(format!("record index: {}", e))),
            None => Ok(BTreeSet::new()),
        }
    }

    fn update_index<F>(&self, change: F) -> Result<(), StorageError>
    where
        F: FnOnce(&mut BTreeSet<String>) -> bool,
    {
        let _index_guard = self.lock_index()?;
        let mut index = self.read_index()?;
        if !change(&mut index) {
            return Ok(());
        }

        let blob = serde_json::to_vec(&index).map_err(|e| StorageError::InvalidFormat(e.to_string()))?;
        self.backend.write(
            &self.namespace.scoped(INDEX_KEY),
            StoredEntry {
                require_device_auth: false,
                encrypted: false,
                blob,
            },
        )
    }
}

impl fmt::Debug for SecureRecordStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecureRecordStore")
            .field("namespace", &self.namespace)
            .finish()
    }
}

fn check_user_key(key: &str) -> Result<(), StorageError> {
    validate_key(key)?;
    if key == MASTER_KEY_NAME || key == INDEX_KEY || key.starts_with("__") {
        return Err(StorageError::ReservedKey(key.to_string()));
    }
    Ok(())
}

fn reseal(
    key: &str,
    record: &EncryptedRecord,
    old: &MasterKey,
    new: &MasterKey,
) -> Result<EncryptedRecord, StorageError> {
    let plaintext = cipher::decrypt(old.as_bytes(), record).map_err(|source| StorageError::Decrypt {
        key: key.to_string(),
        source,
    })?;
    Ok(cipher::encrypt(new.as_bytes(), &plaintext)?)
}

/// Re-encrypts every JSON object in `value` that parses as an
/// `EncryptedRecord`. Returns whether anything changed.
fn reseal_nested(key: &str, value: &mut Value, old: &MasterKey, new: &MasterKey) -> Result<bool, StorageError> {
    if let Some(record) = as_record(value) {
        let resealed = reseal(key, &record, old, new)?;
        *value = serde_json::to_value(&resealed).map_err(|e| StorageError::InvalidFormat(e.to_string()))?;
        return Ok(true);
    }

    match value {
        Value::Object(map) => {
            let mut changed = false;
            for child in map.values_mut() {
                changed |= reseal_nested(key, child, old, new)?;
            }
            Ok(changed)
        }
        Value::Array(items) => {
            let mut changed = false;
            for child in items.iter_mut() {
                changed |= reseal_nested(key, child, old, new)?;
            }
            Ok(changed)
        }
        _ => Ok(false),
    }
}

fn as_record(value: &Value) -> Option<EncryptedRecord> {
    let map = value.as_object()?;
    if !(map.contains_key("ciphertext") && map.contains_key("mac")) {
        return None;
    }
    serde_json::from_value(value.clone()).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keystore::MemoryKeystore;

    fn store_with_backend() -> (SecureRecordStore, Arc<MemoryKeystore>) {
        let backend = Arc::new(MemoryKeystore::new());
        let store = SecureRecordStore::open(backend.clone(), Arc::new(AlwaysAllow), &VaultConfig::default())
            .unwrap();
        (store, backend)
    }

    #[test]
    fn plain_values_round_trip() {
        let store = SecureRecordStore::in_memory();
        store.put("profile_1", b"hello", PutOptions::plain()).unwrap();
        assert_eq!(store.get("profile_1").unwrap().unwrap().as_slice(), b"hello");
        assert!(store.exists("profile_1").unwrap());
    }

    #[test]
    fn encrypted_values_are_stored_as_records() {
        let (store, backend) = store_with_backend();
        store.put("session_main", b"token-123", PutOptions::encrypted()).unwrap();

        let raw = backend.read("wallet_keystore.session_main").unwrap().unwrap();
        assert!(raw.encrypted);
        let record = EncryptedRecord::from_json(&raw.blob).unwrap();
        assert_eq!(record.version, "1.0");
        assert!(!raw.blob.windows(9).any(|w| w == b"token-123"));

        assert_eq!(store.get("session_main").unwrap().unwrap().as_slice(), b"token-123");
    }

    #[test]
    fn missing_key_is_none() {
        let store = SecureRecordStore::in_memory();
        assert!(store.get("nothing_here").unwrap().is_none());
        assert!(!store.exists("nothing_here").unwrap());
    }

    #[test]
    fn corrupt_encrypted_entry_is_an_error_not_none() {
        let (store, backend) = store_with_backend();
        store.put("session_main", b"token", PutOptions::encrypted()).unwrap();

        let mut raw = backend.read("wallet_keystore.session_main").unwrap().unwrap();
        let mut record = EncryptedRecord::from_json(&raw.blob).unwrap();
        record.ciphertext[0] ^= 0xff;
        raw.blob = record.to_json().unwrap();
        backend.write("wallet_keystore.session_main", raw).unwrap();

        match store.get("session_main") {
            Err(StorageError::Decrypt { key, source }) => {
                assert_eq!(key, "session_main");
                assert_eq!(source, DecryptError::InvalidKeyOrCorruptData);
            }
            other => panic!("expected decrypt error, got {:?}", other.map(|v| v.is_some())),
        }
    }

    #[test]
    fn reserved_keys_are_refused() {
        let store = SecureRecordStore::in_memory();
        assert!(matches!(
            store.put(MASTER_KEY_NAME, b"x", PutOptions::plain()),
            Err(StorageError::ReservedKey(_))
        ));
        assert!(matches!(store.get(INDEX_KEY), Err(StorageError::ReservedKey(_))));
        assert!(matches!(store.delete("__anything"), Err(StorageError::ReservedKey(_))));
    }

    #[test]
    fn index_tracks_puts_and_deletes() {
        let store = SecureRecordStore::in_memory();
        store.put("wallet_b", b"1", PutOptions::plain()).unwrap();
        store.put("wallet_a", b"2", PutOptions::encrypted()).unwrap();
        store.put("session_x", b"3", PutOptions::plain()).unwrap();

        assert_eq!(store.keys("wallet_").unwrap(), vec!["wallet_a", "wallet_b"]);
        store.delete("wallet_a").unwrap();
        assert_eq!(store.keys("wallet_").unwrap(), vec!["wallet_b"]);
        assert_eq!(store.keys("").unwrap().len(), 2);
    }

    #[test]
    fn overwrite_replaces_the_whole_record() {
        let store = SecureRecordStore::in_memory();
        store.put("session_main", b"first", PutOptions::encrypted()).unwrap();
        store.put("session_main", b"second", PutOptions::plain()).unwrap();
        assert_eq!(store.get("session_main").unwrap().unwrap().as_slice(), b"second");
    }

    #[test]
    fn seal_and_unseal_use_the_managed_key() {
        let store = SecureRecordStore::in_memory();
        let record = store.seal(b"secret words").unwrap();
        assert_eq!(store.unseal("label", &record).unwrap().as_slice(), b"secret words");
    }

    #[test]
    fn destroyed_master_key_makes_records_unreadable() {
        let store = SecureRecordStore::in_memory();
        store.put("session_main", b"token", PutOptions::encrypted()).unwrap();
        store.destroy_master_key().unwrap();

        assert!(matches!(
            store.get("session_main"),
            Err(StorageError::Decrypt { .. })
        ));
    }

    #[test]
    fn rotation_reencrypts_top_level_and_nested_records() {
        let (store, backend) = store_with_backend();
        store.put("session_main", b"token", PutOptions::encrypted()).unwrap();
        store
            .put_sealed("wallet_abc", b"nested secret", PutOptions::plain(), |record| {
                serde_json::to_vec(&serde_json::json!({ "address": "abc", "mnemonic": record }))
                    .map_err(|e| StorageError::InvalidFormat(e.to_string()))
            })
            .unwrap();
        store.put("profile_plain", b"not json at all", PutOptions::plain()).unwrap();

        let before = backend.read("wallet_keystore.session_main").unwrap().unwrap();
        let report = store
            .rotate_master_key(MasterKey::from_bytes([42u8; 32]))
            .unwrap();
        assert_eq!(report.records_migrated, 2);

        let after = backend.read("wallet_keystore.session_main").unwrap().unwrap();
        assert_ne!(before.blob, after.blob);

        store.lock();
        assert_eq!(store.get("session_main").unwrap().unwrap().as_slice(), b"token");
        let (address, secret) = store
            .get_sealed("wallet_abc", &CancelToken::new(), |value| {
                let json: Value = serde_json::from_slice(value)
                    .map_err(|e| StorageError::InvalidFormat(e.to_string()))?;
                let record = serde_json::from_value(json["mnemonic"].clone())
                    .map_err(|e| StorageError::InvalidFormat(e.to_string()))?;
                Ok((json["address"].as_str().unwrap_or_default().to_string(), record))
            })
            .unwrap()
            .unwrap();
        assert_eq!(address, "abc");
        assert_eq!(secret.as_slice(), b"nested secret");
        assert_eq!(store.get("profile_plain").unwrap().unwrap().as_slice(), b"not json at all");
    }

    /// Memory keystore whose writes to one key or whose removals can be made to fail.
    struct FailingKeystore {
        inner: MemoryKeystore,
        failing_write: Mutex<Option<String>>,
        fail_removes: std::sync::atomic::AtomicBool,
    }

    impl FailingKeystore {
        fn new() -> Self {
            FailingKeystore {
                inner: MemoryKeystore::new(),
                failing_write: Mutex::new(None),
                fail_removes: std::sync::atomic::AtomicBool::new(false),
            }
        }
    }

    impl KeystoreBackend for FailingKeystore {
        fn read(&self, key: &str) -> Result<Option<StoredEntry>, StorageError> {
            self.inner.read(key)
        }

        fn write(&self, key: &str, entry: StoredEntry) -> Result<(), StorageError> {
            if self.failing_write.lock().unwrap().as_deref() == Some(key) {
                return Err(StorageError::Unavailable("write refused".to_string()));
            }
            self.inner.write(key, entry)
        }

        fn insert_if_absent(
            &self,
            key: &str,
            entry: StoredEntry,
        ) -> Result<crate::keystore::InsertOutcome, StorageError> {
            self.inner.insert_if_absent(key, entry)
        }

        fn remove(&self, key: &str) -> Result<(), StorageError> {
            if self.fail_removes.load(std::sync::atomic::Ordering::SeqCst) {
                return Err(StorageError::Unavailable("remove refused".to_string()));
            }
            self.inner.remove(key)
        }
    }

    fn failing_store() -> (SecureRecordStore, Arc<FailingKeystore>) {
        let backend = Arc::new(FailingKeystore::new());
        let store = SecureRecordStore::open(backend.clone(), Arc::new(AlwaysAllow), &VaultConfig::default())
            .unwrap();
        (store, backend)
    }

    #[test]
    fn failed_index_write_keeps_the_deleted_record_listed() {
        let (store, backend) = failing_store();
        store.put("session_a", b"alpha", PutOptions::encrypted()).unwrap();

        *backend.failing_write.lock().unwrap() = Some("wallet_keystore.__record_index".to_string());
        assert!(matches!(store.delete("session_a"), Err(StorageError::Unavailable(_))));

        *backend.failing_write.lock().unwrap() = None;
        assert_eq!(store.keys("session_").unwrap(), vec!["session_a"]);
        assert_eq!(store.get("session_a").unwrap().unwrap().as_slice(), b"alpha");
    }

    #[test]
    fn failed_removal_relists_the_record() {
        let (store, backend) = failing_store();
        store.put("session_a", b"alpha", PutOptions::encrypted()).unwrap();

        backend.fail_removes.store(true, std::sync::atomic::Ordering::SeqCst);
        assert!(store.delete("session_a").is_err());

        backend.fail_removes.store(false, std::sync::atomic::Ordering::SeqCst);
        assert_eq!(store.keys("session_").unwrap(), vec!["session_a"]);
        store.delete("session_a").unwrap();
        assert!(store.keys("session_").unwrap().is_empty());
        assert!(!store.exists("session_a").unwrap());
    }

    struct SlowAuthenticator {
        prompts: std::sync::atomic::AtomicUsize,
    }

    impl DeviceAuthenticator for SlowAuthenticator {
        fn authenticate(&self, _reason: &str, _cancel: &CancelToken) -> Result<(), AuthError> {
            self.prompts.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(200));
            Ok(())
        }
    }

    fn gated_reader(backend: Arc<MemoryKeystore>) -> (Arc<SecureRecordStore>, Arc<SlowAuthenticator>) {
        let authenticator = Arc::new(SlowAuthenticator {
            prompts: std::sync::atomic::AtomicUsize::new(0),
        });
        let config = VaultConfig {
            auth_validity_secs: 0,
            ..VaultConfig::default()
        };
        let store = SecureRecordStore::open(backend, authenticator.clone(), &config).unwrap();
        (Arc::new(store), authenticator)
    }

    #[test]
    fn one_gated_read_prompts_once() {
        let (writer, backend) = store_with_backend();
        writer.put("session_secret", b"gated", PutOptions::secret()).unwrap();

        let (reader, authenticator) = gated_reader(backend);
        assert_eq!(reader.get("session_secret").unwrap().unwrap().as_slice(), b"gated");
        assert_eq!(authenticator.prompts.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[test]
    fn parallel_gated_reads_share_one_prompt_without_a_validity_window() {
        let (writer, backend) = store_with_backend();
        writer.put("session_secret", b"gated", PutOptions::secret()).unwrap();

        let (reader, authenticator) = gated_reader(backend);
        let barrier = Arc::new(std::sync::Barrier::new(8));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let reader = reader.clone();
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    reader.get("session_secret")
                })
            })
            .collect();
        for handle in handles {
            assert_eq!(handle.join().unwrap().unwrap().unwrap().as_slice(), b"gated");
        }

        assert_eq!(authenticator.prompts.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[test]
    fn text_secrets_reject_non_utf8_payloads() {
        let store = SecureRecordStore::in_memory();
        store
            .put_sealed("wallet_abc", &[0xff, 0xfe, 0x00], PutOptions::plain(), |record| {
                serde_json::to_vec(&record).map_err(|e| StorageError::InvalidFormat(e.to_string()))
            })
            .unwrap();

        let result = store.get_sealed_text("wallet_abc", &CancelToken::new(), |value| {
            let record = serde_json::from_slice(value)
                .map_err(|e| StorageError::InvalidFormat(e.to_string()))?;
            Ok(((), record))
        });
        match result {
            Err(StorageError::Decrypt { key, source }) => {
                assert_eq!(key, "wallet_abc");
                assert_eq!(source, DecryptError::InvalidKeyOrCorruptData);
            }
            other => panic!("expected decrypt error, got {:?}", other.map(|v| v.is_some())),
        }
    }

    #[test]
    fn retryable_classification() {
        assert!(StorageError::Auth(AuthError::Cancelled).is_retryable());
        assert!(!StorageError::MissingMasterKey.is_retryable());
        assert!(!StorageError::Decrypt {
            key: "k".to_string(),
            source: DecryptError::InvalidKeyOrCorruptData
        }
        .is_retryable());
    }
}
