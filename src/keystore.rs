//! OS keystore seam.
//!
//! A `KeystoreBackend` maps namespaced string keys to opaque blobs plus two
//! flags. `require_device_auth` is honoured by the gate in front of the
//! backend; `encrypted` is interpreted by `SecureRecordStore` only.

use crate::storage::StorageError;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use rand::{rngs::OsRng, RngCore};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use zeroize::{Zeroize, ZeroizeOnDrop};

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct StoredEntry {
    #[zeroize(skip)]
    pub require_device_auth: bool,
    #[zeroize(skip)]
    pub encrypted: bool,
    #[serde(with = "blob_base64")]
    pub blob: Vec<u8>,
}

impl fmt::Debug for StoredEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoredEntry")
            .field("require_device_auth", &self.require_device_auth)
            .field("encrypted", &self.encrypted)
            .field("blob_len", &self.blob.len())
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    AlreadyPresent,
}

pub trait KeystoreBackend: Send + Sync {
    fn read(&self, key: &str) -> Result<Option<StoredEntry>, StorageError>;

    fn write(&self, key: &str, entry: StoredEntry) -> Result<(), StorageError>;

    /// Writes only when `key` is absent; the check and the write are one step.
    fn insert_if_absent(&self, key: &str, entry: StoredEntry) -> Result<InsertOutcome, StorageError>;

    fn remove(&self, key: &str) -> Result<(), StorageError>;

    fn contains(&self, key: &str) -> Result<bool, StorageError> {
        Ok(self.read(key)?.is_some())
    }

    /// Writes every entry or none of them. The default restores each
    /// previously written key if a later write fails.
    fn apply_batch(&self, entries: Vec<(String, StoredEntry)>) -> Result<(), StorageError> {
        let mut applied: Vec<(String, Option<StoredEntry>)> = Vec::with_capacity(entries.len());

        for (key, entry) in entries {
            let prior = match self.read(&key) {
                Ok(prior) => prior,
                Err(e) => {
                    rollback(self, applied);
                    return Err(e);
                }
            };
            if let Err(e) = self.write(&key, entry) {
                rollback(self, applied);
                return Err(e);
            }
            applied.push((key, prior));
        }

        Ok(())
    }
}

fn rollback<B: KeystoreBackend + ?Sized>(backend: &B, applied: Vec<(String, Option<StoredEntry>)>) {
    for (key, prior) in applied.into_iter().rev() {
        let restored = match prior {
            Some(entry) => backend.write(&key, entry),
            None => backend.remove(&key),
        };
        if let Err(e) = restored {
            log::error!("Failed to roll back keystore entry {}: {}", key, e);
        }
    }
}

/// Prefix applied to every key handed to the OS keystore.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Namespace(pub(crate) String);

impl Namespace {
    pub fn new(name: &str) -> Result<Self, StorageError> {
        validate_key(name)?;
        Ok(Namespace(name.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn scoped(&self, key: &str) -> String {
        format!("{}.{}", self.0, key)
    }
}

/// Keys end up in file names, so only a conservative character set is accepted.
pub fn validate_key(key: &str) -> Result<(), StorageError> {
    let valid = !key.is_empty()
        && key.len() <= 200
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.');
    if valid {
        Ok(())
    } else {
        Err(StorageError::InvalidKey(key.to_string()))
    }
}

/// In-process keystore for tests and hosts without a platform keystore.
#[derive(Default)]
pub struct MemoryKeystore {
    entries: Mutex<HashMap<String, StoredEntry>>,
}

impl MemoryKeystore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, StoredEntry>>, StorageError> {
        self.entries
            .lock()
            .map_err(|_| StorageError::Unavailable("memory keystore lock poisoned".to_string()))
    }
}

impl KeystoreBackend for MemoryKeystore {
    fn read(&self, key: &str) -> Result<Option<StoredEntry>, StorageError> {
        Ok(self.lock()?.get(key).cloned())
    }

    fn write(&self, key: &str, entry: StoredEntry) -> Result<(), StorageError> {
        self.lock()?.insert(key.to_string(), entry);
        Ok(())
    }

    fn insert_if_absent(&self, key: &str, entry: StoredEntry) -> Result<InsertOutcome, StorageError> {
        let mut entries = self.lock()?;
        if entries.contains_key(key) {
            return Ok(InsertOutcome::AlreadyPresent);
        }
        entries.insert(key.to_string(), entry);
        Ok(InsertOutcome::Inserted)
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        self.lock()?.remove(key);
        Ok(())
    }

    fn contains(&self, key: &str) -> Result<bool, StorageError> {
        Ok(self.lock()?.contains_key(key))
    }

    fn apply_batch(&self, entries: Vec<(String, StoredEntry)>) -> Result<(), StorageError> {
        let mut map = self.lock()?;
        for (key, entry) in entries {
            map.insert(key, entry);
        }
        Ok(())
    }
}

/// File-per-key keystore. Entries are written to a temporary file and
/// renamed (or, for `insert_if_absent`, hard-linked) into place, and are
/// readable by the owner only on Unix.
pub struct FileKeystore {
    storage_dir: PathBuf,
}

impl FileKeystore {
    pub fn new<P: AsRef<Path>>(storage_dir: P) -> Result<Self, StorageError> {
        let path = storage_dir.as_ref().to_path_buf();
        fs::create_dir_all(&path)?;

        Ok(FileKeystore { storage_dir: path })
    }

    pub fn storage_dir(&self) -> &Path {
        &self.storage_dir
    }

    fn get_file_path(&self, key: &str) -> Result<PathBuf, StorageError> {
        validate_key(key)?;
        Ok(self.storage_dir.join(format!("{}.entry", key)))
    }

    fn encode(entry: &StoredEntry) -> Result<Vec<u8>, StorageError> {
        serde_json::to_vec(entry).map_err(|e| StorageError::InvalidFormat(e.to_string()))
    }

    fn open_private(path: &Path) -> std::io::Result<File> {
        let mut options = OpenOptions::new();
        options.write(true).create_new(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        options.open(path)
    }

    /// Writes `entry` in full to a uniquely named temporary file next to
    /// its final location and returns that file's path.
    fn write_temp(&self, key: &str, entry: &StoredEntry) -> Result<PathBuf, StorageError> {
        let tmp_path = self
            .storage_dir
            .join(format!("{}.entry.{:016x}.tmp", key, OsRng.next_u64()));

        let mut data = Self::encode(entry)?;
        let written = Self::open_private(&tmp_path).and_then(|mut file| {
            file.write_all(&data)?;
            file.sync_all()
        });
        data.zeroize();

        if let Err(e) = written {
            let _ = fs::remove_file(&tmp_path);
            return Err(e.into());
        }
        Ok(tmp_path)
    }
}

impl KeystoreBackend for FileKeystore {
    fn read(&self, key: &str) -> Result<Option<StoredEntry>, StorageError> {
        let file_path = self.get_file_path(key)?;
        let mut file = match File::open(&file_path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let mut data = Vec::new();
        file.read_to_end(&mut data)?;

        let entry = serde_json::from_slice(&data)
            .map_err(|e| StorageError::InvalidFormat(format!("{}: {}", key, e)));
        data.zeroize();
        entry.map(Some)
    }

    fn write(&self, key: &str, entry: StoredEntry) -> Result<(), StorageError> {
        let file_path = self.get_file_path(key)?;
        let tmp_path = self.write_temp(key, &entry)?;

        if let Err(e) = fs::rename(&tmp_path, &file_path) {
            let _ = fs::remove_file(&tmp_path);
            return Err(e.into());
        }
        Ok(())
    }

    fn insert_if_absent(&self, key: &str, entry: StoredEntry) -> Result<InsertOutcome, StorageError> {
        let file_path = self.get_file_path(key)?;
        if file_path.exists() {
            return Ok(InsertOutcome::AlreadyPresent);
        }

        // Readers only ever see the complete entry: linking fails if the
        // final name already exists and never replaces it
        let tmp_path = self.write_temp(key, &entry)?;
        let linked = fs::hard_link(&tmp_path, &file_path);
        let _ = fs::remove_file(&tmp_path);

        match linked {
            Ok(()) => Ok(InsertOutcome::Inserted),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(InsertOutcome::AlreadyPresent),
            Err(e) => Err(e.into()),
        }
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        let file_path = self.get_file_path(key)?;
        match fs::remove_file(file_path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn contains(&self, key: &str) -> Result<bool, StorageError> {
        Ok(self.get_file_path(key)?.exists())
    }
}

mod blob_base64 {
    use super::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(|_| serde::de::Error::custom("invalid base64 blob"))
    }
}
