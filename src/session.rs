//! Session and profile blobs kept next to the wallet records.

use crate::storage::{PutOptions, SecureRecordStore, StorageError};
use std::sync::Arc;
use zeroize::Zeroizing;

const SESSION_PREFIX: &str = "session_";

/// How a session blob ended up protected at rest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protection {
    Envelope,
    /// OS keystore access control only.
    Plaintext,
}

pub struct SessionStore {
    store: Arc<SecureRecordStore>,
    encrypt: bool,
}

impl SessionStore {
    /// With `encrypt` false, blobs skip envelope encryption. Each such write
    /// is logged and reported as `Protection::Plaintext`.
    pub fn new(store: Arc<SecureRecordStore>, encrypt: bool) -> Self {
        if !encrypt {
            log::warn!("Session data will be stored without envelope encryption");
        }
        SessionStore { store, encrypt }
    }

    pub fn save(&self, name: &str, data: &[u8]) -> Result<Protection, StorageError> {
        let key = session_key(name);
        if self.encrypt {
            self.store.put(&key, data, PutOptions::encrypted())?;
            Ok(Protection::Envelope)
        } else {
            log::warn!("Storing session {} without envelope encryption", name);
            self.store.put(&key, data, PutOptions::plain())?;
            Ok(Protection::Plaintext)
        }
    }

    pub fn load(&self, name: &str) -> Result<Option<Zeroizing<Vec<u8>>>, StorageError> {
        self.store.get(&session_key(name))
    }

    pub fn remove(&self, name: &str) -> Result<(), StorageError> {
        self.store.delete(&session_key(name))
    }

    pub fn names(&self) -> Result<Vec<String>, StorageError> {
        Ok(self
            .store
            .keys(SESSION_PREFIX)?
            .into_iter()
            .map(|key| key[SESSION_PREFIX.len()..].to_string())
            .collect())
    }
}

fn session_key(name: &str) -> String {
    format!("{}{}", SESSION_PREFIX, name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encrypted_sessions_round_trip() {
        let sessions = SessionStore::new(Arc::new(SecureRecordStore::in_memory()), true);
        assert_eq!(sessions.save("profile", b"{\"sign\":\"leo\"}").unwrap(), Protection::Envelope);
        assert_eq!(
            sessions.load("profile").unwrap().unwrap().as_slice(),
            b"{\"sign\":\"leo\"}"
        );
        assert_eq!(sessions.names().unwrap(), vec!["profile"]);

        sessions.remove("profile").unwrap();
        assert!(sessions.load("profile").unwrap().is_none());
    }

    #[test]
    fn disabled_encryption_is_reported() {
        let sessions = SessionStore::new(Arc::new(SecureRecordStore::in_memory()), false);
        assert_eq!(sessions.save("auth", b"token").unwrap(), Protection::Plaintext);
        assert_eq!(sessions.load("auth").unwrap().unwrap().as_slice(), b"token");
    }

    #[test]
    fn bad_session_names_are_rejected() {
        let sessions = SessionStore::new(Arc::new(SecureRecordStore::in_memory()), true);
        assert!(matches!(
            sessions.save("../x", b"token"),
            Err(StorageError::InvalidKey(_))
        ));
    }
}
