use crate::auth::CancelToken;
use crate::cipher::EncryptedRecord;
use crate::config::{ConfigError, VaultConfig};
use crate::derivation::DerivationPath;
use crate::keystore::validate_key;
use crate::keys::{self, KeyPair, KeyPairError, Signature};
use crate::mnemonic::{self, MnemonicError, MnemonicStrength, ValidatedMnemonic, ValidationError};
use crate::storage::{PutOptions, SecureRecordStore, StorageError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use zeroize::Zeroizing;

const WALLET_PREFIX: &str = "wallet_";
pub const WALLET_FORMAT_VERSION: &str = "1.0";

pub type ChainResult<T> = Result<T, Box<dyn Error + Send + Sync>>;

/// Blockchain network client. Only balances are queried from here; signed
/// payloads are handed to `submit` by the caller.
pub trait ChainClient: Send + Sync {
    fn get_balance(&self, address: &str) -> ChainResult<u64>;

    fn submit(&self, signed_payload: &[u8]) -> ChainResult<String>;
}

#[derive(Debug)]
pub enum WalletError {
    /// The phrase failed validation; errors are returned unchanged.
    Validation(Vec<ValidationError>),
    Mnemonic(MnemonicError),
    KeyPair(KeyPairError),
    Storage(StorageError),
    Config(ConfigError),
    /// A create or recover is already in progress.
    Busy,
    /// The current wallet was deleted; this manager accepts no new wallet.
    Deleted,
    NotFound(String),
    /// The stored record for an address is unusable.
    InvalidRecord(String),
    ChainUnavailable,
    Chain(String),
}

impl fmt::Display for WalletError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            WalletError::Validation(errors) => {
                write!(f, "Invalid recovery phrase: ")?;
                for (i, e) in errors.iter().enumerate() {
                    if i > 0 {
                        write!(f, "; ")?;
                    }
                    write!(f, "{}", e)?;
                }
                Ok(())
            }
            WalletError::Mnemonic(e) => write!(f, "Mnemonic error: {}", e),
            WalletError::KeyPair(e) => write!(f, "Key error: {}", e),
            WalletError::Storage(e) => write!(f, "Storage error: {}", e),
            WalletError::Config(e) => write!(f, "{}", e),
            WalletError::Busy => write!(f, "Another wallet operation is in progress"),
            WalletError::Deleted => write!(f, "Wallet was deleted; start a new session to create or recover one"),
            WalletError::NotFound(address) => write!(f, "No wallet stored for {}", address),
            WalletError::InvalidRecord(address) => {
                write!(f, "Stored wallet record for {} is invalid", address)
            }
            WalletError::ChainUnavailable => write!(f, "No chain client configured"),
            WalletError::Chain(reason) => write!(f, "Chain client error: {}", reason),
        }
    }
}

impl Error for WalletError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            WalletError::Mnemonic(e) => Some(e),
            WalletError::KeyPair(e) => Some(e),
            WalletError::Storage(e) => Some(e),
            WalletError::Config(e) => Some(e),
            _ => None,
        }
    }
}

impl From<MnemonicError> for WalletError {
    fn from(err: MnemonicError) -> Self {
        WalletError::Mnemonic(err)
    }
}

impl From<KeyPairError> for WalletError {
    fn from(err: KeyPairError) -> Self {
        WalletError::KeyPair(err)
    }
}

impl From<StorageError> for WalletError {
    fn from(err: StorageError) -> Self {
        WalletError::Storage(err)
    }
}

impl From<ConfigError> for WalletError {
    fn from(err: ConfigError) -> Self {
        WalletError::Config(err)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WalletState {
    NoWallet,
    Creating,
    Recovering,
    Ready { address: String },
    Deleted,
}

/// Persisted under `wallet_<address>`. The mnemonic is only ever stored
/// sealed under the master key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalletRecord {
    pub address: String,
    pub public_key: String,
    pub mnemonic: EncryptedRecord,
    pub created_at: DateTime<Utc>,
    pub format_version: String,
}

/// Result of creating or recovering a wallet.
#[derive(Clone)]
pub struct WalletInfo {
    pub address: String,
    pub public_key: String,
    /// Shown to the user once for backup.
    pub mnemonic: Zeroizing<String>,
    pub created_at: DateTime<Utc>,
    /// False when the wallet could not be saved. The wallet is usable for
    /// this session only and the user must be told.
    pub persisted: bool,
    pub persist_error: Option<String>,
}

impl fmt::Debug for WalletInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WalletInfo")
            .field("address", &self.address)
            .field("public_key", &self.public_key)
            .field("created_at", &self.created_at)
            .field("persisted", &self.persisted)
            .finish()
    }
}

pub struct WalletManager {
    store: Arc<SecureRecordStore>,
    derivation_path: DerivationPath,
    default_strength: MnemonicStrength,
    chain: Option<Arc<dyn ChainClient>>,
    state: Mutex<WalletState>,
}

impl WalletManager {
    pub fn new(store: Arc<SecureRecordStore>, config: &VaultConfig) -> Result<Self, WalletError> {
        let derivation_path = config.derivation_path()?;
        let default_strength = config.strength()?;

        let initial = match store.keys(WALLET_PREFIX)?.into_iter().next() {
            Some(key) => WalletState::Ready {
                address: key[WALLET_PREFIX.len()..].to_string(),
            },
            None => WalletState::NoWallet,
        };

        Ok(WalletManager {
            store,
            derivation_path,
            default_strength,
            chain: None,
            state: Mutex::new(initial),
        })
    }

    pub fn with_chain_client(mut self, chain: Arc<dyn ChainClient>) -> Self {
        self.chain = Some(chain);
        self
    }

    pub fn state(&self) -> WalletState {
        self.lock_state().clone()
    }

    pub fn create_default_wallet(&self) -> Result<WalletInfo, WalletError> {
        self.create_wallet(self.default_strength)
    }

    pub fn create_wallet(&self, strength: MnemonicStrength) -> Result<WalletInfo, WalletError> {
        self.transition(WalletState::Creating, || {
            let mnemonic = mnemonic::generate(strength)?;
            let info = self.derive_and_persist(&mnemonic)?;
            log::info!("Created wallet {}", info.address);
            Ok(info)
        })
    }

    pub fn recover_wallet(&self, phrase: &str) -> Result<WalletInfo, WalletError> {
        self.transition(WalletState::Recovering, || {
            let mnemonic = mnemonic::validate(phrase).map_err(|errors| {
                log::debug!("Recovery phrase rejected with {} errors", errors.len());
                WalletError::Validation(errors)
            })?;
            let info = self.derive_and_persist(&mnemonic)?;
            log::info!("Recovered wallet {}", info.address);
            Ok(info)
        })
    }

    /// Addresses that could never name a stored record report `false`.
    pub fn has_stored_wallet(&self, address: &str) -> Result<bool, WalletError> {
        let key = wallet_key(address);
        if validate_key(&key).is_err() {
            return Ok(false);
        }
        Ok(self.store.exists(&key)?)
    }

    /// Removes the wallet record. The master key is left alone.
    pub fn delete_wallet(&self, address: &str) -> Result<(), WalletError> {
        let key = wallet_key(address);
        if !self.store.exists(&key)? {
            return Err(WalletError::NotFound(address.to_string()));
        }
        self.store.delete(&key)?;

        let mut state = self.lock_state();
        if matches!(&*state, WalletState::Ready { address: current } if current == address) {
            *state = WalletState::Deleted;
        }
        log::info!("Deleted wallet {}", address);
        Ok(())
    }

    pub fn list_wallets(&self) -> Result<Vec<String>, WalletError> {
        Ok(self
            .store
            .keys(WALLET_PREFIX)?
            .into_iter()
            .map(|key| key[WALLET_PREFIX.len()..].to_string())
            .collect())
    }

    pub fn sign_message(&self, address: &str, message: &[u8]) -> Result<Signature, WalletError> {
        self.sign_message_with(address, message, &CancelToken::new())
    }

    /// Re-derives the keypair from the stored mnemonic, signs, and drops the
    /// keypair before returning.
    pub fn sign_message_with(
        &self,
        address: &str,
        message: &[u8],
        cancel: &CancelToken,
    ) -> Result<Signature, WalletError> {
        let keypair = self.load_keypair(address, cancel)?;
        let signature = keypair.sign(message)?;
        drop(keypair);

        log::debug!("Signed {} byte message with {}", message.len(), address);
        Ok(signature)
    }

    pub fn verify_signature(
        &self,
        public_key_hex: &str,
        message: &[u8],
        signature: &Signature,
    ) -> Result<bool, WalletError> {
        Ok(keys::verify_signature(public_key_hex, message, signature)?)
    }

    /// The stored phrase, for a backup screen. Gated like every other read of
    /// the wallet record.
    pub fn reveal_mnemonic(&self, address: &str, cancel: &CancelToken) -> Result<Zeroizing<String>, WalletError> {
        let (_, mnemonic) = self.load_mnemonic(address, cancel)?;
        Ok(mnemonic.phrase())
    }

    pub fn extended_public_key(&self, address: &str, cancel: &CancelToken) -> Result<String, WalletError> {
        Ok(self.load_keypair(address, cancel)?.extended_public_key())
    }

    pub fn get_balance(&self, address: &str) -> Result<u64, WalletError> {
        let chain = self.chain.as_ref().ok_or(WalletError::ChainUnavailable)?;
        chain
            .get_balance(address)
            .map_err(|e| WalletError::Chain(e.to_string()))
    }

    fn transition<F>(&self, pending: WalletState, op: F) -> Result<WalletInfo, WalletError>
    where
        F: FnOnce() -> Result<WalletInfo, WalletError>,
    {
        let previous = {
            let mut state = self.lock_state();
            match *state {
                WalletState::Creating | WalletState::Recovering => return Err(WalletError::Busy),
                WalletState::Deleted => return Err(WalletError::Deleted),
                _ => {}
            }
            std::mem::replace(&mut *state, pending)
        };

        let result = op();

        let mut state = self.lock_state();
        *state = match &result {
            Ok(info) => WalletState::Ready {
                address: info.address.clone(),
            },
            Err(_) => previous,
        };
        result
    }

    fn derive_and_persist(&self, mnemonic: &ValidatedMnemonic) -> Result<WalletInfo, WalletError> {
        let keypair = self.derive_keypair(mnemonic)?;
        let phrase = mnemonic.phrase();
        let created_at = Utc::now();

        let mut info = WalletInfo {
            address: keypair.address().to_string(),
            public_key: keypair.public_key_hex(),
            mnemonic: phrase,
            created_at,
            persisted: true,
            persist_error: None,
        };

        if let Err(e) = self.persist(&info) {
            log::warn!("Wallet {} was not persisted: {}", info.address, e);
            info.persisted = false;
            info.persist_error = Some(e.to_string());
        }
        Ok(info)
    }

    fn persist(&self, info: &WalletInfo) -> Result<(), StorageError> {
        let opts = PutOptions {
            require_device_auth: true,
            encrypt: false,
        };

        self.store.put_sealed(
            &wallet_key(&info.address),
            info.mnemonic.as_bytes(),
            opts,
            |sealed| {
                let record = WalletRecord {
                    address: info.address.clone(),
                    public_key: info.public_key.clone(),
                    mnemonic: sealed,
                    created_at: info.created_at,
                    format_version: WALLET_FORMAT_VERSION.to_string(),
                };
                serde_json::to_vec(&record).map_err(|e| StorageError::InvalidFormat(e.to_string()))
            },
        )
    }

    fn derive_keypair(&self, mnemonic: &ValidatedMnemonic) -> Result<KeyPair, WalletError> {
        let seed = keys::seed_from_mnemonic(mnemonic, "");
        Ok(keys::keypair_from_seed_at(&seed, &self.derivation_path)?)
    }

    fn load_mnemonic(
        &self,
        address: &str,
        cancel: &CancelToken,
    ) -> Result<(WalletRecord, ValidatedMnemonic), WalletError> {
        let loaded = self.store.get_sealed_text(&wallet_key(address), cancel, |value| {
            let record: WalletRecord = serde_json::from_slice(value)
                .map_err(|e| StorageError::InvalidFormat(format!("wallet record: {}", e)))?;
            let sealed = record.mnemonic.clone();
            Ok((record, sealed))
        })?;
        let (record, secret) = loaded.ok_or_else(|| WalletError::NotFound(address.to_string()))?;

        if record.format_version != WALLET_FORMAT_VERSION || record.address != address {
            return Err(WalletError::InvalidRecord(address.to_string()));
        }

        let mnemonic =
            mnemonic::validate(&secret).map_err(|_| WalletError::InvalidRecord(address.to_string()))?;
        Ok((record, mnemonic))
    }

    fn load_keypair(&self, address: &str, cancel: &CancelToken) -> Result<KeyPair, WalletError> {
        let (_, mnemonic) = self.load_mnemonic(address, cancel)?;
        let keypair = self.derive_keypair(&mnemonic)?;
        if keypair.address() != address {
            log::error!("Stored mnemonic for {} derives a different address", address);
            return Err(WalletError::InvalidRecord(address.to_string()));
        }
        Ok(keypair)
    }

    fn lock_state(&self) -> MutexGuard<'_, WalletState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn wallet_key(address: &str) -> String {
    format!("{}{}", WALLET_PREFIX, address)
}
