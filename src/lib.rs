//! Wallet key management and encrypted record storage.
//!
//! Recovery phrases are BIP39 mnemonics, the wallet keypair is derived from
//! them along a fixed BIP32 path, and every secret at rest is sealed with
//! envelope encryption under a single device-held master key.

pub mod auth;
pub mod cipher;
pub mod config;
pub mod derivation;
pub mod keys;
pub mod keystore;
pub mod master_key;
pub mod mnemonic;
pub mod session;
pub mod storage;
pub mod wallet;

pub use auth::{AlwaysAllow, AuthError, AuthGate, CancelToken, DeviceAuthenticator};
pub use cipher::{DecryptError, EncryptedRecord};
pub use config::{ConfigError, VaultConfig};
pub use keys::{KeyPair, Seed, Signature};
pub use keystore::{FileKeystore, KeystoreBackend, MemoryKeystore, Namespace, StoredEntry};
pub use master_key::{MasterKey, MasterKeyManager, RotationReport};
pub use mnemonic::{MnemonicStrength, ValidatedMnemonic, ValidationError, ValidationReport};
pub use session::{Protection, SessionStore};
pub use storage::{PutOptions, SecureRecordStore, StorageError};
pub use wallet::{ChainClient, WalletError, WalletInfo, WalletManager, WalletRecord, WalletState};
