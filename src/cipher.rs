//! Envelope encryption of individual records under a master key.
//!
//! Each call draws a fresh 128-bit salt and IV, stretches the master key into
//! a per-record key with PBKDF2-HMAC-SHA256 and encrypts with AES-256-CBC
//! (PKCS7). An HMAC-SHA256 tag over the whole record is checked before any
//! unpadding, so a modified record is rejected rather than decrypted into
//! different plaintext.

use aes::Aes256;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use cbc::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use pbkdf2::pbkdf2_hmac;
use rand::{rngs::OsRng, RngCore};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::error::Error;
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;
type HmacSha256 = Hmac<Sha256>;

pub const RECORD_KDF_ITERATIONS: u32 = 10_000;
pub const SALT_LEN: usize = 16;
pub const IV_LEN: usize = 16;
pub const MAC_LEN: usize = 32;
pub const RECORD_VERSION: &str = "1.0";

const MAC_KEY_LABEL: &[u8] = b"wallet-keystore/record-mac";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecryptError {
    /// Wrong master key, or the record was modified after encryption.
    InvalidKeyOrCorruptData,
    MalformedRecord(String),
    UnsupportedVersion(String),
}

impl fmt::Display for DecryptError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            DecryptError::InvalidKeyOrCorruptData => {
                write!(f, "Invalid key or corrupt data")
            }
            DecryptError::MalformedRecord(reason) => write!(f, "Malformed record: {}", reason),
            DecryptError::UnsupportedVersion(version) => {
                write!(f, "Unsupported record version: {}", version)
            }
        }
    }
}

impl Error for DecryptError {}

#[derive(Debug)]
pub enum EncryptError {
    RandomnessUnavailable,
    KeyDerivationFailed,
}

impl fmt::Display for EncryptError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            EncryptError::RandomnessUnavailable => write!(f, "System randomness unavailable"),
            EncryptError::KeyDerivationFailed => write!(f, "Record key derivation failed"),
        }
    }
}

impl Error for EncryptError {}

/// 256-bit key for a single record, derived from the master key and the record salt.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct RecordKey([u8; 32]);

impl RecordKey {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    fn mac_key(&self) -> Result<Zeroizing<[u8; 32]>, EncryptError> {
        let mut mac = <HmacSha256 as Mac>::new_from_slice(&self.0)
            .map_err(|_| EncryptError::KeyDerivationFailed)?;
        mac.update(MAC_KEY_LABEL);
        let mut key = Zeroizing::new([0u8; 32]);
        key.copy_from_slice(&mac.finalize().into_bytes());
        Ok(key)
    }
}

impl fmt::Debug for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("RecordKey(..)")
    }
}

/// Persisted envelope. Serialized as
/// `{ciphertext: base64, iv: hex, salt: hex, mac: hex, timestamp: ISO-8601, version}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EncryptedRecord {
    #[serde(with = "base64_bytes")]
    pub ciphertext: Vec<u8>,
    #[serde(with = "hex_bytes")]
    pub iv: Vec<u8>,
    #[serde(with = "hex_bytes")]
    pub salt: Vec<u8>,
    #[serde(with = "hex_bytes")]
    pub mac: Vec<u8>,
    pub timestamp: DateTime<Utc>,
    pub version: String,
}

impl EncryptedRecord {
    pub fn to_json(&self) -> Result<Vec<u8>, DecryptError> {
        serde_json::to_vec(self).map_err(|e| DecryptError::MalformedRecord(e.to_string()))
    }

    pub fn from_json(data: &[u8]) -> Result<Self, DecryptError> {
        let record: EncryptedRecord = serde_json::from_slice(data)
            .map_err(|e| DecryptError::MalformedRecord(e.to_string()))?;
        record.check_shape()?;
        Ok(record)
    }

    fn check_shape(&self) -> Result<(), DecryptError> {
        if self.version != RECORD_VERSION {
            return Err(DecryptError::UnsupportedVersion(self.version.clone()));
        }
        if self.iv.len() != IV_LEN {
            return Err(DecryptError::MalformedRecord("iv must be 16 bytes".to_string()));
        }
        if self.salt.len() != SALT_LEN {
            return Err(DecryptError::MalformedRecord("salt must be 16 bytes".to_string()));
        }
        if self.mac.len() != MAC_LEN {
            return Err(DecryptError::MalformedRecord("mac must be 32 bytes".to_string()));
        }
        if self.ciphertext.is_empty() || self.ciphertext.len() % 16 != 0 {
            return Err(DecryptError::MalformedRecord(
                "ciphertext is not a whole number of blocks".to_string(),
            ));
        }
        Ok(())
    }

    fn authenticated_bytes(&self) -> Vec<u8> {
        let mut data =
            Vec::with_capacity(self.version.len() + SALT_LEN + IV_LEN + self.ciphertext.len());
        data.extend_from_slice(self.version.as_bytes());
        data.extend_from_slice(&self.salt);
        data.extend_from_slice(&self.iv);
        data.extend_from_slice(&self.ciphertext);
        data
    }
}

pub fn derive_record_key(master_key: &[u8], salt: &[u8]) -> RecordKey {
    let mut key = [0u8; 32];
    pbkdf2_hmac::<Sha256>(master_key, salt, RECORD_KDF_ITERATIONS, &mut key);
    RecordKey(key)
}

pub fn encrypt(master_key: &[u8], plaintext: &[u8]) -> Result<EncryptedRecord, EncryptError> {
    let mut salt = [0u8; SALT_LEN];
    let mut iv = [0u8; IV_LEN];
    OsRng
        .try_fill_bytes(&mut salt)
        .map_err(|_| EncryptError::RandomnessUnavailable)?;
    OsRng
        .try_fill_bytes(&mut iv)
        .map_err(|_| EncryptError::RandomnessUnavailable)?;

    let record_key = derive_record_key(master_key, &salt);
    let ciphertext = Aes256CbcEnc::new(&(*record_key.as_bytes()).into(), &iv.into())
        .encrypt_padded_vec_mut::<Pkcs7>(plaintext);

    let mut record = EncryptedRecord {
        ciphertext,
        iv: iv.to_vec(),
        salt: salt.to_vec(),
        mac: Vec::new(),
        timestamp: Utc::now(),
        version: RECORD_VERSION.to_string(),
    };

    let mac_key = record_key.mac_key()?;
    let mut mac = <HmacSha256 as Mac>::new_from_slice(&mac_key[..])
        .map_err(|_| EncryptError::KeyDerivationFailed)?;
    mac.update(&record.authenticated_bytes());
    record.mac = mac.finalize().into_bytes().to_vec();

    Ok(record)
}

/// Verifies the tag, then decrypts. Never returns partial plaintext.
pub fn decrypt(master_key: &[u8], record: &EncryptedRecord) -> Result<Zeroizing<Vec<u8>>, DecryptError> {
    record.check_shape()?;

    let record_key = derive_record_key(master_key, &record.salt);
    let mac_key = record_key
        .mac_key()
        .map_err(|_| DecryptError::InvalidKeyOrCorruptData)?;
    let mut mac = <HmacSha256 as Mac>::new_from_slice(&mac_key[..])
        .map_err(|_| DecryptError::InvalidKeyOrCorruptData)?;
    mac.update(&record.authenticated_bytes());
    mac.verify_slice(&record.mac)
        .map_err(|_| DecryptError::InvalidKeyOrCorruptData)?;

    let mut iv = [0u8; IV_LEN];
    iv.copy_from_slice(&record.iv);

    let plaintext = Aes256CbcDec::new(&(*record_key.as_bytes()).into(), &iv.into())
        .decrypt_padded_vec_mut::<Pkcs7>(&record.ciphertext)
        .map_err(|_| DecryptError::InvalidKeyOrCorruptData)?;

    Ok(Zeroizing::new(plaintext))
}

/// Like `decrypt`, for payloads that must be non-empty UTF-8 text.
pub fn decrypt_text(master_key: &[u8], record: &EncryptedRecord) -> Result<Zeroizing<String>, DecryptError> {
    let mut plaintext = decrypt(master_key, record)?;
    if plaintext.is_empty() {
        return Err(DecryptError::InvalidKeyOrCorruptData);
    }

    let bytes = std::mem::take(&mut *plaintext);
    match String::from_utf8(bytes) {
        Ok(text) => Ok(Zeroizing::new(text)),
        Err(e) => {
            e.into_bytes().zeroize();
            Err(DecryptError::InvalidKeyOrCorruptData)
        }
    }
}

mod base64_bytes {
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
            .map_err(|_| serde::de::Error::custom("invalid base64"))
    }
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded = String::deserialize(deserializer)?;
        hex::decode(encoded).map_err(|_| serde::de::Error::custom("invalid hex"))
    }
}
