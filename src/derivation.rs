use bitcoin_hashes::{hash160, Hash};
use hmac::{Hmac, Mac};
use secp256k1::{PublicKey, Scalar, Secp256k1, SecretKey};
use sha2::Sha512;
use std::fmt;
use std::str::FromStr;
use zeroize::Zeroize;

const HARDENED_BIT: u32 = 0x80000000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DerivationError {
    InvalidPath,
    InvalidChildNumber,
    KeyDerivationFailed,
    HmacError,
    Secp256k1Error,
}

impl fmt::Display for DerivationError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            DerivationError::InvalidPath => write!(f, "Invalid derivation path"),
            DerivationError::InvalidChildNumber => write!(f, "Invalid child number"),
            DerivationError::KeyDerivationFailed => write!(f, "Key derivation failed"),
            DerivationError::HmacError => write!(f, "HMAC operation failed"),
            DerivationError::Secp256k1Error => write!(f, "Secp256k1 operation failed"),
        }
    }
}

impl std::error::Error for DerivationError {}

/// Represents a BIP32 extended key, containing both private and public components.
///
/// The private key and chain code are erased when the value is dropped.
#[derive(Clone)]
pub struct ExtendedKey {
    pub(crate) private_key: SecretKey,
    pub public_key: PublicKey,
    pub(crate) chain_code: [u8; 32],
    pub depth: u8,
    pub parent_fingerprint: [u8; 4],
    pub child_number: u32,
}

impl ExtendedKey {
    /// Creates a new master key from a seed
    pub fn from_seed(seed: &[u8]) -> Result<Self, DerivationError> {
        let secp = Secp256k1::signing_only();

        // HMAC-SHA512 with key "Bitcoin seed"
        let mut hmac = Hmac::<Sha512>::new_from_slice(b"Bitcoin seed")
            .map_err(|_| DerivationError::HmacError)?;

        hmac.update(seed);
        let mut result = hmac.finalize().into_bytes();

        let mut left = [0u8; 32];
        let mut chain_code = [0u8; 32];
        left.copy_from_slice(&result[0..32]);
        chain_code.copy_from_slice(&result[32..64]);
        result.as_mut_slice().zeroize();

        let private_key = SecretKey::from_slice(&left);
        left.zeroize();
        let private_key = private_key.map_err(|_| DerivationError::Secp256k1Error)?;

        let public_key = PublicKey::from_secret_key(&secp, &private_key);

        Ok(ExtendedKey {
            private_key,
            public_key,
            chain_code,
            depth: 0,
            parent_fingerprint: [0u8; 4],
            child_number: 0,
        })
    }

    /// Derives a child key based on the provided index
    pub fn derive_child(&self, index: u32) -> Result<Self, DerivationError> {
        let secp = Secp256k1::signing_only();

        // 33 bytes for the key material + 4 bytes for the index
        let mut data = Vec::with_capacity(37);

        if index & HARDENED_BIT != 0 {
            data.push(0);
            data.extend_from_slice(&self.private_key.secret_bytes());
        } else {
            data.extend_from_slice(&self.public_key.serialize());
        }

        data.extend_from_slice(&index.to_be_bytes());

        let mut hmac = Hmac::<Sha512>::new_from_slice(&self.chain_code)
            .map_err(|_| DerivationError::HmacError)?;

        hmac.update(&data);
        data.zeroize();
        let mut result = hmac.finalize().into_bytes();

        let mut left = [0u8; 32];
        let mut chain_code = [0u8; 32];
        left.copy_from_slice(&result[0..32]);
        chain_code.copy_from_slice(&result[32..64]);
        result.as_mut_slice().zeroize();

        // IL must be a valid scalar, otherwise the index is skipped per BIP32
        let tweak = Scalar::from_be_bytes(left);
        left.zeroize();
        let tweak = tweak.map_err(|_| DerivationError::InvalidChildNumber)?;

        let child_private_key = self
            .private_key
            .add_tweak(&tweak)
            .map_err(|_| DerivationError::KeyDerivationFailed)?;

        let child_public_key = PublicKey::from_secret_key(&secp, &child_private_key);

        Ok(ExtendedKey {
            private_key: child_private_key,
            public_key: child_public_key,
            chain_code,
            depth: self.depth.checked_add(1).ok_or(DerivationError::InvalidPath)?,
            parent_fingerprint: self.fingerprint(),
            child_number: index,
        })
    }

    /// Calculates the fingerprint of this key
    pub fn fingerprint(&self) -> [u8; 4] {
        let mut result = [0u8; 4];
        let hash = hash160::Hash::hash(&self.public_key.serialize());
        result.copy_from_slice(&hash.to_byte_array()[0..4]);
        result
    }

    /// Serializes the public half as a Base58Check `xpub`.
    pub fn to_xpub(&self) -> String {
        let mut data = Vec::with_capacity(78);

        // Version bytes for mainnet public key (0x0488B21E)
        data.extend_from_slice(&[0x04, 0x88, 0xB2, 0x1E]);
        data.push(self.depth);
        data.extend_from_slice(&self.parent_fingerprint);
        data.extend_from_slice(&self.child_number.to_be_bytes());
        data.extend_from_slice(&self.chain_code);
        data.extend_from_slice(&self.public_key.serialize());

        bs58::encode(&data).with_check().into_string()
    }
}

impl Drop for ExtendedKey {
    fn drop(&mut self) {
        self.private_key.non_secure_erase();
        self.chain_code.zeroize();
    }
}

impl fmt::Debug for ExtendedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExtendedKey")
            .field("public_key", &self.public_key)
            .field("depth", &self.depth)
            .field("child_number", &self.child_number)
            .finish()
    }
}

/// Represents a BIP32 derivation path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DerivationPath {
    indices: Vec<u32>,
}

impl DerivationPath {
    pub fn from_indices(indices: Vec<u32>) -> Self {
        DerivationPath { indices }
    }

    pub fn indices(&self) -> &[u32] {
        &self.indices
    }

    /// Derives a key following this path
    pub fn derive(&self, root: &ExtendedKey) -> Result<ExtendedKey, DerivationError> {
        let mut key = root.clone();

        for &index in &self.indices {
            key = key.derive_child(index)?;
        }

        Ok(key)
    }
}

impl FromStr for DerivationPath {
    type Err = DerivationError;

    fn from_str(path: &str) -> Result<Self, DerivationError> {
        let mut components = path.split('/');
        if components.next() != Some("m") {
            return Err(DerivationError::InvalidPath);
        }

        let indices: Result<Vec<u32>, _> = components
            .map(|component| {
                let hardened = component.ends_with('\'') || component.ends_with('h');
                let index_str = if hardened {
                    &component[..component.len() - 1]
                } else {
                    component
                };

                match index_str.parse::<u32>() {
                    Ok(index) if index & HARDENED_BIT != 0 => {
                        Err(DerivationError::InvalidChildNumber)
                    }
                    Ok(index) => {
                        if hardened {
                            Ok(index | HARDENED_BIT)
                        } else {
                            Ok(index)
                        }
                    }
                    Err(_) => Err(DerivationError::InvalidChildNumber),
                }
            })
            .collect();

        indices.map(|indices| DerivationPath { indices })
    }
}

impl fmt::Display for DerivationPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "m")?;
        for &index in &self.indices {
            if index & HARDENED_BIT != 0 {
                write!(f, "/{}'", index & !HARDENED_BIT)?;
            } else {
                write!(f, "/{}", index)?;
            }
        }
        Ok(())
    }
}

/// Utility functions for common derivation paths
pub mod paths {
    use super::{DerivationPath, HARDENED_BIT};

    /// BIP44 - Multi-Account Hierarchy for Deterministic Wallets
    /// Format: m/44'/coin_type'/account'/change/address_index
    pub fn bip44(coin_type: u32, account: u32, change: bool, address_index: u32) -> DerivationPath {
        DerivationPath::from_indices(vec![
            44 | HARDENED_BIT,
            coin_type | HARDENED_BIT,
            account | HARDENED_BIT,
            u32::from(change),
            address_index,
        ])
    }

    /// Bitcoin - Coin type 0
    pub const BITCOIN: u32 = 0;
}
