use crate::derivation::{DerivationError, DerivationPath, ExtendedKey};
use crate::mnemonic::ValidatedMnemonic;
use bitcoin_hashes::{hash160, Hash};
use secp256k1::{ecdsa, Message, PublicKey, Secp256k1, SecretKey};
use sha2::{Digest, Sha256};
use std::error::Error;
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Fixed path used for the wallet keypair. Changing it changes every address.
pub const DEFAULT_DERIVATION_PATH: &str = "m/44'/0'/0'/0/0";

/// Version byte prepended to the public key hash before Base58Check.
const ADDRESS_VERSION: u8 = 0x00;

#[derive(Debug)]
pub enum KeyPairError {
    DerivationError(DerivationError),
    InvalidSeed,
    InvalidPublicKey,
    InvalidSignature,
    SigningFailed,
}

impl fmt::Display for KeyPairError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            KeyPairError::DerivationError(e) => write!(f, "Derivation error: {}", e),
            KeyPairError::InvalidSeed => write!(f, "Invalid seed"),
            KeyPairError::InvalidPublicKey => write!(f, "Invalid public key"),
            KeyPairError::InvalidSignature => write!(f, "Invalid signature encoding"),
            KeyPairError::SigningFailed => write!(f, "Failed to sign message"),
        }
    }
}

impl Error for KeyPairError {}

impl From<DerivationError> for KeyPairError {
    fn from(err: DerivationError) -> Self {
        KeyPairError::DerivationError(err)
    }
}

/// 512-bit BIP39 seed. Never persisted; zeroed on drop.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct Seed([u8; 64]);

impl Seed {
    pub fn as_bytes(&self) -> &[u8; 64] {
        &self.0
    }
}

impl fmt::Debug for Seed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Seed(..)")
    }
}

/// PBKDF2-HMAC-SHA512, 2048 rounds, salt "mnemonic" + passphrase.
pub fn seed_from_mnemonic(mnemonic: &ValidatedMnemonic, passphrase: &str) -> Seed {
    Seed(mnemonic.to_seed_bytes(passphrase))
}

pub fn keypair_from_seed(seed: &Seed) -> Result<KeyPair, KeyPairError> {
    let path: DerivationPath = DEFAULT_DERIVATION_PATH.parse()?;
    keypair_from_seed_at(seed, &path)
}

pub fn keypair_from_seed_at(seed: &Seed, path: &DerivationPath) -> Result<KeyPair, KeyPairError> {
    let master = ExtendedKey::from_seed(seed.as_bytes()).map_err(|_| KeyPairError::InvalidSeed)?;
    let extended_key = path.derive(&master)?;
    let address = address_from_public_key(&extended_key.public_key);

    Ok(KeyPair {
        extended_key,
        address,
    })
}

/// Legacy P2PKH-style address: Base58Check(version || HASH160(compressed pubkey)).
pub fn address_from_public_key(public_key: &PublicKey) -> String {
    let pubkey_hash = hash160::Hash::hash(&public_key.serialize());

    let mut address_bytes = Vec::with_capacity(21);
    address_bytes.push(ADDRESS_VERSION);
    address_bytes.extend_from_slice(&pubkey_hash.to_byte_array());

    bs58::encode(&address_bytes).with_check().into_string()
}

pub struct KeyPair {
    extended_key: ExtendedKey,
    address: String,
}

impl KeyPair {
    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn public_key(&self) -> PublicKey {
        self.extended_key.public_key
    }

    /// Compressed SEC1 public key, hex encoded
    pub fn public_key_hex(&self) -> String {
        hex::encode(self.extended_key.public_key.serialize())
    }

    pub fn fingerprint(&self) -> [u8; 4] {
        self.extended_key.fingerprint()
    }

    pub fn extended_public_key(&self) -> String {
        self.extended_key.to_xpub()
    }

    pub(crate) fn private_key(&self) -> &SecretKey {
        &self.extended_key.private_key
    }

    /// ECDSA over SHA-256(message), compact 64-byte encoding.
    pub fn sign(&self, message: &[u8]) -> Result<Signature, KeyPairError> {
        let secp = Secp256k1::signing_only();
        let digest = Sha256::digest(message);
        let msg = Message::from_slice(&digest).map_err(|_| KeyPairError::SigningFailed)?;
        let signature = secp.sign_ecdsa(&msg, self.private_key());

        Ok(Signature {
            bytes: signature.serialize_compact(),
        })
    }
}

impl PartialEq for KeyPair {
    fn eq(&self, other: &Self) -> bool {
        self.address == other.address && self.extended_key.public_key == other.extended_key.public_key
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("address", &self.address)
            .field("public_key", &self.public_key_hex())
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Signature {
    bytes: [u8; 64],
}

impl Signature {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, KeyPairError> {
        let parsed = ecdsa::Signature::from_compact(bytes).map_err(|_| KeyPairError::InvalidSignature)?;
        Ok(Signature {
            bytes: parsed.serialize_compact(),
        })
    }

    pub fn from_hex(encoded: &str) -> Result<Self, KeyPairError> {
        let bytes = hex::decode(encoded).map_err(|_| KeyPairError::InvalidSignature)?;
        Self::from_bytes(&bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 64] {
        &self.bytes
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.bytes)
    }
}

/// Checks `signature` over SHA-256(message) against a hex-encoded compressed public key.
pub fn verify_signature(
    public_key_hex: &str,
    message: &[u8],
    signature: &Signature,
) -> Result<bool, KeyPairError> {
    let key_bytes = hex::decode(public_key_hex).map_err(|_| KeyPairError::InvalidPublicKey)?;
    let public_key = PublicKey::from_slice(&key_bytes).map_err(|_| KeyPairError::InvalidPublicKey)?;
    let sig = ecdsa::Signature::from_compact(signature.as_bytes())
        .map_err(|_| KeyPairError::InvalidSignature)?;

    let secp = Secp256k1::verification_only();
    let digest = Sha256::digest(message);
    let msg = Message::from_slice(&digest).map_err(|_| KeyPairError::InvalidSignature)?;

    Ok(secp.verify_ecdsa(&msg, &sig, &public_key).is_ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mnemonic;

    const VECTOR_12: &str = "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about";

    #[test]
    fn seed_matches_bip39_vector() {
        let validated = mnemonic::validate(VECTOR_12).unwrap();
        let seed = seed_from_mnemonic(&validated, "TREZOR");
        assert_eq!(
            hex::encode(seed.as_bytes()),
            "c55257c360c07c72029aebc1b53c05ed0362ada38ead3e3e9efa3708e53495531f09a6987599d18264c1e1c92f2cf141630c7a3c4ab7c81b2f001698e7463b04"
        );
    }

    #[test]
    fn derivation_is_deterministic() {
        let validated = mnemonic::validate(VECTOR_12).unwrap();
        let first = keypair_from_seed(&seed_from_mnemonic(&validated, "")).unwrap();
        let second = keypair_from_seed(&seed_from_mnemonic(&validated, "")).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.address(), second.address());
        assert_eq!(first.public_key_hex(), second.public_key_hex());
    }

    #[test]
    fn passphrase_changes_the_keypair() {
        let validated = mnemonic::validate(VECTOR_12).unwrap();
        let plain = keypair_from_seed(&seed_from_mnemonic(&validated, "")).unwrap();
        let protected = keypair_from_seed(&seed_from_mnemonic(&validated, "hunter2")).unwrap();
        assert_ne!(plain.address(), protected.address());
    }

    #[test]
    fn address_is_base58check_with_version_zero() {
        let validated = mnemonic::validate(VECTOR_12).unwrap();
        let keypair = keypair_from_seed(&seed_from_mnemonic(&validated, "")).unwrap();
        assert!(keypair.address().starts_with('1'));

        let decoded = bs58::decode(keypair.address()).with_check(None).into_vec().unwrap();
        assert_eq!(decoded.len(), 21);
        assert_eq!(decoded[0], ADDRESS_VERSION);
    }

    #[test]
    fn signatures_verify_against_the_public_key() {
        let generated = mnemonic::generate(mnemonic::MnemonicStrength::Words12).unwrap();
        let keypair = keypair_from_seed(&seed_from_mnemonic(&generated, "")).unwrap();

        let signature = keypair.sign(b"hello stars").unwrap();
        assert!(verify_signature(&keypair.public_key_hex(), b"hello stars", &signature).unwrap());
        assert!(!verify_signature(&keypair.public_key_hex(), b"hello stars!", &signature).unwrap());

        let parsed = Signature::from_hex(&signature.to_hex()).unwrap();
        assert_eq!(parsed, signature);
    }

    #[test]
    fn malformed_inputs_are_errors() {
        assert!(Signature::from_hex("zz").is_err());
        assert!(Signature::from_bytes(&[0u8; 10]).is_err());
        let sig = Signature { bytes: [1u8; 64] };
        assert!(verify_signature("02abcd", b"msg", &sig).is_err());
    }
}
