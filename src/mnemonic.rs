use bip39::{Language, Mnemonic};
use rand::{rngs::OsRng, RngCore};
use std::error::Error as StdError;
use std::fmt;
use zeroize::{Zeroize, Zeroizing};

/// Word counts accepted by `validate`.
pub const VALID_WORD_COUNTS: [usize; 5] = [12, 15, 18, 21, 24];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MnemonicStrength {
    #[default]
    Words12,
    Words15,
    Words18,
    Words21,
    Words24,
}

impl MnemonicStrength {
    pub fn from_entropy_bits(bits: u32) -> Option<Self> {
        match bits {
            128 => Some(MnemonicStrength::Words12),
            160 => Some(MnemonicStrength::Words15),
            192 => Some(MnemonicStrength::Words18),
            224 => Some(MnemonicStrength::Words21),
            256 => Some(MnemonicStrength::Words24),
            _ => None,
        }
    }

    pub fn entropy_bits(&self) -> usize {
        match self {
            MnemonicStrength::Words12 => 128,
            MnemonicStrength::Words15 => 160,
            MnemonicStrength::Words18 => 192,
            MnemonicStrength::Words21 => 224,
            MnemonicStrength::Words24 => 256,
        }
    }

    pub fn word_count(&self) -> usize {
        // 11 bits per word over entropy plus entropy/32 checksum bits
        (self.entropy_bits() + self.entropy_bits() / 32) / 11
    }
}

/// A single problem found in a user-supplied phrase.
///
/// Display output never echoes the phrase. `UnknownWord` keeps the offending
/// word in the value so a UI can highlight it, but only its position is
/// printed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    Empty,
    InvalidWordCount { count: usize },
    UnknownWord { index: usize, word: String },
    ChecksumMismatch,
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationError::Empty => write!(f, "Recovery phrase is empty"),
            ValidationError::InvalidWordCount { count } => write!(
                f,
                "word count must be 12/15/18/21/24 (got {})",
                count
            ),
            ValidationError::UnknownWord { index, .. } => {
                write!(f, "Word {} is not in the wordlist", index + 1)
            }
            ValidationError::ChecksumMismatch => {
                write!(f, "Recovery phrase checksum does not match")
            }
        }
    }
}

impl StdError for ValidationError {}

#[derive(Debug)]
pub enum MnemonicError {
    EntropyGenerationFailed,
}

impl fmt::Display for MnemonicError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MnemonicError::EntropyGenerationFailed => write!(f, "Failed to generate entropy"),
        }
    }
}

impl StdError for MnemonicError {}

/// A phrase that passed word count, wordlist and checksum checks.
pub struct ValidatedMnemonic {
    mnemonic: Mnemonic,
}

impl ValidatedMnemonic {
    /// Normalized phrase, zeroed when dropped.
    pub fn phrase(&self) -> Zeroizing<String> {
        let mut result = Zeroizing::new(String::new());
        for (i, word) in self.mnemonic.word_iter().enumerate() {
            if i > 0 {
                result.push(' ');
            }
            result.push_str(word);
        }
        result
    }

    pub fn word_count(&self) -> usize {
        self.mnemonic.word_count()
    }

    pub(crate) fn to_seed_bytes(&self, passphrase: &str) -> [u8; 64] {
        let mut seed_bytes = self.mnemonic.to_seed(passphrase);
        let mut seed = [0u8; 64];
        seed.copy_from_slice(&seed_bytes[..64]);
        seed_bytes.zeroize();
        seed
    }
}

impl fmt::Debug for ValidatedMnemonic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ValidatedMnemonic")
            .field("word_count", &self.word_count())
            .finish()
    }
}

/// Outcome of `check`, shaped for per-field form feedback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationReport {
    pub is_valid: bool,
    pub word_count: usize,
    pub errors: Vec<ValidationError>,
}

pub fn generate(strength: MnemonicStrength) -> Result<ValidatedMnemonic, MnemonicError> {
    let entropy_bytes = strength.entropy_bits() / 8;
    let mut entropy = generate_entropy(entropy_bytes)?;

    let result = Mnemonic::from_entropy(&entropy);
    entropy.zeroize();

    match result {
        Ok(mnemonic) => Ok(ValidatedMnemonic { mnemonic }),
        Err(_) => Err(MnemonicError::EntropyGenerationFailed),
    }
}

/// Trim, lowercase and collapse internal whitespace to single spaces.
pub fn normalize(phrase: &str) -> String {
    phrase
        .split_whitespace()
        .map(|word| word.to_lowercase())
        .collect::<Vec<_>>()
        .join(" ")
}

pub fn validate(phrase: &str) -> Result<ValidatedMnemonic, Vec<ValidationError>> {
    let normalized = Zeroizing::new(normalize(phrase));
    if normalized.is_empty() {
        return Err(vec![ValidationError::Empty]);
    }

    let wordlist = Language::English.word_list();
    let words: Vec<&str> = normalized.split(' ').collect();
    let mut errors = Vec::new();

    if !VALID_WORD_COUNTS.contains(&words.len()) {
        errors.push(ValidationError::InvalidWordCount { count: words.len() });
    }

    for (index, word) in words.iter().enumerate() {
        // The English list is sorted, so a binary search is exact
        if wordlist.binary_search_by(|probe| (*probe).cmp(*word)).is_err() {
            errors.push(ValidationError::UnknownWord {
                index,
                word: (*word).to_string(),
            });
        }
    }

    if !errors.is_empty() {
        return Err(errors);
    }

    match Mnemonic::parse_in_normalized(Language::English, &normalized) {
        Ok(mnemonic) => Ok(ValidatedMnemonic { mnemonic }),
        // Word count and membership were checked above, leaving the checksum
        Err(_) => Err(vec![ValidationError::ChecksumMismatch]),
    }
}

pub fn check(phrase: &str) -> ValidationReport {
    let word_count = phrase.split_whitespace().count();
    match validate(phrase) {
        Ok(mnemonic) => ValidationReport {
            is_valid: true,
            word_count: mnemonic.word_count(),
            errors: Vec::new(),
        },
        Err(errors) => ValidationReport {
            is_valid: false,
            word_count,
            errors,
        },
    }
}

pub fn generate_entropy(byte_length: usize) -> Result<Vec<u8>, MnemonicError> {
    let mut bytes = vec![0u8; byte_length];
    OsRng
        .try_fill_bytes(&mut bytes)
        .map_err(|_| MnemonicError::EntropyGenerationFailed)?;
    Ok(bytes)
}
