use crate::derivation::DerivationPath;
use crate::keys::DEFAULT_DERIVATION_PATH;
use crate::keystore::Namespace;
use crate::mnemonic::MnemonicStrength;
use serde::{Deserialize, Serialize};
use std::env;
use std::error::Error;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

const STORAGE_DIR_ENV: &str = "WALLET_KEYSTORE_DIR";
const NAMESPACE_ENV: &str = "WALLET_KEYSTORE_NAMESPACE";

#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Parse(String),
    Invalid(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "IO error: {}", e),
            ConfigError::Parse(reason) => write!(f, "Failed to parse config: {}", reason),
            ConfigError::Invalid(reason) => write!(f, "Invalid config: {}", reason),
        }
    }
}

impl Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(err: std::io::Error) -> Self {
        ConfigError::Io(err)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(err: toml::de::Error) -> Self {
        ConfigError::Parse(err.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VaultConfig {
    /// Prefix applied to every OS keystore key
    pub namespace: String,
    /// Directory of the file-backed keystore
    pub storage_dir: PathBuf,
    pub derivation_path: String,
    /// Entropy bits for new wallets
    pub default_strength: u32,
    /// How long one successful device-auth prompt covers later reads
    pub auth_validity_secs: u64,
    /// Session blobs are stored in plaintext when false. Every such write logs
    /// a warning and is reported to the caller.
    pub encrypt_session_data: bool,
}

impl Default for VaultConfig {
    fn default() -> Self {
        VaultConfig {
            namespace: Self::DEFAULT_NAMESPACE.to_string(),
            storage_dir: PathBuf::from("./keystore-data"),
            derivation_path: DEFAULT_DERIVATION_PATH.to_string(),
            default_strength: 128,
            auth_validity_secs: 30,
            encrypt_session_data: true,
        }
    }
}

impl VaultConfig {
    pub const DEFAULT_NAMESPACE: &'static str = "wallet_keystore";

    /// Defaults with environment overrides applied.
    pub fn new() -> Self {
        let mut config = VaultConfig::default();
        config.apply_env();
        config
    }

    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let config: VaultConfig = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads `path` if it exists, falling back to defaults, then applies
    /// environment overrides.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let mut config = if path.exists() {
            log::info!("Loading keystore config from {}", path.display());
            let contents = fs::read_to_string(path)?;
            toml::from_str(&contents)?
        } else {
            log::debug!("No config at {}, using defaults", path.display());
            VaultConfig::default()
        };

        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        Namespace::new(&self.namespace)
            .map_err(|_| ConfigError::Invalid(format!("namespace '{}'", self.namespace)))?;
        self.derivation_path()?;
        self.strength()?;
        Ok(())
    }

    pub fn derivation_path(&self) -> Result<DerivationPath, ConfigError> {
        self.derivation_path
            .parse()
            .map_err(|_| ConfigError::Invalid(format!("derivation path '{}'", self.derivation_path)))
    }

    pub fn strength(&self) -> Result<MnemonicStrength, ConfigError> {
        MnemonicStrength::from_entropy_bits(self.default_strength).ok_or_else(|| {
            ConfigError::Invalid(format!(
                "default_strength must be 128/160/192/224/256 (got {})",
                self.default_strength
            ))
        })
    }

    fn apply_env(&mut self) {
        if let Ok(dir) = env::var(STORAGE_DIR_ENV) {
            self.storage_dir = PathBuf::from(dir);
        }
        if let Ok(namespace) = env::var(NAMESPACE_ENV) {
            self.namespace = namespace;
        }
    }
}
