use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::identity::IdentityDescriptor;

pub const DEFAULT_CONFIG_FILE_NAME: &str = "certprov.toml";

const CERTIFICATES_DIR: &str = "certificates";
const KEYSTORE_FILE: &str = "nodekeystore.sealed";
const TRUSTSTORE_FILE: &str = "truststore.sealed";
const REQUEST_ID_FILE: &str = "certificate-request-id.txt";

const MAX_KDF_PARALLELISM: u32 = 0x00ff_ffff;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvisionConfig {
    pub identity: IdentityDescriptor,
    pub signing_authority_url: String,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    /// Overall bound on the approval wait; unbounded when absent.
    #[serde(default)]
    pub poll_timeout_secs: Option<u64>,
    pub keystore_password: String,
    pub truststore_password: String,
    /// Password protecting the private-key entry; falls back to the key store password.
    #[serde(default)]
    pub key_password: Option<String>,
    #[serde(default = "default_log_path")]
    pub log_path: PathBuf,
    #[serde(default)]
    pub kdf: KdfConfig,
}

/// Argon2id cost parameters used when sealing the secure stores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KdfConfig {
    #[serde(default = "default_kdf_memory_kib")]
    pub memory_kib: u32,
    #[serde(default = "default_kdf_iterations")]
    pub iterations: u32,
    #[serde(default = "default_kdf_parallelism")]
    pub parallelism: u32,
}

impl Default for KdfConfig {
    fn default() -> Self {
        Self {
            memory_kib: default_kdf_memory_kib(),
            iterations: default_kdf_iterations(),
            parallelism: default_kdf_parallelism(),
        }
    }
}

impl KdfConfig {
    /// Argon2 limits: at least one pass and one lane, 8 KiB of memory per lane.
    pub fn validate(&self) -> Result<()> {
        if self.iterations == 0 {
            bail!("kdf.iterations must be at least 1");
        }
        if self.parallelism == 0 || self.parallelism > MAX_KDF_PARALLELISM {
            bail!(
                "kdf.parallelism must be between 1 and {MAX_KDF_PARALLELISM} (got {})",
                self.parallelism
            );
        }
        if self.memory_kib < 8 * self.parallelism {
            bail!(
                "kdf.memory_kib must be at least 8 per lane ({} for {} lanes, got {})",
                8 * self.parallelism,
                self.parallelism,
                self.memory_kib
            );
        }
        Ok(())
    }
}

impl ProvisionConfig {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let cfg: ProvisionConfig = toml::from_str(&raw)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.identity.legal_name.trim().is_empty() {
            bail!("identity.legal_name cannot be empty");
        }
        if self.identity.locality.trim().is_empty() {
            bail!("identity.locality cannot be empty");
        }
        if self.identity.country.len() != 2 {
            bail!(
                "identity.country must be a two-letter code (got {:?})",
                self.identity.country
            );
        }
        if !self.identity.email.contains('@') {
            bail!("identity.email must be an email address");
        }
        if self.signing_authority_url.trim().is_empty() {
            bail!("signing_authority_url cannot be empty");
        }
        if self.poll_interval_secs == 0 {
            bail!("poll_interval_secs must be greater than zero");
        }
        if self.poll_timeout_secs == Some(0) {
            bail!("poll_timeout_secs must be greater than zero when set");
        }
        if self.keystore_password.is_empty() || self.truststore_password.is_empty() {
            bail!("keystore_password and truststore_password must be set");
        }
        self.kdf.validate()
    }

    pub fn key_password(&self) -> &str {
        self.key_password
            .as_deref()
            .unwrap_or(&self.keystore_password)
    }

    /// Log file location; relative paths resolve against `base_dir`.
    pub fn log_path_under(&self, base_dir: &Path) -> PathBuf {
        if self.log_path.is_absolute() {
            self.log_path.clone()
        } else {
            base_dir.join(&self.log_path)
        }
    }
}

/// On-disk locations of the provisioning state under a base directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorePaths {
    pub certificates_dir: PathBuf,
    pub keystore: PathBuf,
    pub truststore: PathBuf,
    pub request_id: PathBuf,
}

impl StorePaths {
    pub fn under(base_dir: &Path) -> Self {
        let certificates_dir = base_dir.join(CERTIFICATES_DIR);
        Self {
            keystore: certificates_dir.join(KEYSTORE_FILE),
            truststore: certificates_dir.join(TRUSTSTORE_FILE),
            request_id: certificates_dir.join(REQUEST_ID_FILE),
            certificates_dir,
        }
    }
}

fn default_poll_interval_secs() -> u64 {
    60
}

fn default_log_path() -> PathBuf {
    PathBuf::from("logs/certprov.log")
}

fn default_kdf_memory_kib() -> u32 {
    64 * 1024
}

fn default_kdf_iterations() -> u32 {
    3
}

fn default_kdf_parallelism() -> u32 {
    4
}
