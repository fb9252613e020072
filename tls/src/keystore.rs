//! Password-protected keyed containers for private keys and trust anchors.
//!
//! A store file is a JSON envelope around one sealed payload. The payload
//! maps aliases to either a private-key entry (key sealed again under its
//! own protecting password, plus the ordered certificate chain) or a single
//! trusted certificate. Stores are single-writer: callers serialize access.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use rustls::Certificate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;
use utilities::{write_atomic, FileSystem};

use crate::chain::{CertificateChain, ChainError};
use crate::csr::{CsrError, NodeKeyPair};
use crate::sealing::{self, KdfParams, SealError, SealedBlob};

const STORE_FORMAT_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("cannot access secure store {}: {reason}", path.display())]
    Access { path: PathBuf, reason: String },
    #[error("cannot write secure store {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("alias {0:?} is not present")]
    MissingEntry(String),
    #[error("alias {alias:?} is not a {expected} entry")]
    WrongEntryKind {
        alias: String,
        expected: &'static str,
    },
    #[error("entry {alias:?} is malformed: {reason}")]
    Malformed { alias: String, reason: String },
    #[error(transparent)]
    Seal(#[from] SealError),
}

#[derive(Debug, Serialize, Deserialize)]
struct StoreFile {
    version: u32,
    payload: SealedBlob,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreContents {
    entries: BTreeMap<String, StoreEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum StoreEntry {
    PrivateKey { key: SealedBlob, chain: Vec<String> },
    TrustedCertificate { certificate: String },
}

pub struct SecureStore {
    entries: BTreeMap<String, StoreEntry>,
    kdf: KdfParams,
}

impl SecureStore {
    /// Open the container at `path`, or start an empty one if the file does
    /// not exist yet. Nothing is written until [`SecureStore::save`].
    pub fn load_or_create(
        fs: &dyn FileSystem,
        path: &Path,
        password: &str,
        kdf: KdfParams,
    ) -> Result<Self, StoreError> {
        if !fs.exists(path) {
            debug!(path = %path.display(), "Secure store absent; starting empty");
            return Ok(Self {
                entries: BTreeMap::new(),
                kdf,
            });
        }
        let access = |reason: String| StoreError::Access {
            path: path.to_path_buf(),
            reason,
        };
        let raw = fs.read(path).map_err(|e| access(e.to_string()))?;
        let file: StoreFile =
            serde_json::from_slice(&raw).map_err(|e| access(format!("corrupt container: {e}")))?;
        if file.version != STORE_FORMAT_VERSION {
            return Err(access(format!("unsupported format version {}", file.version)));
        }
        let plaintext = sealing::open(&file.payload, password).map_err(|e| access(e.to_string()))?;
        let contents: StoreContents = serde_json::from_slice(&plaintext)
            .map_err(|e| access(format!("corrupt payload: {e}")))?;
        Ok(Self {
            entries: contents.entries,
            kdf,
        })
    }

    pub fn contains_alias(&self, alias: &str) -> bool {
        self.entries.contains_key(alias)
    }

    pub fn aliases(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn add_or_replace_key(
        &mut self,
        alias: &str,
        key: &NodeKeyPair,
        protect_password: &str,
        chain: &CertificateChain,
    ) -> Result<(), StoreError> {
        let sealed = sealing::seal(key.pkcs8_der(), protect_password, self.kdf)?;
        let chain = chain
            .certificates()
            .iter()
            .map(|c| BASE64.encode(&c.0))
            .collect();
        self.entries.insert(
            alias.to_string(),
            StoreEntry::PrivateKey { key: sealed, chain },
        );
        Ok(())
    }

    pub fn add_or_replace_certificate(&mut self, alias: &str, certificate: &Certificate) {
        self.entries.insert(
            alias.to_string(),
            StoreEntry::TrustedCertificate {
                certificate: BASE64.encode(&certificate.0),
            },
        );
    }

    pub fn remove_alias(&mut self, alias: &str) -> bool {
        self.entries.remove(alias).is_some()
    }

    pub fn private_key(&self, alias: &str, protect_password: &str) -> Result<NodeKeyPair, StoreError> {
        match self.entry(alias)? {
            StoreEntry::PrivateKey { key, .. } => {
                let der = sealing::open(key, protect_password)?;
                NodeKeyPair::from_pkcs8_der(&der).map_err(|e: CsrError| StoreError::Malformed {
                    alias: alias.to_string(),
                    reason: e.to_string(),
                })
            }
            other => Err(StoreError::WrongEntryKind {
                alias: alias.to_string(),
                expected: wrong_kind_expected(other),
            }),
        }
    }

    pub fn certificate_chain(&self, alias: &str) -> Result<CertificateChain, StoreError> {
        match self.entry(alias)? {
            StoreEntry::PrivateKey { chain, .. } => {
                let ders = chain
                    .iter()
                    .map(|c| BASE64.decode(c.as_bytes()))
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(|e| malformed(alias, e.to_string()))?;
                CertificateChain::from_der(ders).map_err(|e: ChainError| malformed(alias, e.to_string()))
            }
            other => Err(StoreError::WrongEntryKind {
                alias: alias.to_string(),
                expected: wrong_kind_expected(other),
            }),
        }
    }

    pub fn trusted_certificate(&self, alias: &str) -> Result<Certificate, StoreError> {
        match self.entry(alias)? {
            StoreEntry::TrustedCertificate { certificate } => BASE64
                .decode(certificate.as_bytes())
                .map(Certificate)
                .map_err(|e| malformed(alias, e.to_string())),
            other => Err(StoreError::WrongEntryKind {
                alias: alias.to_string(),
                expected: wrong_kind_expected(other),
            }),
        }
    }

    /// All trusted-certificate entries, in alias order.
    pub fn trusted_certificates(&self) -> Result<Vec<(String, Certificate)>, StoreError> {
        self.entries
            .iter()
            .filter(|(_, entry)| matches!(entry, StoreEntry::TrustedCertificate { .. }))
            .map(|(alias, _)| Ok((alias.clone(), self.trusted_certificate(alias)?)))
            .collect()
    }

    /// Seal and atomically replace the container at `path`.
    pub fn save(&self, fs: &dyn FileSystem, path: &Path, password: &str) -> Result<(), StoreError> {
        let contents = StoreContents {
            entries: self.entries.clone(),
        };
        let plaintext = zeroize::Zeroizing::new(
            serde_json::to_vec(&contents).map_err(|e| StoreError::Write {
                path: path.to_path_buf(),
                source: io::Error::new(io::ErrorKind::InvalidData, e),
            })?,
        );
        let payload = sealing::seal(&plaintext, password, self.kdf).map_err(|e| StoreError::Write {
            path: path.to_path_buf(),
            source: io::Error::new(io::ErrorKind::InvalidInput, e),
        })?;
        let file = StoreFile {
            version: STORE_FORMAT_VERSION,
            payload,
        };
        let data = serde_json::to_vec_pretty(&file).map_err(|e| StoreError::Write {
            path: path.to_path_buf(),
            source: io::Error::new(io::ErrorKind::InvalidData, e),
        })?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs.create_dir_all(parent).map_err(|source| StoreError::Write {
                path: path.to_path_buf(),
                source,
            })?;
        }
        write_atomic(fs, path, &data).map_err(|source| StoreError::Write {
            path: path.to_path_buf(),
            source,
        })?;
        debug!(path = %path.display(), entries = self.entries.len(), "Saved secure store");
        Ok(())
    }

    fn entry(&self, alias: &str) -> Result<&StoreEntry, StoreError> {
        self.entries
            .get(alias)
            .ok_or_else(|| StoreError::MissingEntry(alias.to_string()))
    }
}

fn malformed(alias: &str, reason: String) -> StoreError {
    StoreError::Malformed {
        alias: alias.to_string(),
        reason,
    }
}

/// The kind the caller wanted, given the kind actually stored.
fn wrong_kind_expected(found: &StoreEntry) -> &'static str {
    match found {
        StoreEntry::PrivateKey { .. } => "trusted certificate",
        StoreEntry::TrustedCertificate { .. } => "private key",
    }
}
