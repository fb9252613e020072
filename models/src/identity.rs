use serde::{Deserialize, Serialize};
use std::fmt;

/// Subject claims placed into the certificate-signing request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityDescriptor {
    pub legal_name: String,
    pub locality: String,
    #[serde(default = "default_country")]
    pub country: String,
    pub email: String,
    /// Defaults to the host name when absent from the config file.
    #[serde(default)]
    pub common_name: Option<String>,
}

impl IdentityDescriptor {
    pub fn new(legal_name: &str, locality: &str, email: &str) -> Self {
        Self {
            legal_name: legal_name.to_string(),
            locality: locality.to_string(),
            country: default_country(),
            email: email.to_string(),
            common_name: None,
        }
    }

    pub fn common_name(&self) -> String {
        match &self.common_name {
            Some(cn) if !cn.trim().is_empty() => cn.clone(),
            _ => hostname::get()
                .map(|h| h.to_string_lossy().into_owned())
                .unwrap_or_else(|_| "unknown-node".to_string()),
        }
    }
}

impl fmt::Display for IdentityDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "O={}, L={}, C={}",
            self.legal_name, self.locality, self.country
        )
    }
}

fn default_country() -> String {
    "GB".to_string()
}

/// Opaque token the signing authority hands back for a submitted CSR.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(String);

impl RequestId {
    /// Trims surrounding whitespace; returns `None` for an empty token.
    pub fn parse(raw: &str) -> Option<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() || trimmed.contains('\n') {
            return None;
        }
        Some(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
