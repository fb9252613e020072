//! Capability to reach the remote signing authority.

use async_trait::async_trait;
use models::RequestId;
use thiserror::Error;
use tls::CertificateChain;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetrieveOutcome {
    /// Not yet approved; ask again later.
    Pending,
    /// Approved. Leaf first, root last.
    Issued(CertificateChain),
    /// Terminal refusal reported by the authority.
    Rejected(String),
}

#[derive(Debug, Error)]
pub enum SigningError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("unexpected response from signing authority: {0}")]
    Protocol(String),
}

#[async_trait]
pub trait SigningClient: Send + Sync {
    /// Submit a DER-encoded PKCS#10 request and return the authority's id for it.
    async fn submit(&self, csr_der: &[u8]) -> Result<RequestId, SigningError>;

    async fn retrieve(&self, request_id: &RequestId) -> Result<RetrieveOutcome, SigningError>;
}
