use models::{IdentityDescriptor, RequestId};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tls::NodeKeyPair;
use tracing::{error, info};
use utilities::{write_atomic, FileSystem};

use crate::error::ProvisionError;
use crate::signing::SigningClient;

/// Remembers the signing authority's request id across process restarts.
///
/// The id file holds one line. Its presence alone means "a request is in
/// flight": the tracker never submits while it exists.
pub struct RequestTracker {
    fs: Arc<dyn FileSystem>,
    path: PathBuf,
}

impl RequestTracker {
    pub fn new(fs: Arc<dyn FileSystem>, path: PathBuf) -> Self {
        Self { fs, path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The id recorded by an earlier submission, if any.
    pub fn persisted(&self) -> Result<Option<RequestId>, ProvisionError> {
        if !self.fs.exists(&self.path) {
            return Ok(None);
        }
        let raw = self.fs.read(&self.path).map_err(|e| self.access(e.to_string()))?;
        let text = String::from_utf8(raw).map_err(|_| self.access("not UTF-8 text".to_string()))?;
        RequestId::parse(&text)
            .map(Some)
            .ok_or_else(|| self.access("does not hold a single request id".to_string()))
    }

    /// Return the in-flight request id, submitting a new CSR only when none
    /// has been recorded. A newly issued id is on disk before this returns.
    pub async fn submit(
        &self,
        key: &NodeKeyPair,
        identity: &IdentityDescriptor,
        client: &dyn SigningClient,
    ) -> Result<RequestId, ProvisionError> {
        if let Some(existing) = self.persisted()? {
            info!(request_id = %existing, "Resuming previously submitted certificate request");
            return Ok(existing);
        }

        let csr = key.build_csr(identity)?;
        info!(subject = %identity, "Submitting certificate signing request");
        let request_id = client.submit(&csr).await.map_err(ProvisionError::Signing)?;

        if let Err(source) = self.record(&request_id) {
            error!(
                request_id = %request_id,
                path = %self.path.display(),
                "Failed to record certificate request id: {source}"
            );
            return Err(ProvisionError::Persistence {
                request_id,
                path: self.path.clone(),
                source,
            });
        }
        info!(request_id = %request_id, "Certificate request submitted and recorded");
        Ok(request_id)
    }

    fn record(&self, request_id: &RequestId) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            self.fs.create_dir_all(parent)?;
        }
        write_atomic(
            self.fs.as_ref(),
            &self.path,
            format!("{request_id}\n").as_bytes(),
        )
    }

    fn access(&self, reason: String) -> ProvisionError {
        ProvisionError::TrackerAccess {
            path: self.path.clone(),
            reason,
        }
    }
}
