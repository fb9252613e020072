use models::RequestId;
use std::io;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tls::{CsrError, StoreError};

use crate::signing::SigningError;

#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("secure store is not readable: {0}")]
    StorageAccess(#[source] StoreError),
    #[error("secure store could not be written: {0}")]
    StorageWrite(#[source] StoreError),
    /// The authority holds a request we could not record. Re-running would
    /// submit a second request, so the id is carried for manual recovery.
    #[error(
        "request {request_id} was accepted by the signing authority but could not be recorded in {}: {source}; write the id to that file before retrying",
        path.display()
    )]
    Persistence {
        request_id: RequestId,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("request id file {} is unreadable: {reason}", path.display())]
    TrackerAccess { path: PathBuf, reason: String },
    #[error("signing authority rejected request {request_id}: {reason}")]
    RequestRejected {
        request_id: RequestId,
        reason: String,
    },
    #[error("certificate signing request was not submitted: {0}")]
    Signing(#[source] SigningError),
    #[error("issued chain cannot be installed: {0}")]
    ChainMismatch(String),
    #[error("key material error: {0}")]
    KeyMaterial(#[from] CsrError),
    #[error("stopped waiting for approval of request {0}")]
    Cancelled(RequestId),
    #[error("request {request_id} was not approved within {waited:?}")]
    TimedOut {
        request_id: RequestId,
        waited: Duration,
    },
}

impl From<StoreError> for ProvisionError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Write { .. } => ProvisionError::StorageWrite(err),
            other => ProvisionError::StorageAccess(other),
        }
    }
}
