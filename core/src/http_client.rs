//! HTTP binding of [`SigningClient`].
//!
//! `POST {base}/certificate` takes a DER PKCS#10 body and answers with the
//! request id as plain text. `GET {base}/certificate/{id}` answers 204 while
//! pending, 200 with a PEM bundle (leaf first) once issued, and 401/403 with
//! the refusal reason once rejected.

use async_trait::async_trait;
use models::RequestId;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use reqwest::{StatusCode, Url};
use std::time::Duration;
use tls::CertificateChain;
use tracing::debug;

use crate::signing::{RetrieveOutcome, SigningClient, SigningError};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

pub struct HttpSigningClient {
    client: reqwest::Client,
    base_url: Url,
}

impl HttpSigningClient {
    pub fn new(base_url: &str) -> Result<Self, SigningError> {
        let base_url = Url::parse(base_url).map_err(|e| {
            SigningError::Protocol(format!("invalid signing authority url {base_url:?}: {e}"))
        })?;
        if base_url.cannot_be_a_base() {
            return Err(SigningError::Protocol(format!(
                "signing authority url {base_url} cannot carry a path"
            )));
        }
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(transport)?;
        Ok(Self { client, base_url })
    }

    fn submit_url(&self) -> Url {
        self.endpoint(&["certificate"])
    }

    /// The id is one escaped path segment, whatever characters it holds.
    fn retrieve_url(&self, request_id: &RequestId) -> Url {
        self.endpoint(&["certificate", request_id.as_str()])
    }

    fn endpoint(&self, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        // Checked in `new`.
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }
}

#[async_trait]
impl SigningClient for HttpSigningClient {
    async fn submit(&self, csr_der: &[u8]) -> Result<RequestId, SigningError> {
        let resp = self
            .client
            .post(self.submit_url())
            .header(CONTENT_TYPE, "application/pkcs10")
            .body(csr_der.to_vec())
            .send()
            .await
            .map_err(transport)?;
        let status = resp.status();
        let body = resp.bytes().await.map_err(transport)?;
        debug!(%status, "Signing authority answered submission");
        submission_outcome(status, &body)
    }

    async fn retrieve(&self, request_id: &RequestId) -> Result<RetrieveOutcome, SigningError> {
        let resp = self
            .client
            .get(self.retrieve_url(request_id))
            .header(ACCEPT, "application/x-pem-file")
            .send()
            .await
            .map_err(transport)?;
        let status = resp.status();
        let body = resp.bytes().await.map_err(transport)?;
        debug!(%status, request_id = %request_id, "Signing authority answered poll");
        retrieval_outcome(status, &body)
    }
}

fn transport(err: reqwest::Error) -> SigningError {
    SigningError::Transport(err.to_string())
}

pub(crate) fn submission_outcome(status: StatusCode, body: &[u8]) -> Result<RequestId, SigningError> {
    let text = String::from_utf8_lossy(body);
    if !status.is_success() {
        return Err(SigningError::Protocol(format!(
            "submission answered {status}: {}",
            text.trim()
        )));
    }
    RequestId::parse(&text).ok_or_else(|| {
        SigningError::Protocol("submission response did not carry a request id".to_string())
    })
}

pub(crate) fn retrieval_outcome(
    status: StatusCode,
    body: &[u8],
) -> Result<RetrieveOutcome, SigningError> {
    match status {
        StatusCode::NO_CONTENT => Ok(RetrieveOutcome::Pending),
        StatusCode::OK => CertificateChain::from_pem(body)
            .map(RetrieveOutcome::Issued)
            .map_err(|e| SigningError::Protocol(format!("unusable certificate bundle: {e}"))),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            let reason = String::from_utf8_lossy(body).trim().to_string();
            Ok(RetrieveOutcome::Rejected(if reason.is_empty() {
                format!("refused by signing authority ({status})")
            } else {
                reason
            }))
        }
        other => Err(SigningError::Protocol(format!(
            "poll answered {other}: {}",
            String::from_utf8_lossy(body).trim()
        ))),
    }
}
