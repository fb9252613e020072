use models::{ProvisionConfig, RequestId};
use std::future::Future;
use std::time::Duration;
use tls::CertificateChain;
use tokio::time::{sleep_until, timeout_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::ProvisionError;
use crate::signing::{RetrieveOutcome, SigningClient};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollOptions {
    pub interval: Duration,
    /// Overall bound on the wait. `None` polls until approval or rejection.
    pub timeout: Option<Duration>,
}

impl PollOptions {
    pub fn from_config(cfg: &ProvisionConfig) -> Self {
        Self {
            interval: Duration::from_secs(cfg.poll_interval_secs),
            timeout: cfg.poll_timeout_secs.map(Duration::from_secs),
        }
    }
}

impl Default for PollOptions {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            timeout: None,
        }
    }
}

/// Ask the authority about `request_id` every `options.interval` until it is
/// issued or rejected.
///
/// Transport and protocol failures are logged and retried on the next tick.
/// Cancellation and the timeout apply to in-flight queries as well as to the
/// wait between them.
pub async fn await_approval(
    client: &dyn SigningClient,
    request_id: &RequestId,
    options: PollOptions,
    token: &CancellationToken,
) -> Result<CertificateChain, ProvisionError> {
    let started = Instant::now();
    let deadline = options.timeout.map(|timeout| started + timeout);
    let timed_out = || ProvisionError::TimedOut {
        request_id: request_id.clone(),
        waited: started.elapsed(),
    };
    let mut attempt: u64 = 0;

    loop {
        if token.is_cancelled() {
            return Err(ProvisionError::Cancelled(request_id.clone()));
        }
        if deadline.is_some_and(|d| Instant::now() >= d) {
            return Err(timed_out());
        }
        attempt += 1;

        let answer = tokio::select! {
            _ = token.cancelled() => {
                info!(request_id = %request_id, attempt, "Polling cancelled during query");
                return Err(ProvisionError::Cancelled(request_id.clone()));
            }
            answer = until(deadline, client.retrieve(request_id)) => answer,
        };
        let Some(answer) = answer else {
            warn!(request_id = %request_id, attempt, "Query still running at the deadline");
            return Err(timed_out());
        };

        match answer {
            Ok(RetrieveOutcome::Issued(chain)) => {
                info!(
                    request_id = %request_id,
                    attempt,
                    chain_len = chain.len(),
                    "Certificate request approved"
                );
                return Ok(chain);
            }
            Ok(RetrieveOutcome::Rejected(reason)) => {
                warn!(request_id = %request_id, "Certificate request rejected: {reason}");
                return Err(ProvisionError::RequestRejected {
                    request_id: request_id.clone(),
                    reason,
                });
            }
            Ok(RetrieveOutcome::Pending) => {
                info!(
                    request_id = %request_id,
                    attempt,
                    "Certificate request not yet approved; waiting {:?}",
                    options.interval
                );
            }
            Err(e) => {
                warn!(request_id = %request_id, attempt, "Polling signing authority failed: {e}");
            }
        }

        let wake = match deadline {
            Some(d) => (Instant::now() + options.interval).min(d),
            None => Instant::now() + options.interval,
        };
        debug!(request_id = %request_id, "Next poll in {:?}", wake - Instant::now());
        tokio::select! {
            _ = token.cancelled() => {
                info!(request_id = %request_id, "Polling cancelled");
                return Err(ProvisionError::Cancelled(request_id.clone()));
            }
            _ = sleep_until(wake) => {}
        }
    }
}

/// Run `query` to completion, or give up at `deadline` and return `None`.
async fn until<F: Future>(deadline: Option<Instant>, query: F) -> Option<F::Output> {
    match deadline {
        Some(d) => timeout_at(d, query).await.ok(),
        None => Some(query.await),
    }
}
