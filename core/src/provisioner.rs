//! Drives a node from "no identity" to "identity installed".
//!
//! ```text
//! NoIdentity -> RequestPending -> AwaitingApproval -> Approved -> Installed
//! ```
//!
//! Every step is re-entrant: the pending key pair lives in the key store and
//! the request id lives in its own file, so a restarted run picks up where the
//! previous one stopped. The identity alias in the key store is the commit
//! record; once present, a run performs no network traffic.

use models::{IdentityDescriptor, ProvisionConfig, RequestId, StorePaths};
use std::fmt;
use std::sync::Arc;
use tls::{fingerprint_hex, CertificateChain, KdfParams, NodeKeyPair, SecureStore, TlsComponents};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use utilities::FileSystem;

use crate::error::ProvisionError;
use crate::poller::{await_approval, PollOptions};
use crate::signing::SigningClient;
use crate::tracker::RequestTracker;

pub const IDENTITY_KEY_ALIAS: &str = "identity-private-key";
pub const PENDING_KEY_ALIAS: &str = "pending-identity-key";
pub const ROOT_CA_ALIAS: &str = "root-ca";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProvisioningState {
    NoIdentity,
    /// Key pair generated and stored; no request recorded yet.
    RequestPending,
    AwaitingApproval(RequestId),
    Approved(RequestId),
    Installed,
}

impl fmt::Display for ProvisioningState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProvisioningState::NoIdentity => f.write_str("no identity"),
            ProvisioningState::RequestPending => f.write_str("key generated, request not submitted"),
            ProvisioningState::AwaitingApproval(id) => write!(f, "awaiting approval of {id}"),
            ProvisioningState::Approved(id) => write!(f, "request {id} approved"),
            ProvisioningState::Installed => f.write_str("identity installed"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProvisionOutcome {
    /// Identity and trust anchor were already present; nothing changed.
    AlreadyInstalled,
    /// Identity was present but the trust anchor was missing and has been restored.
    TrustAnchorRepaired,
    Installed {
        request_id: RequestId,
        leaf_fingerprint: String,
    },
}

pub struct Provisioner {
    fs: Arc<dyn FileSystem>,
    paths: StorePaths,
    identity: IdentityDescriptor,
    keystore_password: String,
    truststore_password: String,
    key_password: String,
    kdf: KdfParams,
    poll: PollOptions,
    tracker: RequestTracker,
    client: Arc<dyn SigningClient>,
}

impl Provisioner {
    pub fn new(
        cfg: &ProvisionConfig,
        paths: StorePaths,
        fs: Arc<dyn FileSystem>,
        client: Arc<dyn SigningClient>,
    ) -> Self {
        let tracker = RequestTracker::new(Arc::clone(&fs), paths.request_id.clone());
        Self {
            fs,
            paths,
            identity: cfg.identity.clone(),
            keystore_password: cfg.keystore_password.clone(),
            truststore_password: cfg.truststore_password.clone(),
            key_password: cfg.key_password().to_string(),
            kdf: cfg.kdf.into(),
            poll: PollOptions::from_config(cfg),
            tracker,
            client,
        }
    }

    pub fn with_poll_options(mut self, poll: PollOptions) -> Self {
        self.poll = poll;
        self
    }

    pub fn with_kdf(mut self, kdf: KdfParams) -> Self {
        self.kdf = kdf;
        self
    }

    /// Where a run would resume from, judged from local state only.
    pub fn status(&self) -> Result<ProvisioningState, ProvisionError> {
        let keystore = self.load_keystore()?;
        if keystore.contains_alias(IDENTITY_KEY_ALIAS) {
            return Ok(ProvisioningState::Installed);
        }
        if let Some(request_id) = self.tracker.persisted()? {
            return Ok(ProvisioningState::AwaitingApproval(request_id));
        }
        if keystore.contains_alias(PENDING_KEY_ALIAS) {
            return Ok(ProvisioningState::RequestPending);
        }
        Ok(ProvisioningState::NoIdentity)
    }

    /// Run the workflow to completion, resuming any earlier partial run.
    pub async fn run(&self, token: &CancellationToken) -> Result<ProvisionOutcome, ProvisionError> {
        let mut keystore = self.load_keystore()?;
        if keystore.contains_alias(IDENTITY_KEY_ALIAS) {
            info!(alias = IDENTITY_KEY_ALIAS, "Node identity already installed");
            return self.ensure_trust_anchor(&keystore);
        }

        let mut state = ProvisioningState::NoIdentity;
        let key = self.obtain_key_pair(&mut keystore)?;
        self.advance(&mut state, ProvisioningState::RequestPending);

        let request_id = self
            .tracker
            .submit(&key, &self.identity, self.client.as_ref())
            .await?;
        self.advance(&mut state, ProvisioningState::AwaitingApproval(request_id.clone()));

        let chain = await_approval(self.client.as_ref(), &request_id, self.poll, token).await?;
        verify_chain(&key, &chain)?;
        self.advance(&mut state, ProvisioningState::Approved(request_id.clone()));

        self.install(&mut keystore, &key, &chain)?;
        self.advance(&mut state, ProvisioningState::Installed);

        Ok(ProvisionOutcome::Installed {
            request_id,
            leaf_fingerprint: fingerprint_hex(chain.leaf()),
        })
    }

    /// Build TLS client and server configuration from the installed identity.
    pub fn tls_components(&self) -> anyhow::Result<TlsComponents> {
        let keystore = self.load_keystore()?;
        let truststore = self.load_truststore()?;
        TlsComponents::from_stores(&keystore, IDENTITY_KEY_ALIAS, &self.key_password, &truststore)
    }

    /// Installed chain and trust anchors, for display.
    pub fn installed_certificates(
        &self,
    ) -> Result<(Option<CertificateChain>, Vec<(String, rustls::Certificate)>), ProvisionError> {
        let keystore = self.load_keystore()?;
        let chain = if keystore.contains_alias(IDENTITY_KEY_ALIAS) {
            Some(keystore.certificate_chain(IDENTITY_KEY_ALIAS)?)
        } else {
            None
        };
        let anchors = self.load_truststore()?.trusted_certificates()?;
        Ok((chain, anchors))
    }

    fn advance(&self, state: &mut ProvisioningState, next: ProvisioningState) {
        info!(from = %state, to = %next, "Provisioning state changed");
        *state = next;
    }

    fn load_keystore(&self) -> Result<SecureStore, ProvisionError> {
        Ok(SecureStore::load_or_create(
            self.fs.as_ref(),
            &self.paths.keystore,
            &self.keystore_password,
            self.kdf,
        )?)
    }

    fn load_truststore(&self) -> Result<SecureStore, ProvisionError> {
        Ok(SecureStore::load_or_create(
            self.fs.as_ref(),
            &self.paths.truststore,
            &self.truststore_password,
            self.kdf,
        )?)
    }

    /// Reuse the stored pending key pair, or generate and store a new one.
    fn obtain_key_pair(&self, keystore: &mut SecureStore) -> Result<NodeKeyPair, ProvisionError> {
        if keystore.contains_alias(PENDING_KEY_ALIAS) {
            info!(alias = PENDING_KEY_ALIAS, "Reusing pending key pair");
            return Ok(keystore.private_key(PENDING_KEY_ALIAS, &self.key_password)?);
        }
        if let Some(request_id) = self.tracker.persisted()? {
            warn!(
                request_id = %request_id,
                "Request id recorded but its key pair is missing; the issued certificate will not match a new key"
            );
        }

        let key = NodeKeyPair::generate()?;
        let placeholder = CertificateChain::new(vec![key.self_signed_certificate(&self.identity)?])
            .map_err(|e| ProvisionError::ChainMismatch(e.to_string()))?;
        keystore.add_or_replace_key(PENDING_KEY_ALIAS, &key, &self.key_password, &placeholder)?;
        keystore.save(self.fs.as_ref(), &self.paths.keystore, &self.keystore_password)?;
        info!(alias = PENDING_KEY_ALIAS, "Generated and stored new key pair");
        Ok(key)
    }

    /// Trust store first, key store last: the identity alias only appears once
    /// the anchor it depends on is already durable.
    fn install(
        &self,
        keystore: &mut SecureStore,
        key: &NodeKeyPair,
        chain: &CertificateChain,
    ) -> Result<(), ProvisionError> {
        let mut truststore = self.load_truststore()?;
        truststore.add_or_replace_certificate(ROOT_CA_ALIAS, chain.root());
        truststore.save(self.fs.as_ref(), &self.paths.truststore, &self.truststore_password)?;

        keystore.add_or_replace_key(IDENTITY_KEY_ALIAS, key, &self.key_password, chain)?;
        keystore.remove_alias(PENDING_KEY_ALIAS);
        keystore.save(self.fs.as_ref(), &self.paths.keystore, &self.keystore_password)?;

        info!(
            alias = IDENTITY_KEY_ALIAS,
            chain_len = chain.len(),
            leaf = %fingerprint_hex(chain.leaf()),
            root = %fingerprint_hex(chain.root()),
            "Installed node identity"
        );
        Ok(())
    }

    fn ensure_trust_anchor(&self, keystore: &SecureStore) -> Result<ProvisionOutcome, ProvisionError> {
        let mut truststore = self.load_truststore()?;
        if truststore.contains_alias(ROOT_CA_ALIAS) {
            return Ok(ProvisionOutcome::AlreadyInstalled);
        }
        let chain = keystore.certificate_chain(IDENTITY_KEY_ALIAS)?;
        truststore.add_or_replace_certificate(ROOT_CA_ALIAS, chain.root());
        truststore.save(self.fs.as_ref(), &self.paths.truststore, &self.truststore_password)?;
        warn!(alias = ROOT_CA_ALIAS, "Trust anchor was missing; restored it from the installed chain");
        Ok(ProvisionOutcome::TrustAnchorRepaired)
    }
}

/// The leaf must carry our public key. This is a structural check only; the
/// chain is trusted as delivered by the authority.
fn verify_chain(key: &NodeKeyPair, chain: &CertificateChain) -> Result<(), ProvisionError> {
    match key.matches_certificate(chain.leaf()) {
        Ok(true) => Ok(()),
        Ok(false) => Err(ProvisionError::ChainMismatch(
            "leaf certificate does not carry this node's public key".to_string(),
        )),
        Err(e) => Err(ProvisionError::ChainMismatch(e.to_string())),
    }
}
