use anyhow::{bail, Context, Result};
use rustls::server::AllowAnyAuthenticatedClient;
use rustls::{cipher_suite, kx_group, version, ClientConfig, RootCertStore, ServerConfig};
use std::sync::Arc;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::info;

use crate::chain::fingerprint_hex;
use crate::keystore::SecureStore;

/// Mutually authenticated TLS endpoints built from an installed identity.
pub struct TlsComponents {
    pub acceptor: TlsAcceptor,
    pub connector: TlsConnector,
}

impl TlsComponents {
    /// Both sides present the chain under `identity_alias` and only accept
    /// peers whose chains end in one of the trust store's anchors.
    pub fn from_stores(
        keystore: &SecureStore,
        identity_alias: &str,
        key_password: &str,
        truststore: &SecureStore,
    ) -> Result<Self> {
        let chain = keystore
            .certificate_chain(identity_alias)
            .with_context(|| format!("loading chain for {identity_alias}"))?;
        let key = keystore
            .private_key(identity_alias, key_password)
            .with_context(|| format!("loading private key for {identity_alias}"))?
            .to_rustls_key();

        let anchors = truststore
            .trusted_certificates()
            .context("loading trust anchors")?;
        let mut ca_store = RootCertStore::empty();
        let ders: Vec<Vec<u8>> = anchors.iter().map(|(_, c)| c.0.clone()).collect();
        let (added, _ignored) = ca_store.add_parsable_certificates(&ders);
        if added == 0 {
            bail!("trust store holds no usable root certificates");
        }

        let cipher_suites = [
            cipher_suite::TLS13_AES_256_GCM_SHA384,
            cipher_suite::TLS13_CHACHA20_POLY1305_SHA256,
            cipher_suite::TLS13_AES_128_GCM_SHA256,
        ];
        let kx_groups = &[&kx_group::SECP256R1, &kx_group::X25519];
        let protocol_versions = &[&version::TLS13];
        let certs = chain.into_inner();
        let leaf_fp = fingerprint_hex(&certs[0]);

        let server_config = ServerConfig::builder()
            .with_cipher_suites(&cipher_suites)
            .with_kx_groups(kx_groups)
            .with_protocol_versions(protocol_versions)?
            .with_client_cert_verifier(Arc::new(AllowAnyAuthenticatedClient::new(ca_store.clone())))
            .with_single_cert(certs.clone(), key.clone())?;

        let client_config = ClientConfig::builder()
            .with_cipher_suites(&cipher_suites)
            .with_kx_groups(kx_groups)
            .with_protocol_versions(protocol_versions)?
            .with_root_certificates(ca_store)
            .with_client_auth_cert(certs, key)?;

        info!(leaf = %leaf_fp, anchors = added, "Loaded TLS identity from secure stores");
        Ok(Self {
            acceptor: TlsAcceptor::from(Arc::new(server_config)),
            connector: TlsConnector::from(Arc::new(client_config)),
        })
    }
}
