use models::IdentityDescriptor;
use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair, SanType, PKCS_ECDSA_P256_SHA256};
use rustls::{Certificate, PrivateKey};
use std::fmt;
use thiserror::Error;
use x509_parser::prelude::*;
use zeroize::Zeroizing;

#[derive(Debug, Error)]
pub enum CsrError {
    #[error("key material error: {0}")]
    Rcgen(#[from] rcgen::RcgenError),
    #[error("failed to parse certificate: {0}")]
    Certificate(String),
}

/// ECDSA P-256 key pair, held as PKCS#8 DER.
pub struct NodeKeyPair {
    pkcs8: Zeroizing<Vec<u8>>,
}

impl fmt::Debug for NodeKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeKeyPair")
            .field("pkcs8", &"<redacted>")
            .finish()
    }
}

impl NodeKeyPair {
    pub fn generate() -> Result<Self, CsrError> {
        let key = KeyPair::generate(&PKCS_ECDSA_P256_SHA256)?;
        Ok(Self {
            pkcs8: Zeroizing::new(key.serialize_der()),
        })
    }

    pub fn from_pkcs8_der(der: &[u8]) -> Result<Self, CsrError> {
        KeyPair::from_der(der)?;
        Ok(Self {
            pkcs8: Zeroizing::new(der.to_vec()),
        })
    }

    pub fn pkcs8_der(&self) -> &[u8] {
        &self.pkcs8
    }

    pub fn public_key_raw(&self) -> Result<Vec<u8>, CsrError> {
        Ok(self.rcgen_key()?.public_key_raw().to_vec())
    }

    /// DER-encoded PKCS#10 request for `identity`, signed with this key.
    pub fn build_csr(&self, identity: &IdentityDescriptor) -> Result<Vec<u8>, CsrError> {
        let cert = rcgen::Certificate::from_params(self.params_for(identity)?)?;
        Ok(cert.serialize_request_der()?)
    }

    /// Placeholder certificate stored next to a key that is still awaiting approval.
    pub fn self_signed_certificate(
        &self,
        identity: &IdentityDescriptor,
    ) -> Result<Certificate, CsrError> {
        let cert = rcgen::Certificate::from_params(self.params_for(identity)?)?;
        Ok(Certificate(cert.serialize_der()?))
    }

    /// True when `cert` carries this key pair's public key.
    pub fn matches_certificate(&self, cert: &Certificate) -> Result<bool, CsrError> {
        let (_, parsed) = X509Certificate::from_der(&cert.0)
            .map_err(|e| CsrError::Certificate(e.to_string()))?;
        let ours = self.public_key_raw()?;
        Ok(&*parsed.public_key().subject_public_key.data == ours.as_slice())
    }

    pub fn to_rustls_key(&self) -> PrivateKey {
        PrivateKey(self.pkcs8.to_vec())
    }

    fn rcgen_key(&self) -> Result<KeyPair, CsrError> {
        Ok(KeyPair::from_der(&self.pkcs8)?)
    }

    fn params_for(&self, identity: &IdentityDescriptor) -> Result<CertificateParams, CsrError> {
        let common_name = identity.common_name();
        let mut params = CertificateParams::default();
        params.alg = &PKCS_ECDSA_P256_SHA256;
        params.distinguished_name = {
            let mut dn = DistinguishedName::new();
            dn.push(DnType::OrganizationName, identity.legal_name.clone());
            dn.push(DnType::LocalityName, identity.locality.clone());
            dn.push(DnType::CountryName, identity.country.clone());
            dn.push(DnType::CommonName, common_name.clone());
            dn
        };
        // The email travels only as an RFC 822 SAN.
        params.subject_alt_names = vec![
            SanType::DnsName(common_name),
            SanType::Rfc822Name(identity.email.clone()),
        ];
        params.key_pair = Some(self.rcgen_key()?);
        Ok(params)
    }
}
