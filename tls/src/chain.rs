use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use rustls::Certificate;
use std::io::BufReader;
use thiserror::Error;
use utilities::sha256_hex;

const PEM_BEGIN: &str = "-----BEGIN CERTIFICATE-----";
const PEM_END: &str = "-----END CERTIFICATE-----";

#[derive(Debug, Error)]
pub enum ChainError {
    #[error("certificate chain is empty")]
    Empty,
    #[error("failed to parse PEM certificates: {0}")]
    Pem(#[from] std::io::Error),
}

/// Ordered certificate chain: leaf first, issuing root last.
///
/// The order is kept exactly as received; nothing in this crate sorts or
/// rebuilds it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateChain(Vec<Certificate>);

impl CertificateChain {
    pub fn new(certs: Vec<Certificate>) -> Result<Self, ChainError> {
        if certs.is_empty() {
            return Err(ChainError::Empty);
        }
        Ok(Self(certs))
    }

    pub fn from_der(ders: Vec<Vec<u8>>) -> Result<Self, ChainError> {
        Self::new(ders.into_iter().map(Certificate).collect())
    }

    pub fn from_pem(pem: &[u8]) -> Result<Self, ChainError> {
        let mut reader = BufReader::new(std::io::Cursor::new(pem));
        let ders = rustls_pemfile::certs(&mut reader)?;
        Self::from_der(ders)
    }

    pub fn to_pem(&self) -> String {
        self.0
            .iter()
            .map(|c| der_to_pem(&c.0))
            .collect::<Vec<_>>()
            .join("")
    }

    pub fn leaf(&self) -> &Certificate {
        &self.0[0]
    }

    pub fn root(&self) -> &Certificate {
        &self.0[self.0.len() - 1]
    }

    pub fn certificates(&self) -> &[Certificate] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_inner(self) -> Vec<Certificate> {
        self.0
    }
}

pub fn der_to_pem(der: &[u8]) -> String {
    let body = BASE64.encode(der);
    let mut out = String::with_capacity(body.len() + 64);
    out.push_str(PEM_BEGIN);
    out.push('\n');
    for line in body.as_bytes().chunks(64) {
        out.push_str(&String::from_utf8_lossy(line));
        out.push('\n');
    }
    out.push_str(PEM_END);
    out.push('\n');
    out
}

pub fn fingerprint_hex(cert: &Certificate) -> String {
    sha256_hex(&cert.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_chain_is_rejected() {
        assert!(matches!(
            CertificateChain::new(Vec::new()),
            Err(ChainError::Empty)
        ));
    }

    #[test]
    fn leaf_and_root_follow_input_order() {
        let chain = CertificateChain::from_der(vec![b"leaf".to_vec(), b"mid".to_vec(), b"root".to_vec()])
            .unwrap();
        assert_eq!(chain.leaf().0, b"leaf");
        assert_eq!(chain.root().0, b"root");
        assert_eq!(chain.len(), 3);
    }

    #[test]
    fn single_certificate_is_both_leaf_and_root() {
        let chain = CertificateChain::from_der(vec![b"only".to_vec()]).unwrap();
        assert_eq!(chain.leaf(), chain.root());
    }

    #[test]
    fn pem_rendering_is_parsed_back_in_order() {
        let chain = CertificateChain::from_der(vec![vec![1u8; 100], vec![2u8; 70]]).unwrap();
        let pem = chain.to_pem();
        assert_eq!(pem.matches(PEM_BEGIN).count(), 2);
        let parsed = CertificateChain::from_pem(pem.as_bytes()).unwrap();
        assert_eq!(parsed, chain);
    }
}
