pub mod chain;
pub mod csr;
pub mod keystore;
mod runtime;
pub mod sealing;

pub use chain::{der_to_pem, fingerprint_hex, CertificateChain, ChainError};
pub use csr::{CsrError, NodeKeyPair};
pub use keystore::{SecureStore, StoreError};
pub use runtime::TlsComponents;
pub use sealing::{KdfParams, SealError};
