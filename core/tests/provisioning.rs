use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use certprov::{
    PollOptions, ProvisionError, ProvisionOutcome, Provisioner, ProvisioningState,
    RetrieveOutcome, SigningClient, SigningError, IDENTITY_KEY_ALIAS, PENDING_KEY_ALIAS,
    ROOT_CA_ALIAS,
};
use models::{ProvisionConfig, RequestId, StorePaths};
use rcgen::{BasicConstraints, CertificateParams, DistinguishedName, DnType, IsCa};
use tls::{CertificateChain, KdfParams, NodeKeyPair, SecureStore};
use tokio_util::sync::CancellationToken;
use utilities::{FileSystem, RealFileSystem, VirtualFileSystem};

const BASE: &str = "/node";

const CONFIG: &str = r#"
signing_authority_url = "https://doorman.example.net"
keystore_password = "keystore-pass"
truststore_password = "truststore-pass"
key_password = "key-pass"

[identity]
legal_name = "Test LLC"
locality = "London"
email = "ops@test.com"
common_name = "node-1"
"#;

#[derive(Debug, Clone)]
enum Verdict {
    Issue,
    /// Issue a certificate for somebody else's key.
    IssueForeignKey,
    Reject(String),
    PendForever,
}

/// In-process signing authority backed by an rcgen CA.
struct StubAuthority {
    /// Signs leaves: the root itself, or an intermediate below it.
    issuer: Mutex<rcgen::Certificate>,
    /// Everything the authority appends after the leaf, root last.
    tail: Vec<Vec<u8>>,
    request_id: String,
    pending_polls: AtomicU32,
    verdict: Mutex<Verdict>,
    csr: Mutex<Option<Vec<u8>>>,
    issued: Mutex<Option<CertificateChain>>,
    submits: AtomicU32,
    retrieves: AtomicU32,
}

fn ca_certificate(name: &str) -> rcgen::Certificate {
    let mut params = CertificateParams::default();
    params.distinguished_name = {
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, name.to_string());
        dn
    };
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    rcgen::Certificate::from_params(params).unwrap()
}

impl StubAuthority {
    fn new(request_id: &str, pending_polls: u32, verdict: Verdict) -> Arc<Self> {
        let root = ca_certificate("Stub Root CA");
        let root_der = root.serialize_der().unwrap();
        Self::build(root, vec![root_der], request_id, pending_polls, verdict)
    }

    /// Leaves are signed by an intermediate; chains come back as [leaf, intermediate, root].
    fn with_intermediate(request_id: &str, pending_polls: u32, verdict: Verdict) -> Arc<Self> {
        let root = ca_certificate("Stub Root CA");
        let root_der = root.serialize_der().unwrap();
        let intermediate = ca_certificate("Stub Issuing CA");
        let intermediate_der = intermediate.serialize_der_with_signer(&root).unwrap();
        Self::build(
            intermediate,
            vec![intermediate_der, root_der],
            request_id,
            pending_polls,
            verdict,
        )
    }

    fn build(
        issuer: rcgen::Certificate,
        tail: Vec<Vec<u8>>,
        request_id: &str,
        pending_polls: u32,
        verdict: Verdict,
    ) -> Arc<Self> {
        Arc::new(Self {
            issuer: Mutex::new(issuer),
            tail,
            request_id: request_id.to_string(),
            pending_polls: AtomicU32::new(pending_polls),
            verdict: Mutex::new(verdict),
            csr: Mutex::new(None),
            issued: Mutex::new(None),
            submits: AtomicU32::new(0),
            retrieves: AtomicU32::new(0),
        })
    }

    fn root_der(&self) -> &[u8] {
        self.tail.last().unwrap()
    }

    fn set_verdict(&self, verdict: Verdict) {
        *self.verdict.lock().unwrap() = verdict;
    }

    fn submits(&self) -> u32 {
        self.submits.load(Ordering::SeqCst)
    }

    fn retrieves(&self) -> u32 {
        self.retrieves.load(Ordering::SeqCst)
    }

    fn issued(&self) -> Option<CertificateChain> {
        self.issued.lock().unwrap().clone()
    }

    fn sign(&self, csr_der: &[u8]) -> Result<CertificateChain, SigningError> {
        let csr = rcgen::CertificateSigningRequest::from_der(csr_der)
            .map_err(|e| SigningError::Protocol(e.to_string()))?;
        let leaf = csr
            .serialize_der_with_signer(&self.issuer.lock().unwrap())
            .map_err(|e| SigningError::Protocol(e.to_string()))?;
        let mut ders = vec![leaf];
        ders.extend(self.tail.iter().cloned());
        let chain =
            CertificateChain::from_der(ders).map_err(|e| SigningError::Protocol(e.to_string()))?;
        *self.issued.lock().unwrap() = Some(chain.clone());
        Ok(chain)
    }
}

#[async_trait]
impl SigningClient for StubAuthority {
    async fn submit(&self, csr_der: &[u8]) -> Result<RequestId, SigningError> {
        self.submits.fetch_add(1, Ordering::SeqCst);
        *self.csr.lock().unwrap() = Some(csr_der.to_vec());
        Ok(RequestId::parse(&self.request_id).unwrap())
    }

    async fn retrieve(&self, request_id: &RequestId) -> Result<RetrieveOutcome, SigningError> {
        self.retrieves.fetch_add(1, Ordering::SeqCst);
        assert_eq!(request_id.as_str(), self.request_id);

        let verdict = self.verdict.lock().unwrap().clone();
        if matches!(verdict, Verdict::PendForever) {
            return Ok(RetrieveOutcome::Pending);
        }
        if self.pending_polls.load(Ordering::SeqCst) > 0 {
            self.pending_polls.fetch_sub(1, Ordering::SeqCst);
            return Ok(RetrieveOutcome::Pending);
        }
        match verdict {
            Verdict::Reject(reason) => Ok(RetrieveOutcome::Rejected(reason)),
            Verdict::Issue => {
                let csr = self
                    .csr
                    .lock()
                    .unwrap()
                    .clone()
                    .ok_or_else(|| SigningError::Protocol("no request on file".into()))?;
                self.sign(&csr).map(RetrieveOutcome::Issued)
            }
            Verdict::IssueForeignKey => {
                let cfg = config();
                let other = NodeKeyPair::generate().unwrap();
                let csr = other.build_csr(&cfg.identity).unwrap();
                self.sign(&csr).map(RetrieveOutcome::Issued)
            }
            Verdict::PendForever => Ok(RetrieveOutcome::Pending),
        }
    }
}

fn config() -> ProvisionConfig {
    toml::from_str(CONFIG).unwrap()
}

fn light_kdf() -> KdfParams {
    KdfParams {
        memory_kib: 1024,
        iterations: 1,
        parallelism: 1,
    }
}

fn fast_poll() -> PollOptions {
    PollOptions {
        interval: Duration::from_millis(5),
        timeout: None,
    }
}

fn provisioner_on(
    fs: Arc<dyn FileSystem>,
    base: &Path,
    client: Arc<StubAuthority>,
    poll: PollOptions,
) -> Provisioner {
    Provisioner::new(&config(), StorePaths::under(base), fs, client)
        .with_kdf(light_kdf())
        .with_poll_options(poll)
}

fn provisioner(fs: &VirtualFileSystem, client: Arc<StubAuthority>, poll: PollOptions) -> Provisioner {
    provisioner_on(Arc::new(fs.clone()), Path::new(BASE), client, poll)
}

fn keystore(fs: &VirtualFileSystem) -> SecureStore {
    SecureStore::load_or_create(
        fs,
        &StorePaths::under(Path::new(BASE)).keystore,
        "keystore-pass",
        light_kdf(),
    )
    .unwrap()
}

fn truststore(fs: &VirtualFileSystem) -> SecureStore {
    SecureStore::load_or_create(
        fs,
        &StorePaths::under(Path::new(BASE)).truststore,
        "truststore-pass",
        light_kdf(),
    )
    .unwrap()
}

fn paths() -> StorePaths {
    StorePaths::under(Path::new(BASE))
}

#[tokio::test]
async fn pending_twice_then_issued_installs_chain_in_order() {
    let fs = VirtualFileSystem::new();
    let ca = StubAuthority::new("req-42", 2, Verdict::Issue);
    let prov = provisioner(&fs, ca.clone(), fast_poll());

    let outcome = prov.run(&CancellationToken::new()).await.unwrap();

    let issued = ca.issued().expect("authority issued a chain");
    assert!(matches!(
        outcome,
        ProvisionOutcome::Installed { ref request_id, .. } if request_id.as_str() == "req-42"
    ));
    assert_eq!(ca.submits(), 1);
    assert_eq!(ca.retrieves(), 3);

    let ks = keystore(&fs);
    assert!(ks.contains_alias(IDENTITY_KEY_ALIAS));
    assert!(!ks.contains_alias(PENDING_KEY_ALIAS));
    let stored = ks.certificate_chain(IDENTITY_KEY_ALIAS).unwrap();
    assert_eq!(stored, issued);
    assert_eq!(stored.root().0, ca.root_der());

    let key = ks.private_key(IDENTITY_KEY_ALIAS, "key-pass").unwrap();
    assert!(key.matches_certificate(stored.leaf()).unwrap());

    let ts = truststore(&fs);
    assert_eq!(ts.trusted_certificate(ROOT_CA_ALIAS).unwrap().0, ca.root_der());

    assert_eq!(fs.read(&paths().request_id).unwrap(), b"req-42\n");
    assert_eq!(prov.status().unwrap(), ProvisioningState::Installed);
    prov.tls_components().unwrap();
}

#[tokio::test]
async fn intermediate_chain_is_stored_as_issued_and_root_is_trusted() {
    let fs = VirtualFileSystem::new();
    let ca = StubAuthority::with_intermediate("req-42", 1, Verdict::Issue);
    let prov = provisioner(&fs, ca.clone(), fast_poll());

    prov.run(&CancellationToken::new()).await.unwrap();

    let issued = ca.issued().expect("authority issued a chain");
    assert_eq!(issued.len(), 3);
    let stored = keystore(&fs).certificate_chain(IDENTITY_KEY_ALIAS).unwrap();
    assert_eq!(stored, issued);
    assert_eq!(stored.certificates()[1].0, ca.tail[0]);
    assert_eq!(stored.root().0, ca.root_der());

    let ts = truststore(&fs);
    let anchor = ts.trusted_certificate(ROOT_CA_ALIAS).unwrap();
    assert_eq!(anchor, *stored.root());
    assert_ne!(anchor.0, ca.tail[0]);
    assert_eq!(ts.trusted_certificates().unwrap().len(), 1);
    prov.tls_components().unwrap();
}

#[tokio::test]
async fn second_run_makes_no_calls_and_no_writes() {
    let fs = VirtualFileSystem::new();
    let ca = StubAuthority::new("req-42", 0, Verdict::Issue);
    let prov = provisioner(&fs, ca.clone(), fast_poll());
    prov.run(&CancellationToken::new()).await.unwrap();

    let keystore_before = fs.read(&paths().keystore).unwrap();
    let truststore_before = fs.read(&paths().truststore).unwrap();
    let (submits, retrieves) = (ca.submits(), ca.retrieves());

    let outcome = prov.run(&CancellationToken::new()).await.unwrap();

    assert_eq!(outcome, ProvisionOutcome::AlreadyInstalled);
    assert_eq!(ca.submits(), submits);
    assert_eq!(ca.retrieves(), retrieves);
    assert_eq!(fs.read(&paths().keystore).unwrap(), keystore_before);
    assert_eq!(fs.read(&paths().truststore).unwrap(), truststore_before);
}

#[tokio::test]
async fn restart_after_deadline_resumes_without_resubmitting() {
    let fs = VirtualFileSystem::new();
    let ca = StubAuthority::new("req-42", 0, Verdict::PendForever);
    let bounded = PollOptions {
        interval: Duration::from_millis(5),
        timeout: Some(Duration::from_millis(20)),
    };

    let err = provisioner(&fs, ca.clone(), bounded)
        .run(&CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, ProvisionError::TimedOut { .. }), "{err}");
    assert_eq!(ca.submits(), 1);

    let restarted = provisioner(&fs, ca.clone(), fast_poll());
    assert_eq!(
        restarted.status().unwrap(),
        ProvisioningState::AwaitingApproval(RequestId::parse("req-42").unwrap())
    );

    ca.set_verdict(Verdict::Issue);
    let outcome = restarted.run(&CancellationToken::new()).await.unwrap();

    assert!(matches!(outcome, ProvisionOutcome::Installed { .. }));
    assert_eq!(ca.submits(), 1);
    let ks = keystore(&fs);
    let key = ks.private_key(IDENTITY_KEY_ALIAS, "key-pass").unwrap();
    assert!(key
        .matches_certificate(ks.certificate_chain(IDENTITY_KEY_ALIAS).unwrap().leaf())
        .unwrap());
}

#[tokio::test]
async fn recorded_request_id_goes_straight_to_polling() {
    let fs = VirtualFileSystem::new();
    fs.write(&paths().request_id, b"req-42\n").unwrap();
    let ca = StubAuthority::new("req-42", 0, Verdict::Reject("duplicate subject".into()));

    let err = provisioner(&fs, ca.clone(), fast_poll())
        .run(&CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, ProvisionError::RequestRejected { .. }), "{err}");
    assert_eq!(ca.submits(), 0);
    assert_eq!(ca.retrieves(), 1);
}

#[tokio::test]
async fn rejection_is_terminal_and_installs_nothing() {
    let fs = VirtualFileSystem::new();
    let ca = StubAuthority::new("req-42", 1, Verdict::Reject("unknown organisation".into()));

    let err = provisioner(&fs, ca.clone(), fast_poll())
        .run(&CancellationToken::new())
        .await
        .unwrap_err();

    match err {
        ProvisionError::RequestRejected { request_id, reason } => {
            assert_eq!(request_id.as_str(), "req-42");
            assert_eq!(reason, "unknown organisation");
        }
        other => panic!("expected rejection, got {other}"),
    }
    assert_eq!(ca.retrieves(), 2);
    assert!(!keystore(&fs).contains_alias(IDENTITY_KEY_ALIAS));
    assert!(!fs.exists(&paths().truststore));
}

#[tokio::test]
async fn unrecordable_request_id_is_surfaced_with_the_id() {
    let fs = VirtualFileSystem::new();
    fs.mark_read_only(&paths().request_id);
    let ca = StubAuthority::new("req-42", 0, Verdict::Issue);

    let err = provisioner(&fs, ca.clone(), fast_poll())
        .run(&CancellationToken::new())
        .await
        .unwrap_err();

    match &err {
        ProvisionError::Persistence { request_id, .. } => assert_eq!(request_id.as_str(), "req-42"),
        other => panic!("expected persistence failure, got {other}"),
    }
    assert!(err.to_string().contains("req-42"));
    assert_eq!(ca.submits(), 1);
    assert_eq!(ca.retrieves(), 0);
    assert!(!fs.exists(&paths().request_id));
}

#[tokio::test]
async fn unwritable_keystore_fails_before_submitting() {
    let fs = VirtualFileSystem::new();
    fs.mark_read_only(&paths().keystore);
    let ca = StubAuthority::new("req-42", 0, Verdict::Issue);

    let err = provisioner(&fs, ca.clone(), fast_poll())
        .run(&CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, ProvisionError::StorageWrite(_)), "{err}");
    assert_eq!(ca.submits(), 0);
}

#[tokio::test]
async fn wrong_keystore_password_is_a_storage_access_error() {
    let fs = VirtualFileSystem::new();
    let ca = StubAuthority::new("req-42", 0, Verdict::Issue);
    provisioner(&fs, ca.clone(), fast_poll())
        .run(&CancellationToken::new())
        .await
        .unwrap();

    let mut cfg = config();
    cfg.keystore_password = "not-the-password".to_string();
    let prov = Provisioner::new(&cfg, paths(), Arc::new(fs.clone()), ca.clone())
        .with_kdf(light_kdf());

    assert!(matches!(
        prov.run(&CancellationToken::new()).await,
        Err(ProvisionError::StorageAccess(_))
    ));
}

#[tokio::test]
async fn chain_for_another_key_is_not_installed() {
    let fs = VirtualFileSystem::new();
    let ca = StubAuthority::new("req-42", 0, Verdict::IssueForeignKey);

    let err = provisioner(&fs, ca.clone(), fast_poll())
        .run(&CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, ProvisionError::ChainMismatch(_)), "{err}");
    let ks = keystore(&fs);
    assert!(!ks.contains_alias(IDENTITY_KEY_ALIAS));
    assert!(ks.contains_alias(PENDING_KEY_ALIAS));
}

#[tokio::test]
async fn cancellation_keeps_the_recorded_request() {
    let fs = VirtualFileSystem::new();
    let ca = StubAuthority::new("req-42", 0, Verdict::PendForever);
    let prov = provisioner(
        &fs,
        ca.clone(),
        PollOptions {
            interval: Duration::from_secs(3600),
            timeout: None,
        },
    );
    let token = CancellationToken::new();
    let canceller = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        canceller.cancel();
    });

    let err = prov.run(&token).await.unwrap_err();

    assert!(matches!(err, ProvisionError::Cancelled(_)), "{err}");
    assert_eq!(fs.read(&paths().request_id).unwrap(), b"req-42\n");
    assert_eq!(
        prov.status().unwrap(),
        ProvisioningState::AwaitingApproval(RequestId::parse("req-42").unwrap())
    );
}

#[tokio::test]
async fn missing_trust_anchor_is_restored_without_network() {
    let fs = VirtualFileSystem::new();
    let ca = StubAuthority::new("req-42", 0, Verdict::Issue);
    let prov = provisioner(&fs, ca.clone(), fast_poll());
    prov.run(&CancellationToken::new()).await.unwrap();

    fs.remove_file(&paths().truststore).unwrap();
    let (submits, retrieves) = (ca.submits(), ca.retrieves());

    let outcome = prov.run(&CancellationToken::new()).await.unwrap();

    assert_eq!(outcome, ProvisionOutcome::TrustAnchorRepaired);
    assert_eq!((ca.submits(), ca.retrieves()), (submits, retrieves));
    assert_eq!(
        truststore(&fs).trusted_certificate(ROOT_CA_ALIAS).unwrap().0,
        ca.root_der()
    );
}

#[tokio::test]
async fn status_tracks_local_progress() {
    let fs = VirtualFileSystem::new();
    let ca = StubAuthority::new("req-42", 0, Verdict::Issue);
    let prov = provisioner(&fs, ca.clone(), fast_poll());
    assert_eq!(prov.status().unwrap(), ProvisioningState::NoIdentity);

    let mut ks = keystore(&fs);
    let key = NodeKeyPair::generate().unwrap();
    let placeholder =
        CertificateChain::new(vec![key.self_signed_certificate(&config().identity).unwrap()])
            .unwrap();
    ks.add_or_replace_key(PENDING_KEY_ALIAS, &key, "key-pass", &placeholder)
        .unwrap();
    ks.save(&fs, &paths().keystore, "keystore-pass").unwrap();
    assert_eq!(prov.status().unwrap(), ProvisioningState::RequestPending);

    prov.run(&CancellationToken::new()).await.unwrap();
    let installed = keystore(&fs).private_key(IDENTITY_KEY_ALIAS, "key-pass").unwrap();
    assert_eq!(installed.public_key_raw().unwrap(), key.public_key_raw().unwrap());
}

#[tokio::test]
async fn provisions_on_the_real_filesystem() {
    let tmp = tempfile::tempdir().unwrap();
    let ca = StubAuthority::new("req-7", 1, Verdict::Issue);
    let prov = provisioner_on(Arc::new(RealFileSystem), tmp.path(), ca.clone(), fast_poll());

    prov.run(&CancellationToken::new()).await.unwrap();

    let paths = StorePaths::under(tmp.path());
    assert!(paths.keystore.is_file());
    assert!(paths.truststore.is_file());
    assert_eq!(std::fs::read_to_string(&paths.request_id).unwrap(), "req-7\n");
    let leftovers: Vec<_> = std::fs::read_dir(&paths.certificates_dir)
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().contains(".tmp"))
        .collect();
    assert!(leftovers.is_empty());
    prov.tls_components().unwrap();
}
