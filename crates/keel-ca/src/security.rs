//! The live credential bundle a node serves requests with.
//!
//! A `SecurityConfig` holds immutable snapshots behind short-lived locks:
//! writers build a complete replacement and swap the `Arc`, so a
//! concurrent reader observes either the fully old or fully new state,
//! never an old certificate paired with a new key. The trust pool swaps
//! independently of the credential pair, so root rotation never touches
//! a valid certificate.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rcgen::KeyPair;
use tracing::{debug, info, warn};

use keel_core::{CaError, CertificateInvalidReason, NodeIdentity, Result};

use crate::atomic::{write_file_atomic, CERT_FILE_MODE};
use crate::certs;
use crate::csr::generate_key_and_csr;
use crate::external::ExternalCa;
use crate::keystore::KeyStore;
use crate::paths::CertPaths;
use crate::root::{RootCa, SigningPolicy};

/// One issued certificate/key pair plus the identity it attests.
#[derive(Debug, Clone)]
pub struct NodeCredentials {
    /// Issued certificate, PEM
    pub cert_pem: String,
    /// Matching private key, PEM
    pub key_pem: String,
    /// Identity encoded in the certificate subject
    pub identity: NodeIdentity,
    /// Certificate validity start
    pub not_before: DateTime<Utc>,
    /// Certificate validity end
    pub not_after: DateTime<Utc>,
}

impl NodeCredentials {
    /// Key and certificate concatenated, the mTLS client identity form.
    #[must_use]
    pub fn pem_bundle(&self) -> String {
        format!("{}\n{}", self.key_pem.trim_end(), self.cert_pem)
    }

    /// Validity remaining right now; zero once expired.
    #[must_use]
    pub fn remaining_validity(&self) -> Duration {
        (self.not_after - Utc::now()).to_std().unwrap_or(Duration::ZERO)
    }
}

/// What `create_security_config` needs to issue fresh credentials.
#[derive(Debug, Clone)]
pub struct CertificateRequestConfig {
    /// Identity to request a certificate for
    pub identity: NodeIdentity,
    /// External signer endpoints, used when the root cannot sign locally
    pub signer_endpoints: Vec<String>,
    /// Cluster join secret, presented on first issuance only
    pub join_secret: Option<String>,
    /// Per-attempt network timeout
    pub request_timeout: Duration,
}

impl CertificateRequestConfig {
    /// Request config for locally signed issuance.
    pub fn local(identity: NodeIdentity) -> Self {
        Self {
            identity,
            signer_endpoints: Vec::new(),
            join_secret: None,
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// Live security state for one node process.
pub struct SecurityConfig {
    paths: CertPaths,
    key_store: Arc<KeyStore>,
    credentials: RwLock<Arc<NodeCredentials>>,
    root: RwLock<Arc<RootCa>>,
    external: RwLock<Option<Arc<ExternalCa>>>,
    request_timeout: Duration,
}

impl SecurityConfig {
    fn assemble(
        root: RootCa,
        key_store: Arc<KeyStore>,
        paths: CertPaths,
        credentials: NodeCredentials,
        external: Option<Arc<ExternalCa>>,
        request_timeout: Duration,
    ) -> Self {
        let config = Self {
            paths,
            key_store,
            credentials: RwLock::new(Arc::new(credentials)),
            root: RwLock::new(Arc::new(root)),
            external: RwLock::new(external),
            request_timeout,
        };
        config.rebuild_external();
        config
    }

    /// Snapshot of the current certificate/key pair.
    #[must_use]
    pub fn credentials(&self) -> Arc<NodeCredentials> {
        Arc::clone(&self.credentials.read().expect("credentials lock poisoned"))
    }

    /// Snapshot of the current trust pool.
    #[must_use]
    pub fn root_ca(&self) -> Arc<RootCa> {
        Arc::clone(&self.root.read().expect("root lock poisoned"))
    }

    /// Handle to the external signer, when one is configured.
    #[must_use]
    pub fn external_ca(&self) -> Option<Arc<ExternalCa>> {
        self.external.read().expect("external lock poisoned").clone()
    }

    /// The key store credentials are persisted through.
    #[must_use]
    pub fn key_store(&self) -> &KeyStore {
        &self.key_store
    }

    /// On-disk layout this config persists to.
    #[must_use]
    pub fn paths(&self) -> &CertPaths {
        &self.paths
    }

    /// Swap in a freshly issued credential pair.
    ///
    /// The renewal process is the only caller. The external signer client
    /// is rebuilt afterwards so subsequent signing requests authenticate
    /// with the new certificate.
    pub fn update_credentials(&self, credentials: NodeCredentials) {
        *self.credentials.write().expect("credentials lock poisoned") = Arc::new(credentials);
        self.rebuild_external();
    }

    /// Replace the trusted root pool, independently of the credential pair.
    ///
    /// The replacement bundle is validated, persisted, and swapped in one
    /// step; certificates issued under any root still in the pool keep
    /// verifying.
    pub fn update_root_ca(
        &self,
        bundle_pem: &str,
        key_pem: Option<&str>,
        policy: SigningPolicy,
    ) -> Result<()> {
        let root = RootCa::new(bundle_pem, key_pem, policy)?;
        root.save(&self.paths)?;

        info!(
            certs = root.cert_count(),
            can_sign = root.can_sign(),
            "rotated trusted root pool"
        );
        *self.root.write().expect("root lock poisoned") = Arc::new(root);
        self.rebuild_external();
        Ok(())
    }

    /// Rebuild the external signer client against the current trust pool
    /// and credentials. Kept best-effort: a rebuild failure leaves the
    /// previous client in place.
    fn rebuild_external(&self) {
        let current = self.external_ca();
        let Some(current) = current else { return };

        let root = self.root_ca();
        let creds = self.credentials();
        let rebuilt = ExternalCa::builder(&current.urls())
            .trust_root(root.bundle_pem())
            .identity(creds.pem_bundle())
            .request_timeout(self.request_timeout)
            .build();

        match rebuilt {
            Ok(ca) => {
                *self.external.write().expect("external lock poisoned") = Some(Arc::new(ca));
            }
            Err(e) => warn!(error = %e, "keeping previous external signer client"),
        }
    }
}

impl std::fmt::Debug for SecurityConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let creds = self.credentials();
        f.debug_struct("SecurityConfig")
            .field("node_id", &creds.identity.node_id)
            .field("role", &creds.identity.role)
            .field("not_after", &creds.not_after)
            .field("external", &self.external_ca().is_some())
            .finish()
    }
}

/// Read and validate the stored credential pair.
///
/// Temporal rules: a not-yet-valid certificate is always rejected;
/// an expired one is forgiven only when `allow_expired` is set. The
/// certificate must chain to the trust pool and its key must match.
///
/// # Errors
///
/// `CaError::InvalidKek` surfaces unchanged so callers can prompt for a
/// passphrase instead of destroying recoverable key material;
/// `CaError::CertificateInvalid` carries the precise rejection reason;
/// missing files surface as io `NotFound`.
pub fn load_credentials(
    root: &RootCa,
    key_store: &KeyStore,
    paths: &CertPaths,
    allow_expired: bool,
) -> Result<NodeCredentials> {
    let key_pem = key_store.read()?;
    let cert_pem = std::fs::read_to_string(paths.node_cert())?;

    let ders = certs::pem_to_ders(cert_pem.as_bytes())?;
    let info = certs::cert_info(&ders[0])?;

    let key = KeyPair::from_pem(&key_pem).map_err(|e| {
        CaError::CertificateInvalid(CertificateInvalidReason::Malformed(format!(
            "stored key is unusable: {e}"
        )))
    })?;
    if key.public_key_raw() != certs::public_key_bits(&ders[0])?.as_slice() {
        return Err(CaError::CertificateInvalid(
            CertificateInvalidReason::Malformed(
                "stored key does not match the stored certificate".to_string(),
            ),
        ));
    }

    let now = Utc::now();
    if now < info.not_before {
        return Err(CaError::CertificateInvalid(
            CertificateInvalidReason::NotYetValid,
        ));
    }
    if now > info.not_after && !allow_expired {
        return Err(CaError::CertificateInvalid(CertificateInvalidReason::Expired));
    }
    if !certs::signed_by_any(&ders[0], root.certs_der())? {
        return Err(CaError::CertificateInvalid(
            CertificateInvalidReason::Untrusted,
        ));
    }

    let identity = info.identity()?;
    debug!(node_id = %identity.node_id, not_after = %info.not_after, "loaded stored credentials");
    Ok(NodeCredentials {
        cert_pem,
        key_pem,
        identity,
        not_before: info.not_before,
        not_after: info.not_after,
    })
}

/// Load a full `SecurityConfig` from stored credentials.
///
/// `signer_endpoints` configures the external signer for later renewals;
/// it is not contacted here.
pub fn load_security_config(
    root: RootCa,
    key_store: KeyStore,
    paths: CertPaths,
    signer_endpoints: &[String],
    request_timeout: Duration,
    allow_expired: bool,
) -> Result<SecurityConfig> {
    let credentials = load_credentials(&root, &key_store, &paths, allow_expired)?;
    let external = build_external(signer_endpoints, &root, request_timeout)?;
    Ok(SecurityConfig::assemble(
        root,
        Arc::new(key_store),
        paths,
        credentials,
        external,
        request_timeout,
    ))
}

/// Load existing credentials or issue fresh ones, whichever works.
///
/// Fast path: stored credentials that validate against the trust pool
/// and are not within one backdate of expiry are reused without any
/// network activity. Otherwise a new key pair and CSR are generated and
/// signed locally when the root can sign, or through the external
/// signer configured from `request`.
///
/// # Errors
///
/// `CaError::InvalidKek` surfaces unchanged (a wrong passphrase must
/// never silently discard a recoverable key); any other total failure
/// is `CaError::LoadOrIssue` naming the failing stage.
pub async fn create_security_config(
    root: RootCa,
    key_store: KeyStore,
    paths: CertPaths,
    request: CertificateRequestConfig,
) -> Result<SecurityConfig> {
    let policy = root.policy();

    match load_credentials(&root, &key_store, &paths, false) {
        Ok(credentials)
            if credentials.identity == request.identity
                && credentials.remaining_validity() > policy.backdate =>
        {
            debug!(node_id = %credentials.identity.node_id, "reusing stored credentials");
            let external = build_external(&request.signer_endpoints, &root, request.request_timeout)?;
            return Ok(SecurityConfig::assemble(
                root,
                Arc::new(key_store),
                paths,
                credentials,
                external,
                request.request_timeout,
            ));
        }
        Ok(credentials) => {
            debug!(
                node_id = %credentials.identity.node_id,
                "stored credentials unusable for this request, issuing fresh ones"
            );
        }
        // Wrong passphrase is recoverable by the operator, never by
        // regenerating over the stored key.
        Err(e) if e.is_wrong_kek() => return Err(e),
        Err(e) => {
            debug!(error = %e, "no usable stored credentials, issuing fresh ones");
        }
    }

    let external = build_external(&request.signer_endpoints, &root, request.request_timeout)?;
    let credentials = issue_credentials(
        &root,
        &key_store,
        &paths,
        external.as_deref(),
        &request.identity,
        request.join_secret.as_deref(),
    )
    .await
    .map_err(|e| match e {
        e if e.is_identity_removed() => e,
        e => CaError::LoadOrIssue(format!("issue stage failed: {e}")),
    })?;

    Ok(SecurityConfig::assemble(
        root,
        Arc::new(key_store),
        paths,
        credentials,
        external,
        request.request_timeout,
    ))
}

/// Generate, sign, validate, and persist a fresh credential pair.
///
/// The signing path is local when the root holds a key, external
/// otherwise. Whatever comes back is held to the subject-match invariant
/// before anything is persisted. The key is written first; a crash
/// between the two writes leaves a detectable mismatch that the next
/// create falls back from.
pub(crate) async fn issue_credentials(
    root: &RootCa,
    key_store: &KeyStore,
    paths: &CertPaths,
    external: Option<&ExternalCa>,
    identity: &NodeIdentity,
    join_secret: Option<&str>,
) -> Result<NodeCredentials> {
    let (key_pem, csr_pem) = generate_key_and_csr(identity)?;

    let cert_pem = if root.can_sign() {
        root.sign_csr(&csr_pem, identity)?
    } else if let Some(external) = external {
        external.sign(identity, &csr_pem, join_secret).await?
    } else {
        return Err(CaError::SigningDenied);
    };

    let info = certs::validate_issued_cert(&cert_pem, identity, root.certs_der())?;

    key_store.write(&key_pem)?;
    write_file_atomic(&paths.node_cert(), cert_pem.as_bytes(), CERT_FILE_MODE)?;

    info!(
        node_id = %identity.node_id,
        role = %identity.role,
        not_after = %info.not_after,
        external = !root.can_sign(),
        "issued node credentials"
    );
    Ok(NodeCredentials {
        cert_pem,
        key_pem,
        identity: identity.clone(),
        not_before: info.not_before,
        not_after: info.not_after,
    })
}

fn build_external(
    endpoints: &[String],
    root: &RootCa,
    request_timeout: Duration,
) -> Result<Option<Arc<ExternalCa>>> {
    if endpoints.is_empty() {
        return Ok(None);
    }
    let ca = ExternalCa::builder(endpoints)
        .trust_root(root.bundle_pem())
        .request_timeout(request_timeout)
        .build()?;
    Ok(Some(Arc::new(ca)))
}
