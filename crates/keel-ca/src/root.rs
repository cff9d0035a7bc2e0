//! Root certificate authority: trust pool plus optional local signing.
//!
//! A `RootCa` is an immutable snapshot. The trusted certificates are
//! ordered oldest first; the last (leaf-most) entry is the primary root
//! and, when a signing key is present, the one the key must match.
//! Rotation builds a new snapshot rather than mutating in place.

use std::fmt;
use std::io;
use std::time::Duration;

use rcgen::{
    BasicConstraints, Certificate, CertificateParams, CertificateSigningRequestParams,
    DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa, KeyPair, KeyUsagePurpose,
};
use ring::rand::{SecureRandom, SystemRandom};
use tracing::{debug, info};

use keel_core::hash::sha256_bytes;
use keel_core::{
    CaError, CertificateInvalidReason, JoinToken, NodeIdentity, NodeRole, Result,
};

use crate::atomic::{write_file_atomic, CERT_FILE_MODE, KEY_FILE_MODE};
use crate::certs;
use crate::csr::{generate_key_and_csr, subject_dn, verify_csr};
use crate::keystore::KeyStore;
use crate::paths::CertPaths;

/// Validity of a freshly created root certificate (20 years)
const ROOT_CA_VALIDITY_DAYS: i64 = 20 * 365;

/// Subject CN used when creating a new cluster root
pub const ROOT_CA_COMMON_NAME: &str = "keel-cluster-ca";

/// Expiry policy applied to every certificate the authority signs.
///
/// Issued certificates are backdated: `not_before = now - backdate`,
/// `not_after = not_before + cert_expiry`, so the effective remaining
/// validity is `cert_expiry - backdate`. A policy where the backdate
/// meets or exceeds the expiry produces certificates already at or past
/// expiry; issuance still succeeds and renewal handles the rest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SigningPolicy {
    /// Total validity of issued certificates
    pub cert_expiry: Duration,
    /// How far `not_before` is pushed into the past (clock-skew allowance)
    pub backdate: Duration,
}

impl Default for SigningPolicy {
    fn default() -> Self {
        Self {
            cert_expiry: Duration::from_secs(90 * 24 * 3600),
            backdate: Duration::from_secs(5 * 60),
        }
    }
}

impl SigningPolicy {
    /// Remaining validity a just-issued certificate actually has
    #[must_use]
    pub const fn effective_validity(&self) -> Duration {
        self.cert_expiry.saturating_sub(self.backdate)
    }
}

/// Signing state carried by signing-capable authorities
struct LocalSigner {
    key_pem: String,
    key: KeyPair,
    cert: Certificate,
}

/// Root certificate authority snapshot
pub struct RootCa {
    bundle_pem: String,
    certs_der: Vec<Vec<u8>>,
    signer: Option<LocalSigner>,
    policy: SigningPolicy,
}

impl RootCa {
    /// Build an authority from a PEM bundle and an optional signing key.
    ///
    /// # Errors
    ///
    /// Returns `CaError::InvalidRootMaterial` when the bundle is empty or
    /// unparseable, any certificate is not a CA certificate, or the key
    /// does not match the leaf-most certificate's public key.
    pub fn new(bundle_pem: &str, key_pem: Option<&str>, policy: SigningPolicy) -> Result<Self> {
        let certs_der = certs::pem_to_ders(bundle_pem.as_bytes())
            .map_err(|e| CaError::InvalidRootMaterial(e.to_string()))?;

        for (i, der) in certs_der.iter().enumerate() {
            let info = certs::cert_info(der)
                .map_err(|e| CaError::InvalidRootMaterial(format!("certificate {i}: {e}")))?;
            if !info.is_ca {
                return Err(CaError::InvalidRootMaterial(format!(
                    "certificate {i} ({}) is not a CA certificate",
                    info.common_name
                )));
            }
        }

        let leaf_der = certs_der
            .last()
            .ok_or_else(|| CaError::InvalidRootMaterial("empty certificate bundle".to_string()))?;
        let signer = key_pem.map(|k| build_signer(k, leaf_der)).transpose()?;

        Ok(Self {
            bundle_pem: bundle_pem.to_string(),
            certs_der,
            signer,
            policy,
        })
    }

    /// Create a brand-new self-signed root with a fresh key pair.
    pub fn create(common_name: &str, policy: SigningPolicy) -> Result<Self> {
        let key = KeyPair::generate().map_err(|e| CaError::Internal(e.to_string()))?;

        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, common_name);
        params.distinguished_name = dn;
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];

        let now = time::OffsetDateTime::now_utc();
        params.not_before = now;
        params.not_after = now + time::Duration::days(ROOT_CA_VALIDITY_DAYS);
        params.serial_number = Some(random_serial()?.into());

        let cert = params
            .self_signed(&key)
            .map_err(|e| CaError::Internal(e.to_string()))?;

        info!(common_name, "created new root CA");
        Self::new(&cert.pem(), Some(&key.serialize_pem()), policy)
    }

    /// Successor snapshot for rotation: the old pool stays trusted, the
    /// successor certificate becomes leaf-most, and `successor_key` (when
    /// given) becomes the signing key.
    pub fn rotated(
        &self,
        successor_pem: &str,
        successor_key: Option<&str>,
        policy: SigningPolicy,
    ) -> Result<Self> {
        let bundle = format!(
            "{}\n{}",
            self.bundle_pem.trim_end(),
            successor_pem.trim_start()
        );
        Self::new(&bundle, successor_key, policy)
    }

    /// True iff this authority holds a signing key
    #[must_use]
    pub const fn can_sign(&self) -> bool {
        self.signer.is_some()
    }

    /// The expiry policy applied when signing
    #[must_use]
    pub const fn policy(&self) -> SigningPolicy {
        self.policy
    }

    /// The trusted bundle exactly as persisted
    #[must_use]
    pub fn bundle_pem(&self) -> &str {
        &self.bundle_pem
    }

    /// Number of trusted roots in the pool
    #[must_use]
    pub fn cert_count(&self) -> usize {
        self.certs_der.len()
    }

    /// DER bytes of each trusted root, ordered oldest first
    pub(crate) fn certs_der(&self) -> &[Vec<u8>] {
        &self.certs_der
    }

    /// Concatenated DER of the whole pool, the fingerprint input
    #[must_use]
    pub fn bundle_der(&self) -> Vec<u8> {
        self.certs_der.concat()
    }

    /// Full-length hex fingerprint of the trusted pool
    #[must_use]
    pub fn fingerprint(&self) -> String {
        sha256_bytes(&self.bundle_der())
    }

    /// Mint a join token for this pool
    pub fn join_token(&self, role: NodeRole) -> Result<JoinToken> {
        JoinToken::generate(role, &self.bundle_der())
    }

    /// Validate a CSR and sign it for `identity`.
    ///
    /// The subject of the issued certificate comes from `identity`, not
    /// from whatever the CSR claims; the CSR contributes only the public
    /// key it proves possession of.
    ///
    /// # Errors
    ///
    /// `CaError::SigningDenied` without a signing key, `CaError::InvalidCsr`
    /// when the request fails to parse or self-verify.
    pub fn sign_csr(&self, csr_pem: &str, identity: &NodeIdentity) -> Result<String> {
        let signer = self.signer.as_ref().ok_or(CaError::SigningDenied)?;
        verify_csr(csr_pem)?;

        let mut csr = CertificateSigningRequestParams::from_pem(csr_pem)
            .map_err(|e| CaError::InvalidCsr(e.to_string()))?;
        csr.params.distinguished_name = subject_dn(identity);
        csr.params.is_ca = IsCa::NoCa;
        csr.params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        csr.params.extended_key_usages = vec![
            ExtendedKeyUsagePurpose::ServerAuth,
            ExtendedKeyUsagePurpose::ClientAuth,
        ];

        let not_before = time::OffsetDateTime::now_utc() - to_time_duration(self.policy.backdate);
        csr.params.not_before = not_before;
        csr.params.not_after = not_before + to_time_duration(self.policy.cert_expiry);
        csr.params.serial_number = Some(random_serial()?.into());

        let cert = csr
            .signed_by(&signer.cert, &signer.key)
            .map_err(|e| CaError::Internal(e.to_string()))?;

        debug!(node_id = %identity.node_id, role = %identity.role, "signed node certificate");
        Ok(cert.pem())
    }

    /// Check that a certificate chains to any root in the pool.
    pub fn verify_cert(&self, cert_pem: &str) -> Result<()> {
        let ders = certs::pem_to_ders(cert_pem.as_bytes())?;
        if certs::signed_by_any(&ders[0], &self.certs_der)? {
            Ok(())
        } else {
            Err(CaError::CertificateInvalid(
                CertificateInvalidReason::Untrusted,
            ))
        }
    }

    /// Generate, locally sign, and persist a full credential pair.
    ///
    /// Returns `(cert_pem, key_pem)`. The key goes through `key_store`
    /// (sealed when a passphrase is configured), the certificate to
    /// `paths.node_cert()`, both atomically, key first.
    pub fn issue_and_save(
        &self,
        paths: &CertPaths,
        key_store: &KeyStore,
        identity: &NodeIdentity,
    ) -> Result<(String, String)> {
        let (key_pem, csr_pem) = generate_key_and_csr(identity)?;
        let cert_pem = self.sign_csr(&csr_pem, identity)?;
        certs::validate_issued_cert(&cert_pem, identity, &self.certs_der)?;

        key_store.write(&key_pem)?;
        write_file_atomic(&paths.node_cert(), cert_pem.as_bytes(), CERT_FILE_MODE)?;

        info!(node_id = %identity.node_id, role = %identity.role, "issued and saved node certificate");
        Ok((cert_pem, key_pem))
    }

    /// Persist the trusted bundle (and the signing key when present).
    pub fn save(&self, paths: &CertPaths) -> Result<()> {
        write_file_atomic(&paths.root_cert(), self.bundle_pem.as_bytes(), CERT_FILE_MODE)?;
        if let Some(signer) = &self.signer {
            write_file_atomic(&paths.root_key(), signer.key_pem.as_bytes(), KEY_FILE_MODE)?;
        }
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn signer_key_pem(&self) -> Option<&str> {
        self.signer.as_ref().map(|s| s.key_pem.as_str())
    }

    /// Load the authority from disk; signing-capable iff the key file exists.
    pub fn load_local(paths: &CertPaths, policy: SigningPolicy) -> Result<Self> {
        let bundle = std::fs::read_to_string(paths.root_cert())?;
        let key_pem = match std::fs::read_to_string(paths.root_key()) {
            Ok(k) => Some(k),
            Err(e) if e.kind() == io::ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };
        debug!(
            path = %paths.root_cert().display(),
            signer = key_pem.is_some(),
            "loaded local root CA"
        );
        Self::new(&bundle, key_pem.as_deref(), policy)
    }
}

impl fmt::Debug for RootCa {
    // Keep key material out of logs
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RootCa")
            .field("certs", &self.certs_der.len())
            .field("can_sign", &self.can_sign())
            .field("policy", &self.policy)
            .finish()
    }
}

fn build_signer(key_pem: &str, leaf_der: &[u8]) -> Result<LocalSigner> {
    let key = KeyPair::from_pem(key_pem)
        .map_err(|e| CaError::InvalidRootMaterial(format!("unparseable signing key: {e}")))?;

    let cert_bits =
        certs::public_key_bits(leaf_der).map_err(|e| CaError::InvalidRootMaterial(e.to_string()))?;
    if key.public_key_raw() != cert_bits.as_slice() {
        return Err(CaError::InvalidRootMaterial(
            "signing key does not match the leaf-most root certificate".to_string(),
        ));
    }

    let leaf_pem = certs::der_to_pem(leaf_der);
    let params = CertificateParams::from_ca_cert_pem(&leaf_pem)
        .map_err(|e| CaError::InvalidRootMaterial(format!("unusable root certificate: {e}")))?;
    let cert = params
        .self_signed(&key)
        .map_err(|e| CaError::InvalidRootMaterial(e.to_string()))?;

    Ok(LocalSigner {
        key_pem: key_pem.to_string(),
        key,
        cert,
    })
}

fn random_serial() -> Result<u64> {
    let mut bytes = [0u8; 8];
    SystemRandom::new()
        .fill(&mut bytes)
        .map_err(|_| CaError::Internal("system randomness unavailable".to_string()))?;
    Ok(u64::from_be_bytes(bytes))
}

fn to_time_duration(d: Duration) -> time::Duration {
    time::Duration::seconds(i64::try_from(d.as_secs()).unwrap_or(i64::MAX))
}
