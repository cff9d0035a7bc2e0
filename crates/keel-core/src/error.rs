use std::io;
use std::time::Duration;

use thiserror::Error;

/// Result type alias for certificate authority operations
pub type Result<T> = std::result::Result<T, CaError>;

/// Why a stored or freshly issued certificate was rejected
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CertificateInvalidReason {
    /// Validity window has not started yet
    #[error("certificate is not yet valid")]
    NotYetValid,

    /// Validity window has ended
    #[error("certificate has expired")]
    Expired,

    /// Signature does not verify against any trusted root
    #[error("certificate is not signed by a trusted root")]
    Untrusted,

    /// Subject fields do not match the request the certificate answers
    #[error("certificate subject does not match the requested identity: {0}")]
    SubjectMismatch(String),

    /// Certificate or key material failed to parse
    #[error("certificate is malformed: {0}")]
    Malformed(String),
}

/// Errors that can occur across the node identity lifecycle
#[derive(Error, Debug)]
pub enum CaError {
    /// Root bundle rejected at construction
    #[error("invalid root CA material: {0}")]
    InvalidRootMaterial(String),

    /// Signing was requested from an authority without a signing key
    #[error("root CA has no signing key and cannot issue certificates")]
    SigningDenied,

    /// Certificate signing request failed to parse or self-verify
    #[error("invalid certificate signing request: {0}")]
    InvalidCsr(String),

    /// Every configured external signer endpoint failed
    #[error("no external signer endpoint available: {0}")]
    SigningUnavailable(String),

    /// Stored key could not be decrypted with the configured passphrase
    #[error("unable to decrypt key material: {0}")]
    InvalidKek(String),

    /// Stored key record is structurally broken
    #[error("invalid key record format: {0}")]
    InvalidKeyFormat(String),

    /// Join token failed offline validation
    #[error("invalid join token")]
    InvalidJoinToken,

    /// Downloaded root certificate does not match the token fingerprint
    #[error("remote CA does not match expected fingerprint: expected {expected}, got {actual}")]
    FingerprintMismatch {
        /// Fingerprint carried by the join token
        expected: String,
        /// Fingerprint of the downloaded bundle, truncated to token length
        actual: String,
    },

    /// Certificate rejected during load or post-issuance validation
    #[error("certificate invalid: {0}")]
    CertificateInvalid(CertificateInvalidReason),

    /// The cluster no longer recognizes this node
    #[error("node {0} not found when attempting to renew certificate")]
    IdentityNotFound(String),

    /// Neither stored credentials nor fresh issuance produced a usable config
    #[error("unable to load or issue node credentials: {0}")]
    LoadOrIssue(String),

    /// HTTP request failed
    #[error("HTTP request failed: {0}")]
    Http(String),

    /// Request timed out
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// Invalid endpoint URL
    #[error("invalid URL: {0}")]
    InvalidUrl(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Filesystem error
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// Generic internal error
    #[error("internal error: {0}")]
    Internal(String),
}

impl CaError {
    /// Returns true if the error is transient and a later attempt may succeed
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Http(_) | Self::Timeout(_) | Self::SigningUnavailable(_)
        )
    }

    /// Returns true if the error means the configured passphrase is wrong
    #[must_use]
    pub const fn is_wrong_kek(&self) -> bool {
        matches!(self, Self::InvalidKek(_))
    }

    /// Returns true if the error means the cluster dropped this identity
    #[must_use]
    pub const fn is_identity_removed(&self) -> bool {
        matches!(self, Self::IdentityNotFound(_))
    }

    /// Returns true if the underlying cause is a missing file
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Io(e) if e.kind() == io::ErrorKind::NotFound)
    }
}
