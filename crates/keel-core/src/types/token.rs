//! Join token format: `KEELTKN-1-<fingerprint>-<role marker + secret>`.
//!
//! A token binds a new node to the cluster's root of trust before any
//! authenticated channel exists: the third field pins a truncated SHA-256
//! fingerprint of the root certificate bundle, the fourth carries a role
//! marker and the shared cluster secret. Parsing is purely offline and
//! must succeed before anything touches the network.

use std::fmt;

use ring::rand::{SecureRandom, SystemRandom};

use crate::error::{CaError, Result};
use crate::hash::{constant_time_eq, sha256_bytes};
use crate::types::identity::NodeRole;

/// Fixed first field of every token
pub const TOKEN_PREFIX: &str = "KEELTKN";

/// Format version marker, second field
pub const TOKEN_VERSION: &str = "1";

/// Hex length of the truncated root-bundle digest (25 bytes of SHA-256)
pub const FINGERPRINT_HEX_LEN: usize = 50;

/// Hex length of the random cluster secret (16 bytes)
pub const SECRET_HEX_LEN: usize = 32;

fn is_lower_hex(s: &str) -> bool {
    s.chars().all(|c| matches!(c, '0'..='9' | 'a'..='f'))
}

/// Parsed join token
///
/// The empty string is not a token: callers treat it as an explicit
/// request to skip root verification and never construct one of these.
#[derive(Clone, PartialEq, Eq)]
pub struct JoinToken {
    role: NodeRole,
    fingerprint: String,
    secret: String,
}

impl JoinToken {
    /// Parse and validate a token string offline
    ///
    /// # Errors
    ///
    /// Returns `CaError::InvalidJoinToken` when the field count, prefix,
    /// version, fingerprint length or alphabet, role marker, or secret
    /// shape is wrong.
    pub fn parse(s: &str) -> Result<Self> {
        let fields: Vec<&str> = s.split('-').collect();
        if fields.len() != 4 {
            return Err(CaError::InvalidJoinToken);
        }
        if fields[0] != TOKEN_PREFIX || fields[1] != TOKEN_VERSION {
            return Err(CaError::InvalidJoinToken);
        }

        let fingerprint = fields[2];
        if fingerprint.len() != FINGERPRINT_HEX_LEN || !is_lower_hex(fingerprint) {
            return Err(CaError::InvalidJoinToken);
        }

        let tail = fields[3];
        if tail.len() != 1 + SECRET_HEX_LEN {
            return Err(CaError::InvalidJoinToken);
        }
        let marker = tail.chars().next().ok_or(CaError::InvalidJoinToken)?;
        let role = NodeRole::from_token_marker(marker).ok_or(CaError::InvalidJoinToken)?;
        let secret = &tail[1..];
        if !is_lower_hex(secret) {
            return Err(CaError::InvalidJoinToken);
        }

        Ok(Self {
            role,
            fingerprint: fingerprint.to_string(),
            secret: secret.to_string(),
        })
    }

    /// Mint a fresh token over a root certificate bundle
    ///
    /// `bundle_der` is the concatenated DER of every certificate in the
    /// bundle, so the fingerprint is stable under PEM reformatting.
    pub fn generate(role: NodeRole, bundle_der: &[u8]) -> Result<Self> {
        let mut secret = [0u8; SECRET_HEX_LEN / 2];
        SystemRandom::new()
            .fill(&mut secret)
            .map_err(|_| CaError::Internal("system randomness unavailable".to_string()))?;

        Ok(Self {
            role,
            fingerprint: truncated_fingerprint(bundle_der),
            secret: hex::encode(secret),
        })
    }

    /// Serialize back to the four-field wire form
    #[must_use]
    pub fn encode(&self) -> String {
        format!(
            "{TOKEN_PREFIX}-{TOKEN_VERSION}-{}-{}{}",
            self.fingerprint,
            self.role.token_marker(),
            self.secret
        )
    }

    /// Role the token enrolls the node as
    #[must_use]
    pub const fn role(&self) -> NodeRole {
        self.role
    }

    /// Truncated hex fingerprint pinned by the token
    #[must_use]
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// Shared cluster secret presented on first issuance
    #[must_use]
    pub fn secret(&self) -> &str {
        &self.secret
    }

    /// Check a downloaded bundle's fingerprint against the pinned one
    ///
    /// Comparison is constant-time over the truncated hex form.
    #[must_use]
    pub fn matches_bundle(&self, bundle_der: &[u8]) -> bool {
        constant_time_eq(
            self.fingerprint.as_bytes(),
            truncated_fingerprint(bundle_der).as_bytes(),
        )
    }
}

impl fmt::Display for JoinToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

impl fmt::Debug for JoinToken {
    // Keep the secret out of logs
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JoinToken")
            .field("role", &self.role)
            .field("fingerprint", &self.fingerprint)
            .field("secret", &"<redacted>")
            .finish()
    }
}

/// Truncated hex fingerprint of a root bundle, as carried in tokens
#[must_use]
pub fn truncated_fingerprint(bundle_der: &[u8]) -> String {
    let mut full = sha256_bytes(bundle_der);
    full.truncate(FINGERPRINT_HEX_LEN);
    full
}
