//! Shared fixtures for crate tests.

use std::time::Duration;

use keel_core::{NodeIdentity, NodeRole};

use crate::root::{RootCa, SigningPolicy};

/// Worker identity in the fixture cluster.
pub(crate) fn worker_identity(node_id: &str) -> NodeIdentity {
    NodeIdentity::new(node_id, NodeRole::Worker, "test-cluster")
}

/// Signing key PEM of a signing-capable authority.
///
/// # Panics
///
/// Panics when the authority is verification-only.
pub(crate) fn signing_key_pem(root: &RootCa) -> String {
    root.signer_key_pem()
        .expect("fixture authority must hold a signing key")
        .to_string()
}

/// Policy leaving roughly one minute of effective validity.
pub(crate) const fn short_policy() -> SigningPolicy {
    SigningPolicy {
        cert_expiry: Duration::from_secs(6 * 60),
        backdate: Duration::from_secs(5 * 60),
    }
}
