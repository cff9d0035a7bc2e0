//! keel-ca: cluster certificate authority and node identity lifecycle.
//!
//! Issues, stores, verifies, and renews X.509 identities for nodes in a
//! keel cluster, and bootstraps trust between a new node and the
//! cluster's root of trust via a fingerprinted join token.
//!
//! # Architecture
//!
//! - [`root`] — trusted root pool with optional local signing, multi-root
//!   rotation, and policy-controlled expiry
//! - [`external`] — round-robin CSR forwarding to remote signers when the
//!   local authority cannot sign
//! - [`keystore`] — the node key at rest, sealed behind a
//!   passphrase-derived KEK with whole-record rotation
//! - [`bootstrap`] — trust-on-first-use root download, verified against
//!   the join-token fingerprint
//! - [`security`] — the live credential bundle, assembled from stored or
//!   freshly issued material and swapped atomically under readers
//! - [`renew`] — the background renewal process, one task per identity,
//!   publishing one update per cycle
//!
//! # Lifecycle
//!
//! A joining node parses its token, calls [`download_root_ca`] to obtain
//! a verified (non-signing) [`RootCa`], then [`create_security_config`]
//! to issue its first certificate, and finally
//! [`renew_security_config`] to keep it alive.

pub mod bootstrap;
pub mod config;
pub mod csr;
pub mod external;
pub mod keystore;
pub mod paths;
pub mod renew;
pub mod root;
pub mod security;

mod atomic;
mod certs;

#[cfg(test)]
mod testutil;

// Re-exports for convenience.
pub use bootstrap::{download_root_ca, BootstrapClient};
pub use config::{CaConfig, RenewConfig};
pub use csr::generate_key_and_csr;
pub use external::ExternalCa;
pub use keystore::KeyStore;
pub use paths::CertPaths;
pub use renew::{renew_security_config, CertificateUpdate, RenewalHandle};
pub use root::{RootCa, SigningPolicy};
pub use security::{
    create_security_config, load_credentials, load_security_config, CertificateRequestConfig,
    NodeCredentials, SecurityConfig,
};

// Error taxonomy and result alias, shared with keel-core.
pub use keel_core::{CaError, CertificateInvalidReason, Result};
