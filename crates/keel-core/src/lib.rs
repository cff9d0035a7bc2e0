//! Core types for the keel cluster certificate authority.
//!
//! This crate provides the foundational pieces shared across the keel
//! workspace:
//!
//! - **Types**: node identities, roles, and the join-token format
//! - **Errors**: the lifecycle error taxonomy with [`CaError`]
//! - **Hashing**: SHA-256 fingerprints and constant-time comparison
//!
//! # Example
//!
//! ```rust,ignore
//! use keel_core::{JoinToken, NodeRole, Result};
//!
//! fn enroll(token: &str) -> Result<NodeRole> {
//!     let token = JoinToken::parse(token)?;
//!     Ok(token.role())
//! }
//! ```

#![doc(html_root_url = "https://docs.rs/keel-core/0.1.0")]

mod error;
pub mod hash;
pub mod types;

pub use error::{CaError, CertificateInvalidReason, Result};
pub use types::*;
