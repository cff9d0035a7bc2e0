//! SHA-256 fingerprinting via `ring::digest`.

use ring::constant_time;
use ring::digest::{digest, SHA256};

/// Compute SHA-256 of raw bytes (certificate DER data).
///
/// Returns lowercase hex-encoded digest.
#[must_use]
pub fn sha256_bytes(data: &[u8]) -> String {
    hex::encode(digest(&SHA256, data).as_ref())
}

/// Compute SHA-256 of raw bytes, returning the raw digest.
#[must_use]
pub fn sha256_digest(data: &[u8]) -> Vec<u8> {
    digest(&SHA256, data).as_ref().to_vec()
}

/// Compare two byte strings without leaking the mismatch position.
///
/// Inputs of different lengths compare unequal immediately.
#[must_use]
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    constant_time::verify_slices_are_equal(a, b).is_ok()
}
