//! Passphrase-protected storage for the node's private key.
//!
//! The store persists exactly one key. Without a passphrase the PKCS#8
//! PEM is written as-is; with a passphrase the bytes are sealed into a
//! versioned encrypted record behind a passphrase-derived
//! key-encryption-key (KEK). Every write is a whole-record atomic
//! replacement, so a reader (or a crash) observes either the old record
//! or the new one, never a blend of the two.
//!
//! Sealed records are the payload of a `SEALED PRIVATE KEY` PEM block:
//!
//! ```text
//! [0]       record format version
//! [1..9]    KEK version, big-endian
//! [9..13]   PBKDF2 iteration count, big-endian
//! [13..29]  salt
//! [29..41]  nonce
//! [41..]    ChaCha20-Poly1305 ciphertext and tag
//! ```
//!
//! The header is bound as AEAD associated data, so editing the version
//! fields, salt, or nonce fails authentication the same way a wrong
//! passphrase does.

use std::num::NonZeroU32;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, CHACHA20_POLY1305, NONCE_LEN};
use ring::pbkdf2;
use ring::rand::{SecureRandom, SystemRandom};
use tracing::{debug, info};

use keel_core::{CaError, Result};

use crate::atomic::{write_file_atomic, KEY_FILE_MODE};

/// PEM tag of an encrypted key record
pub const SEALED_KEY_TAG: &str = "SEALED PRIVATE KEY";

/// Current sealed record format version
const RECORD_VERSION: u8 = 1;

/// PBKDF2-HMAC-SHA256 iterations for freshly derived KEKs
const KDF_ITERATIONS: u32 = 600_000;

/// Salt length in bytes
const SALT_LEN: usize = 16;

/// Fixed header: format version + KEK version + iterations + salt + nonce
const HEADER_LEN: usize = 1 + 8 + 4 + SALT_LEN + NONCE_LEN;

/// Passphrase-derived KEK state.
///
/// The derived key bytes exist only transiently inside seal and open;
/// what the store keeps in memory is the passphrase and the version the
/// next write will be tagged with. Neither is ever persisted.
struct KekState {
    passphrase: Option<Vec<u8>>,
    version: u64,
}

/// Durable store for a single node private key.
pub struct KeyStore {
    path: PathBuf,
    state: Mutex<KekState>,
}

impl KeyStore {
    /// Open a store over `path`, sealing writes when a passphrase is given.
    pub fn new(path: impl Into<PathBuf>, passphrase: Option<&[u8]>) -> Self {
        Self {
            path: path.into(),
            state: Mutex::new(KekState {
                passphrase: passphrase.map(<[u8]>::to_vec),
                version: 0,
            }),
        }
    }

    /// Location of the stored key
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Version tag the next sealed write will carry
    #[must_use]
    pub fn kek_version(&self) -> u64 {
        self.state.lock().expect("key store lock poisoned").version
    }

    /// Persist `key_pem`, sealed under the active KEK when one is configured.
    pub fn write(&self, key_pem: &str) -> Result<()> {
        let state = self.state.lock().expect("key store lock poisoned");
        store(&self.path, &state, key_pem)
    }

    /// Read the stored key back as plaintext PEM.
    ///
    /// # Errors
    ///
    /// `CaError::InvalidKek` when the record is encrypted and no (or the
    /// wrong) passphrase is configured; `CaError::InvalidKeyFormat` when
    /// the record is structurally broken; `CaError::Io` with
    /// `NotFound` when no key has been stored, so callers can tell a
    /// recoverable-but-locked key apart from a missing one.
    pub fn read(&self) -> Result<String> {
        let mut state = self.state.lock().expect("key store lock poisoned");
        load(&self.path, &mut state)
    }

    /// Re-encrypt the stored key under a freshly derived KEK.
    ///
    /// The key is decrypted with the current passphrase, the version is
    /// incremented, and the record is atomically replaced under the new
    /// passphrase (`None` downgrades to plaintext storage). Certificate
    /// material is untouched.
    pub fn rotate_kek(&self, new_passphrase: Option<&[u8]>) -> Result<()> {
        let mut state = self.state.lock().expect("key store lock poisoned");
        let key_pem = load(&self.path, &mut state)?;

        state.passphrase = new_passphrase.map(<[u8]>::to_vec);
        state.version += 1;
        store(&self.path, &state, &key_pem)?;

        info!(
            version = state.version,
            sealed = state.passphrase.is_some(),
            "rotated key encryption key"
        );
        Ok(())
    }
}

impl std::fmt::Debug for KeyStore {
    // Keep the passphrase out of logs
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock().expect("key store lock poisoned");
        f.debug_struct("KeyStore")
            .field("path", &self.path)
            .field("sealed", &state.passphrase.is_some())
            .field("kek_version", &state.version)
            .finish()
    }
}

fn store(path: &Path, state: &KekState, key_pem: &str) -> Result<()> {
    let bytes = match &state.passphrase {
        Some(passphrase) => seal_record(passphrase, state.version, key_pem.as_bytes())?,
        None => key_pem.as_bytes().to_vec(),
    };
    write_file_atomic(path, &bytes, KEY_FILE_MODE)?;
    debug!(path = %path.display(), sealed = state.passphrase.is_some(), "wrote node key");
    Ok(())
}

fn load(path: &Path, state: &mut KekState) -> Result<String> {
    let raw = std::fs::read(path)?;
    let block = pem::parse(&raw).map_err(|e| CaError::InvalidKeyFormat(e.to_string()))?;

    match block.tag() {
        SEALED_KEY_TAG => {
            let Some(passphrase) = &state.passphrase else {
                return Err(CaError::InvalidKek(
                    "stored key is encrypted and no passphrase is configured".to_string(),
                ));
            };
            let (version, plaintext) = open_record(passphrase, block.contents())?;
            // A store opened over an existing record learns its version
            // so the next write or rotation does not regress it.
            state.version = version;
            String::from_utf8(plaintext).map_err(|_| {
                CaError::InvalidKeyFormat("sealed payload is not UTF-8 PEM".to_string())
            })
        }
        tag if tag.ends_with("PRIVATE KEY") => String::from_utf8(raw)
            .map_err(|_| CaError::InvalidKeyFormat("key file is not UTF-8 PEM".to_string())),
        other => Err(CaError::InvalidKeyFormat(format!(
            "unexpected PEM tag {other}"
        ))),
    }
}

/// Seal `plaintext` under the passphrase, producing the full PEM record.
fn seal_record(passphrase: &[u8], version: u64, plaintext: &[u8]) -> Result<Vec<u8>> {
    let rng = SystemRandom::new();
    let mut salt = [0u8; SALT_LEN];
    let mut nonce = [0u8; NONCE_LEN];
    rng.fill(&mut salt).map_err(|_| rand_unavailable())?;
    rng.fill(&mut nonce).map_err(|_| rand_unavailable())?;

    let mut record = Vec::with_capacity(HEADER_LEN + plaintext.len() + 16);
    record.push(RECORD_VERSION);
    record.extend_from_slice(&version.to_be_bytes());
    record.extend_from_slice(&KDF_ITERATIONS.to_be_bytes());
    record.extend_from_slice(&salt);
    record.extend_from_slice(&nonce);

    let kek = derive_kek(passphrase, &salt, KDF_ITERATIONS)?;
    let sealing = aead_key(&kek)?;
    let mut in_out = plaintext.to_vec();
    sealing
        .seal_in_place_append_tag(
            Nonce::assume_unique_for_key(nonce),
            Aad::from(&record[..HEADER_LEN]),
            &mut in_out,
        )
        .map_err(|_| CaError::Internal("failed to seal key record".to_string()))?;
    record.extend_from_slice(&in_out);

    Ok(pem::encode(&pem::Pem::new(SEALED_KEY_TAG, record)).into_bytes())
}

/// Open a sealed record, returning its KEK version and the plaintext.
fn open_record(passphrase: &[u8], record: &[u8]) -> Result<(u64, Vec<u8>)> {
    if record.len() < HEADER_LEN + CHACHA20_POLY1305.tag_len() {
        return Err(CaError::InvalidKeyFormat(
            "sealed record is too short".to_string(),
        ));
    }
    if record[0] != RECORD_VERSION {
        return Err(CaError::InvalidKeyFormat(format!(
            "unsupported sealed record version {}",
            record[0]
        )));
    }

    let mut version_bytes = [0u8; 8];
    version_bytes.copy_from_slice(&record[1..9]);
    let version = u64::from_be_bytes(version_bytes);

    let mut iter_bytes = [0u8; 4];
    iter_bytes.copy_from_slice(&record[9..13]);
    let iterations = u32::from_be_bytes(iter_bytes);

    let salt = &record[13..13 + SALT_LEN];
    let mut nonce = [0u8; NONCE_LEN];
    nonce.copy_from_slice(&record[13 + SALT_LEN..HEADER_LEN]);

    let kek = derive_kek(passphrase, salt, iterations)?;
    let opening = aead_key(&kek)?;
    let mut in_out = record[HEADER_LEN..].to_vec();
    let plaintext = opening
        .open_in_place(
            Nonce::assume_unique_for_key(nonce),
            Aad::from(&record[..HEADER_LEN]),
            &mut in_out,
        )
        .map_err(|_| {
            CaError::InvalidKek(
                "stored key could not be decrypted with the configured passphrase".to_string(),
            )
        })?;

    Ok((version, plaintext.to_vec()))
}

/// PBKDF2-HMAC-SHA256 passphrase stretch.
fn derive_kek(passphrase: &[u8], salt: &[u8], iterations: u32) -> Result<[u8; 32]> {
    let iterations = NonZeroU32::new(iterations).ok_or_else(|| {
        CaError::InvalidKeyFormat("sealed record has a zero KDF iteration count".to_string())
    })?;
    let mut kek = [0u8; 32];
    pbkdf2::derive(
        pbkdf2::PBKDF2_HMAC_SHA256,
        iterations,
        salt,
        passphrase,
        &mut kek,
    );
    Ok(kek)
}

fn aead_key(kek: &[u8; 32]) -> Result<LessSafeKey> {
    UnboundKey::new(&CHACHA20_POLY1305, kek)
        .map(LessSafeKey::new)
        .map_err(|_| CaError::Internal("unusable key encryption key".to_string()))
}

fn rand_unavailable() -> CaError {
    CaError::Internal("system randomness unavailable".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rcgen::KeyPair;

    fn fresh_key_pem() -> String {
        KeyPair::generate().unwrap().serialize_pem()
    }

    fn store_in(dir: &tempfile::TempDir, passphrase: Option<&[u8]>) -> KeyStore {
        KeyStore::new(dir.path().join("node.key"), passphrase)
    }

    #[test]
    fn test_plaintext_round_trip_is_byte_identical() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir, None);
        let key_pem = fresh_key_pem();

        store.write(&key_pem).unwrap();
        assert_eq!(store.read().unwrap(), key_pem);

        let on_disk = std::fs::read_to_string(store.path()).unwrap();
        assert!(on_disk.contains("PRIVATE KEY"));
        assert!(!on_disk.contains(SEALED_KEY_TAG));
    }

    #[test]
    fn test_sealed_round_trip_is_byte_identical() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir, Some(b"hunter2"));
        let key_pem = fresh_key_pem();

        store.write(&key_pem).unwrap();
        assert_eq!(store.read().unwrap(), key_pem);

        // The plaintext key must not appear on disk
        let on_disk = std::fs::read_to_string(store.path()).unwrap();
        assert!(on_disk.contains(SEALED_KEY_TAG));
        let key_body: Vec<&str> = key_pem.lines().skip(1).take(1).collect();
        assert!(!on_disk.contains(key_body[0]));
    }

    #[test]
    fn test_wrong_passphrase_is_invalid_kek() {
        let dir = tempfile::tempdir().unwrap();
        store_in(&dir, Some(b"correct")).write(&fresh_key_pem()).unwrap();

        let err = store_in(&dir, Some(b"incorrect")).read().unwrap_err();
        assert!(err.is_wrong_kek());
        assert!(!err.is_not_found());
    }

    #[test]
    fn test_encrypted_record_without_passphrase_is_invalid_kek() {
        let dir = tempfile::tempdir().unwrap();
        store_in(&dir, Some(b"hunter2")).write(&fresh_key_pem()).unwrap();

        let err = store_in(&dir, None).read().unwrap_err();
        assert!(err.is_wrong_kek());
    }

    #[test]
    fn test_missing_file_is_not_found_not_invalid_kek() {
        let dir = tempfile::tempdir().unwrap();
        let err = store_in(&dir, Some(b"hunter2")).read().unwrap_err();
        assert!(err.is_not_found());
        assert!(!err.is_wrong_kek());
    }

    #[test]
    fn test_garbage_is_invalid_key_format() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir, None);

        std::fs::write(store.path(), b"not pem at all").unwrap();
        assert!(matches!(
            store.read(),
            Err(CaError::InvalidKeyFormat(_))
        ));

        let cert = "-----BEGIN CERTIFICATE-----\nAAAA\n-----END CERTIFICATE-----\n";
        std::fs::write(store.path(), cert).unwrap();
        assert!(matches!(
            store.read(),
            Err(CaError::InvalidKeyFormat(_))
        ));
    }

    #[test]
    fn test_truncated_sealed_record_is_invalid_key_format() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir, Some(b"hunter2"));

        let stub = pem::encode(&pem::Pem::new(SEALED_KEY_TAG, vec![RECORD_VERSION; 8]));
        std::fs::write(store.path(), stub).unwrap();
        assert!(matches!(
            store.read(),
            Err(CaError::InvalidKeyFormat(_))
        ));
    }

    #[test]
    fn test_tampered_record_fails_like_wrong_passphrase() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir, Some(b"hunter2"));
        store.write(&fresh_key_pem()).unwrap();

        let raw = std::fs::read(store.path()).unwrap();
        let block = pem::parse(&raw).unwrap();
        let mut contents = block.contents().to_vec();
        let last = contents.len() - 1;
        contents[last] ^= 0xff;
        std::fs::write(
            store.path(),
            pem::encode(&pem::Pem::new(SEALED_KEY_TAG, contents)),
        )
        .unwrap();

        assert!(store.read().unwrap_err().is_wrong_kek());
    }

    #[test]
    fn test_rotate_kek_invalidates_old_passphrase() {
        let dir = tempfile::tempdir().unwrap();
        let key_pem = fresh_key_pem();

        let store = store_in(&dir, Some(b"first"));
        store.write(&key_pem).unwrap();
        assert_eq!(store.kek_version(), 0);

        store.rotate_kek(Some(b"second")).unwrap();
        assert_eq!(store.kek_version(), 1);
        assert_eq!(store.read().unwrap(), key_pem);

        // New passphrase reads, the old one does not
        assert_eq!(store_in(&dir, Some(b"second")).read().unwrap(), key_pem);
        assert!(store_in(&dir, Some(b"first")).read().unwrap_err().is_wrong_kek());
    }

    #[test]
    fn test_rotate_to_plaintext_and_back() {
        let dir = tempfile::tempdir().unwrap();
        let key_pem = fresh_key_pem();

        let store = store_in(&dir, Some(b"hunter2"));
        store.write(&key_pem).unwrap();

        store.rotate_kek(None).unwrap();
        assert_eq!(store_in(&dir, None).read().unwrap(), key_pem);

        store.rotate_kek(Some(b"hunter3")).unwrap();
        assert_eq!(store_in(&dir, Some(b"hunter3")).read().unwrap(), key_pem);
        assert!(store_in(&dir, None).read().unwrap_err().is_wrong_kek());
    }

    #[test]
    fn test_reopened_store_learns_record_version() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir, Some(b"hunter2"));
        store.write(&fresh_key_pem()).unwrap();
        store.rotate_kek(Some(b"hunter2")).unwrap();
        assert_eq!(store.kek_version(), 1);

        let reopened = store_in(&dir, Some(b"hunter2"));
        reopened.read().unwrap();
        assert_eq!(reopened.kek_version(), 1);
    }

    #[test]
    fn test_plaintext_readable_with_passphrase_configured() {
        // An unlocked record stays readable after a passphrase is set;
        // the next write seals it.
        let dir = tempfile::tempdir().unwrap();
        let key_pem = fresh_key_pem();
        store_in(&dir, None).write(&key_pem).unwrap();

        let store = store_in(&dir, Some(b"hunter2"));
        assert_eq!(store.read().unwrap(), key_pem);

        store.write(&key_pem).unwrap();
        let on_disk = std::fs::read_to_string(store.path()).unwrap();
        assert!(on_disk.contains(SEALED_KEY_TAG));
    }
}
