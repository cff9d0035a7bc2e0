//! Atomic file replacement for certificate and key material.
//!
//! Readers must never observe a partially written file, so every durable
//! write lands in a temp file in the target directory, is flushed and
//! synced, then renamed over the destination.

use std::fs::File;
use std::io::Write;
use std::path::Path;

use tempfile::NamedTempFile;

use keel_core::{CaError, Result};

/// Mode for certificate files (world-readable)
pub(crate) const CERT_FILE_MODE: u32 = 0o644;

/// Mode for private key files (owner only)
pub(crate) const KEY_FILE_MODE: u32 = 0o600;

#[cfg(unix)]
fn apply_mode(file: &File, mode: u32) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    file.set_permissions(std::fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
fn apply_mode(_file: &File, _mode: u32) -> std::io::Result<()> {
    Ok(())
}

/// Write `data` to `path` atomically with the given unix mode.
pub(crate) fn write_file_atomic(path: &Path, data: &[u8], mode: u32) -> Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| CaError::Internal(format!("{} has no parent directory", path.display())))?;
    std::fs::create_dir_all(dir)?;

    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(data)?;
    tmp.as_file().sync_all()?;
    apply_mode(tmp.as_file(), mode)?;
    tmp.persist(path).map_err(|e| CaError::Io(e.error))?;
    Ok(())
}
