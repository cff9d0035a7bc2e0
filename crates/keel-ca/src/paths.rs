//! On-disk layout for node certificate material.

use std::path::{Path, PathBuf};

/// Well-known file locations under a node's certificate directory.
///
/// Layout: `root.crt` (trusted root bundle), `root.key` (only on
/// signing-capable nodes), `node.crt` / `node.key` (this node's identity).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertPaths {
    dir: PathBuf,
}

impl CertPaths {
    /// Certificate paths rooted at `dir`
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// The certificate directory itself
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Trusted root certificate bundle
    #[must_use]
    pub fn root_cert(&self) -> PathBuf {
        self.dir.join("root.crt")
    }

    /// Root signing key, present only on signing-capable nodes
    #[must_use]
    pub fn root_key(&self) -> PathBuf {
        self.dir.join("root.key")
    }

    /// This node's certificate
    #[must_use]
    pub fn node_cert(&self) -> PathBuf {
        self.dir.join("node.crt")
    }

    /// This node's private key
    #[must_use]
    pub fn node_key(&self) -> PathBuf {
        self.dir.join("node.key")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout() {
        let paths = CertPaths::new("/var/lib/keel/certs");
        assert_eq!(paths.root_cert(), Path::new("/var/lib/keel/certs/root.crt"));
        assert_eq!(paths.root_key(), Path::new("/var/lib/keel/certs/root.key"));
        assert_eq!(paths.node_cert(), Path::new("/var/lib/keel/certs/node.crt"));
        assert_eq!(paths.node_key(), Path::new("/var/lib/keel/certs/node.key"));
    }
}
