//! TOML configuration for the certificate authority and renewal process.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use keel_core::{CaError, Result};

use crate::root::SigningPolicy;

/// Configuration for a node's certificate authority stack.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaConfig {
    /// Total validity of issued certificates (seconds, default 90 days).
    #[serde(default = "default_cert_expiry")]
    pub cert_expiry_secs: u64,

    /// Clock-skew backdate applied to `not_before` (seconds, default 5 minutes).
    #[serde(default = "default_backdate")]
    pub backdate_secs: u64,

    /// Renewal timing policy.
    #[serde(default)]
    pub renew: RenewConfig,

    /// External signer endpoint URLs, tried round-robin.
    #[serde(default)]
    pub signer_endpoints: Vec<String>,

    /// Per-attempt timeout for signing and bootstrap requests (seconds).
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

/// Timing policy for the background renewal process.
///
/// A cycle wakes at a random point inside the jitter window, a fraction
/// of the certificate's total validity measured from `not_before`, then
/// clamps the resulting delay to `[min_delay, max_delay]`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenewConfig {
    /// Floor on the computed wake delay (seconds).
    #[serde(default = "default_min_delay")]
    pub min_delay_secs: u64,

    /// Cap on the computed wake delay (seconds).
    #[serde(default = "default_max_delay")]
    pub max_delay_secs: u64,

    /// Lower bound of the jitter window, percent of total validity.
    #[serde(default = "default_jitter_low")]
    pub jitter_low_pct: u8,

    /// Upper bound of the jitter window, percent of total validity.
    #[serde(default = "default_jitter_high")]
    pub jitter_high_pct: u8,

    /// Pause after a failed cycle before the next attempt (seconds).
    #[serde(default = "default_error_backoff")]
    pub error_backoff_secs: u64,
}

impl Default for CaConfig {
    fn default() -> Self {
        Self {
            cert_expiry_secs: default_cert_expiry(),
            backdate_secs: default_backdate(),
            renew: RenewConfig::default(),
            signer_endpoints: Vec::new(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

impl Default for RenewConfig {
    fn default() -> Self {
        Self {
            min_delay_secs: default_min_delay(),
            max_delay_secs: default_max_delay(),
            jitter_low_pct: default_jitter_low(),
            jitter_high_pct: default_jitter_high(),
            error_backoff_secs: default_error_backoff(),
        }
    }
}

impl CaConfig {
    /// Load config from a TOML file, falling back to defaults.
    ///
    /// # Errors
    ///
    /// `CaError::Config` for unparseable TOML or an inverted renewal
    /// delay window (`min_delay_secs > max_delay_secs`).
    pub fn load(path: &Path) -> Result<Self> {
        let config = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            toml::from_str(&content).map_err(|e| CaError::Config(e.to_string()))?
        } else {
            Self::default()
        };
        config.renew.validate()?;
        Ok(config)
    }

    /// The signing policy this configuration describes.
    #[must_use]
    pub const fn signing_policy(&self) -> SigningPolicy {
        SigningPolicy {
            cert_expiry: Duration::from_secs(self.cert_expiry_secs),
            backdate: Duration::from_secs(self.backdate_secs),
        }
    }

    /// Per-attempt network timeout.
    #[must_use]
    pub const fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl RenewConfig {
    /// Reject an inverted delay window.
    pub fn validate(&self) -> Result<()> {
        if self.min_delay_secs > self.max_delay_secs {
            return Err(CaError::Config(format!(
                "renewal min delay ({}s) exceeds max delay ({}s)",
                self.min_delay_secs, self.max_delay_secs
            )));
        }
        Ok(())
    }

    /// Floor on the computed wake delay.
    #[must_use]
    pub const fn min_delay(&self) -> Duration {
        Duration::from_secs(self.min_delay_secs)
    }

    /// Cap on the computed wake delay.
    #[must_use]
    pub const fn max_delay(&self) -> Duration {
        Duration::from_secs(self.max_delay_secs)
    }

    /// Pause between a failed cycle and the next attempt.
    #[must_use]
    pub const fn error_backoff(&self) -> Duration {
        Duration::from_secs(self.error_backoff_secs)
    }
}

// Default value functions for serde.
const fn default_cert_expiry() -> u64 {
    90 * 24 * 3600
}

const fn default_backdate() -> u64 {
    5 * 60
}

const fn default_request_timeout() -> u64 {
    30
}

const fn default_min_delay() -> u64 {
    5
}

const fn default_max_delay() -> u64 {
    30 * 24 * 3600
}

const fn default_jitter_low() -> u8 {
    50
}

const fn default_jitter_high() -> u8 {
    80
}

const fn default_error_backoff() -> u64 {
    30
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = CaConfig::default();
        assert_eq!(config.cert_expiry_secs, 90 * 24 * 3600);
        assert_eq!(config.backdate_secs, 300);
        assert!(config.signer_endpoints.is_empty());
        assert_eq!(config.renew.jitter_low_pct, 50);
        assert_eq!(config.renew.jitter_high_pct, 80);
        assert_eq!(config.renew.min_delay(), Duration::from_secs(5));
    }

    #[test]
    fn test_load_missing_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = CaConfig::load(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.cert_expiry_secs, CaConfig::default().cert_expiry_secs);
    }

    #[test]
    fn test_load_partial_toml_keeps_defaults_elsewhere() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ca.toml");
        std::fs::write(
            &path,
            "cert_expiry_secs = 3600\nsigner_endpoints = [\"https://ca-1.example:9443/sign\"]\n",
        )
        .unwrap();

        let config = CaConfig::load(&path).unwrap();
        assert_eq!(config.cert_expiry_secs, 3600);
        assert_eq!(config.signer_endpoints.len(), 1);
        assert_eq!(config.backdate_secs, default_backdate());
    }

    #[test]
    fn test_broken_toml_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ca.toml");
        std::fs::write(&path, "cert_expiry_secs = \"not a number\"").unwrap();
        assert!(matches!(CaConfig::load(&path), Err(CaError::Config(_))));
    }

    #[test]
    fn test_inverted_delay_window_rejected_at_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ca.toml");
        std::fs::write(
            &path,
            "[renew]\nmin_delay_secs = 60\nmax_delay_secs = 10\n",
        )
        .unwrap();

        let err = CaConfig::load(&path).unwrap_err();
        assert!(matches!(err, CaError::Config(_)));
        assert!(err.to_string().contains("min delay"));
    }

    #[test]
    fn test_toml_round_trip() {
        let mut config = CaConfig::default();
        config.signer_endpoints = vec!["https://ca-1.example:9443/sign".to_string()];
        config.renew.error_backoff_secs = 10;

        let text = toml::to_string(&config).unwrap();
        let reparsed: CaConfig = toml::from_str(&text).unwrap();
        assert_eq!(reparsed.signer_endpoints, config.signer_endpoints);
        assert_eq!(reparsed.renew.error_backoff_secs, 10);
    }

    #[test]
    fn test_signing_policy_conversion() {
        let config = CaConfig {
            cert_expiry_secs: 360,
            backdate_secs: 300,
            ..CaConfig::default()
        };
        let policy = config.signing_policy();
        assert_eq!(policy.cert_expiry, Duration::from_secs(360));
        assert_eq!(policy.backdate, Duration::from_secs(300));
        assert_eq!(policy.effective_validity(), Duration::from_secs(60));
    }
}
