use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{CaError, CertificateInvalidReason};

/// Cluster role a node certificate attests to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    /// Workload-bearing node
    Worker,
    /// Control-plane node
    Manager,
}

impl NodeRole {
    /// String form used in certificate subjects (OU) and wire payloads
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Worker => "worker",
            Self::Manager => "manager",
        }
    }

    /// Single-character marker embedded in join tokens
    #[must_use]
    pub const fn token_marker(self) -> char {
        match self {
            Self::Worker => 'w',
            Self::Manager => 'm',
        }
    }

    /// Recover a role from its join-token marker
    #[must_use]
    pub const fn from_token_marker(marker: char) -> Option<Self> {
        match marker {
            'w' => Some(Self::Worker),
            'm' => Some(Self::Manager),
            _ => None,
        }
    }
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NodeRole {
    type Err = CaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "worker" => Ok(Self::Worker),
            "manager" => Ok(Self::Manager),
            other => Err(CaError::CertificateInvalid(
                CertificateInvalidReason::Malformed(format!("unknown node role: {other}")),
            )),
        }
    }
}

/// Subject identity embedded in every issued node certificate
///
/// Maps onto X.509 subject fields: `node_id` is the common name, `role`
/// the organizational unit, `org` the organization (cluster scoping id).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeIdentity {
    /// Stable node identifier (certificate CN)
    pub node_id: String,

    /// Role the certificate grants (certificate OU)
    pub role: NodeRole,

    /// Cluster the identity is scoped to (certificate O)
    pub org: String,
}

impl NodeIdentity {
    /// Build an identity from its three subject components
    pub fn new(node_id: impl Into<String>, role: NodeRole, org: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            role,
            org: org.into(),
        }
    }
}

impl fmt::Display for NodeIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.node_id, self.role)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_round_trip() {
        for role in [NodeRole::Worker, NodeRole::Manager] {
            assert_eq!(role.as_str().parse::<NodeRole>().unwrap(), role);
            assert_eq!(NodeRole::from_token_marker(role.token_marker()), Some(role));
        }
    }

    #[test]
    fn test_unknown_role_rejected() {
        assert!("admin".parse::<NodeRole>().is_err());
        assert_eq!(NodeRole::from_token_marker('x'), None);
    }

    #[test]
    fn test_identity_display() {
        let id = NodeIdentity::new("node-1", NodeRole::Worker, "cluster-a");
        assert_eq!(id.to_string(), "node-1 (worker)");
    }
}
