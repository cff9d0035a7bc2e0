//! Key pair and certificate signing request generation.

use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair};
use x509_parser::prelude::{FromDer, X509CertificationRequest};

use keel_core::{CaError, NodeIdentity, Result};

/// PEM tag of a certificate signing request
pub(crate) const CSR_PEM_TAG: &str = "CERTIFICATE REQUEST";

/// Build the X.509 subject for a node identity.
///
/// CN carries the node id, OU the role, O the cluster organization.
pub(crate) fn subject_dn(identity: &NodeIdentity) -> DistinguishedName {
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, identity.node_id.as_str());
    dn.push(DnType::OrganizationalUnitName, identity.role.as_str());
    dn.push(DnType::OrganizationName, identity.org.as_str());
    dn
}

/// Generate a fresh P-256 key pair and a CSR naming `identity`.
///
/// Returns `(key_pem, csr_pem)`.
pub fn generate_key_and_csr(identity: &NodeIdentity) -> Result<(String, String)> {
    let key = KeyPair::generate().map_err(|e| CaError::Internal(e.to_string()))?;

    let mut params = CertificateParams::default();
    params.distinguished_name = subject_dn(identity);

    let csr = params
        .serialize_request(&key)
        .map_err(|e| CaError::Internal(e.to_string()))?;
    let csr_pem = csr.pem().map_err(|e| CaError::Internal(e.to_string()))?;

    Ok((key.serialize_pem(), csr_pem))
}

/// Check that a CSR parses and its embedded self-signature verifies.
///
/// Run before any signing path touches the request, so a garbage or
/// tampered CSR is rejected with `InvalidCsr` instead of being signed.
pub(crate) fn verify_csr(csr_pem: &str) -> Result<()> {
    let block = pem::parse(csr_pem).map_err(|e| CaError::InvalidCsr(e.to_string()))?;
    if block.tag() != CSR_PEM_TAG {
        return Err(CaError::InvalidCsr(format!(
            "unexpected PEM tag {}",
            block.tag()
        )));
    }

    let (_, csr) = X509CertificationRequest::from_der(block.contents())
        .map_err(|e| CaError::InvalidCsr(e.to_string()))?;
    csr.verify_signature()
        .map_err(|e| CaError::InvalidCsr(e.to_string()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_core::NodeRole;

    #[test]
    fn test_generated_csr_verifies() {
        let identity = NodeIdentity::new("node-1", NodeRole::Worker, "cluster-a");
        let (key_pem, csr_pem) = generate_key_and_csr(&identity).unwrap();

        assert!(key_pem.contains("PRIVATE KEY"));
        assert!(csr_pem.contains("CERTIFICATE REQUEST"));
        verify_csr(&csr_pem).unwrap();
    }

    #[test]
    fn test_garbage_csr_rejected() {
        assert!(matches!(
            verify_csr("not a csr"),
            Err(CaError::InvalidCsr(_))
        ));

        let wrong_tag = "-----BEGIN CERTIFICATE-----\nAAAA\n-----END CERTIFICATE-----\n";
        assert!(matches!(
            verify_csr(wrong_tag),
            Err(CaError::InvalidCsr(_))
        ));
    }

    #[test]
    fn test_tampered_csr_signature_rejected() {
        let identity = NodeIdentity::new("node-1", NodeRole::Worker, "cluster-a");
        let (_, csr_pem) = generate_key_and_csr(&identity).unwrap();

        // Flip a byte in the body, keeping valid base64 so the PEM parses
        let block = pem::parse(&csr_pem).unwrap();
        let mut contents = block.contents().to_vec();
        let mid = contents.len() / 2;
        contents[mid] ^= 0xff;
        let tampered = pem::Pem::new(CSR_PEM_TAG, contents);

        let result = verify_csr(&pem::encode(&tampered));
        assert!(matches!(result, Err(CaError::InvalidCsr(_))));
    }
}
