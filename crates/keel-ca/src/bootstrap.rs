//! Trust-on-first-use bootstrap against an untrusted cluster.
//!
//! A joining node holds nothing but a join token. The token's embedded
//! fingerprint lets it download the cluster's root certificate over an
//! unauthenticated channel and verify it offline before anything is
//! trusted or persisted.

use std::time::Duration;

use reqwest::Client as HttpClient;
use tracing::{debug, info, warn};
use url::Url;

use keel_core::types::truncated_fingerprint;
use keel_core::{CaError, JoinToken, Result};

use crate::certs;
use crate::paths::CertPaths;
use crate::root::{RootCa, SigningPolicy};

/// Unauthenticated fetch of the cluster's root certificate bundle.
pub struct BootstrapClient {
    http: HttpClient,
    root_url: Url,
}

impl BootstrapClient {
    /// Client against the cluster's bootstrap service at `base_url`.
    ///
    /// The root bundle is served at `{base_url}/root`. The connection is
    /// deliberately unauthenticated: at this point the node trusts
    /// nothing, and the token fingerprint carries the verification.
    pub fn new(base_url: &str, request_timeout: Duration) -> Result<Self> {
        let base = Url::parse(base_url)
            .map_err(|e| CaError::InvalidUrl(format!("{base_url}: {e}")))?;
        let root_url = base
            .join("root")
            .map_err(|e| CaError::InvalidUrl(e.to_string()))?;

        let http = HttpClient::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| CaError::Config(e.to_string()))?;

        Ok(Self { http, root_url })
    }

    async fn fetch_root(&self) -> Result<String> {
        debug!(url = %self.root_url, "downloading candidate root CA");
        let response = self
            .http
            .get(self.root_url.clone())
            .send()
            .await
            .map_err(|e| CaError::Http(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(CaError::Http(format!(
                "bootstrap service returned {status}"
            )));
        }
        response
            .text()
            .await
            .map_err(|e| CaError::Http(e.to_string()))
    }
}

/// Obtain a verified root authority for a cluster this node does not
/// yet trust.
///
/// The token is parsed before any network activity; a malformed token
/// never causes a request. Root material already on disk short-circuits
/// the download entirely. An empty token is the explicit
/// trust-without-verification mode: the downloaded bundle is accepted
/// without a fingerprint check.
///
/// # Errors
///
/// `CaError::InvalidJoinToken` for malformed tokens,
/// `CaError::FingerprintMismatch` when the downloaded bundle does not
/// match the token (nothing is persisted), `CaError::InvalidRootMaterial`
/// when the candidate is not CA material.
pub async fn download_root_ca(
    paths: &CertPaths,
    token_str: &str,
    client: &BootstrapClient,
    policy: SigningPolicy,
) -> Result<RootCa> {
    let token = if token_str.is_empty() {
        None
    } else {
        Some(JoinToken::parse(token_str)?)
    };

    // Existing local trust wins; no network call.
    if paths.root_cert().exists() {
        debug!(path = %paths.root_cert().display(), "using existing local root CA");
        return RootCa::load_local(paths, policy);
    }

    let bundle_pem = client.fetch_root().await?;
    let candidate_der = certs::pem_to_ders(bundle_pem.as_bytes())
        .map_err(|e| CaError::InvalidRootMaterial(e.to_string()))?
        .concat();

    if let Some(token) = &token {
        if !token.matches_bundle(&candidate_der) {
            warn!("downloaded root CA does not match join token fingerprint");
            return Err(CaError::FingerprintMismatch {
                expected: token.fingerprint().to_string(),
                actual: truncated_fingerprint(&candidate_der),
            });
        }
    } else {
        warn!("no fingerprint in join token, trusting downloaded root CA unverified");
    }

    // Verification-only: a downloaded authority never signs.
    let root = RootCa::new(&bundle_pem, None, policy)?;
    root.save(paths)?;

    info!(
        fingerprint = %root.fingerprint(),
        certs = root.cert_count(),
        "downloaded and verified cluster root CA"
    );
    Ok(root)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil;
    use keel_core::NodeRole;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn serve_root(bundle_pem: &str, expect: u64) -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/root"))
            .respond_with(ResponseTemplate::new(200).set_body_string(bundle_pem.to_string()))
            .expect(expect)
            .mount(&server)
            .await;
        server
    }

    fn client_for(server: &MockServer) -> BootstrapClient {
        BootstrapClient::new(&server.uri(), Duration::from_secs(2)).unwrap()
    }

    #[tokio::test]
    async fn test_matching_token_downloads_and_persists() {
        let cluster = RootCa::create("cluster-ca", SigningPolicy::default()).unwrap();
        let token = cluster.join_token(NodeRole::Worker).unwrap();
        let server = serve_root(cluster.bundle_pem(), 1).await;

        let dir = tempfile::tempdir().unwrap();
        let paths = CertPaths::new(dir.path());
        let root = download_root_ca(
            &paths,
            &token.encode(),
            &client_for(&server),
            SigningPolicy::default(),
        )
        .await
        .unwrap();

        assert!(!root.can_sign());
        assert_eq!(root.fingerprint(), cluster.fingerprint());
        assert!(paths.root_cert().exists());
        assert!(!paths.root_key().exists());
    }

    #[tokio::test]
    async fn test_fingerprint_mismatch_persists_nothing() {
        let cluster = RootCa::create("cluster-ca", SigningPolicy::default()).unwrap();
        let impostor = RootCa::create("impostor-ca", SigningPolicy::default()).unwrap();
        let token = cluster.join_token(NodeRole::Worker).unwrap();
        let server = serve_root(impostor.bundle_pem(), 1).await;

        let dir = tempfile::tempdir().unwrap();
        let paths = CertPaths::new(dir.path());
        let err = download_root_ca(
            &paths,
            &token.encode(),
            &client_for(&server),
            SigningPolicy::default(),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, CaError::FingerprintMismatch { .. }));
        assert!(!paths.root_cert().exists());
    }

    #[tokio::test]
    async fn test_malformed_token_makes_no_network_call() {
        let server = serve_root("irrelevant", 0).await;
        let dir = tempfile::tempdir().unwrap();
        let paths = CertPaths::new(dir.path());

        let err = download_root_ca(
            &paths,
            "KEELTKN-not-a-valid-token",
            &client_for(&server),
            SigningPolicy::default(),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, CaError::InvalidJoinToken));
        assert!(!paths.root_cert().exists());
    }

    #[tokio::test]
    async fn test_empty_token_trusts_without_verification() {
        let cluster = RootCa::create("cluster-ca", SigningPolicy::default()).unwrap();
        let server = serve_root(cluster.bundle_pem(), 1).await;

        let dir = tempfile::tempdir().unwrap();
        let paths = CertPaths::new(dir.path());
        let root = download_root_ca(&paths, "", &client_for(&server), SigningPolicy::default())
            .await
            .unwrap();

        assert_eq!(root.fingerprint(), cluster.fingerprint());
        assert!(paths.root_cert().exists());
    }

    #[tokio::test]
    async fn test_existing_local_root_short_circuits() {
        let dir = tempfile::tempdir().unwrap();
        let paths = CertPaths::new(dir.path());
        let local = RootCa::create("local-ca", SigningPolicy::default()).unwrap();
        local.save(&paths).unwrap();

        // The server would answer, but must never be asked
        let other = RootCa::create("remote-ca", SigningPolicy::default()).unwrap();
        let server = serve_root(other.bundle_pem(), 0).await;
        let token = other.join_token(NodeRole::Worker).unwrap();

        let root = download_root_ca(
            &paths,
            &token.encode(),
            &client_for(&server),
            SigningPolicy::default(),
        )
        .await
        .unwrap();
        assert_eq!(root.fingerprint(), local.fingerprint());
    }

    #[tokio::test]
    async fn test_non_ca_candidate_rejected() {
        let cluster = RootCa::create("cluster-ca", SigningPolicy::default()).unwrap();
        let identity = testutil::worker_identity("node-1");
        let (_, csr) = crate::csr::generate_key_and_csr(&identity).unwrap();
        let leaf_pem = cluster.sign_csr(&csr, &identity).unwrap();

        let server = serve_root(&leaf_pem, 1).await;
        let dir = tempfile::tempdir().unwrap();
        let paths = CertPaths::new(dir.path());

        let err = download_root_ca(&paths, "", &client_for(&server), SigningPolicy::default())
            .await
            .unwrap_err();
        assert!(matches!(err, CaError::InvalidRootMaterial(_)));
        assert!(!paths.root_cert().exists());
    }
}
