//! External certificate signing over HTTPS.
//!
//! When the local root authority holds no signing key, CSRs are forwarded
//! to remote signer endpoints. Endpoints are tried round-robin, one
//! bounded attempt each; a success is always an externally attested
//! certificate, never something minted here.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use reqwest::Client as HttpClient;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use url::Url;

use keel_core::{CaError, NodeIdentity, Result};

/// Default per-attempt timeout
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Signing request body sent to a remote authority
#[derive(Debug, Serialize)]
struct SignRequest<'a> {
    csr: &'a str,
    node_id: &'a str,
    role: &'a str,
    org: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    secret: Option<&'a str>,
}

/// Successful signing response
#[derive(Debug, Deserialize)]
struct SignResponse {
    certificate: String,
}

/// Error body returned by a signer that rejected the request
#[derive(Debug, Deserialize)]
struct SignError {
    #[serde(default)]
    error: String,
}

/// Client for remote certificate signing authorities.
#[derive(Clone)]
pub struct ExternalCa {
    inner: Arc<CaInner>,
}

struct CaInner {
    http: HttpClient,
    urls: Mutex<Vec<Url>>,
    cursor: AtomicUsize,
    request_timeout: Duration,
}

/// Builder for [`ExternalCa`].
pub struct ExternalCaBuilder {
    urls: Vec<String>,
    trust_root_pem: Option<String>,
    identity_pem: Option<String>,
    request_timeout: Duration,
}

impl ExternalCaBuilder {
    fn new(urls: &[String]) -> Self {
        Self {
            urls: urls.to_vec(),
            trust_root_pem: None,
            identity_pem: None,
            request_timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Trust only this root bundle when connecting to signer endpoints.
    #[must_use]
    pub fn trust_root(mut self, bundle_pem: impl Into<String>) -> Self {
        self.trust_root_pem = Some(bundle_pem.into());
        self
    }

    /// Present this PEM bundle (key + certificate) as the mTLS client
    /// identity. Renewals pass the node's current credentials here.
    #[must_use]
    pub fn identity(mut self, pem_bundle: impl Into<String>) -> Self {
        self.identity_pem = Some(pem_bundle.into());
        self
    }

    /// Per-attempt request timeout.
    #[must_use]
    pub const fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Build the client.
    ///
    /// # Errors
    ///
    /// `CaError::InvalidUrl` for unparseable endpoints, `CaError::Config`
    /// when the trust root or client identity is unusable.
    pub fn build(self) -> Result<ExternalCa> {
        let urls = parse_urls(&self.urls)?;

        let mut builder = HttpClient::builder().timeout(self.request_timeout);
        if let Some(pem) = &self.trust_root_pem {
            let cert = reqwest::Certificate::from_pem(pem.as_bytes())
                .map_err(|e| CaError::Config(format!("unusable trust root: {e}")))?;
            builder = builder.add_root_certificate(cert);
        }
        if let Some(pem) = &self.identity_pem {
            let identity = reqwest::Identity::from_pem(pem.as_bytes())
                .map_err(|e| CaError::Config(format!("unusable client identity: {e}")))?;
            builder = builder.identity(identity);
        }

        let http = builder
            .build()
            .map_err(|e| CaError::Config(e.to_string()))?;

        Ok(ExternalCa {
            inner: Arc::new(CaInner {
                http,
                urls: Mutex::new(urls),
                cursor: AtomicUsize::new(0),
                request_timeout: self.request_timeout,
            }),
        })
    }
}

impl ExternalCa {
    /// Start building a client over the given endpoint URLs.
    #[must_use]
    pub fn builder(urls: &[String]) -> ExternalCaBuilder {
        ExternalCaBuilder::new(urls)
    }

    /// Replace the endpoint list wholesale.
    pub fn update_urls(&self, urls: &[String]) -> Result<()> {
        let parsed = parse_urls(urls)?;
        *self.inner.urls.lock().expect("url list lock poisoned") = parsed;
        Ok(())
    }

    /// Number of configured endpoints.
    #[must_use]
    pub fn url_count(&self) -> usize {
        self.inner.urls.lock().expect("url list lock poisoned").len()
    }

    /// Current endpoint list in string form.
    #[must_use]
    pub fn urls(&self) -> Vec<String> {
        self.inner
            .urls
            .lock()
            .expect("url list lock poisoned")
            .iter()
            .map(Url::to_string)
            .collect()
    }

    /// Forward a CSR to the remote authorities for signing.
    ///
    /// Endpoints are tried round-robin, one bounded attempt each, until
    /// one succeeds or every endpoint has failed. `IdentityNotFound`
    /// short-circuits: the cluster has rejected this node, so trying
    /// another endpoint cannot help.
    ///
    /// # Errors
    ///
    /// `CaError::SigningUnavailable` wrapping the last failure once every
    /// endpoint has been tried; `CaError::IdentityNotFound` when the
    /// cluster no longer knows this node.
    pub async fn sign(
        &self,
        identity: &NodeIdentity,
        csr_pem: &str,
        secret: Option<&str>,
    ) -> Result<String> {
        let urls = self.inner.urls.lock().expect("url list lock poisoned").clone();
        if urls.is_empty() {
            return Err(CaError::SigningUnavailable(
                "no signer endpoints configured".to_string(),
            ));
        }

        let start = self.inner.cursor.fetch_add(1, Ordering::Relaxed);
        let mut last_err = CaError::SigningUnavailable("no attempt made".to_string());

        for i in 0..urls.len() {
            let url = &urls[(start + i) % urls.len()];
            debug!(endpoint = %url, node_id = %identity.node_id, "requesting certificate signature");

            match self.try_sign(url, identity, csr_pem, secret).await {
                Ok(cert_pem) => return Ok(cert_pem),
                Err(e @ CaError::IdentityNotFound(_)) => return Err(e),
                Err(e) => {
                    warn!(endpoint = %url, error = %e, "signer endpoint failed");
                    last_err = e;
                }
            }
        }

        Err(CaError::SigningUnavailable(last_err.to_string()))
    }

    async fn try_sign(
        &self,
        url: &Url,
        identity: &NodeIdentity,
        csr_pem: &str,
        secret: Option<&str>,
    ) -> Result<String> {
        let body = SignRequest {
            csr: csr_pem,
            node_id: &identity.node_id,
            role: identity.role.as_str(),
            org: &identity.org,
            secret,
        };

        let response = self
            .inner
            .http
            .post(url.clone())
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    CaError::Timeout(self.inner.request_timeout)
                } else {
                    CaError::Http(e.to_string())
                }
            })?;

        let status = response.status();
        if status.is_success() {
            let signed: SignResponse = response
                .json()
                .await
                .map_err(|e| CaError::Http(format!("malformed signing response: {e}")))?;
            return Ok(signed.certificate);
        }

        let message = response
            .json::<SignError>()
            .await
            .map(|e| e.error)
            .unwrap_or_default();

        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(CaError::IdentityNotFound(identity.node_id.clone()));
        }
        Err(CaError::Http(format!(
            "signer returned {status}: {message}"
        )))
    }
}

impl std::fmt::Debug for ExternalCa {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExternalCa")
            .field("urls", &self.url_count())
            .field("request_timeout", &self.inner.request_timeout)
            .finish()
    }
}

fn parse_urls(urls: &[String]) -> Result<Vec<Url>> {
    urls.iter()
        .map(|u| Url::parse(u).map_err(|e| CaError::InvalidUrl(format!("{u}: {e}"))))
        .collect()
}
