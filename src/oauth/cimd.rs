//! Client ID Metadata Documents.
//!
//! A client may identify itself with an HTTPS URL instead of a registered ID.
//! The URL is fetched (SSRF-checked, address-pinned, size and time bounded)
//! and the JSON document at it lists the client's redirect URIs. Results are
//! cached positively and negatively so an authorization attempt costs at most
//! one fetch per TTL.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use url::Url;

use crate::config::CimdConfig;
use crate::security::ssrf::{AddressAllowance, Resolver, SsrfError, check_outbound_url};

/// CIMD failures
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CimdError {
    /// CIMD is disabled in this deployment
    #[error("client metadata documents are disabled")]
    Disabled,
    /// Client ID is not a usable HTTPS URL
    #[error("invalid client metadata URL: {0}")]
    InvalidClientId(String),
    /// Target refused by SSRF policy
    #[error(transparent)]
    Ssrf(#[from] SsrfError),
    /// Transport failure or timeout
    #[error("failed to fetch client metadata: {0}")]
    Fetch(String),
    /// Non-200 response
    #[error("client metadata endpoint returned HTTP {0}")]
    Status(u16),
    /// Body exceeded the configured limit
    #[error("client metadata document exceeds {0} bytes")]
    TooLarge(usize),
    /// Body is not a valid document
    #[error("invalid client metadata document: {0}")]
    InvalidDocument(String),
}

/// The subset of RFC 7591 client metadata this server uses
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientMetadataDocument {
    /// Must equal the URL the document was fetched from
    pub client_id: String,
    /// Display name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_name: Option<String>,
    /// Allowed redirect URIs
    #[serde(default)]
    pub redirect_uris: Vec<String>,
    /// Client home page
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_uri: Option<String>,
    /// Token endpoint auth method; CIMD clients are public (`none`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_endpoint_auth_method: Option<String>,
}

/// Whether `client_id` should be resolved as a metadata document URL.
///
/// It must be an `https` URL with a non-root path, no fragment and no
/// embedded credentials.
#[must_use]
pub fn is_cimd_client_id(client_id: &str) -> bool {
    let Ok(url) = Url::parse(client_id) else {
        return false;
    };
    url.scheme() == "https"
        && url.host_str().is_some()
        && url.fragment().is_none()
        && url.username().is_empty()
        && url.password().is_none()
        && url.path() != "/"
}

/// Fetches a document from an already-validated, pinned target.
#[async_trait]
pub trait DocumentFetcher: Send + Sync + 'static {
    /// GET `url`, connecting only to `pinned`, returning at most `max_bytes`.
    async fn fetch(
        &self,
        url: &Url,
        pinned: &[SocketAddr],
        timeout: Duration,
        max_bytes: usize,
    ) -> Result<Vec<u8>, CimdError>;
}

/// `reqwest` fetcher. Redirects are not followed; DNS is pinned to the
/// addresses that passed the SSRF check, closing the rebinding window.
#[derive(Debug, Clone, Copy, Default)]
pub struct HttpFetcher;

#[async_trait]
impl DocumentFetcher for HttpFetcher {
    async fn fetch(
        &self,
        url: &Url,
        pinned: &[SocketAddr],
        timeout: Duration,
        max_bytes: usize,
    ) -> Result<Vec<u8>, CimdError> {
        let host = url
            .host_str()
            .ok_or_else(|| CimdError::InvalidClientId("URL has no host".to_string()))?;
        let client = reqwest::Client::builder()
            .https_only(true)
            .redirect(reqwest::redirect::Policy::none())
            .timeout(timeout)
            .resolve_to_addrs(host, pinned)
            .build()
            .map_err(|e| CimdError::Fetch(e.to_string()))?;

        let mut response = client
            .get(url.as_str())
            .header(reqwest::header::ACCEPT, "application/json")
            .send()
            .await
            .map_err(|e| CimdError::Fetch(e.to_string()))?;

        if !response.status().is_success() {
            return Err(CimdError::Status(response.status().as_u16()));
        }
        if response
            .content_length()
            .is_some_and(|len| len > max_bytes as u64)
        {
            return Err(CimdError::TooLarge(max_bytes));
        }

        let mut body = Vec::new();
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| CimdError::Fetch(e.to_string()))?
        {
            if body.len() + chunk.len() > max_bytes {
                return Err(CimdError::TooLarge(max_bytes));
            }
            body.extend_from_slice(&chunk);
        }
        Ok(body)
    }
}

struct Cached<T> {
    value: T,
    stored_at: Instant,
}

/// Resolver for metadata-document client IDs
pub struct CimdResolver {
    config: CimdConfig,
    resolver: Arc<dyn Resolver>,
    fetcher: Arc<dyn DocumentFetcher>,
    positive: DashMap<String, Cached<Arc<ClientMetadataDocument>>>,
    negative: DashMap<String, Cached<CimdError>>,
}

impl std::fmt::Debug for CimdResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CimdResolver")
            .field("config", &self.config)
            .field("cached", &self.positive.len())
            .finish_non_exhaustive()
    }
}

impl CimdResolver {
    /// Create a resolver
    pub fn new(
        config: CimdConfig,
        resolver: Arc<dyn Resolver>,
        fetcher: Arc<dyn DocumentFetcher>,
    ) -> Self {
        Self {
            config,
            resolver,
            fetcher,
            positive: DashMap::new(),
            negative: DashMap::new(),
        }
    }

    /// Whether CIMD handling is on
    #[must_use]
    pub fn enabled(&self) -> bool {
        self.config.enabled
    }

    fn allowance(&self) -> AddressAllowance {
        if self.config.allow_private_ips {
            AddressAllowance {
                loopback: true,
                private: true,
                link_local: false,
            }
        } else {
            AddressAllowance::PUBLIC_ONLY
        }
    }

    /// Resolve a client ID URL to its metadata document.
    pub async fn resolve(&self, client_id: &str) -> Result<Arc<ClientMetadataDocument>, CimdError> {
        if !self.config.enabled {
            return Err(CimdError::Disabled);
        }
        if !is_cimd_client_id(client_id) {
            return Err(CimdError::InvalidClientId(
                "client_id must be an https URL with a path".to_string(),
            ));
        }

        if let Some(hit) = self.positive.get(client_id) {
            if hit.stored_at.elapsed() < self.config.cache_ttl {
                return Ok(Arc::clone(&hit.value));
            }
        }
        if let Some(miss) = self.negative.get(client_id) {
            if miss.stored_at.elapsed() < self.config.negative_cache_ttl {
                return Err(miss.value.clone());
            }
        }

        match self.fetch_document(client_id).await {
            Ok(doc) => {
                let doc = Arc::new(doc);
                self.negative.remove(client_id);
                self.positive.insert(
                    client_id.to_string(),
                    Cached {
                        value: Arc::clone(&doc),
                        stored_at: Instant::now(),
                    },
                );
                debug!(client_id = %client_id, "Client metadata document cached");
                Ok(doc)
            }
            Err(e) => {
                warn!(client_id = %client_id, error = %e, "Client metadata document rejected");
                self.positive.remove(client_id);
                self.negative.insert(
                    client_id.to_string(),
                    Cached {
                        value: e.clone(),
                        stored_at: Instant::now(),
                    },
                );
                Err(e)
            }
        }
    }

    async fn fetch_document(&self, client_id: &str) -> Result<ClientMetadataDocument, CimdError> {
        let (url, pinned) = check_outbound_url(
            self.resolver.as_ref(),
            client_id,
            self.allowance(),
            self.config.fetch_timeout,
        )
        .await?;

        let body = tokio::time::timeout(
            self.config.fetch_timeout,
            self.fetcher
                .fetch(&url, &pinned, self.config.fetch_timeout, self.config.max_document_bytes),
        )
        .await
        .map_err(|_| CimdError::Fetch("timed out".to_string()))??;

        let doc: ClientMetadataDocument = serde_json::from_slice(&body)
            .map_err(|e| CimdError::InvalidDocument(e.to_string()))?;

        if doc.client_id != client_id {
            return Err(CimdError::InvalidDocument(
                "client_id in document does not match its URL".to_string(),
            ));
        }
        if doc.redirect_uris.is_empty() {
            return Err(CimdError::InvalidDocument("redirect_uris is empty".to_string()));
        }
        if doc
            .token_endpoint_auth_method
            .as_deref()
            .is_some_and(|m| m != "none")
        {
            return Err(CimdError::InvalidDocument(
                "metadata document clients must use token_endpoint_auth_method=none".to_string(),
            ));
        }
        Ok(doc)
    }

    /// Drop stale cache entries
    pub fn purge_expired(&self) {
        self.positive
            .retain(|_, c| c.stored_at.elapsed() < self.config.cache_ttl);
        self.negative
            .retain(|_, c| c.stored_at.elapsed() < self.config.negative_cache_ttl);
    }
}
