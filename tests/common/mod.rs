//! Shared fixtures: an authorization server wired to in-memory collaborators
//! and an in-memory management cluster.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::convert::Infallible;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use axum::Router;
use jsonwebtoken::jwk::JwkSet;
use kube::api::DynamicObject;
use parking_lot::Mutex;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use url::Url;

use mcp_kubernetes::config::{OAuthConfig, RedirectSecurityConfig};
use mcp_kubernetes::federation::management::ManagementApi;
use mcp_kubernetes::federation::provider::ClientFactory;
use mcp_kubernetes::federation::{FederationError, Manager, RequestContext};
use mcp_kubernetes::metrics::NoopMetrics;
use mcp_kubernetes::oauth::AuthorizationServer;
use mcp_kubernetes::oauth::cimd::{CimdError, DocumentFetcher};
use mcp_kubernetes::oauth::encryption::{EncryptionKey, TokenCipher};
use mcp_kubernetes::oauth::provider::{IdentityProvider, ProviderError, UpstreamIdentity};
use mcp_kubernetes::oauth::server::ServerDeps;
use mcp_kubernetes::oauth::sso::{IdTokenVerifier, KeySource, SsoError};
use mcp_kubernetes::oauth::store::{MemoryStore, SecureStore};
use mcp_kubernetes::security::Resolver;
use mcp_kubernetes::server::router::{AppState, create_router};

pub const REDIRECT: &str = "https://app.example.com/cb";
pub const REGISTRATION_TOKEN: &str = "reg-secret";
pub const VERIFIER: &str = "dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk";

/// Every host resolves to one public address
struct PublicResolver;

#[async_trait]
impl Resolver for PublicResolver {
    async fn resolve(&self, _host: &str) -> std::io::Result<Vec<IpAddr>> {
        Ok(vec!["93.184.216.34".parse().map_err(std::io::Error::other)?])
    }
}

struct NoDocuments;

#[async_trait]
impl DocumentFetcher for NoDocuments {
    async fn fetch(&self, url: &Url, _p: &[SocketAddr], _t: Duration, _m: usize) -> Result<Vec<u8>, CimdError> {
        Err(CimdError::Fetch(format!("no document at {url}")))
    }
}

struct NoKeys;

#[async_trait]
impl KeySource for NoKeys {
    async fn keys(&self, _force_refresh: bool) -> Result<JwkSet, SsoError> {
        Ok(JwkSet { keys: Vec::new() })
    }
}

/// Upstream that signs everyone in as jane@example.com
pub struct FakeUpstream;

#[async_trait]
impl IdentityProvider for FakeUpstream {
    fn name(&self) -> &'static str {
        "fake"
    }

    fn authorization_url(&self, state: &str, code_challenge: &str, redirect_uri: &str) -> String {
        let mut url = Url::parse("https://idp.example.com/auth").expect("static url");
        url.query_pairs_mut()
            .append_pair("state", state)
            .append_pair("code_challenge", code_challenge)
            .append_pair("redirect_uri", redirect_uri);
        url.to_string()
    }

    async fn exchange_code(&self, code: &str, _verifier: &str, _redirect: &str) -> Result<UpstreamIdentity, ProviderError> {
        if code != "upstream-ok" {
            return Err(ProviderError::Rejected {
                status: 400,
                body: "invalid_grant".to_string(),
            });
        }
        Ok(UpstreamIdentity {
            subject: "jane-sub".to_string(),
            email: "jane@example.com".to_string(),
            groups: vec!["platform-team".to_string()],
            id_token: "upstream.id.token".to_string(),
            refresh_token: Some("upstream-refresh".to_string()),
            expires_at: chrono::Utc::now().timestamp() + 3600,
        })
    }

    async fn refresh(&self, _refresh_token: &str) -> Result<UpstreamIdentity, ProviderError> {
        self.exchange_code("upstream-ok", "", "").await
    }
}

pub fn oauth_config() -> OAuthConfig {
    OAuthConfig {
        enabled: true,
        base_url: "https://mcp.example.com".to_string(),
        registration_token: Some(REGISTRATION_TOKEN.to_string()),
        redirect: RedirectSecurityConfig::default(),
        ..OAuthConfig::default()
    }
}

pub fn authorization_server(config: OAuthConfig) -> Arc<AuthorizationServer> {
    let store = SecureStore::new(
        Arc::new(MemoryStore::new()),
        Some(TokenCipher::new(&EncryptionKey::generate())),
    );
    Arc::new(AuthorizationServer::new(
        config,
        ServerDeps {
            store,
            resolver: Arc::new(PublicResolver),
            fetcher: Arc::new(NoDocuments),
            provider: Arc::new(FakeUpstream),
            id_verifier: Arc::new(IdTokenVerifier::new("https://dex.example.com", Arc::new(NoKeys))),
            metrics: Arc::new(NoopMetrics),
        },
    ))
}

pub fn app(oauth: Option<Arc<AuthorizationServer>>, federation: Option<Arc<Manager>>) -> Router {
    create_router(Arc::new(AppState {
        oauth,
        federation,
        shutdown: CancellationToken::new(),
        max_body_size: 1 << 20,
        request_timeout: Duration::from_secs(10),
        allowed_origins: Vec::new(),
        hsts: false,
        #[cfg(feature = "metrics")]
        prometheus: None,
    }))
}

// ── Management cluster ────────────────────────────────────────────────────

pub const KUBECONFIG: &str = r"
apiVersion: v1
kind: Config
clusters:
- name: prod-wc-01
  cluster:
    server: https://api.prod-wc-01.example.com:6443
contexts:
- name: admin
  context:
    cluster: prod-wc-01
    user: admin
current-context: admin
users:
- name: admin
  user:
    token: admin-token
";

pub const CA_PEM: &str = "-----BEGIN CERTIFICATE-----\nAAECAwQF\n-----END CERTIFICATE-----\n";

/// One CAPI cluster, its kubeconfig secret and CA ConfigMap
#[derive(Default)]
pub struct Management {
    pub list_calls: AtomicUsize,
    pub secret_reads: AtomicUsize,
}

#[async_trait]
impl ManagementApi for Management {
    async fn list_clusters(&self) -> Result<Vec<DynamicObject>, FederationError> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        tokio::task::yield_now().await;
        let cluster: DynamicObject = serde_json::from_value(json!({
            "apiVersion": "cluster.x-k8s.io/v1beta2",
            "kind": "Cluster",
            "metadata": { "name": "prod-wc-01", "namespace": "org-acme" },
            "spec": {
                "infrastructureRef": { "kind": "AWSCluster", "name": "prod-wc-01" },
                "controlPlaneEndpoint": { "host": "api.prod-wc-01.example.com", "port": 6443 }
            },
            "status": { "phase": "Provisioned", "controlPlaneReady": true, "infrastructureReady": true }
        }))
        .map_err(|e| FederationError::Kube(e.to_string()))?;
        Ok(vec![cluster])
    }

    async fn secret_data(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<BTreeMap<String, Vec<u8>>>, FederationError> {
        self.secret_reads.fetch_add(1, Ordering::SeqCst);
        tokio::task::yield_now().await;
        Ok((namespace == "org-acme" && name == "prod-wc-01-kubeconfig")
            .then(|| BTreeMap::from([("value".to_string(), KUBECONFIG.as_bytes().to_vec())])))
    }

    async fn config_map_data(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<BTreeMap<String, String>>, FederationError> {
        Ok((namespace == "org-acme" && name == "prod-wc-01-ca-public")
            .then(|| BTreeMap::from([("ca.crt".to_string(), CA_PEM.to_string())])))
    }
}

fn offline_client() -> kube::Client {
    let service = tower::service_fn(|_req: axum::http::Request<kube::client::Body>| async {
        Ok::<_, Infallible>(axum::http::Response::new(kube::client::Body::empty()))
    });
    kube::Client::new(service, "default")
}

/// Factory counting every client it builds
#[derive(Default)]
pub struct CountingFactory {
    pub management: Arc<Management>,
    pub privileged_clients: AtomicUsize,
    pub workload_clients: AtomicUsize,
    pub workload_configs: Mutex<Vec<kube::Config>>,
}

#[async_trait]
impl ClientFactory for CountingFactory {
    fn user_client(&self, _ctx: &RequestContext) -> Result<kube::Client, FederationError> {
        Ok(offline_client())
    }

    async fn privileged_client(&self) -> Result<kube::Client, FederationError> {
        self.privileged_clients.fetch_add(1, Ordering::SeqCst);
        Ok(offline_client())
    }

    fn workload_client(&self, config: kube::Config) -> Result<kube::Client, FederationError> {
        self.workload_clients.fetch_add(1, Ordering::SeqCst);
        self.workload_configs.lock().push(config);
        Ok(offline_client())
    }

    fn management_api(&self, _client: kube::Client) -> Arc<dyn ManagementApi> {
        self.management.clone()
    }
}
