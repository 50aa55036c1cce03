//! Federation manager
//!
//! Entry point for the tool layer: `client(cluster, ctx)` returns a client
//! for the management cluster (empty name) or a CAPI workload cluster,
//! authenticated per [`WorkloadAuthMode`] and served from the cache.

use std::num::NonZeroU32;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use parking_lot::Mutex;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::cache::{CacheKey, CacheStats, ClientCache};
use super::discovery::{self, ClusterLocation, ClusterSummary};
use super::error::FederationError;
use super::group_mapper::GroupMapper;
use super::provider::{ClientFactory, HybridProvider, KubeClientFactory};
use super::rest_config::{
    self, CA_CONFIG_MAP_KEY, Impersonation, apply_connectivity, apply_impersonation, config_from_kubeconfig,
    kubeconfig_from_secret, passthrough_config,
};
use super::validation::{UserInfo, anonymize_email, sanitize_host, validate_cluster_name, validate_user_info};
use super::{RequestContext, WorkloadAuthMode};
use crate::config::FederationConfig;
use crate::metrics::{CacheMetrics, PrivilegedAccessMetrics, WorkloadAuthMetrics};

/// Fixed client-side limits for SSO passthrough clients
const PASSTHROUGH_QPS: u32 = 50;
const PASSTHROUGH_BURST: u32 = 100;

/// How long `close` waits for background tasks
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Authenticated client for one cluster, owned by the cache
pub struct ClusterClient {
    cluster: String,
    host: String,
    auth: &'static str,
    client: kube::Client,
    limiter: DefaultDirectRateLimiter,
}

impl std::fmt::Debug for ClusterClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterClient")
            .field("cluster", &self.cluster)
            .field("host", &self.host)
            .field("auth", &self.auth)
            .finish_non_exhaustive()
    }
}

impl ClusterClient {
    fn new(cluster: &str, host: &str, auth: &'static str, client: kube::Client, qps: u32, burst: u32) -> Self {
        let quota = Quota::per_second(NonZeroU32::new(qps).unwrap_or(NonZeroU32::MIN))
            .allow_burst(NonZeroU32::new(burst).unwrap_or(NonZeroU32::MIN));
        Self {
            cluster: cluster.to_string(),
            host: sanitize_host(host),
            auth,
            client,
            limiter: RateLimiter::direct(quota),
        }
    }

    /// Cluster name; empty for the management cluster
    #[must_use]
    pub fn cluster(&self) -> &str {
        &self.cluster
    }

    /// API server endpoint with IP literals redacted
    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    /// `user`, `impersonation` or `sso-passthrough`
    #[must_use]
    pub fn auth(&self) -> &'static str {
        self.auth
    }

    /// The underlying client, without client-side throttling
    #[must_use]
    pub fn client(&self) -> &kube::Client {
        &self.client
    }

    /// The underlying client after waiting for a request slot
    pub async fn throttled(&self) -> kube::Client {
        self.limiter.until_ready().await;
        self.client.clone()
    }
}

/// Manager health snapshot
#[derive(Debug, Clone, Serialize)]
pub struct ManagerStats {
    /// Client cache
    pub cache: CacheStats,
    /// Workload authentication mode
    pub workload_auth_mode: &'static str,
    /// Whether `close` has run
    pub closed: bool,
}

/// Resolves per-cluster clients for authenticated users
pub struct Manager {
    config: FederationConfig,
    factory: Arc<dyn ClientFactory>,
    provider: HybridProvider,
    cache: Arc<ClientCache<Arc<ClusterClient>>>,
    group_mapper: Option<GroupMapper>,
    metrics: Arc<dyn WorkloadAuthMetrics>,
    closed: AtomicBool,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Manager {
    /// Build a manager over `factory`
    pub fn new<M>(config: FederationConfig, factory: Arc<dyn ClientFactory>, metrics: Arc<M>) -> Result<Self, FederationError>
    where
        M: CacheMetrics + PrivilegedAccessMetrics + WorkloadAuthMetrics + 'static,
    {
        let group_mapper = if config.group_mappings.is_empty() {
            None
        } else {
            Some(GroupMapper::new(config.group_mappings.clone()).map_err(|e| FederationError::Kube(e.to_string()))?)
        };
        let cache_metrics: Arc<dyn CacheMetrics> = metrics.clone();
        let privileged_metrics: Arc<dyn PrivilegedAccessMetrics> = metrics.clone();
        let workload_metrics: Arc<dyn WorkloadAuthMetrics> = metrics;

        let provider = HybridProvider::new(
            Arc::clone(&factory),
            config.credential_mode,
            &config.privileged,
            privileged_metrics,
        );
        Ok(Self {
            cache: Arc::new(ClientCache::new(config.cache.ttl, config.cache.max_entries, cache_metrics)),
            provider,
            factory,
            group_mapper,
            metrics: workload_metrics,
            closed: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
            config,
        })
    }

    /// Manager talking to real clusters
    pub async fn from_config<M>(config: &FederationConfig, metrics: Arc<M>) -> Result<Self, FederationError>
    where
        M: CacheMetrics + PrivilegedAccessMetrics + WorkloadAuthMetrics + 'static,
    {
        let factory = KubeClientFactory::from_config(config).await?;
        let manager = Self::new(config.clone(), Arc::new(factory), metrics)?;
        info!(
            workload_auth_mode = config.workload_auth_mode.as_str(),
            credential_mode = ?config.credential_mode,
            strict = config.privileged.strict,
            cache_ttl_secs = config.cache.ttl.as_secs(),
            "Federation manager ready"
        );
        Ok(manager)
    }

    /// Start the cache sweeper and limiter cleanup
    pub fn start(&self) {
        let mut tasks = self.tasks.lock();
        tasks.push(
            self.cache
                .spawn_sweeper(self.config.cache.cleanup_interval, self.shutdown.child_token()),
        );
        tasks.push(self.provider.spawn_limiter_cleanup(self.shutdown.child_token()));
    }

    fn check_open(&self) -> Result<(), FederationError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(FederationError::ManagerClosed);
        }
        Ok(())
    }

    /// Client for `cluster` acting as the caller; empty `cluster` is the management cluster
    pub async fn client(&self, cluster: &str, ctx: &RequestContext) -> Result<Arc<ClusterClient>, FederationError> {
        self.check_open()?;
        validate_user_info(&ctx.user)?;
        if cluster.is_empty() {
            return self.management_client(ctx).await;
        }
        validate_cluster_name(cluster)?;
        debug!(
            cluster,
            user_hash = %anonymize_email(&ctx.user.email),
            trace_id = ctx.trace_id.as_deref().unwrap_or_default(),
            "Resolving cluster client"
        );

        let key = CacheKey::new(cluster, identity_fingerprint(&ctx.user));
        match self.config.workload_auth_mode {
            WorkloadAuthMode::Impersonation => {
                self.cache
                    .get_or_create(&key, || self.create_impersonation_client(cluster, ctx))
                    .await
            }
            WorkloadAuthMode::SsoPassthrough if self.config.cache.sso_passthrough_cache => {
                self.cache
                    .get_or_create(&key, || self.create_passthrough_client(cluster, ctx))
                    .await
            }
            WorkloadAuthMode::SsoPassthrough => self.create_passthrough_client(cluster, ctx).await,
        }
    }

    /// CAPI clusters visible to the caller
    pub async fn list_clusters(&self, ctx: &RequestContext) -> Result<Vec<ClusterSummary>, FederationError> {
        self.check_open()?;
        validate_user_info(&ctx.user)?;
        let mgmt = self.management_client(ctx).await?;
        let api = self.provider.discovery_api(&ctx.user, mgmt.client()).await?;
        discovery::list_clusters(api.as_ref()).await
    }

    /// One CAPI cluster by name
    pub async fn cluster_summary(&self, cluster: &str, ctx: &RequestContext) -> Result<ClusterSummary, FederationError> {
        self.check_open()?;
        validate_user_info(&ctx.user)?;
        validate_cluster_name(cluster)?;
        let mgmt = self.management_client(ctx).await?;
        let api = self.provider.discovery_api(&ctx.user, mgmt.client()).await?;
        discovery::cluster_summary(api.as_ref(), cluster).await
    }

    /// Drop cached clients for `cluster`, e.g. after its credentials rotated
    pub fn invalidate_cluster(&self, cluster: &str) -> usize {
        self.cache.delete_by_cluster(cluster)
    }

    /// Stop background tasks and release every cached client.
    ///
    /// Idempotent; later calls to `client` fail with [`FederationError::ManagerClosed`].
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shutdown.cancel();
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            if tokio::time::timeout(SHUTDOWN_GRACE, task).await.is_err() {
                warn!("Federation background task did not stop within the grace period");
            }
        }
        self.cache.clear();
        info!("Federation manager closed");
    }

    /// Whether `close` has run
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Health snapshot
    #[must_use]
    pub fn stats(&self) -> ManagerStats {
        ManagerStats {
            cache: self.cache.stats(),
            workload_auth_mode: self.config.workload_auth_mode.as_str(),
            closed: self.is_closed(),
        }
    }

    /// Client cache size and limits
    #[must_use]
    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    async fn management_client(&self, ctx: &RequestContext) -> Result<Arc<ClusterClient>, FederationError> {
        let key = CacheKey::new("", identity_fingerprint(&ctx.user));
        self.cache
            .get_or_create(&key, || async {
                let client = self.factory.user_client(ctx)?;
                let c = &self.config.connectivity;
                Ok::<_, FederationError>(Arc::new(ClusterClient::new("", "management", "user", client, c.qps, c.burst)))
            })
            .await
    }

    async fn locate(&self, cluster: &str, ctx: &RequestContext) -> Result<(ClusterLocation, Arc<ClusterClient>), FederationError> {
        let mgmt = self.management_client(ctx).await?;
        let api = self.provider.discovery_api(&ctx.user, mgmt.client()).await?;
        let location = discovery::locate_cluster(api.as_ref(), cluster).await?;
        Ok((location, mgmt))
    }

    async fn create_impersonation_client(
        &self,
        cluster: &str,
        ctx: &RequestContext,
    ) -> Result<Arc<ClusterClient>, FederationError> {
        let started = Instant::now();
        let result = self.build_impersonation_client(cluster, &ctx.user, ctx).await;
        let outcome = if result.is_ok() { "success" } else { "error" };
        self.metrics
            .record_impersonation(cluster, outcome, started.elapsed());
        result
    }

    async fn build_impersonation_client(
        &self,
        cluster: &str,
        user: &UserInfo,
        ctx: &RequestContext,
    ) -> Result<Arc<ClusterClient>, FederationError> {
        let user_hash = anonymize_email(&user.email);
        let (location, mgmt) = self.locate(cluster, ctx).await?;

        let secret_name = format!("{cluster}-kubeconfig");
        let secrets = self.provider.secret_api(user, mgmt.client()).await?;
        let kubeconfig_error = |reason: String, not_found: bool| FederationError::Kubeconfig {
            cluster: cluster.to_string(),
            resource: "secret",
            resource_name: secret_name.clone(),
            namespace: location.namespace.clone(),
            reason,
            not_found,
        };
        let data = secrets
            .secret_data(&location.namespace, &secret_name)
            .await
            .map_err(|e| kubeconfig_error(e.to_string(), false))?
            .ok_or_else(|| kubeconfig_error("secret not found".to_string(), true))?;
        let raw = kubeconfig_from_secret(&data).ok_or_else(|| {
            kubeconfig_error(
                format!(
                    "secret missing '{}' or '{}' key",
                    rest_config::KUBECONFIG_SECRET_KEY,
                    rest_config::KUBECONFIG_SECRET_KEY_ALT
                ),
                false,
            )
        })?;
        let mut config = config_from_kubeconfig(raw)
            .await
            .map_err(|e| kubeconfig_error(e.to_string(), false))?;

        apply_connectivity(&mut config, &self.config.connectivity);
        // Trace ids are per request; cached clients carry identity only.
        let impersonation = Impersonation::for_user(user, None, self.group_mapper.as_ref());
        apply_impersonation(&mut config, &impersonation).map_err(|e| FederationError::Impersonation {
            cluster: cluster.to_string(),
            user_hash: user_hash.clone(),
            reason: e.to_string(),
        })?;

        let host = config.cluster_url.to_string();
        let client = self
            .factory
            .workload_client(config)
            .map_err(|e| FederationError::Connection {
                cluster: cluster.to_string(),
                host: sanitize_host(&host),
                reason: e.to_string(),
            })?;
        debug!(cluster, host = %sanitize_host(&host), user_hash = %user_hash, "Created impersonation client");
        let c = &self.config.connectivity;
        Ok(Arc::new(ClusterClient::new(cluster, &host, "impersonation", client, c.qps, c.burst)))
    }

    async fn create_passthrough_client(
        &self,
        cluster: &str,
        ctx: &RequestContext,
    ) -> Result<Arc<ClusterClient>, FederationError> {
        let started = Instant::now();
        let result = self.build_passthrough_client(cluster, ctx).await;
        let outcome = match &result {
            Ok(_) => "success",
            Err(FederationError::SsoTokenMissing) => "token_missing",
            Err(_) => "error",
        };
        self.metrics.record_passthrough(cluster, outcome, started.elapsed());
        result
    }

    async fn build_passthrough_client(
        &self,
        cluster: &str,
        ctx: &RequestContext,
    ) -> Result<Arc<ClusterClient>, FederationError> {
        let token = ctx
            .sso_token
            .as_deref()
            .filter(|t| !t.is_empty())
            .ok_or(FederationError::SsoTokenMissing)?;
        let (location, mgmt) = self.locate(cluster, ctx).await?;
        let endpoint = location.endpoint.clone().ok_or_else(|| FederationError::Connection {
            cluster: cluster.to_string(),
            host: String::new(),
            reason: "CAPI Cluster has no spec.controlPlaneEndpoint".to_string(),
        })?;

        let cm_name = format!("{cluster}{}", self.config.ca_config_map_suffix);
        let ca_error = |reason: String, not_found: bool| FederationError::Kubeconfig {
            cluster: cluster.to_string(),
            resource: "configmap",
            resource_name: cm_name.clone(),
            namespace: location.namespace.clone(),
            reason,
            not_found,
        };
        let api = self.provider.secret_api(&ctx.user, mgmt.client()).await?;
        let data = api
            .config_map_data(&location.namespace, &cm_name)
            .await
            .map_err(|e| ca_error(e.to_string(), false))?
            .ok_or_else(|| ca_error("configmap not found".to_string(), true))?;
        let ca = data
            .get(CA_CONFIG_MAP_KEY)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| ca_error(format!("configmap missing '{CA_CONFIG_MAP_KEY}' key"), false))?;

        let connection_error = |reason: String| FederationError::Connection {
            cluster: cluster.to_string(),
            host: sanitize_host(&endpoint),
            reason,
        };
        let mut config = passthrough_config(&endpoint, ca.as_bytes(), token).map_err(|e| connection_error(e.to_string()))?;
        apply_connectivity(&mut config, &self.config.connectivity);
        let client = self
            .factory
            .workload_client(config)
            .map_err(|e| connection_error(e.to_string()))?;
        debug!(
            cluster,
            host = %sanitize_host(&endpoint),
            user_hash = %anonymize_email(&ctx.user.email),
            "Created SSO passthrough client"
        );
        Ok(Arc::new(ClusterClient::new(
            cluster,
            &endpoint,
            "sso-passthrough",
            client,
            PASSTHROUGH_QPS,
            PASSTHROUGH_BURST,
        )))
    }
}

/// Cache identity: e-mail plus sorted groups, hashed
fn identity_fingerprint(user: &UserInfo) -> String {
    let mut groups: Vec<&str> = user.groups.iter().map(String::as_str).collect();
    groups.sort_unstable();
    let mut hasher = Sha256::new();
    hasher.update(user.email.as_bytes());
    for group in groups {
        hasher.update([0u8]);
        hasher.update(group.as_bytes());
    }
    hex::encode(&hasher.finalize()[..16])
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::atomic::Ordering;

    use super::*;
    use crate::federation::discovery::tests::capi_cluster;
    use crate::federation::provider::tests::FakeFactory;
    use crate::federation::rest_config::tests::{ADMIN_KUBECONFIG, TEST_CA};
    use crate::federation::{CredentialMode, RequestContext};
    use crate::metrics::NoopMetrics;

    fn ctx(email: &str, token: Option<&str>) -> RequestContext {
        RequestContext {
            user: UserInfo {
                email: email.to_string(),
                groups: vec!["developers".to_string()],
                extra: BTreeMap::new(),
            },
            sso_token: token.map(str::to_string),
            trace_id: Some("4bf92f3577b34da6a3ce929d0e0e4736".to_string()),
        }
    }

    /// Management cluster with one workload cluster, its kubeconfig and CA
    fn seeded_factory() -> Arc<FakeFactory> {
        let factory = Arc::new(FakeFactory::default());
        for view in [&factory.user_view, &factory.privileged_view] {
            view.add_cluster(capi_cluster("prod-wc-01", "org-acme"));
            view.add_secret("org-acme", "prod-wc-01-kubeconfig", "value", ADMIN_KUBECONFIG.as_bytes());
            view.add_config_map("org-acme", "prod-wc-01-ca-public", "ca.crt", TEST_CA);
        }
        factory
    }

    fn config(mode: WorkloadAuthMode) -> FederationConfig {
        let mut config = FederationConfig {
            enabled: true,
            workload_auth_mode: mode,
            credential_mode: CredentialMode::FullPrivileged,
            ..FederationConfig::default()
        };
        config.group_mappings.insert("developers".to_string(), "wc-developers".to_string());
        config
    }

    fn manager(config: FederationConfig, factory: Arc<FakeFactory>) -> Arc<Manager> {
        Arc::new(Manager::new(config, factory, Arc::new(NoopMetrics)).unwrap())
    }

    fn header<'a>(config: &'a kube::Config, name: &str) -> Vec<&'a str> {
        config
            .headers
            .iter()
            .filter(|(n, _)| n.as_str() == name)
            .filter_map(|(_, v)| v.to_str().ok())
            .collect()
    }

    #[tokio::test]
    async fn concurrent_cold_requests_build_one_client() {
        // GIVEN: a cold cache
        let factory = seeded_factory();
        let m = manager(config(WorkloadAuthMode::Impersonation), factory.clone());
        let c = ctx("jane@example.com", None);

        // WHEN: two requests for the same cluster and identity race
        let (a, b) = tokio::join!(
            {
                let (m, c) = (m.clone(), c.clone());
                tokio::spawn(async move { m.client("prod-wc-01", &c).await })
            },
            {
                let (m, c) = (m.clone(), c.clone());
                tokio::spawn(async move { m.client("prod-wc-01", &c).await })
            },
        );
        let (a, b) = (a.unwrap().unwrap(), b.unwrap().unwrap());

        // THEN: one privileged secret read, one workload client, shared handle
        assert_eq!(factory.workload_clients.load(Ordering::SeqCst), 1);
        assert_eq!(factory.privileged_view.secret_reads.load(Ordering::SeqCst), 1);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.auth(), "impersonation");
    }

    #[tokio::test]
    async fn impersonation_client_names_the_caller() {
        let factory = seeded_factory();
        let m = manager(config(WorkloadAuthMode::Impersonation), factory.clone());

        let client = m.client("prod-wc-01", &ctx("jane@example.com", None)).await.unwrap();

        assert!(client.host().starts_with("https://api.prod-wc-01.example.com:6443"));
        let configs = factory.workload_configs.lock();
        let config = &configs[0];
        assert_eq!(header(config, "impersonate-user"), vec!["jane@example.com"]);
        assert_eq!(header(config, "impersonate-group"), vec!["wc-developers"]);
        assert_eq!(header(config, "impersonate-extra-agent"), vec!["mcp-kubernetes"]);
        assert_eq!(header(config, "impersonate-extra-mcp.giantswarm.io%2foriginal-groups"), vec!["developers"]);
        assert!(header(config, "impersonate-extra-trace-id").is_empty());
        assert_eq!(config.read_timeout, Some(Duration::from_secs(30)));
    }

    #[tokio::test]
    async fn identities_do_not_share_clients() {
        let factory = seeded_factory();
        let m = manager(config(WorkloadAuthMode::Impersonation), factory.clone());

        let a = m.client("prod-wc-01", &ctx("jane@example.com", None)).await.unwrap();
        let b = m.client("prod-wc-01", &ctx("bob@example.com", None)).await.unwrap();

        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(factory.workload_clients.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn passthrough_without_cache_builds_every_time() {
        // GIVEN: SSO passthrough with caching off
        let factory = seeded_factory();
        let mut cfg = config(WorkloadAuthMode::SsoPassthrough);
        cfg.cache.sso_passthrough_cache = false;
        let m = manager(cfg, factory.clone());
        let c = ctx("jane@example.com", Some("id-token"));

        // WHEN: the same identity asks twice in quick succession
        let a = m.client("prod-wc-01", &c).await.unwrap();
        let b = m.client("prod-wc-01", &c).await.unwrap();

        // THEN: two distinct clients carrying the caller's token
        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(factory.workload_clients.load(Ordering::SeqCst), 2);
        let configs = factory.workload_configs.lock();
        assert_eq!(header(&configs[1], "authorization"), vec!["Bearer id-token"]);
        assert!(header(&configs[1], "impersonate-user").is_empty());
        assert!(configs[1].cluster_url.to_string().starts_with("https://api.prod-wc-01.example.com:443"));
    }

    #[tokio::test]
    async fn passthrough_with_cache_reuses() {
        let factory = seeded_factory();
        let m = manager(config(WorkloadAuthMode::SsoPassthrough), factory.clone());
        let c = ctx("jane@example.com", Some("id-token"));

        let a = m.client("prod-wc-01", &c).await.unwrap();
        let b = m.client("prod-wc-01", &c).await.unwrap();

        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(factory.workload_clients.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn passthrough_requires_token() {
        let factory = seeded_factory();
        let m = manager(config(WorkloadAuthMode::SsoPassthrough), factory.clone());

        let err = m.client("prod-wc-01", &ctx("jane@example.com", None)).await.unwrap_err();

        assert!(matches!(err, FederationError::SsoTokenMissing));
        assert_eq!(factory.workload_clients.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn unknown_cluster_is_opaque() {
        let factory = seeded_factory();
        let m = manager(config(WorkloadAuthMode::Impersonation), factory);

        let err = m.client("prod-wc-99", &ctx("jane@example.com", None)).await.unwrap_err();

        assert!(matches!(err, FederationError::ClusterNotFound { .. }));
        assert_eq!(err.user_facing_message(), "cluster access denied or unavailable");
    }

    #[tokio::test]
    async fn missing_kubeconfig_secret() {
        let factory = Arc::new(FakeFactory::default());
        factory.privileged_view.add_cluster(capi_cluster("prod-wc-01", "org-acme"));
        let m = manager(config(WorkloadAuthMode::Impersonation), factory);

        let err = m.client("prod-wc-01", &ctx("jane@example.com", None)).await.unwrap_err();

        assert!(matches!(err, FederationError::Kubeconfig { not_found: true, resource: "secret", .. }));
    }

    #[tokio::test]
    async fn rejects_invalid_input_before_any_call() {
        let factory = seeded_factory();
        let m = manager(config(WorkloadAuthMode::Impersonation), factory.clone());

        let err = m.client("../etc", &ctx("jane@example.com", None)).await.unwrap_err();
        assert!(matches!(err, FederationError::Validation(_)));

        let err = m.client("prod-wc-01", &ctx("not-an-email", None)).await.unwrap_err();
        assert!(matches!(err, FederationError::Validation(_)));
        assert_eq!(factory.user_clients.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn empty_name_is_management_cluster() {
        let factory = seeded_factory();
        let m = manager(config(WorkloadAuthMode::Impersonation), factory.clone());
        let c = ctx("jane@example.com", Some("id-token"));

        let a = m.client("", &c).await.unwrap();
        let b = m.client("", &c).await.unwrap();

        assert_eq!(a.cluster(), "");
        assert_eq!(a.auth(), "user");
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(factory.user_clients.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn discovery_lists_and_summarizes() {
        let factory = seeded_factory();
        let m = manager(config(WorkloadAuthMode::Impersonation), factory.clone());
        let c = ctx("jane@example.com", None);

        let clusters = m.list_clusters(&c).await.unwrap();
        let summary = m.cluster_summary("prod-wc-01", &c).await.unwrap();

        assert_eq!(clusters.len(), 1);
        assert_eq!(summary.namespace, "org-acme");
        assert!(factory.privileged_view.list_calls.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn closed_manager_refuses_requests() {
        // GIVEN: a started manager with a cached client
        let factory = seeded_factory();
        let m = manager(config(WorkloadAuthMode::Impersonation), factory);
        m.start();
        let c = ctx("jane@example.com", None);
        m.client("prod-wc-01", &c).await.unwrap();
        assert_eq!(m.stats().cache.size, 2);

        // WHEN
        m.close().await;
        m.close().await;

        // THEN
        assert!(matches!(m.client("prod-wc-01", &c).await, Err(FederationError::ManagerClosed)));
        let stats = m.stats();
        assert!(stats.closed);
        assert_eq!(stats.cache.size, 0);
    }

    #[test]
    fn fingerprint_ignores_group_order() {
        let mut a = ctx("jane@example.com", None).user;
        a.groups = vec!["x".to_string(), "y".to_string()];
        let mut b = a.clone();
        b.groups.reverse();
        assert_eq!(identity_fingerprint(&a), identity_fingerprint(&b));
        b.groups.push("z".to_string());
        assert_ne!(identity_fingerprint(&a), identity_fingerprint(&b));
    }
}
