//! Hybrid credential provider
//!
//! Two paths to the management cluster:
//!
//! - **user**: the caller's own credentials (their upstream ID token, or
//!   impersonation when the session has none). RBAC applies as the caller.
//! - **privileged**: the server's service account, used only for kubeconfig
//!   secret reads and CAPI discovery when [`CredentialMode`] says so. Every
//!   use is rate-limited per user and metered.
//!
//! In strict mode a privileged failure is a hard error; otherwise the
//! request falls back to the user path.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::http::{HeaderValue, header};
use kube::config::{KubeConfigOptions, Kubeconfig};
use tokio::sync::OnceCell;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::error::FederationError;
use super::management::{KubeManagementApi, ManagementApi};
use super::rest_config::{Impersonation, apply_connectivity, apply_impersonation};
use super::validation::{UserInfo, anonymize_email, email_domain};
use super::{CredentialMode, RequestContext};
use crate::config::{ConnectivityConfig, FederationConfig, PrivilegedAccessConfig};
use crate::failsafe::{KeyedRateLimiter, RetryPolicy};
use crate::metrics::{PrivilegedAccessMetrics, PrivilegedOutcome};

/// Metric/audit label for kubeconfig secret reads
pub const OP_SECRET_ACCESS: &str = "secret_access";
/// Metric/audit label for CAPI discovery
pub const OP_CAPI_DISCOVERY: &str = "capi_discovery";

/// Constructs Kubernetes clients for each credential path
#[async_trait]
pub trait ClientFactory: Send + Sync {
    /// Management-cluster client acting as the caller
    fn user_client(&self, ctx: &RequestContext) -> Result<kube::Client, FederationError>;

    /// Management-cluster client acting as the service account
    async fn privileged_client(&self) -> Result<kube::Client, FederationError>;

    /// Client for a prepared workload-cluster config
    fn workload_client(&self, config: kube::Config) -> Result<kube::Client, FederationError>;

    /// Management reads through `client`
    fn management_api(&self, client: kube::Client) -> Arc<dyn ManagementApi>;
}

/// [`ClientFactory`] backed by real API servers
pub struct KubeClientFactory {
    management: kube::Config,
    service_account: OnceCell<kube::Client>,
    connectivity: ConnectivityConfig,
    retry: RetryPolicy,
}

impl KubeClientFactory {
    /// Management config from `federation.kubeconfig`, or inferred
    /// (in-cluster service account, then `~/.kube/config`)
    pub async fn from_config(config: &FederationConfig) -> Result<Self, FederationError> {
        let management = match &config.kubeconfig {
            Some(path) => {
                let kubeconfig = Kubeconfig::read_from(path).map_err(|e| FederationError::Kube(e.to_string()))?;
                kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                    .await
                    .map_err(|e| FederationError::Kube(e.to_string()))?
            }
            None => kube::Config::infer().await.map_err(|e| FederationError::Kube(e.to_string()))?,
        };
        info!(
            source = if config.kubeconfig.is_some() { "kubeconfig" } else { "inferred" },
            "Management cluster configuration loaded"
        );
        Ok(Self::new(management, config.connectivity.clone()))
    }

    /// Factory over an explicit management config
    #[must_use]
    pub fn new(management: kube::Config, connectivity: ConnectivityConfig) -> Self {
        Self {
            retry: RetryPolicy::from_connectivity(&connectivity),
            management,
            service_account: OnceCell::new(),
            connectivity,
        }
    }
}

#[async_trait]
impl ClientFactory for KubeClientFactory {
    fn user_client(&self, ctx: &RequestContext) -> Result<kube::Client, FederationError> {
        let mut config = self.management.clone();
        apply_connectivity(&mut config, &self.connectivity);
        match ctx.sso_token.as_deref().filter(|t| !t.is_empty()) {
            Some(token) => {
                config.auth_info = kube::config::AuthInfo::default();
                let bearer = HeaderValue::from_str(&format!("Bearer {token}"))
                    .map_err(|_| FederationError::Kube("upstream token is not a valid header value".to_string()))?;
                config.headers.push((header::AUTHORIZATION, bearer));
            }
            None => {
                apply_impersonation(&mut config, &Impersonation::for_user(&ctx.user, None, None)).map_err(|e| {
                    FederationError::Impersonation {
                        cluster: String::new(),
                        user_hash: anonymize_email(&ctx.user.email),
                        reason: e.to_string(),
                    }
                })?;
            }
        }
        kube::Client::try_from(config).map_err(FederationError::from)
    }

    async fn privileged_client(&self) -> Result<kube::Client, FederationError> {
        self.service_account
            .get_or_try_init(|| async {
                debug!("Initializing service account client for privileged access");
                let mut config = self.management.clone();
                apply_connectivity(&mut config, &self.connectivity);
                let client = kube::Client::try_from(config).map_err(FederationError::from)?;
                info!("Service account client initialized for privileged access");
                Ok::<_, FederationError>(client)
            })
            .await
            .cloned()
    }

    fn workload_client(&self, config: kube::Config) -> Result<kube::Client, FederationError> {
        kube::Client::try_from(config).map_err(FederationError::from)
    }

    fn management_api(&self, client: kube::Client) -> Arc<dyn ManagementApi> {
        Arc::new(KubeManagementApi::new(client, self.retry))
    }
}

/// Routes management reads between the user and privileged paths
pub struct HybridProvider {
    factory: Arc<dyn ClientFactory>,
    mode: CredentialMode,
    strict: bool,
    capi_discovery: bool,
    limiter: Arc<KeyedRateLimiter>,
    cleanup_interval: Duration,
    metrics: Arc<dyn PrivilegedAccessMetrics>,
}

impl HybridProvider {
    /// Build a provider
    pub fn new(
        factory: Arc<dyn ClientFactory>,
        mode: CredentialMode,
        config: &PrivilegedAccessConfig,
        metrics: Arc<dyn PrivilegedAccessMetrics>,
    ) -> Self {
        Self {
            factory,
            mode,
            strict: config.strict,
            capi_discovery: config.capi_discovery,
            limiter: Arc::new(KeyedRateLimiter::new(
                config.rate_limit_per_second,
                config.rate_limit_burst,
                config.limiter_expiry,
            )),
            cleanup_interval: config.cleanup_interval,
            metrics,
        }
    }

    /// Configured credential mode
    #[must_use]
    pub fn mode(&self) -> CredentialMode {
        self.mode
    }

    /// Whether privileged failures are fatal
    #[must_use]
    pub fn is_strict(&self) -> bool {
        self.strict
    }

    /// Drop idle per-user limiters periodically
    pub fn spawn_limiter_cleanup(&self, shutdown: CancellationToken) -> JoinHandle<()> {
        self.limiter.spawn_cleanup(self.cleanup_interval, shutdown)
    }

    /// API for reading kubeconfig secrets on behalf of `user`
    pub async fn secret_api(
        &self,
        user: &UserInfo,
        user_client: &kube::Client,
    ) -> Result<Arc<dyn ManagementApi>, FederationError> {
        self.route(user, user_client, OP_SECRET_ACCESS, self.mode.privileged_secrets())
            .await
    }

    /// API for listing CAPI clusters on behalf of `user`
    pub async fn discovery_api(
        &self,
        user: &UserInfo,
        user_client: &kube::Client,
    ) -> Result<Arc<dyn ManagementApi>, FederationError> {
        let privileged = self.mode.privileged_discovery() && self.capi_discovery;
        self.route(user, user_client, OP_CAPI_DISCOVERY, privileged).await
    }

    async fn route(
        &self,
        user: &UserInfo,
        user_client: &kube::Client,
        operation: &'static str,
        privileged: bool,
    ) -> Result<Arc<dyn ManagementApi>, FederationError> {
        let user_hash = anonymize_email(&user.email);
        if !privileged {
            debug!(user_hash = %user_hash, operation, "Using user credentials");
            return Ok(self.factory.management_api(user_client.clone()));
        }

        match self.privileged(user, &user_hash, operation).await {
            Ok(api) => Ok(api),
            Err(FederationError::RateLimited) => Err(FederationError::RateLimited),
            Err(e) if self.strict => {
                error!(user_hash = %user_hash, operation, error = %e, "Privileged access failed in strict mode");
                Err(FederationError::StrictPrivilegedAccessRequired(e.to_string()))
            }
            Err(e) => {
                warn!(
                    user_hash = %user_hash,
                    operation,
                    error = %e,
                    "Privileged access failed, falling back to user credentials"
                );
                self.record(user, operation, PrivilegedOutcome::Fallback);
                Ok(self.factory.management_api(user_client.clone()))
            }
        }
    }

    async fn privileged(
        &self,
        user: &UserInfo,
        user_hash: &str,
        operation: &'static str,
    ) -> Result<Arc<dyn ManagementApi>, FederationError> {
        if !self.limiter.check(user_hash) {
            warn!(user_hash = %user_hash, operation, "Privileged access rate limited");
            self.record(user, operation, PrivilegedOutcome::RateLimited);
            return Err(FederationError::RateLimited);
        }
        match self.factory.privileged_client().await {
            Ok(client) => {
                debug!(user_hash = %user_hash, operation, "Privileged access initiated");
                self.record(user, operation, PrivilegedOutcome::Success);
                Ok(self.factory.management_api(client))
            }
            Err(e) => {
                self.record(user, operation, PrivilegedOutcome::Error);
                Err(e)
            }
        }
    }

    fn record(&self, user: &UserInfo, operation: &str, outcome: PrivilegedOutcome) {
        self.metrics
            .record_privileged(email_domain(&user.email), operation, outcome);
    }
}
