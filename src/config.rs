//! Configuration management

use std::{collections::BTreeMap, env, path::Path, path::PathBuf, time::Duration};

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::federation::{CredentialMode, WorkloadAuthMode};
use crate::oauth::encryption::EncryptionKey;
use crate::{Error, Result};

/// Environment variable prefix for config overrides (`MCP_KUBERNETES_OAUTH__BASE_URL`).
pub const ENV_PREFIX: &str = "MCP_KUBERNETES_";

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// HTTP server configuration
    pub server: ServerConfig,
    /// OAuth 2.1 authorization server configuration
    pub oauth: OAuthConfig,
    /// Multi-cluster federation configuration
    pub federation: FederationConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from file and environment
    ///
    /// # Errors
    ///
    /// Returns an error if the config file does not exist or cannot be parsed.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        figment = figment.merge(Env::prefixed(ENV_PREFIX).split("__"));

        let mut config: Self = figment
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;

        config.expand_env_vars();

        Ok(config)
    }

    /// Expand `${VAR}` and `${VAR:-default}` in secret-bearing fields
    fn expand_env_vars(&mut self) {
        let Ok(re) = Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)(?::-([^}]*))?\}") else {
            return;
        };

        let oauth = &mut self.oauth;
        oauth.provider.client_secret = Self::expand_string(&re, &oauth.provider.client_secret);
        oauth.provider.client_id = Self::expand_string(&re, &oauth.provider.client_id);
        for secret in [
            &mut oauth.encryption_key,
            &mut oauth.registration_token,
            &mut oauth.storage.valkey.password,
        ]
        .into_iter()
        .flatten()
        {
            *secret = Self::expand_string(&re, secret);
        }
    }

    fn expand_string(re: &Regex, value: &str) -> String {
        re.replace_all(value, |caps: &regex::Captures| {
            let var_name = &caps[1];
            let default = caps.get(2).map_or("", |m| m.as_str());
            env::var(var_name).unwrap_or_else(|_| default.to_string())
        })
        .into_owned()
    }

    /// Check cross-field constraints. Called once at startup; any error is fatal.
    ///
    /// Returns the list of non-fatal warnings (degraded security, risky TTLs)
    /// so the caller can log them after tracing is initialised.
    pub fn validate(&self) -> Result<Vec<String>> {
        let mut warnings = Vec::new();

        self.server.validate()?;
        if self.oauth.enabled {
            self.oauth.validate(&mut warnings)?;
        }
        self.federation.validate(&self.oauth, &mut warnings)?;

        Ok(warnings)
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default level when `RUST_LOG` is unset
    pub level: String,
    /// `text` or `json`
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
        }
    }
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,
    /// Port to listen on
    pub port: u16,
    /// Time allowed for reading request headers
    #[serde(with = "humantime_serde")]
    pub read_header_timeout: Duration,
    /// Time allowed for writing a response
    #[serde(with = "humantime_serde")]
    pub write_timeout: Duration,
    /// Keep-alive idle timeout
    #[serde(with = "humantime_serde")]
    pub idle_timeout: Duration,
    /// Graceful shutdown timeout
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,
    /// Maximum request body size (bytes)
    pub max_body_size: usize,
    /// Browser origins allowed by CORS (`scheme://host[:port]`); empty disables CORS
    pub allowed_origins: Vec<String>,
    /// Send `Strict-Transport-Security` (enable behind a TLS-terminating proxy)
    pub hsts: bool,
}

impl ServerConfig {
    fn validate(&self) -> Result<()> {
        for origin in &self.allowed_origins {
            normalize_origin(origin)?;
        }
        Ok(())
    }
}

/// Reduce an allowed CORS origin to `scheme://host[:port]`, rejecting paths,
/// non-HTTP schemes and bare hosts.
pub fn normalize_origin(origin: &str) -> Result<String> {
    let invalid = |reason: &str| Error::Config(format!("server.allowed_origins: {origin:?} {reason}"));
    let url = url::Url::parse(origin.trim()).map_err(|e| invalid(&e.to_string()))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(invalid("must use http or https"));
    }
    let Some(host) = url.host_str() else {
        return Err(invalid("must include a host"));
    };
    if url.path() != "/" || url.query().is_some() || url.fragment().is_some() {
        return Err(invalid("must not include a path"));
    }
    Ok(match url.port() {
        Some(port) => format!("{}://{host}:{port}", url.scheme()),
        None => format!("{}://{host}", url.scheme()),
    })
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            read_header_timeout: Duration::from_secs(10),
            write_timeout: Duration::from_secs(120),
            idle_timeout: Duration::from_secs(120),
            shutdown_timeout: Duration::from_secs(30),
            max_body_size: 1024 * 1024,
            allowed_origins: Vec::new(),
            hsts: false,
        }
    }
}

/// OAuth 2.1 authorization server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OAuthConfig {
    /// Enable the authorization server and bearer protection of `/mcp`
    pub enabled: bool,
    /// Public base URL of this server (issuer and resource identifier)
    pub base_url: String,
    /// Upstream identity provider
    pub provider: ProviderConfig,
    /// Base64-encoded 32-byte AES-256-GCM key for tokens at rest
    pub encryption_key: Option<String>,
    /// Bearer token that authorizes dynamic client registration
    pub registration_token: Option<String>,
    /// Allow unauthenticated dynamic client registration
    pub allow_public_registration: bool,
    /// Custom URI schemes that may register without a registration token
    pub trusted_public_registration_schemes: Vec<String>,
    /// Accept authorization requests without `state` (logged as a weakening)
    pub allow_insecure_auth_without_state: bool,
    /// Reverse proxies (IP or CIDR) whose `X-Forwarded-For` / `X-Real-IP`
    /// headers are honored. Empty: the socket peer is the client address.
    pub trusted_proxies: Vec<String>,
    /// Maximum registration attempts per source IP within `registration_window`
    pub max_clients_per_ip: usize,
    /// Window the per-IP registration cap applies to
    #[serde(with = "humantime_serde")]
    pub registration_window: Duration,
    /// Access token lifetime
    #[serde(with = "humantime_serde")]
    pub access_token_ttl: Duration,
    /// Refresh token lifetime
    #[serde(with = "humantime_serde")]
    pub refresh_token_ttl: Duration,
    /// Authorization code lifetime
    #[serde(with = "humantime_serde")]
    pub code_ttl: Duration,
    /// Redirect URI security policy
    pub redirect: RedirectSecurityConfig,
    /// Client ID Metadata Document resolution
    pub cimd: CimdConfig,
    /// Credential store backend
    pub storage: StorageConfig,
    /// SSO token trust for upstream aggregators
    pub sso: SsoConfig,
    /// Per-IP and per-user rate limits
    pub rate_limit: RateLimitConfig,
}

impl Default for OAuthConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            base_url: String::new(),
            provider: ProviderConfig::default(),
            encryption_key: None,
            registration_token: None,
            allow_public_registration: false,
            trusted_public_registration_schemes: Vec::new(),
            allow_insecure_auth_without_state: false,
            trusted_proxies: Vec::new(),
            max_clients_per_ip: 10,
            registration_window: Duration::from_secs(3600),
            access_token_ttl: Duration::from_secs(3600),
            refresh_token_ttl: Duration::from_secs(90 * 24 * 3600),
            code_ttl: Duration::from_secs(600),
            redirect: RedirectSecurityConfig::default(),
            cimd: CimdConfig::default(),
            storage: StorageConfig::default(),
            sso: SsoConfig::default(),
            rate_limit: RateLimitConfig::default(),
        }
    }
}

/// Schemes that may never be trusted for public registration.
const FORBIDDEN_TRUSTED_SCHEMES: &[&str] = &["http", "https", "javascript", "data", "file", "vbscript"];

impl OAuthConfig {
    fn validate(&self, warnings: &mut Vec<String>) -> Result<()> {
        validate_base_url(&self.base_url)?;

        if self.provider.client_id.trim().is_empty() || self.provider.client_secret.trim().is_empty() {
            return Err(Error::Config(
                "oauth.provider.client_id and oauth.provider.client_secret are required".to_string(),
            ));
        }
        if self.provider.kind == IdentityProviderKind::Dex && self.provider.issuer_url.is_empty() {
            return Err(Error::Config(
                "oauth.provider.issuer_url is required for the dex provider".to_string(),
            ));
        }

        for proxy in &self.trusted_proxies {
            parse_trusted_proxy(proxy)?;
        }

        match &self.encryption_key {
            Some(key) => {
                EncryptionKey::from_base64(key).map_err(|e| Error::Config(format!("oauth.encryption_key: {e}")))?;
            }
            None => warnings.push(
                "oauth.encryption_key is not set: tokens are stored UNENCRYPTED (degraded security mode)".to_string(),
            ),
        }

        if self.storage.backend == StorageBackend::Valkey && self.storage.valkey.url.is_empty() {
            return Err(Error::Config("oauth.storage.valkey.url is required for the valkey backend".to_string()));
        }

        let scheme_re = Regex::new(r"^[a-z][a-z0-9+.\-]*$").map_err(|e| Error::Internal(e.to_string()))?;
        for scheme in &self.trusted_public_registration_schemes {
            let lower = scheme.to_ascii_lowercase();
            if !scheme_re.is_match(&lower) || FORBIDDEN_TRUSTED_SCHEMES.contains(&lower.as_str()) {
                return Err(Error::Config(format!(
                    "oauth.trusted_public_registration_schemes: '{scheme}' cannot be trusted"
                )));
            }
        }

        if self.allow_public_registration {
            warnings.push("oauth.allow_public_registration is enabled: any caller may register clients".to_string());
        }
        if self.allow_insecure_auth_without_state {
            warnings.push("oauth.allow_insecure_auth_without_state is enabled: CSRF protection is weakened".to_string());
        }
        if !self.redirect.production_mode {
            warnings.push("oauth.redirect.production_mode is disabled: plain HTTP redirect URIs are accepted".to_string());
        }
        if self.cimd.allow_private_ips {
            warnings.push("oauth.cimd.allow_private_ips is enabled: metadata may be fetched from internal networks".to_string());
        }
        Ok(())
    }
}

/// Parse a trusted proxy entry: a bare address or a CIDR block.
pub fn parse_trusted_proxy(raw: &str) -> Result<ipnet::IpNet> {
    let raw = raw.trim();
    raw.parse::<ipnet::IpNet>()
        .or_else(|_| raw.parse::<std::net::IpAddr>().map(ipnet::IpNet::from))
        .map_err(|_| Error::Config(format!("oauth.trusted_proxies entry '{raw}' is not an IP address or CIDR")))
}

/// Reject a base URL that is not HTTPS, except for loopback development hosts.
pub fn validate_base_url(base_url: &str) -> Result<()> {
    let parsed = url::Url::parse(base_url)
        .map_err(|e| Error::Config(format!("oauth.base_url '{base_url}' is invalid: {e}")))?;
    match parsed.scheme() {
        "https" => Ok(()),
        "http" => {
            let host = parsed.host_str().unwrap_or_default();
            if matches!(host, "localhost" | "127.0.0.1" | "[::1]" | "::1") {
                Ok(())
            } else {
                Err(Error::Config(format!(
                    "oauth.base_url must use https (http is only allowed for localhost), got '{base_url}'"
                )))
            }
        }
        other => Err(Error::Config(format!("oauth.base_url has unsupported scheme '{other}'"))),
    }
}

/// Upstream identity provider selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum IdentityProviderKind {
    /// Dex (OIDC, connector-aware)
    #[default]
    Dex,
    /// Google accounts
    Google,
}

/// Upstream identity provider credentials
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ProviderConfig {
    /// Provider kind
    pub kind: IdentityProviderKind,
    /// OAuth client ID registered with the provider
    pub client_id: String,
    /// OAuth client secret
    pub client_secret: String,
    /// Issuer URL (required for Dex)
    pub issuer_url: String,
    /// Dex connector to preselect (`connector_id` query parameter)
    pub connector_id: Option<String>,
    /// Extra CA bundle (PEM) for a Dex issuer behind a private CA
    pub ca_file: Option<PathBuf>,
}

/// Redirect URI security toggles
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedirectSecurityConfig {
    /// When disabled, plain HTTP redirect URIs are accepted for any host
    pub production_mode: bool,
    /// Allow `localhost` and loopback addresses (HTTP allowed for loopback)
    pub allow_localhost: bool,
    /// Allow RFC 1918 / ULA addresses
    pub allow_private_ips: bool,
    /// Allow link-local addresses (169.254.0.0/16, fe80::/10)
    pub allow_link_local: bool,
    /// Resolve hostnames and check every resolved address
    pub dns_validation: bool,
    /// Accept a redirect URI whose hostname fails to resolve at registration time
    pub dns_fail_open_at_registration: bool,
    /// DNS resolution timeout
    #[serde(with = "humantime_serde")]
    pub dns_timeout: Duration,
    /// Allow a client to mix trusted custom schemes with HTTPS redirect URIs
    pub allow_mixed_scheme_redirects: bool,
}

impl Default for RedirectSecurityConfig {
    fn default() -> Self {
        Self {
            production_mode: true,
            allow_localhost: true,
            allow_private_ips: false,
            allow_link_local: false,
            dns_validation: true,
            dns_fail_open_at_registration: false,
            dns_timeout: Duration::from_secs(2),
            allow_mixed_scheme_redirects: false,
        }
    }
}

/// Client ID Metadata Document configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CimdConfig {
    /// Accept HTTPS URLs as client identifiers
    pub enabled: bool,
    /// Allow metadata documents hosted on private addresses
    pub allow_private_ips: bool,
    /// Fetch timeout
    #[serde(with = "humantime_serde")]
    pub fetch_timeout: Duration,
    /// How long a fetched document is cached
    #[serde(with = "humantime_serde")]
    pub cache_ttl: Duration,
    /// How long a failed fetch is cached
    #[serde(with = "humantime_serde")]
    pub negative_cache_ttl: Duration,
    /// Maximum document size in bytes
    pub max_document_bytes: usize,
}

impl Default for CimdConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            allow_private_ips: false,
            fetch_timeout: Duration::from_secs(5),
            cache_ttl: Duration::from_secs(300),
            negative_cache_ttl: Duration::from_secs(60),
            max_document_bytes: 64 * 1024,
        }
    }
}

/// Credential store backend selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// Process-local map
    #[default]
    Memory,
    /// Valkey / Redis
    Valkey,
}

/// Credential store configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct StorageConfig {
    /// Backend
    pub backend: StorageBackend,
    /// Valkey connection parameters
    pub valkey: ValkeyConfig,
}

/// Valkey connection parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ValkeyConfig {
    /// Address, `host:port` or `redis://host:port`
    pub url: String,
    /// Optional password
    pub password: Option<String>,
    /// Connect over TLS
    pub tls: bool,
    /// Prefix for every key written
    pub key_prefix: String,
    /// Logical database index
    pub db: i64,
    /// Operation timeout
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for ValkeyConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            password: None,
            tls: false,
            key_prefix: "mcp:".to_string(),
            db: 0,
            timeout: Duration::from_secs(5),
        }
    }
}

/// SSO token trust configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SsoConfig {
    /// Audiences whose upstream-issued ID tokens are accepted as bearer tokens
    pub trusted_audiences: Vec<String>,
    /// Allow the identity provider's discovery and JWKS endpoints to resolve to private addresses
    pub allow_private_ips: bool,
    /// How long a fetched JWKS is reused
    #[serde(with = "humantime_serde")]
    pub jwks_cache_ttl: Duration,
    /// Timeout for discovery and JWKS fetches
    #[serde(with = "humantime_serde")]
    pub fetch_timeout: Duration,
}

impl Default for SsoConfig {
    fn default() -> Self {
        Self {
            trusted_audiences: Vec::new(),
            allow_private_ips: false,
            jwks_cache_ttl: Duration::from_secs(3600),
            fetch_timeout: Duration::from_secs(10),
        }
    }
}

/// Rate limits for OAuth endpoints and authenticated requests
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Enable rate limiting
    pub enabled: bool,
    /// Requests per second per source IP
    pub ip_requests_per_second: u32,
    /// Burst per source IP
    pub ip_burst: u32,
    /// Requests per second per authenticated user
    pub user_requests_per_second: u32,
    /// Burst per authenticated user
    pub user_burst: u32,
    /// How often idle limiters are dropped
    #[serde(with = "humantime_serde")]
    pub cleanup_interval: Duration,
    /// Idle time after which a limiter is dropped
    #[serde(with = "humantime_serde")]
    pub idle_expiry: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ip_requests_per_second: 10,
            ip_burst: 20,
            user_requests_per_second: 100,
            user_burst: 200,
            cleanup_interval: Duration::from_secs(300),
            idle_expiry: Duration::from_secs(600),
        }
    }
}

/// Multi-cluster federation configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FederationConfig {
    /// Enable workload-cluster access through CAPI
    pub enabled: bool,
    /// How workload clusters authenticate the caller
    pub workload_auth_mode: WorkloadAuthMode,
    /// Which identity reads kubeconfig secrets and discovers clusters
    pub credential_mode: CredentialMode,
    /// Management cluster kubeconfig; in-cluster service account when unset
    pub kubeconfig: Option<PathBuf>,
    /// Suffix of the ConfigMap that carries a workload cluster CA
    pub ca_config_map_suffix: String,
    /// Group rewrite applied before impersonation
    pub group_mappings: BTreeMap<String, String>,
    /// Client cache
    pub cache: FederationCacheConfig,
    /// Connectivity to workload clusters
    pub connectivity: ConnectivityConfig,
    /// Privileged (service account) path
    pub privileged: PrivilegedAccessConfig,
}

impl Default for FederationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            workload_auth_mode: WorkloadAuthMode::default(),
            credential_mode: CredentialMode::default(),
            kubeconfig: None,
            ca_config_map_suffix: "-ca-public".to_string(),
            group_mappings: BTreeMap::new(),
            cache: FederationCacheConfig::default(),
            connectivity: ConnectivityConfig::default(),
            privileged: PrivilegedAccessConfig::default(),
        }
    }
}

impl FederationConfig {
    fn validate(&self, oauth: &OAuthConfig, warnings: &mut Vec<String>) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        if self.cache.max_entries == 0 {
            return Err(Error::Config("federation.cache.max_entries must be greater than zero".to_string()));
        }
        if self.cache.ttl.is_zero() || self.cache.cleanup_interval.is_zero() {
            return Err(Error::Config("federation.cache.ttl and cleanup_interval must be non-zero".to_string()));
        }
        if self.workload_auth_mode == WorkloadAuthMode::SsoPassthrough && !oauth.enabled {
            return Err(Error::Config(
                "federation.workload_auth_mode=sso-passthrough requires oauth.enabled".to_string(),
            ));
        }
        crate::federation::GroupMapper::new(self.group_mappings.clone())
            .map_err(|e| Error::Config(format!("federation.group_mappings: {e}")))?;

        if oauth.enabled && self.cache.ttl > oauth.access_token_ttl {
            let mut msg = format!(
                "federation.cache.ttl ({}s) exceeds the access token lifetime ({}s): cached clients may outlive the identity they were built for",
                self.cache.ttl.as_secs(),
                oauth.access_token_ttl.as_secs()
            );
            if self.workload_auth_mode == WorkloadAuthMode::SsoPassthrough && self.cache.sso_passthrough_cache {
                msg.push_str("; in sso-passthrough mode set federation.cache.sso_passthrough_cache=false to disable caching");
            }
            warnings.push(msg);
        }
        if !self.privileged.strict && self.credential_mode != CredentialMode::User {
            warnings.push("federation.privileged.strict is disabled: privileged failures fall back to user credentials".to_string());
        }
        Ok(())
    }
}

/// Federated client cache settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FederationCacheConfig {
    /// Entry lifetime
    #[serde(with = "humantime_serde")]
    pub ttl: Duration,
    /// Maximum cached clients
    pub max_entries: usize,
    /// Sweep interval for expired entries
    #[serde(with = "humantime_serde")]
    pub cleanup_interval: Duration,
    /// Cache SSO passthrough clients (delays the effect of token revocation)
    pub sso_passthrough_cache: bool,
}

impl Default for FederationCacheConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(600),
            max_entries: 1000,
            cleanup_interval: Duration::from_secs(60),
            sso_passthrough_cache: true,
        }
    }
}

/// Workload cluster connectivity
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectivityConfig {
    /// TCP/TLS connect timeout
    #[serde(with = "humantime_serde")]
    pub connection_timeout: Duration,
    /// Per-request timeout
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
    /// Attempts for idempotent management-cluster reads
    pub retry_attempts: usize,
    /// Initial backoff between attempts
    #[serde(with = "humantime_serde")]
    pub retry_backoff: Duration,
    /// Client-side request rate per workload client
    pub qps: u32,
    /// Client-side burst per workload client
    pub burst: u32,
}

impl Default for ConnectivityConfig {
    fn default() -> Self {
        Self {
            connection_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(30),
            retry_attempts: 3,
            retry_backoff: Duration::from_secs(1),
            qps: 50,
            burst: 100,
        }
    }
}

/// Privileged service-account path settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PrivilegedAccessConfig {
    /// Hard-fail instead of falling back to user credentials
    pub strict: bool,
    /// Use the service account for CAPI discovery in full-privileged mode
    pub capi_discovery: bool,
    /// Privileged requests per second per user
    pub rate_limit_per_second: u32,
    /// Privileged burst per user
    pub rate_limit_burst: u32,
    /// How often idle per-user limiters are dropped
    #[serde(with = "humantime_serde")]
    pub cleanup_interval: Duration,
    /// Idle time after which a per-user limiter is dropped
    #[serde(with = "humantime_serde")]
    pub limiter_expiry: Duration,
}

impl Default for PrivilegedAccessConfig {
    fn default() -> Self {
        Self {
            strict: true,
            capi_discovery: true,
            rate_limit_per_second: 10,
            rate_limit_burst: 20,
            cleanup_interval: Duration::from_secs(300),
            limiter_expiry: Duration::from_secs(600),
        }
    }
}

/// Custom humantime serde module for Duration
pub mod humantime_serde {
    use std::time::Duration;

    use serde::{self, Deserialize, Deserializer, Serializer};

    /// Serialize Duration to human-readable string (e.g., "30s")
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the serializer fails.
    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if duration.subsec_millis() != 0 {
            serializer.serialize_str(&format!("{}ms", duration.as_millis()))
        } else {
            serializer.serialize_str(&format!("{}s", duration.as_secs()))
        }
    }

    /// Deserialize human-readable duration string ("100ms", "30s", "5m", "2h", "90d")
    ///
    /// # Errors
    ///
    /// Returns a deserialization error if the string cannot be parsed as a duration.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse(&s).map_err(serde::de::Error::custom)
    }

    /// Parse a duration string; a bare number is seconds.
    pub fn parse(s: &str) -> Result<Duration, std::num::ParseIntError> {
        let s = s.trim();
        if let Some(ms) = s.strip_suffix("ms") {
            ms.parse::<u64>().map(Duration::from_millis)
        } else if let Some(secs) = s.strip_suffix('s') {
            secs.parse::<u64>().map(Duration::from_secs)
        } else if let Some(mins) = s.strip_suffix('m') {
            mins.parse::<u64>().map(|m| Duration::from_secs(m * 60))
        } else if let Some(hours) = s.strip_suffix('h') {
            hours.parse::<u64>().map(|h| Duration::from_secs(h * 3600))
        } else if let Some(days) = s.strip_suffix('d') {
            days.parse::<u64>().map(|d| Duration::from_secs(d * 86_400))
        } else {
            s.parse::<u64>().map(Duration::from_secs)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn oauth_enabled() -> Config {
        let mut config = Config::default();
        config.oauth.enabled = true;
        config.oauth.base_url = "https://mcp.example.com".to_string();
        config.oauth.provider.client_id = "mcp".to_string();
        config.oauth.provider.client_secret = "s3cret".to_string();
        config.oauth.provider.issuer_url = "https://dex.example.com".to_string();
        config
    }

    #[test]
    fn defaults_match_documented_values() {
        let config = Config::default();
        assert_eq!(config.oauth.max_clients_per_ip, 10);
        assert_eq!(config.oauth.refresh_token_ttl, Duration::from_secs(90 * 86_400));
        assert_eq!(config.oauth.rate_limit.ip_requests_per_second, 10);
        assert_eq!(config.oauth.rate_limit.ip_burst, 20);
        assert_eq!(config.oauth.storage.valkey.key_prefix, "mcp:");
        assert_eq!(config.federation.cache.max_entries, 1000);
        assert_eq!(config.federation.cache.ttl, Duration::from_secs(600));
        assert_eq!(config.federation.connectivity.qps, 50);
        assert!(config.federation.privileged.strict);
        assert_eq!(config.server.shutdown_timeout, Duration::from_secs(30));
    }

    #[test]
    fn humantime_parses_all_units() {
        assert_eq!(humantime_serde::parse("100ms").unwrap(), Duration::from_millis(100));
        assert_eq!(humantime_serde::parse("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(humantime_serde::parse("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(humantime_serde::parse("2h").unwrap(), Duration::from_secs(7200));
        assert_eq!(humantime_serde::parse("90d").unwrap(), Duration::from_secs(90 * 86_400));
        assert_eq!(humantime_serde::parse("42").unwrap(), Duration::from_secs(42));
        assert!(humantime_serde::parse("soon").is_err());
    }

    #[test]
    fn origins_are_normalized_and_checked() {
        assert_eq!(normalize_origin("https://app.example.com/").unwrap(), "https://app.example.com");
        assert_eq!(normalize_origin(" http://localhost:6274 ").unwrap(), "http://localhost:6274");
        assert!(normalize_origin("https://app.example.com/callback").is_err());
        assert!(normalize_origin("ftp://files.example.com").is_err());
        assert!(normalize_origin("app.example.com").is_err());

        let mut config = Config::default();
        config.server.allowed_origins = vec!["chrome-extension://abc".to_string()];
        assert!(config.validate().is_err());
    }

    #[test]
    fn trusted_proxies_accept_addresses_and_cidrs() {
        let block = parse_trusted_proxy("10.0.0.0/8").unwrap();
        assert!(block.contains(&"10.1.2.3".parse::<std::net::IpAddr>().unwrap()));
        let single = parse_trusted_proxy("192.0.2.10").unwrap();
        assert_eq!(single.prefix_len(), 32);
        assert!(parse_trusted_proxy("proxy.internal").is_err());

        let mut config = oauth_enabled();
        config.oauth.trusted_proxies = vec!["10.0.0.0/33".to_string()];
        assert!(config.validate().is_err());
    }

    #[test]
    fn load_reads_yaml_file() {
        // GIVEN: a config file with OAuth and federation sections
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
server:
  port: 9090
oauth:
  enabled: true
  base_url: "https://mcp.example.com"
  provider:
    kind: google
    client_id: abc
    client_secret: def
  storage:
    backend: valkey
    valkey:
      url: "valkey:6379"
      db: 2
federation:
  enabled: true
  workload_auth_mode: sso-passthrough
  credential_mode: privileged-secrets-only
  cache:
    ttl: 5m
"#
        )
        .unwrap();

        // WHEN: loaded
        let config = Config::load(Some(file.path())).unwrap();

        // THEN: values are applied on top of defaults
        assert_eq!(config.server.port, 9090);
        assert_eq!(config.oauth.provider.kind, IdentityProviderKind::Google);
        assert_eq!(config.oauth.storage.backend, StorageBackend::Valkey);
        assert_eq!(config.oauth.storage.valkey.db, 2);
        assert_eq!(config.oauth.storage.valkey.key_prefix, "mcp:");
        assert_eq!(config.federation.workload_auth_mode, WorkloadAuthMode::SsoPassthrough);
        assert_eq!(config.federation.credential_mode, CredentialMode::PrivilegedSecretsOnly);
        assert_eq!(config.federation.cache.ttl, Duration::from_secs(300));
        assert_eq!(config.federation.cache.max_entries, 1000);
    }

    #[test]
    fn load_rejects_missing_file() {
        let result = Config::load(Some(Path::new("/nonexistent/mcp-kubernetes.yaml")));
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn base_url_requires_https_except_loopback() {
        assert!(validate_base_url("https://mcp.example.com").is_ok());
        assert!(validate_base_url("http://localhost:8080").is_ok());
        assert!(validate_base_url("http://127.0.0.1:8080").is_ok());
        assert!(validate_base_url("http://[::1]:8080").is_ok());
        assert!(validate_base_url("http://mcp.example.com").is_err());
        assert!(validate_base_url("ftp://mcp.example.com").is_err());
        assert!(validate_base_url("not a url").is_err());
    }

    #[test]
    fn validate_requires_provider_credentials() {
        // GIVEN: OAuth enabled without a client secret
        let mut config = oauth_enabled();
        config.oauth.provider.client_secret.clear();

        // THEN: startup is refused
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_warns_without_encryption_key() {
        // GIVEN: a valid OAuth config without an encryption key
        let config = oauth_enabled();

        // WHEN: validated
        let warnings = config.validate().unwrap();

        // THEN: the degraded mode is surfaced
        assert!(warnings.iter().any(|w| w.contains("UNENCRYPTED")));
    }

    #[test]
    fn validate_rejects_all_zero_encryption_key() {
        let mut config = oauth_enabled();
        config.oauth.encryption_key = Some(base64::Engine::encode(
            &base64::engine::general_purpose::STANDARD,
            [0u8; 32],
        ));
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_dangerous_trusted_schemes() {
        let mut config = oauth_enabled();
        config.oauth.trusted_public_registration_schemes = vec!["javascript".to_string()];
        assert!(config.validate().is_err());

        config.oauth.trusted_public_registration_schemes = vec!["cursor".to_string()];
        assert!(config.validate().is_ok());
    }

    #[test]
    fn validate_warns_when_cache_ttl_exceeds_token_lifetime() {
        // GIVEN: federation cache TTL of 2h against a 1h access token
        let mut config = oauth_enabled();
        config.federation.enabled = true;
        config.federation.cache.ttl = Duration::from_secs(7200);
        config.federation.workload_auth_mode = WorkloadAuthMode::SsoPassthrough;

        // WHEN: validated
        let warnings = config.validate().unwrap();

        // THEN: warned, not blocked, with the passthrough hint
        let warning = warnings.iter().find(|w| w.contains("federation.cache.ttl")).unwrap();
        assert!(warning.contains("sso_passthrough_cache=false"));
    }

    #[test]
    fn validate_rejects_passthrough_without_oauth() {
        let mut config = Config::default();
        config.federation.enabled = true;
        config.federation.workload_auth_mode = WorkloadAuthMode::SsoPassthrough;
        assert!(config.validate().is_err());
    }

    #[test]
    fn expand_env_vars_uses_default() {
        let mut config = Config::default();
        config.oauth.provider.client_secret = "${MCP_K8S_TEST_UNSET_SECRET:-fallback}".to_string();
        config.expand_env_vars();
        assert_eq!(config.oauth.provider.client_secret, "fallback");
    }
}
