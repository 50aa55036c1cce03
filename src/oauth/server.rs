//! Authorization server core.
//!
//! Per authorization attempt: `Requested -> CodeIssued -> TokenIssued | Expired | Denied`.
//! Per token: `Issued -> Refreshed -> Issued | Revoked | Expired`.
//!
//! Codes and refresh tokens are single-use. Consumption is claimed with an
//! atomic `put_if_absent` of a marker that names the token lineage; a second
//! presentation finds the marker and revokes the whole lineage by writing one
//! `lineage-revoked` record that every later validation checks. Issuance after
//! a successful claim runs in its own task so a dropped request cannot leave a
//! claimed code without stored tokens, and a storage failure releases the claim.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use super::audit::{self, AuditEvent};
use super::cimd::{CimdError, CimdResolver, DocumentFetcher, HttpFetcher, is_cimd_client_id};
use super::encryption::{EncryptionKey, TokenCipher};
use super::error::OAuthError;
use super::model::{
    AuthenticatedUser, AuthorizationCodeRecord, AuthorizeRequest, BearerSource, ClientRecord,
    ConsumedMarker, IntrospectionResponse, PendingAuthorization, RegistrationRequest,
    RegistrationResponse, TokenIdentity, TokenKind, TokenRecord, TokenRequest, TokenResponse,
    TrustClass, keys,
};
use super::provider::{IdentityProvider, OidcProvider, ProviderError, issuer_for};
use super::redirect::{RedirectSetKind, RedirectUriValidator, ValidationPhase};
use super::sso::{DiscoveredJwks, IdTokenVerifier, SsoTrust, looks_like_jwt};
use super::store::{KvStore, MemoryStore, SecureStore};
use super::tokens::{
    ACCESS_TOKEN_PREFIX, CODE_PREFIX, PKCE_METHOD_S256, REFRESH_TOKEN_PREFIX, generate_client_secret,
    generate_opaque, generate_pkce, generate_state, hash_secret, secret_matches, verify_pkce,
};
use crate::config::{OAuthConfig, parse_trusted_proxy};
use crate::failsafe::KeyedRateLimiter;
use crate::federation::validation::anonymize_email;
use crate::metrics::OAuthMetrics;
use crate::security::ssrf::{AddressAllowance, Resolver, SystemResolver};
use crate::{Error, Result};

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

fn secs(d: Duration) -> i64 {
    i64::try_from(d.as_secs()).unwrap_or(i64::MAX)
}

/// Client credentials presented at the token, revocation or introspection endpoints
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientCredentials {
    /// From HTTP Basic or the form body
    pub client_id: Option<String>,
    /// From HTTP Basic or the form body
    pub client_secret: Option<String>,
}

/// Failure of an authorization-endpoint or callback request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthorizeError {
    /// The redirect URI cannot be trusted; show the error to the user agent
    Direct(OAuthError),
    /// Redirect back to the client with `error`
    Redirect {
        /// Validated client redirect URI
        redirect_uri: String,
        /// Error to report
        error: OAuthError,
        /// Client `state`, echoed back
        state: Option<String>,
    },
}

impl AuthorizeError {
    /// The underlying error
    #[must_use]
    pub fn error(&self) -> &OAuthError {
        match self {
            Self::Direct(e) | Self::Redirect { error: e, .. } => e,
        }
    }
}

/// Builds redirect URLs carrying query parameters
fn redirect_with(base: &str, params: &[(&str, &str)]) -> String {
    match Url::parse(base) {
        Ok(mut url) => {
            {
                let mut query = url.query_pairs_mut();
                for (k, v) in params {
                    query.append_pair(k, v);
                }
            }
            url.into()
        }
        Err(_) => base.to_string(),
    }
}

/// Error redirect to the client (RFC 6749 §4.1.2.1, RFC 9207 `iss`)
#[must_use]
pub fn error_redirect_url(redirect_uri: &str, error: &OAuthError, state: Option<&str>, issuer: &str) -> String {
    let mut params = vec![
        ("error", error.code.as_str()),
        ("error_description", error.description.as_str()),
        ("iss", issuer),
    ];
    if let Some(state) = state {
        params.push(("state", state));
    }
    redirect_with(redirect_uri, &params)
}

/// Loopback redirect URIs may vary in port (RFC 8252 §7.3); everything else matches exactly.
fn redirect_matches(registered: &str, requested: &str) -> bool {
    if registered == requested {
        return true;
    }
    let (Ok(a), Ok(b)) = (Url::parse(registered), Url::parse(requested)) else {
        return false;
    };
    let loopback = |u: &Url| {
        u.scheme() == "http"
            && u.host_str()
                .and_then(crate::security::ssrf::host_as_ip)
                .is_some_and(|ip: IpAddr| ip.is_loopback())
    };
    loopback(&a)
        && loopback(&b)
        && a.host_str() == b.host_str()
        && a.path() == b.path()
        && a.query() == b.query()
}

/// Per-IP registration attempt counter over a fixed window
struct RegistrationCap {
    max: usize,
    window: Duration,
    attempts: DashMap<String, (usize, Instant)>,
}

impl RegistrationCap {
    /// Count an attempt; `false` once the cap is exceeded.
    fn admit(&self, ip: &str) -> bool {
        let mut entry = self
            .attempts
            .entry(ip.to_string())
            .or_insert((0, Instant::now()));
        if entry.1.elapsed() >= self.window {
            *entry = (0, Instant::now());
        }
        entry.0 += 1;
        entry.0 <= self.max
    }

    fn purge(&self) {
        let window = self.window;
        self.attempts.retain(|_, (_, started)| started.elapsed() < window);
    }
}

/// Creates token pairs. Cloneable so issuance can run in a detached task.
#[derive(Clone)]
struct TokenIssuer {
    store: SecureStore,
    access_ttl: Duration,
    refresh_ttl: Duration,
}

impl TokenIssuer {
    async fn issue(
        &self,
        client_id: &str,
        scope: Option<String>,
        identity: TokenIdentity,
        lineage_id: &str,
        parent: &str,
    ) -> std::result::Result<TokenResponse, OAuthError> {
        let issued_at = now();
        let access_token = generate_opaque(ACCESS_TOKEN_PREFIX);
        let refresh_token = generate_opaque(REFRESH_TOKEN_PREFIX);
        let record = |kind, ttl| TokenRecord {
            kind,
            client_id: client_id.to_string(),
            scope: scope.clone(),
            identity: identity.clone(),
            lineage_id: lineage_id.to_string(),
            parent: parent.to_string(),
            issued_at,
            expires_at: issued_at + secs(ttl),
        };

        let access_key = keys::access(&hash_secret(&access_token));
        self.store
            .put(&access_key, &record(TokenKind::Access, self.access_ttl), Some(self.access_ttl))
            .await?;
        if let Err(e) = self
            .store
            .put(
                &keys::refresh(&hash_secret(&refresh_token)),
                &record(TokenKind::Refresh, self.refresh_ttl),
                Some(self.refresh_ttl),
            )
            .await
        {
            let _ = self.store.delete(&access_key).await;
            return Err(e.into());
        }

        Ok(TokenResponse {
            access_token,
            token_type: "Bearer".to_string(),
            expires_in: self.access_ttl.as_secs(),
            refresh_token,
            scope,
        })
    }
}

/// External collaborators of the authorization server
pub struct ServerDeps {
    /// Credential store
    pub store: SecureStore,
    /// DNS seam for redirect and CIMD checks
    pub resolver: Arc<dyn Resolver>,
    /// CIMD fetcher
    pub fetcher: Arc<dyn DocumentFetcher>,
    /// Upstream identity provider
    pub provider: Arc<dyn IdentityProvider>,
    /// Verifier for upstream ID tokens (SSO forwarding)
    pub id_verifier: Arc<IdTokenVerifier>,
    /// Metrics recorder
    pub metrics: Arc<dyn OAuthMetrics>,
}

/// The OAuth 2.1 authorization server
pub struct AuthorizationServer {
    config: OAuthConfig,
    issuer: String,
    store: SecureStore,
    tokens: TokenIssuer,
    redirects: RedirectUriValidator,
    cimd: CimdResolver,
    provider: Arc<dyn IdentityProvider>,
    sso: SsoTrust,
    ip_limiter: Arc<KeyedRateLimiter>,
    user_limiter: Arc<KeyedRateLimiter>,
    registrations: RegistrationCap,
    trusted_proxies: Vec<ipnet::IpNet>,
    memory: Option<Arc<MemoryStore>>,
    metrics: Arc<dyn OAuthMetrics>,
}

impl std::fmt::Debug for AuthorizationServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthorizationServer")
            .field("issuer", &self.issuer)
            .field("backend", &self.store.backend_name())
            .field("encrypted", &self.store.is_encrypted())
            .finish_non_exhaustive()
    }
}

impl AuthorizationServer {
    /// Assemble from explicit collaborators
    pub fn new(config: OAuthConfig, deps: ServerDeps) -> Self {
        let rl = &config.rate_limit;
        let (ip_limiter, user_limiter) = if rl.enabled {
            (
                KeyedRateLimiter::new(rl.ip_requests_per_second, rl.ip_burst, rl.idle_expiry),
                KeyedRateLimiter::new(rl.user_requests_per_second, rl.user_burst, rl.idle_expiry),
            )
        } else {
            (KeyedRateLimiter::disabled(), KeyedRateLimiter::disabled())
        };

        Self {
            issuer: config.base_url.trim_end_matches('/').to_string(),
            tokens: TokenIssuer {
                store: deps.store.clone(),
                access_ttl: config.access_token_ttl,
                refresh_ttl: config.refresh_token_ttl,
            },
            store: deps.store,
            redirects: RedirectUriValidator::new(
                config.redirect.clone(),
                &config.trusted_public_registration_schemes,
                Arc::clone(&deps.resolver),
            ),
            cimd: CimdResolver::new(config.cimd.clone(), deps.resolver, deps.fetcher),
            provider: deps.provider,
            sso: SsoTrust::new(deps.id_verifier, config.sso.trusted_audiences.clone()),
            ip_limiter: Arc::new(ip_limiter),
            user_limiter: Arc::new(user_limiter),
            registrations: RegistrationCap {
                max: config.max_clients_per_ip,
                window: config.registration_window,
                attempts: DashMap::new(),
            },
            trusted_proxies: config
                .trusted_proxies
                .iter()
                .filter_map(|raw| match parse_trusted_proxy(raw) {
                    Ok(net) => Some(net),
                    Err(e) => {
                        warn!(error = %e, "Ignoring trusted proxy entry");
                        None
                    }
                })
                .collect(),
            memory: None,
            metrics: deps.metrics,
            config,
        }
    }

    /// Build the production server from configuration
    pub async fn from_config(config: &OAuthConfig, metrics: Arc<dyn OAuthMetrics>) -> Result<Self> {
        let cipher = match config.encryption_key.as_deref().filter(|k| !k.is_empty()) {
            Some(encoded) => {
                let key = EncryptionKey::from_base64(encoded)
                    .map_err(|e| Error::Config(format!("oauth.encryption_key: {e}")))?;
                Some(TokenCipher::new(&key))
            }
            None => {
                warn!("Token encryption at rest is DISABLED: stored tokens are UNENCRYPTED (set oauth.encryption_key)");
                None
            }
        };

        let (kv, memory): (Arc<dyn KvStore>, Option<Arc<MemoryStore>>) = match config.storage.backend {
            crate::config::StorageBackend::Memory => {
                let mem = Arc::new(MemoryStore::new());
                (Arc::clone(&mem) as Arc<dyn KvStore>, Some(mem))
            }
            crate::config::StorageBackend::Valkey => (super::store::connect(&config.storage).await?, None),
        };
        let store = SecureStore::new(kv, cipher);

        let extra_root = match &config.provider.ca_file {
            Some(path) => {
                let pem = tokio::fs::read(path).await?;
                Some(reqwest::Certificate::from_pem(&pem).map_err(|e| {
                    Error::Config(format!("oauth.provider.ca_file {}: {e}", path.display()))
                })?)
            }
            None => None,
        };

        let resolver: Arc<dyn Resolver> = Arc::new(SystemResolver);
        let issuer = issuer_for(&config.provider);
        let allow = if config.sso.allow_private_ips {
            AddressAllowance {
                loopback: false,
                private: true,
                link_local: false,
            }
        } else {
            AddressAllowance::PUBLIC_ONLY
        };
        let mut jwks = DiscoveredJwks::new(
            issuer.clone(),
            Arc::clone(&resolver),
            allow,
            config.sso.fetch_timeout,
            config.sso.jwks_cache_ttl,
        );
        if let Some(cert) = extra_root.clone() {
            jwks = jwks.with_root_certificate(cert);
        }
        let id_verifier = Arc::new(IdTokenVerifier::new(issuer, Arc::new(jwks)));
        let provider = OidcProvider::from_config(&config.provider, Arc::clone(&id_verifier), extra_root)
            .map_err(|e| Error::Config(e.to_string()))?;

        info!(
            provider = provider_name(config),
            backend = store.backend_name(),
            encrypted = store.is_encrypted(),
            "OAuth authorization server initialised"
        );

        let mut server = Self::new(
            config.clone(),
            ServerDeps {
                store,
                resolver,
                fetcher: Arc::new(HttpFetcher),
                provider: Arc::new(provider),
                id_verifier,
                metrics,
            },
        );
        server.memory = memory;
        Ok(server)
    }

    /// Issuer identifier (the base URL)
    #[must_use]
    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    /// Upstream callback URL
    #[must_use]
    pub fn callback_url(&self) -> String {
        format!("{}/oauth/callback", self.issuer)
    }

    /// Configuration in effect
    #[must_use]
    pub fn config(&self) -> &OAuthConfig {
        &self.config
    }

    /// Proxies whose forwarded-for headers are believed
    #[must_use]
    pub fn trusted_proxies(&self) -> &[ipnet::IpNet] {
        &self.trusted_proxies
    }

    /// Whether stored tokens are encrypted
    #[must_use]
    pub fn is_encrypted(&self) -> bool {
        self.store.is_encrypted()
    }

    /// Start periodic maintenance (limiter cleanup, cache purge, memory reaping)
    pub fn spawn_maintenance(self: &Arc<Self>, shutdown: &CancellationToken) -> Vec<JoinHandle<()>> {
        let interval = self.config.rate_limit.cleanup_interval;
        let mut handles = vec![
            self.ip_limiter.spawn_cleanup(interval, shutdown.clone()),
            self.user_limiter.spawn_cleanup(interval, shutdown.clone()),
        ];

        let server = Arc::clone(self);
        let shutdown = shutdown.clone();
        handles.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    () = shutdown.cancelled() => return,
                    _ = ticker.tick() => {
                        server.registrations.purge();
                        server.cimd.purge_expired();
                        if let Some(mem) = &server.memory {
                            let reaped = mem.reap_expired();
                            if reaped > 0 {
                                debug!(reaped, "Reaped expired credential records");
                            }
                        }
                    }
                }
            }
        }));
        handles
    }

    fn reject(&self, operation: &'static str, error: OAuthError) -> OAuthError {
        self.metrics.record_oauth(operation, error.code.as_str());
        error
    }

    /// Per-IP limiter shared by every OAuth endpoint
    pub fn check_ip_rate(&self, ip: &str, operation: &'static str) -> std::result::Result<(), OAuthError> {
        if self.ip_limiter.check(ip) {
            return Ok(());
        }
        audit::emit(&AuditEvent::rate_limited(operation, ip));
        self.metrics.record_security_event("rate_limited");
        Err(self.reject(operation, OAuthError::rate_limited("too many requests")))
    }

    // ---- Register -------------------------------------------------------

    /// Dynamic client registration (RFC 7591)
    pub async fn register(
        &self,
        request: RegistrationRequest,
        client_ip: &str,
        registration_token: Option<&str>,
    ) -> std::result::Result<RegistrationResponse, OAuthError> {
        const OP: &str = "register";

        if !self.registrations.admit(client_ip) {
            audit::emit(&AuditEvent::rate_limited(OP, client_ip));
            self.metrics.record_security_event("registration_cap");
            return Err(self.reject(
                OP,
                OAuthError::rate_limited("too many client registrations from this address"),
            ));
        }

        if let Some(client_id) = request.client_id.as_deref() {
            if self.cimd.enabled() && is_cimd_client_id(client_id) {
                return self.register_cimd(client_id, &request, client_ip).await;
            }
        }

        let token_valid = match (registration_token, self.config.registration_token.as_deref()) {
            (Some(presented), Some(expected)) if !expected.is_empty() => {
                let ok: bool = subtle::ConstantTimeEq::ct_eq(presented.as_bytes(), expected.as_bytes()).into();
                if !ok {
                    audit::emit(&AuditEvent::registration_denied("invalid registration token", client_ip));
                    return Err(self.reject(OP, OAuthError::invalid_token("invalid registration token")));
                }
                true
            }
            _ => false,
        };

        let all_trusted_schemes = !request.redirect_uris.is_empty()
            && request.redirect_uris.iter().all(|uri| {
                Url::parse(uri).is_ok_and(|u| self.redirects.is_trusted_scheme(u.scheme()))
            });
        let any_trusted_scheme = request
            .redirect_uris
            .iter()
            .any(|uri| Url::parse(uri).is_ok_and(|u| self.redirects.is_trusted_scheme(u.scheme())));

        if !token_valid
            && !self.config.allow_public_registration
            && !all_trusted_schemes
            && !(any_trusted_scheme && self.config.redirect.allow_mixed_scheme_redirects)
        {
            audit::emit(&AuditEvent::registration_denied("registration token required", client_ip));
            return Err(self.reject(OP, OAuthError::invalid_token("registration token required")));
        }

        let kind = match self
            .redirects
            .validate_set(&request.redirect_uris, ValidationPhase::Registration)
            .await
        {
            Ok(kind) => kind,
            Err(e) => {
                audit::emit(&AuditEvent::redirect_rejected(None, e.category().as_str(), e.to_string()));
                self.metrics.record_security_event("redirect_rejected");
                return Err(self.reject(OP, OAuthError::invalid_redirect_uri(e.to_string())));
            }
        };

        let trust = if token_valid {
            TrustClass::RegistrationToken
        } else if matches!(kind, RedirectSetKind::TrustedCustom | RedirectSetKind::Mixed) {
            TrustClass::TrustedScheme
        } else if self.config.allow_public_registration {
            TrustClass::Public
        } else {
            audit::emit(&AuditEvent::registration_denied("registration token required", client_ip));
            return Err(self.reject(OP, OAuthError::invalid_token("registration token required")));
        };

        let auth_method = match request.token_endpoint_auth_method.as_deref() {
            None | Some("none") => "none",
            Some("client_secret_basic") => "client_secret_basic",
            Some("client_secret_post") => "client_secret_post",
            Some(other) => {
                return Err(self.reject(
                    OP,
                    OAuthError::invalid_client_metadata(format!("unsupported token_endpoint_auth_method '{other}'")),
                ));
            }
        };
        if request
            .grant_types
            .iter()
            .any(|g| g != "authorization_code" && g != "refresh_token")
        {
            return Err(self.reject(
                OP,
                OAuthError::invalid_client_metadata("only authorization_code and refresh_token grants are supported"),
            ));
        }

        let client_secret = (auth_method != "none").then(generate_client_secret);
        let record = ClientRecord {
            client_id: uuid::Uuid::new_v4().to_string(),
            client_secret_hash: client_secret.as_deref().map(hash_secret),
            client_name: request.client_name.map(|n| n.chars().take(256).collect()),
            redirect_uris: request.redirect_uris,
            trust,
            token_endpoint_auth_method: auth_method.to_string(),
            registered_at: now(),
        };
        self.store.put(&keys::client(&record.client_id), &record, None).await?;

        audit::emit(&AuditEvent::client_registered(&record.client_id, trust.as_str(), client_ip));
        self.metrics.record_oauth(OP, "success");

        Ok(RegistrationResponse {
            client_id: record.client_id,
            client_secret_expires_at: client_secret.as_ref().map(|_| 0),
            client_secret,
            client_id_issued_at: record.registered_at,
            redirect_uris: record.redirect_uris,
            client_name: record.client_name,
            token_endpoint_auth_method: record.token_endpoint_auth_method,
            grant_types: vec!["authorization_code".to_string(), "refresh_token".to_string()],
            response_types: vec!["code".to_string()],
        })
    }

    /// A metadata-document client "registers" by having its document resolved;
    /// nothing is stored.
    async fn register_cimd(
        &self,
        client_id: &str,
        request: &RegistrationRequest,
        client_ip: &str,
    ) -> std::result::Result<RegistrationResponse, OAuthError> {
        let record = self.resolve_client(client_id).await?;
        if request
            .redirect_uris
            .iter()
            .any(|uri| !record.redirect_uris.contains(uri))
        {
            return Err(self.reject(
                "register",
                OAuthError::invalid_redirect_uri("redirect_uris must be listed in the client metadata document"),
            ));
        }
        if let Err(e) = self
            .redirects
            .validate_set(&record.redirect_uris, ValidationPhase::Registration)
            .await
        {
            audit::emit(&AuditEvent::redirect_rejected(Some(client_id), e.category().as_str(), e.to_string()));
            return Err(self.reject("register", OAuthError::invalid_redirect_uri(e.to_string())));
        }
        audit::emit(&AuditEvent::client_registered(client_id, TrustClass::Cimd.as_str(), client_ip));
        self.metrics.record_oauth("register", "success");
        Ok(RegistrationResponse {
            client_id: record.client_id,
            client_secret: None,
            client_id_issued_at: now(),
            client_secret_expires_at: None,
            redirect_uris: record.redirect_uris,
            client_name: record.client_name,
            token_endpoint_auth_method: "none".to_string(),
            grant_types: vec!["authorization_code".to_string(), "refresh_token".to_string()],
            response_types: vec!["code".to_string()],
        })
    }

    /// Look up a registered client, or resolve a metadata-document client.
    pub async fn resolve_client(&self, client_id: &str) -> std::result::Result<ClientRecord, OAuthError> {
        if client_id.is_empty() {
            return Err(OAuthError::invalid_request("client_id is required"));
        }
        if self.cimd.enabled() && is_cimd_client_id(client_id) {
            return match self.cimd.resolve(client_id).await {
                Ok(doc) => Ok(ClientRecord {
                    client_id: doc.client_id.clone(),
                    client_secret_hash: None,
                    client_name: doc.client_name.clone(),
                    redirect_uris: doc.redirect_uris.clone(),
                    trust: TrustClass::Cimd,
                    token_endpoint_auth_method: "none".to_string(),
                    registered_at: 0,
                }),
                Err(e) => {
                    if matches!(e, CimdError::Ssrf(_)) {
                        self.metrics.record_security_event("ssrf_blocked");
                    }
                    Err(OAuthError::invalid_client(format!("client metadata document rejected: {e}")))
                }
            };
        }
        self.store
            .get::<ClientRecord>(&keys::client(client_id))
            .await?
            .ok_or_else(|| OAuthError::invalid_client("unknown client"))
    }

    // ---- Authorize ------------------------------------------------------

    /// Validate an authorization request and return the upstream IdP URL to redirect to.
    pub async fn authorize(&self, request: AuthorizeRequest) -> std::result::Result<String, AuthorizeError> {
        const OP: &str = "authorize";

        let client = self
            .resolve_client(&request.client_id)
            .await
            .map_err(|e| AuthorizeError::Direct(self.reject(OP, e)))?;

        let redirect_uri = match request.redirect_uri.as_deref() {
            Some(requested) => {
                if !client.redirect_uris.iter().any(|r| redirect_matches(r, requested)) {
                    return Err(AuthorizeError::Direct(
                        self.reject(OP, OAuthError::invalid_request("redirect_uri is not registered for this client")),
                    ));
                }
                requested.to_string()
            }
            None if client.redirect_uris.len() == 1 => client.redirect_uris[0].clone(),
            None => {
                return Err(AuthorizeError::Direct(
                    self.reject(OP, OAuthError::invalid_request("redirect_uri is required")),
                ));
            }
        };

        if let Err(e) = self.redirects.validate(&redirect_uri, ValidationPhase::Authorization).await {
            audit::emit(&AuditEvent::redirect_rejected(Some(&client.client_id), e.category().as_str(), e.to_string()));
            self.metrics.record_security_event("redirect_rejected");
            return Err(AuthorizeError::Direct(
                self.reject(OP, OAuthError::invalid_request(format!("redirect_uri rejected: {e}"))),
            ));
        }

        let redirect_err = |error: OAuthError| AuthorizeError::Redirect {
            redirect_uri: redirect_uri.clone(),
            error: self.reject(OP, error),
            state: request.state.clone(),
        };

        if request.response_type != "code" {
            return Err(redirect_err(OAuthError::unsupported_response_type(
                "only response_type=code is supported",
            )));
        }

        match request.state.as_deref() {
            Some(s) if !s.is_empty() => {}
            _ if self.config.allow_insecure_auth_without_state => {
                warn!(
                    client_id = %client.client_id,
                    "Authorization request without state accepted (allow_insecure_auth_without_state); CSRF protection is weakened"
                );
            }
            _ => return Err(redirect_err(OAuthError::invalid_request("state parameter is required"))),
        }

        let Some(code_challenge) = request.code_challenge.clone().filter(|c| !c.is_empty()) else {
            return Err(redirect_err(OAuthError::invalid_request("code_challenge is required (PKCE)")));
        };
        let method = request.code_challenge_method.as_deref().unwrap_or("plain");
        if method != PKCE_METHOD_S256 {
            return Err(redirect_err(OAuthError::invalid_request("code_challenge_method must be S256")));
        }
        if code_challenge.len() != 43
            || !code_challenge
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
        {
            return Err(redirect_err(OAuthError::invalid_request("code_challenge is malformed")));
        }

        let upstream_state = generate_state();
        let (upstream_verifier, upstream_challenge) = generate_pkce();
        let pending = PendingAuthorization {
            client_id: client.client_id.clone(),
            redirect_uri: redirect_uri.clone(),
            code_challenge,
            code_challenge_method: PKCE_METHOD_S256.to_string(),
            state: request.state.clone().filter(|s| !s.is_empty()),
            scope: request.scope.clone(),
            upstream_verifier,
        };
        self.store
            .put(&keys::pending(&upstream_state), &pending, Some(self.config.code_ttl))
            .await
            .map_err(|e| redirect_err(e.into()))?;

        self.metrics.record_oauth(OP, "redirected");
        Ok(self
            .provider
            .authorization_url(&upstream_state, &upstream_challenge, &self.callback_url()))
    }

    /// Complete the upstream round-trip and return the client redirect carrying the code.
    pub async fn callback(
        &self,
        upstream_state: &str,
        upstream_code: Option<&str>,
        upstream_error: Option<&str>,
    ) -> std::result::Result<String, AuthorizeError> {
        const OP: &str = "callback";

        let pending: PendingAuthorization = self
            .store
            .take(&keys::pending(upstream_state))
            .await
            .map_err(|e| AuthorizeError::Direct(e.into()))?
            .ok_or_else(|| {
                AuthorizeError::Direct(self.reject(OP, OAuthError::invalid_request("unknown or expired state")))
            })?;

        let redirect_err = |error: OAuthError| AuthorizeError::Redirect {
            redirect_uri: pending.redirect_uri.clone(),
            error: self.reject(OP, error),
            state: pending.state.clone(),
        };

        if let Some(err) = upstream_error {
            return Err(redirect_err(OAuthError::access_denied(format!("identity provider returned {err}"))));
        }
        let Some(code) = upstream_code else {
            return Err(redirect_err(OAuthError::invalid_request("missing code from identity provider")));
        };

        let identity = match self
            .provider
            .exchange_code(code, &pending.upstream_verifier, &self.callback_url())
            .await
        {
            Ok(identity) => identity,
            Err(e) => {
                warn!(provider = self.provider.name(), error = %e, "Upstream code exchange failed");
                return Err(redirect_err(match e {
                    ProviderError::Request(_) => OAuthError::temporarily_unavailable("identity provider unavailable"),
                    _ => OAuthError::access_denied("identity provider rejected the login"),
                }));
            }
        };

        let code = generate_opaque(CODE_PREFIX);
        let lineage_id = uuid::Uuid::new_v4().to_string();
        let record = AuthorizationCodeRecord {
            client_id: pending.client_id.clone(),
            redirect_uri: pending.redirect_uri.clone(),
            code_challenge: pending.code_challenge.clone(),
            code_challenge_method: pending.code_challenge_method.clone(),
            scope: pending.scope.clone(),
            identity: TokenIdentity {
                subject: identity.subject,
                email: identity.email,
                groups: identity.groups,
                upstream_id_token: Some(identity.id_token),
                upstream_refresh_token: identity.refresh_token,
            },
            lineage_id: lineage_id.clone(),
            expires_at: now() + secs(self.config.code_ttl),
        };
        self.store
            .put(&keys::code(&hash_secret(&code)), &record, Some(self.config.code_ttl))
            .await
            .map_err(|e| redirect_err(e.into()))?;

        audit::emit(&AuditEvent::code_issued(&record.client_id, &record.identity.email, &lineage_id));
        self.metrics.record_oauth(OP, "code_issued");

        let mut params = vec![("code", code.as_str()), ("iss", self.issuer.as_str())];
        if let Some(state) = pending.state.as_deref() {
            params.push(("state", state));
        }
        Ok(redirect_with(&pending.redirect_uri, &params))
    }

    // ---- Token endpoint -------------------------------------------------

    /// `POST /oauth/token`
    pub async fn token(
        &self,
        request: TokenRequest,
        credentials: ClientCredentials,
    ) -> std::result::Result<TokenResponse, OAuthError> {
        match request.grant_type.as_str() {
            "authorization_code" => self.exchange(request, credentials).await,
            "refresh_token" => self.refresh(request, credentials).await,
            "" => Err(self.reject("token", OAuthError::invalid_request("grant_type is required"))),
            other => Err(self.reject(
                "token",
                OAuthError::unsupported_grant_type(format!("grant_type '{other}' is not supported")),
            )),
        }
    }

    async fn authenticate_client(
        &self,
        expected_client_id: &str,
        credentials: &ClientCredentials,
    ) -> std::result::Result<ClientRecord, OAuthError> {
        if let Some(presented) = credentials.client_id.as_deref() {
            if presented != expected_client_id {
                return Err(OAuthError::invalid_grant("token was issued to another client"));
            }
        }
        let client = self.resolve_client(expected_client_id).await?;
        if let Some(hash) = &client.client_secret_hash {
            let ok = credentials
                .client_secret
                .as_deref()
                .is_some_and(|secret| secret_matches(secret, hash));
            if !ok {
                return Err(OAuthError::invalid_client("client authentication failed"));
            }
        }
        Ok(client)
    }

    async fn exchange(
        &self,
        request: TokenRequest,
        credentials: ClientCredentials,
    ) -> std::result::Result<TokenResponse, OAuthError> {
        const OP: &str = "token";

        let code = request
            .code
            .as_deref()
            .filter(|c| !c.is_empty())
            .ok_or_else(|| self.reject(OP, OAuthError::invalid_request("code is required")))?;
        let code_hash = hash_secret(code);

        let Some(record) = self
            .store
            .get::<AuthorizationCodeRecord>(&keys::code(&code_hash))
            .await?
        else {
            if let Some(marker) = self
                .store
                .get::<ConsumedMarker>(&keys::used_code(&code_hash))
                .await?
            {
                self.handle_replay("authorization_code", &marker.lineage_id).await;
                return Err(self.reject(OP, OAuthError::invalid_grant("authorization code already used")));
            }
            return Err(self.reject(OP, OAuthError::invalid_grant("invalid or expired authorization code")));
        };

        if record.expires_at <= now() {
            return Err(self.reject(OP, OAuthError::invalid_grant("authorization code expired")));
        }
        let credentials = ClientCredentials {
            client_id: credentials.client_id.or(request.client_id.clone()),
            client_secret: credentials.client_secret.or(request.client_secret.clone()),
        };
        self.authenticate_client(&record.client_id, &credentials)
            .await
            .map_err(|e| self.reject(OP, e))?;

        if request.redirect_uri.as_deref() != Some(record.redirect_uri.as_str()) {
            return Err(self.reject(OP, OAuthError::invalid_grant("redirect_uri does not match the authorization request")));
        }
        let verifier = request
            .code_verifier
            .as_deref()
            .ok_or_else(|| self.reject(OP, OAuthError::invalid_request("code_verifier is required")))?;
        if !verify_pkce(verifier, &record.code_challenge, &record.code_challenge_method) {
            self.metrics.record_security_event("pkce_failed");
            return Err(self.reject(OP, OAuthError::invalid_grant("PKCE verification failed")));
        }

        let marker = ConsumedMarker {
            lineage_id: record.lineage_id.clone(),
        };
        let issuer = self.tokens.clone();
        let store = self.store.clone();
        let refresh_ttl = self.config.refresh_token_ttl;
        let outcome: std::result::Result<Option<(TokenResponse, AuthorizationCodeRecord)>, OAuthError> =
            tokio::spawn(async move {
            let used_key = keys::used_code(&code_hash);
            match store.put_if_absent(&used_key, &marker, Some(refresh_ttl)).await {
                Ok(true) => {}
                Ok(false) => return Ok(None),
                Err(e) => return Err(OAuthError::from(e)),
            }
            match issuer
                .issue(&record.client_id, record.scope.clone(), record.identity.clone(), &record.lineage_id, &code_hash)
                .await
            {
                Ok(tokens) => {
                    let _ = store.delete(&keys::code(&code_hash)).await;
                    Ok(Some((tokens, record)))
                }
                Err(e) => {
                    let _ = store.delete(&used_key).await;
                    Err(e)
                }
            }
        })
        .await
        .map_err(|e| OAuthError::server_error(format!("token issuance task failed: {e}")))?;

        match outcome {
            Ok(Some((tokens, record))) => {
                audit::emit(&AuditEvent::token_issued(&record.client_id, &record.identity.email, &record.lineage_id));
                self.metrics.record_oauth(OP, "success");
                Ok(tokens)
            }
            Ok(None) => {
                self.handle_replay("authorization_code", &marker_lineage(&self.store, code).await).await;
                Err(self.reject(OP, OAuthError::invalid_grant("authorization code already used")))
            }
            Err(e) => Err(self.reject(OP, e)),
        }
    }

    async fn refresh(
        &self,
        request: TokenRequest,
        credentials: ClientCredentials,
    ) -> std::result::Result<TokenResponse, OAuthError> {
        const OP: &str = "refresh";

        let token = request
            .refresh_token
            .as_deref()
            .filter(|t| !t.is_empty())
            .ok_or_else(|| self.reject(OP, OAuthError::invalid_request("refresh_token is required")))?;
        let hash = hash_secret(token);

        let Some(record) = self.store.get::<TokenRecord>(&keys::refresh(&hash)).await? else {
            if let Some(marker) = self
                .store
                .get::<ConsumedMarker>(&keys::used_refresh(&hash))
                .await?
            {
                self.handle_replay("refresh_token", &marker.lineage_id).await;
                return Err(self.reject(OP, OAuthError::invalid_grant("refresh token already used")));
            }
            return Err(self.reject(OP, OAuthError::invalid_grant("invalid or expired refresh token")));
        };

        if record.expires_at <= now() || self.is_lineage_revoked(&record.lineage_id).await? {
            return Err(self.reject(OP, OAuthError::invalid_grant("refresh token is no longer valid")));
        }
        let credentials = ClientCredentials {
            client_id: credentials.client_id.or(request.client_id.clone()),
            client_secret: credentials.client_secret.or(request.client_secret.clone()),
        };
        self.authenticate_client(&record.client_id, &credentials)
            .await
            .map_err(|e| self.reject(OP, e))?;

        let marker = ConsumedMarker {
            lineage_id: record.lineage_id.clone(),
        };
        let issuer = self.tokens.clone();
        let store = self.store.clone();
        let provider = Arc::clone(&self.provider);
        let refresh_ttl = self.config.refresh_token_ttl;
        let outcome: std::result::Result<Option<(TokenResponse, TokenRecord)>, (OAuthError, bool)> =
            tokio::spawn(async move {
                let used_key = keys::used_refresh(&hash);
                match store.put_if_absent(&used_key, &marker, Some(refresh_ttl)).await {
                    Ok(true) => {}
                    Ok(false) => return Ok(None),
                    Err(e) => return Err((e.into(), false)),
                }

                let mut identity = record.identity.clone();
                if let Some(upstream) = identity.upstream_refresh_token.clone() {
                    match provider.refresh(&upstream).await {
                        Ok(fresh) => {
                            identity.groups = fresh.groups;
                            identity.upstream_id_token = Some(fresh.id_token);
                            identity.upstream_refresh_token = fresh.refresh_token;
                        }
                        Err(ProviderError::Request(e)) => {
                            let _ = store.delete(&used_key).await;
                            warn!(error = %e, "Upstream refresh unavailable");
                            return Err((OAuthError::temporarily_unavailable("identity provider unavailable"), false));
                        }
                        Err(e) => {
                            warn!(error = %e, "Upstream session no longer valid");
                            return Err((OAuthError::invalid_grant("upstream session has ended"), true));
                        }
                    }
                }

                match issuer
                    .issue(&record.client_id, record.scope.clone(), identity, &record.lineage_id, &hash)
                    .await
                {
                    Ok(tokens) => {
                        let _ = store.delete(&keys::refresh(&hash)).await;
                        Ok(Some((tokens, record)))
                    }
                    Err(e) => {
                        let _ = store.delete(&used_key).await;
                        Err((e, false))
                    }
                }
            })
            .await
            .map_err(|e| OAuthError::server_error(format!("token rotation task failed: {e}")))?;

        match outcome {
            Ok(Some((tokens, record))) => {
                audit::emit(&AuditEvent::token_refreshed(&record.client_id, &record.identity.email, &record.lineage_id));
                self.metrics.record_oauth(OP, "success");
                Ok(tokens)
            }
            Ok(None) => {
                self.handle_replay("refresh_token", &marker_lineage_refresh(&self.store, token).await)
                    .await;
                Err(self.reject(OP, OAuthError::invalid_grant("refresh token already used")))
            }
            Err((e, revoke)) => {
                if revoke {
                    if let Some(lineage) = self.lineage_of_refresh(token).await {
                        self.revoke_lineage(&lineage, "upstream session ended").await;
                    }
                }
                Err(self.reject(OP, e))
            }
        }
    }

    async fn lineage_of_refresh(&self, token: &str) -> Option<String> {
        let lineage = marker_lineage_refresh(&self.store, token).await;
        (!lineage.is_empty()).then_some(lineage)
    }

    async fn handle_replay(&self, kind: &'static str, lineage_id: &str) {
        if lineage_id.is_empty() {
            return;
        }
        audit::emit(&AuditEvent::replay_detected(kind, lineage_id));
        self.metrics.record_security_event("replay_detected");
        self.revoke_lineage(lineage_id, "replay detected").await;
    }

    /// Invalidate every token derived from one authorization code
    pub async fn revoke_lineage(&self, lineage_id: &str, reason: &str) {
        match self
            .store
            .put(&keys::lineage_revoked(lineage_id), &true, Some(self.config.refresh_token_ttl))
            .await
        {
            Ok(()) => audit::emit(&AuditEvent::lineage_revoked(lineage_id, reason)),
            Err(e) => warn!(lineage_id = %lineage_id, error = %e, "Failed to revoke token lineage"),
        }
    }

    async fn is_lineage_revoked(&self, lineage_id: &str) -> std::result::Result<bool, OAuthError> {
        Ok(self.store.exists(&keys::lineage_revoked(lineage_id)).await?)
    }

    // ---- Revoke / introspect --------------------------------------------

    /// RFC 7009 revocation. Unknown tokens succeed; revoking a refresh token
    /// revokes its whole lineage.
    pub async fn revoke(
        &self,
        token: &str,
        credentials: &ClientCredentials,
    ) -> std::result::Result<(), OAuthError> {
        const OP: &str = "revoke";
        let client_id = credentials
            .client_id
            .as_deref()
            .ok_or_else(|| self.reject(OP, OAuthError::invalid_client("client authentication required")))?;
        self.authenticate_client(client_id, credentials)
            .await
            .map_err(|e| self.reject(OP, e))?;

        let hash = hash_secret(token);
        if let Some(record) = self.store.get::<TokenRecord>(&keys::access(&hash)).await? {
            if record.client_id == client_id {
                self.store.delete(&keys::access(&hash)).await?;
                audit::emit(&AuditEvent::token_revoked(client_id, &record.lineage_id));
            }
        } else if let Some(record) = self.store.get::<TokenRecord>(&keys::refresh(&hash)).await? {
            if record.client_id == client_id {
                self.store.delete(&keys::refresh(&hash)).await?;
                self.revoke_lineage(&record.lineage_id, "refresh token revoked").await;
            }
        }
        self.metrics.record_oauth(OP, "success");
        Ok(())
    }

    /// Whether the caller may introspect: the registration token or a confidential client
    pub async fn authorize_introspection(
        &self,
        bearer: Option<&str>,
        credentials: &ClientCredentials,
    ) -> std::result::Result<(), OAuthError> {
        if let (Some(presented), Some(expected)) = (bearer, self.config.registration_token.as_deref()) {
            if !expected.is_empty()
                && bool::from(subtle::ConstantTimeEq::ct_eq(presented.as_bytes(), expected.as_bytes()))
            {
                return Ok(());
            }
        }
        if let Some(client_id) = credentials.client_id.as_deref() {
            let client = self.authenticate_client(client_id, credentials).await?;
            if client.is_confidential() {
                return Ok(());
            }
        }
        Err(self.reject("introspect", OAuthError::invalid_client("introspection requires client authentication")))
    }

    /// RFC 7662 introspection
    pub async fn introspect(&self, token: &str) -> std::result::Result<IntrospectionResponse, OAuthError> {
        let hash = hash_secret(token);
        let record = match self.store.get::<TokenRecord>(&keys::access(&hash)).await? {
            Some(r) => Some(r),
            None => self.store.get::<TokenRecord>(&keys::refresh(&hash)).await?,
        };
        let Some(record) = record else {
            return Ok(IntrospectionResponse::inactive());
        };
        if record.expires_at <= now() || self.is_lineage_revoked(&record.lineage_id).await? {
            return Ok(IntrospectionResponse::inactive());
        }
        Ok(IntrospectionResponse {
            active: true,
            scope: record.scope,
            client_id: Some(record.client_id),
            username: Some(record.identity.email),
            sub: Some(record.identity.subject),
            token_type: Some(
                match record.kind {
                    TokenKind::Access => "access_token",
                    TokenKind::Refresh => "refresh_token",
                }
                .to_string(),
            ),
            exp: Some(record.expires_at),
            iat: Some(record.issued_at),
            iss: Some(self.issuer.clone()),
        })
    }

    // ---- Bearer validation ----------------------------------------------

    /// Validate a bearer token presented to a protected resource.
    pub async fn validate_bearer(&self, token: &str) -> std::result::Result<AuthenticatedUser, OAuthError> {
        const OP: &str = "validate";

        let user = if self.sso.is_enabled() && looks_like_jwt(token) {
            let identity = self.sso.verify(token).await.map_err(|e| {
                debug!(error = %e, "Forwarded SSO token rejected");
                self.reject(OP, OAuthError::invalid_token("token is not valid"))
            })?;
            AuthenticatedUser {
                subject: identity.subject,
                email: identity.email,
                groups: identity.groups,
                sso_token: Some(token.to_string()),
                client_id: None,
                source: BearerSource::Sso,
            }
        } else {
            let record = self
                .store
                .get::<TokenRecord>(&keys::access(&hash_secret(token)))
                .await?
                .filter(|r| r.kind == TokenKind::Access && r.expires_at > now())
                .ok_or_else(|| self.reject(OP, OAuthError::invalid_token("token is invalid or expired")))?;
            if self.is_lineage_revoked(&record.lineage_id).await? {
                return Err(self.reject(OP, OAuthError::invalid_token("token has been revoked")));
            }
            AuthenticatedUser {
                subject: record.identity.subject,
                email: record.identity.email,
                groups: record.identity.groups,
                sso_token: record.identity.upstream_id_token,
                client_id: Some(record.client_id),
                source: BearerSource::Local,
            }
        };

        if !self.user_limiter.check(&anonymize_email(&user.email)) {
            self.metrics.record_security_event("rate_limited");
            return Err(self.reject(OP, OAuthError::rate_limited("too many requests for this user")));
        }
        Ok(user)
    }
}

fn provider_name(config: &OAuthConfig) -> &'static str {
    match config.provider.kind {
        crate::config::IdentityProviderKind::Dex => "dex",
        crate::config::IdentityProviderKind::Google => "google",
    }
}

async fn marker_lineage(store: &SecureStore, code: &str) -> String {
    store
        .get::<ConsumedMarker>(&keys::used_code(&hash_secret(code)))
        .await
        .ok()
        .flatten()
        .map(|m| m.lineage_id)
        .unwrap_or_default()
}

async fn marker_lineage_refresh(store: &SecureStore, token: &str) -> String {
    store
        .get::<ConsumedMarker>(&keys::used_refresh(&hash_secret(token)))
        .await
        .ok()
        .flatten()
        .map(|m| m.lineage_id)
        .unwrap_or_default()
}
