//! HTTP handlers for the authorization server.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET` | `/.well-known/oauth-authorization-server` | RFC 8414 metadata |
//! | `GET` | `/.well-known/oauth-protected-resource` | RFC 9728 metadata |
//! | `POST` | `/oauth/register` | Dynamic client registration |
//! | `GET` | `/oauth/authorize` | Start an authorization (redirects upstream) |
//! | `GET` | `/oauth/callback` | Upstream IdP callback |
//! | `POST` | `/oauth/token` | Code exchange and refresh |
//! | `POST` | `/oauth/revoke` | RFC 7009 revocation |
//! | `POST` | `/oauth/introspect` | RFC 7662 introspection |
//!
//! Errors use the RFC 6749 §5.2 body: `{"error": ..., "error_description": ...}`.

use std::convert::Infallible;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use axum::{
    Form, Json, Router,
    extract::{ConnectInfo, FromRequestParts, Query, State},
    http::{HeaderMap, HeaderValue, StatusCode, header, request::Parts},
    response::{IntoResponse, Redirect, Response},
    routing::{get, post},
};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::Deserialize;
use serde_json::json;
use tracing::warn;

use super::error::{ErrorCode, OAuthError};
use super::metadata::{AuthorizationServerMetadata, ProtectedResourceMetadata};
use super::model::{AuthorizeRequest, RegistrationRequest, TokenRequest};
use super::server::{AuthorizationServer, AuthorizeError, ClientCredentials, error_redirect_url};

// ── Request types ─────────────────────────────────────────────────────────

/// Query of `GET /oauth/callback`
#[derive(Debug, Deserialize)]
pub struct CallbackParams {
    /// Upstream authorization code
    #[serde(default)]
    pub code: Option<String>,
    /// Upstream state
    #[serde(default)]
    pub state: Option<String>,
    /// Upstream error
    #[serde(default)]
    pub error: Option<String>,
}

/// Form body of `POST /oauth/revoke` and `POST /oauth/introspect`
#[derive(Debug, Deserialize)]
pub struct TokenParams {
    /// Token to act on
    #[serde(default)]
    pub token: String,
    /// Ignored; both kinds are looked up
    #[serde(default)]
    pub token_type_hint: Option<String>,
    /// `client_secret_post` credentials
    #[serde(default)]
    pub client_id: Option<String>,
    /// `client_secret_post` credentials
    #[serde(default)]
    pub client_secret: Option<String>,
}

// ── Route builder ─────────────────────────────────────────────────────────

/// Build the OAuth routes.
///
/// Mounted without the bearer middleware: these endpoints authenticate callers
/// themselves (registration token, client credentials) or are public.
pub fn oauth_routes(server: Arc<AuthorizationServer>) -> Router {
    Router::new()
        .route("/.well-known/oauth-authorization-server", get(server_metadata))
        .route("/.well-known/oauth-protected-resource", get(resource_metadata))
        .route("/.well-known/oauth-protected-resource/mcp", get(resource_metadata))
        .route("/oauth/register", post(register))
        .route("/oauth/authorize", get(authorize))
        .route("/oauth/callback", get(callback))
        .route("/oauth/token", post(token))
        .route("/oauth/revoke", post(revoke))
        .route("/oauth/introspect", post(introspect))
        .with_state(server)
}

// ── Extractors ────────────────────────────────────────────────────────────

/// Caller address used for rate limiting and the registration cap.
///
/// The socket peer, unless the peer is a configured trusted proxy; then the
/// forwarded headers name the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientIp(pub String);

impl FromRequestParts<Arc<AuthorizationServer>> for ClientIp {
    type Rejection = Infallible;

    async fn from_request_parts(
        parts: &mut Parts,
        server: &Arc<AuthorizationServer>,
    ) -> Result<Self, Self::Rejection> {
        let peer = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip());
        let ip = resolve_client_ip(peer, &parts.headers, server.trusted_proxies())
            .map_or_else(|| "unknown".to_string(), |ip| ip.to_string());
        Ok(Self(ip))
    }
}

/// Resolve the client address behind `peer`.
///
/// Forwarded headers are read only when `peer` is inside `trusted`. The
/// `X-Forwarded-For` chain is walked from the right and the first hop that is
/// not itself a trusted proxy wins; `X-Real-IP` is the fallback.
pub fn resolve_client_ip(peer: Option<IpAddr>, headers: &HeaderMap, trusted: &[ipnet::IpNet]) -> Option<IpAddr> {
    let peer = peer?;
    let is_trusted = |ip: &IpAddr| trusted.iter().any(|net| net.contains(ip));
    if !is_trusted(&peer) {
        return Some(peer);
    }

    let chain: Vec<IpAddr> = headers
        .get_all("x-forwarded-for")
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|hop| hop.trim().parse().ok())
        .collect();
    if let Some(client) = chain.iter().rev().copied().find(|ip| !is_trusted(ip)) {
        return Some(client);
    }
    if let Some(first) = chain.first() {
        return Some(*first);
    }

    headers
        .get("x-real-ip")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
        .or(Some(peer))
}

/// `Authorization: Bearer <token>`
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer ").or_else(|| v.strip_prefix("bearer ")))
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

/// `Authorization: Basic base64(client_id:client_secret)`
fn basic_credentials(headers: &HeaderMap) -> Option<ClientCredentials> {
    let encoded = headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Basic ")?;
    let decoded = String::from_utf8(STANDARD.decode(encoded.trim()).ok()?).ok()?;
    let (id, secret) = decoded.split_once(':')?;
    Some(ClientCredentials {
        client_id: Some(id.to_string()),
        client_secret: Some(secret.to_string()),
    })
}

fn credentials(headers: &HeaderMap, client_id: Option<String>, client_secret: Option<String>) -> ClientCredentials {
    basic_credentials(headers).unwrap_or(ClientCredentials {
        client_id,
        client_secret,
    })
}

// ── Responses ─────────────────────────────────────────────────────────────

impl IntoResponse for OAuthError {
    fn into_response(self) -> Response {
        let status = self.code.status();
        let mut response = (
            status,
            Json(json!({"error": self.code.as_str(), "error_description": self.description})),
        )
            .into_response();
        let headers = response.headers_mut();
        headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
        match self.code {
            ErrorCode::InvalidClient => {
                headers.insert(header::WWW_AUTHENTICATE, HeaderValue::from_static("Basic"));
            }
            ErrorCode::RateLimited => {
                headers.insert(header::RETRY_AFTER, HeaderValue::from_static("60"));
            }
            _ => {}
        }
        response
    }
}

fn no_store<T: IntoResponse>(status: StatusCode, body: T) -> Response {
    (status, [(header::CACHE_CONTROL, "no-store"), (header::PRAGMA, "no-cache")], body).into_response()
}

fn authorize_error(server: &AuthorizationServer, err: AuthorizeError) -> Response {
    match err {
        AuthorizeError::Direct(e) => e.into_response(),
        AuthorizeError::Redirect {
            redirect_uri,
            error,
            state,
        } => Redirect::to(&error_redirect_url(&redirect_uri, &error, state.as_deref(), server.issuer())).into_response(),
    }
}

// ── Handlers ──────────────────────────────────────────────────────────────

async fn server_metadata(State(server): State<Arc<AuthorizationServer>>) -> impl IntoResponse {
    Json(AuthorizationServerMetadata::for_issuer(
        server.issuer(),
        server.config().cimd.enabled,
    ))
}

async fn resource_metadata(State(server): State<Arc<AuthorizationServer>>) -> impl IntoResponse {
    Json(ProtectedResourceMetadata::for_issuer(server.issuer()))
}

/// `POST /oauth/register`
async fn register(
    State(server): State<Arc<AuthorizationServer>>,
    ClientIp(ip): ClientIp,
    headers: HeaderMap,
    Json(body): Json<RegistrationRequest>,
) -> Response {
    if let Err(e) = server.check_ip_rate(&ip, "register") {
        return e.into_response();
    }
    match server.register(body, &ip, bearer_token(&headers)).await {
        Ok(response) => no_store(StatusCode::CREATED, Json(response)),
        Err(e) => e.into_response(),
    }
}

/// `GET /oauth/authorize`
async fn authorize(
    State(server): State<Arc<AuthorizationServer>>,
    ClientIp(ip): ClientIp,
    Query(params): Query<AuthorizeRequest>,
) -> Response {
    if let Err(e) = server.check_ip_rate(&ip, "authorize") {
        return e.into_response();
    }
    match server.authorize(params).await {
        Ok(upstream) => Redirect::to(&upstream).into_response(),
        Err(e) => authorize_error(&server, e),
    }
}

/// `GET /oauth/callback`
async fn callback(
    State(server): State<Arc<AuthorizationServer>>,
    ClientIp(ip): ClientIp,
    Query(params): Query<CallbackParams>,
) -> Response {
    if let Err(e) = server.check_ip_rate(&ip, "callback") {
        return e.into_response();
    }
    let Some(state) = params.state.as_deref().filter(|s| !s.is_empty()) else {
        warn!("Callback without state");
        return OAuthError::invalid_request("state is required").into_response();
    };
    match server
        .callback(state, params.code.as_deref(), params.error.as_deref())
        .await
    {
        Ok(location) => Redirect::to(&location).into_response(),
        Err(e) => authorize_error(&server, e),
    }
}

/// `POST /oauth/token`
async fn token(
    State(server): State<Arc<AuthorizationServer>>,
    ClientIp(ip): ClientIp,
    headers: HeaderMap,
    Form(body): Form<TokenRequest>,
) -> Response {
    if let Err(e) = server.check_ip_rate(&ip, "token") {
        return e.into_response();
    }
    let creds = basic_credentials(&headers).unwrap_or_default();
    match server.token(body, creds).await {
        Ok(tokens) => no_store(StatusCode::OK, Json(tokens)),
        Err(e) => e.into_response(),
    }
}

/// `POST /oauth/revoke`
async fn revoke(
    State(server): State<Arc<AuthorizationServer>>,
    ClientIp(ip): ClientIp,
    headers: HeaderMap,
    Form(body): Form<TokenParams>,
) -> Response {
    if let Err(e) = server.check_ip_rate(&ip, "revoke") {
        return e.into_response();
    }
    let creds = credentials(&headers, body.client_id, body.client_secret);
    if body.token.is_empty() {
        return OAuthError::invalid_request("token is required").into_response();
    }
    match server.revoke(&body.token, &creds).await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => e.into_response(),
    }
}

/// `POST /oauth/introspect`
async fn introspect(
    State(server): State<Arc<AuthorizationServer>>,
    ClientIp(ip): ClientIp,
    headers: HeaderMap,
    Form(body): Form<TokenParams>,
) -> Response {
    if let Err(e) = server.check_ip_rate(&ip, "introspect") {
        return e.into_response();
    }
    let creds = basic_credentials(&headers).unwrap_or(ClientCredentials {
        client_id: body.client_id,
        client_secret: body.client_secret,
    });
    if let Err(e) = server.authorize_introspection(bearer_token(&headers), &creds).await {
        return e.into_response();
    }
    match server.introspect(&body.token).await {
        Ok(response) => no_store(StatusCode::OK, Json(response)),
        Err(e) => e.into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn proxies() -> Vec<ipnet::IpNet> {
        vec!["10.0.0.0/8".parse().unwrap()]
    }

    #[test]
    fn untrusted_peer_ignores_forwarded_headers() {
        // GIVEN: a direct caller claiming another address
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("198.51.100.9"));
        headers.insert("x-real-ip", HeaderValue::from_static("198.51.100.10"));

        // THEN: the socket peer wins, with or without configured proxies
        let peer = Some(ip("203.0.113.7"));
        assert_eq!(resolve_client_ip(peer, &headers, &proxies()), peer);
        assert_eq!(resolve_client_ip(peer, &headers, &[]), peer);
    }

    #[test]
    fn trusted_peer_yields_rightmost_untrusted_hop() {
        // GIVEN: a spoofed first hop, the real client, then an inner proxy
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-forwarded-for",
            HeaderValue::from_static("192.0.2.1, 203.0.113.7, 10.0.0.2"),
        );

        // THEN: the hop appended by the outermost trusted proxy
        assert_eq!(
            resolve_client_ip(Some(ip("10.0.0.1")), &headers, &proxies()),
            Some(ip("203.0.113.7"))
        );
    }

    #[test]
    fn trusted_peer_falls_back_to_real_ip_then_peer() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("not-an-ip"));
        headers.insert("x-real-ip", HeaderValue::from_static("198.51.100.1"));
        let peer = Some(ip("10.0.0.1"));
        assert_eq!(resolve_client_ip(peer, &headers, &proxies()), Some(ip("198.51.100.1")));
        assert_eq!(resolve_client_ip(peer, &HeaderMap::new(), &proxies()), peer);
    }

    #[test]
    fn missing_peer_is_unknown() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("198.51.100.9"));
        assert_eq!(resolve_client_ip(None, &headers, &proxies()), None);
    }

    #[test]
    fn basic_credentials_are_decoded() {
        let mut headers = HeaderMap::new();
        let value = format!("Basic {}", STANDARD.encode("client-1:s3cret"));
        headers.insert(header::AUTHORIZATION, HeaderValue::from_str(&value).unwrap());
        let creds = basic_credentials(&headers).unwrap();
        assert_eq!(creds.client_id.as_deref(), Some("client-1"));
        assert_eq!(creds.client_secret.as_deref(), Some("s3cret"));
        assert!(bearer_token(&headers).is_none());
    }

    #[test]
    fn errors_render_rfc6749_body() {
        let response = OAuthError::invalid_client("client authentication failed").into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(response.headers()[header::WWW_AUTHENTICATE], "Basic");
        assert_eq!(response.headers()[header::CACHE_CONTROL], "no-store");
    }
}
