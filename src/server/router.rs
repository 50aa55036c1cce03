//! HTTP router and handlers

use std::sync::Arc;
use std::time::Duration;

use axum::{
    Json, Router,
    extract::{Request, State},
    http::{HeaderValue, Method, StatusCode, header},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tower_http::{
    catch_panic::CatchPanicLayer,
    cors::{AllowOrigin, CorsLayer},
    limit::RequestBodyLimitLayer,
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};
use tracing::warn;

use super::mcp::mcp_handler;
use crate::config::normalize_origin;
use crate::federation::Manager;
use crate::oauth::{AuthorizationServer, bearer_auth, oauth_routes};

/// Shared application state
pub struct AppState {
    /// Authorization server; `None` leaves `/mcp` unauthenticated
    pub oauth: Option<Arc<AuthorizationServer>>,
    /// Federation manager; `None` when federation is disabled
    pub federation: Option<Arc<Manager>>,
    /// Cancelled when shutdown starts
    pub shutdown: CancellationToken,
    /// Maximum request body size
    pub max_body_size: usize,
    /// Time allowed to produce a response
    pub request_timeout: Duration,
    /// CORS origins; empty disables CORS
    pub allowed_origins: Vec<String>,
    /// Send `Strict-Transport-Security`
    pub hsts: bool,
    /// Prometheus render handle
    #[cfg(feature = "metrics")]
    pub prometheus: Option<metrics_exporter_prometheus::PrometheusHandle>,
}

/// Create the router
pub fn create_router(state: Arc<AppState>) -> Router {
    let mcp = Router::new().route("/mcp", post(mcp_handler));
    let mcp = match &state.oauth {
        Some(server) => mcp.route_layer(middleware::from_fn_with_state(Arc::clone(server), bearer_auth)),
        None => mcp,
    };

    let mut router = Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .merge(mcp)
        .with_state(Arc::clone(&state));
    if let Some(server) = &state.oauth {
        router = router.merge(oauth_routes(Arc::clone(server)));
    }

    let hsts = state.hsts;
    let mut router = router
        .layer(RequestBodyLimitLayer::new(state.max_body_size))
        .layer(TimeoutLayer::with_status_code(StatusCode::REQUEST_TIMEOUT, state.request_timeout))
        .layer(middleware::from_fn(move |req: Request, next: Next| security_headers(hsts, req, next)));
    if let Some(cors) = cors_layer(&state.allowed_origins) {
        router = router.layer(cors);
    }
    router
        .layer(CatchPanicLayer::new())
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(TraceLayer::new_for_http())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
}

/// Exact-match origin list for browser-based MCP clients and the OAuth endpoints
fn cors_layer(origins: &[String]) -> Option<CorsLayer> {
    let allowed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|o| match normalize_origin(o) {
            Ok(origin) => HeaderValue::from_str(&origin).ok(),
            Err(e) => {
                warn!(error = %e, "Ignoring invalid CORS origin");
                None
            }
        })
        .collect();
    if allowed.is_empty() {
        return None;
    }
    Some(
        CorsLayer::new()
            .allow_origin(AllowOrigin::list(allowed))
            .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
            .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE])
            .expose_headers([header::WWW_AUTHENTICATE])
            .max_age(Duration::from_secs(3600)),
    )
}

async fn security_headers(hsts: bool, request: Request, next: Next) -> Response {
    let mut response = next.run(request).await;
    let headers = response.headers_mut();
    headers.insert(header::X_CONTENT_TYPE_OPTIONS, HeaderValue::from_static("nosniff"));
    headers.insert(header::X_FRAME_OPTIONS, HeaderValue::from_static("DENY"));
    headers.insert(header::REFERRER_POLICY, HeaderValue::from_static("strict-origin-when-cross-origin"));
    headers.insert(
        header::CONTENT_SECURITY_POLICY,
        HeaderValue::from_static("default-src 'none'; frame-ancestors 'none'; base-uri 'none'; form-action 'self'"),
    );
    if hsts {
        headers.insert(
            header::STRICT_TRANSPORT_SECURITY,
            HeaderValue::from_static("max-age=31536000; includeSubDomains"),
        );
    }
    response
}

/// Liveness
async fn healthz() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// Readiness: not shutting down and the federation manager still open
async fn readyz(State(state): State<Arc<AppState>>) -> Response {
    let shutting_down = state.shutdown.is_cancelled();
    let federation = state.federation.as_ref().map(|m| m.stats());
    let ready = !shutting_down && federation.as_ref().is_none_or(|s| !s.closed);

    let status = if ready { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (
        status,
        Json(json!({
            "status": if ready { "ready" } else { "not_ready" },
            "checks": {
                "ready": ready,
                "shutdown": shutting_down,
            },
            "federation": federation,
        })),
    )
        .into_response()
}

#[cfg(feature = "metrics")]
async fn metrics(State(state): State<Arc<AppState>>) -> Response {
    match &state.prometheus {
        Some(handle) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            handle.render(),
        )
            .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

#[cfg(not(feature = "metrics"))]
async fn metrics(State(_state): State<Arc<AppState>>) -> Response {
    StatusCode::NOT_FOUND.into_response()
}
