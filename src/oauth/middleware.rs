//! Bearer authentication for protected routes.
//!
//! Validates the bearer (locally issued or SSO-trusted), builds the
//! [`RequestContext`] federation consumes and stores it in the request
//! extensions. Failures return 401 with a `WWW-Authenticate` challenge
//! pointing at the protected-resource metadata.

use std::sync::Arc;

use axum::{
    Json,
    body::Body,
    extract::State,
    http::{HeaderMap, HeaderValue, Request, StatusCode, header},
    middleware::Next,
    response::{IntoResponse, Response},
};
use serde_json::json;
use tracing::{debug, warn};

use super::error::ErrorCode;
use super::handler::bearer_token;
use super::metadata::ProtectedResourceMetadata;
use super::model::AuthenticatedUser;
use super::server::AuthorizationServer;
use crate::federation::RequestContext;
use crate::federation::validation::{UserInfo, anonymize_email};

/// Trace id from W3C `traceparent` (`00-<trace-id>-<span-id>-<flags>`) or `x-trace-id`
#[must_use]
pub fn trace_id(headers: &HeaderMap) -> Option<String> {
    headers
        .get("traceparent")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split('-').nth(1))
        .filter(|id| id.len() == 32 && id.bytes().all(|b| b.is_ascii_hexdigit()))
        .map(str::to_string)
        .or_else(|| {
            headers
                .get("x-trace-id")
                .and_then(|v| v.to_str().ok())
                .map(str::trim)
                .filter(|id| !id.is_empty() && id.len() <= 128 && id.bytes().all(|b| b.is_ascii_graphic()))
                .map(str::to_string)
        })
}

/// Request context for an authenticated user
#[must_use]
pub fn request_context(user: AuthenticatedUser, trace_id: Option<String>) -> RequestContext {
    RequestContext {
        user: UserInfo {
            email: user.email,
            groups: user.groups,
            extra: Default::default(),
        },
        sso_token: user.sso_token,
        trace_id,
    }
}

/// Authentication middleware
pub async fn bearer_auth(
    State(server): State<Arc<AuthorizationServer>>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    let path = request.uri().path().to_string();

    let Some(token) = bearer_token(request.headers()) else {
        debug!(path = %path, "Missing bearer token");
        return unauthorized(server.issuer(), None);
    };

    match server.validate_bearer(token).await {
        Ok(user) => {
            debug!(user_hash = %anonymize_email(&user.email), path = %path, "Authenticated request");
            let ctx = request_context(user, trace_id(request.headers()));
            request.extensions_mut().insert(ctx);
            next.run(request).await
        }
        Err(e) if e.code == ErrorCode::RateLimited => {
            warn!(path = %path, "User rate limit exceeded");
            e.into_response()
        }
        Err(e) if e.code == ErrorCode::TemporarilyUnavailable || e.code == ErrorCode::ServerError => {
            e.into_response()
        }
        Err(e) => {
            debug!(path = %path, error = %e, "Bearer rejected");
            unauthorized(server.issuer(), Some(&e.description))
        }
    }
}

/// 401 with an RFC 9728 `resource_metadata` challenge
fn unauthorized(issuer: &str, description: Option<&str>) -> Response {
    let mut challenge = format!(
        "Bearer resource_metadata=\"{}\"",
        ProtectedResourceMetadata::document_url(issuer)
    );
    if description.is_some() {
        challenge.push_str(", error=\"invalid_token\"");
    }
    let mut response = (
        StatusCode::UNAUTHORIZED,
        Json(json!({
            "error": "invalid_token",
            "error_description": description.unwrap_or("bearer token required"),
        })),
    )
        .into_response();
    if let Ok(value) = HeaderValue::from_str(&challenge) {
        response.headers_mut().insert(header::WWW_AUTHENTICATE, value);
    }
    response
}
