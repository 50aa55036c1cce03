//! OAuth 2.1 protocol errors (RFC 6749 §5.2, RFC 7591 §3.2.2).

use std::fmt;

use axum::http::StatusCode;

use super::store::StorageError;

/// Standard `error` codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// Malformed or missing parameter
    InvalidRequest,
    /// Client authentication failed or client unknown
    InvalidClient,
    /// Code or refresh token invalid, expired, revoked or replayed
    InvalidGrant,
    /// Client may not use this grant
    UnauthorizedClient,
    /// Grant type not supported
    UnsupportedGrantType,
    /// Response type not supported
    UnsupportedResponseType,
    /// Scope invalid
    InvalidScope,
    /// Resource owner or server denied the request
    AccessDenied,
    /// Redirect URI rejected at registration
    InvalidRedirectUri,
    /// Client metadata rejected at registration
    InvalidClientMetadata,
    /// Bearer token missing, invalid or expired
    InvalidToken,
    /// Too many requests from this source
    RateLimited,
    /// Dependency failed
    TemporarilyUnavailable,
    /// Unexpected failure
    ServerError,
}

impl ErrorCode {
    /// Wire value
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InvalidRequest => "invalid_request",
            Self::InvalidClient => "invalid_client",
            Self::InvalidGrant => "invalid_grant",
            Self::UnauthorizedClient => "unauthorized_client",
            Self::UnsupportedGrantType => "unsupported_grant_type",
            Self::UnsupportedResponseType => "unsupported_response_type",
            Self::InvalidScope => "invalid_scope",
            Self::AccessDenied => "access_denied",
            Self::InvalidRedirectUri => "invalid_redirect_uri",
            Self::InvalidClientMetadata => "invalid_client_metadata",
            Self::InvalidToken => "invalid_token",
            Self::RateLimited => "rate_limited",
            Self::TemporarilyUnavailable => "temporarily_unavailable",
            Self::ServerError => "server_error",
        }
    }

    /// HTTP status used when the error is returned directly
    #[must_use]
    pub fn status(self) -> StatusCode {
        match self {
            Self::InvalidClient | Self::InvalidToken => StatusCode::UNAUTHORIZED,
            Self::AccessDenied => StatusCode::FORBIDDEN,
            Self::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            Self::TemporarilyUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            Self::ServerError => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::BAD_REQUEST,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An OAuth error with a user-facing description
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{code}: {description}")]
pub struct OAuthError {
    /// Error code
    pub code: ErrorCode,
    /// Human-readable description (safe to return to the client)
    pub description: String,
}

macro_rules! constructors {
    ($($name:ident => $code:ident),* $(,)?) => {
        impl OAuthError {
            $(
                #[doc = concat!("`", stringify!($name), "` error")]
                pub fn $name(description: impl Into<String>) -> Self {
                    Self { code: ErrorCode::$code, description: description.into() }
                }
            )*
        }
    };
}

constructors! {
    invalid_request => InvalidRequest,
    invalid_client => InvalidClient,
    invalid_grant => InvalidGrant,
    unauthorized_client => UnauthorizedClient,
    unsupported_grant_type => UnsupportedGrantType,
    unsupported_response_type => UnsupportedResponseType,
    access_denied => AccessDenied,
    invalid_redirect_uri => InvalidRedirectUri,
    invalid_client_metadata => InvalidClientMetadata,
    invalid_token => InvalidToken,
    rate_limited => RateLimited,
    temporarily_unavailable => TemporarilyUnavailable,
    server_error => ServerError,
}

impl From<StorageError> for OAuthError {
    fn from(e: StorageError) -> Self {
        tracing::error!(error = %e, "Credential store failure");
        if e.is_transient() {
            Self::temporarily_unavailable("credential store unavailable")
        } else {
            Self::server_error("internal storage error")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_uses_wire_code() {
        let err = OAuthError::invalid_grant("authorization code already used");
        assert_eq!(err.to_string(), "invalid_grant: authorization code already used");
        assert_eq!(err.code.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn storage_errors_do_not_leak_details() {
        let err: OAuthError = StorageError::Unavailable("10.0.0.7:6379 refused".to_string()).into();
        assert_eq!(err.code, ErrorCode::TemporarilyUnavailable);
        assert!(!err.description.contains("10.0.0.7"));
    }
}
