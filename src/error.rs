//! Error types for mcp-kubernetes

use std::io;

use thiserror::Error;

use crate::federation::FederationError;
use crate::oauth::OAuthError;
use crate::oauth::store::StorageError;

/// Result type alias for mcp-kubernetes
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level errors surfaced by startup and the serve loop.
///
/// Per-request failures stay in their module error types ([`OAuthError`],
/// [`FederationError`]) and are mapped to HTTP responses at the edge.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error (fatal at startup)
    #[error("Configuration error: {0}")]
    Config(String),

    /// OAuth authorization server error
    #[error("OAuth error: {0}")]
    OAuth(#[from] OAuthError),

    /// Federation layer error
    #[error("Federation error: {0}")]
    Federation(#[from] FederationError),

    /// Credential store error
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Server shutdown
    #[error("Server shutdown")]
    Shutdown,

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether this error should abort the process with a configuration exit code.
    #[must_use]
    pub fn is_config(&self) -> bool {
        matches!(self, Self::Config(_))
    }
}
