//! Discovery documents
//!
//! RFC 8414 (OAuth Authorization Server Metadata) and
//! RFC 9728 (OAuth Protected Resource Metadata).

use serde::{Deserialize, Serialize};

use super::tokens::PKCE_METHOD_S256;

/// OAuth Authorization Server Metadata (RFC 8414)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorizationServerMetadata {
    /// Authorization server issuer URL
    pub issuer: String,

    /// Authorization endpoint URL
    pub authorization_endpoint: String,

    /// Token endpoint URL
    pub token_endpoint: String,

    /// Token revocation endpoint
    pub revocation_endpoint: String,

    /// Token introspection endpoint
    pub introspection_endpoint: String,

    /// Dynamic client registration endpoint
    pub registration_endpoint: String,

    /// Supported grant types
    pub grant_types_supported: Vec<String>,

    /// Supported response types
    pub response_types_supported: Vec<String>,

    /// Supported token endpoint auth methods
    pub token_endpoint_auth_methods_supported: Vec<String>,

    /// Supported PKCE code challenge methods
    pub code_challenge_methods_supported: Vec<String>,

    /// RFC 9207 `iss` on authorization responses
    pub authorization_response_iss_parameter_supported: bool,

    /// HTTPS client identifiers resolved from metadata documents
    pub client_id_metadata_document_supported: bool,
}

impl AuthorizationServerMetadata {
    /// Metadata for an issuer rooted at `base_url`
    #[must_use]
    pub fn for_issuer(base_url: &str, cimd_enabled: bool) -> Self {
        let issuer = base_url.trim_end_matches('/');
        let strings = |v: &[&str]| v.iter().map(|s| (*s).to_string()).collect();
        Self {
            issuer: issuer.to_string(),
            authorization_endpoint: format!("{issuer}/oauth/authorize"),
            token_endpoint: format!("{issuer}/oauth/token"),
            revocation_endpoint: format!("{issuer}/oauth/revoke"),
            introspection_endpoint: format!("{issuer}/oauth/introspect"),
            registration_endpoint: format!("{issuer}/oauth/register"),
            grant_types_supported: strings(&["authorization_code", "refresh_token"]),
            response_types_supported: strings(&["code"]),
            token_endpoint_auth_methods_supported: strings(&["none", "client_secret_basic", "client_secret_post"]),
            code_challenge_methods_supported: strings(&[PKCE_METHOD_S256]),
            authorization_response_iss_parameter_supported: true,
            client_id_metadata_document_supported: cimd_enabled,
        }
    }
}

/// OAuth Protected Resource Metadata (RFC 9728)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtectedResourceMetadata {
    /// Protected resource identifier
    pub resource: String,

    /// Authorization servers that can issue tokens for this resource
    pub authorization_servers: Vec<String>,

    /// Supported bearer token methods
    pub bearer_methods_supported: Vec<String>,
}

impl ProtectedResourceMetadata {
    /// The MCP endpoint protected by the local issuer
    #[must_use]
    pub fn for_issuer(base_url: &str) -> Self {
        let issuer = base_url.trim_end_matches('/');
        Self {
            resource: format!("{issuer}/mcp"),
            authorization_servers: vec![issuer.to_string()],
            bearer_methods_supported: vec!["header".to_string()],
        }
    }

    /// URL of this document, advertised in `WWW-Authenticate`
    #[must_use]
    pub fn document_url(base_url: &str) -> String {
        format!("{}/.well-known/oauth-protected-resource", base_url.trim_end_matches('/'))
    }
}
