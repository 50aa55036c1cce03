//! Records persisted by the authorization server and its wire types.

use serde::{Deserialize, Serialize};

/// Store key namespaces
pub(crate) mod keys {
    pub(crate) fn client(client_id: &str) -> String {
        format!("client:{client_id}")
    }
    pub(crate) fn pending(upstream_state: &str) -> String {
        format!("pending:{upstream_state}")
    }
    pub(crate) fn code(hash: &str) -> String {
        format!("code:{hash}")
    }
    pub(crate) fn used_code(hash: &str) -> String {
        format!("used-code:{hash}")
    }
    pub(crate) fn access(hash: &str) -> String {
        format!("access:{hash}")
    }
    pub(crate) fn refresh(hash: &str) -> String {
        format!("refresh:{hash}")
    }
    pub(crate) fn used_refresh(hash: &str) -> String {
        format!("used-refresh:{hash}")
    }
    pub(crate) fn lineage_revoked(lineage_id: &str) -> String {
        format!("lineage-revoked:{lineage_id}")
    }
}

/// How a client earned its registration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrustClass {
    /// Presented the registration access token
    RegistrationToken,
    /// Redirect URIs use only a deployment-trusted custom scheme
    TrustedScheme,
    /// Identified by a client metadata document URL
    Cimd,
    /// Public registration mode
    Public,
}

impl TrustClass {
    /// Label value
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RegistrationToken => "registration_token",
            Self::TrustedScheme => "trusted_scheme",
            Self::Cimd => "cimd",
            Self::Public => "public",
        }
    }
}

/// A registered (or metadata-document-resolved) client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientRecord {
    /// Client identifier
    pub client_id: String,
    /// SHA-256 hex of the secret; `None` for public clients
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_secret_hash: Option<String>,
    /// Display name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_name: Option<String>,
    /// Registered redirect URIs
    pub redirect_uris: Vec<String>,
    /// Trust class
    pub trust: TrustClass,
    /// `none`, `client_secret_basic` or `client_secret_post`
    pub token_endpoint_auth_method: String,
    /// Seconds since epoch
    pub registered_at: i64,
}

impl ClientRecord {
    /// Whether the client must authenticate at the token endpoint
    #[must_use]
    pub fn is_confidential(&self) -> bool {
        self.client_secret_hash.is_some()
    }
}

/// Identity carried through codes and tokens
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenIdentity {
    /// Upstream `sub`
    pub subject: String,
    /// E-mail
    pub email: String,
    /// Groups
    #[serde(default)]
    pub groups: Vec<String>,
    /// Upstream ID token, forwarded in SSO passthrough mode
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upstream_id_token: Option<String>,
    /// Upstream refresh token
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upstream_refresh_token: Option<String>,
}

/// An authorization request waiting for the upstream callback
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingAuthorization {
    /// Downstream client
    pub client_id: String,
    /// Redirect URI the code goes back to
    pub redirect_uri: String,
    /// Downstream PKCE challenge
    pub code_challenge: String,
    /// Always `S256`
    pub code_challenge_method: String,
    /// Downstream `state`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    /// Requested scope
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    /// Verifier for the upstream PKCE pair
    pub upstream_verifier: String,
}

/// Issued, not yet consumed authorization code
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthorizationCodeRecord {
    /// Owning client
    pub client_id: String,
    /// Redirect URI used in the authorization request
    pub redirect_uri: String,
    /// PKCE challenge
    pub code_challenge: String,
    /// PKCE method
    pub code_challenge_method: String,
    /// Granted scope
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    /// Authenticated user
    pub identity: TokenIdentity,
    /// Lineage every token derived from this code belongs to
    pub lineage_id: String,
    /// Seconds since epoch
    pub expires_at: i64,
}

/// Access or refresh token kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenKind {
    /// Bearer access token
    Access,
    /// Refresh token
    Refresh,
}

/// Stored token, keyed by the hash of its opaque value
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenRecord {
    /// Access or refresh
    pub kind: TokenKind,
    /// Client the token was issued to
    pub client_id: String,
    /// Granted scope
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    /// Authenticated user
    pub identity: TokenIdentity,
    /// Lineage (shared by every token descended from one code)
    pub lineage_id: String,
    /// Hash of the code or refresh token this token was derived from
    pub parent: String,
    /// Seconds since epoch
    pub issued_at: i64,
    /// Seconds since epoch
    pub expires_at: i64,
}

/// Marker left behind by a consumed code or rotated refresh token
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumedMarker {
    /// Lineage to revoke if the value is presented again
    pub lineage_id: String,
}

/// RFC 7591 registration request
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegistrationRequest {
    /// Redirect URIs
    #[serde(default)]
    pub redirect_uris: Vec<String>,
    /// Display name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_name: Option<String>,
    /// Requested auth method
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_endpoint_auth_method: Option<String>,
    /// Metadata document URL, for clients identified by CIMD
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    /// Requested grant types
    #[serde(default)]
    pub grant_types: Vec<String>,
}

/// RFC 7591 registration response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrationResponse {
    /// Client identifier
    pub client_id: String,
    /// Secret, returned once
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
    /// Seconds since epoch
    pub client_id_issued_at: i64,
    /// `0` means the secret never expires
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_secret_expires_at: Option<i64>,
    /// Redirect URIs
    pub redirect_uris: Vec<String>,
    /// Display name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_name: Option<String>,
    /// Auth method
    pub token_endpoint_auth_method: String,
    /// Grant types
    pub grant_types: Vec<String>,
    /// Response types
    pub response_types: Vec<String>,
}

/// Parameters of `GET /oauth/authorize`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthorizeRequest {
    /// Must be `code`
    #[serde(default)]
    pub response_type: String,
    /// Client identifier (registered ID or metadata document URL)
    #[serde(default)]
    pub client_id: String,
    /// Redirect URI
    #[serde(default)]
    pub redirect_uri: Option<String>,
    /// Scope
    #[serde(default)]
    pub scope: Option<String>,
    /// Opaque client state
    #[serde(default)]
    pub state: Option<String>,
    /// PKCE challenge
    #[serde(default)]
    pub code_challenge: Option<String>,
    /// PKCE method
    #[serde(default)]
    pub code_challenge_method: Option<String>,
}

/// Form body of `POST /oauth/token`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TokenRequest {
    /// `authorization_code` or `refresh_token`
    #[serde(default)]
    pub grant_type: String,
    /// Authorization code
    #[serde(default)]
    pub code: Option<String>,
    /// Redirect URI from the authorization request
    #[serde(default)]
    pub redirect_uri: Option<String>,
    /// PKCE verifier
    #[serde(default)]
    pub code_verifier: Option<String>,
    /// Refresh token
    #[serde(default)]
    pub refresh_token: Option<String>,
    /// Client ID (public clients, `client_secret_post`)
    #[serde(default)]
    pub client_id: Option<String>,
    /// Client secret (`client_secret_post`)
    #[serde(default)]
    pub client_secret: Option<String>,
}

/// Successful token response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenResponse {
    /// Opaque access token
    pub access_token: String,
    /// Always `Bearer`
    pub token_type: String,
    /// Access token lifetime in seconds
    pub expires_in: u64,
    /// Rotating refresh token
    pub refresh_token: String,
    /// Granted scope
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
}

/// RFC 7662 introspection response
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntrospectionResponse {
    /// Whether the token is currently valid
    pub active: bool,
    /// Scope
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    /// Client
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    /// User e-mail
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    /// Subject
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub: Option<String>,
    /// `access_token` or `refresh_token`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_type: Option<String>,
    /// Expiry
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exp: Option<i64>,
    /// Issued at
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iat: Option<i64>,
    /// Issuer
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iss: Option<String>,
}

impl IntrospectionResponse {
    /// `{"active": false}`
    #[must_use]
    pub fn inactive() -> Self {
        Self::default()
    }
}

/// Where a validated bearer came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BearerSource {
    /// Issued by this server
    Local,
    /// Upstream ID token with a trusted audience
    Sso,
}

/// Identity behind a validated bearer token
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticatedUser {
    /// Subject
    pub subject: String,
    /// E-mail
    pub email: String,
    /// Groups
    pub groups: Vec<String>,
    /// Token to forward in SSO passthrough mode
    pub sso_token: Option<String>,
    /// Client the token was issued to (local tokens only)
    pub client_id: Option<String>,
    /// Origin of the bearer
    pub source: BearerSource,
}
