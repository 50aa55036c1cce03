//! Upstream identity providers (Dex, Google).
//!
//! The authorization server does not authenticate users itself. `/oauth/authorize`
//! sends the browser to the upstream provider and `/oauth/callback` exchanges
//! the upstream code for an ID token, which is verified and turned into the
//! identity the downstream tokens are issued for.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use tracing::debug;
use url::Url;

use super::sso::{IdTokenVerifier, SsoError};
use crate::config::{IdentityProviderKind, ProviderConfig};

const GOOGLE_ISSUER: &str = "https://accounts.google.com";
const GOOGLE_AUTH_ENDPOINT: &str = "https://accounts.google.com/o/oauth2/v2/auth";
const GOOGLE_TOKEN_ENDPOINT: &str = "https://oauth2.googleapis.com/token";

const DEX_SCOPES: &[&str] = &["openid", "profile", "email", "groups", "offline_access"];
const GOOGLE_SCOPES: &[&str] = &[
    "openid",
    "email",
    "profile",
    "https://www.googleapis.com/auth/cloud-platform",
];

/// Upstream provider failures
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    /// Transport failure
    #[error("upstream request failed: {0}")]
    Request(String),
    /// Provider rejected the grant
    #[error("upstream token endpoint returned HTTP {status}: {body}")]
    Rejected {
        /// HTTP status
        status: u16,
        /// Response body (provider error JSON)
        body: String,
    },
    /// Response has no ID token
    #[error("upstream response did not include an id_token")]
    MissingIdToken,
    /// ID token failed verification
    #[error("upstream id_token rejected: {0}")]
    IdToken(#[from] SsoError),
    /// Provider could not be configured
    #[error("identity provider configuration: {0}")]
    Config(String),
}

/// Authenticated upstream user
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamIdentity {
    /// `sub`
    pub subject: String,
    /// `email`
    pub email: String,
    /// `groups`
    pub groups: Vec<String>,
    /// Raw ID token, forwarded to clusters in SSO passthrough mode
    pub id_token: String,
    /// Upstream refresh token, if the provider issued one
    pub refresh_token: Option<String>,
    /// ID token expiry (seconds since epoch)
    pub expires_at: i64,
}

/// Upstream identity provider seam
#[async_trait]
pub trait IdentityProvider: Send + Sync + 'static {
    /// Short provider name for logs
    fn name(&self) -> &'static str;

    /// URL the browser is sent to
    fn authorization_url(&self, state: &str, code_challenge: &str, redirect_uri: &str) -> String;

    /// Exchange an upstream authorization code
    async fn exchange_code(
        &self,
        code: &str,
        code_verifier: &str,
        redirect_uri: &str,
    ) -> Result<UpstreamIdentity, ProviderError>;

    /// Refresh the upstream session
    async fn refresh(&self, refresh_token: &str) -> Result<UpstreamIdentity, ProviderError>;
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    id_token: Option<String>,
    #[serde(default)]
    refresh_token: Option<String>,
}

/// OIDC provider speaking the authorization-code + PKCE flow
pub struct OidcProvider {
    kind: IdentityProviderKind,
    client_id: String,
    client_secret: String,
    authorization_endpoint: String,
    token_endpoint: String,
    connector_id: Option<String>,
    scopes: &'static [&'static str],
    http: Client,
    verifier: Arc<IdTokenVerifier>,
}

impl std::fmt::Debug for OidcProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OidcProvider")
            .field("kind", &self.kind)
            .field("client_id", &self.client_id)
            .field("authorization_endpoint", &self.authorization_endpoint)
            .finish_non_exhaustive()
    }
}

/// Issuer URL for the configured provider
#[must_use]
pub fn issuer_for(config: &ProviderConfig) -> String {
    match config.kind {
        IdentityProviderKind::Dex => config.issuer_url.trim_end_matches('/').to_string(),
        IdentityProviderKind::Google => GOOGLE_ISSUER.to_string(),
    }
}

impl OidcProvider {
    /// Build the provider selected in configuration.
    ///
    /// `extra_root` is the parsed `provider.ca_file` for private Dex deployments.
    pub fn from_config(
        config: &ProviderConfig,
        verifier: Arc<IdTokenVerifier>,
        extra_root: Option<reqwest::Certificate>,
    ) -> Result<Self, ProviderError> {
        let mut builder = Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .redirect(reqwest::redirect::Policy::none());
        if let Some(cert) = extra_root {
            builder = builder.add_root_certificate(cert);
        }
        let http = builder.build().map_err(|e| ProviderError::Config(e.to_string()))?;

        let (authorization_endpoint, token_endpoint, scopes) = match config.kind {
            IdentityProviderKind::Dex => {
                let issuer = issuer_for(config);
                (format!("{issuer}/auth"), format!("{issuer}/token"), DEX_SCOPES)
            }
            IdentityProviderKind::Google => (
                GOOGLE_AUTH_ENDPOINT.to_string(),
                GOOGLE_TOKEN_ENDPOINT.to_string(),
                GOOGLE_SCOPES,
            ),
        };

        Ok(Self {
            kind: config.kind,
            client_id: config.client_id.clone(),
            client_secret: config.client_secret.clone(),
            authorization_endpoint,
            token_endpoint,
            connector_id: config.connector_id.clone(),
            scopes,
            http,
            verifier,
        })
    }

    async fn token_request(&self, params: &HashMap<&str, &str>) -> Result<UpstreamIdentity, ProviderError> {
        let response = self
            .http
            .post(&self.token_endpoint)
            .basic_auth(&self.client_id, Some(&self.client_secret))
            .form(params)
            .send()
            .await
            .map_err(|e| ProviderError::Request(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::Rejected { status, body });
        }

        let token_response: TokenResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::Request(format!("failed to parse token response: {e}")))?;
        let id_token = token_response.id_token.ok_or(ProviderError::MissingIdToken)?;

        let identity = self
            .verifier
            .verify(&id_token, std::slice::from_ref(&self.client_id))
            .await?;
        debug!(provider = self.name(), "Upstream identity verified");

        Ok(UpstreamIdentity {
            subject: identity.subject,
            email: identity.email,
            groups: identity.groups,
            id_token,
            refresh_token: token_response.refresh_token,
            expires_at: identity.expires_at,
        })
    }
}

#[async_trait]
impl IdentityProvider for OidcProvider {
    fn name(&self) -> &'static str {
        match self.kind {
            IdentityProviderKind::Dex => "dex",
            IdentityProviderKind::Google => "google",
        }
    }

    fn authorization_url(&self, state: &str, code_challenge: &str, redirect_uri: &str) -> String {
        let Ok(mut url) = Url::parse(&self.authorization_endpoint) else {
            return self.authorization_endpoint.clone();
        };
        {
            let mut query = url.query_pairs_mut();
            query
                .append_pair("response_type", "code")
                .append_pair("client_id", &self.client_id)
                .append_pair("redirect_uri", redirect_uri)
                .append_pair("scope", &self.scopes.join(" "))
                .append_pair("state", state)
                .append_pair("code_challenge", code_challenge)
                .append_pair("code_challenge_method", "S256");
            if let Some(connector) = &self.connector_id {
                query.append_pair("connector_id", connector);
            }
            if self.kind == IdentityProviderKind::Google {
                query
                    .append_pair("access_type", "offline")
                    .append_pair("prompt", "consent");
            }
        }
        url.into()
    }

    async fn exchange_code(
        &self,
        code: &str,
        code_verifier: &str,
        redirect_uri: &str,
    ) -> Result<UpstreamIdentity, ProviderError> {
        let mut params = HashMap::new();
        params.insert("grant_type", "authorization_code");
        params.insert("code", code);
        params.insert("redirect_uri", redirect_uri);
        params.insert("code_verifier", code_verifier);
        self.token_request(&params).await
    }

    async fn refresh(&self, refresh_token: &str) -> Result<UpstreamIdentity, ProviderError> {
        let mut params = HashMap::new();
        params.insert("grant_type", "refresh_token");
        params.insert("refresh_token", refresh_token);
        let mut identity = self.token_request(&params).await?;
        // Google does not rotate refresh tokens
        if identity.refresh_token.is_none() {
            identity.refresh_token = Some(refresh_token.to_string());
        }
        Ok(identity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oauth::sso::tests::StaticKeys;
    use crate::oauth::sso::KeySource;

    fn provider(kind: IdentityProviderKind) -> OidcProvider {
        let config = ProviderConfig {
            kind,
            client_id: "mcp-kubernetes".to_string(),
            client_secret: "secret".to_string(),
            issuer_url: "https://dex.example.com/".to_string(),
            connector_id: Some("github".to_string()),
            ca_file: None,
        };
        let verifier = Arc::new(IdTokenVerifier::new(
            issuer_for(&config),
            Arc::new(StaticKeys::new()) as Arc<dyn KeySource>,
        ));
        OidcProvider::from_config(&config, verifier, None).unwrap()
    }

    fn query(url: &str) -> HashMap<String, String> {
        Url::parse(url).unwrap().query_pairs().into_owned().collect()
    }

    #[test]
    fn dex_authorization_url() {
        // GIVEN: a Dex provider with a connector
        let p = provider(IdentityProviderKind::Dex);

        // WHEN: building the upstream URL
        let url = p.authorization_url("st", "ch", "https://mcp.example.com/oauth/callback");

        // THEN: endpoint, PKCE, scopes and connector are set
        assert!(url.starts_with("https://dex.example.com/auth?"));
        let q = query(&url);
        assert_eq!(q["code_challenge_method"], "S256");
        assert_eq!(q["code_challenge"], "ch");
        assert_eq!(q["state"], "st");
        assert_eq!(q["scope"], "openid profile email groups offline_access");
        assert_eq!(q["connector_id"], "github");
        assert_eq!(q["redirect_uri"], "https://mcp.example.com/oauth/callback");
    }

    #[test]
    fn google_authorization_url_requests_offline_access() {
        let p = provider(IdentityProviderKind::Google);
        let url = p.authorization_url("st", "ch", "https://mcp.example.com/oauth/callback");
        assert!(url.starts_with(GOOGLE_AUTH_ENDPOINT));
        let q = query(&url);
        assert_eq!(q["access_type"], "offline");
        assert!(q["scope"].contains("cloud-platform"));
        assert_eq!(p.name(), "google");
    }

    #[test]
    fn issuer_is_normalised() {
        let config = ProviderConfig {
            issuer_url: "https://dex.example.com/".to_string(),
            ..ProviderConfig::default()
        };
        assert_eq!(issuer_for(&config), "https://dex.example.com");
    }
}
