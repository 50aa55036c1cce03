//! OAuth 2.1 authorization server
//!
//! Issues opaque, encrypted-at-rest bearer tokens to MCP clients after an
//! upstream OIDC login (Dex or Google), and accepts upstream ID tokens
//! directly from trusted SSO aggregators.

pub mod audit;
pub mod cimd;
pub mod encryption;
pub mod error;
pub mod handler;
pub mod metadata;
pub mod middleware;
pub mod model;
pub mod provider;
pub mod redirect;
pub mod server;
pub mod sso;
pub mod store;
pub mod tokens;

pub use error::{ErrorCode, OAuthError};
pub use handler::oauth_routes;
pub use middleware::bearer_auth;
pub use server::AuthorizationServer;
