//! Multi-cluster credential federation
//!
//! Turns the identity validated by the authorization server into
//! per-cluster Kubernetes clients. The management cluster is reached with
//! the caller's own credentials (or the service account, depending on
//! [`CredentialMode`]); workload clusters are reached either by
//! impersonating the caller on an admin connection or by forwarding the
//! caller's SSO token.

pub mod cache;
pub mod discovery;
pub mod error;
pub mod group_mapper;
pub mod management;
pub mod manager;
pub mod provider;
pub mod rest_config;
pub mod validation;

use serde::{Deserialize, Serialize};

pub use cache::{CacheStats, ClientCache};
pub use discovery::ClusterSummary;
pub use error::FederationError;
pub use group_mapper::GroupMapper;
pub use manager::{ClusterClient, Manager};
pub use validation::UserInfo;

/// How workload clusters authenticate the caller. Fixed at startup.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WorkloadAuthMode {
    /// Admin kubeconfig plus `Impersonate-*` headers naming the caller
    #[default]
    Impersonation,
    /// The caller's upstream ID token, forwarded as-is
    SsoPassthrough,
}

impl WorkloadAuthMode {
    /// Label value
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Impersonation => "impersonation",
            Self::SsoPassthrough => "sso-passthrough",
        }
    }
}

/// Which identity talks to the management cluster
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CredentialMode {
    /// Everything with the caller's credentials
    #[default]
    User,
    /// Service account for kubeconfig secrets and CAPI discovery
    FullPrivileged,
    /// Service account for kubeconfig secrets only
    PrivilegedSecretsOnly,
}

impl CredentialMode {
    /// Whether kubeconfig secrets are read with the service account
    #[must_use]
    pub fn privileged_secrets(self) -> bool {
        matches!(self, Self::FullPrivileged | Self::PrivilegedSecretsOnly)
    }

    /// Whether CAPI cluster discovery runs with the service account
    #[must_use]
    pub fn privileged_discovery(self) -> bool {
        matches!(self, Self::FullPrivileged)
    }
}

/// Per-request identity handed to federation by the bearer middleware
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    /// Validated caller identity
    pub user: UserInfo,
    /// Upstream ID token, present when the session carries one
    pub sso_token: Option<String>,
    /// Correlation id forwarded to Kubernetes audit logs
    pub trace_id: Option<String>,
}
