//! Federation errors
//!
//! Internal messages carry cluster names, namespaces and hosts for operators;
//! [`FederationError::user_facing_message`] is what reaches the MCP caller.

use thiserror::Error;

use super::validation::ValidationError;

/// Errors raised while resolving a per-cluster client
#[derive(Debug, Error)]
pub enum FederationError {
    /// No CAPI Cluster with that name is visible to the caller
    #[error("cluster {cluster:?} not found: {reason}")]
    ClusterNotFound {
        /// Requested cluster
        cluster: String,
        /// Detail for logs
        reason: String,
    },

    /// Kubeconfig secret or CA ConfigMap could not be read or parsed
    #[error("{resource} {namespace}/{resource_name} for cluster {cluster:?}: {reason}")]
    Kubeconfig {
        /// Cluster being connected
        cluster: String,
        /// `secret` or `configmap`
        resource: &'static str,
        /// Object name
        resource_name: String,
        /// Object namespace
        namespace: String,
        /// Detail for logs
        reason: String,
        /// The object does not exist (as opposed to being unreadable)
        not_found: bool,
    },

    /// Workload cluster API server could not be reached or configured
    #[error("connection to cluster {cluster:?} at {host} failed: {reason}")]
    Connection {
        /// Cluster being connected
        cluster: String,
        /// Sanitized API server endpoint
        host: String,
        /// Detail for logs
        reason: String,
    },

    /// Impersonation could not be configured for this user
    #[error("impersonation of {user_hash} on cluster {cluster:?} failed: {reason}")]
    Impersonation {
        /// Cluster being connected
        cluster: String,
        /// Anonymized user
        user_hash: String,
        /// Detail for logs
        reason: String,
    },

    /// The manager has been shut down
    #[error("federation manager is closed")]
    ManagerClosed,

    /// Rejected identity or cluster name
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// Caller exceeded the privileged-path limiter
    #[error("privileged access rate limit exceeded")]
    RateLimited,

    /// Strict mode and the privileged path failed
    #[error("privileged access required but unavailable: {0}")]
    StrictPrivilegedAccessRequired(String),

    /// SSO passthrough requested without an upstream token in the session
    #[error("SSO passthrough requires an upstream ID token but none is present")]
    SsoTokenMissing,

    /// No privileged client configured for a privileged operation
    #[error("no privileged client configured")]
    PrivilegedUnavailable,

    /// Kubernetes API error
    #[error("kubernetes API error: {0}")]
    Kube(String),
}

impl FederationError {
    /// Message safe to return to the MCP caller.
    ///
    /// Cluster existence and connectivity details collapse into one message so
    /// that callers cannot probe which clusters exist.
    #[must_use]
    pub fn user_facing_message(&self) -> String {
        match self {
            Self::ClusterNotFound { .. } | Self::Kubeconfig { .. } | Self::Connection { .. } => {
                "cluster access denied or unavailable".to_string()
            }
            Self::Impersonation { .. } => {
                "insufficient permissions for this cluster; check your RBAC bindings".to_string()
            }
            Self::ManagerClosed => "service is shutting down".to_string(),
            Self::Validation(e) => e.user_facing(),
            Self::RateLimited => "too many requests; try again shortly".to_string(),
            Self::StrictPrivilegedAccessRequired(_) | Self::PrivilegedUnavailable => {
                "privileged access is currently unavailable".to_string()
            }
            Self::SsoTokenMissing => {
                "this server forwards your SSO token to clusters, but the session has none; sign in again".to_string()
            }
            Self::Kube(_) => "kubernetes API request failed".to_string(),
        }
    }

    /// Whether the error is an authorization refusal by the API server
    #[must_use]
    pub fn is_forbidden(&self) -> bool {
        matches!(self, Self::Kube(msg) if msg.contains("403") || msg.contains("Forbidden"))
    }
}

impl From<kube::Error> for FederationError {
    fn from(e: kube::Error) -> Self {
        Self::Kube(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn existence_is_not_disclosed() {
        // GIVEN: a missing cluster and an unreachable cluster
        let missing = FederationError::ClusterNotFound {
            cluster: "prod-wc-01".to_string(),
            reason: "no CAPI Cluster".to_string(),
        };
        let down = FederationError::Connection {
            cluster: "prod-wc-02".to_string(),
            host: "https://[redacted-ip]:6443".to_string(),
            reason: "timeout".to_string(),
        };

        // THEN: the caller sees the same message for both
        assert_eq!(missing.user_facing_message(), down.user_facing_message());
        assert!(!missing.user_facing_message().contains("prod-wc-01"));
        assert!(missing.to_string().contains("prod-wc-01"));
    }

    #[test]
    fn validation_keeps_value_out_of_user_message() {
        let err: FederationError = super::super::validation::validate_cluster_name("../etc").unwrap_err().into();
        assert_eq!(err.user_facing_message(), "invalid cluster name provided");
    }
}
