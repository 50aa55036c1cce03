//! Metric recorder seams.
//!
//! The OAuth and federation cores only talk to the traits below. `NoopMetrics`
//! is used by tests and when metrics are disabled; `FacadeMetrics` forwards to
//! the `metrics` facade, which the Prometheus exporter (feature `metrics`)
//! renders on `/metrics`.

use std::time::Duration;

use telemetry_metrics::{counter, gauge, histogram};

/// Why a cache entry left the federated client cache
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionReason {
    /// Capacity exceeded, least recently used entry dropped
    Lru,
    /// TTL elapsed
    Expired,
    /// Explicit delete or shutdown
    Manual,
}

impl EvictionReason {
    /// Label value
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Lru => "lru",
            Self::Expired => "expired",
            Self::Manual => "manual",
        }
    }
}

/// Outcome of a privileged-path call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrivilegedOutcome {
    /// Privileged call succeeded
    Success,
    /// Privileged call failed
    Error,
    /// Caller exceeded the privileged-path limiter
    RateLimited,
    /// Non-strict mode fell back to user credentials
    Fallback,
}

impl PrivilegedOutcome {
    /// Label value
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Error => "error",
            Self::RateLimited => "rate_limited",
            Self::Fallback => "fallback",
        }
    }
}

/// Federated client cache observations
pub trait CacheMetrics: Send + Sync {
    /// Lookup served from cache
    fn record_hit(&self, cluster: &str);
    /// Lookup had to build a client
    fn record_miss(&self, cluster: &str);
    /// Entry removed
    fn record_eviction(&self, reason: EvictionReason);
    /// Current entry count
    fn set_size(&self, size: usize);
}

/// Privileged (service account) path observations
pub trait PrivilegedAccessMetrics: Send + Sync {
    /// One privileged operation; `user_domain` is the e-mail domain only
    fn record_privileged(&self, user_domain: &str, operation: &str, outcome: PrivilegedOutcome);
}

/// Workload-cluster authentication observations
pub trait WorkloadAuthMetrics: Send + Sync {
    /// Impersonation client construction (`success` / `error`)
    fn record_impersonation(&self, cluster: &str, result: &str, elapsed: Duration);
    /// SSO passthrough client construction (`success` / `error` / `token_missing`)
    fn record_passthrough(&self, cluster: &str, result: &str, elapsed: Duration);
}

/// Authorization server observations
pub trait OAuthMetrics: Send + Sync {
    /// Operation outcome, e.g. (`token`, `success`) or (`register`, `rate_limited`)
    fn record_oauth(&self, operation: &str, outcome: &str);
    /// Security violation (replay, SSRF, redirect rejection)
    fn record_security_event(&self, kind: &str);
}

/// Recorder that drops everything
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopMetrics;

impl CacheMetrics for NoopMetrics {
    fn record_hit(&self, _cluster: &str) {}
    fn record_miss(&self, _cluster: &str) {}
    fn record_eviction(&self, _reason: EvictionReason) {}
    fn set_size(&self, _size: usize) {}
}

impl PrivilegedAccessMetrics for NoopMetrics {
    fn record_privileged(&self, _user_domain: &str, _operation: &str, _outcome: PrivilegedOutcome) {}
}

impl WorkloadAuthMetrics for NoopMetrics {
    fn record_impersonation(&self, _cluster: &str, _result: &str, _elapsed: Duration) {}
    fn record_passthrough(&self, _cluster: &str, _result: &str, _elapsed: Duration) {}
}

impl OAuthMetrics for NoopMetrics {
    fn record_oauth(&self, _operation: &str, _outcome: &str) {}
    fn record_security_event(&self, _kind: &str) {}
}

/// Recorder backed by the `metrics` facade
#[derive(Debug, Clone, Copy, Default)]
pub struct FacadeMetrics;

impl CacheMetrics for FacadeMetrics {
    fn record_hit(&self, cluster: &str) {
        counter!("mcp_client_cache_hits_total", "cluster" => cluster.to_string()).increment(1);
    }

    fn record_miss(&self, cluster: &str) {
        counter!("mcp_client_cache_misses_total", "cluster" => cluster.to_string()).increment(1);
    }

    fn record_eviction(&self, reason: EvictionReason) {
        counter!("mcp_client_cache_evictions_total", "reason" => reason.as_str()).increment(1);
    }

    #[allow(clippy::cast_precision_loss)]
    fn set_size(&self, size: usize) {
        gauge!("mcp_client_cache_entries").set(size as f64);
    }
}

impl PrivilegedAccessMetrics for FacadeMetrics {
    fn record_privileged(&self, user_domain: &str, operation: &str, outcome: PrivilegedOutcome) {
        counter!(
            "mcp_privileged_access_total",
            "user_domain" => user_domain.to_string(),
            "operation" => operation.to_string(),
            "result" => outcome.as_str()
        )
        .increment(1);
    }
}

impl WorkloadAuthMetrics for FacadeMetrics {
    fn record_impersonation(&self, cluster: &str, result: &str, elapsed: Duration) {
        counter!(
            "mcp_impersonation_total",
            "cluster" => cluster.to_string(),
            "result" => result.to_string()
        )
        .increment(1);
        histogram!("mcp_impersonation_duration_seconds").record(elapsed.as_secs_f64());
    }

    fn record_passthrough(&self, cluster: &str, result: &str, elapsed: Duration) {
        counter!(
            "mcp_sso_passthrough_total",
            "cluster" => cluster.to_string(),
            "result" => result.to_string()
        )
        .increment(1);
        histogram!("mcp_sso_passthrough_duration_seconds").record(elapsed.as_secs_f64());
    }
}

impl OAuthMetrics for FacadeMetrics {
    fn record_oauth(&self, operation: &str, outcome: &str) {
        counter!(
            "mcp_oauth_requests_total",
            "operation" => operation.to_string(),
            "outcome" => outcome.to_string()
        )
        .increment(1);
    }

    fn record_security_event(&self, kind: &str) {
        counter!("mcp_oauth_security_events_total", "kind" => kind.to_string()).increment(1);
    }
}

/// Install the global Prometheus recorder and return its render handle.
///
/// Returns `None` if another recorder is already installed (tests, embedding).
#[cfg(feature = "metrics")]
pub fn install_prometheus() -> Option<metrics_exporter_prometheus::PrometheusHandle> {
    match metrics_exporter_prometheus::PrometheusBuilder::new().install_recorder() {
        Ok(handle) => Some(handle),
        Err(e) => {
            tracing::warn!(error = %e, "Prometheus recorder not installed");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn label_values_are_stable() {
        assert_eq!(EvictionReason::Lru.as_str(), "lru");
        assert_eq!(EvictionReason::Expired.as_str(), "expired");
        assert_eq!(PrivilegedOutcome::RateLimited.as_str(), "rate_limited");
        assert_eq!(PrivilegedOutcome::Fallback.as_str(), "fallback");
    }

    #[test]
    fn facade_without_recorder_is_harmless() {
        // GIVEN: no global recorder installed
        let m = FacadeMetrics;

        // WHEN / THEN: recording is a no-op rather than a panic
        m.record_hit("prod-wc-01");
        m.record_eviction(EvictionReason::Lru);
        m.record_privileged("example.com", "secret_access", PrivilegedOutcome::Success);
        m.record_oauth("token", "success");
    }
}
