//! Identity and cluster-name validation
//!
//! Everything that ends up in an impersonation header, a cache key or a
//! Kubernetes object name passes through here first.

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::LazyLock;

use regex::Regex;
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Longest accepted e-mail address (RFC 5321)
pub const MAX_EMAIL_LENGTH: usize = 254;
/// Longest accepted group name
pub const MAX_GROUP_NAME_LENGTH: usize = 256;
/// Most groups accepted for one user
pub const MAX_GROUPS: usize = 100;
/// Longest accepted extra key
pub const MAX_EXTRA_KEY_LENGTH: usize = 256;
/// Longest accepted extra value
pub const MAX_EXTRA_VALUE_LENGTH: usize = 1024;
/// Most extra keys accepted for one user
pub const MAX_EXTRA_KEYS: usize = 50;
/// Longest accepted cluster name (DNS-1123 subdomain)
pub const MAX_CLUSTER_NAME_LENGTH: usize = 253;

static EMAIL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[^\s@]+@[^\s@]+\.[^\s@]+$").expect("valid e-mail regex"));
static CLUSTER_NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?$").expect("valid cluster-name regex"));
static EXTRA_KEY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-zA-Z0-9_-]+$").expect("valid extra-key regex"));

/// Authenticated user as seen by federation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserInfo {
    /// Primary identity, used as the impersonated user name
    pub email: String,
    /// Group memberships, used as impersonated groups
    pub groups: Vec<String>,
    /// Additional impersonation attributes
    pub extra: BTreeMap<String, Vec<String>>,
}

/// Rejected identity or cluster-name input
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("invalid {field}: {reason}")]
pub struct ValidationError {
    /// Offending field
    pub field: &'static str,
    /// Offending value, truncated
    pub value: String,
    /// Why it was rejected
    pub reason: String,
}

impl ValidationError {
    fn new(field: &'static str, value: &str, reason: impl Into<String>) -> Self {
        Self {
            field,
            value: value.chars().take(64).collect(),
            reason: reason.into(),
        }
    }

    /// Message safe to return to the caller; omits the offending value
    #[must_use]
    pub fn user_facing(&self) -> String {
        format!("invalid {} provided", self.field)
    }
}

fn has_control(s: &str) -> bool {
    s.chars().any(char::is_control)
}

/// Validate a user before their identity is used for any cluster call
pub fn validate_user_info(user: &UserInfo) -> Result<(), ValidationError> {
    let email = user.email.as_str();
    if email.is_empty() {
        return Err(ValidationError::new("email", email, "must not be empty"));
    }
    if email.len() > MAX_EMAIL_LENGTH {
        return Err(ValidationError::new(
            "email",
            email,
            format!("exceeds {MAX_EMAIL_LENGTH} characters"),
        ));
    }
    if has_control(email) || !EMAIL_RE.is_match(email) {
        return Err(ValidationError::new("email", email, "not a valid e-mail address"));
    }

    if user.groups.len() > MAX_GROUPS {
        return Err(ValidationError::new(
            "groups",
            &user.groups.len().to_string(),
            format!("more than {MAX_GROUPS} groups"),
        ));
    }
    for group in &user.groups {
        if group.is_empty() {
            return Err(ValidationError::new("group", group, "must not be empty"));
        }
        if group.len() > MAX_GROUP_NAME_LENGTH {
            return Err(ValidationError::new(
                "group",
                group,
                format!("exceeds {MAX_GROUP_NAME_LENGTH} characters"),
            ));
        }
        if has_control(group) {
            return Err(ValidationError::new("group", group, "contains control characters"));
        }
    }

    if user.extra.len() > MAX_EXTRA_KEYS {
        return Err(ValidationError::new(
            "extra",
            &user.extra.len().to_string(),
            format!("more than {MAX_EXTRA_KEYS} keys"),
        ));
    }
    for (key, values) in &user.extra {
        if key.is_empty() || key.len() > MAX_EXTRA_KEY_LENGTH || !EXTRA_KEY_RE.is_match(key) {
            return Err(ValidationError::new("extra key", key, "must match [a-zA-Z0-9_-]{1,256}"));
        }
        for value in values {
            if value.len() > MAX_EXTRA_VALUE_LENGTH {
                return Err(ValidationError::new(
                    "extra value",
                    value,
                    format!("exceeds {MAX_EXTRA_VALUE_LENGTH} characters"),
                ));
            }
            if has_control(value) {
                return Err(ValidationError::new("extra value", value, "contains control characters"));
            }
        }
    }
    Ok(())
}

/// Validate a workload cluster name (DNS-1123, no path components)
pub fn validate_cluster_name(name: &str) -> Result<(), ValidationError> {
    if name.is_empty() {
        return Err(ValidationError::new("cluster name", name, "must not be empty"));
    }
    if name.len() > MAX_CLUSTER_NAME_LENGTH {
        return Err(ValidationError::new(
            "cluster name",
            name,
            format!("exceeds {MAX_CLUSTER_NAME_LENGTH} characters"),
        ));
    }
    if name.contains("..") || name.contains('/') || name.contains('\\') {
        return Err(ValidationError::new("cluster name", name, "contains path components"));
    }
    if !CLUSTER_NAME_RE.is_match(name) {
        return Err(ValidationError::new(
            "cluster name",
            name,
            "must be lowercase alphanumeric or '-', starting and ending with an alphanumeric",
        ));
    }
    Ok(())
}

/// Stable pseudonym for logs: `user:<first 16 hex chars of sha256(email)>`
#[must_use]
pub fn anonymize_email(email: &str) -> String {
    if email.is_empty() {
        return String::new();
    }
    let digest = Sha256::digest(email.as_bytes());
    format!("user:{}", hex::encode(&digest[..8]))
}

/// Domain part of an e-mail for low-cardinality metric labels
#[must_use]
pub fn email_domain(email: &str) -> &str {
    match email.rsplit_once('@') {
        Some((local, domain)) if !local.is_empty() && !domain.is_empty() => domain,
        _ => "unknown_domain",
    }
}

/// Replace IP-literal hosts with a placeholder before logging an API endpoint
#[must_use]
pub fn sanitize_host(host: &str) -> String {
    let (scheme, rest) = match host.split_once("://") {
        Some((scheme, rest)) => (Some(scheme), rest),
        None => (None, host),
    };
    let authority = rest.split('/').next().unwrap_or_default();

    let (hostname, port) = if let Some(inner) = authority.strip_prefix('[') {
        match inner.split_once(']') {
            Some((addr, tail)) => (addr, tail.strip_prefix(':')),
            None => (inner, None),
        }
    } else if authority.matches(':').count() == 1 {
        match authority.split_once(':') {
            Some((h, p)) => (h, Some(p)),
            None => (authority, None),
        }
    } else {
        (authority, None)
    };

    if hostname.parse::<IpAddr>().is_err() {
        return host.to_string();
    }
    let mut out = String::new();
    if let Some(scheme) = scheme {
        out.push_str(scheme);
        out.push_str("://");
    }
    out.push_str("[redacted-ip]");
    if let Some(port) = port.filter(|p| !p.is_empty()) {
        out.push(':');
        out.push_str(port);
    }
    out
}
