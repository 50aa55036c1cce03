//! Redirect URI validation.
//!
//! The same checks run at registration and again at authorization time, so a
//! hostname that was public when the client registered but has since been
//! re-pointed at an internal address is caught before a code is issued.
//!
//! Order of checks:
//! 1. URI parses, has no fragment, scheme is allowed
//! 2. trusted custom schemes stop here (no host to check)
//! 3. `localhost` names need `allow_localhost`
//! 4. IP literals are classified directly
//! 5. hostnames are resolved and every answer is classified

use std::sync::Arc;

use tracing::{debug, warn};
use url::Url;

use crate::config::RedirectSecurityConfig;
use crate::security::ssrf::{
    AddressAllowance, AddressClass, Resolver, SsrfError, classify, host_as_ip, is_localhost_name,
    resolve_checked,
};

/// Schemes that are never valid redirect targets
const DANGEROUS_SCHEMES: &[&str] = &["javascript", "data", "file", "vbscript", "blob", "about"];

/// Upper bound on redirect URIs per client
pub const MAX_REDIRECT_URIS: usize = 10;

/// Upper bound on a single redirect URI
pub const MAX_REDIRECT_URI_LEN: usize = 2048;

/// When the validation runs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationPhase {
    /// Dynamic client registration
    Registration,
    /// Authorization request (always fail-closed on DNS errors)
    Authorization,
}

/// Rejection bucket, used for metrics and audit events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectionCategory {
    /// Unparseable, too long or missing host
    InvalidUri,
    /// Scheme not allowed
    Scheme,
    /// URI carries a fragment
    Fragment,
    /// `localhost` name without the loopback allowance
    BlockedHostname,
    /// Loopback address
    LoopbackAddress,
    /// RFC 1918 / ULA address
    PrivateAddress,
    /// Link-local address (cloud metadata lives here)
    LinkLocalAddress,
    /// Unspecified, multicast, documentation or otherwise reserved address
    ReservedAddress,
    /// DNS lookup failed
    DnsFailure,
    /// Trusted custom scheme mixed with web URIs
    MixedSchemes,
}

impl RejectionCategory {
    /// Label value
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InvalidUri => "invalid_uri",
            Self::Scheme => "scheme",
            Self::Fragment => "fragment",
            Self::BlockedHostname => "blocked_hostname",
            Self::LoopbackAddress => "loopback_address",
            Self::PrivateAddress => "private_address",
            Self::LinkLocalAddress => "link_local_address",
            Self::ReservedAddress => "reserved_address",
            Self::DnsFailure => "dns_failure",
            Self::MixedSchemes => "mixed_schemes",
        }
    }

    fn for_class(class: AddressClass) -> Self {
        match class {
            AddressClass::Loopback => Self::LoopbackAddress,
            AddressClass::Private => Self::PrivateAddress,
            AddressClass::LinkLocal => Self::LinkLocalAddress,
            AddressClass::Reserved | AddressClass::Public => Self::ReservedAddress,
        }
    }
}

/// A rejected redirect URI
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{reason}")]
pub struct RedirectUriError {
    category: RejectionCategory,
    reason: String,
}

impl RedirectUriError {
    fn new(category: RejectionCategory, reason: impl Into<String>) -> Self {
        Self {
            category,
            reason: reason.into(),
        }
    }

    /// Rejection bucket
    #[must_use]
    pub fn category(&self) -> RejectionCategory {
        self.category
    }
}

/// What kind of URIs a validated set contains
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RedirectSetKind {
    /// Only http(s) URIs
    Web,
    /// Only trusted custom-scheme URIs
    TrustedCustom,
    /// Both, permitted by `allow_mixed_scheme_redirects`
    Mixed,
}

/// Redirect URI validator bound to one deployment's policy
#[derive(Clone)]
pub struct RedirectUriValidator {
    policy: RedirectSecurityConfig,
    trusted_schemes: Vec<String>,
    resolver: Arc<dyn Resolver>,
}

impl std::fmt::Debug for RedirectUriValidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedirectUriValidator")
            .field("policy", &self.policy)
            .field("trusted_schemes", &self.trusted_schemes)
            .finish_non_exhaustive()
    }
}

impl RedirectUriValidator {
    /// Create a validator
    pub fn new(
        policy: RedirectSecurityConfig,
        trusted_schemes: &[String],
        resolver: Arc<dyn Resolver>,
    ) -> Self {
        Self {
            policy,
            trusted_schemes: trusted_schemes.iter().map(|s| s.to_ascii_lowercase()).collect(),
            resolver,
        }
    }

    /// Whether `scheme` is one of the deployment's trusted custom schemes
    #[must_use]
    pub fn is_trusted_scheme(&self, scheme: &str) -> bool {
        let scheme = scheme.to_ascii_lowercase();
        self.trusted_schemes.iter().any(|s| *s == scheme)
    }

    fn allowance(&self) -> AddressAllowance {
        AddressAllowance {
            loopback: self.policy.allow_localhost,
            private: self.policy.allow_private_ips,
            link_local: self.policy.allow_link_local,
        }
    }

    /// Validate a single redirect URI. Returns whether it is a trusted custom scheme.
    pub async fn validate(
        &self,
        raw: &str,
        phase: ValidationPhase,
    ) -> Result<RedirectSetKind, RedirectUriError> {
        use RejectionCategory as C;

        if raw.len() > MAX_REDIRECT_URI_LEN {
            return Err(RedirectUriError::new(C::InvalidUri, "redirect_uri is too long"));
        }
        let url = Url::parse(raw)
            .map_err(|e| RedirectUriError::new(C::InvalidUri, format!("redirect_uri is not a valid URI: {e}")))?;
        if url.fragment().is_some() {
            return Err(RedirectUriError::new(C::Fragment, "redirect_uri must not contain a fragment"));
        }

        let scheme = url.scheme();
        if DANGEROUS_SCHEMES.contains(&scheme) {
            return Err(RedirectUriError::new(C::Scheme, format!("redirect_uri scheme '{scheme}' is not allowed")));
        }
        if scheme != "https" && scheme != "http" {
            if self.is_trusted_scheme(scheme) {
                return Ok(RedirectSetKind::TrustedCustom);
            }
            return Err(RedirectUriError::new(
                C::Scheme,
                format!("redirect_uri scheme '{scheme}' is not allowed"),
            ));
        }

        let host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| RedirectUriError::new(C::InvalidUri, "redirect_uri has no host"))?;

        if scheme == "http" && self.policy.production_mode {
            let loopback_host = is_localhost_name(host)
                || host_as_ip(host).is_some_and(|ip| classify(ip) == AddressClass::Loopback);
            if !(self.policy.allow_localhost && loopback_host) {
                return Err(RedirectUriError::new(
                    C::Scheme,
                    "redirect_uri must use https (http is only allowed for loopback hosts)",
                ));
            }
        }

        if is_localhost_name(host) {
            if self.policy.allow_localhost {
                return Ok(RedirectSetKind::Web);
            }
            return Err(RedirectUriError::new(C::BlockedHostname, "localhost redirect URIs are not allowed"));
        }

        let allow = self.allowance();
        if let Some(ip) = host_as_ip(host) {
            let class = classify(ip);
            if !allow.permits(class) {
                return Err(RedirectUriError::new(
                    RejectionCategory::for_class(class),
                    format!("redirect_uri points to a {} address", class.as_str()),
                ));
            }
            return Ok(RedirectSetKind::Web);
        }

        if !self.policy.dns_validation {
            return Ok(RedirectSetKind::Web);
        }

        let port = url.port_or_known_default().unwrap_or(443);
        match resolve_checked(self.resolver.as_ref(), host, port, allow, self.policy.dns_timeout).await {
            Ok(_) => Ok(RedirectSetKind::Web),
            Err(SsrfError::Blocked { class, .. }) => Err(RedirectUriError::new(
                RejectionCategory::for_class(class),
                format!("redirect_uri host resolves to a {} address", class.as_str()),
            )),
            Err(SsrfError::Resolution { reason, .. }) => {
                if phase == ValidationPhase::Registration && self.policy.dns_fail_open_at_registration {
                    warn!(host = %host, reason = %reason, "Redirect URI DNS lookup failed; accepting at registration (fail-open)");
                    Ok(RedirectSetKind::Web)
                } else {
                    debug!(host = %host, reason = %reason, ?phase, "Redirect URI DNS lookup failed");
                    Err(RedirectUriError::new(C::DnsFailure, "redirect_uri host could not be resolved"))
                }
            }
            Err(e) => Err(RedirectUriError::new(C::InvalidUri, e.to_string())),
        }
    }

    /// Validate a client's full redirect set and classify it.
    pub async fn validate_set(
        &self,
        uris: &[String],
        phase: ValidationPhase,
    ) -> Result<RedirectSetKind, RedirectUriError> {
        if uris.is_empty() {
            return Err(RedirectUriError::new(
                RejectionCategory::InvalidUri,
                "at least one redirect_uri is required",
            ));
        }
        if uris.len() > MAX_REDIRECT_URIS {
            return Err(RedirectUriError::new(
                RejectionCategory::InvalidUri,
                format!("at most {MAX_REDIRECT_URIS} redirect_uris are allowed"),
            ));
        }

        let mut web = false;
        let mut custom = false;
        for uri in uris {
            match self.validate(uri, phase).await? {
                RedirectSetKind::TrustedCustom => custom = true,
                _ => web = true,
            }
        }

        match (web, custom) {
            (true, true) if !self.policy.allow_mixed_scheme_redirects => Err(RedirectUriError::new(
                RejectionCategory::MixedSchemes,
                "redirect_uris must not mix trusted custom schemes with http(s) URIs",
            )),
            (true, true) => Ok(RedirectSetKind::Mixed),
            (false, true) => Ok(RedirectSetKind::TrustedCustom),
            _ => Ok(RedirectSetKind::Web),
        }
    }
}
