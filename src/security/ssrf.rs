//! SSRF protection: address classification, IPv4-in-IPv6 unwrapping and
//! resolve-then-check DNS lookups.
//!
//! Redirect URIs, client metadata documents and JWKS endpoints all point the
//! server at attacker-chosen hosts. Every such host is resolved once, every
//! resolved address is classified, and the checked addresses are the ones the
//! connection is pinned to (so a second, rebinding lookup never happens).

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use async_trait::async_trait;

/// Coarse classification of an IP address for SSRF decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressClass {
    /// Globally routable
    Public,
    /// 127.0.0.0/8, ::1
    Loopback,
    /// RFC 1918, CGN 100.64.0.0/10, ULA fc00::/7
    Private,
    /// 169.254.0.0/16 (cloud metadata lives here), fe80::/10
    LinkLocal,
    /// Unspecified, broadcast, multicast, documentation ranges
    Reserved,
}

impl AddressClass {
    /// Short label used in rejection messages and logs.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Public => "public",
            Self::Loopback => "loopback",
            Self::Private => "private",
            Self::LinkLocal => "link-local",
            Self::Reserved => "reserved",
        }
    }
}

/// Which non-public address classes a caller tolerates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AddressAllowance {
    /// Accept loopback
    pub loopback: bool,
    /// Accept private ranges
    pub private: bool,
    /// Accept link-local
    pub link_local: bool,
}

impl AddressAllowance {
    /// Nothing but public addresses.
    pub const PUBLIC_ONLY: Self = Self {
        loopback: false,
        private: false,
        link_local: false,
    };

    /// Whether an address of `class` passes. Reserved never does.
    #[must_use]
    pub fn permits(self, class: AddressClass) -> bool {
        match class {
            AddressClass::Public => true,
            AddressClass::Loopback => self.loopback,
            AddressClass::Private => self.private,
            AddressClass::LinkLocal => self.link_local,
            AddressClass::Reserved => false,
        }
    }
}

/// Classify an address, unwrapping IPv4 embedded in IPv6 first.
#[must_use]
pub fn classify(addr: IpAddr) -> AddressClass {
    match addr {
        IpAddr::V4(ipv4) => classify_ipv4(ipv4),
        IpAddr::V6(ipv6) => classify_ipv6(ipv6),
    }
}

fn classify_ipv4(addr: Ipv4Addr) -> AddressClass {
    if addr.is_loopback() {
        AddressClass::Loopback
    } else if addr.is_private() || is_shared_address(addr) {
        AddressClass::Private
    } else if addr.is_link_local() {
        AddressClass::LinkLocal
    } else if addr.is_broadcast()
        || addr.is_unspecified()
        || addr.is_multicast()
        || is_documentation(addr)
        || addr.octets()[0] == 0
    {
        AddressClass::Reserved
    } else {
        AddressClass::Public
    }
}

/// Check 100.64.0.0/10 (Carrier-Grade NAT / shared address space).
fn is_shared_address(addr: Ipv4Addr) -> bool {
    let octets = addr.octets();
    octets[0] == 100 && (octets[1] & 0xC0) == 64
}

/// Check documentation ranges (TEST-NET-1/2/3).
fn is_documentation(addr: Ipv4Addr) -> bool {
    let octets = addr.octets();
    (octets[0] == 192 && octets[1] == 0 && octets[2] == 2)
        || (octets[0] == 198 && octets[1] == 51 && octets[2] == 100)
        || (octets[0] == 203 && octets[1] == 0 && octets[2] == 113)
}

#[allow(clippy::cast_possible_truncation)] // Extracting u8 octets from u16 IPv6 segments is intentional
fn classify_ipv6(addr: Ipv6Addr) -> AddressClass {
    if addr.is_loopback() {
        return AddressClass::Loopback;
    }
    if addr.is_unspecified() || addr.is_multicast() {
        return AddressClass::Reserved;
    }

    let segments = addr.segments();

    // fe80::/10
    if segments[0] & 0xFFC0 == 0xFE80 {
        return AddressClass::LinkLocal;
    }
    // fc00::/7
    if segments[0] & 0xFE00 == 0xFC00 {
        return AddressClass::Private;
    }

    // ::ffff:x.x.x.x is the classic bypass vector
    if let Some(ipv4) = extract_ipv4_mapped(&addr) {
        return classify_ipv4(ipv4);
    }
    if let Some(ipv4) = extract_ipv4_compatible(&addr) {
        return classify_ipv4(ipv4);
    }

    // 6to4 (2002::/16)
    if segments[0] == 0x2002 {
        let embedded = Ipv4Addr::new(
            (segments[1] >> 8) as u8,
            segments[1] as u8,
            (segments[2] >> 8) as u8,
            segments[2] as u8,
        );
        return classify_ipv4(embedded);
    }

    // NAT64 well-known prefix (64:ff9b::/96), IPv4 in the low 32 bits
    if segments[0] == 0x0064 && segments[1] == 0xFF9B && segments[2..6].iter().all(|s| *s == 0) {
        let embedded = Ipv4Addr::new(
            (segments[6] >> 8) as u8,
            segments[6] as u8,
            (segments[7] >> 8) as u8,
            segments[7] as u8,
        );
        return classify_ipv4(embedded);
    }

    // Teredo (2001:0000::/32), client address XOR-obfuscated
    if segments[0] == 0x2001 && segments[1] == 0x0000 {
        let client_ipv4 = Ipv4Addr::new(
            (segments[6] >> 8) as u8 ^ 0xFF,
            segments[6] as u8 ^ 0xFF,
            (segments[7] >> 8) as u8 ^ 0xFF,
            segments[7] as u8 ^ 0xFF,
        );
        return classify_ipv4(client_ipv4);
    }

    AddressClass::Public
}

#[allow(clippy::cast_possible_truncation)]
fn extract_ipv4_mapped(addr: &Ipv6Addr) -> Option<Ipv4Addr> {
    let segments = addr.segments();
    if segments[..5].iter().all(|s| *s == 0) && segments[5] == 0xFFFF {
        Some(Ipv4Addr::new(
            (segments[6] >> 8) as u8,
            segments[6] as u8,
            (segments[7] >> 8) as u8,
            segments[7] as u8,
        ))
    } else {
        None
    }
}

/// `::x.x.x.x` (deprecated), excluding `::` and `::1`.
#[allow(clippy::cast_possible_truncation)]
fn extract_ipv4_compatible(addr: &Ipv6Addr) -> Option<Ipv4Addr> {
    let segments = addr.segments();
    if segments[..6].iter().all(|s| *s == 0) && (segments[6] != 0 || segments[7] > 1) {
        Some(Ipv4Addr::new(
            (segments[6] >> 8) as u8,
            segments[6] as u8,
            (segments[7] >> 8) as u8,
            segments[7] as u8,
        ))
    } else {
        None
    }
}

/// Parse a URL host as an IP literal, tolerating IPv6 brackets.
#[must_use]
pub fn host_as_ip(host: &str) -> Option<IpAddr> {
    host.trim_start_matches('[')
        .trim_end_matches(']')
        .parse::<IpAddr>()
        .ok()
}

/// Whether a hostname is a `localhost` name (RFC 6761 reserves `*.localhost`).
#[must_use]
pub fn is_localhost_name(host: &str) -> bool {
    let host = host.trim_end_matches('.').to_ascii_lowercase();
    host == "localhost" || host.ends_with(".localhost")
}

/// Why an outbound target was refused.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SsrfError {
    /// URL could not be parsed or has no host
    #[error("invalid URL: {0}")]
    InvalidUrl(String),
    /// Target scheme is not HTTPS
    #[error("URL must use https")]
    InsecureScheme,
    /// Target resolves to a blocked address class
    #[error("SSRF blocked: {host} resolves to a {} address", class.as_str())]
    Blocked {
        /// Hostname (or literal) that was checked
        host: String,
        /// Offending class
        class: AddressClass,
    },
    /// DNS lookup failed or timed out
    #[error("DNS resolution failed for {host}: {reason}")]
    Resolution {
        /// Hostname
        host: String,
        /// Resolver message
        reason: String,
    },
}

/// DNS resolution seam, so validation can be exercised without a network.
#[async_trait]
pub trait Resolver: Send + Sync + 'static {
    /// Resolve `host` to the set of addresses a connection could use.
    async fn resolve(&self, host: &str) -> std::io::Result<Vec<IpAddr>>;
}

/// System resolver backed by `tokio::net::lookup_host`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemResolver;

#[async_trait]
impl Resolver for SystemResolver {
    async fn resolve(&self, host: &str) -> std::io::Result<Vec<IpAddr>> {
        let addrs = tokio::net::lookup_host((host, 443)).await?;
        Ok(addrs.map(|a| a.ip()).collect())
    }
}

/// Resolve `host` (or take its literal) and check every address against `allow`.
///
/// Returns the checked socket addresses for `port`, ready to pin a client to.
pub async fn resolve_checked(
    resolver: &dyn Resolver,
    host: &str,
    port: u16,
    allow: AddressAllowance,
    timeout: Duration,
) -> Result<Vec<SocketAddr>, SsrfError> {
    let addrs = if let Some(ip) = host_as_ip(host) {
        vec![ip]
    } else {
        match tokio::time::timeout(timeout, resolver.resolve(host)).await {
            Ok(Ok(addrs)) if !addrs.is_empty() => addrs,
            Ok(Ok(_)) => {
                return Err(SsrfError::Resolution {
                    host: host.to_string(),
                    reason: "no addresses".to_string(),
                });
            }
            Ok(Err(e)) => {
                return Err(SsrfError::Resolution {
                    host: host.to_string(),
                    reason: e.to_string(),
                });
            }
            Err(_) => {
                return Err(SsrfError::Resolution {
                    host: host.to_string(),
                    reason: format!("timed out after {}ms", timeout.as_millis()),
                });
            }
        }
    };

    for addr in &addrs {
        let class = classify(*addr);
        if !allow.permits(class) {
            return Err(SsrfError::Blocked {
                host: host.to_string(),
                class,
            });
        }
    }

    Ok(addrs.into_iter().map(|ip| SocketAddr::new(ip, port)).collect())
}

/// Validate an outbound HTTPS URL and return its host, port and pinned addresses.
pub async fn check_outbound_url(
    resolver: &dyn Resolver,
    raw: &str,
    allow: AddressAllowance,
    timeout: Duration,
) -> Result<(url::Url, Vec<SocketAddr>), SsrfError> {
    let parsed = url::Url::parse(raw).map_err(|e| SsrfError::InvalidUrl(e.to_string()))?;
    if parsed.scheme() != "https" {
        return Err(SsrfError::InsecureScheme);
    }
    let host = parsed
        .host_str()
        .ok_or_else(|| SsrfError::InvalidUrl("URL has no host".to_string()))?
        .to_string();
    if is_localhost_name(&host) && !allow.loopback {
        return Err(SsrfError::Blocked {
            host,
            class: AddressClass::Loopback,
        });
    }
    let port = parsed.port_or_known_default().unwrap_or(443);
    let addrs = resolve_checked(resolver, &host, port, allow, timeout).await?;
    Ok((parsed, addrs))
}
