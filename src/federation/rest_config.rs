//! Building `kube::Config` for workload clusters
//!
//! Two shapes: an admin kubeconfig from the CAPI secret with `Impersonate-*`
//! headers naming the caller, or a bare endpoint + CA with the caller's SSO
//! token as the bearer.

use std::collections::BTreeMap;

use axum::http::{HeaderName, HeaderValue, Uri, header};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use kube::config::{KubeConfigOptions, Kubeconfig};
use thiserror::Error;

use super::group_mapper::GroupMapper;
use super::validation::UserInfo;
use crate::config::ConnectivityConfig;

/// Extra key identifying this server in Kubernetes audit logs
pub const AGENT_EXTRA_KEY: &str = "agent";
/// Value for [`AGENT_EXTRA_KEY`]
pub const AGENT_NAME: &str = "mcp-kubernetes";
/// Extra key carrying the request trace id
pub const TRACE_ID_EXTRA_KEY: &str = "trace-id";
/// Extra key recording pre-mapping groups
pub const ORIGINAL_GROUPS_EXTRA_KEY: &str = "mcp.giantswarm.io/original-groups";
/// API server port when `controlPlaneEndpoint.port` is unset
pub const DEFAULT_API_PORT: i64 = 6443;
/// Secret data key holding the kubeconfig
pub const KUBECONFIG_SECRET_KEY: &str = "value";
/// Fallback secret data key
pub const KUBECONFIG_SECRET_KEY_ALT: &str = "kubeconfig";
/// ConfigMap data key holding the cluster CA
pub const CA_CONFIG_MAP_KEY: &str = "ca.crt";

/// Why a workload-cluster config could not be built
#[derive(Debug, Error)]
pub enum RestConfigError {
    /// Kubeconfig YAML invalid or unusable
    #[error("invalid kubeconfig: {0}")]
    Kubeconfig(String),
    /// Endpoint is not a valid URI
    #[error("invalid API server endpoint: {0}")]
    Endpoint(String),
    /// CA bundle has no usable certificate
    #[error("invalid CA certificate: {0}")]
    Certificate(String),
    /// Identity cannot be encoded as an HTTP header
    #[error("invalid header value for {0}")]
    Header(String),
}

/// Identity presented to a workload cluster via impersonation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Impersonation {
    /// `Impersonate-User`
    pub user: String,
    /// `Impersonate-Group`, one header each
    pub groups: Vec<String>,
    /// `Impersonate-Extra-<key>`
    pub extra: BTreeMap<String, Vec<String>>,
}

impl Impersonation {
    /// Impersonation for `user`, with groups rewritten by `mapper` and
    /// the agent and trace extras added
    #[must_use]
    pub fn for_user(user: &UserInfo, trace_id: Option<&str>, mapper: Option<&GroupMapper>) -> Self {
        let mut extra = user.extra.clone();
        let groups = match mapper {
            Some(mapper) => {
                let (mapped, changed) = mapper.map_groups(&user.groups);
                if changed {
                    extra.insert(ORIGINAL_GROUPS_EXTRA_KEY.to_string(), user.groups.clone());
                }
                mapped
            }
            None => user.groups.clone(),
        };
        extra.insert(AGENT_EXTRA_KEY.to_string(), vec![AGENT_NAME.to_string()]);
        if let Some(trace_id) = trace_id.filter(|t| !t.is_empty()) {
            extra.insert(TRACE_ID_EXTRA_KEY.to_string(), vec![trace_id.to_string()]);
        }
        Self {
            user: user.email.clone(),
            groups,
            extra,
        }
    }

    /// Render as HTTP headers
    pub fn headers(&self) -> Result<Vec<(HeaderName, HeaderValue)>, RestConfigError> {
        let value = |v: &str| HeaderValue::from_str(v).map_err(|_| RestConfigError::Header(v.chars().take(32).collect()));

        let mut headers = vec![(HeaderName::from_static("impersonate-user"), value(&self.user)?)];
        for group in &self.groups {
            headers.push((HeaderName::from_static("impersonate-group"), value(group)?));
        }
        for (key, values) in &self.extra {
            let name = format!("impersonate-extra-{}", encode_extra_key(key));
            let name = HeaderName::from_bytes(name.as_bytes()).map_err(|_| RestConfigError::Header(key.clone()))?;
            for v in values {
                headers.push((name.clone(), value(v)?));
            }
        }
        Ok(headers)
    }
}

/// Percent-encode bytes that are not HTTP token characters.
///
/// The API server decodes `Impersonate-Extra-` suffixes, so keys like
/// `mcp.giantswarm.io/original-groups` survive as header names.
fn encode_extra_key(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    for b in key.bytes() {
        let token = b.is_ascii_alphanumeric() || b"!#$&'*+-.^_`|~".contains(&b);
        if token {
            out.push(char::from(b.to_ascii_lowercase()));
        } else {
            out.push_str(&format!("%{b:02x}"));
        }
    }
    out
}

/// Parse a kubeconfig taken from a CAPI secret
pub async fn config_from_kubeconfig(data: &[u8]) -> Result<kube::Config, RestConfigError> {
    let yaml = std::str::from_utf8(data).map_err(|e| RestConfigError::Kubeconfig(e.to_string()))?;
    let kubeconfig = Kubeconfig::from_yaml(yaml).map_err(|e| RestConfigError::Kubeconfig(e.to_string()))?;
    kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
        .await
        .map_err(|e| RestConfigError::Kubeconfig(e.to_string()))
}

/// Pick the kubeconfig bytes out of a secret's data
#[must_use]
pub fn kubeconfig_from_secret(data: &BTreeMap<String, Vec<u8>>) -> Option<&[u8]> {
    data.get(KUBECONFIG_SECRET_KEY)
        .or_else(|| data.get(KUBECONFIG_SECRET_KEY_ALT))
        .map(Vec::as_slice)
        .filter(|d| !d.is_empty())
}

/// `https://host:port` from a CAPI `controlPlaneEndpoint`
#[must_use]
pub fn control_plane_url(host: &str, port: Option<i64>) -> String {
    let port = port.filter(|p| *p > 0).unwrap_or(DEFAULT_API_PORT);
    if host.contains(':') && !host.starts_with('[') {
        format!("https://[{host}]:{port}")
    } else {
        format!("https://{host}:{port}")
    }
}

/// Config that authenticates with the caller's own bearer token
pub fn passthrough_config(endpoint: &str, ca_pem: &[u8], token: &str) -> Result<kube::Config, RestConfigError> {
    let uri: Uri = endpoint
        .parse()
        .map_err(|e: axum::http::uri::InvalidUri| RestConfigError::Endpoint(e.to_string()))?;
    let mut config = kube::Config::new(uri);
    config.root_cert = Some(pem_certificates(ca_pem)?);
    let bearer = HeaderValue::from_str(&format!("Bearer {token}"))
        .map_err(|_| RestConfigError::Header("authorization".to_string()))?;
    config.headers.push((header::AUTHORIZATION, bearer));
    Ok(config)
}

/// Attach impersonation headers
pub fn apply_impersonation(config: &mut kube::Config, impersonation: &Impersonation) -> Result<(), RestConfigError> {
    config.headers.retain(|(name, _)| !name.as_str().starts_with("impersonate-"));
    config.headers.extend(impersonation.headers()?);
    Ok(())
}

/// Apply connection and request timeouts
pub fn apply_connectivity(config: &mut kube::Config, connectivity: &ConnectivityConfig) {
    config.connect_timeout = Some(connectivity.connection_timeout);
    config.read_timeout = Some(connectivity.request_timeout);
    config.write_timeout = Some(connectivity.request_timeout);
}

/// DER certificates from a PEM bundle
pub fn pem_certificates(pem: &[u8]) -> Result<Vec<Vec<u8>>, RestConfigError> {
    let text = std::str::from_utf8(pem).map_err(|e| RestConfigError::Certificate(e.to_string()))?;
    let mut certs = Vec::new();
    let mut body: Option<String> = None;
    for line in text.lines().map(str::trim) {
        if line == "-----BEGIN CERTIFICATE-----" {
            body = Some(String::new());
        } else if line == "-----END CERTIFICATE-----" {
            let b64 = body.take().unwrap_or_default();
            let der = STANDARD
                .decode(b64.as_bytes())
                .map_err(|e| RestConfigError::Certificate(e.to_string()))?;
            certs.push(der);
        } else if let Some(body) = body.as_mut() {
            body.push_str(line);
        }
    }
    if certs.is_empty() {
        return Err(RestConfigError::Certificate("no PEM certificate found".to_string()));
    }
    Ok(certs)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) const TEST_CA: &str = "-----BEGIN CERTIFICATE-----\nAAECAwQF\n-----END CERTIFICATE-----\n";

    pub(crate) const ADMIN_KUBECONFIG: &str = r"
apiVersion: v1
kind: Config
clusters:
- name: prod-wc-01
  cluster:
    server: https://api.prod-wc-01.example.com:6443
contexts:
- name: admin
  context:
    cluster: prod-wc-01
    user: admin
current-context: admin
users:
- name: admin
  user:
    token: admin-token
";

    fn jane() -> UserInfo {
        UserInfo {
            email: "jane@example.com".to_string(),
            groups: vec!["okta:platform".to_string(), "developers".to_string()],
            extra: BTreeMap::new(),
        }
    }

    fn header_values<'a>(headers: &'a [(HeaderName, HeaderValue)], name: &str) -> Vec<&'a str> {
        headers
            .iter()
            .filter(|(n, _)| n.as_str() == name)
            .filter_map(|(_, v)| v.to_str().ok())
            .collect()
    }

    #[test]
    fn impersonation_headers_name_the_caller() {
        // GIVEN
        let imp = Impersonation::for_user(&jane(), Some("4bf92f35"), None);

        // WHEN
        let headers = imp.headers().unwrap();

        // THEN
        assert_eq!(header_values(&headers, "impersonate-user"), vec!["jane@example.com"]);
        assert_eq!(header_values(&headers, "impersonate-group"), vec!["okta:platform", "developers"]);
        assert_eq!(header_values(&headers, "impersonate-extra-agent"), vec!["mcp-kubernetes"]);
        assert_eq!(header_values(&headers, "impersonate-extra-trace-id"), vec!["4bf92f35"]);
    }

    #[test]
    fn mapping_records_original_groups() {
        let mapper = GroupMapper::new(BTreeMap::from([(
            "okta:platform".to_string(),
            "platform-admins".to_string(),
        )]))
        .unwrap();

        let imp = Impersonation::for_user(&jane(), None, Some(&mapper));

        assert_eq!(imp.groups, vec!["platform-admins", "developers"]);
        assert_eq!(imp.extra[ORIGINAL_GROUPS_EXTRA_KEY], jane().groups);
        assert!(!imp.extra.contains_key(TRACE_ID_EXTRA_KEY));

        let headers = imp.headers().unwrap();
        assert_eq!(
            header_values(&headers, "impersonate-extra-mcp.giantswarm.io%2foriginal-groups").len(),
            2
        );
    }

    #[test]
    fn unmapped_groups_leave_no_marker() {
        let mapper = GroupMapper::new(BTreeMap::from([("other".to_string(), "x".to_string())])).unwrap();
        let imp = Impersonation::for_user(&jane(), None, Some(&mapper));
        assert!(!imp.extra.contains_key(ORIGINAL_GROUPS_EXTRA_KEY));
    }

    #[test]
    fn apply_replaces_previous_impersonation() {
        let mut config = kube::Config::new("https://api.example.com:6443".parse().unwrap());
        apply_impersonation(&mut config, &Impersonation::for_user(&jane(), None, None)).unwrap();
        let mut other = jane();
        other.email = "bob@example.com".to_string();
        apply_impersonation(&mut config, &Impersonation::for_user(&other, None, None)).unwrap();

        assert_eq!(header_values(&config.headers, "impersonate-user"), vec!["bob@example.com"]);
    }

    #[test]
    fn endpoint_defaults_port() {
        assert_eq!(control_plane_url("api.example.com", None), "https://api.example.com:6443");
        assert_eq!(control_plane_url("api.example.com", Some(443)), "https://api.example.com:443");
        assert_eq!(control_plane_url("fd00::1", Some(0)), "https://[fd00::1]:6443");
    }

    #[test]
    fn passthrough_sets_bearer_and_ca() {
        let config = passthrough_config("https://api.example.com:6443", TEST_CA.as_bytes(), "id-token").unwrap();
        assert_eq!(header_values(&config.headers, "authorization"), vec!["Bearer id-token"]);
        assert_eq!(config.root_cert.unwrap(), vec![vec![0u8, 1, 2, 3, 4, 5]]);
    }

    #[test]
    fn rejects_empty_ca() {
        assert!(matches!(
            passthrough_config("https://api.example.com", b"not a pem", "t"),
            Err(RestConfigError::Certificate(_))
        ));
    }

    #[test]
    fn secret_key_fallback() {
        let mut data = BTreeMap::new();
        data.insert(KUBECONFIG_SECRET_KEY_ALT.to_string(), b"alt".to_vec());
        assert_eq!(kubeconfig_from_secret(&data), Some(&b"alt"[..]));
        data.insert(KUBECONFIG_SECRET_KEY.to_string(), b"main".to_vec());
        assert_eq!(kubeconfig_from_secret(&data), Some(&b"main"[..]));
    }

    #[tokio::test]
    async fn parses_admin_kubeconfig() {
        let mut config = config_from_kubeconfig(ADMIN_KUBECONFIG.as_bytes()).await.unwrap();
        apply_connectivity(&mut config, &ConnectivityConfig::default());
        assert_eq!(config.cluster_url.host(), Some("api.prod-wc-01.example.com"));
        assert_eq!(config.read_timeout, Some(std::time::Duration::from_secs(30)));
    }
}
