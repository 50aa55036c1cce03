//! CAPI cluster discovery
//!
//! Workload clusters are CAPI `Cluster` objects in organization namespaces
//! on the management cluster. Listing goes through whichever identity the
//! hybrid provider picked, so the result is filtered by that identity's RBAC.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use kube::api::DynamicObject;
use serde::Serialize;
use serde_json::Value;

use super::error::FederationError;
use super::management::ManagementApi;
use super::rest_config::control_plane_url;

/// Release version label
pub const LABEL_RELEASE: &str = "release.giantswarm.io/version";
/// Organization label
pub const LABEL_ORGANIZATION: &str = "giantswarm.io/organization";
/// Phase reported when CAPI has not set one
pub const PHASE_UNKNOWN: &str = "Unknown";

/// Summary of one workload cluster
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSummary {
    /// Cluster name
    pub name: String,
    /// Organization namespace on the management cluster
    pub namespace: String,
    /// Infrastructure provider derived from `spec.infrastructureRef.kind`
    pub provider: String,
    /// Release label, when present
    #[serde(skip_serializing_if = "Option::is_none")]
    pub release: Option<String>,
    /// Kubernetes version, when reported
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kubernetes_version: Option<String>,
    /// CAPI phase
    pub status: String,
    /// Provisioned with control plane and infrastructure ready
    pub ready: bool,
    /// `status.controlPlaneReady`
    pub control_plane_ready: bool,
    /// `status.infrastructureReady`
    pub infrastructure_ready: bool,
    /// Creation timestamp
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    /// Object labels
    pub labels: BTreeMap<String, String>,
}

/// Where a workload cluster lives and how to reach it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterLocation {
    /// Cluster name
    pub name: String,
    /// Namespace holding the kubeconfig secret and CA ConfigMap
    pub namespace: String,
    /// API server URL from `spec.controlPlaneEndpoint`
    pub endpoint: Option<String>,
}

fn str_at<'a>(data: &'a Value, pointer: &str) -> Option<&'a str> {
    data.pointer(pointer).and_then(Value::as_str).filter(|s| !s.is_empty())
}

fn bool_at(data: &Value, pointer: &str) -> bool {
    data.pointer(pointer).and_then(Value::as_bool).unwrap_or(false)
}

/// Map an infrastructure kind (`AWSCluster`, `AzureCluster`, ...) to a provider name
#[must_use]
pub fn provider_from_kind(kind: &str) -> String {
    let lower = kind.to_ascii_lowercase();
    if lower.contains("aws") {
        "aws".to_string()
    } else if lower.contains("azure") {
        "azure".to_string()
    } else if lower.contains("vsphere") {
        "vsphere".to_string()
    } else if lower.contains("gcp") || lower.contains("google") {
        "gcp".to_string()
    } else if lower.is_empty() {
        "unknown".to_string()
    } else {
        lower.trim_end_matches("cluster").to_string()
    }
}

impl ClusterSummary {
    /// Extract a summary from a CAPI `Cluster`
    #[must_use]
    pub fn from_object(obj: &DynamicObject) -> Self {
        let data = &obj.data;
        let labels: BTreeMap<String, String> = obj.metadata.labels.clone().unwrap_or_default();
        let status = str_at(data, "/status/phase").unwrap_or(PHASE_UNKNOWN).to_string();
        let control_plane_ready = bool_at(data, "/status/controlPlaneReady");
        let infrastructure_ready = bool_at(data, "/status/infrastructureReady");
        let kubernetes_version = str_at(data, "/spec/topology/version")
            .or_else(|| str_at(data, "/status/version"))
            .map(str::to_string);

        Self {
            name: obj.metadata.name.clone().unwrap_or_default(),
            namespace: obj.metadata.namespace.clone().unwrap_or_default(),
            provider: provider_from_kind(str_at(data, "/spec/infrastructureRef/kind").unwrap_or_default()),
            release: labels.get(LABEL_RELEASE).cloned(),
            kubernetes_version,
            ready: control_plane_ready && infrastructure_ready && status == "Provisioned",
            status,
            control_plane_ready,
            infrastructure_ready,
            created_at: obj.metadata.creation_timestamp.as_ref().map(|t| t.0),
            labels,
        }
    }

    /// Organization from labels
    #[must_use]
    pub fn organization(&self) -> Option<&str> {
        self.labels.get(LABEL_ORGANIZATION).map(String::as_str)
    }
}

impl ClusterLocation {
    /// Location of a CAPI `Cluster`
    #[must_use]
    pub fn from_object(obj: &DynamicObject) -> Self {
        let endpoint = str_at(&obj.data, "/spec/controlPlaneEndpoint/host")
            .map(|host| control_plane_url(host, obj.data.pointer("/spec/controlPlaneEndpoint/port").and_then(Value::as_i64)));
        Self {
            name: obj.metadata.name.clone().unwrap_or_default(),
            namespace: obj.metadata.namespace.clone().unwrap_or_default(),
            endpoint,
        }
    }
}

/// Summaries of every cluster visible through `api`, sorted by namespace and name
pub async fn list_clusters(api: &dyn ManagementApi) -> Result<Vec<ClusterSummary>, FederationError> {
    let mut summaries: Vec<ClusterSummary> = api.list_clusters().await?.iter().map(ClusterSummary::from_object).collect();
    summaries.sort_by(|a, b| (&a.namespace, &a.name).cmp(&(&b.namespace, &b.name)));
    Ok(summaries)
}

async fn find_object(api: &dyn ManagementApi, name: &str) -> Result<DynamicObject, FederationError> {
    let mut matches: Vec<DynamicObject> = api
        .list_clusters()
        .await?
        .into_iter()
        .filter(|c| c.metadata.name.as_deref() == Some(name))
        .collect();
    match matches.len() {
        0 => Err(FederationError::ClusterNotFound {
            cluster: name.to_string(),
            reason: "no CAPI Cluster with this name is visible".to_string(),
        }),
        1 => Ok(matches.remove(0)),
        n => Err(FederationError::ClusterNotFound {
            cluster: name.to_string(),
            reason: format!("name is ambiguous across {n} namespaces"),
        }),
    }
}

/// Summary of one cluster by name
pub async fn cluster_summary(api: &dyn ManagementApi, name: &str) -> Result<ClusterSummary, FederationError> {
    find_object(api, name).await.map(|o| ClusterSummary::from_object(&o))
}

/// Namespace and endpoint of one cluster by name
pub async fn locate_cluster(api: &dyn ManagementApi, name: &str) -> Result<ClusterLocation, FederationError> {
    find_object(api, name).await.map(|o| ClusterLocation::from_object(&o))
}
