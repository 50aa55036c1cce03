//! Management-cluster reads
//!
//! Federation needs three things from the management cluster: CAPI
//! `Cluster` objects, kubeconfig secrets and CA ConfigMaps. [`ManagementApi`]
//! is that surface; [`KubeManagementApi`] serves it from a `kube::Client`
//! authenticated as whichever identity the hybrid provider chose.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use kube::api::{Api, ApiResource, DynamicObject, GroupVersionKind, ListParams};

use super::error::FederationError;
use crate::failsafe::{RetryPolicy, with_retry};

/// CAPI API group
pub const CAPI_GROUP: &str = "cluster.x-k8s.io";
/// CAPI API version
pub const CAPI_VERSION: &str = "v1beta2";

/// `ApiResource` for CAPI `Cluster`
#[must_use]
pub fn capi_cluster_resource() -> ApiResource {
    ApiResource::from_gvk_with_plural(&GroupVersionKind::gvk(CAPI_GROUP, CAPI_VERSION, "Cluster"), "clusters")
}

/// Read access to management-cluster objects
#[async_trait]
pub trait ManagementApi: Send + Sync {
    /// All CAPI clusters visible to this identity
    async fn list_clusters(&self) -> Result<Vec<DynamicObject>, FederationError>;

    /// Secret data, `None` if the secret does not exist
    async fn secret_data(&self, namespace: &str, name: &str)
    -> Result<Option<BTreeMap<String, Vec<u8>>>, FederationError>;

    /// ConfigMap data, `None` if the ConfigMap does not exist
    async fn config_map_data(&self, namespace: &str, name: &str)
    -> Result<Option<BTreeMap<String, String>>, FederationError>;
}

/// [`ManagementApi`] over a Kubernetes client
pub struct KubeManagementApi {
    client: kube::Client,
    retry: RetryPolicy,
}

impl KubeManagementApi {
    /// Wrap `client`; reads are retried per `retry`
    #[must_use]
    pub fn new(client: kube::Client, retry: RetryPolicy) -> Self {
        Self { client, retry }
    }
}

fn is_transient(e: &kube::Error) -> bool {
    match e {
        kube::Error::Api(resp) => resp.code >= 500 || resp.code == 429,
        kube::Error::HyperError(_) | kube::Error::Service(_) => true,
        _ => false,
    }
}

#[async_trait]
impl ManagementApi for KubeManagementApi {
    async fn list_clusters(&self) -> Result<Vec<DynamicObject>, FederationError> {
        let api: Api<DynamicObject> = Api::all_with(self.client.clone(), &capi_cluster_resource());
        let params = ListParams::default();
        let list = with_retry(&self.retry, "list_capi_clusters", || api.list(&params), is_transient)
            .await
            .map_err(|e| match &e {
                kube::Error::Api(resp) if resp.code == 404 => FederationError::Kube(
                    "CAPI Cluster CRD is not installed on the management cluster".to_string(),
                ),
                _ => FederationError::from(e),
            })?;
        Ok(list.items)
    }

    async fn secret_data(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<BTreeMap<String, Vec<u8>>>, FederationError> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        let secret = with_retry(&self.retry, "get_secret", || api.get_opt(name), is_transient).await?;
        Ok(secret.map(|s| {
            s.data
                .unwrap_or_default()
                .into_iter()
                .map(|(k, v)| (k, v.0))
                .collect()
        }))
    }

    async fn config_map_data(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<BTreeMap<String, String>>, FederationError> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        let cm = with_retry(&self.retry, "get_configmap", || api.get_opt(name), is_transient).await?;
        Ok(cm.map(|c| c.data.unwrap_or_default()))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use parking_lot::Mutex;

    use super::*;

    /// In-memory management cluster
    #[derive(Default)]
    pub(crate) struct FakeManagement {
        pub clusters: Mutex<Vec<DynamicObject>>,
        pub secrets: Mutex<BTreeMap<(String, String), BTreeMap<String, Vec<u8>>>>,
        pub config_maps: Mutex<BTreeMap<(String, String), BTreeMap<String, String>>>,
        pub secret_reads: AtomicUsize,
        pub list_calls: AtomicUsize,
    }

    impl FakeManagement {
        pub(crate) fn add_cluster(&self, obj: serde_json::Value) {
            self.clusters.lock().push(serde_json::from_value(obj).unwrap());
        }

        pub(crate) fn add_secret(&self, namespace: &str, name: &str, key: &str, value: &[u8]) {
            self.secrets.lock().insert(
                (namespace.to_string(), name.to_string()),
                BTreeMap::from([(key.to_string(), value.to_vec())]),
            );
        }

        pub(crate) fn add_config_map(&self, namespace: &str, name: &str, key: &str, value: &str) {
            self.config_maps.lock().insert(
                (namespace.to_string(), name.to_string()),
                BTreeMap::from([(key.to_string(), value.to_string())]),
            );
        }
    }

    #[async_trait]
    impl ManagementApi for FakeManagement {
        async fn list_clusters(&self) -> Result<Vec<DynamicObject>, FederationError> {
            self.list_calls.fetch_add(1, Ordering::SeqCst);
            tokio::task::yield_now().await;
            Ok(self.clusters.lock().clone())
        }

        async fn secret_data(
            &self,
            namespace: &str,
            name: &str,
        ) -> Result<Option<BTreeMap<String, Vec<u8>>>, FederationError> {
            self.secret_reads.fetch_add(1, Ordering::SeqCst);
            Ok(self.secrets.lock().get(&(namespace.to_string(), name.to_string())).cloned())
        }

        async fn config_map_data(
            &self,
            namespace: &str,
            name: &str,
        ) -> Result<Option<BTreeMap<String, String>>, FederationError> {
            Ok(self.config_maps.lock().get(&(namespace.to_string(), name.to_string())).cloned())
        }
    }

    #[test]
    fn capi_resource_shape() {
        let ar = capi_cluster_resource();
        assert_eq!(ar.group, "cluster.x-k8s.io");
        assert_eq!(ar.plural, "clusters");
        assert_eq!(ar.api_version, "cluster.x-k8s.io/v1beta2");
    }

    #[tokio::test]
    async fn fake_reports_missing_objects_as_none() {
        let fake = FakeManagement::default();
        fake.add_secret("org-acme", "prod-kubeconfig", "value", b"x");
        assert!(fake.secret_data("org-acme", "prod-kubeconfig").await.unwrap().is_some());
        assert!(fake.secret_data("org-acme", "other").await.unwrap().is_none());
        assert!(fake.config_map_data("org-acme", "x").await.unwrap().is_none());
    }
}
