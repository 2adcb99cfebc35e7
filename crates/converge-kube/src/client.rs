//! Dynamic resource client
//!
//! Every read comes back as a JSON [`Snapshot`] so that the core observers can
//! classify it without knowing the typed Kubernetes API.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use converge_core::Snapshot;
use http::Request;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, DeleteParams, DynamicObject, ListParams, LogParams, Patch, PatchParams, PostParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use crate::resource::ResourceKind;
use crate::retry::{retry_api_call, retry_with_backoff, RetryConfig};
use crate::Error;

/// Default connection timeout for kube clients
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Default read timeout for kube clients
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Read and write access to cluster resources, addressed by kind
///
/// `namespace` is ignored for cluster-scoped kinds. An empty `namespace`
/// addresses all namespaces and an empty `label_selector` lists everything.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ResourceClient: Send + Sync {
    /// Fetch one resource
    async fn get(&self, kind: &ResourceKind, namespace: &str, name: &str)
        -> Result<Snapshot, Error>;

    /// List resources matching a label selector
    async fn list(
        &self,
        kind: &ResourceKind,
        namespace: &str,
        label_selector: &str,
    ) -> Result<Vec<Snapshot>, Error>;

    /// Create a resource from its JSON manifest
    async fn create(
        &self,
        kind: &ResourceKind,
        namespace: &str,
        object: &Snapshot,
    ) -> Result<Snapshot, Error>;

    /// Apply a JSON merge patch
    async fn patch(
        &self,
        kind: &ResourceKind,
        namespace: &str,
        name: &str,
        patch: &Snapshot,
    ) -> Result<Snapshot, Error>;

    /// Delete a resource (the deletion may still be in progress on return)
    async fn delete(&self, kind: &ResourceKind, namespace: &str, name: &str) -> Result<(), Error>;

    /// Read the full log of a pod's default container
    async fn logs(&self, namespace: &str, pod: &str) -> Result<String, Error>;

    /// GET `path` on a pod port through the API server proxy
    async fn proxy_get(
        &self,
        namespace: &str,
        pod: &str,
        port: u16,
        path: &str,
    ) -> Result<String, Error>;

    /// Kubernetes version reported by the API server (e.g. "v1.27.6+f67aeb3")
    async fn server_version(&self) -> Result<String, Error>;
}

/// [`ResourceClient`] backed by a live kube client
///
/// Writes are retried with backoff on transient errors. Reads are not, since
/// every read happens inside a poll that has its own attempt budget.
#[derive(Clone)]
pub struct KubeResourceClient {
    client: Client,
    retry: RetryConfig,
}

impl KubeResourceClient {
    /// Wrap an existing client
    pub fn new(client: Client) -> Self {
        Self {
            client,
            retry: RetryConfig::default(),
        }
    }

    /// Use `retry` for writes
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    fn api(&self, kind: &ResourceKind, namespace: &str) -> Api<DynamicObject> {
        let ar = kind.api_resource();
        if kind.namespaced && !namespace.is_empty() {
            Api::namespaced_with(self.client.clone(), namespace, &ar)
        } else {
            Api::all_with(self.client.clone(), &ar)
        }
    }
}

fn to_snapshot(kind: &ResourceKind, obj: &DynamicObject) -> Result<Snapshot, Error> {
    serde_json::to_value(obj).map_err(|e| Error::serialization_for_kind(kind.kind, e.to_string()))
}

#[async_trait]
impl ResourceClient for KubeResourceClient {
    async fn get(
        &self,
        kind: &ResourceKind,
        namespace: &str,
        name: &str,
    ) -> Result<Snapshot, Error> {
        let obj = self.api(kind, namespace).get(name).await?;
        to_snapshot(kind, &obj)
    }

    async fn list(
        &self,
        kind: &ResourceKind,
        namespace: &str,
        label_selector: &str,
    ) -> Result<Vec<Snapshot>, Error> {
        let mut lp = ListParams::default();
        if !label_selector.is_empty() {
            lp = lp.labels(label_selector);
        }
        let list = self.api(kind, namespace).list(&lp).await?;
        list.items.iter().map(|obj| to_snapshot(kind, obj)).collect()
    }

    async fn create(
        &self,
        kind: &ResourceKind,
        namespace: &str,
        object: &Snapshot,
    ) -> Result<Snapshot, Error> {
        let obj: DynamicObject = serde_json::from_value(object.clone())
            .map_err(|e| Error::serialization_for_kind(kind.kind, e.to_string()))?;
        let name = obj.metadata.name.clone().unwrap_or_default();
        debug!(kind = %kind, namespace = %namespace, name = %name, "Creating resource");
        let api = self.api(kind, namespace);
        let created = retry_api_call(&self.retry, "create", || async {
            Ok(api.create(&PostParams::default(), &obj).await?)
        })
        .await?;
        to_snapshot(kind, &created)
    }

    async fn patch(
        &self,
        kind: &ResourceKind,
        namespace: &str,
        name: &str,
        patch: &Snapshot,
    ) -> Result<Snapshot, Error> {
        debug!(kind = %kind, namespace = %namespace, name = %name, "Patching resource");
        let api = self.api(kind, namespace);
        let patched = retry_api_call(&self.retry, "patch", || async {
            Ok(api
                .patch(name, &PatchParams::default(), &Patch::Merge(patch))
                .await?)
        })
        .await?;
        to_snapshot(kind, &patched)
    }

    async fn delete(&self, kind: &ResourceKind, namespace: &str, name: &str) -> Result<(), Error> {
        debug!(kind = %kind, namespace = %namespace, name = %name, "Deleting resource");
        let api = self.api(kind, namespace);
        retry_api_call(&self.retry, "delete", || async {
            api.delete(name, &DeleteParams::default()).await?;
            Ok(())
        })
        .await
    }

    async fn logs(&self, namespace: &str, pod: &str) -> Result<String, Error> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        Ok(pods.logs(pod, &LogParams::default()).await?)
    }

    async fn proxy_get(
        &self,
        namespace: &str,
        pod: &str,
        port: u16,
        path: &str,
    ) -> Result<String, Error> {
        let uri = pod_proxy_path(namespace, pod, port, path);
        debug!(uri = %uri, "Proxying GET to pod");
        let request = Request::get(&uri)
            .body(Vec::new())
            .map_err(|e| Error::internal_with_context("proxy_get", e.to_string()))?;
        Ok(self.client.request_text(request).await?)
    }

    async fn server_version(&self) -> Result<String, Error> {
        Ok(self.client.apiserver_version().await?.git_version)
    }
}

/// API server path proxying to `path` on port `port` of a pod
pub fn pod_proxy_path(namespace: &str, pod: &str, port: u16, path: &str) -> String {
    format!(
        "/api/v1/namespaces/{}/pods/{}:{}/proxy/{}",
        namespace,
        pod,
        port,
        path.trim_start_matches('/')
    )
}

/// Create a resource, or fetch it if it already exists
pub async fn ensure_created(
    client: &dyn ResourceClient,
    kind: &ResourceKind,
    namespace: &str,
    object: &Snapshot,
) -> Result<Snapshot, Error> {
    match client.create(kind, namespace, object).await {
        Ok(created) => Ok(created),
        Err(e) if e.is_already_exists() => {
            let name = object
                .pointer("/metadata/name")
                .and_then(|v| v.as_str())
                .ok_or_else(|| Error::serialization_for_kind(kind.kind, "manifest has no metadata.name"))?;
            debug!(kind = %kind, namespace = %namespace, name = %name, "Resource already exists");
            client.get(kind, namespace, name).await
        }
        Err(e) => Err(e),
    }
}

/// Create a kube client from an optional kubeconfig path
///
/// Falls back to the in-cluster or default kubeconfig when `kubeconfig` is
/// `None`. Transient failures are retried with backoff.
pub async fn create_client(kubeconfig: Option<&Path>) -> Result<Client, Error> {
    retry_with_backoff(&RetryConfig::default(), "create_client", || {
        create_client_with_timeout(kubeconfig, DEFAULT_CONNECT_TIMEOUT, DEFAULT_READ_TIMEOUT)
    })
    .await
}

/// Create a kube client with custom timeouts
pub async fn create_client_with_timeout(
    kubeconfig: Option<&Path>,
    connect_timeout: Duration,
    read_timeout: Duration,
) -> Result<Client, Error> {
    let mut config = match kubeconfig {
        Some(path) => {
            let kubeconfig = Kubeconfig::read_from(path).map_err(|e| {
                Error::internal_with_context(
                    "create_client",
                    format!("failed to read kubeconfig {}: {}", path.display(), e),
                )
            })?;
            Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                .await
                .map_err(|e| {
                    Error::internal_with_context(
                        "create_client",
                        format!("failed to load kubeconfig: {}", e),
                    )
                })?
        }
        None => Config::infer().await.map_err(|e| {
            Error::internal_with_context("create_client", format!("failed to infer config: {}", e))
        })?,
    };
    config.connect_timeout = Some(connect_timeout);
    config.read_timeout = Some(read_timeout);

    Client::try_from(config).map_err(|e| {
        Error::internal_with_context("create_client", format!("failed to create client: {}", e))
    })
}
