use crate::error::*;
use k8s_openapi::api::core::v1::{Node, Pod};
use kube::api::{Api, DeleteParams, ListParams, PostParams};
use tokio::runtime::Runtime;

type ApiResult<T> = std::result::Result<T, ApiError>;

/// The part of the Kubernetes API needed to prepull images
///
/// Shared by every per-node worker, hence `Send + Sync`.
pub trait ClusterApi: Send + Sync {
    fn list_nodes(&self) -> ApiResult<Vec<Node>>;
    fn create_pod(&self, namespace: &str, pod: &Pod) -> ApiResult<Pod>;
    fn read_pod(&self, namespace: &str, name: &str) -> ApiResult<Pod>;
    fn list_pods(&self, namespace: &str) -> ApiResult<Vec<Pod>>;
    fn delete_pod(&self, namespace: &str, name: &str) -> ApiResult<()>;

    /// Namespace used when none is configured
    fn default_namespace(&self) -> &str {
        "default"
    }
}

/// [ClusterApi] of a real cluster
///
/// Calls are driven to completion on an owned runtime, so the caller stays
/// on plain threads.
pub struct KubeCluster {
    client: kube::Client,
    runtime: Runtime,
}

impl KubeCluster {
    /// Connect using in-cluster configuration or the local kubeconfig
    pub fn new() -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()?;
        let client = runtime
            .block_on(kube::Client::try_default())
            .map_err(|e| Error::ClusterQuery {
                resource: "client configuration",
                source: e.into(),
            })?;
        Ok(KubeCluster { client, runtime })
    }

    fn pods(&self, namespace: &str) -> Api<Pod> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

impl ClusterApi for KubeCluster {
    fn list_nodes(&self) -> ApiResult<Vec<Node>> {
        let nodes: Api<Node> = Api::all(self.client.clone());
        let list = self.runtime.block_on(nodes.list(&ListParams::default()))?;
        Ok(list.items)
    }

    fn create_pod(&self, namespace: &str, pod: &Pod) -> ApiResult<Pod> {
        let pods = self.pods(namespace);
        Ok(self
            .runtime
            .block_on(pods.create(&PostParams::default(), pod))?)
    }

    fn read_pod(&self, namespace: &str, name: &str) -> ApiResult<Pod> {
        let pods = self.pods(namespace);
        Ok(self.runtime.block_on(pods.get(name))?)
    }

    fn list_pods(&self, namespace: &str) -> ApiResult<Vec<Pod>> {
        let pods = self.pods(namespace);
        let list = self.runtime.block_on(pods.list(&ListParams::default()))?;
        Ok(list.items)
    }

    fn delete_pod(&self, namespace: &str, name: &str) -> ApiResult<()> {
        let pods = self.pods(namespace);
        self.runtime
            .block_on(pods.delete(name, &DeleteParams::default()))?;
        Ok(())
    }

    /// Namespace of the service account in-cluster, or of the kubeconfig context
    fn default_namespace(&self) -> &str {
        self.client.default_namespace()
    }
}

/// Delete a pod, treating an already deleted pod as success
///
/// Returns `false` when the pod did not exist.
pub(crate) fn delete_pod<C: ClusterApi + ?Sized>(
    cluster: &C,
    namespace: &str,
    name: &str,
) -> Result<bool> {
    log::debug!("Deleting pod {}", name);
    match cluster.delete_pod(namespace, name) {
        Ok(()) => Ok(true),
        Err(e) if e.is_not_found() => {
            log::debug!("Pod '{}' already gone", name);
            Ok(false)
        }
        Err(source) => Err(Error::PodLifecycle {
            operation: "delete",
            pod: name.to_string(),
            namespace: namespace.to_string(),
            source,
        }),
    }
}
