//! kbind kubehub: object stores over the Kubernetes API and in memory

#![forbid(unsafe_code)]

use std::fmt::Debug;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use futures::StreamExt;
use kube::{
    api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams, WatchParams},
    config::{KubeConfigOptions, Kubeconfig},
    core::{ClusterResourceScope, ErrorResponse, NamespaceResourceScope, WatchEvent as KubeWatchEvent},
    Client, Resource, ResourceExt,
};
use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug, info};

use kbind_core::{
    ListScope, Listed, ObjectKey, ObjectStore, PatchTarget, StoreError, StoreResult, WatchEvent, WatchStream,
};

mod memory;

pub use memory::{Call, MemoryStore, Verb};

/// Client for the current kubeconfig context (or in-cluster config).
pub async fn default_client() -> Result<Client> {
    let client = Client::try_default().await.context("building kube client from default config")?;
    info!("kube client ready (default context)");
    Ok(client)
}

/// Client for an explicit kubeconfig file, e.g. the provider cluster of a binding.
pub async fn client_from_kubeconfig(path: &Path) -> Result<Client> {
    let kubeconfig = Kubeconfig::read_from(path).with_context(|| format!("reading kubeconfig {}", path.display()))?;
    let config = kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
        .await
        .context("loading kubeconfig")?;
    let client = Client::try_from(config).context("building kube client")?;
    info!(kubeconfig = %path.display(), "kube client ready");
    Ok(client)
}

fn from_response(e: ErrorResponse) -> StoreError {
    match e.code {
        404 => StoreError::NotFound(e.message),
        409 if e.reason == "AlreadyExists" => StoreError::AlreadyExists(e.message),
        409 => StoreError::Conflict(e.message),
        410 => StoreError::Expired(e.message),
        400 | 422 => StoreError::Invalid(e.message),
        _ => StoreError::Transport(format!("{} ({}): {}", e.reason, e.code, e.message)),
    }
}

/// Map kube-rs errors onto the store taxonomy.
pub fn map_kube_error(e: kube::Error) -> StoreError {
    match e {
        kube::Error::Api(resp) => from_response(resp),
        kube::Error::SerdeError(e) => StoreError::Invalid(e.to_string()),
        other => StoreError::Transport(other.to_string()),
    }
}

type ScopedApi<K> = fn(Client, Option<&str>) -> Api<K>;

/// `ObjectStore` over a kube-rs `Api<K>`. The scope (namespaced or cluster)
/// is fixed at construction.
pub struct KubeStore<K> {
    client: Client,
    scoped: ScopedApi<K>,
}

impl<K> Clone for KubeStore<K> {
    fn clone(&self) -> Self { Self { client: self.client.clone(), scoped: self.scoped } }
}

impl<K> KubeStore<K>
where
    K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>,
{
    pub fn namespaced(client: Client) -> Self {
        fn scoped<K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>>(c: Client, ns: Option<&str>) -> Api<K> {
            match ns {
                Some(ns) => Api::namespaced(c, ns),
                None => Api::all(c),
            }
        }
        Self { client, scoped: scoped::<K> }
    }
}

impl<K> KubeStore<K>
where
    K: Resource<Scope = ClusterResourceScope, DynamicType = ()>,
{
    pub fn cluster(client: Client) -> Self {
        fn scoped<K: Resource<Scope = ClusterResourceScope, DynamicType = ()>>(c: Client, _ns: Option<&str>) -> Api<K> {
            Api::all(c)
        }
        Self { client, scoped: scoped::<K> }
    }
}

impl<K> KubeStore<K> {
    fn api(&self, ns: Option<&str>) -> Api<K> { (self.scoped)(self.client.clone(), ns) }
}

fn name_of<K: Resource>(obj: &K) -> StoreResult<ObjectKey> {
    ObjectKey::of(obj).map_err(|e| StoreError::Invalid(e.to_string()))
}

#[async_trait::async_trait]
impl<K> ObjectStore<K> for KubeStore<K>
where
    K: Resource<DynamicType = ()> + Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    async fn get(&self, key: &ObjectKey) -> StoreResult<K> {
        self.api(key.namespace()).get(&key.name).await.map_err(map_kube_error)
    }

    async fn list(&self, scope: &ListScope) -> StoreResult<Listed<K>> {
        let mut lp = ListParams::default();
        let selector = scope.label_selector();
        if !selector.is_empty() {
            lp = lp.labels(&selector);
        }
        let list = self.api(scope.namespace.as_deref()).list(&lp).await.map_err(map_kube_error)?;
        let resource_version = list.metadata.resource_version.clone().unwrap_or_default();
        debug!(count = list.items.len(), rv = %resource_version, "listed");
        Ok(Listed { items: list.items, resource_version })
    }

    async fn watch(&self, scope: &ListScope, resource_version: &str) -> StoreResult<WatchStream<K>> {
        let mut wp = WatchParams::default();
        let selector = scope.label_selector();
        if !selector.is_empty() {
            wp = wp.labels(&selector);
        }
        let stream = self
            .api(scope.namespace.as_deref())
            .watch(&wp, resource_version)
            .await
            .map_err(map_kube_error)?;
        Ok(stream
            .map(|ev| match ev {
                Ok(KubeWatchEvent::Added(o)) => Ok(WatchEvent::Added(o)),
                Ok(KubeWatchEvent::Modified(o)) => Ok(WatchEvent::Modified(o)),
                Ok(KubeWatchEvent::Deleted(o)) => Ok(WatchEvent::Deleted(o)),
                Ok(KubeWatchEvent::Bookmark(b)) => Ok(WatchEvent::Bookmark(b.metadata.resource_version)),
                Ok(KubeWatchEvent::Error(e)) => Err(from_response(e)),
                Err(e) => Err(map_kube_error(e)),
            })
            .boxed())
    }

    async fn create(&self, obj: &K) -> StoreResult<K> {
        let key = name_of(obj)?;
        self.api(key.namespace()).create(&PostParams::default(), obj).await.map_err(map_kube_error)
    }

    async fn update(&self, obj: &K) -> StoreResult<K> {
        let key = name_of(obj)?;
        self.api(key.namespace()).replace(&key.name, &PostParams::default(), obj).await.map_err(map_kube_error)
    }

    async fn update_status(&self, obj: &K) -> StoreResult<K> {
        let key = name_of(obj)?;
        let status = serde_json::to_value(obj)?.get("status").cloned().unwrap_or_default();
        let patch = serde_json::json!({
            "metadata": { "resourceVersion": obj.resource_version() },
            "status": status,
        });
        self.patch(&key, PatchTarget::Status, &patch).await
    }

    async fn patch(&self, key: &ObjectKey, target: PatchTarget, patch: &serde_json::Value) -> StoreResult<K> {
        let api = self.api(key.namespace());
        let pp = PatchParams::default();
        let res = match target {
            PatchTarget::Main => api.patch(&key.name, &pp, &Patch::Merge(patch)).await,
            PatchTarget::Status => api.patch_status(&key.name, &pp, &Patch::Merge(patch)).await,
        };
        res.map_err(map_kube_error)
    }

    async fn delete(&self, key: &ObjectKey) -> StoreResult<()> {
        self.api(key.namespace())
            .delete(&key.name, &DeleteParams::default())
            .await
            .map(|_| ())
            .map_err(map_kube_error)
    }
}

/// Shared store for a namespaced kind.
pub fn namespaced_store<K>(client: &Client) -> Arc<dyn ObjectStore<K>>
where
    K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
        + Clone
        + Debug
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static,
{
    Arc::new(KubeStore::<K>::namespaced(client.clone()))
}

/// Shared store for a cluster-scoped kind.
pub fn cluster_store<K>(client: &Client) -> Arc<dyn ObjectStore<K>>
where
    K: Resource<Scope = ClusterResourceScope, DynamicType = ()> + Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    Arc::new(KubeStore::<K>::cluster(client.clone()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resp(code: u16, reason: &str) -> ErrorResponse {
        ErrorResponse { status: "Failure".into(), message: "m".into(), reason: reason.into(), code }
    }

    #[test]
    fn api_errors_map_to_taxonomy() {
        assert!(from_response(resp(404, "NotFound")).is_not_found());
        assert!(from_response(resp(409, "AlreadyExists")).is_already_exists());
        assert!(from_response(resp(409, "Conflict")).is_conflict());
        assert!(matches!(from_response(resp(410, "Expired")), StoreError::Expired(_)));
        assert!(matches!(from_response(resp(422, "Invalid")), StoreError::Invalid(_)));
        assert!(matches!(from_response(resp(500, "InternalError")), StoreError::Transport(_)));
    }
}
