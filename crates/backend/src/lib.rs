//! kbind backend: provider-side controllers for service namespaces and exports

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use k8s_openapi::api::core::v1::Namespace;
use k8s_openapi::api::rbac::v1::{Role, RoleBinding};
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::{Client, Resource};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use kbind_apis::indexers::{ExportByExportResource, ExportByGroupResource, ExportResourceByExport};
use kbind_apis::{APIServiceExport, APIServiceExportResource, ClusterBinding, ServiceNamespace};
use kbind_core::{ObjectKey, ObjectStore, StoreError, StoreResult};
use kbind_kubehub::{cluster_store, namespaced_store};
use kbind_store::{spawn_informer, Cache, Indexers, ReflectorConfig};

pub mod serviceexport;
pub mod servicenamespace;

pub use serviceexport::ServiceExportReconciler;
pub use servicenamespace::ServiceNamespaceReconciler;

const UPDATE_RETRIES: usize = 5;

/// Get-then-create-or-update against the authoritative store. `refresh` copies
/// the desired fields onto the live object and reports whether anything changed.
/// Creation races and stale updates are retried a bounded number of times.
pub async fn create_or_update<K, F>(store: &dyn ObjectStore<K>, desired: K, refresh: F) -> StoreResult<K>
where
    K: Resource + Clone + Send + Sync,
    F: Fn(&mut K, &K) -> bool + Send + Sync,
{
    let key = ObjectKey::of(&desired).map_err(|e| StoreError::Invalid(e.to_string()))?;
    let mut attempts = 0;
    loop {
        match store.get(&key).await {
            Ok(mut live) => {
                if !refresh(&mut live, &desired) {
                    return Ok(live);
                }
                match store.update(&live).await {
                    Err(e) if e.is_conflict() && attempts < UPDATE_RETRIES => attempts += 1,
                    res => return res,
                }
            }
            Err(e) if e.is_not_found() => match store.create(&desired).await {
                Err(e) if e.is_already_exists() && attempts < UPDATE_RETRIES => attempts += 1,
                res => return res,
            },
            Err(e) => return Err(e),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BackendOptions {
    pub workers: usize,
}

impl Default for BackendOptions {
    fn default() -> Self {
        let workers = std::env::var("KBIND_WORKERS").ok().and_then(|s| s.parse::<usize>().ok()).unwrap_or(2);
        Self { workers }
    }
}

pub fn sync_timeout() -> Duration {
    Duration::from_secs(std::env::var("KBIND_SYNC_TIMEOUT_SECS").ok().and_then(|s| s.parse::<u64>().ok()).unwrap_or(60))
}

/// A watched kind: its authoritative store and the cache mirroring it.
pub struct Watched<K> {
    pub store: Arc<dyn ObjectStore<K>>,
    pub cache: Cache<K>,
}

impl<K> Watched<K>
where
    K: Resource + Clone + Send + Sync + 'static,
{
    pub fn new(kind: &'static str, store: Arc<dyn ObjectStore<K>>, indexers: Indexers<K>) -> Self {
        Self { store, cache: Cache::new(kind, indexers) }
    }

    pub fn start(&self, token: &CancellationToken) {
        spawn_informer(&self.cache, Arc::clone(&self.store), ReflectorConfig::default(), token.clone());
    }
}

/// Wait for `cache` to sync; one that does not is logged and left to catch up.
pub async fn wait_synced<K>(cache: &Cache<K>, timeout: Duration) -> bool
where
    K: Resource + Send + Sync + 'static,
{
    let synced = cache.wait_synced(timeout).await;
    if !synced {
        warn!(kind = cache.kind(), "cache not synced before timeout; starting anyway");
    }
    synced
}

/// Run the service namespace and export controllers until `token` is cancelled.
pub async fn run(client: Client, opts: BackendOptions, token: CancellationToken) -> Result<()> {
    let mut export_indexers = Indexers::<APIServiceExport>::new();
    export_indexers.add::<ExportByExportResource>()?;
    export_indexers.add::<ExportByGroupResource>()?;
    let mut resource_indexers = Indexers::<APIServiceExportResource>::new();
    resource_indexers.add::<ExportResourceByExport>()?;

    let service_namespaces = Watched::<ServiceNamespace>::new("ServiceNamespace", namespaced_store(&client), Indexers::new());
    let cluster_bindings = Watched::<ClusterBinding>::new("ClusterBinding", namespaced_store(&client), Indexers::new());
    let exports = Watched::<APIServiceExport>::new("APIServiceExport", namespaced_store(&client), export_indexers);
    let export_resources =
        Watched::<APIServiceExportResource>::new("APIServiceExportResource", namespaced_store(&client), resource_indexers);
    let namespaces = Watched::<Namespace>::new("Namespace", cluster_store(&client), Indexers::new());
    let crds = Watched::<CustomResourceDefinition>::new("CustomResourceDefinition", cluster_store(&client), Indexers::new());
    let roles = namespaced_store::<Role>(&client);
    let role_bindings = namespaced_store::<RoleBinding>(&client);

    let sns_ctrl = Arc::new(servicenamespace::controller(
        &service_namespaces,
        ServiceNamespaceReconciler {
            namespaces: Arc::clone(&namespaces.store),
            namespace_cache: namespaces.cache.clone(),
            cluster_bindings: cluster_bindings.cache.clone(),
            exports: exports.cache.clone(),
            roles,
            role_bindings,
        },
    ));
    servicenamespace::wire(&sns_ctrl, &namespaces.cache, &cluster_bindings.cache, &exports.cache);

    let export_ctrl = Arc::new(serviceexport::controller(
        &exports,
        ServiceExportReconciler {
            export_resources: Arc::clone(&export_resources.store),
            export_resource_cache: export_resources.cache.clone(),
            crds: crds.cache.clone(),
        },
    ));
    serviceexport::wire(&export_ctrl, &export_resources.cache, &crds.cache);

    service_namespaces.start(&token);
    cluster_bindings.start(&token);
    exports.start(&token);
    export_resources.start(&token);
    namespaces.start(&token);
    crds.start(&token);

    let timeout = sync_timeout();
    wait_synced(&service_namespaces.cache, timeout).await;
    wait_synced(&cluster_bindings.cache, timeout).await;
    wait_synced(&exports.cache, timeout).await;
    wait_synced(&export_resources.cache, timeout).await;
    wait_synced(&namespaces.cache, timeout).await;
    wait_synced(&crds.cache, timeout).await;
    info!(workers = opts.workers, "backend controllers starting");

    let a = tokio::spawn(Arc::clone(&sns_ctrl).run(opts.workers, token.clone()));
    let b = tokio::spawn(Arc::clone(&export_ctrl).run(opts.workers, token.clone()));
    let (ra, rb) = tokio::join!(a, b);
    ra?;
    rb?;
    info!("backend stopped");
    Ok(())
}
