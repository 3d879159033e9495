//! kbind konnector: consumer-side controllers talking to a provider cluster

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use kube::Client;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use kbind_apis::indexers::{BindingByKubeconfigSecret, ExportByExportResource};
use kbind_apis::{APIServiceBinding, APIServiceExport, APIServiceExportResource};
use kbind_core::{KeyError, ListScope, ObjectKey};
use kbind_kubehub::{cluster_store, namespaced_store};
use kbind_runtime::{Committer, Controller};
use kbind_store::{spawn_informer, Cache, Indexers, ReflectorConfig};

pub mod serviceexport;

pub use serviceexport::{ClusterExportReconciler, Connection};

#[derive(Debug, Clone)]
pub struct KonnectorOptions {
    pub provider_namespace: String,
    /// Consumer secret holding the provider kubeconfig.
    pub secret_ref: ObjectKey,
    pub workers: usize,
}

impl KonnectorOptions {
    /// `secret_ref` must be `namespace/name`.
    pub fn new(provider_namespace: &str, secret_ref: &str, workers: usize) -> Result<Self, KeyError> {
        let key = ObjectKey::parse(secret_ref)?;
        if key.namespace.is_none() {
            return Err(KeyError::Malformed(secret_ref.to_string()));
        }
        Ok(Self { provider_namespace: provider_namespace.to_string(), secret_ref: key, workers })
    }

    pub fn connection(&self) -> Connection {
        Connection::new(&self.provider_namespace, self.secret_ref.namespace().unwrap_or_default(), &self.secret_ref.name)
    }
}

fn sync_timeout() -> Duration {
    Duration::from_secs(std::env::var("KBIND_SYNC_TIMEOUT_SECS").ok().and_then(|s| s.parse::<u64>().ok()).unwrap_or(60))
}

/// Run the cluster export sync controller until `token` is cancelled.
pub async fn run(consumer: Client, provider: Client, opts: KonnectorOptions, token: CancellationToken) -> Result<()> {
    let connection = opts.connection();
    let scope = ListScope::namespace(&connection.provider_namespace);

    let mut export_indexers = Indexers::<APIServiceExport>::new();
    export_indexers.add::<ExportByExportResource>()?;
    let mut binding_indexers = Indexers::<APIServiceBinding>::new();
    binding_indexers.add::<BindingByKubeconfigSecret>()?;

    let export_store = namespaced_store::<APIServiceExport>(&provider);
    let exports = Cache::new("APIServiceExport", export_indexers);
    let export_resources = Cache::new("APIServiceExportResource", Indexers::<APIServiceExportResource>::new());
    let bindings = Cache::new("APIServiceBinding", binding_indexers);

    let ctrl = Arc::new(Controller::new(
        serviceexport::CONTROLLER,
        exports.clone(),
        ClusterExportReconciler { connection: connection.clone(), bindings: bindings.clone(), export_resources: export_resources.clone() },
        Committer::new(Arc::clone(&export_store)),
    ));
    serviceexport::wire(&ctrl, &connection, &export_resources, &bindings);

    spawn_informer(&exports, Arc::clone(&export_store), ReflectorConfig::scoped(scope.clone()), token.clone());
    spawn_informer(
        &export_resources,
        namespaced_store::<APIServiceExportResource>(&provider),
        ReflectorConfig::scoped(scope),
        token.clone(),
    );
    spawn_informer(&bindings, cluster_store::<APIServiceBinding>(&consumer), ReflectorConfig::default(), token.clone());

    let timeout = sync_timeout();
    for (kind, synced) in [
        (exports.kind(), exports.wait_synced(timeout).await),
        (export_resources.kind(), export_resources.wait_synced(timeout).await),
        (bindings.kind(), bindings.wait_synced(timeout).await),
    ] {
        if !synced {
            warn!(kind, "cache not synced before timeout; starting anyway");
        }
    }
    info!(provider_namespace = %connection.provider_namespace, secret = %connection.secret, workers = opts.workers, "konnector starting");

    ctrl.run(opts.workers, token).await;
    info!("konnector stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn secret_ref_must_be_namespaced() {
        let opts = KonnectorOptions::new("kube-bind-abcde", "kube-bind/kubeconfig", 2).unwrap();
        assert_eq!(opts.connection(), Connection::new("kube-bind-abcde", "kube-bind", "kubeconfig"));
        assert_eq!(opts.connection().secret, "kube-bind/kubeconfig");
        assert!(KonnectorOptions::new("kube-bind-abcde", "kubeconfig", 2).is_err());
    }
}
