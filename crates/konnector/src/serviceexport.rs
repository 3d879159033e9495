//! Cluster export sync: reflect on each provider APIServiceExport whether this
//! consumer binds it and whether its export resources are published.

use anyhow::anyhow;
use kube::ResourceExt;
use tracing::debug;

use kbind_apis::indexers::{BindingByKubeconfigSecret, BINDING_BY_KUBECONFIG_SECRET, EXPORT_BY_EXPORT_RESOURCE};
use kbind_apis::{set_condition, APIServiceBinding, APIServiceExport, APIServiceExportResource, Condition};
use kbind_core::ObjectKey;
use kbind_runtime::{keys_from_index, Context, Controller, EventHandler, Reconciler};
use kbind_store::Cache;

pub const CONTROLLER: &str = "konnector-serviceexport";

pub const CONNECTED: &str = "Connected";
pub const RESOURCES_AVAILABLE: &str = "ResourcesAvailable";

/// Which consumer connection this konnector serves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connection {
    pub provider_namespace: String,
    /// `ns/name` of the consumer secret holding the provider kubeconfig.
    pub secret: String,
}

impl Connection {
    pub fn new(provider_namespace: &str, secret_namespace: &str, secret_name: &str) -> Self {
        Self { provider_namespace: provider_namespace.to_string(), secret: BindingByKubeconfigSecret::key(secret_namespace, secret_name) }
    }

    fn serves(&self, binding: &APIServiceBinding) -> bool {
        let r = &binding.spec.kubeconfig_secret_ref;
        BindingByKubeconfigSecret::key(&r.namespace, &r.name) == self.secret
    }
}

pub struct ClusterExportReconciler {
    pub connection: Connection,
    pub bindings: Cache<APIServiceBinding>,
    pub export_resources: Cache<APIServiceExportResource>,
}

#[async_trait::async_trait]
impl Reconciler<APIServiceExport> for ClusterExportReconciler {
    async fn reconcile(&self, _ctx: &Context, export: &mut APIServiceExport) -> Vec<anyhow::Error> {
        let name = export.name_any();
        if export.namespace().as_deref() != Some(self.connection.provider_namespace.as_str()) {
            return vec![anyhow!("APIServiceExport {} is outside provider namespace {}", name, self.connection.provider_namespace)];
        }
        let mut errors = Vec::new();

        let connected = match self.bindings.by_index(BINDING_BY_KUBECONFIG_SECRET, &self.connection.secret) {
            Ok(bindings) => {
                let mut bound: Vec<String> = bindings.iter().filter(|b| b.spec.export == name).map(|b| b.name_any()).collect();
                bound.sort();
                Some(if bound.is_empty() {
                    Condition::new(CONNECTED, false, "NoBinding", "no APIServiceBinding references this export")
                } else {
                    Condition::new(CONNECTED, true, "Bound", format!("bound by {}", bound.join(", ")))
                })
            }
            Err(e) => {
                errors.push(e.into());
                None
            }
        };

        let missing: Vec<String> = export
            .spec
            .resources
            .iter()
            .map(|gr| gr.key())
            .filter(|r| self.export_resources.get(&ObjectKey::namespaced(&self.connection.provider_namespace, r)).is_none())
            .collect();
        debug!(controller = CONTROLLER, export = %name, missing = missing.len(), "checked export resources");
        let available = if missing.is_empty() {
            Condition::new(RESOURCES_AVAILABLE, true, "Available", "")
        } else {
            Condition::new(RESOURCES_AVAILABLE, false, "ResourcesMissing", format!("export resources not found: {}", missing.join(", ")))
        };

        let status = export.status.get_or_insert_with(Default::default);
        if let Some(cond) = connected {
            set_condition(&mut status.conditions, cond);
        }
        set_condition(&mut status.conditions, available);
        errors
    }
}

/// Route export resource and binding events to the provider exports they concern.
pub fn wire(
    ctrl: &Controller<APIServiceExport>,
    connection: &Connection,
    export_resources: &Cache<APIServiceExportResource>,
    bindings: &Cache<APIServiceBinding>,
) {
    ctrl.watch_primary();

    let exports = ctrl.cache().clone();
    let provider_namespace = connection.provider_namespace.clone();
    EventHandler::mapped(CONTROLLER, "APIServiceExportResource", ctrl.queue().clone(), move |r: &APIServiceExportResource| {
        let key = ObjectKey::of(r)?;
        if key.namespace() != Some(provider_namespace.as_str()) {
            return Ok(Vec::new());
        }
        keys_from_index(&exports, EXPORT_BY_EXPORT_RESOURCE, &key.to_string())
    })
    .subscribe(export_resources);

    let connection = connection.clone();
    EventHandler::mapped(CONTROLLER, "APIServiceBinding", ctrl.queue().clone(), move |b: &APIServiceBinding| {
        if !connection.serves(b) || b.spec.export.is_empty() {
            return Ok(Vec::new());
        }
        Ok(vec![ObjectKey::namespaced(&connection.provider_namespace, &b.spec.export).to_string()])
    })
    .subscribe(bindings);
}
