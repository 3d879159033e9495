//! ServiceNamespace lifecycle.
//!
//! Every `ServiceNamespace ns/name` owns a provider Namespace `ns-name`. Once the
//! consumer namespace `ns` carries its `ClusterBinding`, the consumer's service
//! account gets a Role and RoleBinding in that Namespace covering exactly the
//! group-resources exported in `ns`.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use anyhow::{anyhow, Context as _};
use k8s_openapi::api::core::v1::Namespace;
use k8s_openapi::api::rbac::v1::{PolicyRule, Role, RoleBinding, RoleRef, Subject};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::{Resource, ResourceExt};
use tracing::{debug, info};

use kbind_apis::{APIServiceExport, ClusterBinding, GroupResource, ServiceNamespace, CLUSTER_BINDING_NAME, SERVICE_NAMESPACE_ANNOTATION};
use kbind_core::{ignore_already_exists, ignore_not_found, ObjectKey, ObjectStore};
use kbind_runtime::{keys_from_index, Committer, Context, Controller, EventHandler, Reconciler};
use kbind_store::{Cache, NAMESPACE_INDEX};

use crate::{create_or_update, Watched};

pub const CONTROLLER: &str = "servicenamespace";

/// Name of the Role, RoleBinding and consumer ServiceAccount.
pub const KUBE_BINDER: &str = "kube-binder";

pub fn namespace_name(namespace: &str, name: &str) -> String { format!("{}-{}", namespace, name) }

/// Parse the `ns/name` value of the service namespace annotation.
pub fn service_namespace_from_annotation(value: &str) -> anyhow::Result<ObjectKey> {
    let key = ObjectKey::parse(value)?;
    if key.namespace.is_none() {
        anyhow::bail!("annotation value {:?} is not of the form namespace/name", value);
    }
    Ok(key)
}

pub struct ServiceNamespaceReconciler {
    pub namespaces: Arc<dyn ObjectStore<Namespace>>,
    pub namespace_cache: Cache<Namespace>,
    pub cluster_bindings: Cache<ClusterBinding>,
    pub exports: Cache<APIServiceExport>,
    pub roles: Arc<dyn ObjectStore<Role>>,
    pub role_bindings: Arc<dyn ObjectStore<RoleBinding>>,
}

impl ServiceNamespaceReconciler {
    async fn ensure_namespace(&self, namespace: &str, name: &str, target: &str) -> anyhow::Result<()> {
        if self.namespace_cache.get(&ObjectKey::cluster(target)).is_some() {
            return Ok(());
        }
        let ns = Namespace {
            metadata: ObjectMeta {
                name: Some(target.to_string()),
                annotations: Some(BTreeMap::from([(SERVICE_NAMESPACE_ANNOTATION.to_string(), format!("{}/{}", namespace, name))])),
                ..Default::default()
            },
            ..Default::default()
        };
        if ignore_already_exists(self.namespaces.create(&ns).await).with_context(|| format!("creating Namespace {}", target))?.is_some() {
            info!(controller = CONTROLLER, namespace = %target, "created namespace");
        }
        Ok(())
    }

    fn exported(&self, namespace: &str) -> BTreeSet<GroupResource> {
        self.exports.list_namespace(namespace).iter().flat_map(|e| e.spec.resources.iter().cloned()).collect()
    }

    async fn ensure_rbac(&self, namespace: &str, target: &str) -> anyhow::Result<()> {
        let rules: Vec<PolicyRule> = self
            .exported(namespace)
            .into_iter()
            .map(|gr| PolicyRule {
                api_groups: Some(vec![gr.group]),
                resources: Some(vec![gr.resource]),
                verbs: vec!["*".to_string()],
                ..Default::default()
            })
            .collect();
        let role = Role { metadata: meta(target), rules: Some(rules) };
        create_or_update(self.roles.as_ref(), role, |live: &mut Role, want: &Role| {
            if live.rules.as_deref().unwrap_or_default() == want.rules.as_deref().unwrap_or_default() {
                return false;
            }
            live.rules = want.rules.clone();
            true
        })
        .await
        .with_context(|| format!("ensuring Role {}/{}", target, KUBE_BINDER))?;

        let binding = RoleBinding {
            metadata: meta(target),
            role_ref: RoleRef { api_group: "rbac.authorization.k8s.io".into(), kind: "Role".into(), name: KUBE_BINDER.into() },
            subjects: Some(vec![Subject {
                kind: "ServiceAccount".into(),
                name: KUBE_BINDER.into(),
                namespace: Some(namespace.to_string()),
                api_group: None,
            }]),
        };
        // roleRef is immutable; a binding pointing elsewhere has to be replaced.
        let key = ObjectKey::namespaced(target, KUBE_BINDER);
        let live = ignore_not_found(self.role_bindings.get(&key).await).with_context(|| format!("getting RoleBinding {}", key))?;
        if live.is_some_and(|live| live.role_ref != binding.role_ref) {
            ignore_not_found(self.role_bindings.delete(&key).await).with_context(|| format!("deleting RoleBinding {}", key))?;
            info!(controller = CONTROLLER, role_binding = %key, "deleted role binding with stale roleRef");
        }
        create_or_update(self.role_bindings.as_ref(), binding, |live: &mut RoleBinding, want: &RoleBinding| {
            if live.subjects == want.subjects {
                return false;
            }
            live.subjects = want.subjects.clone();
            true
        })
        .await
        .with_context(|| format!("ensuring RoleBinding {}/{}", target, KUBE_BINDER))?;
        Ok(())
    }
}

fn meta(namespace: &str) -> ObjectMeta {
    ObjectMeta { name: Some(KUBE_BINDER.to_string()), namespace: Some(namespace.to_string()), ..Default::default() }
}

#[async_trait::async_trait]
impl Reconciler<ServiceNamespace> for ServiceNamespaceReconciler {
    async fn reconcile(&self, _ctx: &Context, sns: &mut ServiceNamespace) -> Vec<anyhow::Error> {
        let name = sns.name_any();
        let Some(namespace) = sns.namespace() else {
            return vec![anyhow!("ServiceNamespace {} has no namespace", name)];
        };
        let target = namespace_name(&namespace, &name);
        let mut errors = Vec::new();

        match self.ensure_namespace(&namespace, &name, &target).await {
            Ok(()) => sns.status.get_or_insert_with(Default::default).namespace = Some(target.clone()),
            Err(e) => errors.push(e),
        }

        if self.cluster_bindings.get(&ObjectKey::namespaced(&namespace, CLUSTER_BINDING_NAME)).is_some() {
            if let Err(e) = self.ensure_rbac(&namespace, &target).await {
                errors.push(e);
            }
        } else {
            debug!(controller = CONTROLLER, namespace = %namespace, "no cluster binding yet; skipping rbac");
        }
        errors
    }

    async fn absent(&self, _ctx: &Context, key: &ObjectKey) -> anyhow::Result<()> {
        let Some(namespace) = key.namespace() else { return Ok(()) };
        let target = namespace_name(namespace, &key.name);
        if ignore_not_found(self.namespaces.delete(&ObjectKey::cluster(&target)).await)
            .with_context(|| format!("deleting Namespace {}", target))?
            .is_some()
        {
            info!(controller = CONTROLLER, namespace = %target, "deleted namespace");
        }
        Ok(())
    }
}

pub fn controller(service_namespaces: &Watched<ServiceNamespace>, reconciler: ServiceNamespaceReconciler) -> Controller<ServiceNamespace> {
    Controller::new(CONTROLLER, service_namespaces.cache.clone(), reconciler, Committer::new(Arc::clone(&service_namespaces.store)))
}

fn in_namespace_of<K: Resource>(service_namespaces: &Cache<ServiceNamespace>, obj: &K) -> anyhow::Result<Vec<String>> {
    let namespace = obj.meta().namespace.as_deref().filter(|ns| !ns.is_empty()).ok_or_else(|| anyhow!("object has no namespace"))?;
    keys_from_index(service_namespaces, NAMESPACE_INDEX, namespace)
}

/// Route Namespace, ClusterBinding and export events to the service namespaces they affect.
pub fn wire(
    ctrl: &Controller<ServiceNamespace>,
    namespaces: &Cache<Namespace>,
    cluster_bindings: &Cache<ClusterBinding>,
    exports: &Cache<APIServiceExport>,
) {
    ctrl.watch_primary();

    EventHandler::mapped(CONTROLLER, "Namespace", ctrl.queue().clone(), |ns: &Namespace| {
        match ns.annotations().get(SERVICE_NAMESPACE_ANNOTATION) {
            Some(value) => Ok(vec![service_namespace_from_annotation(value)?.to_string()]),
            None => Ok(Vec::new()),
        }
    })
    .subscribe(namespaces);

    let sns = ctrl.cache().clone();
    EventHandler::mapped(CONTROLLER, "ClusterBinding", ctrl.queue().clone(), move |cb: &ClusterBinding| in_namespace_of(&sns, cb))
        .adds_only()
        .subscribe(cluster_bindings);

    let sns = ctrl.cache().clone();
    EventHandler::mapped(CONTROLLER, "APIServiceExport", ctrl.queue().clone(), move |e: &APIServiceExport| in_namespace_of(&sns, e))
        .only_when(|old: &APIServiceExport, new: &APIServiceExport| old.spec != new.spec)
        .subscribe(exports);
}
