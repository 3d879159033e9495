//! APIServiceExport lifecycle: keep one APIServiceExportResource per exported
//! group-resource, mirroring the provider's CRD, and prune the ones no longer declared.

use std::collections::BTreeSet;
use std::sync::Arc;

use anyhow::{anyhow, Context as _};
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::{Resource, ResourceExt};
use tracing::{debug, info};

use kbind_apis::indexers::{EXPORT_BY_EXPORT_RESOURCE, EXPORT_BY_GROUP_RESOURCE, EXPORT_RESOURCE_BY_EXPORT};
use kbind_apis::{
    kube_bind_owners, set_condition, APIServiceExport, APIServiceExportResource, APIServiceExportResourceSpec, Condition,
    ExportVersion, ResourceNames,
};
use kbind_core::{ignore_already_exists, ignore_not_found, ObjectKey, ObjectStore};
use kbind_runtime::{keys_from_index, Committer, Context, Controller, EventHandler, Reconciler};
use kbind_store::Cache;

use crate::Watched;

pub const CONTROLLER: &str = "serviceexport";

pub const RESOURCES_VALID: &str = "ResourcesValid";

/// Export resource spec mirroring a CRD. Only served versions are carried.
pub fn export_resource_spec(crd: &CustomResourceDefinition) -> APIServiceExportResourceSpec {
    let names = &crd.spec.names;
    APIServiceExportResourceSpec {
        group: crd.spec.group.clone(),
        names: ResourceNames {
            plural: names.plural.clone(),
            kind: names.kind.clone(),
            singular: names.singular.clone(),
            list_kind: names.list_kind.clone(),
            short_names: names.short_names.clone().unwrap_or_default(),
        },
        scope: crd.spec.scope.clone(),
        versions: crd
            .spec
            .versions
            .iter()
            .filter(|v| v.served)
            .map(|v| ExportVersion { name: v.name.clone(), served: v.served, storage: v.storage })
            .collect(),
    }
}

pub struct ServiceExportReconciler {
    pub export_resources: Arc<dyn ObjectStore<APIServiceExportResource>>,
    pub export_resource_cache: Cache<APIServiceExportResource>,
    pub crds: Cache<CustomResourceDefinition>,
}

fn owned_by(obj: &APIServiceExportResource, owner: &OwnerReference) -> bool {
    kube_bind_owners(obj.owner_references(), "APIServiceExport").any(|o| o.uid == owner.uid)
}

impl ServiceExportReconciler {
    async fn ensure_resource(&self, namespace: &str, name: &str, spec: APIServiceExportResourceSpec, owner: &OwnerReference) -> anyhow::Result<()> {
        let key = ObjectKey::namespaced(namespace, name);
        match self.export_resource_cache.get(&key) {
            None => {
                let obj = APIServiceExportResource {
                    metadata: ObjectMeta {
                        name: Some(name.to_string()),
                        namespace: Some(namespace.to_string()),
                        owner_references: Some(vec![owner.clone()]),
                        ..Default::default()
                    },
                    spec,
                    status: None,
                };
                if ignore_already_exists(self.export_resources.create(&obj).await).with_context(|| format!("creating APIServiceExportResource {}", key))?.is_some() {
                    info!(controller = CONTROLLER, resource = %key, "created export resource");
                }
            }
            Some(live) if live.spec != spec || !owned_by(&live, owner) => {
                let mut obj = APIServiceExportResource::clone(&live);
                obj.spec = spec;
                if !owned_by(&obj, owner) {
                    // Only one owner may be the controller; later exports join as plain owners.
                    let controlled = obj.owner_references().iter().any(|o| o.controller == Some(true));
                    let mut owner = owner.clone();
                    if controlled {
                        owner.controller = Some(false);
                    }
                    obj.owner_references_mut().push(owner);
                }
                self.export_resources.update(&obj).await.with_context(|| format!("updating APIServiceExportResource {}", key))?;
                info!(controller = CONTROLLER, resource = %key, "updated export resource");
            }
            Some(_) => {}
        }
        Ok(())
    }

    /// Release export resources no longer declared by this export. Resources still
    /// owned by another export lose only this export's owner reference.
    async fn prune(&self, namespace: &str, export: &str, owner: &OwnerReference, declared: &BTreeSet<String>) -> Vec<anyhow::Error> {
        let owned = match self.export_resource_cache.by_index(EXPORT_RESOURCE_BY_EXPORT, &format!("{}/{}", namespace, export)) {
            Ok(owned) => owned,
            Err(e) => return vec![e.into()],
        };
        let mut errors = Vec::new();
        for obj in owned {
            let name = obj.name_any();
            if declared.contains(&name) || !owned_by(&obj, owner) {
                continue;
            }
            let key = ObjectKey::namespaced(namespace, &name);
            let shared = kube_bind_owners(obj.owner_references(), "APIServiceExport").any(|o| o.uid != owner.uid);
            if shared {
                let mut obj = APIServiceExportResource::clone(&obj);
                disown(&mut obj, owner);
                match self.export_resources.update(&obj).await {
                    Ok(_) => info!(controller = CONTROLLER, resource = %key, export, "released shared export resource"),
                    Err(e) => errors.push(anyhow::Error::new(e).context(format!("updating APIServiceExportResource {}", key))),
                }
                continue;
            }
            match ignore_not_found(self.export_resources.delete(&key).await) {
                Ok(_) => info!(controller = CONTROLLER, resource = %key, "deleted undeclared export resource"),
                Err(e) => errors.push(anyhow::Error::new(e).context(format!("deleting APIServiceExportResource {}", key))),
            }
        }
        errors
    }
}

/// Drop `owner` from `obj`, handing the controller flag to the next export owner if it held it.
fn disown(obj: &mut APIServiceExportResource, owner: &OwnerReference) {
    let refs = obj.owner_references_mut();
    let was_controller = refs.iter().any(|o| o.uid == owner.uid && o.controller == Some(true));
    refs.retain(|o| o.uid != owner.uid);
    if was_controller && !refs.iter().any(|o| o.controller == Some(true)) {
        if let Some(next) = refs.iter_mut().find(|o| o.kind == "APIServiceExport") {
            next.controller = Some(true);
        }
    }
}

#[async_trait::async_trait]
impl Reconciler<APIServiceExport> for ServiceExportReconciler {
    async fn reconcile(&self, _ctx: &Context, export: &mut APIServiceExport) -> Vec<anyhow::Error> {
        let name = export.name_any();
        let Some(namespace) = export.namespace() else {
            return vec![anyhow!("APIServiceExport {} has no namespace", name)];
        };
        let Some(owner) = export.controller_owner_ref(&()) else {
            return vec![anyhow!("APIServiceExport {}/{} has no uid yet", namespace, name)];
        };

        let mut errors = Vec::new();
        let mut declared = BTreeSet::new();
        let mut missing = Vec::new();
        for gr in &export.spec.resources {
            let resource = gr.key();
            if !declared.insert(resource.clone()) {
                continue;
            }
            let Some(crd) = self.crds.get(&ObjectKey::cluster(&resource)) else {
                debug!(controller = CONTROLLER, export = %name, crd = %resource, "CRD not found");
                missing.push(resource);
                continue;
            };
            if let Err(e) = self.ensure_resource(&namespace, &resource, export_resource_spec(&crd), &owner).await {
                errors.push(e);
            }
        }
        errors.extend(self.prune(&namespace, &name, &owner, &declared).await);

        let cond = if missing.is_empty() {
            Condition::new(RESOURCES_VALID, true, "AllResourcesValid", "")
        } else {
            Condition::new(RESOURCES_VALID, false, "CustomResourceDefinitionNotFound", format!("CustomResourceDefinitions not found: {}", missing.join(", ")))
        };
        set_condition(&mut export.status.get_or_insert_with(Default::default).conditions, cond);
        errors
    }
}

pub fn controller(exports: &Watched<APIServiceExport>, reconciler: ServiceExportReconciler) -> Controller<APIServiceExport> {
    Controller::new(CONTROLLER, exports.cache.clone(), reconciler, Committer::new(Arc::clone(&exports.store)))
}

/// Route export resource and CRD events to the exports declaring them.
pub fn wire(ctrl: &Controller<APIServiceExport>, export_resources: &Cache<APIServiceExportResource>, crds: &Cache<CustomResourceDefinition>) {
    ctrl.watch_primary();

    let exports = ctrl.cache().clone();
    EventHandler::mapped(CONTROLLER, "APIServiceExportResource", ctrl.queue().clone(), move |r: &APIServiceExportResource| {
        let key = ObjectKey::of(r)?;
        keys_from_index(&exports, EXPORT_BY_EXPORT_RESOURCE, &key.to_string())
    })
    .subscribe(export_resources);

    let exports = ctrl.cache().clone();
    EventHandler::mapped(CONTROLLER, "CustomResourceDefinition", ctrl.queue().clone(), move |crd: &CustomResourceDefinition| {
        keys_from_index(&exports, EXPORT_BY_GROUP_RESOURCE, &ObjectKey::of(crd)?.name)
    })
    .subscribe(crds);
}
