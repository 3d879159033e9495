//! Index functions over kube-bind kinds.

use kbind_store::{IndexFunc, IndexKeys};
use kube::ResourceExt;
use smallvec::smallvec;

use crate::{kube_bind_owners, APIServiceBinding, APIServiceExport, APIServiceExportResource};

pub const EXPORT_BY_EXPORT_RESOURCE: &str = "serviceExportByServiceExportResource";
pub const EXPORT_BY_GROUP_RESOURCE: &str = "byGroupResource";
pub const EXPORT_RESOURCE_BY_EXPORT: &str = "byOwnerExport";
pub const BINDING_BY_KUBECONFIG_SECRET: &str = "byKubeconfigSecret";

/// Exports by the `ns/resource.group` keys of the export resources they declare.
pub struct ExportByExportResource;

impl IndexFunc<APIServiceExport> for ExportByExportResource {
    const NAME: &'static str = EXPORT_BY_EXPORT_RESOURCE;
    fn index(obj: &APIServiceExport) -> IndexKeys {
        let ns = obj.namespace().unwrap_or_default();
        obj.spec.resources.iter().map(|gr| format!("{}/{}", ns, gr.key())).collect()
    }
}

/// Exports by `resource.group`, i.e. the name of the CRD they export.
pub struct ExportByGroupResource;

impl IndexFunc<APIServiceExport> for ExportByGroupResource {
    const NAME: &'static str = EXPORT_BY_GROUP_RESOURCE;
    fn index(obj: &APIServiceExport) -> IndexKeys { obj.spec.resources.iter().map(|gr| gr.key()).collect() }
}

/// Export resources by the `ns/name` of their owning export.
pub struct ExportResourceByExport;

impl IndexFunc<APIServiceExportResource> for ExportResourceByExport {
    const NAME: &'static str = EXPORT_RESOURCE_BY_EXPORT;
    fn index(obj: &APIServiceExportResource) -> IndexKeys {
        let ns = obj.namespace().unwrap_or_default();
        kube_bind_owners(obj.owner_references(), "APIServiceExport").map(|o| format!("{}/{}", ns, o.name)).collect()
    }
}

/// Bindings by the `ns/name` of the kubeconfig secret they connect through.
pub struct BindingByKubeconfigSecret;

impl BindingByKubeconfigSecret {
    pub fn key(namespace: &str, name: &str) -> String { format!("{}/{}", namespace, name) }
}

impl IndexFunc<APIServiceBinding> for BindingByKubeconfigSecret {
    const NAME: &'static str = BINDING_BY_KUBECONFIG_SECRET;
    fn index(obj: &APIServiceBinding) -> IndexKeys {
        let r = &obj.spec.kubeconfig_secret_ref;
        if r.namespace.is_empty() || r.name.is_empty() {
            return IndexKeys::new();
        }
        smallvec![Self::key(&r.namespace, &r.name)]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{APIServiceBindingSpec, APIServiceExportResourceSpec, APIServiceExportSpec, ClusterSecretKeyRef, GroupResource};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;

    fn export(ns: &str, name: &str, resources: &[(&str, &str)]) -> APIServiceExport {
        let mut e = APIServiceExport::new(name, APIServiceExportSpec {
            resources: resources.iter().map(|(g, r)| GroupResource::new(g, r)).collect(),
        });
        e.metadata.namespace = Some(ns.into());
        e
    }

    #[test]
    fn export_keys() {
        let e = export("team-a", "db", &[("example.com", "foos"), ("example.com", "bars")]);
        let by_resource = <ExportByExportResource as IndexFunc<APIServiceExport>>::index(&e);
        assert_eq!(by_resource.as_slice(), ["team-a/foos.example.com", "team-a/bars.example.com"]);
        let by_gr = <ExportByGroupResource as IndexFunc<APIServiceExport>>::index(&e);
        assert_eq!(by_gr.as_slice(), ["foos.example.com", "bars.example.com"]);
    }

    #[test]
    fn export_resource_owner_key_ignores_foreign_owners() {
        let mut r = APIServiceExportResource::new("foos.example.com", APIServiceExportResourceSpec::default());
        r.metadata.namespace = Some("team-a".into());
        r.metadata.owner_references = Some(vec![
            OwnerReference { api_version: "kube-bind.io/v1alpha1".into(), kind: "APIServiceExport".into(), name: "db".into(), uid: "1".into(), ..Default::default() },
            OwnerReference { api_version: "apps/v1".into(), kind: "APIServiceExport".into(), name: "other".into(), uid: "2".into(), ..Default::default() },
        ]);
        let keys = <ExportResourceByExport as IndexFunc<APIServiceExportResource>>::index(&r);
        assert_eq!(keys.as_slice(), ["team-a/db"]);
    }

    #[test]
    fn binding_secret_key() {
        let mut b = APIServiceBinding::new("foos", APIServiceBindingSpec {
            export: "db".into(),
            kubeconfig_secret_ref: ClusterSecretKeyRef { namespace: "kube-bind".into(), name: "kc".into(), key: "kubeconfig".into() },
        });
        assert_eq!(<BindingByKubeconfigSecret as IndexFunc<APIServiceBinding>>::index(&b).as_slice(), ["kube-bind/kc"]);
        b.spec.kubeconfig_secret_ref.name.clear();
        assert!(<BindingByKubeconfigSecret as IndexFunc<APIServiceBinding>>::index(&b).is_empty());
    }
}
