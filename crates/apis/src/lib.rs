//! kube-bind.io/v1alpha1 API kinds shared by the backend and the konnector

#![forbid(unsafe_code)]

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::{CustomResource, CustomResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub mod indexers;

pub const GROUP: &str = "kube-bind.io";
pub const VERSION: &str = "v1alpha1";

/// Annotation on a provider Namespace pointing back at its ServiceNamespace (`ns/name`).
pub const SERVICE_NAMESPACE_ANNOTATION: &str = "kube-bind.io/serviceNamespace";

/// The one ClusterBinding per consumer namespace carries this name.
pub const CLUSTER_BINDING_NAME: &str = "cluster";

/// A status condition.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, JsonSchema)]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: String,
    /// "True", "False" or "Unknown".
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl Condition {
    pub fn new(type_: &str, ok: bool, reason: &str, message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            type_: type_.to_string(),
            status: if ok { "True" } else { "False" }.to_string(),
            reason: Some(reason.to_string()),
            message: if message.is_empty() { None } else { Some(message) },
        }
    }

    pub fn is_true(&self) -> bool { self.status == "True" }
}

/// Insert or replace the condition of the same type. Returns true on change.
pub fn set_condition(conditions: &mut Vec<Condition>, cond: Condition) -> bool {
    match conditions.iter_mut().find(|c| c.type_ == cond.type_) {
        Some(existing) if *existing == cond => false,
        Some(existing) => {
            *existing = cond;
            true
        }
        None => {
            conditions.push(cond);
            true
        }
    }
}

pub fn find_condition<'a>(conditions: &'a [Condition], type_: &str) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.type_ == type_)
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, JsonSchema)]
pub struct GroupResource {
    #[serde(default)]
    pub group: String,
    pub resource: String,
}

impl GroupResource {
    pub fn new(group: &str, resource: &str) -> Self { Self { group: group.to_string(), resource: resource.to_string() } }

    /// `resource.group`, the name of the matching CRD.
    pub fn key(&self) -> String {
        if self.group.is_empty() {
            self.resource.clone()
        } else {
            format!("{}.{}", self.resource, self.group)
        }
    }
}

/// Provider-side handle on one consumer; its Namespace is `<namespace>-<name>`.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[kube(
    group = "kube-bind.io",
    version = "v1alpha1",
    kind = "ServiceNamespace",
    namespaced,
    status = "ServiceNamespaceStatus",
    derive = "PartialEq"
)]
pub struct ServiceNamespaceSpec {}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ServiceNamespaceStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
pub struct LocalSecretKeyRef {
    pub name: String,
    pub key: String,
}

/// Marks a consumer namespace as bound; named `cluster`.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[kube(
    group = "kube-bind.io",
    version = "v1alpha1",
    kind = "ClusterBinding",
    namespaced,
    status = "ClusterBindingStatus",
    derive = "PartialEq"
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterBindingSpec {
    pub provider_pretty_name: String,
    pub kubeconfig_secret_ref: LocalSecretKeyRef,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_provider_console_url: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct ClusterBindingStatus {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

/// Resources a provider exports into a consumer namespace.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[kube(
    group = "kube-bind.io",
    version = "v1alpha1",
    kind = "APIServiceExport",
    namespaced,
    status = "APIServiceExportStatus",
    derive = "PartialEq"
)]
pub struct APIServiceExportSpec {
    #[serde(default)]
    pub resources: Vec<GroupResource>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct APIServiceExportStatus {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ResourceNames {
    pub plural: String,
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub singular: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub list_kind: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub short_names: Vec<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
pub struct ExportVersion {
    pub name: String,
    pub served: bool,
    pub storage: bool,
}

/// One exported resource, named `resource.group`, mirroring its CRD.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[kube(
    group = "kube-bind.io",
    version = "v1alpha1",
    kind = "APIServiceExportResource",
    namespaced,
    status = "APIServiceExportResourceStatus",
    derive = "PartialEq"
)]
pub struct APIServiceExportResourceSpec {
    pub group: String,
    pub names: ResourceNames,
    /// "Namespaced" or "Cluster".
    pub scope: String,
    #[serde(default)]
    pub versions: Vec<ExportVersion>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct APIServiceExportResourceStatus {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
pub struct ClusterSecretKeyRef {
    pub namespace: String,
    pub name: String,
    pub key: String,
}

/// Consumer-side binding of one provider export.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[kube(
    group = "kube-bind.io",
    version = "v1alpha1",
    kind = "APIServiceBinding",
    status = "APIServiceBindingStatus",
    derive = "PartialEq"
)]
#[serde(rename_all = "camelCase")]
pub struct APIServiceBindingSpec {
    /// Name of the APIServiceExport in the provider namespace.
    pub export: String,
    pub kubeconfig_secret_ref: ClusterSecretKeyRef,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct APIServiceBindingStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_pretty_name: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

/// Owner references on `refs` pointing at kube-bind objects of `kind`.
pub fn kube_bind_owners<'a>(refs: &'a [OwnerReference], kind: &'a str) -> impl Iterator<Item = &'a OwnerReference> + 'a {
    refs.iter().filter(move |r| r.kind == kind && r.api_version.split('/').next() == Some(GROUP))
}

/// CRDs of every kube-bind kind.
pub fn crds() -> Vec<CustomResourceDefinition> {
    vec![
        ServiceNamespace::crd(),
        ClusterBinding::crd(),
        APIServiceExport::crd(),
        APIServiceExportResource::crd(),
        APIServiceBinding::crd(),
    ]
}
