#![forbid(unsafe_code)]

use std::sync::Arc;

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::{
    CustomResourceDefinition, CustomResourceDefinitionNames, CustomResourceDefinitionSpec, CustomResourceDefinitionVersion,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kbind_apis::indexers::{
    ExportByExportResource, ExportByGroupResource, ExportResourceByExport, EXPORT_BY_GROUP_RESOURCE, EXPORT_RESOURCE_BY_EXPORT,
};
use kbind_apis::{find_condition, APIServiceExport, APIServiceExportResource, APIServiceExportResourceSpec, APIServiceExportSpec, GroupResource};
use kbind_backend::serviceexport::{self, CONTROLLER, RESOURCES_VALID};
use kbind_backend::{ServiceExportReconciler, Watched};
use kbind_core::{Delta, ObjectKey, ObjectStore};
use kbind_kubehub::{Call, MemoryStore, Verb};
use kbind_queue::WorkQueue;
use kbind_runtime::{Context, Controller};
use kbind_store::{Cache, Indexers};
use kube::ResourceExt;
use tokio_util::sync::CancellationToken;

fn crd(plural: &str, kind: &str, versions: &[&str]) -> CustomResourceDefinition {
    CustomResourceDefinition {
        metadata: ObjectMeta { name: Some(format!("{}.example.com", plural)), ..Default::default() },
        spec: CustomResourceDefinitionSpec {
            group: "example.com".into(),
            names: CustomResourceDefinitionNames { plural: plural.into(), kind: kind.into(), ..Default::default() },
            scope: "Namespaced".into(),
            versions: versions
                .iter()
                .enumerate()
                .map(|(i, v)| CustomResourceDefinitionVersion { name: (*v).into(), served: true, storage: i == 0, ..Default::default() })
                .collect(),
            ..Default::default()
        },
        status: None,
    }
}

fn export(resources: &[&str]) -> APIServiceExport {
    let mut e = APIServiceExport::new("db", APIServiceExportSpec {
        resources: resources.iter().map(|r| GroupResource::new("example.com", r)).collect(),
    });
    e.metadata.namespace = Some("team-a".into());
    e
}

fn export_key() -> ObjectKey { ObjectKey::namespaced("team-a", "db") }

struct Harness {
    exports: Arc<MemoryStore<APIServiceExport>>,
    resources: Arc<MemoryStore<APIServiceExportResource>>,
    resource_cache: Cache<APIServiceExportResource>,
    crds: Cache<CustomResourceDefinition>,
    ctrl: Controller<APIServiceExport>,
}

impl Harness {
    fn new() -> Self {
        let exports = Arc::new(MemoryStore::<APIServiceExport>::new());
        let resources = Arc::new(MemoryStore::<APIServiceExportResource>::new());

        let mut export_indexers = Indexers::new();
        export_indexers.add::<ExportByExportResource>().unwrap();
        export_indexers.add::<ExportByGroupResource>().unwrap();
        let mut resource_indexers = Indexers::new();
        resource_indexers.add::<ExportResourceByExport>().unwrap();

        let export_store: Arc<dyn ObjectStore<APIServiceExport>> = exports.clone();
        let watched = Watched::new("APIServiceExport", export_store, export_indexers);
        let resource_cache = Cache::new("APIServiceExportResource", resource_indexers);
        let crds = Cache::new("CustomResourceDefinition", Indexers::new());
        let resource_store: Arc<dyn ObjectStore<APIServiceExportResource>> = resources.clone();
        let ctrl = serviceexport::controller(
            &watched,
            ServiceExportReconciler { export_resources: resource_store, export_resource_cache: resource_cache.clone(), crds: crds.clone() },
        );
        Self { exports, resources, resource_cache, crds, ctrl }
    }

    fn resync(&self) {
        self.ctrl.cache().apply(vec![Delta::Restarted(self.exports.objects())]);
        self.resource_cache.apply(vec![Delta::Restarted(self.resources.objects())]);
    }

    async fn process(&self) -> Result<(), kbind_runtime::ReconcileErrors> { self.process_key(&export_key()).await }

    async fn process_key(&self, key: &ObjectKey) -> Result<(), kbind_runtime::ReconcileErrors> {
        let ctx = Context { controller: CONTROLLER, key: key.to_string(), token: CancellationToken::new() };
        self.ctrl.process(&ctx).await
    }

    fn stored_export(&self) -> APIServiceExport { self.exports.object(&export_key()).unwrap() }

    fn resource_names(&self) -> Vec<String> { self.resources.objects().iter().map(|r| r.name_any()).collect() }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn undeclared_resources_are_pruned_with_their_index_entries() {
    let h = Harness::new();
    h.crds.apply(vec![Delta::Applied(crd("foos", "Foo", &["v1"])), Delta::Applied(crd("bars", "Bar", &["v1"]))]);
    let seeded = h.exports.seed(export(&["foos", "bars"]));
    h.resync();
    assert_eq!(h.ctrl.cache().index_keys(EXPORT_BY_GROUP_RESOURCE, "bars.example.com").unwrap(), vec![export_key()]);

    h.process().await.unwrap();
    assert_eq!(h.resource_names(), vec!["bars.example.com", "foos.example.com"]);
    for r in h.resources.objects() {
        let owners = r.owner_references();
        assert_eq!(owners.len(), 1);
        assert_eq!(owners[0].uid, seeded.uid().unwrap());
        assert_eq!(owners[0].controller, Some(true));
    }
    let status = h.stored_export().status.unwrap();
    assert!(find_condition(&status.conditions, RESOURCES_VALID).unwrap().is_true());

    h.exports
        .modify(&export_key(), |e| e.spec.resources.retain(|gr| gr.resource != "bars"))
        .unwrap();
    h.resync();
    assert!(h.ctrl.cache().index_keys(EXPORT_BY_GROUP_RESOURCE, "bars.example.com").unwrap().is_empty());

    h.resources.clear_calls();
    h.process().await.unwrap();
    assert_eq!(h.resources.mutations(), vec![Call::Delete(ObjectKey::namespaced("team-a", "bars.example.com"))]);
    assert_eq!(h.resource_names(), vec!["foos.example.com"]);

    h.resync();
    assert_eq!(h.resource_cache.index_keys(EXPORT_RESOURCE_BY_EXPORT, "team-a/db").unwrap().len(), 1);

    // Converged.
    h.resources.clear_calls();
    h.exports.clear_calls();
    h.process().await.unwrap();
    assert!(h.resources.mutations().is_empty());
    assert!(h.exports.mutations().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn missing_crd_is_reported_until_it_appears() {
    let h = Harness::new();
    serviceexport::wire(&h.ctrl, &h.resource_cache, &h.crds);
    h.crds.apply(vec![Delta::Applied(crd("foos", "Foo", &["v1"]))]);
    h.exports.seed(export(&["foos", "quxs"]));
    h.resync();

    h.process().await.unwrap();
    assert_eq!(h.resource_names(), vec!["foos.example.com"]);
    let status = h.stored_export().status.unwrap();
    let cond = find_condition(&status.conditions, RESOURCES_VALID).unwrap();
    assert!(!cond.is_true());
    assert_eq!(cond.reason.as_deref(), Some("CustomResourceDefinitionNotFound"));
    assert!(cond.message.as_deref().unwrap_or_default().contains("quxs.example.com"));

    // The CRD event routes back to the export.
    let q: &WorkQueue = h.ctrl.queue();
    while let Some(k) = if q.is_empty() { None } else { q.get().await } {
        q.done(&k);
    }
    h.crds.apply(vec![Delta::Applied(crd("quxs", "Qux", &["v1"]))]);
    assert_eq!(q.len(), 1);
    assert_eq!(q.get().await.as_deref(), Some("team-a/db"));

    h.resync();
    h.process().await.unwrap();
    assert_eq!(h.resource_names(), vec!["foos.example.com", "quxs.example.com"]);
    let status = h.stored_export().status.unwrap();
    assert!(find_condition(&status.conditions, RESOURCES_VALID).unwrap().is_true());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn crd_drift_updates_the_export_resource() {
    let h = Harness::new();
    h.crds.apply(vec![Delta::Applied(crd("foos", "Foo", &["v1"]))]);
    h.exports.seed(export(&["foos"]));
    h.resync();
    h.process().await.unwrap();
    h.resync();

    h.crds.apply(vec![Delta::Applied(crd("foos", "Foo", &["v1", "v2"]))]);
    h.resources.clear_calls();
    h.process().await.unwrap();
    let key = ObjectKey::namespaced("team-a", "foos.example.com");
    assert_eq!(h.resources.mutations(), vec![Call::Update(key.clone())]);
    let versions: Vec<String> = h.resources.object(&key).unwrap().spec.versions.into_iter().map(|v| v.name).collect();
    assert_eq!(versions, vec!["v1", "v2"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn foreign_export_resources_are_left_alone() {
    let h = Harness::new();
    let mut foreign = APIServiceExportResource::new("bars.example.com", APIServiceExportResourceSpec::default());
    foreign.metadata.namespace = Some("team-a".into());
    h.resources.seed(foreign);
    h.crds.apply(vec![Delta::Applied(crd("foos", "Foo", &["v1"]))]);
    h.exports.seed(export(&["foos"]));
    h.resync();

    h.process().await.unwrap();
    assert_eq!(h.resources.count(Verb::Delete), 0);
    assert_eq!(h.resource_names(), vec!["bars.example.com", "foos.example.com"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn export_resource_events_route_through_the_index() {
    let h = Harness::new();
    serviceexport::wire(&h.ctrl, &h.resource_cache, &h.crds);
    h.exports.seed(export(&["foos"]));
    h.resync();
    let q = h.ctrl.queue();
    assert_eq!(q.get().await.as_deref(), Some("team-a/db"));
    q.done("team-a/db");

    let mut declared = APIServiceExportResource::new("foos.example.com", APIServiceExportResourceSpec::default());
    declared.metadata.namespace = Some("team-a".into());
    let mut other_ns = declared.clone();
    other_ns.metadata.namespace = Some("team-b".into());
    h.resource_cache.apply(vec![Delta::Applied(declared), Delta::Applied(other_ns)]);
    assert_eq!(q.len(), 1);
    assert_eq!(q.get().await.as_deref(), Some("team-a/db"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn resource_shared_by_two_exports_has_one_controller() {
    let h = Harness::new();
    h.crds.apply(vec![Delta::Applied(crd("foos", "Foo", &["v1"]))]);
    let mut a = export(&["foos"]);
    a.metadata.name = Some("a".into());
    let mut b = export(&["foos"]);
    b.metadata.name = Some("b".into());
    h.exports.seed(a);
    h.exports.seed(b);
    let (a, b) = (ObjectKey::namespaced("team-a", "a"), ObjectKey::namespaced("team-a", "b"));
    let key = ObjectKey::namespaced("team-a", "foos.example.com");
    let owners = |h: &Harness| -> Vec<(String, Option<bool>)> {
        let obj = h.resources.object(&key).unwrap();
        obj.owner_references().iter().map(|o| (o.name.clone(), o.controller)).collect()
    };

    h.resync();
    h.process_key(&a).await.unwrap();
    h.resync();
    h.process_key(&b).await.unwrap();
    assert_eq!(owners(&h), vec![("a".to_string(), Some(true)), ("b".to_string(), Some(false))]);

    // a stops declaring it; b still does.
    h.exports.modify(&a, |e| e.spec.resources.clear()).unwrap();
    h.resync();
    h.resources.clear_calls();
    h.process_key(&a).await.unwrap();
    assert_eq!(h.resources.mutations(), vec![Call::Update(key.clone())]);
    assert_eq!(owners(&h), vec![("b".to_string(), Some(true))]);

    h.resync();
    h.resources.clear_calls();
    h.process_key(&b).await.unwrap();
    assert!(h.resources.mutations().is_empty());

    h.exports.modify(&b, |e| e.spec.resources.clear()).unwrap();
    h.resync();
    h.process_key(&b).await.unwrap();
    assert_eq!(h.resources.mutations(), vec![Call::Delete(key.clone())]);
    assert!(h.resources.object(&key).is_none());
}
