#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use kbind_apis::indexers::{BindingByKubeconfigSecret, ExportByExportResource};
use kbind_apis::{
    find_condition, APIServiceBinding, APIServiceBindingSpec, APIServiceExport, APIServiceExportResource, APIServiceExportResourceSpec,
    APIServiceExportSpec, ClusterSecretKeyRef, Condition, GroupResource,
};
use kbind_core::{Delta, ListScope, ObjectKey, ObjectStore};
use kbind_konnector::serviceexport::{self, CONNECTED, CONTROLLER, RESOURCES_AVAILABLE};
use kbind_konnector::{ClusterExportReconciler, Connection};
use kbind_kubehub::{MemoryStore, Verb};
use kbind_queue::WorkQueue;
use kbind_runtime::{Committer, Context, Controller};
use kbind_store::{spawn_informer, Cache, Indexers, ReflectorConfig};
use kube::ResourceExt;
use tokio_util::sync::CancellationToken;

const PROVIDER_NS: &str = "kube-bind-abcde";

fn connection() -> Connection { Connection::new(PROVIDER_NS, "kube-bind", "kubeconfig") }

fn export(ns: &str, name: &str, resources: &[&str]) -> APIServiceExport {
    let mut e = APIServiceExport::new(name, APIServiceExportSpec {
        resources: resources.iter().map(|r| GroupResource::new("example.com", r)).collect(),
    });
    e.metadata.namespace = Some(ns.into());
    e
}

fn export_resource(ns: &str, resource: &str) -> APIServiceExportResource {
    let mut r = APIServiceExportResource::new(&format!("{}.example.com", resource), APIServiceExportResourceSpec::default());
    r.metadata.namespace = Some(ns.into());
    r
}

fn binding(name: &str, export: &str, secret: &str) -> APIServiceBinding {
    APIServiceBinding::new(name, APIServiceBindingSpec {
        export: export.into(),
        kubeconfig_secret_ref: ClusterSecretKeyRef { namespace: "kube-bind".into(), name: secret.into(), key: "kubeconfig".into() },
    })
}

fn conditions(store: &MemoryStore<APIServiceExport>, name: &str) -> Vec<Condition> {
    store.object(&ObjectKey::namespaced(PROVIDER_NS, name)).and_then(|e| e.status).map(|s| s.conditions).unwrap_or_default()
}

struct Harness {
    exports: Arc<MemoryStore<APIServiceExport>>,
    export_resources: Cache<APIServiceExportResource>,
    bindings: Cache<APIServiceBinding>,
    ctrl: Controller<APIServiceExport>,
}

impl Harness {
    fn new() -> Self {
        let exports = Arc::new(MemoryStore::<APIServiceExport>::new());
        let mut export_indexers = Indexers::new();
        export_indexers.add::<ExportByExportResource>().unwrap();
        let mut binding_indexers = Indexers::new();
        binding_indexers.add::<BindingByKubeconfigSecret>().unwrap();
        let export_cache = Cache::new("APIServiceExport", export_indexers);
        let export_resources = Cache::new("APIServiceExportResource", Indexers::new());
        let bindings = Cache::new("APIServiceBinding", binding_indexers);
        let store: Arc<dyn ObjectStore<APIServiceExport>> = exports.clone();
        let ctrl = Controller::new(
            CONTROLLER,
            export_cache,
            ClusterExportReconciler { connection: connection(), bindings: bindings.clone(), export_resources: export_resources.clone() },
            Committer::new(store),
        );
        Self { exports, export_resources, bindings, ctrl }
    }

    fn resync(&self) { self.ctrl.cache().apply(vec![Delta::Restarted(self.exports.objects())]); }

    async fn process(&self, name: &str) -> Result<(), kbind_runtime::ReconcileErrors> {
        let ctx = Context { controller: CONTROLLER, key: format!("{}/{}", PROVIDER_NS, name), token: CancellationToken::new() };
        self.ctrl.process(&ctx).await
    }
}

async fn drain(q: &WorkQueue) -> Vec<String> {
    let mut out = Vec::new();
    while !q.is_empty() {
        if let Some(k) = q.get().await {
            q.done(&k);
            out.push(k);
        }
    }
    out.sort();
    out
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn conditions_follow_bindings_and_resources() {
    let h = Harness::new();
    h.exports.seed(export(PROVIDER_NS, "db", &["foos", "bars"]));
    h.export_resources.apply(vec![Delta::Applied(export_resource(PROVIDER_NS, "foos"))]);
    h.bindings.apply(vec![
        Delta::Applied(binding("other-db", "db", "someone-else")),
        Delta::Applied(binding("unrelated", "cache", "kubeconfig")),
    ]);
    h.resync();

    h.process("db").await.unwrap();
    let conds = conditions(&h.exports, "db");
    let connected = find_condition(&conds, CONNECTED).unwrap();
    assert!(!connected.is_true());
    assert_eq!(connected.reason.as_deref(), Some("NoBinding"));
    let available = find_condition(&conds, RESOURCES_AVAILABLE).unwrap();
    assert!(!available.is_true());
    assert!(available.message.as_deref().unwrap_or_default().contains("bars.example.com"));

    h.bindings.apply(vec![Delta::Applied(binding("db", "db", "kubeconfig"))]);
    h.export_resources.apply(vec![Delta::Applied(export_resource(PROVIDER_NS, "bars"))]);
    h.resync();
    h.process("db").await.unwrap();
    let conds = conditions(&h.exports, "db");
    let connected = find_condition(&conds, CONNECTED).unwrap();
    assert!(connected.is_true());
    assert_eq!(connected.message.as_deref(), Some("bound by db"));
    assert!(find_condition(&conds, RESOURCES_AVAILABLE).unwrap().is_true());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn writes_status_only() {
    let h = Harness::new();
    h.exports.seed(export(PROVIDER_NS, "db", &["foos"]));
    h.resync();

    h.process("db").await.unwrap();
    assert_eq!(h.exports.count(Verb::Patch), 1);
    match &h.exports.mutations()[0] {
        kbind_kubehub::Call::Patch(_, target, _) => assert_eq!(*target, kbind_core::PatchTarget::Status),
        other => panic!("unexpected call {:?}", other),
    }

    h.resync();
    h.exports.clear_calls();
    h.process("db").await.unwrap();
    assert!(h.exports.mutations().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn events_are_filtered_to_this_connection() {
    let h = Harness::new();
    serviceexport::wire(&h.ctrl, &connection(), &h.export_resources, &h.bindings);
    h.exports.seed(export(PROVIDER_NS, "db", &["foos"]));
    h.resync();
    let q = h.ctrl.queue();
    assert_eq!(drain(q).await, vec![format!("{}/db", PROVIDER_NS)]);

    h.bindings.apply(vec![Delta::Applied(binding("a", "db", "someone-else")), Delta::Applied(binding("b", "cache", "kubeconfig"))]);
    assert_eq!(drain(q).await, vec![format!("{}/cache", PROVIDER_NS)]);

    h.export_resources.apply(vec![
        Delta::Applied(export_resource("elsewhere", "foos")),
        Delta::Applied(export_resource(PROVIDER_NS, "foos")),
        Delta::Applied(export_resource(PROVIDER_NS, "unclaimed")),
    ]);
    assert_eq!(drain(q).await, vec![format!("{}/db", PROVIDER_NS)]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn informers_and_workers_converge() {
    let exports = Arc::new(MemoryStore::<APIServiceExport>::new());
    let resources = Arc::new(MemoryStore::<APIServiceExportResource>::new());
    let bindings = Arc::new(MemoryStore::<APIServiceBinding>::new());
    exports.seed(export(PROVIDER_NS, "db", &["foos"]));
    exports.seed(export("someone-else", "db", &["foos"]));
    resources.seed(export_resource(PROVIDER_NS, "foos"));

    let token = CancellationToken::new();
    let scope = ListScope::namespace(PROVIDER_NS);
    let mut export_indexers = Indexers::new();
    export_indexers.add::<ExportByExportResource>().unwrap();
    let mut binding_indexers = Indexers::new();
    binding_indexers.add::<BindingByKubeconfigSecret>().unwrap();
    let export_cache = Cache::new("APIServiceExport", export_indexers);
    let resource_cache = Cache::new("APIServiceExportResource", Indexers::new());
    let binding_cache = Cache::new("APIServiceBinding", binding_indexers);

    let export_store: Arc<dyn ObjectStore<APIServiceExport>> = exports.clone();
    let resource_store: Arc<dyn ObjectStore<APIServiceExportResource>> = resources.clone();
    let binding_store: Arc<dyn ObjectStore<APIServiceBinding>> = bindings.clone();
    let ctrl = Arc::new(Controller::new(
        CONTROLLER,
        export_cache.clone(),
        ClusterExportReconciler { connection: connection(), bindings: binding_cache.clone(), export_resources: resource_cache.clone() },
        Committer::new(Arc::clone(&export_store)),
    ));
    serviceexport::wire(&ctrl, &connection(), &resource_cache, &binding_cache);
    spawn_informer(&export_cache, export_store, ReflectorConfig::scoped(scope.clone()), token.clone());
    spawn_informer(&resource_cache, resource_store, ReflectorConfig::scoped(scope), token.clone());
    spawn_informer(&binding_cache, binding_store, ReflectorConfig::default(), token.clone());
    assert!(export_cache.wait_synced(Duration::from_secs(5)).await);
    assert_eq!(export_cache.len(), 1);
    let handle = tokio::spawn(Arc::clone(&ctrl).run(2, token.clone()));

    let connected = |store: &MemoryStore<APIServiceExport>| {
        find_condition(&conditions(store, "db"), CONNECTED).map(Condition::is_true)
    };
    for _ in 0..300 {
        if connected(exports.as_ref()) == Some(false) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(connected(exports.as_ref()), Some(false));

    bindings.create(&binding("db", "db", "kubeconfig")).await.unwrap();
    for _ in 0..300 {
        if connected(exports.as_ref()) == Some(true) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(connected(exports.as_ref()), Some(true));
    let conds = conditions(&exports, "db");
    assert!(find_condition(&conds, RESOURCES_AVAILABLE).unwrap().is_true());
    // The export outside the provider namespace is never touched.
    assert!(exports.object(&ObjectKey::namespaced("someone-else", "db")).unwrap().status.is_none());

    token.cancel();
    tokio::time::timeout(Duration::from_secs(5), handle).await.unwrap().unwrap();
    assert!(ctrl.queue().is_shutting_down());
    assert_eq!(binding_cache.get(&ObjectKey::cluster("db")).map(|b| b.name_any()).as_deref(), Some("db"));
}
