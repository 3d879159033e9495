#![forbid(unsafe_code)]

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};

use k8s_openapi::api::core::v1::ConfigMap;
use kbind_core::{Delta, ObjectKey};
use kbind_store::{Cache, CacheEvent, IndexFunc, IndexKeys, Indexers};

/// Index by the values of the `data` map.
struct ByValue;

impl IndexFunc<ConfigMap> for ByValue {
    const NAME: &'static str = "byValue";
    fn index(obj: &ConfigMap) -> IndexKeys {
        obj.data.iter().flat_map(|d| d.values().cloned()).collect()
    }
}

fn cm(ns: &str, name: &str, values: &[&str]) -> ConfigMap {
    let mut cm = ConfigMap::default();
    cm.metadata.name = Some(name.into());
    cm.metadata.namespace = Some(ns.into());
    cm.data = Some(values.iter().enumerate().map(|(i, v)| (format!("k{}", i), v.to_string())).collect());
    cm
}

fn cache() -> Cache<ConfigMap> {
    let mut reg = Indexers::new();
    reg.add::<ByValue>().unwrap();
    Cache::new("ConfigMap", reg)
}

fn expected(cache: &Cache<ConfigMap>, value: &str) -> BTreeSet<ObjectKey> {
    cache
        .list()
        .iter()
        .filter(|o| o.data.as_ref().map_or(false, |d| d.values().any(|v| v == value)))
        .map(|o| ObjectKey::of(o.as_ref()).unwrap())
        .collect()
}

fn indexed(cache: &Cache<ConfigMap>, value: &str) -> BTreeSet<ObjectKey> {
    cache.index_keys("byValue", value).unwrap().into_iter().collect()
}

#[test]
fn index_tracks_updates_and_deletes() {
    let cache = cache();
    cache.apply(vec![
        Delta::Applied(cm("ns", "export", &["foo.example.com", "bar.example.com"])),
        Delta::Applied(cm("ns", "other", &["foo.example.com"])),
    ]);
    assert_eq!(cache.by_index("byValue", "bar.example.com").unwrap().len(), 1);
    assert_eq!(cache.by_index("byValue", "foo.example.com").unwrap().len(), 2);

    // Dropping a value removes the object from that bucket in the same swap.
    cache.apply(vec![Delta::Applied(cm("ns", "export", &["foo.example.com"]))]);
    assert!(cache.by_index("byValue", "bar.example.com").unwrap().is_empty());
    assert_eq!(cache.by_index("byValue", "foo.example.com").unwrap().len(), 2);

    cache.apply(vec![Delta::Deleted(cm("ns", "other", &[]))]);
    assert_eq!(indexed(&cache, "foo.example.com"), [ObjectKey::namespaced("ns", "export")].into_iter().collect());
    assert!(cache.list_namespace("ns").len() == 1);
}

#[test]
fn index_matches_brute_force_over_random_history() {
    let cache = cache();
    let values = ["a", "b", "c", "d"];
    let names = ["x", "y", "z", "w", "v"];
    let mut seed: u64 = 0x2545f4914f6cdd1d;
    let mut next = move || {
        seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        (seed >> 33) as usize
    };
    for _ in 0..64 {
        let mut batch = Vec::new();
        for _ in 0..(next() % 4 + 1) {
            let name = names[next() % names.len()];
            let ns = if next() % 2 == 0 { "one" } else { "two" };
            if next() % 4 == 0 {
                batch.push(Delta::Deleted(cm(ns, name, &[])));
            } else {
                let picked: Vec<&str> = values.iter().copied().filter(|_| next() % 2 == 0).collect();
                batch.push(Delta::Applied(cm(ns, name, &picked)));
            }
        }
        cache.apply(batch);
        for v in values {
            assert_eq!(indexed(&cache, v), expected(&cache, v), "bucket {}", v);
        }
        for ns in ["one", "two"] {
            let by_ns: BTreeSet<_> = cache.list_namespace(ns).iter().map(|o| ObjectKey::of(o.as_ref()).unwrap()).collect();
            let brute: BTreeSet<_> = cache
                .list()
                .iter()
                .filter(|o| o.metadata.namespace.as_deref() == Some(ns))
                .map(|o| ObjectKey::of(o.as_ref()).unwrap())
                .collect();
            assert_eq!(by_ns, brute);
        }
    }
}

#[test]
fn subscribers_run_after_publish_in_order() {
    let cache = cache();
    let seen: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let reader = cache.clone();
    let log = Arc::clone(&seen);
    cache.subscribe(Arc::new(move |ev: &CacheEvent<ConfigMap>| {
        let key = ObjectKey::of(ev.object().as_ref()).unwrap();
        let visible = reader.get(&key).is_some();
        let label = match ev {
            CacheEvent::Added(_) => "added",
            CacheEvent::Updated { .. } => "updated",
            CacheEvent::Deleted(_) => "deleted",
        };
        log.lock().unwrap().push(format!("{}:{}:{}", label, key, visible));
    }));

    cache.apply(vec![Delta::Applied(cm("ns", "a", &["1"])), Delta::Applied(cm("ns", "a", &["2"]))]);
    cache.apply(vec![Delta::Deleted(cm("ns", "a", &[]))]);

    assert_eq!(
        *seen.lock().unwrap(),
        vec!["added:ns/a:true", "updated:ns/a:true", "deleted:ns/a:false"]
    );
}

#[test]
fn deleting_unknown_object_is_silent() {
    let cache = cache();
    assert_eq!(cache.apply(vec![Delta::Deleted(cm("ns", "ghost", &[]))]), 0);
    assert!(cache.is_empty());
}
