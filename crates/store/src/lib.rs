//! kbind store: watched object cache with secondary indexes, fed by a coalescing ingest loop

#![forbid(unsafe_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;

use arc_swap::ArcSwap;
use kube::Resource;
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use kbind_core::{Delta, ObjectKey, ObjectStore};

mod index;
mod reflector;

pub use index::{ByNamespace, IndexError, IndexFunc, IndexKeys, Indexers, NAMESPACE_INDEX};
pub use reflector::{run_reflector, spawn_reflector, ReflectorConfig};

/// Change notification delivered to cache subscribers after the snapshot
/// containing it has been published.
#[derive(Debug)]
pub enum CacheEvent<K> {
    Added(Arc<K>),
    Updated { old: Arc<K>, new: Arc<K> },
    Deleted(Arc<K>),
}

impl<K> CacheEvent<K> {
    /// The object as of this event (the new copy for updates).
    pub fn object(&self) -> &Arc<K> {
        match self {
            CacheEvent::Added(o) | CacheEvent::Deleted(o) => o,
            CacheEvent::Updated { new, .. } => new,
        }
    }
}

/// Non-blocking change callback.
pub type Subscriber<K> = Arc<dyn Fn(&CacheEvent<K>) + Send + Sync>;

type Bucket = Arc<FxHashSet<ObjectKey>>;
type Buckets = FxHashMap<String, Bucket>;

/// Indexes and buckets are shared between snapshots and copied on write,
/// so a batch only copies the buckets it touches.
struct Snapshot<K> {
    epoch: u64,
    synced: bool,
    items: FxHashMap<ObjectKey, Arc<K>>,
    indices: FxHashMap<&'static str, Arc<Buckets>>,
}

impl<K> Clone for Snapshot<K> {
    fn clone(&self) -> Self {
        Self { epoch: self.epoch, synced: self.synced, items: self.items.clone(), indices: self.indices.clone() }
    }
}

impl<K> Snapshot<K> {
    fn unindex(&mut self, indexers: &Indexers<K>, key: &ObjectKey, obj: &K)
    where
        K: 'static,
    {
        for (name, keys) in indexers.keys_for(obj) {
            if let Some(buckets) = self.indices.get_mut(name) {
                let buckets = Arc::make_mut(buckets);
                for k in keys {
                    if let Some(set) = buckets.get_mut(&k) {
                        let set = Arc::make_mut(set);
                        set.remove(key);
                        if set.is_empty() {
                            buckets.remove(&k);
                        }
                    }
                }
            }
        }
    }

    fn index(&mut self, indexers: &Indexers<K>, key: &ObjectKey, obj: &K)
    where
        K: 'static,
    {
        for (name, keys) in indexers.keys_for(obj) {
            if keys.is_empty() {
                continue;
            }
            let buckets = Arc::make_mut(self.indices.entry(name).or_default());
            for k in keys {
                Arc::make_mut(buckets.entry(k).or_default()).insert(key.clone());
            }
        }
    }
}

struct Shared<K> {
    kind: &'static str,
    snap: ArcSwap<Snapshot<K>>,
    indexers: Indexers<K>,
    // Serializes writers; readers never take it.
    writer: Mutex<()>,
    subscribers: RwLock<Vec<Subscriber<K>>>,
    epoch_tx: watch::Sender<u64>,
}

/// Watched cache for one kind. Cheap to clone; all clones share state.
///
/// Readers load an immutable snapshot without locking. A single writer
/// (the ingest loop) applies batches of deltas and swaps in the next snapshot.
pub struct Cache<K> {
    shared: Arc<Shared<K>>,
}

impl<K> Clone for Cache<K> {
    fn clone(&self) -> Self { Self { shared: Arc::clone(&self.shared) } }
}

impl<K> Cache<K>
where
    K: Resource + Send + Sync + 'static,
{
    pub fn new(kind: &'static str, indexers: Indexers<K>) -> Self {
        let (epoch_tx, _) = watch::channel(0u64);
        let snap = Snapshot { epoch: 0, synced: false, items: FxHashMap::default(), indices: FxHashMap::default() };
        Self {
            shared: Arc::new(Shared {
                kind,
                snap: ArcSwap::from_pointee(snap),
                indexers,
                writer: Mutex::new(()),
                subscribers: RwLock::new(Vec::new()),
                epoch_tx,
            }),
        }
    }

    pub fn kind(&self) -> &'static str { self.shared.kind }

    pub fn get(&self, key: &ObjectKey) -> Option<Arc<K>> { self.shared.snap.load().items.get(key).cloned() }

    pub fn list(&self) -> Vec<Arc<K>> { self.shared.snap.load().items.values().cloned().collect() }

    pub fn list_namespace(&self, ns: &str) -> Vec<Arc<K>> {
        self.by_index(NAMESPACE_INDEX, ns).unwrap_or_default()
    }

    pub fn len(&self) -> usize { self.shared.snap.load().items.len() }

    pub fn is_empty(&self) -> bool { self.len() == 0 }

    /// Objects whose index function currently yields `key` under index `name`.
    pub fn by_index(&self, name: &str, key: &str) -> Result<Vec<Arc<K>>, IndexError> {
        let snap = self.shared.snap.load();
        let keys = Self::bucket(&snap, &self.shared.indexers, name, key)?;
        Ok(keys.iter().flat_map(|b| b.iter()).filter_map(|k| snap.items.get(k).cloned()).collect())
    }

    /// Keys of the objects in an index bucket.
    pub fn index_keys(&self, name: &str, key: &str) -> Result<Vec<ObjectKey>, IndexError> {
        let snap = self.shared.snap.load();
        Ok(Self::bucket(&snap, &self.shared.indexers, name, key)?.map(|b| b.iter().cloned().collect()).unwrap_or_default())
    }

    fn bucket(snap: &Snapshot<K>, indexers: &Indexers<K>, name: &str, key: &str) -> Result<Option<Bucket>, IndexError> {
        if !indexers.contains(name) {
            return Err(IndexError::Unknown(name.to_string()));
        }
        Ok(snap.indices.get(name).and_then(|b| b.get(key)).cloned())
    }

    pub fn subscribe(&self, handler: Subscriber<K>) {
        self.shared.subscribers.write().unwrap_or_else(|e| e.into_inner()).push(handler);
    }

    pub fn epoch(&self) -> u64 { self.shared.snap.load().epoch }

    pub fn subscribe_epoch(&self) -> watch::Receiver<u64> { self.shared.epoch_tx.subscribe() }

    /// True once a full list has been applied.
    pub fn has_synced(&self) -> bool { self.shared.snap.load().synced }

    /// Wait until the cache has synced, or the timeout elapses.
    pub async fn wait_synced(&self, timeout: Duration) -> bool {
        let mut rx = self.subscribe_epoch();
        let wait = async {
            while !self.has_synced() {
                if rx.changed().await.is_err() {
                    break;
                }
            }
        };
        let _ = tokio::time::timeout(timeout, wait).await;
        self.has_synced()
    }

    fn writer(&self) -> MutexGuard<'_, ()> { self.shared.writer.lock().unwrap_or_else(|e| e.into_inner()) }

    /// Apply a batch, publish the next snapshot, then notify subscribers.
    /// Returns the number of change events produced.
    pub fn apply(&self, batch: Vec<Delta<K>>) -> usize {
        let _w = self.writer();
        let indexers = &self.shared.indexers;
        let mut next = Snapshot::clone(&self.shared.snap.load());
        let mut events = Vec::new();
        for d in batch {
            match d {
                Delta::Applied(obj) => {
                    let Ok(key) = ObjectKey::of(&obj) else {
                        warn!(kind = self.shared.kind, "dropping object without a name");
                        continue;
                    };
                    let new = Arc::new(obj);
                    let old = next.items.insert(key.clone(), Arc::clone(&new));
                    if let Some(old) = &old {
                        next.unindex(indexers, &key, old);
                    }
                    next.index(indexers, &key, &new);
                    events.push(match old {
                        Some(old) => CacheEvent::Updated { old, new },
                        None => CacheEvent::Added(new),
                    });
                }
                Delta::Deleted(obj) => {
                    let Ok(key) = ObjectKey::of(&obj) else { continue };
                    if let Some(old) = next.items.remove(&key) {
                        next.unindex(indexers, &key, &old);
                        events.push(CacheEvent::Deleted(Arc::new(obj)));
                    }
                }
                Delta::Restarted(list) => {
                    let mut fresh: FxHashMap<ObjectKey, Arc<K>> = FxHashMap::default();
                    for obj in list {
                        match ObjectKey::of(&obj) {
                            Ok(key) => {
                                fresh.insert(key, Arc::new(obj));
                            }
                            Err(_) => warn!(kind = self.shared.kind, "dropping object without a name"),
                        }
                    }
                    let stale: Vec<ObjectKey> = next.items.keys().filter(|k| !fresh.contains_key(*k)).cloned().collect();
                    for key in stale {
                        if let Some(old) = next.items.remove(&key) {
                            next.unindex(indexers, &key, &old);
                            events.push(CacheEvent::Deleted(old));
                        }
                    }
                    for (key, new) in fresh {
                        let old = next.items.insert(key.clone(), Arc::clone(&new));
                        if let Some(old) = &old {
                            next.unindex(indexers, &key, old);
                        }
                        next.index(indexers, &key, &new);
                        events.push(match old {
                            Some(old) => CacheEvent::Updated { old, new },
                            None => CacheEvent::Added(new),
                        });
                    }
                    if !next.synced {
                        info!(kind = self.shared.kind, count = next.items.len(), "cache synced");
                    }
                    next.synced = true;
                }
            }
        }
        next.epoch = next.epoch.saturating_add(1);
        let epoch = next.epoch;
        let len = next.items.len();
        self.shared.snap.store(Arc::new(next));
        let _ = self.shared.epoch_tx.send(epoch);
        metrics::gauge!("cache_objects", len as f64, "kind" => self.shared.kind);

        let subscribers = self.shared.subscribers.read().unwrap_or_else(|e| e.into_inner()).clone();
        for ev in &events {
            for s in &subscribers {
                s(ev);
            }
        }
        events.len()
    }
}

/// Coalescing buffer keyed by object with FIFO order. A relist acts as a
/// barrier: it is only handed out after everything queued before it.
pub struct Coalescer<K> {
    map: FxHashMap<ObjectKey, Delta<K>>,
    order: VecDeque<ObjectKey>,
    cap: usize,
}

impl<K: Resource> Coalescer<K> {
    pub fn with_capacity(cap: usize) -> Self {
        Self { map: FxHashMap::default(), order: VecDeque::new(), cap: cap.max(1) }
    }

    pub fn len(&self) -> usize { self.map.len() }

    pub fn is_empty(&self) -> bool { self.map.is_empty() }

    /// Queue a keyed delta, replacing any pending delta for the same object.
    /// Returns true when the buffer is full and should be drained.
    pub fn push(&mut self, d: Delta<K>) -> bool {
        let key = match &d {
            Delta::Applied(o) | Delta::Deleted(o) => ObjectKey::of(o),
            Delta::Restarted(_) => return self.is_full(),
        };
        let Ok(key) = key else { return self.is_full() };
        if self.map.insert(key.clone(), d).is_none() {
            self.order.push_back(key);
        }
        self.is_full()
    }

    fn is_full(&self) -> bool { self.order.len() >= self.cap }

    pub fn drain_ready(&mut self) -> Vec<Delta<K>> {
        let mut out = Vec::with_capacity(self.order.len());
        while let Some(key) = self.order.pop_front() {
            if let Some(d) = self.map.remove(&key) {
                out.push(d);
            }
        }
        out
    }
}

fn ingest_cap() -> usize {
    std::env::var("KBIND_INGEST_CAP").ok().and_then(|s| s.parse::<usize>().ok()).unwrap_or(2048)
}

/// Spawn the single writer of `cache`. Deltas sent to the returned channel are
/// coalesced per object and applied in batches.
pub fn spawn_ingest<K>(cache: Cache<K>, cap: usize) -> mpsc::Sender<Delta<K>>
where
    K: Resource + Send + Sync + 'static,
{
    let (tx, mut rx) = mpsc::channel::<Delta<K>>(cap.max(1));
    tokio::spawn(async move {
        let mut coalescer = Coalescer::with_capacity(cap);
        let mut ticker = tokio::time::interval(Duration::from_millis(8));
        loop {
            tokio::select! {
                maybe = rx.recv() => {
                    match maybe {
                        Some(Delta::Restarted(list)) => {
                            let mut batch = coalescer.drain_ready();
                            batch.push(Delta::Restarted(list));
                            cache.apply(batch);
                        }
                        Some(d) => {
                            if coalescer.push(d) {
                                cache.apply(coalescer.drain_ready());
                            }
                        }
                        None => {
                            debug!(kind = cache.kind(), "delta channel closed; draining and exiting ingest loop");
                            let batch = coalescer.drain_ready();
                            if !batch.is_empty() {
                                cache.apply(batch);
                            }
                            break;
                        }
                    }
                }
                _ = ticker.tick() => {
                    if !coalescer.is_empty() {
                        cache.apply(coalescer.drain_ready());
                    }
                }
            }
        }
        info!(kind = cache.kind(), "ingest loop stopped");
    });
    tx
}

/// Wire an ingest loop and a reflector so `cache` mirrors `store`.
pub fn spawn_informer<K>(
    cache: &Cache<K>,
    store: Arc<dyn ObjectStore<K>>,
    cfg: ReflectorConfig,
    token: CancellationToken,
) -> tokio::task::JoinHandle<()>
where
    K: Resource + Clone + Send + Sync + 'static,
{
    let tx = spawn_ingest(cache.clone(), ingest_cap());
    spawn_reflector(cache.kind(), store, tx, cfg, token)
}
