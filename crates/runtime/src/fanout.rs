//! Map cache events of any watched kind to work queue keys.

use std::sync::Arc;

use kube::Resource;
use tracing::{trace, warn};

use kbind_core::ObjectKey;
use kbind_queue::WorkQueue;
use kbind_store::{Cache, CacheEvent};

type MapFn<K> = Arc<dyn Fn(&K) -> anyhow::Result<Vec<String>> + Send + Sync>;
type ChangedFn<K> = Arc<dyn Fn(&K, &K) -> bool + Send + Sync>;

/// Enqueues keys for a controller when objects of kind `K` change.
pub struct EventHandler<K> {
    controller: &'static str,
    source: &'static str,
    queue: WorkQueue,
    map: Option<MapFn<K>>,
    changed: Option<ChangedFn<K>>,
    adds_only: bool,
}

impl<K> EventHandler<K>
where
    K: Resource + Send + Sync + 'static,
{
    /// Enqueue the object's own key.
    pub fn direct(controller: &'static str, source: &'static str, queue: WorkQueue) -> Self {
        Self { controller, source, queue, map: None, changed: None, adds_only: false }
    }

    /// Enqueue whatever keys `map` derives from the object. Errors are logged
    /// and the event is skipped.
    pub fn mapped<F>(controller: &'static str, source: &'static str, queue: WorkQueue, map: F) -> Self
    where
        F: Fn(&K) -> anyhow::Result<Vec<String>> + Send + Sync + 'static,
    {
        Self { controller, source, queue, map: Some(Arc::new(map)), changed: None, adds_only: false }
    }

    /// Ignore updates for which `changed(old, new)` is false.
    pub fn only_when<F>(mut self, changed: F) -> Self
    where
        F: Fn(&K, &K) -> bool + Send + Sync + 'static,
    {
        self.changed = Some(Arc::new(changed));
        self
    }

    /// React to creations only.
    pub fn adds_only(mut self) -> Self {
        self.adds_only = true;
        self
    }

    pub fn handle(&self, ev: &CacheEvent<K>) {
        match ev {
            CacheEvent::Updated { .. } | CacheEvent::Deleted(_) if self.adds_only => return,
            CacheEvent::Updated { old, new } => {
                if let Some(changed) = &self.changed {
                    if !changed(old.as_ref(), new.as_ref()) {
                        trace!(controller = self.controller, source = self.source, "update filtered");
                        return;
                    }
                }
            }
            _ => {}
        }
        let obj = ev.object().as_ref();
        let keys = match &self.map {
            Some(map) => map(obj),
            None => ObjectKey::of(obj).map(|k| vec![k.to_string()]).map_err(anyhow::Error::from),
        };
        match keys {
            Ok(keys) => {
                for key in keys {
                    trace!(controller = self.controller, source = self.source, key = %key, "enqueue");
                    self.queue.add(key);
                }
            }
            Err(e) => {
                warn!(controller = self.controller, source = self.source, error = %e, "cannot map object to keys; skipping");
                metrics::counter!("fanout_errors_total", 1u64, "controller" => self.controller, "source" => self.source);
            }
        }
    }

    /// Attach to `cache`; runs on the cache's ingest path after each publish.
    pub fn subscribe(self, cache: &Cache<K>) {
        let me = Arc::new(self);
        cache.subscribe(Arc::new(move |ev: &CacheEvent<K>| me.handle(ev)));
    }
}

/// Keys of the objects in an index bucket of `cache`, rendered for a work queue.
pub fn keys_from_index<T>(cache: &Cache<T>, index: &str, key: &str) -> anyhow::Result<Vec<String>>
where
    T: Resource + Send + Sync + 'static,
{
    Ok(cache.index_keys(index, key)?.into_iter().map(|k| k.to_string()).collect())
}
