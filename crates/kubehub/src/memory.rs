//! In-memory authoritative store with resourceVersion semantics, watch replay,
//! recorded calls and injectable faults.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

use futures::StreamExt;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::{Resource, ResourceExt};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value as Json;
use tokio::sync::broadcast;
use tracing::debug;

use kbind_core::{
    merge_apply, ListScope, Listed, ObjectKey, ObjectStore, PatchTarget, StoreError, StoreResult, WatchEvent,
    WatchStream,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Verb {
    Get,
    List,
    Watch,
    Create,
    Update,
    UpdateStatus,
    Patch,
    Delete,
}

impl Verb {
    pub fn is_mutation(&self) -> bool { !matches!(self, Verb::Get | Verb::List | Verb::Watch) }
}

/// A call received by a `MemoryStore`, recorded before fault injection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Get(ObjectKey),
    List(Option<String>),
    Watch(String),
    Create(ObjectKey),
    Update(ObjectKey),
    UpdateStatus(ObjectKey),
    Patch(ObjectKey, PatchTarget, Json),
    Delete(ObjectKey),
}

impl Call {
    pub fn verb(&self) -> Verb {
        match self {
            Call::Get(_) => Verb::Get,
            Call::List(_) => Verb::List,
            Call::Watch(_) => Verb::Watch,
            Call::Create(_) => Verb::Create,
            Call::Update(_) => Verb::Update,
            Call::UpdateStatus(_) => Verb::UpdateStatus,
            Call::Patch(..) => Verb::Patch,
            Call::Delete(_) => Verb::Delete,
        }
    }
}

type Logged<K> = (u64, WatchEvent<K>);

struct Inner<K> {
    objects: BTreeMap<ObjectKey, K>,
    rv: u64,
    log: Vec<Logged<K>>,
    /// Watches from below this resourceVersion fail with `Expired`.
    compacted: u64,
    calls: Vec<Call>,
    faults: VecDeque<(Verb, StoreError)>,
}

/// In-memory `ObjectStore` for tests and demos.
pub struct MemoryStore<K> {
    inner: Mutex<Inner<K>>,
    // `None` ends every open watch stream.
    events: broadcast::Sender<Option<Logged<K>>>,
}

impl<K> Default for MemoryStore<K>
where
    K: Resource + Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    fn default() -> Self { Self::new() }
}

fn json_rv(v: &Json) -> Option<&str> { v.get("metadata")?.get("resourceVersion")?.as_str() }

fn set_meta(v: &mut Json, field: &str, value: Json) {
    if let Some(meta) = v.get_mut("metadata").and_then(Json::as_object_mut) {
        meta.insert(field.to_string(), value);
    }
}

impl<K> MemoryStore<K>
where
    K: Resource + Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(1024);
        Self {
            inner: Mutex::new(Inner {
                objects: BTreeMap::new(),
                rv: 0,
                log: Vec::new(),
                compacted: 0,
                calls: Vec::new(),
                faults: VecDeque::new(),
            }),
            events,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner<K>> { self.inner.lock().unwrap_or_else(|e| e.into_inner()) }

    /// Insert an object without recording a call. Returns it as stored.
    pub fn seed(&self, obj: K) -> K {
        let mut inner = self.lock();
        match self.store_new(&mut inner, obj) {
            Ok(stored) => stored,
            Err((obj, _)) => obj,
        }
    }

    /// Fail the next call of `verb` with `err`.
    pub fn fail_next(&self, verb: Verb, err: StoreError) { self.lock().faults.push_back((verb, err)); }

    pub fn calls(&self) -> Vec<Call> { self.lock().calls.clone() }

    /// Recorded calls that (attempt to) change state.
    pub fn mutations(&self) -> Vec<Call> { self.lock().calls.iter().filter(|c| c.verb().is_mutation()).cloned().collect() }

    pub fn count(&self, verb: Verb) -> usize { self.lock().calls.iter().filter(|c| c.verb() == verb).count() }

    pub fn clear_calls(&self) { self.lock().calls.clear(); }

    pub fn object(&self, key: &ObjectKey) -> Option<K> { self.lock().objects.get(key).cloned() }

    pub fn objects(&self) -> Vec<K> { self.lock().objects.values().cloned().collect() }

    pub fn resource_version(&self) -> u64 { self.lock().rv }

    /// Mutate a stored object out of band (as another writer would), bumping its resourceVersion.
    pub fn modify(&self, key: &ObjectKey, f: impl FnOnce(&mut K)) -> StoreResult<K> {
        let mut inner = self.lock();
        let mut obj = inner.objects.get(key).cloned().ok_or_else(|| StoreError::NotFound(key.to_string()))?;
        f(&mut obj);
        let v = serde_json::to_value(&obj)?;
        self.commit(&mut inner, key.clone(), v, false)
    }

    /// Forget history below the current resourceVersion; older watches expire.
    pub fn compact(&self) {
        let mut inner = self.lock();
        inner.compacted = inner.rv;
        inner.log.clear();
    }

    /// End every open watch stream, as an apiserver closing connections would.
    pub fn interrupt_watches(&self) { let _ = self.events.send(None); }

    /// Send a bookmark carrying the current resourceVersion to open watches.
    pub fn bookmark(&self) {
        let inner = self.lock();
        let _ = self.events.send(Some((inner.rv, WatchEvent::Bookmark(inner.rv.to_string()))));
    }

    fn record(&self, inner: &mut Inner<K>, call: Call) -> StoreResult<()> {
        let verb = call.verb();
        inner.calls.push(call);
        if let Some(pos) = inner.faults.iter().position(|(v, _)| *v == verb) {
            if let Some((_, err)) = inner.faults.remove(pos) {
                debug!(?verb, error = %err, "injected fault");
                return Err(err);
            }
        }
        Ok(())
    }

    fn emit(&self, inner: &mut Inner<K>, ev: WatchEvent<K>) {
        let seq = inner.rv;
        inner.log.push((seq, ev.clone()));
        let _ = self.events.send(Some((seq, ev)));
    }

    fn store_new(&self, inner: &mut Inner<K>, obj: K) -> Result<K, (K, StoreError)> {
        let key = match ObjectKey::of(&obj) {
            Ok(k) => k,
            Err(e) => return Err((obj, StoreError::Invalid(e.to_string()))),
        };
        if inner.objects.contains_key(&key) {
            return Err((obj, StoreError::AlreadyExists(key.to_string())));
        }
        let mut obj = obj;
        inner.rv += 1;
        let meta = obj.meta_mut();
        meta.resource_version = Some(inner.rv.to_string());
        meta.uid = Some(uuid::Uuid::new_v4().to_string());
        meta.creation_timestamp = Some(Time(chrono::Utc::now()));
        inner.objects.insert(key, obj.clone());
        self.emit(inner, WatchEvent::Added(obj.clone()));
        Ok(obj)
    }

    /// Store `v` as the new state of `key`, bumping the resourceVersion.
    fn commit(&self, inner: &mut Inner<K>, key: ObjectKey, mut v: Json, check_rv: bool) -> StoreResult<K> {
        let current = inner.objects.get(&key).ok_or_else(|| StoreError::NotFound(key.to_string()))?;
        let current_rv = current.resource_version().unwrap_or_default();
        if check_rv {
            match json_rv(&v) {
                Some(rv) if rv == current_rv => {}
                Some(rv) => {
                    return Err(StoreError::Conflict(format!(
                        "{}: resourceVersion {} is stale (current {})",
                        key, rv, current_rv
                    )))
                }
                None => return Err(StoreError::Invalid(format!("{}: resourceVersion required", key))),
            }
        }
        let before = serde_json::to_value(current)?;
        for field in ["uid", "creationTimestamp", "name", "namespace"] {
            if let Some(f) = before.get("metadata").and_then(|m| m.get(field)) {
                set_meta(&mut v, field, f.clone());
            }
        }
        set_meta(&mut v, "resourceVersion", Json::String(current_rv));
        if v == before {
            return Ok(current.clone());
        }
        inner.rv += 1;
        set_meta(&mut v, "resourceVersion", Json::String(inner.rv.to_string()));
        let obj: K = serde_json::from_value(v)?;
        inner.objects.insert(key, obj.clone());
        self.emit(inner, WatchEvent::Modified(obj.clone()));
        Ok(obj)
    }

    fn stored_json(&self, inner: &Inner<K>, key: &ObjectKey) -> StoreResult<Json> {
        let obj = inner.objects.get(key).ok_or_else(|| StoreError::NotFound(key.to_string()))?;
        Ok(serde_json::to_value(obj)?)
    }
}

fn with_status(mut target: Json, source: &Json) -> Json {
    if let Some(obj) = target.as_object_mut() {
        match source.get("status") {
            Some(s) => obj.insert("status".to_string(), s.clone()),
            None => obj.remove("status"),
        };
    }
    target
}

fn key_of<K: Resource>(obj: &K) -> StoreResult<ObjectKey> {
    ObjectKey::of(obj).map_err(|e| StoreError::Invalid(e.to_string()))
}

#[async_trait::async_trait]
impl<K> ObjectStore<K> for MemoryStore<K>
where
    K: Resource + Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    async fn get(&self, key: &ObjectKey) -> StoreResult<K> {
        let mut inner = self.lock();
        self.record(&mut inner, Call::Get(key.clone()))?;
        inner.objects.get(key).cloned().ok_or_else(|| StoreError::NotFound(key.to_string()))
    }

    async fn list(&self, scope: &ListScope) -> StoreResult<Listed<K>> {
        let mut inner = self.lock();
        self.record(&mut inner, Call::List(scope.namespace.clone()))?;
        let items = inner.objects.values().filter(|o| scope.matches(o.meta())).cloned().collect();
        Ok(Listed { items, resource_version: inner.rv.to_string() })
    }

    async fn watch(&self, scope: &ListScope, resource_version: &str) -> StoreResult<WatchStream<K>> {
        let mut inner = self.lock();
        self.record(&mut inner, Call::Watch(resource_version.to_string()))?;
        let since = if resource_version.is_empty() {
            inner.rv
        } else {
            resource_version
                .parse::<u64>()
                .map_err(|_| StoreError::Invalid(format!("resourceVersion {:?}", resource_version)))?
        };
        if since < inner.compacted {
            return Err(StoreError::Expired(format!("resourceVersion {} is too old", since)));
        }
        let backlog: Vec<Logged<K>> = inner.log.iter().filter(|(seq, _)| *seq > since).cloned().collect();
        // Subscribe while holding the lock so nothing falls between backlog and live events.
        let rx = self.events.subscribe();
        drop(inner);

        let last = backlog.last().map(|(seq, _)| *seq).unwrap_or(since);
        let live = futures::stream::unfold((rx, last), |(mut rx, last)| async move {
            loop {
                match rx.recv().await {
                    Ok(Some((seq, ev))) if seq > last || matches!(ev, WatchEvent::Bookmark(_)) => {
                        return Some((Ok(ev), (rx, seq.max(last))));
                    }
                    Ok(Some(_)) => continue,
                    Ok(None) | Err(broadcast::error::RecvError::Closed) => return None,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        return Some((Err(StoreError::Expired(format!("watch lagged by {} events", n))), (rx, last)));
                    }
                }
            }
        });
        let scope = scope.clone();
        Ok(futures::stream::iter(backlog.into_iter().map(|(_, ev)| Ok(ev)))
            .chain(live)
            .filter(move |ev| {
                let keep = match ev {
                    Ok(WatchEvent::Added(o)) | Ok(WatchEvent::Modified(o)) | Ok(WatchEvent::Deleted(o)) => {
                        scope.matches(o.meta())
                    }
                    _ => true,
                };
                futures::future::ready(keep)
            })
            .boxed())
    }

    async fn create(&self, obj: &K) -> StoreResult<K> {
        let key = key_of(obj)?;
        let mut inner = self.lock();
        self.record(&mut inner, Call::Create(key))?;
        self.store_new(&mut inner, obj.clone()).map_err(|(_, e)| e)
    }

    async fn update(&self, obj: &K) -> StoreResult<K> {
        let key = key_of(obj)?;
        let mut inner = self.lock();
        self.record(&mut inner, Call::Update(key.clone()))?;
        let stored = self.stored_json(&inner, &key)?;
        let v = with_status(serde_json::to_value(obj)?, &stored);
        self.commit(&mut inner, key, v, true)
    }

    async fn update_status(&self, obj: &K) -> StoreResult<K> {
        let key = key_of(obj)?;
        let mut inner = self.lock();
        self.record(&mut inner, Call::UpdateStatus(key.clone()))?;
        let mut v = with_status(self.stored_json(&inner, &key)?, &serde_json::to_value(obj)?);
        set_meta(&mut v, "resourceVersion", obj.resource_version().map(Json::String).unwrap_or(Json::Null));
        self.commit(&mut inner, key, v, true)
    }

    async fn patch(&self, key: &ObjectKey, target: PatchTarget, patch: &Json) -> StoreResult<K> {
        let mut inner = self.lock();
        self.record(&mut inner, Call::Patch(key.clone(), target, patch.clone()))?;
        let stored = self.stored_json(&inner, key)?;
        let precondition = json_rv(patch).map(str::to_string);
        let mut body = patch.clone();
        if let Some(meta) = body.get_mut("metadata").and_then(Json::as_object_mut) {
            meta.remove("resourceVersion");
            meta.remove("uid");
        }
        let mut v = stored.clone();
        match target {
            PatchTarget::Main => {
                if let Some(obj) = body.as_object_mut() {
                    obj.remove("status");
                }
                merge_apply(&mut v, &body);
            }
            PatchTarget::Status => {
                if let Some(status) = body.get("status") {
                    let mut doc = serde_json::json!({ "status": stored.get("status").cloned().unwrap_or(Json::Null) });
                    merge_apply(&mut doc, &serde_json::json!({ "status": status }));
                    v = with_status(v, &doc);
                }
            }
        }
        match precondition {
            Some(rv) => {
                set_meta(&mut v, "resourceVersion", Json::String(rv));
                self.commit(&mut inner, key.clone(), v, true)
            }
            None => self.commit(&mut inner, key.clone(), v, false),
        }
    }

    async fn delete(&self, key: &ObjectKey) -> StoreResult<()> {
        let mut inner = self.lock();
        self.record(&mut inner, Call::Delete(key.clone()))?;
        let mut obj = inner.objects.remove(key).ok_or_else(|| StoreError::NotFound(key.to_string()))?;
        inner.rv += 1;
        obj.meta_mut().resource_version = Some(inner.rv.to_string());
        self.emit(&mut inner, WatchEvent::Deleted(obj));
        Ok(())
    }
}
