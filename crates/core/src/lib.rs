//! kbind core types: object keys, watch deltas, store errors and the object store seam

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fmt;

use futures::stream::BoxStream;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::{Resource, ResourceExt};
use serde::{Deserialize, Serialize};

pub mod merge;

pub use merge::{merge_apply, merge_diff, strip_server_fields};

/// Identity of a watched object; renders as `ns/name`, or `name` when cluster-scoped.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectKey {
    pub namespace: Option<String>,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KeyError {
    #[error("object has no metadata.name")]
    MissingName,
    #[error("unexpected key format: {0:?}")]
    Malformed(String),
}

impl ObjectKey {
    pub fn namespaced(namespace: &str, name: &str) -> Self {
        Self::new(Some(namespace), name)
    }

    pub fn cluster(name: &str) -> Self {
        Self { namespace: None, name: name.to_string() }
    }

    pub fn new(namespace: Option<&str>, name: &str) -> Self {
        let namespace = namespace.filter(|ns| !ns.is_empty()).map(str::to_string);
        Self { namespace, name: name.to_string() }
    }

    /// Key of an object from its metadata. Objects without a name have no key.
    pub fn of<K: Resource>(obj: &K) -> Result<Self, KeyError> {
        let meta = obj.meta();
        match meta.name.as_deref() {
            Some(name) if !name.is_empty() => Ok(Self::new(meta.namespace.as_deref(), name)),
            _ => Err(KeyError::MissingName),
        }
    }

    /// Parse `ns/name` or `name`. Anything else is malformed.
    pub fn parse(key: &str) -> Result<Self, KeyError> {
        let parts: Vec<&str> = key.split('/').collect();
        match parts.as_slice() {
            [name] if !name.is_empty() => Ok(Self::cluster(name)),
            [ns, name] if !name.is_empty() => Ok(Self::new(Some(ns), name)),
            _ => Err(KeyError::Malformed(key.to_string())),
        }
    }

    pub fn namespace(&self) -> Option<&str> { self.namespace.as_deref() }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}", ns, self.name),
            None => f.write_str(&self.name),
        }
    }
}

/// Change fed from a watch into the cache.
#[derive(Debug, Clone)]
pub enum Delta<K> {
    Applied(K),
    Deleted(K),
    /// Full relist; replaces everything the cache holds.
    Restarted(Vec<K>),
}

/// Failure taxonomy shared by every `ObjectStore` implementation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("not_found: {0}")]
    NotFound(String),
    #[error("already_exists: {0}")]
    AlreadyExists(String),
    #[error("conflict: {0}")]
    Conflict(String),
    /// The requested resourceVersion is too old to watch from.
    #[error("expired: {0}")]
    Expired(String),
    #[error("invalid: {0}")]
    Invalid(String),
    #[error("transport: {0}")]
    Transport(String),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool { matches!(self, StoreError::NotFound(_)) }
    pub fn is_already_exists(&self) -> bool { matches!(self, StoreError::AlreadyExists(_)) }
    pub fn is_conflict(&self) -> bool { matches!(self, StoreError::Conflict(_)) }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self { StoreError::Invalid(e.to_string()) }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Map NotFound to `Ok(None)`.
pub fn ignore_not_found<T>(res: StoreResult<T>) -> StoreResult<Option<T>> {
    match res {
        Ok(v) => Ok(Some(v)),
        Err(e) if e.is_not_found() => Ok(None),
        Err(e) => Err(e),
    }
}

/// Map AlreadyExists to `Ok(None)`.
pub fn ignore_already_exists<T>(res: StoreResult<T>) -> StoreResult<Option<T>> {
    match res {
        Ok(v) => Ok(Some(v)),
        Err(e) if e.is_already_exists() => Ok(None),
        Err(e) => Err(e),
    }
}

/// Namespace and label restriction for list and watch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListScope {
    pub namespace: Option<String>,
    pub labels: BTreeMap<String, String>,
}

impl ListScope {
    pub fn all() -> Self { Self::default() }

    pub fn namespace(ns: &str) -> Self {
        Self { namespace: Some(ns.to_string()), labels: BTreeMap::new() }
    }

    pub fn with_label(mut self, key: &str, value: &str) -> Self {
        self.labels.insert(key.to_string(), value.to_string());
        self
    }

    /// Label selector in `k=v,k2=v2` form; empty when unrestricted.
    pub fn label_selector(&self) -> String {
        self.labels.iter().map(|(k, v)| format!("{}={}", k, v)).collect::<Vec<_>>().join(",")
    }

    pub fn matches(&self, meta: &ObjectMeta) -> bool {
        if let Some(ns) = &self.namespace {
            if meta.namespace.as_deref() != Some(ns.as_str()) {
                return false;
            }
        }
        let labels = meta.labels.as_ref();
        self.labels.iter().all(|(k, v)| labels.and_then(|l| l.get(k)) == Some(v))
    }
}

/// Result of a list call: items plus the collection resourceVersion to watch from.
#[derive(Debug, Clone)]
pub struct Listed<K> {
    pub items: Vec<K>,
    pub resource_version: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum WatchEvent<K> {
    Added(K),
    Modified(K),
    Deleted(K),
    /// Progress marker carrying only a resourceVersion.
    Bookmark(String),
}

impl<K: Resource> WatchEvent<K> {
    pub fn resource_version(&self) -> Option<String> {
        match self {
            WatchEvent::Added(o) | WatchEvent::Modified(o) | WatchEvent::Deleted(o) => o.resource_version(),
            WatchEvent::Bookmark(rv) => Some(rv.clone()),
        }
    }
}

/// Which part of an object a patch is written to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PatchTarget {
    /// Metadata and spec.
    Main,
    /// The status subresource.
    Status,
}

impl PatchTarget {
    pub fn as_str(&self) -> &'static str {
        match self {
            PatchTarget::Main => "main",
            PatchTarget::Status => "status",
        }
    }
}

pub type WatchStream<K> = BoxStream<'static, StoreResult<WatchEvent<K>>>;

/// Authoritative object store for one kind.
///
/// Writes use optimistic concurrency: a stale `metadata.resourceVersion`
/// on update or patch yields `StoreError::Conflict`.
#[async_trait::async_trait]
pub trait ObjectStore<K>: Send + Sync {
    async fn get(&self, key: &ObjectKey) -> StoreResult<K>;
    async fn list(&self, scope: &ListScope) -> StoreResult<Listed<K>>;
    async fn watch(&self, scope: &ListScope, resource_version: &str) -> StoreResult<WatchStream<K>>;
    async fn create(&self, obj: &K) -> StoreResult<K>;
    async fn update(&self, obj: &K) -> StoreResult<K>;
    async fn update_status(&self, obj: &K) -> StoreResult<K>;
    /// Apply a JSON merge patch to the main resource or the status subresource.
    async fn patch(&self, key: &ObjectKey, target: PatchTarget, patch: &serde_json::Value) -> StoreResult<K>;
    async fn delete(&self, key: &ObjectKey) -> StoreResult<()>;
}

pub mod prelude {
    pub use super::{
        Delta, ListScope, Listed, ObjectKey, ObjectStore, PatchTarget, StoreError, StoreResult, WatchEvent,
        WatchStream,
    };
}
