//! Persist the difference between a snapshot and its reconciled copy.

use std::sync::Arc;

use kube::{Resource, ResourceExt};
use serde::Serialize;
use serde_json::{json, Value as Json};
use tracing::debug;

use kbind_core::{merge_diff, strip_server_fields, KeyError, ObjectKey, ObjectStore, PatchTarget, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum CommitError {
    #[error("object has no key: {0}")]
    Key(#[from] KeyError),
    #[error("serializing object: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("writing {target} of {key}: {source}")]
    Store {
        key: ObjectKey,
        target: &'static str,
        #[source]
        source: StoreError,
    },
}

impl CommitError {
    pub fn is_conflict(&self) -> bool { matches!(self, CommitError::Store { source, .. } if source.is_conflict()) }
}

/// What a commit wrote.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Committed {
    pub main: bool,
    pub status: bool,
}

/// Writes metadata/spec and status changes as separate minimal merge patches,
/// guarded by the resourceVersion the reconcile started from.
pub struct Committer<K> {
    store: Arc<dyn ObjectStore<K>>,
    conflict_retries: usize,
}

impl<K> Clone for Committer<K> {
    fn clone(&self) -> Self { Self { store: Arc::clone(&self.store), conflict_retries: self.conflict_retries } }
}

fn split(mut v: Json) -> (Json, Json) {
    let status = v.as_object_mut().and_then(|m| m.remove("status")).unwrap_or(Json::Null);
    (v, status)
}

fn stamp(mut patch: Json, rv: Option<&str>, uid: Option<&str>) -> Json {
    if let Some(obj) = patch.as_object_mut() {
        let meta = obj.entry("metadata").or_insert_with(|| json!({}));
        if let Some(meta) = meta.as_object_mut() {
            if let Some(rv) = rv {
                meta.insert("resourceVersion".into(), Json::String(rv.to_string()));
            }
            if let Some(uid) = uid {
                meta.insert("uid".into(), Json::String(uid.to_string()));
            }
        }
    }
    patch
}

impl<K> Committer<K>
where
    K: Resource + Serialize + Send + Sync + 'static,
{
    pub fn new(store: Arc<dyn ObjectStore<K>>) -> Self {
        let conflict_retries = std::env::var("KBIND_COMMIT_CONFLICT_RETRIES")
            .ok()
            .and_then(|s| s.parse::<usize>().ok())
            .unwrap_or(2);
        Self { store, conflict_retries }
    }

    /// Status-subresource conflicts are retried this many times after a re-fetch.
    /// Metadata/spec conflicts are never retried.
    pub fn with_conflict_retries(mut self, retries: usize) -> Self {
        self.conflict_retries = retries;
        self
    }

    pub fn store(&self) -> &Arc<dyn ObjectStore<K>> { &self.store }

    /// Write what changed between `old` (the cached snapshot) and `new`.
    pub async fn commit(&self, old: &K, new: &K) -> Result<Committed, CommitError> {
        let key = ObjectKey::of(new)?;
        let (old_main, old_status) = split(serde_json::to_value(old)?);
        let (new_main, new_status) = split(serde_json::to_value(new)?);
        let mut rv = old.resource_version();
        let uid = old.uid();
        let mut done = Committed::default();

        if let Some(diff) = merge_diff(&strip_server_fields(old_main), &strip_server_fields(new_main)) {
            let patch = stamp(diff, rv.as_deref(), uid.as_deref());
            debug!(key = %key, patch = %patch, "patching object");
            let updated = self
                .store
                .patch(&key, PatchTarget::Main, &patch)
                .await
                .map_err(|source| CommitError::Store { key: key.clone(), target: PatchTarget::Main.as_str(), source })?;
            metrics::counter!("commit_patches_total", 1u64, "target" => PatchTarget::Main.as_str());
            rv = updated.resource_version();
            done.main = true;
        }

        let Some(status_diff) = merge_diff(&old_status, &new_status) else {
            return Ok(done);
        };
        let mut attempt = 0;
        loop {
            let patch = stamp(json!({ "status": status_diff.clone() }), rv.as_deref(), uid.as_deref());
            match self.store.patch(&key, PatchTarget::Status, &patch).await {
                Ok(_) => {
                    metrics::counter!("commit_patches_total", 1u64, "target" => PatchTarget::Status.as_str());
                    done.status = true;
                    return Ok(done);
                }
                Err(e) if e.is_conflict() && attempt < self.conflict_retries => {
                    attempt += 1;
                    debug!(key = %key, attempt, "status conflict; refreshing resourceVersion");
                    let fresh = self
                        .store
                        .get(&key)
                        .await
                        .map_err(|source| CommitError::Store { key: key.clone(), target: PatchTarget::Status.as_str(), source })?;
                    rv = fresh.resource_version();
                }
                Err(source) => return Err(CommitError::Store { key, target: PatchTarget::Status.as_str(), source }),
            }
        }
    }
}
