//! Secondary index registry.

use std::any::TypeId;

use kube::Resource;
use rustc_hash::FxHashMap;
use smallvec::SmallVec;

pub type IndexKeys = SmallVec<[String; 4]>;

/// Name of the index every cache carries: objects by namespace.
pub const NAMESPACE_INDEX: &str = "namespace";

/// A named function from an object to the index keys it belongs to.
///
/// The implementing type is the identity of the index: registering the same
/// type twice is a no-op, a different type under the same name is rejected.
pub trait IndexFunc<K>: 'static {
    const NAME: &'static str;
    fn index(obj: &K) -> IndexKeys;
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IndexError {
    #[error("index {0:?} is already registered with a different function")]
    Conflict(&'static str),
    #[error("index {0:?} does not exist")]
    Unknown(String),
}

/// Built-in namespace index.
pub struct ByNamespace;

impl<K: Resource> IndexFunc<K> for ByNamespace {
    const NAME: &'static str = NAMESPACE_INDEX;
    fn index(obj: &K) -> IndexKeys {
        obj.meta().namespace.iter().filter(|ns| !ns.is_empty()).cloned().collect()
    }
}

struct Registered<K> {
    id: TypeId,
    func: fn(&K) -> IndexKeys,
}

/// Registry of index functions for one kind, built before its cache starts.
pub struct Indexers<K> {
    funcs: FxHashMap<&'static str, Registered<K>>,
}

impl<K: Resource + 'static> Default for Indexers<K> {
    fn default() -> Self { Self::new() }
}

impl<K: Resource + 'static> Indexers<K> {
    pub fn new() -> Self {
        let mut me = Self { funcs: FxHashMap::default() };
        me.funcs.insert(NAMESPACE_INDEX, Registered { id: TypeId::of::<ByNamespace>(), func: <ByNamespace as IndexFunc<K>>::index });
        me
    }
}

impl<K: 'static> Indexers<K> {
    /// Register `I` under `I::NAME`. Idempotent for the same `I`.
    pub fn add<I: IndexFunc<K>>(&mut self) -> Result<(), IndexError> {
        let id = TypeId::of::<I>();
        match self.funcs.get(I::NAME) {
            Some(existing) if existing.id == id => Ok(()),
            Some(_) => Err(IndexError::Conflict(I::NAME)),
            None => {
                self.funcs.insert(I::NAME, Registered { id, func: I::index });
                Ok(())
            }
        }
    }

    pub fn contains(&self, name: &str) -> bool { self.funcs.contains_key(name) }

    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ { self.funcs.keys().copied() }

    pub(crate) fn keys_for(&self, obj: &K) -> Vec<(&'static str, IndexKeys)> {
        self.funcs.iter().map(|(name, r)| (*name, (r.func)(obj))).collect()
    }
}
