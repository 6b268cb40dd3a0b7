//! Local caches of last-observed cluster state.

pub mod store;

pub use store::{Store, Writer};

use syncer_core::meta::ObjectExt;
use syncer_core::SyncedObject;

/// Cache key of one object within one (cluster, kind) cache.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    /// Namespace, `None` for cluster-scoped kinds.
    pub namespace: Option<String>,
    /// Object name.
    pub name: String,
}

impl ObjectKey {
    /// Key for a namespaced or cluster-scoped object.
    pub fn new(namespace: Option<&str>, name: &str) -> Self {
        ObjectKey {
            namespace: namespace.map(str::to_string),
            name: name.to_string(),
        }
    }

    /// Key of an object.
    pub fn from_obj<K: SyncedObject>(obj: &K) -> Self {
        ObjectKey::new(obj.namespace(), obj.name())
    }
}

impl std::fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{ns}/{}", self.name),
            None => f.write_str(&self.name),
        }
    }
}
