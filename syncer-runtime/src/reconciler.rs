//! Reconciler contracts shared by the controllers.

use std::hash::{Hash, Hasher};

use async_trait::async_trait;

use syncer_core::SyncError;

/// The kind of change that produced a request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventType {
    /// Object appeared (including on initial list / re-list).
    Add,
    /// Object changed.
    Update,
    /// Object went away.
    Delete,
}

/// Identifies one tenant object to reconcile downward.
///
/// Deliberately carries no object state: the reconciler re-reads the current
/// cached object, so coalesced or out-of-order events cannot make it act on a
/// stale snapshot. Queue identity ignores [`Request::event`] — a burst of
/// changes to one key collapses into a single pass.
#[derive(Clone, Debug, Eq)]
pub struct Request {
    /// Owning tenant cluster.
    pub cluster: String,
    /// Tenant-side namespace, `None` for cluster-scoped kinds.
    pub namespace: Option<String>,
    /// Object name.
    pub name: String,
    /// UID of the tenant object that triggered the request, when known.
    pub uid: Option<String>,
    /// What happened; advisory only.
    pub event: EventType,
}

impl PartialEq for Request {
    fn eq(&self, other: &Self) -> bool {
        self.cluster == other.cluster
            && self.namespace == other.namespace
            && self.name == other.name
            && self.uid == other.uid
    }
}

impl Hash for Request {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.cluster.hash(state);
        self.namespace.hash(state);
        self.name.hash(state);
        self.uid.hash(state);
    }
}

impl std::fmt::Display for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{ns}/{}", self.cluster, self.name),
            None => write!(f, "{}/{}", self.cluster, self.name),
        }
    }
}

/// Downward reconcile: tenant-declared state into the super cluster.
#[async_trait]
pub trait DownwardReconciler: Send + Sync {
    /// Reconcile one tenant object (or its tombstone) into the super
    /// cluster.
    async fn reconcile(&self, request: Request) -> Result<(), SyncError>;
}

/// Upward reconcile: super-observed state back into the owning tenant.
#[async_trait]
pub trait UpwardReconciler: Send + Sync {
    /// Back-populate one super object key. Must be idempotent.
    async fn back_populate(&self, request: &crate::uwcontroller::UwsRequest) -> Result<(), SyncError>;
}

/// Periodic consistency check between both sides of one kind.
#[async_trait]
pub trait PatrolReconciler: Send + Sync {
    /// Run one patrol pass, enqueuing work for every inconsistent pair.
    async fn patrol_once(&self);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::hash_map::DefaultHasher;

    fn request(event: EventType) -> Request {
        Request {
            cluster: "c1".into(),
            namespace: Some("ns".into()),
            name: "p1".into(),
            uid: Some("u1".into()),
            event,
        }
    }

    #[test]
    fn queue_identity_ignores_event_type() {
        let add = request(EventType::Add);
        let delete = request(EventType::Delete);
        assert_eq!(add, delete);
        let hash = |r: &Request| {
            let mut h = DefaultHasher::new();
            r.hash(&mut h);
            h.finish()
        };
        assert_eq!(hash(&add), hash(&delete));
    }
}
