//! Error taxonomy for object store access and reconciliation.

use thiserror::Error;

/// Convenience alias used throughout the syncer crates.
pub type Result<T, E = ApiError> = std::result::Result<T, E>;

/// An error returned by an object store client.
///
/// The variants mirror the optimistic-concurrency contract of the store:
/// [`NotFound`](ApiError::NotFound) and
/// [`AlreadyExists`](ApiError::AlreadyExists) are expected transient states
/// that most callers treat as tombstones or as success, and
/// [`Conflict`](ApiError::Conflict) is the routine outcome of a stale
/// resource version or a failed UID precondition, always resolved by
/// re-reading and retrying.
#[derive(Debug, Error)]
pub enum ApiError {
    /// The requested object does not exist.
    #[error("{kind} {name:?} not found")]
    NotFound {
        /// Resource kind.
        kind: &'static str,
        /// Object name, `ns/name` for namespaced kinds.
        name: String,
    },

    /// An object with this name already exists.
    #[error("{kind} {name:?} already exists")]
    AlreadyExists {
        /// Resource kind.
        kind: &'static str,
        /// Object name, `ns/name` for namespaced kinds.
        name: String,
    },

    /// A write lost the optimistic-concurrency race: stale resource version
    /// or a UID precondition that no longer holds.
    #[error("conflicting write to {kind} {name:?}: {reason}")]
    Conflict {
        /// Resource kind.
        kind: &'static str,
        /// Object name.
        name: String,
        /// Which precondition failed.
        reason: String,
    },

    /// The object is malformed for the attempted operation (e.g. missing a
    /// name on create).
    #[error("invalid object: {0}")]
    Invalid(String),

    /// The transport below the client failed; retryable.
    #[error("transport failure: {0}")]
    Transport(String),
}

impl ApiError {
    /// Whether this is a not-found outcome.
    pub fn is_not_found(&self) -> bool {
        matches!(self, ApiError::NotFound { .. })
    }

    /// Whether this is an already-exists outcome.
    pub fn is_already_exists(&self) -> bool {
        matches!(self, ApiError::AlreadyExists { .. })
    }

    /// Whether this is an optimistic-concurrency conflict.
    pub fn is_conflict(&self) -> bool {
        matches!(self, ApiError::Conflict { .. })
    }
}

/// An error produced by a reconcile pass.
///
/// The queue machinery classifies these: conflicts and transient API errors
/// are requeued with backoff, [`Integrity`](SyncError::Integrity) is terminal
/// for the key, and [`BindConflict`](SyncError::BindConflict) is the
/// retryable loser of the bind-vs-GC race.
#[derive(Debug, Error)]
pub enum SyncError {
    /// The object store failed underneath the reconcile.
    #[error(transparent)]
    Api(#[from] ApiError),

    /// The ownership mapping recorded on a super object disagrees with the
    /// live tenant object. Retrying cannot fix a data-model invariant
    /// violation, so this is terminal for the key.
    #[error("integrity violation: {0}")]
    Integrity(String),

    /// The tenant cluster named by a request is not (or no longer)
    /// registered.
    #[error("cluster {0} is not registered")]
    ClusterNotRegistered(String),

    /// A registration attempt for a cluster name that is already serving.
    #[error("cluster {0} is already registered")]
    ClusterAlreadyRegistered(String),

    /// The bind target virtual node is being garbage collected; the caller
    /// must retry the bind after the sweep settles.
    #[error("virtual node {node} in cluster {cluster} is being collected, retry bind")]
    BindConflict {
        /// Tenant cluster name.
        cluster: String,
        /// Virtual node name.
        node: String,
    },
}

impl SyncError {
    /// Terminal errors are logged loudly and not requeued.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SyncError::Integrity(_))
    }

    /// Conflicts are routine and requeued without an error-level log.
    pub fn is_conflict(&self) -> bool {
        match self {
            SyncError::Api(e) => e.is_conflict(),
            SyncError::BindConflict { .. } => true,
            _ => false,
        }
    }
}
