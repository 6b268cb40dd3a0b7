//! Virtual-node lifecycle tracking and the bind-vs-GC protocol.
//!
//! Each tenant cluster gets a map from virtual node name to the set of bound
//! pod UIDs plus a lifecycle phase:
//!
//! ```text
//! absent ──bind──▶ Running ──0 pods, sweep──▶ Quiescing ──sweep──▶ Deleting ──▶ removed
//!                     ▲                            │
//!                     └──────────reserve───────────┘
//! ```
//!
//! Binding follows a two-phase protocol: **reserve** first
//! ([`VNodeMap::reserve`], which pulls a Quiescing node back to Running or
//! fails against a Deleting one), then perform the bind I/O, then
//! [`VNodeMap::record_bind`]. The per-cluster mutex only guards the map
//! mutation; sweep deletion I/O happens between [`VNodeMap::begin_sweep`]
//! and [`VNodeMap::finish_sweep`], outside the lock.

use ahash::{AHashMap, AHashSet};
use parking_lot::Mutex;

/// Lifecycle phase of one virtual node within one tenant cluster.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    Running,
    Quiescing,
    Deleting,
}

#[derive(Debug, Default)]
struct NodeEntry {
    pods: AHashSet<String>,
    phase: Option<Phase>,
}

impl NodeEntry {
    fn phase(&self) -> Phase {
        self.phase.unwrap_or(Phase::Running)
    }
}

#[derive(Debug, Default)]
struct ClusterNodes {
    nodes: AHashMap<String, NodeEntry>,
}

/// Per-cluster virtual node reference counts and GC phases.
#[derive(Debug, Default)]
pub struct VNodeMap {
    clusters: Mutex<AHashMap<String, ClusterNodes>>,
}

impl VNodeMap {
    /// An empty map.
    pub fn new() -> Self {
        VNodeMap::default()
    }

    /// Reserve a node for an imminent bind.
    ///
    /// Pulls the node out of the quiescing set (or creates a fresh Running
    /// entry) so a concurrent sweep cannot delete it underneath the bind.
    /// Returns `false` if the node is mid-deletion — the bind must fail
    /// retryably, not proceed against a node about to disappear.
    #[must_use]
    pub fn reserve(&self, cluster: &str, node: &str) -> bool {
        let mut clusters = self.clusters.lock();
        let entry = clusters
            .entry(cluster.to_string())
            .or_default()
            .nodes
            .entry(node.to_string())
            .or_default();
        match entry.phase() {
            Phase::Deleting => false,
            _ => {
                entry.phase = Some(Phase::Running);
                true
            }
        }
    }

    /// Record a pod bound to a node. The node entry is created if needed and
    /// kept Running while referenced.
    pub fn record_bind(&self, cluster: &str, node: &str, pod_uid: &str) {
        let mut clusters = self.clusters.lock();
        let entry = clusters
            .entry(cluster.to_string())
            .or_default()
            .nodes
            .entry(node.to_string())
            .or_default();
        entry.pods.insert(pod_uid.to_string());
        if entry.phase() != Phase::Deleting {
            entry.phase = Some(Phase::Running);
        }
    }

    /// Record a bound pod going away. A node left without pods becomes a GC
    /// candidate on the next sweep.
    pub fn record_release(&self, cluster: &str, node: &str, pod_uid: &str) {
        let mut clusters = self.clusters.lock();
        if let Some(cluster_nodes) = clusters.get_mut(cluster) {
            if let Some(entry) = cluster_nodes.nodes.get_mut(node) {
                entry.pods.remove(pod_uid);
            }
        }
    }

    /// Reconcile the map of one cluster against the observed set of
    /// (node, pod uid) bindings, pruning references to pods that no longer
    /// exist. Used by patrol to rebuild state after restarts and missed
    /// events.
    pub fn retain_cluster(&self, cluster: &str, live: &AHashMap<String, AHashSet<String>>) {
        let mut clusters = self.clusters.lock();
        let cluster_nodes = clusters.entry(cluster.to_string()).or_default();
        for (node, uids) in live {
            let entry = cluster_nodes.nodes.entry(node.clone()).or_default();
            entry.pods.extend(uids.iter().cloned());
            if entry.phase() != Phase::Deleting {
                entry.phase = Some(Phase::Running);
            }
        }
        for (node, entry) in cluster_nodes.nodes.iter_mut() {
            if let Some(uids) = live.get(node) {
                entry.pods.retain(|uid| uids.contains(uid));
            } else {
                entry.pods.clear();
            }
        }
    }

    /// Advance the GC state machine for one cluster.
    ///
    /// Unreferenced Running nodes move to Quiescing (grace round);
    /// unreferenced Quiescing nodes move to Deleting and are returned — the
    /// caller performs the tenant-side node deletion outside the lock and
    /// reports back through [`VNodeMap::finish_sweep`].
    pub fn begin_sweep(&self, cluster: &str) -> Vec<String> {
        let mut clusters = self.clusters.lock();
        let Some(cluster_nodes) = clusters.get_mut(cluster) else {
            return Vec::new();
        };
        let mut deleting = Vec::new();
        for (node, entry) in cluster_nodes.nodes.iter_mut() {
            if !entry.pods.is_empty() {
                continue;
            }
            match entry.phase() {
                Phase::Running => entry.phase = Some(Phase::Quiescing),
                Phase::Quiescing => {
                    entry.phase = Some(Phase::Deleting);
                    deleting.push(node.clone());
                }
                Phase::Deleting => {}
            }
        }
        deleting
    }

    /// Settle one node after the sweep's deletion attempt: on success the
    /// entry is dropped; on failure the node returns to Quiescing so a later
    /// sweep (or a reserve) can pick it up again.
    pub fn finish_sweep(&self, cluster: &str, node: &str, deleted: bool) {
        let mut clusters = self.clusters.lock();
        let Some(cluster_nodes) = clusters.get_mut(cluster) else {
            return;
        };
        if deleted {
            // A pod may have bound while the delete was in flight only if it
            // reserved first, which fails during Deleting; safe to drop.
            cluster_nodes.nodes.remove(node);
        } else if let Some(entry) = cluster_nodes.nodes.get_mut(node) {
            if entry.phase() == Phase::Deleting {
                entry.phase = Some(Phase::Quiescing);
            }
        }
    }

    /// Drop all state for a cluster on unregistration.
    pub fn forget_cluster(&self, cluster: &str) {
        self.clusters.lock().remove(cluster);
    }

    /// Whether a node is currently referenced by at least one pod.
    pub fn is_referenced(&self, cluster: &str, node: &str) -> bool {
        self.clusters
            .lock()
            .get(cluster)
            .and_then(|c| c.nodes.get(node))
            .map(|e| !e.pods.is_empty())
            .unwrap_or(false)
    }
}
