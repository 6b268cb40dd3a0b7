//! The generic multi-cluster synchronization engine.
//!
//! Everything kind-agnostic lives here:
//!
//! - [`watcher`] + [`reflector`]: a per-(cluster, kind) change notification
//!   stream feeding a local cache with a synced signal.
//! - [`queue`]: the work queue giving per-key at-most-one-in-flight and
//!   rate-limited requeue.
//! - [`mccontroller`]: the dispatch core — tenant registry, per-cluster
//!   reflectors, worker pool driving the downward reconcilers.
//! - [`uwcontroller`]: the worker pool driving back-population of
//!   super-observed state into tenants.
//! - [`patrol`]: the periodic consistency backstop.
//! - [`vnode`]: the virtual-node lifecycle map with the two-phase
//!   reserve-before-bind protocol.
//! - [`plugin`] + [`manager`]: the explicit plugin table and the composition
//!   root that builds, starts and drains the enabled resource syncers.
//!
//! Kind-specific policy (what equality means, how a super object is built)
//! stays out of this crate; it is provided by the resource syncer plugins.

pub mod config;
pub mod manager;
pub mod mccontroller;
pub mod patrol;
pub mod plugin;
pub mod queue;
pub mod reconciler;
pub mod reflector;
pub mod uwcontroller;
pub mod vnode;
pub mod watcher;

pub use config::SyncerConfig;
pub use manager::Syncer;
pub use mccontroller::MultiClusterController;
pub use patrol::Patroller;
pub use plugin::{InitContext, Registration, ResourceSyncer, SyncerRegistry};
pub use reconciler::{DownwardReconciler, EventType, PatrolReconciler, Request, UpwardReconciler};
pub use uwcontroller::{UpwardController, UwsRequest};
