//! The resource syncer plugin seam.
//!
//! All kind-specific behavior lives behind [`ResourceSyncer`]; the generic
//! engine never inspects object kinds at runtime. Plugins are assembled into
//! a [`SyncerRegistry`] by the composition root and passed by reference into
//! the [`Syncer`](crate::manager::Syncer) — there is no process-global
//! registry. Whether a registered plugin runs is a deployment-time choice:
//! its registry default, overridden by the configuration's enable/disable
//! lists.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use syncer_core::{ClusterClient, SyncError};

use crate::config::SyncerConfig;

/// Everything a plugin constructor needs.
#[derive(Clone)]
pub struct InitContext {
    /// Shared configuration.
    pub config: SyncerConfig,
    /// Handle to the super control plane.
    pub super_client: Arc<dyn ClusterClient>,
}

/// One resource kind's syncer: downward, upward and patrol behavior bundled
/// behind a uniform lifecycle.
#[async_trait]
pub trait ResourceSyncer: Send + Sync {
    /// Kind name, matching the registration id.
    fn name(&self) -> &'static str;

    /// Make a tenant known to this kind's controllers; returns once the
    /// tenant caches report synced.
    async fn register_tenant(
        &self,
        cluster: &str,
        client: Arc<dyn ClusterClient>,
    ) -> Result<(), SyncError>;

    /// Remove a tenant, draining its in-flight work first.
    async fn unregister_tenant(&self, cluster: &str) -> Result<(), SyncError>;

    /// Start the kind's tasks (worker pools, super-side reflector,
    /// patroller). Each returned handle resolves after `shutdown` fires and
    /// that task has wound down.
    fn start(self: Arc<Self>, shutdown: CancellationToken) -> Vec<JoinHandle<()>>;
}

/// Boxed plugin constructor.
pub type InitFn =
    Box<dyn Fn(&InitContext) -> Result<Arc<dyn ResourceSyncer>, SyncError> + Send + Sync>;

/// A plugin registration: id, default enablement and constructor.
pub struct Registration {
    /// Kind name, referenced by the configuration's enable/disable lists.
    pub id: &'static str,
    /// Whether the plugin runs when the configuration says nothing.
    pub enabled_by_default: bool,
    /// Constructor invoked for enabled plugins.
    pub init: InitFn,
}

impl Registration {
    /// A registration from a plain constructor function.
    pub fn new<F>(id: &'static str, enabled_by_default: bool, init: F) -> Self
    where
        F: Fn(&InitContext) -> Result<Arc<dyn ResourceSyncer>, SyncError> + Send + Sync + 'static,
    {
        Registration {
            id,
            enabled_by_default,
            init: Box::new(init),
        }
    }
}

/// The explicit startup-time plugin table.
#[derive(Default)]
pub struct SyncerRegistry {
    entries: Vec<Registration>,
}

impl SyncerRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        SyncerRegistry::default()
    }

    /// Add a plugin registration.
    pub fn register(&mut self, registration: Registration) -> &mut Self {
        self.entries.push(registration);
        self
    }

    /// Registered plugin ids, in registration order.
    pub fn ids(&self) -> Vec<&'static str> {
        self.entries.iter().map(|e| e.id).collect()
    }

    /// Construct every enabled plugin.
    pub fn build(&self, ctx: &InitContext) -> Result<Vec<Arc<dyn ResourceSyncer>>, SyncError> {
        let mut syncers = Vec::new();
        for entry in &self.entries {
            if !ctx.config.plugin_enabled(entry.id, entry.enabled_by_default) {
                info!(plugin = entry.id, "resource syncer disabled");
                continue;
            }
            info!(plugin = entry.id, "resource syncer enabled");
            syncers.push((entry.init)(ctx)?);
        }
        Ok(syncers)
    }
}
