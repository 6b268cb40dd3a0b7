//! The composition root tying plugins, tenants and lifecycle together.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use syncer_core::{ClusterClient, SyncError};

use crate::plugin::{InitContext, ResourceSyncer, SyncerRegistry};

/// The running syncer: every enabled resource syncer plus their tasks.
pub struct Syncer {
    syncers: Vec<Arc<dyn ResourceSyncer>>,
    handles: Vec<JoinHandle<()>>,
    shutdown: CancellationToken,
}

impl Syncer {
    /// Build the enabled plugins from the registry. Nothing runs until
    /// [`Syncer::start`].
    pub fn new(registry: &SyncerRegistry, ctx: &InitContext) -> Result<Self, SyncError> {
        Ok(Syncer {
            syncers: registry.build(ctx)?,
            handles: Vec::new(),
            shutdown: CancellationToken::new(),
        })
    }

    /// Start every plugin's tasks.
    pub fn start(&mut self) {
        for syncer in &self.syncers {
            let handles = Arc::clone(syncer).start(self.shutdown.child_token());
            self.handles.extend(handles);
        }
        info!(plugins = self.syncers.len(), "syncer started");
    }

    /// Make a tenant control plane known to every running resource syncer.
    /// Returns once all per-kind caches report synced.
    pub async fn register_tenant(
        &self,
        cluster: &str,
        client: Arc<dyn ClusterClient>,
    ) -> Result<(), SyncError> {
        for syncer in &self.syncers {
            syncer.register_tenant(cluster, Arc::clone(&client)).await?;
        }
        info!(cluster, "tenant registered with all resource syncers");
        Ok(())
    }

    /// Remove a tenant from every resource syncer, draining in-flight work.
    pub async fn unregister_tenant(&self, cluster: &str) -> Result<(), SyncError> {
        let mut first_err = None;
        for syncer in &self.syncers {
            if let Err(err) = syncer.unregister_tenant(cluster).await {
                warn!(cluster, plugin = syncer.name(), %err, "unregistration failed");
                first_err.get_or_insert(err);
            }
        }
        match first_err {
            None => {
                info!(cluster, "tenant unregistered from all resource syncers");
                Ok(())
            }
            Some(err) => Err(err),
        }
    }

    /// Stop dequeues everywhere, let in-flight work finish, and wait for
    /// every task to wind down.
    pub async fn shutdown(&mut self) {
        self.shutdown.cancel();
        for handle in self.handles.drain(..) {
            let _ = handle.await;
        }
        info!("syncer stopped");
    }
}
