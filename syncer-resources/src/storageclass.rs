//! The storage class syncer.
//!
//! Storage classes are super-sourced: classes labeled public on the super
//! control plane are propagated into every tenant, kept in line on drift,
//! and removed from tenants when deleted or unpublished upstream. The
//! downward path exists only to route tenant-side drift (someone editing or
//! deleting a propagated copy) through the same propagation logic.

use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::storage::v1::StorageClass;
use k8s_openapi::Resource as _;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use syncer_core::constants::LABEL_CLUSTER;
use syncer_core::conversion::equality::check_storage_class;
use syncer_core::conversion::{build_virtual_storage_class, is_public};
use syncer_core::meta::ObjectExt;
use syncer_core::{ClusterClient, DeleteOptions, SyncError};

use syncer_runtime::mccontroller::ControllerOptions;
use syncer_runtime::plugin::{InitContext, ResourceSyncer};
use syncer_runtime::reconciler::{
    DownwardReconciler, PatrolReconciler, Request, UpwardReconciler,
};
use syncer_runtime::reflector::{ObjectKey, Store, Writer};
use syncer_runtime::uwcontroller::UwsRequest;
use syncer_runtime::watcher::{run_reflector, Event};
use syncer_runtime::{MultiClusterController, Patroller, UpwardController};

/// The storage class resource syncer.
pub struct StorageClassSyncer {
    super_client: Arc<dyn ClusterClient>,
    mc: Arc<MultiClusterController<StorageClass>>,
    uw: Arc<UpwardController<StorageClass>>,
    patroller: Arc<Patroller>,
    super_classes: Store<StorageClass>,
    super_writer: Mutex<Option<Writer<StorageClass>>>,
}

impl StorageClassSyncer {
    /// Build the storage class syncer and its controllers.
    pub fn new(ctx: &InitContext) -> Arc<Self> {
        let writer = Writer::default();
        Arc::new(StorageClassSyncer {
            super_client: Arc::clone(&ctx.super_client),
            mc: MultiClusterController::new(ControllerOptions::downward(&ctx.config)),
            uw: UpwardController::new(ControllerOptions::upward(&ctx.config)),
            patroller: Patroller::new(StorageClass::KIND, ctx.config.patrol_period),
            super_classes: writer.as_reader(),
            super_writer: Mutex::new(Some(writer)),
        })
    }

    /// The upward controller, exposed for tests.
    pub fn uw(&self) -> &Arc<UpwardController<StorageClass>> {
        &self.uw
    }

    fn fan_out(&self, name: &str) {
        for cluster in self.mc.cluster_names() {
            self.uw.enqueue(UwsRequest {
                cluster: Some(cluster),
                namespace: None,
                name: name.to_string(),
            });
        }
    }

    fn handle_super_event(&self, event: &Event<StorageClass>) {
        match event {
            Event::Applied(sc) | Event::Deleted(sc) => self.fan_out(sc.name()),
            Event::Restarted(scs) => {
                for sc in scs {
                    self.fan_out(sc.name());
                }
            }
        }
    }
}

#[async_trait]
impl DownwardReconciler for StorageClassSyncer {
    async fn reconcile(&self, request: Request) -> Result<(), SyncError> {
        // tenant-side drift funnels into the propagation path so both
        // directions share one piece of logic
        self.uw.enqueue(UwsRequest {
            cluster: Some(request.cluster),
            namespace: None,
            name: request.name,
        });
        Ok(())
    }
}

#[async_trait]
impl UpwardReconciler for StorageClassSyncer {
    async fn back_populate(&self, request: &UwsRequest) -> Result<(), SyncError> {
        let Some(cluster) = request.cluster.as_deref() else {
            warn!(%request, "storage class key without a target cluster, dropping");
            return Ok(());
        };
        let source = self
            .super_classes
            .get(&ObjectKey::new(None, &request.name))
            .filter(|sc| is_public(&**sc));

        let tenant_copy = match self.mc.get(cluster, None, &request.name) {
            Ok(copy) => copy,
            Err(SyncError::ClusterNotRegistered(_)) => return Ok(()),
            Err(err) => return Err(err),
        };
        let tenant_client = match self.mc.tenant_client(cluster) {
            Ok(client) => client,
            Err(_) => return Ok(()),
        };
        let api = tenant_client.storage_classes();

        match (source, tenant_copy) {
            (None, None) => Ok(()),
            (Some(source), None) => {
                debug!(cluster, name = %request.name, "propagating storage class to tenant");
                let copy = build_virtual_storage_class(cluster, &source);
                match api.create(&copy).await {
                    Ok(_) => Ok(()),
                    Err(err) if err.is_already_exists() => Ok(()),
                    Err(err) => Err(err.into()),
                }
            }
            (None, Some(copy)) => {
                // only remove copies this syncer planted; a tenant-created
                // class of the same name is not ours to touch
                if copy.annotation(LABEL_CLUSTER) != Some(cluster) {
                    return Ok(());
                }
                debug!(cluster, name = %request.name, "removing unpublished storage class from tenant");
                match api.delete(None, &request.name, &DeleteOptions::default()).await {
                    Ok(()) => Ok(()),
                    Err(err) if err.is_not_found() => Ok(()),
                    Err(err) => Err(err.into()),
                }
            }
            (Some(source), Some(copy)) => {
                if let Some(updated) = check_storage_class(&source, &copy) {
                    api.update(&updated).await?;
                }
                Ok(())
            }
        }
    }
}

#[async_trait]
impl PatrolReconciler for StorageClassSyncer {
    async fn patrol_once(&self) {
        if !self.super_classes.is_ready() {
            return;
        }
        let public: Vec<String> = self
            .super_classes
            .state()
            .into_iter()
            .filter(|sc| is_public(&**sc))
            .map(|sc| sc.name().to_string())
            .collect();

        for cluster in self.mc.cluster_names() {
            if !self.mc.cluster_synced(&cluster) {
                continue;
            }
            for name in &public {
                self.uw.enqueue(UwsRequest {
                    cluster: Some(cluster.clone()),
                    namespace: None,
                    name: name.clone(),
                });
            }
            // propagated copies whose source vanished or went private
            let Ok(copies) = self.mc.list_cluster(&cluster) else {
                continue;
            };
            for copy in copies {
                if copy.annotation(LABEL_CLUSTER) == Some(cluster.as_str())
                    && !public.iter().any(|n| n.as_str() == copy.name())
                {
                    self.uw.enqueue(UwsRequest {
                        cluster: Some(cluster.clone()),
                        namespace: None,
                        name: copy.name().to_string(),
                    });
                }
            }
        }
    }
}

#[async_trait]
impl ResourceSyncer for StorageClassSyncer {
    fn name(&self) -> &'static str {
        "storageclass"
    }

    async fn register_tenant(
        &self,
        cluster: &str,
        client: Arc<dyn ClusterClient>,
    ) -> Result<(), SyncError> {
        self.mc.register(cluster, client).await?;
        // a late-joining tenant receives the current public set immediately
        if self.super_classes.is_ready() {
            for sc in self.super_classes.state() {
                if is_public(&*sc) {
                    self.uw.enqueue(UwsRequest {
                        cluster: Some(cluster.to_string()),
                        namespace: None,
                        name: sc.name().to_string(),
                    });
                }
            }
        }
        Ok(())
    }

    async fn unregister_tenant(&self, cluster: &str) -> Result<(), SyncError> {
        self.mc.unregister(cluster).await
    }

    fn start(self: Arc<Self>, shutdown: CancellationToken) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();
        let writer = self.super_writer.lock().take();
        if let Some(writer) = writer {
            let this = Arc::clone(&self);
            handles.push(tokio::spawn(run_reflector(
                Arc::clone(&self.super_client),
                writer,
                move |event: &Event<StorageClass>| this.handle_super_event(event),
                shutdown.clone(),
            )));
        }
        let dw: Arc<dyn DownwardReconciler> = self.clone();
        handles.push(self.mc.spawn(dw, shutdown.clone()));
        let uw: Arc<dyn UpwardReconciler> = self.clone();
        handles.push(self.uw.spawn(uw, shutdown.clone()));
        let pa: Arc<dyn PatrolReconciler> = self.clone();
        handles.push(self.patroller.spawn(pa, shutdown));
        handles
    }
}
