//! The CRD syncer: public CustomResourceDefinitions fan out to every tenant.
//!
//! Same propagation shape as storage classes — the super side owns the
//! definition, tenants receive copies — but the payload is the CRD spec, so
//! a drifted tenant copy is realigned wholesale rather than field by field.

use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use k8s_openapi::Resource as _;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use syncer_core::constants::LABEL_CLUSTER;
use syncer_core::conversion::equality::check_crd;
use syncer_core::conversion::{build_virtual_crd, is_public};
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

/// The CRD resource syncer.
pub struct CrdSyncer {
    super_client: Arc<dyn ClusterClient>,
    mc: Arc<MultiClusterController<CustomResourceDefinition>>,
    uw: Arc<UpwardController<CustomResourceDefinition>>,
    patroller: Arc<Patroller>,
    super_crds: Store<CustomResourceDefinition>,
    super_writer: Mutex<Option<Writer<CustomResourceDefinition>>>,
}

impl CrdSyncer {
    /// Build the CRD syncer and its controllers.
    pub fn new(ctx: &InitContext) -> Arc<Self> {
        let writer = Writer::default();
        Arc::new(CrdSyncer {
            super_client: Arc::clone(&ctx.super_client),
            mc: MultiClusterController::new(ControllerOptions::downward(&ctx.config)),
            uw: UpwardController::new(ControllerOptions::upward(&ctx.config)),
            patroller: Patroller::new(CustomResourceDefinition::KIND, ctx.config.patrol_period),
            super_crds: writer.as_reader(),
            super_writer: Mutex::new(Some(writer)),
        })
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

    fn handle_super_event(&self, event: &Event<CustomResourceDefinition>) {
        match event {
            Event::Applied(crd) | Event::Deleted(crd) => self.fan_out(crd.name()),
            Event::Restarted(crds) => {
                for crd in crds {
                    self.fan_out(crd.name());
                }
            }
        }
    }
}

#[async_trait]
impl DownwardReconciler for CrdSyncer {
    async fn reconcile(&self, request: Request) -> Result<(), SyncError> {
        self.uw.enqueue(UwsRequest {
            cluster: Some(request.cluster),
            namespace: None,
            name: request.name,
        });
        Ok(())
    }
}

#[async_trait]
impl UpwardReconciler for CrdSyncer {
    async fn back_populate(&self, request: &UwsRequest) -> Result<(), SyncError> {
        let Some(cluster) = request.cluster.as_deref() else {
            warn!(%request, "crd key without a target cluster, dropping");
            return Ok(());
        };
        let source = self
            .super_crds
            .get(&ObjectKey::new(None, &request.name))
            .filter(|crd| is_public(&**crd));

        let tenant_copy = match self.mc.get(cluster, None, &request.name) {
            Ok(copy) => copy,
            Err(SyncError::ClusterNotRegistered(_)) => return Ok(()),
            Err(err) => return Err(err),
        };
        let tenant_client = match self.mc.tenant_client(cluster) {
            Ok(client) => client,
            Err(_) => return Ok(()),
        };
        let api = tenant_client.crds();

        match (source, tenant_copy) {
            (None, None) => Ok(()),
            (Some(source), None) => {
                debug!(cluster, name = %request.name, "propagating crd to tenant");
                let copy = build_virtual_crd(cluster, &source);
                match api.create(&copy).await {
                    Ok(_) => Ok(()),
                    Err(err) if err.is_already_exists() => Ok(()),
                    Err(err) => Err(err.into()),
                }
            }
            (None, Some(copy)) => {
                if copy.annotation(LABEL_CLUSTER) != Some(cluster) {
                    return Ok(());
                }
                debug!(cluster, name = %request.name, "removing unpublished crd from tenant");
                match api.delete(None, &request.name, &DeleteOptions::default()).await {
                    Ok(()) => Ok(()),
                    Err(err) if err.is_not_found() => Ok(()),
                    Err(err) => Err(err.into()),
                }
            }
            (Some(source), Some(copy)) => {
                if let Some(updated) = check_crd(&source, &copy) {
                    api.update(&updated).await?;
                }
                Ok(())
            }
        }
    }
}

#[async_trait]
impl PatrolReconciler for CrdSyncer {
    async fn patrol_once(&self) {
        if !self.super_crds.is_ready() {
            return;
        }
        let public: Vec<String> = self
            .super_crds
            .state()
            .into_iter()
            .filter(|crd| is_public(&**crd))
            .map(|crd| crd.name().to_string())
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
impl ResourceSyncer for CrdSyncer {
    fn name(&self) -> &'static str {
        "crd"
    }

    async fn register_tenant(
        &self,
        cluster: &str,
        client: Arc<dyn ClusterClient>,
    ) -> Result<(), SyncError> {
        self.mc.register(cluster, client).await?;
        if self.super_crds.is_ready() {
            for crd in self.super_crds.state() {
                if is_public(&*crd) {
                    self.uw.enqueue(UwsRequest {
                        cluster: Some(cluster.to_string()),
                        namespace: None,
                        name: crd.name().to_string(),
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
                move |event: &Event<CustomResourceDefinition>| this.handle_super_event(event),
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
