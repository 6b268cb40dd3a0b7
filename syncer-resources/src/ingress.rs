//! The ingress syncer: spec flows downward, load-balancer status flows back.

use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::networking::v1::Ingress;
use k8s_openapi::Resource as _;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use syncer_core::conversion::equality::{check_dw_ingress, check_uw_ingress_status, check_uw_object_meta};
use syncer_core::conversion::{build_super_ingress, tenant_owner, to_super_namespace};
use syncer_core::meta::ObjectExt;
use syncer_core::{ClusterClient, DeleteOptions, SyncError};

use syncer_runtime::mccontroller::ControllerOptions;
use syncer_runtime::plugin::{InitContext, ResourceSyncer};
use syncer_runtime::reconciler::{
    DownwardReconciler, EventType, PatrolReconciler, Request, UpwardReconciler,
};
use syncer_runtime::reflector::{ObjectKey, Store, Writer};
use syncer_runtime::uwcontroller::UwsRequest;
use syncer_runtime::watcher::{run_reflector, Event};
use syncer_runtime::{MultiClusterController, Patroller, UpwardController};

/// The ingress resource syncer.
pub struct IngressSyncer {
    super_client: Arc<dyn ClusterClient>,
    mc: Arc<MultiClusterController<Ingress>>,
    uw: Arc<UpwardController<Ingress>>,
    patroller: Arc<Patroller>,
    super_ingresses: Store<Ingress>,
    super_writer: Mutex<Option<Writer<Ingress>>>,
}

impl IngressSyncer {
    /// Build the ingress syncer and its controllers.
    pub fn new(ctx: &InitContext) -> Arc<Self> {
        let writer = Writer::default();
        Arc::new(IngressSyncer {
            super_client: Arc::clone(&ctx.super_client),
            mc: MultiClusterController::new(ControllerOptions::downward(&ctx.config)),
            uw: UpwardController::new(ControllerOptions::upward(&ctx.config)),
            patroller: Patroller::new(Ingress::KIND, ctx.config.patrol_period),
            super_ingresses: writer.as_reader(),
            super_writer: Mutex::new(Some(writer)),
        })
    }

    /// The downward controller, exposed for tests.
    pub fn mc(&self) -> &Arc<MultiClusterController<Ingress>> {
        &self.mc
    }

    fn enqueue_upward(&self, ingress: &Ingress) {
        if tenant_owner(ingress).is_some() {
            self.uw.enqueue(UwsRequest {
                cluster: None,
                namespace: ingress.namespace().map(str::to_string),
                name: ingress.name().to_string(),
            });
        }
    }

    fn handle_super_event(&self, event: &Event<Ingress>) {
        match event {
            Event::Applied(ingress) | Event::Deleted(ingress) => self.enqueue_upward(ingress),
            Event::Restarted(ingresses) => {
                for ingress in ingresses {
                    self.enqueue_upward(ingress);
                }
            }
        }
    }
}

#[async_trait]
impl DownwardReconciler for IngressSyncer {
    async fn reconcile(&self, request: Request) -> Result<(), SyncError> {
        let tenant_ingress =
            self.mc
                .get(&request.cluster, request.namespace.as_deref(), &request.name)?;
        let super_ns = to_super_namespace(
            &request.cluster,
            request.namespace.as_deref().unwrap_or_default(),
        );
        let api = self.super_client.ingresses();
        let super_ingress = match api.get(Some(&super_ns), &request.name).await {
            Ok(ingress) => Some(ingress),
            Err(err) if err.is_not_found() => None,
            Err(err) => return Err(err.into()),
        };

        match (tenant_ingress, super_ingress) {
            (None, None) => Ok(()),
            (None, Some(super_ingress)) => {
                let owned = tenant_owner(&super_ingress)
                    .map(|o| o.cluster == request.cluster)
                    .unwrap_or(false);
                if !owned {
                    warn!(%request, "super ingress is not owned by this tenant, leaving it alone");
                    return Ok(());
                }
                debug!(%request, "deleting super ingress for removed tenant ingress");
                match api
                    .delete(Some(&super_ns), &request.name, &DeleteOptions::default())
                    .await
                {
                    Ok(()) => Ok(()),
                    Err(err) if err.is_not_found() => Ok(()),
                    Err(err) => Err(err.into()),
                }
            }
            (Some(tenant_ingress), None) => {
                if tenant_ingress.is_terminating() {
                    return Ok(());
                }
                let super_ingress = build_super_ingress(&request.cluster, &tenant_ingress);
                match api.create(&super_ingress).await {
                    Ok(_) => Ok(()),
                    Err(err) if err.is_already_exists() => Ok(()),
                    Err(err) => Err(err.into()),
                }
            }
            (Some(tenant_ingress), Some(super_ingress)) => {
                let Some(owner) = tenant_owner(&super_ingress) else {
                    warn!(%request, "super ingress carries no ownership mapping, leaving it alone");
                    return Ok(());
                };
                if owner.uid.as_deref() != Some(tenant_ingress.uid()) {
                    return Err(SyncError::Integrity(format!(
                        "super ingress {super_ns}/{} maps uid {:?} but tenant ingress has uid {}",
                        request.name,
                        owner.uid,
                        tenant_ingress.uid(),
                    )));
                }
                if tenant_ingress.is_terminating() && !super_ingress.is_terminating() {
                    match api
                        .delete(Some(&super_ns), &request.name, &DeleteOptions::default())
                        .await
                    {
                        Ok(()) => return Ok(()),
                        Err(err) if err.is_not_found() => return Ok(()),
                        Err(err) => return Err(err.into()),
                    }
                }
                if let Some(updated) = check_dw_ingress(&tenant_ingress, &super_ingress) {
                    api.update(&updated).await?;
                }
                Ok(())
            }
        }
    }
}

#[async_trait]
impl UpwardReconciler for IngressSyncer {
    async fn back_populate(&self, request: &UwsRequest) -> Result<(), SyncError> {
        let super_ns = request.namespace.as_deref().unwrap_or_default();
        let Some(super_ingress) = self
            .super_ingresses
            .get(&ObjectKey::new(Some(super_ns), &request.name))
        else {
            return Ok(());
        };
        let Some(owner) = tenant_owner(&*super_ingress) else {
            return Ok(());
        };
        let Some(tenant_ns) = owner.namespace.as_deref() else {
            return Ok(());
        };
        let tenant_ingress = match self.mc.get(&owner.cluster, Some(tenant_ns), &request.name) {
            Ok(Some(ingress)) => ingress,
            Ok(None) => return Ok(()),
            Err(SyncError::ClusterNotRegistered(_)) => return Ok(()),
            Err(err) => return Err(err),
        };
        if owner.uid.as_deref() != Some(tenant_ingress.uid()) {
            return Err(SyncError::Integrity(format!(
                "super ingress {super_ns}/{} maps uid {:?} but tenant ingress has uid {}",
                request.name,
                owner.uid,
                tenant_ingress.uid(),
            )));
        }
        let tenant_client = match self.mc.tenant_client(&owner.cluster) {
            Ok(client) => client,
            Err(_) => return Ok(()),
        };
        let api = tenant_client.ingresses();

        let mut live = (*tenant_ingress).clone();
        if let Some(meta) = check_uw_object_meta(&super_ingress.metadata, &live.metadata) {
            let mut updated = live.clone();
            updated.metadata = meta;
            live = api.update(&updated).await?;
        }
        if check_uw_ingress_status(&super_ingress, &live).is_some() {
            let mut fresh = match api.get(Some(tenant_ns), &request.name).await {
                Ok(ingress) => ingress,
                Err(err) if err.is_not_found() => return Ok(()),
                Err(err) => return Err(err.into()),
            };
            if let Some(status) = check_uw_ingress_status(&super_ingress, &fresh) {
                fresh.status = Some(status);
                api.update_status(&fresh).await?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl PatrolReconciler for IngressSyncer {
    async fn patrol_once(&self) {
        if !self.super_ingresses.is_ready() {
            return;
        }
        let mut super_index: ahash::AHashMap<(String, String, String), Arc<Ingress>> =
            ahash::AHashMap::new();
        for super_ingress in self.super_ingresses.state() {
            if let Some(owner) = tenant_owner(&*super_ingress) {
                if let Some(tenant_ns) = owner.namespace {
                    super_index.insert(
                        (owner.cluster, tenant_ns, super_ingress.name().to_string()),
                        super_ingress,
                    );
                }
            }
        }

        for cluster in self.mc.cluster_names() {
            if !self.mc.cluster_synced(&cluster) {
                continue;
            }
            let Ok(tenant_ingresses) = self.mc.list_cluster(&cluster) else {
                continue;
            };
            for tenant_ingress in tenant_ingresses {
                let tenant_ns = tenant_ingress.namespace().unwrap_or_default().to_string();
                let key = (
                    cluster.clone(),
                    tenant_ns.clone(),
                    tenant_ingress.name().to_string(),
                );
                let request = Request {
                    cluster: cluster.clone(),
                    namespace: Some(tenant_ns),
                    name: tenant_ingress.name().to_string(),
                    uid: Some(tenant_ingress.uid().to_string()),
                    event: EventType::Add,
                };
                match super_index.remove(&key) {
                    None => self.mc.enqueue(request),
                    Some(super_ingress) => {
                        if check_dw_ingress(&tenant_ingress, &super_ingress).is_some()
                            || (tenant_ingress.is_terminating() && !super_ingress.is_terminating())
                        {
                            self.mc.enqueue(request);
                        }
                        if check_uw_ingress_status(&super_ingress, &tenant_ingress).is_some()
                            || check_uw_object_meta(
                                &super_ingress.metadata,
                                &tenant_ingress.metadata,
                            )
                            .is_some()
                        {
                            self.uw.enqueue(UwsRequest {
                                cluster: None,
                                namespace: super_ingress.namespace().map(str::to_string),
                                name: super_ingress.name().to_string(),
                            });
                        }
                    }
                }
            }
        }

        for ((cluster, tenant_ns, name), super_ingress) in super_index {
            if self.mc.cluster_synced(&cluster) {
                self.mc.enqueue(Request {
                    uid: tenant_owner(&*super_ingress).and_then(|o| o.uid),
                    cluster,
                    namespace: Some(tenant_ns),
                    name,
                    event: EventType::Delete,
                });
            }
        }
    }
}

#[async_trait]
impl ResourceSyncer for IngressSyncer {
    fn name(&self) -> &'static str {
        "ingress"
    }

    async fn register_tenant(
        &self,
        cluster: &str,
        client: Arc<dyn ClusterClient>,
    ) -> Result<(), SyncError> {
        self.mc.register(cluster, client).await
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
                move |event: &Event<Ingress>| this.handle_super_event(event),
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
