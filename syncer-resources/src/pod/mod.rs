//! The pod syncer: downward creation, upward back-population with placement
//! binding, and virtual-node lifecycle.
//!
//! This is the most involved plugin. Beyond the generic downward/upward
//! shape it owns:
//!
//! - a per-tenant Node cache (a co-dependent cache: tenant registration only
//!   completes once both the pod and the node cache report synced), used to
//!   decide whether a virtual node must be created before a bind;
//! - the [`VNodeMap`] with the reserve-before-bind protocol, keeping the
//!   bind path and the GC sweep from racing;
//! - deletion-grace propagation from the super side, which is the source of
//!   truth for deletion *completion* since only it talks to the real
//!   runtime.

mod dws;
mod patrol;
mod uws;

use std::sync::Arc;

use ahash::AHashMap;
use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Node, Pod};
use k8s_openapi::Resource as _;

use syncer_core::conversion::tenant_owner;
use syncer_core::meta::ObjectExt;
use syncer_core::{ClusterClient, SyncError};

use syncer_runtime::mccontroller::ControllerOptions;
use syncer_runtime::plugin::{InitContext, ResourceSyncer};
use syncer_runtime::reconciler::{DownwardReconciler, PatrolReconciler, UpwardReconciler};
use syncer_runtime::reflector::{Store, Writer};
use syncer_runtime::uwcontroller::UwsRequest;
use syncer_runtime::vnode::VNodeMap;
use syncer_runtime::watcher::{run_reflector, Event};
use syncer_runtime::{MultiClusterController, Patroller, UpwardController};

struct TenantNodeCache {
    store: Store<Node>,
    stop: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

/// The pod resource syncer.
pub struct PodSyncer {
    super_client: Arc<dyn ClusterClient>,
    mc: Arc<MultiClusterController<Pod>>,
    uw: Arc<UpwardController<Pod>>,
    patroller: Arc<Patroller>,
    super_pods: Store<Pod>,
    super_writer: Mutex<Option<Writer<Pod>>>,
    tenant_nodes: RwLock<AHashMap<String, Arc<TenantNodeCache>>>,
    vnodes: VNodeMap,
}

impl PodSyncer {
    /// Build the pod syncer and its controllers; nothing runs until
    /// [`ResourceSyncer::start`].
    pub fn new(ctx: &InitContext) -> Arc<Self> {
        let writer = Writer::default();
        Arc::new(PodSyncer {
            super_client: Arc::clone(&ctx.super_client),
            mc: MultiClusterController::new(ControllerOptions::downward(&ctx.config)),
            uw: UpwardController::new(ControllerOptions::upward(&ctx.config)),
            patroller: Patroller::new(Pod::KIND, ctx.config.patrol_period),
            super_pods: writer.as_reader(),
            super_writer: Mutex::new(Some(writer)),
            tenant_nodes: RwLock::new(AHashMap::new()),
            vnodes: VNodeMap::new(),
        })
    }

    /// Direct access to the downward controller, for tests and patrol.
    pub fn mc(&self) -> &Arc<MultiClusterController<Pod>> {
        &self.mc
    }

    /// Direct access to the upward controller.
    pub fn uw(&self) -> &Arc<UpwardController<Pod>> {
        &self.uw
    }

    /// The virtual-node lifecycle map.
    pub fn vnodes(&self) -> &VNodeMap {
        &self.vnodes
    }

    /// The super-side pod cache.
    pub fn super_pods(&self) -> &Store<Pod> {
        &self.super_pods
    }

    fn tenant_node_store(&self, cluster: &str) -> Option<Store<Node>> {
        self.tenant_nodes
            .read()
            .get(cluster)
            .map(|c| c.store.clone())
    }

    fn enqueue_upward(&self, pod: &Pod) {
        if tenant_owner(pod).is_some() {
            self.uw.enqueue(UwsRequest {
                cluster: None,
                namespace: pod.namespace().map(str::to_string),
                name: pod.name().to_string(),
            });
        }
    }

    fn handle_super_event(&self, event: &Event<Pod>) {
        match event {
            Event::Applied(pod) => self.enqueue_upward(pod),
            Event::Deleted(pod) => {
                self.enqueue_upward(pod);
                // a super pod that vanishes releases its virtual-node
                // reference; patrol prunes whatever this misses
                if let Some(owner) = tenant_owner(pod) {
                    if let (Some(node), Some(uid)) = (
                        pod.spec.as_ref().and_then(|s| s.node_name.as_deref()),
                        owner.uid.as_deref(),
                    ) {
                        self.vnodes.record_release(&owner.cluster, node, uid);
                    }
                }
            }
            Event::Restarted(pods) => {
                for pod in pods {
                    self.enqueue_upward(pod);
                }
            }
        }
    }
}

#[async_trait]
impl ResourceSyncer for PodSyncer {
    fn name(&self) -> &'static str {
        "pod"
    }

    async fn register_tenant(
        &self,
        cluster: &str,
        client: Arc<dyn ClusterClient>,
    ) -> Result<(), SyncError> {
        self.mc.register(cluster, Arc::clone(&client)).await?;

        // co-dependent node cache: the upward path consults it on binds, so
        // registration only completes once it has synced too
        let writer = Writer::<Node>::default();
        let cache = Arc::new(TenantNodeCache {
            store: writer.as_reader(),
            stop: CancellationToken::new(),
            task: Mutex::new(None),
        });
        let task = tokio::spawn(run_reflector(
            client,
            writer,
            |_: &Event<Node>| {},
            cache.stop.clone(),
        ));
        *cache.task.lock() = Some(task);
        self.tenant_nodes
            .write()
            .insert(cluster.to_string(), Arc::clone(&cache));

        if !cache.store.wait_until_ready().await {
            cache.stop.cancel();
            self.tenant_nodes.write().remove(cluster);
            let _ = self.mc.unregister(cluster).await;
            return Err(SyncError::Api(syncer_core::ApiError::Transport(format!(
                "tenant {cluster} node cache stopped before it synced"
            ))));
        }
        Ok(())
    }

    async fn unregister_tenant(&self, cluster: &str) -> Result<(), SyncError> {
        self.mc.unregister(cluster).await?;
        let cache = self.tenant_nodes.write().remove(cluster);
        if let Some(cache) = cache {
            cache.stop.cancel();
            let task = cache.task.lock().take();
            if let Some(task) = task {
                let _ = task.await;
            }
        }
        self.vnodes.forget_cluster(cluster);
        Ok(())
    }

    fn start(self: Arc<Self>, shutdown: CancellationToken) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();
        let writer = self.super_writer.lock().take();
        if let Some(writer) = writer {
            let this = Arc::clone(&self);
            handles.push(tokio::spawn(run_reflector(
                Arc::clone(&self.super_client),
                writer,
                move |event: &Event<Pod>| this.handle_super_event(event),
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
