//! The dispatch core: tenant registry plus the downward worker pool.
//!
//! One `MultiClusterController<K>` governs one resource kind across every
//! registered tenant. Registration opens a reflector against the tenant,
//! seeds the cache and only returns once the cache reports synced; from then
//! on every tenant-side change enqueues a [`Request`] that a worker resolves
//! by re-reading the cache and invoking the kind's [`DownwardReconciler`].
//!
//! Unregistration is deterministic: the tenant's reflector is cancelled, the
//! registration is marked draining so workers skip its keys, and the call
//! only returns once every in-flight reconcile for that cluster has
//! finished — no write ever races a revoked tenant handle.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ahash::AHashMap;
use parking_lot::{Mutex, RwLock};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use syncer_core::meta::ObjectExt;
use syncer_core::{ClusterClient, SyncError, SyncedObject};

use crate::config::SyncerConfig;
use crate::queue::WorkQueue;
use crate::reconciler::{DownwardReconciler, EventType, Request};
use crate::reflector::{ObjectKey, Store, Writer};
use crate::watcher::{run_reflector, Event};

/// Tuning knobs of one controller, derived from [`SyncerConfig`].
#[derive(Clone, Debug)]
pub struct ControllerOptions {
    /// Worker count for the dispatch pool.
    pub workers: usize,
    /// Requeue attempts before a key is surrendered to patrol.
    pub max_retries: u32,
    /// Base delay of the requeue backoff.
    pub base_delay: Duration,
    /// Cap of the requeue backoff.
    pub max_delay: Duration,
}

impl ControllerOptions {
    /// Options for a downward controller.
    pub fn downward(config: &SyncerConfig) -> Self {
        ControllerOptions {
            workers: config.dws_workers,
            max_retries: config.max_retries,
            base_delay: config.requeue_base_delay,
            max_delay: config.requeue_max_delay,
        }
    }

    /// Options for an upward controller.
    pub fn upward(config: &SyncerConfig) -> Self {
        ControllerOptions {
            workers: config.uws_workers,
            ..ControllerOptions::downward(config)
        }
    }
}

struct TenantCluster<K> {
    name: String,
    client: Arc<dyn ClusterClient>,
    store: Store<K>,
    stop: CancellationToken,
    reflector: Mutex<Option<JoinHandle<()>>>,
    draining: AtomicBool,
    inflight: AtomicUsize,
    drained: Notify,
}

impl<K> TenantCluster<K> {
    fn flight_guard(self: &Arc<Self>) -> FlightGuard<K> {
        self.inflight.fetch_add(1, Ordering::SeqCst);
        FlightGuard {
            tenant: Arc::clone(self),
        }
    }

    async fn wait_drained(&self) {
        loop {
            let notified = self.drained.notified();
            if self.inflight.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }
}

struct FlightGuard<K> {
    tenant: Arc<TenantCluster<K>>,
}

impl<K> Drop for FlightGuard<K> {
    fn drop(&mut self) {
        self.tenant.inflight.fetch_sub(1, Ordering::SeqCst);
        self.tenant.drained.notify_waiters();
    }
}

/// Dispatch core for one resource kind across all tenants.
pub struct MultiClusterController<K: SyncedObject> {
    queue: Arc<WorkQueue<Request>>,
    clusters: RwLock<AHashMap<String, Arc<TenantCluster<K>>>>,
    options: ControllerOptions,
}

impl<K: SyncedObject> MultiClusterController<K> {
    /// A controller with the given options; no tenants yet.
    pub fn new(options: ControllerOptions) -> Arc<Self> {
        Arc::new(MultiClusterController {
            queue: WorkQueue::new(options.base_delay, options.max_delay),
            clusters: RwLock::new(AHashMap::new()),
            options,
        })
    }

    /// Register a tenant and open its change notification stream.
    ///
    /// Returns once the tenant cache has synced; until then no request for
    /// the cluster is enqueued, so workers cannot reconcile against an
    /// incomplete view.
    pub async fn register(
        &self,
        name: &str,
        client: Arc<dyn ClusterClient>,
    ) -> Result<(), SyncError> {
        let writer = Writer::default();
        let tenant = Arc::new(TenantCluster {
            name: name.to_string(),
            client: Arc::clone(&client),
            store: writer.as_reader(),
            stop: CancellationToken::new(),
            reflector: Mutex::new(None),
            draining: AtomicBool::new(false),
            inflight: AtomicUsize::new(0),
            drained: Notify::new(),
        });
        {
            let mut clusters = self.clusters.write();
            if clusters.contains_key(name) {
                return Err(SyncError::ClusterAlreadyRegistered(name.to_string()));
            }
            clusters.insert(name.to_string(), Arc::clone(&tenant));
        }

        let queue = Arc::clone(&self.queue);
        let cluster = name.to_string();
        let sink = move |event: &Event<K>| enqueue_event(&queue, &cluster, event);
        let handle = tokio::spawn(run_reflector(
            client,
            writer,
            sink,
            tenant.stop.clone(),
        ));
        *tenant.reflector.lock() = Some(handle);

        if !tenant.store.wait_until_ready().await {
            tenant.stop.cancel();
            self.clusters.write().remove(name);
            return Err(SyncError::Api(syncer_core::ApiError::Transport(format!(
                "tenant {name} cache stopped before it synced"
            ))));
        }
        info!(kind = K::KIND, cluster = name, "tenant registered");
        Ok(())
    }

    /// Unregister a tenant, draining its in-flight reconciles before the
    /// client handle is released.
    pub async fn unregister(&self, name: &str) -> Result<(), SyncError> {
        let tenant = self
            .clusters
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| SyncError::ClusterNotRegistered(name.to_string()))?;

        tenant.draining.store(true, Ordering::SeqCst);
        tenant.stop.cancel();
        let handle = tenant.reflector.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        tenant.wait_drained().await;
        self.clusters.write().remove(name);
        info!(kind = K::KIND, cluster = name, "tenant unregistered");
        Ok(())
    }

    fn serving_cluster(&self, name: &str) -> Option<Arc<TenantCluster<K>>> {
        let tenant = self.clusters.read().get(name).cloned()?;
        (!tenant.draining.load(Ordering::SeqCst)).then_some(tenant)
    }

    /// The cached tenant-side object, as last observed.
    pub fn get(
        &self,
        cluster: &str,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<Option<Arc<K>>, SyncError> {
        let tenant = self
            .serving_cluster(cluster)
            .ok_or_else(|| SyncError::ClusterNotRegistered(cluster.to_string()))?;
        Ok(tenant.store.get(&ObjectKey::new(namespace, name)))
    }

    /// Snapshot of every cached tenant-side object of one cluster.
    pub fn list_cluster(&self, cluster: &str) -> Result<Vec<Arc<K>>, SyncError> {
        let tenant = self
            .serving_cluster(cluster)
            .ok_or_else(|| SyncError::ClusterNotRegistered(cluster.to_string()))?;
        Ok(tenant.store.state())
    }

    /// Whether the cluster's cache has synced.
    pub fn cluster_synced(&self, cluster: &str) -> bool {
        self.serving_cluster(cluster)
            .map(|t| t.store.is_ready())
            .unwrap_or(false)
    }

    /// The registered clusters currently serving.
    pub fn cluster_names(&self) -> Vec<String> {
        self.clusters
            .read()
            .values()
            .filter(|t| !t.draining.load(Ordering::SeqCst))
            .map(|t| t.name.clone())
            .collect()
    }

    /// The client handle of a registered tenant.
    pub fn tenant_client(&self, cluster: &str) -> Result<Arc<dyn ClusterClient>, SyncError> {
        let tenant = self
            .serving_cluster(cluster)
            .ok_or_else(|| SyncError::ClusterNotRegistered(cluster.to_string()))?;
        Ok(Arc::clone(&tenant.client))
    }

    /// Inject a request, used by the reactive sinks and by patrol.
    pub fn enqueue(&self, request: Request) {
        self.queue.add(request);
    }

    /// Start the worker pool; resolves when `shutdown` fires and the pool
    /// has wound down.
    pub fn spawn(
        self: &Arc<Self>,
        reconciler: Arc<dyn DownwardReconciler>,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let ctrl = Arc::clone(self);
        tokio::spawn(async move {
            let workers: Vec<_> = (0..ctrl.options.workers.max(1))
                .map(|_| {
                    let ctrl = Arc::clone(&ctrl);
                    let reconciler = Arc::clone(&reconciler);
                    tokio::spawn(async move {
                        while let Some(request) = ctrl.queue.next().await {
                            ctrl.process(&request, reconciler.as_ref()).await;
                            ctrl.queue.done(&request);
                        }
                    })
                })
                .collect();
            shutdown.cancelled().await;
            ctrl.queue.shut_down();
            for worker in workers {
                let _ = worker.await;
            }
            ctrl.stop_reflectors().await;
        })
    }

    async fn process(&self, request: &Request, reconciler: &dyn DownwardReconciler) {
        let Some(tenant) = self.serving_cluster(&request.cluster) else {
            debug!(kind = K::KIND, %request, "dropping request for unregistered cluster");
            self.queue.forget(request);
            return;
        };
        let guard = tenant.flight_guard();
        if tenant.draining.load(Ordering::SeqCst) {
            drop(guard);
            self.queue.forget(request);
            return;
        }

        let result = reconciler.reconcile(request.clone()).await;
        drop(guard);
        match result {
            Ok(()) => self.queue.forget(request),
            Err(err) if err.is_terminal() => {
                error!(kind = K::KIND, %request, %err, "terminal reconcile failure, not retrying");
                self.queue.forget(request);
            }
            Err(err) => {
                if self.queue.retries(request) < self.options.max_retries {
                    if err.is_conflict() {
                        debug!(kind = K::KIND, %request, %err, "requeueing after conflict");
                    } else {
                        warn!(kind = K::KIND, %request, %err, "reconcile failed, requeueing");
                    }
                    self.queue.add_rate_limited(request.clone());
                } else {
                    error!(
                        kind = K::KIND, %request, %err,
                        "retries exhausted, leaving key to the patroller"
                    );
                    self.queue.forget(request);
                }
            }
        }
    }

    async fn stop_reflectors(&self) {
        let tenants: Vec<_> = self.clusters.read().values().cloned().collect();
        for tenant in tenants {
            tenant.stop.cancel();
            let handle = tenant.reflector.lock().take();
            if let Some(handle) = handle {
                let _ = handle.await;
            }
        }
    }
}

fn enqueue_event<K: SyncedObject>(queue: &WorkQueue<Request>, cluster: &str, event: &Event<K>) {
    let request = |obj: &K, event: EventType| Request {
        cluster: cluster.to_string(),
        namespace: obj.namespace().map(str::to_string),
        name: obj.name().to_string(),
        uid: (!obj.uid().is_empty()).then(|| obj.uid().to_string()),
        event,
    };
    match event {
        Event::Applied(obj) => queue.add(request(obj, EventType::Update)),
        Event::Deleted(obj) => queue.add(request(obj, EventType::Delete)),
        Event::Restarted(objs) => {
            for obj in objs {
                queue.add(request(obj, EventType::Add));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use k8s_openapi::api::core::v1::Pod;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use std::sync::atomic::AtomicU32;
    use syncer_test::{eventually, TestCluster};

    fn options() -> ControllerOptions {
        ControllerOptions::downward(&SyncerConfig::default())
    }

    fn pod(name: &str) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(name.into()),
                namespace: Some("ns".into()),
                ..ObjectMeta::default()
            },
            ..Pod::default()
        }
    }

    #[derive(Default)]
    struct CountingReconciler {
        calls: AtomicU32,
    }

    #[async_trait]
    impl DownwardReconciler for CountingReconciler {
        async fn reconcile(&self, _request: Request) -> Result<(), SyncError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn register_blocks_until_synced_and_serves_gets() {
        let tenant = TestCluster::new();
        tenant.put(&pod("p1"));
        let mc = MultiClusterController::<Pod>::new(options());
        mc.register("c1", tenant.client()).await.unwrap();
        assert!(mc.cluster_synced("c1"));
        let cached = mc.get("c1", Some("ns"), "p1").unwrap();
        assert!(cached.is_some());
        assert!(mc.get("c1", Some("ns"), "missing").unwrap().is_none());
        assert!(mc.get("other", Some("ns"), "p1").is_err());
    }

    #[tokio::test]
    async fn duplicate_registration_is_rejected() {
        let tenant = TestCluster::new();
        let mc = MultiClusterController::<Pod>::new(options());
        mc.register("c1", tenant.client()).await.unwrap();
        let err = mc.register("c1", tenant.client()).await.unwrap_err();
        assert!(matches!(err, SyncError::ClusterAlreadyRegistered(_)));
    }

    #[tokio::test]
    async fn events_drive_the_reconciler() {
        let tenant = TestCluster::new();
        let mc = MultiClusterController::<Pod>::new(options());
        let reconciler = Arc::new(CountingReconciler::default());
        let shutdown = CancellationToken::new();
        let pool = mc.spawn(reconciler.clone(), shutdown.clone());

        mc.register("c1", tenant.client()).await.unwrap();
        tenant.put(&pod("p1"));
        assert!(
            eventually(|| reconciler.calls.load(Ordering::SeqCst) >= 1).await,
            "tenant mutation should reach the reconciler"
        );

        shutdown.cancel();
        pool.await.unwrap();
    }

    #[tokio::test]
    async fn unregister_waits_for_drain_and_forgets_cluster() {
        let tenant = TestCluster::new();
        let mc = MultiClusterController::<Pod>::new(options());
        mc.register("c1", tenant.client()).await.unwrap();
        mc.unregister("c1").await.unwrap();
        assert!(mc.get("c1", Some("ns"), "p1").is_err());
        assert!(mc.cluster_names().is_empty());
        assert!(matches!(
            mc.unregister("c1").await.unwrap_err(),
            SyncError::ClusterNotRegistered(_)
        ));
    }
}
