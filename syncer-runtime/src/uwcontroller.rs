//! The upward worker pool: super-observed state back into tenants.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use syncer_core::SyncedObject;

use crate::mccontroller::ControllerOptions;
use crate::queue::WorkQueue;
use crate::reconciler::UpwardReconciler;

/// Identifies one super-side object to back-populate.
///
/// For kinds routed by ownership mapping (pods, ingresses) the cluster is
/// `None` and `namespace` names the super namespace; for super-sourced kinds
/// fanned out to every tenant (storage classes, CRDs) the target cluster is
/// explicit and the object is cluster-scoped.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct UwsRequest {
    /// Target tenant cluster, when the fan-out is explicit.
    pub cluster: Option<String>,
    /// Super-side namespace, `None` for cluster-scoped kinds.
    pub namespace: Option<String>,
    /// Object name.
    pub name: String,
}

impl std::fmt::Display for UwsRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(cluster) = &self.cluster {
            write!(f, "{cluster}/")?;
        }
        if let Some(ns) = &self.namespace {
            write!(f, "{ns}/")?;
        }
        f.write_str(&self.name)
    }
}

/// Queue plus worker pool driving [`UpwardReconciler::back_populate`] for one
/// resource kind.
pub struct UpwardController<K: SyncedObject> {
    queue: Arc<WorkQueue<UwsRequest>>,
    options: ControllerOptions,
    _kind: std::marker::PhantomData<fn() -> K>,
}

impl<K: SyncedObject> UpwardController<K> {
    /// A controller with the given options.
    pub fn new(options: ControllerOptions) -> Arc<Self> {
        Arc::new(UpwardController {
            queue: WorkQueue::new(options.base_delay, options.max_delay),
            options,
            _kind: std::marker::PhantomData,
        })
    }

    /// Enqueue a super-object key, from the reactive stream or from patrol.
    pub fn enqueue(&self, request: UwsRequest) {
        self.queue.add(request);
    }

    /// Start the worker pool; resolves when `shutdown` fires and the pool
    /// has wound down.
    pub fn spawn(
        self: &Arc<Self>,
        reconciler: Arc<dyn UpwardReconciler>,
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
        })
    }

    async fn process(&self, request: &UwsRequest, reconciler: &dyn UpwardReconciler) {
        match reconciler.back_populate(request).await {
            Ok(()) => self.queue.forget(request),
            Err(err) if err.is_terminal() => {
                error!(kind = K::KIND, %request, %err, "terminal back-populate failure, not retrying");
                self.queue.forget(request);
            }
            Err(err) => {
                if self.queue.retries(request) < self.options.max_retries {
                    if err.is_conflict() {
                        debug!(kind = K::KIND, %request, %err, "requeueing after conflict");
                    } else {
                        warn!(kind = K::KIND, %request, %err, "back-populate failed, requeueing");
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
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use k8s_openapi::api::core::v1::Pod;
    use std::sync::atomic::{AtomicU32, Ordering};
    use syncer_core::{ApiError, SyncError};
    use syncer_test::eventually;

    use crate::config::SyncerConfig;

    fn request(name: &str) -> UwsRequest {
        UwsRequest {
            cluster: None,
            namespace: Some("c1-ns".into()),
            name: name.into(),
        }
    }

    struct Recording {
        calls: AtomicU32,
        fail_first: AtomicU32,
    }

    #[async_trait]
    impl UpwardReconciler for Recording {
        async fn back_populate(&self, _request: &UwsRequest) -> Result<(), SyncError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_first.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n > 0).then(|| n - 1)
            }).is_ok()
            {
                return Err(SyncError::Api(ApiError::Transport("flaky".into())));
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn transient_failures_are_retried_until_success() {
        let uw = UpwardController::<Pod>::new(ControllerOptions::upward(&SyncerConfig::default()));
        let reconciler = Arc::new(Recording {
            calls: AtomicU32::new(0),
            fail_first: AtomicU32::new(2),
        });
        let shutdown = CancellationToken::new();
        let pool = uw.spawn(reconciler.clone(), shutdown.clone());

        uw.enqueue(request("p1"));
        assert!(
            eventually(|| reconciler.calls.load(Ordering::SeqCst) >= 3).await,
            "two transient failures then success"
        );

        shutdown.cancel();
        pool.await.unwrap();
    }

    #[tokio::test]
    async fn terminal_failures_are_not_retried() {
        struct Terminal {
            calls: AtomicU32,
        }
        #[async_trait]
        impl UpwardReconciler for Terminal {
            async fn back_populate(&self, _request: &UwsRequest) -> Result<(), SyncError> {
                self.calls.fetch_add(1, Ordering::SeqCst);
                Err(SyncError::Integrity("uid mismatch".into()))
            }
        }
        let uw = UpwardController::<Pod>::new(ControllerOptions::upward(&SyncerConfig::default()));
        let reconciler = Arc::new(Terminal {
            calls: AtomicU32::new(0),
        });
        let shutdown = CancellationToken::new();
        let pool = uw.spawn(reconciler.clone(), shutdown.clone());

        uw.enqueue(request("p1"));
        assert!(eventually(|| reconciler.calls.load(Ordering::SeqCst) == 1).await);
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        assert_eq!(reconciler.calls.load(Ordering::SeqCst), 1);

        shutdown.cancel();
        pool.await.unwrap();
    }
}
