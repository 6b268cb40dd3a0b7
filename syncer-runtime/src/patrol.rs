//! The periodic consistency backstop.
//!
//! A patroller is a timer, nothing more: on every tick it hands control to
//! the kind's [`PatrolReconciler`], which lists both sides and injects
//! synthetic work items into the same queues the reactive paths use. Patrol
//! never reconciles inline — sharing the queues means the per-key
//! at-most-one-in-flight guarantee also serializes patrol-triggered work
//! against reactive work.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::reconciler::PatrolReconciler;

/// Timer driving one kind's patrol pass.
pub struct Patroller {
    kind: &'static str,
    period: Duration,
}

impl Patroller {
    /// A patroller for `kind` with the given interval. The interval is
    /// coarse by design; patrol bounds drift, it does not provide
    /// timeliness.
    pub fn new(kind: &'static str, period: Duration) -> Arc<Self> {
        Arc::new(Patroller { kind, period })
    }

    /// Start ticking until `shutdown` fires. The first pass runs one full
    /// period after start, so it never races initial cache syncs.
    pub fn spawn(
        self: &Arc<Self>,
        reconciler: Arc<dyn PatrolReconciler>,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let patroller = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(patroller.period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            interval.tick().await; // immediate first tick, discarded
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    _ = interval.tick() => {
                        debug!(kind = patroller.kind, "patrol pass");
                        reconciler.patrol_once().await;
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use syncer_test::eventually;

    #[derive(Default)]
    struct Counting {
        passes: AtomicU32,
    }

    #[async_trait]
    impl PatrolReconciler for Counting {
        async fn patrol_once(&self) {
            self.passes.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn ticks_until_cancelled() {
        let patroller = Patroller::new("Pod", Duration::from_millis(20));
        let reconciler = Arc::new(Counting::default());
        let shutdown = CancellationToken::new();
        let task = patroller.spawn(reconciler.clone(), shutdown.clone());

        assert!(eventually(|| reconciler.passes.load(Ordering::SeqCst) >= 2).await);
        shutdown.cancel();
        task.await.unwrap();
        let settled = reconciler.passes.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(reconciler.passes.load(Ordering::SeqCst), settled);
    }
}
