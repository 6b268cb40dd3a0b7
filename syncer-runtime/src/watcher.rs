//! The change notification stream feeding a reflector cache.

use std::sync::Arc;
use std::time::Duration;

use backon::{BackoffBuilder, ExponentialBuilder};
use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use syncer_core::{ClusterClient, SyncedObject, WatchEvent};

use crate::reflector::Writer;

/// A change observed on one (cluster, kind), after cache bookkeeping.
#[derive(Clone, Debug)]
pub enum Event<K> {
    /// An object was added or modified.
    Applied(K),
    /// An object was removed; carries the last observed state.
    Deleted(K),
    /// The stream (re)started from a full list. Deletions may have been
    /// missed; the cache content is replaced wholesale.
    Restarted(Vec<K>),
}

fn reconnect_backoff() -> impl Iterator<Item = Duration> {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(100))
        .with_max_delay(Duration::from_secs(30))
        .without_max_times()
        .build()
}

/// Drive the reflector for one (cluster, kind) until cancelled.
///
/// Subscribes to the watch before the initial list so no event falls between
/// the two, replays the list as [`Event::Restarted`] (which also flips the
/// cache's synced signal), then streams steady-state events. Every event is
/// applied to the cache before it reaches `sink`, so a sink that enqueues
/// keys can rely on the cache already reflecting the event.
pub async fn run_reflector<K, S>(
    client: Arc<dyn ClusterClient>,
    mut writer: Writer<K>,
    sink: S,
    shutdown: CancellationToken,
) where
    K: SyncedObject,
    S: Fn(&Event<K>) + Send + Sync,
{
    let mut delays = reconnect_backoff();
    loop {
        if shutdown.is_cancelled() {
            return;
        }
        let api = K::api(&*client);
        let mut stream = match api.watch(None).await {
            Ok(stream) => stream,
            Err(err) => {
                warn!(kind = K::KIND, %err, "failed to open watch, retrying");
                if !pause(&mut delays, &shutdown).await {
                    return;
                }
                continue;
            }
        };
        let list = match api.list(None).await {
            Ok(list) => list,
            Err(err) => {
                warn!(kind = K::KIND, %err, "initial list failed, retrying");
                if !pause(&mut delays, &shutdown).await {
                    return;
                }
                continue;
            }
        };
        delays = reconnect_backoff();
        debug!(kind = K::KIND, objects = list.len(), "cache synced");
        let restarted = Event::Restarted(list);
        writer.apply(&restarted);
        sink(&restarted);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                item = stream.next() => match item {
                    Some(raw) => {
                        let event = match raw {
                            WatchEvent::Added(obj) | WatchEvent::Modified(obj) => Event::Applied(obj),
                            WatchEvent::Deleted(obj) => Event::Deleted(obj),
                        };
                        writer.apply(&event);
                        sink(&event);
                    }
                    None => {
                        debug!(kind = K::KIND, "watch stream ended, re-listing");
                        break;
                    }
                },
            }
        }
        if !pause(&mut delays, &shutdown).await {
            return;
        }
    }
}

/// Sleep out one backoff step; `false` means we were cancelled instead.
async fn pause(delays: &mut impl Iterator<Item = Duration>, shutdown: &CancellationToken) -> bool {
    let delay = delays.next().unwrap_or(Duration::from_secs(30));
    tokio::select! {
        _ = shutdown.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reflector::ObjectKey;
    use k8s_openapi::api::core::v1::Pod;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use syncer_core::DeleteOptions;
    use syncer_core::ObjectApi;
    use syncer_test::{eventually, TestCluster};

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

    #[tokio::test]
    async fn reflector_tracks_cluster_state() {
        let cluster = TestCluster::new();
        cluster.put(&pod("preexisting"));

        let writer = Writer::default();
        let store = writer.as_reader();
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(run_reflector::<Pod, _>(
            cluster.client(),
            writer,
            |_| {},
            shutdown.clone(),
        ));

        assert!(store.wait_until_ready().await);
        assert!(store.get(&ObjectKey::new(Some("ns"), "preexisting")).is_some());

        let api: &dyn ObjectApi<Pod> = cluster.pods();
        api.create(&pod("later")).await.unwrap();
        assert!(
            eventually(|| store.get(&ObjectKey::new(Some("ns"), "later")).is_some()).await,
            "created object should appear in the cache"
        );

        api.delete(Some("ns"), "later", &DeleteOptions::default()).await.unwrap();
        assert!(
            eventually(|| store.get(&ObjectKey::new(Some("ns"), "later")).is_none()).await,
            "deleted object should leave the cache"
        );

        shutdown.cancel();
        task.await.unwrap();
    }
}
