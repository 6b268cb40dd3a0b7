//! An in-memory control plane for exercising the syncer.
//!
//! [`TestCluster`] implements the `syncer-core` client traits over a plain
//! map of JSON-encoded objects, with the same observable semantics the engine
//! relies on from a real object store: monotonically increasing resource
//! versions, optimistic-concurrency conflicts on stale writes, UID delete
//! preconditions, graceful pod deletion (a positive grace period marks the
//! pod terminating instead of removing it), and per-kind watch fan-out.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_broadcast::{InactiveReceiver, Sender};
use async_trait::async_trait;
use futures::StreamExt;
use k8s_openapi::api::core::v1::{Node, Pod};
use k8s_openapi::api::networking::v1::Ingress;
use k8s_openapi::api::storage::v1::StorageClass;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use parking_lot::Mutex;
use serde_json::Value;

use syncer_core::error::Result;
use syncer_core::meta::ObjectExt;
use syncer_core::{ApiError, ClusterClient, DeleteOptions, ObjectApi, SyncedObject, WatchEvent};

type ObjectKey = (Option<String>, String);

const WATCH_CAPACITY: usize = 1024;

struct KindState {
    objects: BTreeMap<ObjectKey, Value>,
    events: Sender<WatchEvent<Value>>,
    // Keeps the channel open while no watcher is active.
    _keepalive: InactiveReceiver<WatchEvent<Value>>,
}

impl KindState {
    fn new() -> Self {
        let (events, rx) = async_broadcast::broadcast(WATCH_CAPACITY);
        KindState {
            objects: BTreeMap::new(),
            events,
            _keepalive: rx.deactivate(),
        }
    }

    fn emit(&self, event: WatchEvent<Value>) {
        let _ = self.events.try_broadcast(event);
    }
}

#[derive(Default)]
struct State {
    kinds: BTreeMap<&'static str, KindState>,
    resource_version: u64,
    uid_counter: u64,
}

impl Default for KindState {
    fn default() -> Self {
        KindState::new()
    }
}

/// One in-memory control plane, usable as either the super side or a tenant
/// side of the syncer.
#[derive(Clone)]
pub struct TestCluster {
    state: Arc<Mutex<State>>,
}

impl Default for TestCluster {
    fn default() -> Self {
        TestCluster::new()
    }
}

impl TestCluster {
    /// An empty cluster.
    pub fn new() -> Self {
        TestCluster {
            state: Arc::new(Mutex::new(State::default())),
        }
    }

    /// An `Arc<dyn ClusterClient>` view of this cluster.
    pub fn client(&self) -> Arc<dyn ClusterClient> {
        Arc::new(self.clone())
    }

    /// Upsert an object without preconditions, simulating an out-of-band
    /// actor (a scheduler, an admission webhook, a human with kubectl).
    /// Assigns a UID and resource version as needed and emits a watch event.
    pub fn put<K: SyncedObject>(&self, obj: &K) -> K {
        let mut state = self.state.lock();
        let state = &mut *state;
        state.resource_version += 1;
        let rv = state.resource_version;
        let key = object_key(obj);
        let existing_uid = state
            .kinds
            .get(K::KIND)
            .and_then(|k| k.objects.get(&key))
            .and_then(|v| v["metadata"]["uid"].as_str())
            .map(str::to_string);
        let uid = match existing_uid {
            Some(uid) => uid,
            None if obj.uid().is_empty() => {
                state.uid_counter += 1;
                format!("uid-{:04}", state.uid_counter)
            }
            None => obj.uid().to_string(),
        };

        let kind = state.kinds.entry(K::KIND).or_default();
        let existed = kind.objects.contains_key(&key);
        let mut value = serde_json::to_value(obj).expect("object serializes");
        value["metadata"]["uid"] = Value::String(uid);
        value["metadata"]["resourceVersion"] = Value::String(rv.to_string());

        kind.objects.insert(key, value.clone());
        if existed {
            kind.emit(WatchEvent::Modified(value.clone()));
        } else {
            kind.emit(WatchEvent::Added(value.clone()));
        }
        serde_json::from_value(value).expect("object deserializes")
    }

    /// Remove an object outright, bypassing grace-period semantics — the
    /// "manually deleted out-of-band" case the patroller exists for.
    pub fn remove<K: SyncedObject>(&self, namespace: Option<&str>, name: &str) {
        let mut state = self.state.lock();
        if let Some(kind) = state.kinds.get_mut(K::KIND) {
            let key = (namespace.map(str::to_string), name.to_string());
            if let Some(value) = kind.objects.remove(&key) {
                kind.emit(WatchEvent::Deleted(value));
            }
        }
    }

    /// Direct read for assertions, bypassing the typed api.
    pub fn get_obj<K: SyncedObject>(&self, namespace: Option<&str>, name: &str) -> Option<K> {
        let state = self.state.lock();
        let kind = state.kinds.get(K::KIND)?;
        let key = (namespace.map(str::to_string), name.to_string());
        kind.objects
            .get(&key)
            .map(|v| serde_json::from_value(v.clone()).expect("object deserializes"))
    }

    fn do_get<K: SyncedObject>(&self, namespace: Option<&str>, name: &str) -> Result<K> {
        self.get_obj(namespace, name).ok_or_else(|| ApiError::NotFound {
            kind: K::KIND,
            name: display_name(namespace, name),
        })
    }

    fn do_list<K: SyncedObject>(&self, namespace: Option<&str>) -> Result<Vec<K>> {
        let state = self.state.lock();
        let Some(kind) = state.kinds.get(K::KIND) else {
            return Ok(Vec::new());
        };
        Ok(kind
            .objects
            .iter()
            .filter(|((ns, _), _)| namespace.is_none() || ns.as_deref() == namespace)
            .map(|(_, v)| serde_json::from_value(v.clone()).expect("object deserializes"))
            .collect())
    }

    fn do_watch<K: SyncedObject>(&self, namespace: Option<&str>) -> syncer_core::client::WatchStream<K> {
        let rx = {
            let mut state = self.state.lock();
            let kind = state.kinds.entry(K::KIND).or_default();
            kind._keepalive.activate_cloned()
        };
        let namespace = namespace.map(str::to_string);
        rx.filter_map(move |event| {
            let namespace = namespace.clone();
            async move {
                let mapped = match event {
                    WatchEvent::Added(v) => map_value::<K>(v).map(WatchEvent::Added),
                    WatchEvent::Modified(v) => map_value::<K>(v).map(WatchEvent::Modified),
                    WatchEvent::Deleted(v) => map_value::<K>(v).map(WatchEvent::Deleted),
                };
                mapped.filter(|ev| {
                    namespace.is_none() || event_object_namespace(ev) == namespace.as_deref()
                })
            }
        })
        .boxed()
    }

    fn do_create<K: SyncedObject>(&self, obj: &K) -> Result<K> {
        if obj.name().is_empty() {
            return Err(ApiError::Invalid("create requires a name".into()));
        }
        let mut state = self.state.lock();
        let state = &mut *state;
        let kind = state.kinds.entry(K::KIND).or_default();
        let key = object_key(obj);
        if kind.objects.contains_key(&key) {
            return Err(ApiError::AlreadyExists {
                kind: K::KIND,
                name: display_name(obj.namespace(), obj.name()),
            });
        }
        state.resource_version += 1;
        state.uid_counter += 1;
        let mut value = serde_json::to_value(obj).expect("object serializes");
        value["metadata"]["uid"] = Value::String(format!("uid-{:04}", state.uid_counter));
        value["metadata"]["resourceVersion"] = Value::String(state.resource_version.to_string());
        kind.objects.insert(key, value.clone());
        kind.emit(WatchEvent::Added(value.clone()));
        Ok(serde_json::from_value(value).expect("object deserializes"))
    }

    fn do_update<K: SyncedObject>(&self, obj: &K, status_only: bool) -> Result<K> {
        let mut state = self.state.lock();
        let state = &mut *state;
        let kind = state.kinds.entry(K::KIND).or_default();
        let key = object_key(obj);
        let name = display_name(obj.namespace(), obj.name());
        let Some(stored) = kind.objects.get_mut(&key) else {
            return Err(ApiError::NotFound {
                kind: K::KIND,
                name,
            });
        };
        let current_rv = stored["metadata"]["resourceVersion"].as_str().unwrap_or_default();
        if let Some(rv) = obj.resource_version() {
            if rv != current_rv {
                return Err(ApiError::Conflict {
                    kind: K::KIND,
                    name,
                    reason: format!("stale resource version {rv}, current {current_rv}"),
                });
            }
        }
        state.resource_version += 1;
        let uid = stored["metadata"]["uid"].clone();
        let deletion_timestamp = stored["metadata"]["deletionTimestamp"].clone();
        let deletion_grace = stored["metadata"]["deletionGracePeriodSeconds"].clone();
        let incoming = serde_json::to_value(obj).expect("object serializes");
        if status_only {
            stored["status"] = incoming.get("status").cloned().unwrap_or(Value::Null);
        } else {
            *stored = incoming;
        }
        stored["metadata"]["uid"] = uid;
        // deletion markers are apiserver-owned and survive any update
        if !deletion_timestamp.is_null() {
            stored["metadata"]["deletionTimestamp"] = deletion_timestamp;
            stored["metadata"]["deletionGracePeriodSeconds"] = deletion_grace;
        }
        stored["metadata"]["resourceVersion"] = Value::String(state.resource_version.to_string());
        let value = stored.clone();
        kind.emit(WatchEvent::Modified(value.clone()));
        Ok(serde_json::from_value(value).expect("object deserializes"))
    }

    fn do_delete<K: SyncedObject>(
        &self,
        namespace: Option<&str>,
        name: &str,
        opts: &DeleteOptions,
    ) -> Result<()> {
        let mut state = self.state.lock();
        let state = &mut *state;
        let Some(kind) = state.kinds.get_mut(K::KIND) else {
            return Err(ApiError::NotFound {
                kind: K::KIND,
                name: display_name(namespace, name),
            });
        };
        let key = (namespace.map(str::to_string), name.to_string());
        let Some(stored) = kind.objects.get_mut(&key) else {
            return Err(ApiError::NotFound {
                kind: K::KIND,
                name: display_name(namespace, name),
            });
        };
        if let Some(expected_uid) = &opts.preconditions_uid {
            let uid = stored["metadata"]["uid"].as_str().unwrap_or_default();
            if uid != expected_uid {
                return Err(ApiError::Conflict {
                    kind: K::KIND,
                    name: display_name(namespace, name),
                    reason: format!("uid precondition {expected_uid} does not match {uid}"),
                });
            }
        }
        match opts.grace_period_seconds {
            Some(grace) if grace > 0 => {
                // Graceful deletion: mark terminating and let the runtime
                // (or a follow-up forced delete) finish it.
                let already = stored["metadata"]["deletionGracePeriodSeconds"].as_i64();
                if stored["metadata"]["deletionTimestamp"].is_null() || already != Some(grace) {
                    state.resource_version += 1;
                    if stored["metadata"]["deletionTimestamp"].is_null() {
                        let now = Time(chrono::Utc::now());
                        stored["metadata"]["deletionTimestamp"] =
                            serde_json::to_value(now).expect("time serializes");
                    }
                    stored["metadata"]["deletionGracePeriodSeconds"] = Value::from(grace);
                    stored["metadata"]["resourceVersion"] =
                        Value::String(state.resource_version.to_string());
                    let value = stored.clone();
                    kind.emit(WatchEvent::Modified(value));
                }
                Ok(())
            }
            _ => {
                let value = kind.objects.remove(&key).expect("checked above");
                kind.emit(WatchEvent::Deleted(value));
                Ok(())
            }
        }
    }
}

fn object_key<K: SyncedObject>(obj: &K) -> ObjectKey {
    (obj.namespace().map(str::to_string), obj.name().to_string())
}

fn display_name(namespace: Option<&str>, name: &str) -> String {
    match namespace {
        Some(ns) => format!("{ns}/{name}"),
        None => name.to_string(),
    }
}

fn map_value<K: SyncedObject>(value: Value) -> Option<K> {
    serde_json::from_value(value).ok()
}

fn event_object_namespace<K: SyncedObject>(event: &WatchEvent<K>) -> Option<&str> {
    match event {
        WatchEvent::Added(o) | WatchEvent::Modified(o) | WatchEvent::Deleted(o) => o.namespace(),
    }
}

#[async_trait]
impl<K: SyncedObject> ObjectApi<K> for TestCluster {
    async fn get(&self, namespace: Option<&str>, name: &str) -> Result<K> {
        self.do_get(namespace, name)
    }

    async fn list(&self, namespace: Option<&str>) -> Result<Vec<K>> {
        self.do_list(namespace)
    }

    async fn watch(&self, namespace: Option<&str>) -> Result<syncer_core::client::WatchStream<K>> {
        Ok(self.do_watch(namespace))
    }

    async fn create(&self, obj: &K) -> Result<K> {
        self.do_create(obj)
    }

    async fn update(&self, obj: &K) -> Result<K> {
        self.do_update(obj, false)
    }

    async fn update_status(&self, obj: &K) -> Result<K> {
        self.do_update(obj, true)
    }

    async fn delete(&self, namespace: Option<&str>, name: &str, opts: &DeleteOptions) -> Result<()> {
        self.do_delete::<K>(namespace, name, opts)
    }
}

impl ClusterClient for TestCluster {
    fn pods(&self) -> &dyn ObjectApi<Pod> {
        self
    }

    fn nodes(&self) -> &dyn ObjectApi<Node> {
        self
    }

    fn storage_classes(&self) -> &dyn ObjectApi<StorageClass> {
        self
    }

    fn ingresses(&self) -> &dyn ObjectApi<Ingress> {
        self
    }

    fn crds(&self) -> &dyn ObjectApi<CustomResourceDefinition> {
        self
    }
}

/// Poll `check` until it reports true or the deadline passes. Returns whether
/// the condition was observed.
pub async fn eventually<F>(mut check: F) -> bool
where
    F: FnMut() -> bool,
{
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::PodSpec;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn pod(ns: &str, name: &str) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(name.into()),
                namespace: Some(ns.into()),
                ..ObjectMeta::default()
            },
            spec: Some(PodSpec::default()),
            ..Pod::default()
        }
    }

    #[tokio::test]
    async fn create_assigns_identity_and_rejects_duplicates() {
        let cluster = TestCluster::new();
        let api: &dyn ObjectApi<Pod> = cluster.pods();
        let created = api.create(&pod("ns", "a")).await.unwrap();
        assert!(!created.uid().is_empty());
        assert!(created.resource_version().is_some());
        let err = api.create(&pod("ns", "a")).await.unwrap_err();
        assert!(err.is_already_exists());
    }

    #[tokio::test]
    async fn stale_update_conflicts() {
        let cluster = TestCluster::new();
        let api: &dyn ObjectApi<Pod> = cluster.pods();
        let created = api.create(&pod("ns", "a")).await.unwrap();
        let _second = api.update(&created).await.unwrap();
        let err = api.update(&created).await.unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn graceful_delete_marks_terminating_then_forced_removes() {
        let cluster = TestCluster::new();
        let api: &dyn ObjectApi<Pod> = cluster.pods();
        api.create(&pod("ns", "a")).await.unwrap();

        api.delete(Some("ns"), "a", &DeleteOptions::grace(30)).await.unwrap();
        let p: Pod = cluster.get_obj(Some("ns"), "a").unwrap();
        assert!(p.is_terminating());
        assert_eq!(p.metadata.deletion_grace_period_seconds, Some(30));

        // re-issuing with the same grace period is a no-op
        let rv = p.resource_version().unwrap().to_string();
        api.delete(Some("ns"), "a", &DeleteOptions::grace(30)).await.unwrap();
        let p: Pod = cluster.get_obj(Some("ns"), "a").unwrap();
        assert_eq!(p.resource_version(), Some(rv.as_str()));

        api.delete(Some("ns"), "a", &DeleteOptions::default()).await.unwrap();
        assert!(cluster.get_obj::<Pod>(Some("ns"), "a").is_none());
    }

    #[tokio::test]
    async fn uid_precondition_guards_delete() {
        let cluster = TestCluster::new();
        let api: &dyn ObjectApi<Pod> = cluster.pods();
        api.create(&pod("ns", "a")).await.unwrap();
        let opts = DeleteOptions {
            preconditions_uid: Some("wrong".into()),
            ..DeleteOptions::default()
        };
        let err = api.delete(Some("ns"), "a", &opts).await.unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn watch_delivers_lifecycle_events() {
        let cluster = TestCluster::new();
        let api: &dyn ObjectApi<Pod> = cluster.pods();
        let mut stream = api.watch(None).await.unwrap();
        let created = api.create(&pod("ns", "a")).await.unwrap();
        api.delete(Some("ns"), "a", &DeleteOptions::default()).await.unwrap();

        match stream.next().await.unwrap() {
            WatchEvent::Added(p) => assert_eq!(p.name(), created.name()),
            other => panic!("expected Added, got {other:?}"),
        }
        match stream.next().await.unwrap() {
            WatchEvent::Deleted(p) => assert_eq!(p.name(), "a"),
            other => panic!("expected Deleted, got {other:?}"),
        }
    }
}
