//! Object store client traits.
//!
//! A control plane (super or tenant) is reached through a [`ClusterClient`]:
//! a typed bundle of per-kind [`ObjectApi`] handles, one per governed
//! resource kind, in the manner of a typed clientset. The store itself is an
//! external collaborator; these traits only fix its contract — get/list/watch
//! plus create/update/update-status/delete under resource-version optimistic
//! concurrency.

use async_trait::async_trait;
use futures::stream::BoxStream;
use k8s_openapi::api::core::v1::{Node, Pod};
use k8s_openapi::api::networking::v1::Ingress;
use k8s_openapi::api::storage::v1::StorageClass;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde::{de::DeserializeOwned, Serialize};

use crate::error::Result;

/// A change notification delivered by [`ObjectApi::watch`].
///
/// Carries the post-change snapshot (`Deleted` carries the last observed
/// state). Consumers that need before-state diff against their local cache of
/// last observed objects.
#[derive(Clone, Debug)]
pub enum WatchEvent<K> {
    /// An object was created.
    Added(K),
    /// An object was updated.
    Modified(K),
    /// An object was removed.
    Deleted(K),
}

/// Options for [`ObjectApi::delete`].
#[derive(Clone, Debug, Default)]
pub struct DeleteOptions {
    /// Seconds the object is given to terminate gracefully. `Some(0)` forces
    /// immediate removal.
    pub grace_period_seconds: Option<i64>,
    /// Delete only if the live object still has this UID.
    pub preconditions_uid: Option<String>,
}

impl DeleteOptions {
    /// Delete with a grace period and no UID precondition.
    pub fn grace(seconds: i64) -> Self {
        DeleteOptions {
            grace_period_seconds: Some(seconds),
            ..DeleteOptions::default()
        }
    }
}

/// A boxed stream of watch events.
pub type WatchStream<K> = BoxStream<'static, WatchEvent<K>>;

/// CRUD + watch over one resource kind in one control plane.
///
/// `update` and `update_status` carry resource-version preconditions: a write
/// based on a stale read fails with [`ApiError::Conflict`] and must be
/// retried from a fresh read. `update_status` only asserts the status
/// subresource, leaving spec and metadata untouched.
///
/// [`ApiError::Conflict`]: crate::error::ApiError::Conflict
#[async_trait]
pub trait ObjectApi<K: SyncedObject>: Send + Sync {
    /// Fetch one object. `namespace` is `None` for cluster-scoped kinds.
    async fn get(&self, namespace: Option<&str>, name: &str) -> Result<K>;

    /// List objects, across all namespaces when `namespace` is `None`.
    async fn list(&self, namespace: Option<&str>) -> Result<Vec<K>>;

    /// Open a change notification stream for the kind.
    async fn watch(&self, namespace: Option<&str>) -> Result<WatchStream<K>>;

    /// Create an object; fails with `AlreadyExists` if the name is taken.
    async fn create(&self, obj: &K) -> Result<K>;

    /// Update an object under its resource-version precondition.
    async fn update(&self, obj: &K) -> Result<K>;

    /// Update only the status subresource under the resource-version
    /// precondition.
    async fn update_status(&self, obj: &K) -> Result<K>;

    /// Delete an object, honoring grace period and UID precondition.
    async fn delete(&self, namespace: Option<&str>, name: &str, opts: &DeleteOptions) -> Result<()>;
}

/// A per-cluster handle over every governed resource kind.
///
/// One handle exists for the super control plane and one per registered
/// tenant; they are created and dropped as tenants come and go.
pub trait ClusterClient: Send + Sync {
    /// Pods.
    fn pods(&self) -> &dyn ObjectApi<Pod>;
    /// Compute nodes (virtual nodes on the tenant side).
    fn nodes(&self) -> &dyn ObjectApi<Node>;
    /// Storage classes.
    fn storage_classes(&self) -> &dyn ObjectApi<StorageClass>;
    /// Ingresses.
    fn ingresses(&self) -> &dyn ObjectApi<Ingress>;
    /// Custom resource definitions.
    fn crds(&self) -> &dyn ObjectApi<CustomResourceDefinition>;
}

/// Capability trait for a resource kind governed by the syncer.
///
/// This is the "object prototype" seam: generic controllers are instantiated
/// per `K: SyncedObject` and reach the right typed api on any
/// [`ClusterClient`] through [`SyncedObject::api`].
pub trait SyncedObject:
    k8s_openapi::Metadata<Ty = ObjectMeta>
    + Clone
    + Serialize
    + DeserializeOwned
    + Send
    + Sync
    + 'static
{
    /// Whether objects of this kind live in namespaces.
    const NAMESPACED: bool;

    /// The typed api for this kind on a cluster handle.
    fn api(client: &dyn ClusterClient) -> &dyn ObjectApi<Self>;
}

impl SyncedObject for Pod {
    const NAMESPACED: bool = true;

    fn api(client: &dyn ClusterClient) -> &dyn ObjectApi<Self> {
        client.pods()
    }
}

impl SyncedObject for Node {
    const NAMESPACED: bool = false;

    fn api(client: &dyn ClusterClient) -> &dyn ObjectApi<Self> {
        client.nodes()
    }
}

impl SyncedObject for StorageClass {
    const NAMESPACED: bool = false;

    fn api(client: &dyn ClusterClient) -> &dyn ObjectApi<Self> {
        client.storage_classes()
    }
}

impl SyncedObject for Ingress {
    const NAMESPACED: bool = true;

    fn api(client: &dyn ClusterClient) -> &dyn ObjectApi<Self> {
        client.ingresses()
    }
}

impl SyncedObject for CustomResourceDefinition {
    const NAMESPACED: bool = false;

    fn api(client: &dyn ClusterClient) -> &dyn ObjectApi<Self> {
        client.crds()
    }
}
