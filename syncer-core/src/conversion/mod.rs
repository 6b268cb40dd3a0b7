//! Conversion between the tenant-side and super-side renditions of an object.
//!
//! Every super cluster object created by the syncer carries an ownership
//! mapping in its annotations: the tenant cluster name, the tenant-side
//! namespace, and the UID of the owning tenant object. The mapping is the
//! only way the upward path can route a super object back to its tenant, and
//! a super object without one is invisible to the syncer.

pub mod equality;

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{Node, Pod};
use k8s_openapi::api::networking::v1::Ingress;
use k8s_openapi::api::storage::v1::StorageClass;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

use crate::constants::{LABEL_CLUSTER, LABEL_NAMESPACE, LABEL_UID, LABEL_VIRTUAL_NODE, PUBLIC_OBJECT_KEY};
use crate::meta::ObjectExt;

/// The tenant owner recovered from a super cluster object's annotations.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TenantOwner {
    /// Owning tenant cluster name.
    pub cluster: String,
    /// Tenant-side namespace, `None` for cluster-scoped kinds.
    pub namespace: Option<String>,
    /// UID of the owning tenant object at the time the super object was
    /// created.
    pub uid: Option<String>,
}

/// Recover the ownership mapping from an object, if it carries one.
pub fn tenant_owner<K: k8s_openapi::Metadata<Ty = ObjectMeta>>(obj: &K) -> Option<TenantOwner> {
    let cluster = obj.annotation(LABEL_CLUSTER)?.to_string();
    Some(TenantOwner {
        cluster,
        namespace: obj.annotation(LABEL_NAMESPACE).map(str::to_string),
        uid: obj.annotation(LABEL_UID).map(str::to_string),
    })
}

/// The super cluster namespace holding the mirror of a tenant namespace.
///
/// Injective per (cluster, namespace), which is what makes the mapping
/// "at most one super object per tenant key" hold.
pub fn to_super_namespace(cluster: &str, namespace: &str) -> String {
    format!("{cluster}-{namespace}")
}

/// Whether a super-side object is published to every tenant.
pub fn is_public<K: k8s_openapi::Metadata<Ty = ObjectMeta>>(obj: &K) -> bool {
    obj.label(PUBLIC_OBJECT_KEY) == Some("true")
}

fn without_tenancy_keys(map: Option<&BTreeMap<String, String>>) -> BTreeMap<String, String> {
    map.map(|m| {
        m.iter()
            .filter(|(k, _)| !k.starts_with("tenancy.x-k8s.io/"))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    })
    .unwrap_or_default()
}

/// Build the metadata of the super-side rendition of a tenant object.
///
/// Identity fields assigned by the tenant control plane (UID, resource
/// version, timestamps, managed fields) are dropped; the ownership mapping is
/// attached; labels and tenant annotations are carried over.
pub fn build_super_meta(cluster: &str, tenant_meta: &ObjectMeta, super_namespace: Option<String>) -> ObjectMeta {
    let mut annotations = without_tenancy_keys(tenant_meta.annotations.as_ref());
    annotations.insert(LABEL_CLUSTER.to_string(), cluster.to_string());
    if let Some(ns) = &tenant_meta.namespace {
        annotations.insert(LABEL_NAMESPACE.to_string(), ns.clone());
    }
    if let Some(uid) = &tenant_meta.uid {
        annotations.insert(LABEL_UID.to_string(), uid.clone());
    }
    ObjectMeta {
        name: tenant_meta.name.clone(),
        namespace: super_namespace,
        labels: tenant_meta.labels.clone(),
        annotations: Some(annotations),
        ..ObjectMeta::default()
    }
}

/// Build the super-side Pod for a tenant Pod.
///
/// Placement is left empty (the super scheduler owns it) and status is
/// dropped (the super runtime owns it).
pub fn build_super_pod(cluster: &str, tenant_pod: &Pod) -> Pod {
    let super_ns = tenant_pod
        .namespace()
        .map(|ns| to_super_namespace(cluster, ns));
    let mut spec = tenant_pod.spec.clone().unwrap_or_default();
    spec.node_name = None;
    Pod {
        metadata: build_super_meta(cluster, &tenant_pod.metadata, super_ns),
        spec: Some(spec),
        status: None,
    }
}

/// Build the super-side Ingress for a tenant Ingress.
pub fn build_super_ingress(cluster: &str, tenant_ingress: &Ingress) -> Ingress {
    let super_ns = tenant_ingress
        .namespace()
        .map(|ns| to_super_namespace(cluster, ns));
    Ingress {
        metadata: build_super_meta(cluster, &tenant_ingress.metadata, super_ns),
        spec: tenant_ingress.spec.clone(),
        status: None,
    }
}

/// Build the tenant-visible stand-in for a super cluster compute node.
///
/// Capacity, conditions and addresses are mirrored so tenant-side schedulers
/// and kubelet-status consumers see a plausible node; the vnode label marks
/// it as syncer-managed.
pub fn build_virtual_node(super_node: &Node) -> Node {
    let mut labels = super_node.metadata.labels.clone().unwrap_or_default();
    labels.insert(LABEL_VIRTUAL_NODE.to_string(), "true".to_string());
    Node {
        metadata: ObjectMeta {
            name: super_node.metadata.name.clone(),
            labels: Some(labels),
            ..ObjectMeta::default()
        },
        spec: None,
        status: super_node.status.as_ref().map(|s| {
            let mut status = s.clone();
            // Tenant-side nodes carry no images; keep the rest of the
            // descriptor.
            status.images = None;
            status
        }),
    }
}

/// Build the tenant-side copy of a public super StorageClass.
pub fn build_virtual_storage_class(cluster: &str, super_sc: &StorageClass) -> StorageClass {
    let mut vsc = super_sc.clone();
    vsc.metadata = propagated_meta(cluster, &super_sc.metadata);
    vsc
}

/// Build the tenant-side copy of a public super CustomResourceDefinition.
pub fn build_virtual_crd(cluster: &str, super_crd: &CustomResourceDefinition) -> CustomResourceDefinition {
    CustomResourceDefinition {
        metadata: propagated_meta(cluster, &super_crd.metadata),
        spec: super_crd.spec.clone(),
        status: None,
    }
}

/// Metadata for a super-sourced object propagated downward into a tenant.
///
/// The cluster annotation marks the copy as syncer-managed so patrol can
/// distinguish it from tenant-created objects of the same kind.
fn propagated_meta(cluster: &str, super_meta: &ObjectMeta) -> ObjectMeta {
    let mut annotations = without_tenancy_keys(super_meta.annotations.as_ref());
    annotations.insert(LABEL_CLUSTER.to_string(), cluster.to_string());
    ObjectMeta {
        name: super_meta.name.clone(),
        labels: super_meta.labels.clone(),
        annotations: Some(annotations),
        ..ObjectMeta::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{Container, NodeStatus, PodSpec};

    fn tenant_pod() -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some("p1".into()),
                namespace: Some("default".into()),
                uid: Some("uid-1".into()),
                resource_version: Some("42".into()),
                labels: Some([("app".to_string(), "web".to_string())].into()),
                ..ObjectMeta::default()
            },
            spec: Some(PodSpec {
                containers: vec![Container {
                    name: "main".into(),
                    image: Some("nginx:1".into()),
                    ..Container::default()
                }],
                node_name: Some("should-be-cleared".into()),
                ..PodSpec::default()
            }),
            ..Pod::default()
        }
    }

    #[test]
    fn super_pod_carries_ownership_mapping() {
        let p = build_super_pod("cluster-a", &tenant_pod());
        assert_eq!(p.metadata.namespace.as_deref(), Some("cluster-a-default"));
        assert_eq!(p.metadata.resource_version, None);
        assert_eq!(p.metadata.uid, None);
        let owner = tenant_owner(&p).expect("mapping attached");
        assert_eq!(owner.cluster, "cluster-a");
        assert_eq!(owner.namespace.as_deref(), Some("default"));
        assert_eq!(owner.uid.as_deref(), Some("uid-1"));
        // placement and status belong to the super side
        assert_eq!(p.spec.as_ref().unwrap().node_name, None);
        assert_eq!(p.status, None);
    }

    #[test]
    fn objects_without_mapping_have_no_owner() {
        assert_eq!(tenant_owner(&tenant_pod()), None);
    }

    #[test]
    fn virtual_node_is_labeled_and_mirrors_status() {
        let n = Node {
            metadata: ObjectMeta {
                name: Some("n1".into()),
                uid: Some("nuid".into()),
                ..ObjectMeta::default()
            },
            status: Some(NodeStatus::default()),
            ..Node::default()
        };
        let vn = build_virtual_node(&n);
        assert_eq!(vn.name(), "n1");
        assert_eq!(vn.label(LABEL_VIRTUAL_NODE), Some("true"));
        assert_eq!(vn.metadata.uid, None);
        assert!(vn.status.is_some());
    }

    #[test]
    fn super_namespace_is_injective_per_cluster() {
        assert_ne!(
            to_super_namespace("a", "ns"),
            to_super_namespace("b", "ns")
        );
        assert_ne!(
            to_super_namespace("a", "ns1"),
            to_super_namespace("a", "ns2")
        );
    }
}
