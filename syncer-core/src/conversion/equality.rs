//! Per-kind equality checks.
//!
//! Every check returns `Option<updated object>`: `None` means the two sides
//! already agree on the checked field set, `Some` carries the minimal updated
//! rendition of the write target. Results are computed fresh on every call —
//! both the reactive reconcilers and the patroller call straight into these
//! functions, so the two paths cannot diverge.
//!
//! Field ownership is split: downward checks assert only tenant-owned fields
//! onto the super object (labels, annotations, the mutable slice of a pod
//! spec, the whole ingress spec) and never touch what the super control plane
//! manages (status, admission defaults, placement). Upward checks assert only
//! super-observed state onto the tenant object (status, admission-added
//! metadata) and never remove tenant-authored keys.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{Pod, PodStatus};
use k8s_openapi::api::networking::v1::{Ingress, IngressStatus};
use k8s_openapi::api::storage::v1::StorageClass;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

fn is_tenancy_key(key: &str) -> bool {
    key.starts_with("tenancy.x-k8s.io/")
}

/// Merge source entries (minus tenancy-internal keys) into `target`,
/// returning the merged map if anything changed.
fn merge_missing(
    source: Option<&BTreeMap<String, String>>,
    target: Option<&BTreeMap<String, String>>,
) -> Option<BTreeMap<String, String>> {
    let mut merged = target.cloned().unwrap_or_default();
    let mut changed = false;
    for (k, v) in source.into_iter().flatten() {
        if is_tenancy_key(k) {
            continue;
        }
        if merged.get(k) != Some(v) {
            merged.insert(k.clone(), v.clone());
            changed = true;
        }
    }
    changed.then_some(merged)
}

/// Downward metadata check: tenant labels/annotations asserted onto the super
/// object. Returns the updated super metadata.
pub fn check_dw_object_meta(tenant: &ObjectMeta, superside: &ObjectMeta) -> Option<ObjectMeta> {
    let labels = merge_missing(tenant.labels.as_ref(), superside.labels.as_ref());
    let annotations = merge_missing(tenant.annotations.as_ref(), superside.annotations.as_ref());
    if labels.is_none() && annotations.is_none() {
        return None;
    }
    let mut updated = superside.clone();
    if let Some(l) = labels {
        updated.labels = Some(l);
    }
    if let Some(a) = annotations {
        updated.annotations = Some(a);
    }
    Some(updated)
}

/// Upward metadata check: super-added labels/annotations asserted onto the
/// tenant object. Returns the updated tenant metadata.
pub fn check_uw_object_meta(superside: &ObjectMeta, tenant: &ObjectMeta) -> Option<ObjectMeta> {
    let labels = merge_missing(superside.labels.as_ref(), tenant.labels.as_ref());
    let annotations = merge_missing(superside.annotations.as_ref(), tenant.annotations.as_ref());
    if labels.is_none() && annotations.is_none() {
        return None;
    }
    let mut updated = tenant.clone();
    if let Some(l) = labels {
        updated.labels = Some(l);
    }
    if let Some(a) = annotations {
        updated.annotations = Some(a);
    }
    Some(updated)
}

/// Downward pod check: the mutable, tenant-owned slice of the pod.
///
/// Kubernetes only allows container images and `activeDeadlineSeconds` to
/// change on a persisted pod spec, so those plus metadata are all the
/// downward path ever asserts. Returns the updated super pod.
pub fn check_dw_pod(tenant: &Pod, superside: &Pod) -> Option<Pod> {
    let mut updated = superside.clone();
    let mut changed = false;

    if let Some(meta) = check_dw_object_meta(&tenant.metadata, &superside.metadata) {
        updated.metadata = meta;
        changed = true;
    }

    let tenant_spec = tenant.spec.as_ref();
    let super_spec = updated.spec.get_or_insert_with(Default::default);
    if let Some(tspec) = tenant_spec {
        let images: BTreeMap<&str, Option<&String>> = tspec
            .containers
            .iter()
            .map(|c| (c.name.as_str(), c.image.as_ref()))
            .collect();
        for container in &mut super_spec.containers {
            if let Some(image) = images.get(container.name.as_str()) {
                if container.image.as_ref() != *image {
                    container.image = image.cloned();
                    changed = true;
                }
            }
        }
        if super_spec.active_deadline_seconds != tspec.active_deadline_seconds {
            super_spec.active_deadline_seconds = tspec.active_deadline_seconds;
            changed = true;
        }
    }

    changed.then_some(updated)
}

/// Upward pod status check. Returns the super-observed status to write into
/// the tenant pod.
pub fn check_uw_pod_status(superside: &Pod, tenant: &Pod) -> Option<PodStatus> {
    let super_status = superside.status.clone().unwrap_or_default();
    let tenant_status = tenant.status.clone().unwrap_or_default();
    (super_status != tenant_status).then_some(super_status)
}

/// Downward ingress check: the tenant owns the whole spec. Returns the
/// updated super ingress.
pub fn check_dw_ingress(tenant: &Ingress, superside: &Ingress) -> Option<Ingress> {
    let mut updated = superside.clone();
    let mut changed = false;
    if let Some(meta) = check_dw_object_meta(&tenant.metadata, &superside.metadata) {
        updated.metadata = meta;
        changed = true;
    }
    if updated.spec != tenant.spec {
        updated.spec = tenant.spec.clone();
        changed = true;
    }
    changed.then_some(updated)
}

/// Upward ingress status check: load balancer ingress points observed on the
/// super side flow back to the tenant.
pub fn check_uw_ingress_status(superside: &Ingress, tenant: &Ingress) -> Option<IngressStatus> {
    let super_status = superside.status.clone().unwrap_or_default();
    let tenant_status = tenant.status.clone().unwrap_or_default();
    (super_status != tenant_status).then_some(super_status)
}

/// Storage class propagation check: the super side is the source of truth for
/// everything but the tenant copy's identity metadata. Returns the updated
/// tenant copy.
pub fn check_storage_class(superside: &StorageClass, tenant: &StorageClass) -> Option<StorageClass> {
    let mut updated = tenant.clone();
    let mut changed = false;

    if updated.provisioner != superside.provisioner {
        updated.provisioner = superside.provisioner.clone();
        changed = true;
    }
    if updated.parameters != superside.parameters {
        updated.parameters = superside.parameters.clone();
        changed = true;
    }
    if updated.reclaim_policy != superside.reclaim_policy {
        updated.reclaim_policy = superside.reclaim_policy.clone();
        changed = true;
    }
    if updated.mount_options != superside.mount_options {
        updated.mount_options = superside.mount_options.clone();
        changed = true;
    }
    if updated.volume_binding_mode != superside.volume_binding_mode {
        updated.volume_binding_mode = superside.volume_binding_mode.clone();
        changed = true;
    }
    if updated.allow_volume_expansion != superside.allow_volume_expansion {
        updated.allow_volume_expansion = superside.allow_volume_expansion;
        changed = true;
    }
    if updated.allowed_topologies != superside.allowed_topologies {
        updated.allowed_topologies = superside.allowed_topologies.clone();
        changed = true;
    }

    changed.then_some(updated)
}

/// CRD propagation check: the spec is the source of truth. Returns the
/// updated tenant copy.
pub fn check_crd(
    superside: &CustomResourceDefinition,
    tenant: &CustomResourceDefinition,
) -> Option<CustomResourceDefinition> {
    (tenant.spec != superside.spec).then(|| {
        let mut updated = tenant.clone();
        updated.spec = superside.spec.clone();
        updated
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{Container, PodSpec};

    fn pod(image: &str) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some("p1".into()),
                ..ObjectMeta::default()
            },
            spec: Some(PodSpec {
                containers: vec![Container {
                    name: "main".into(),
                    image: Some(image.into()),
                    ..Container::default()
                }],
                ..PodSpec::default()
            }),
            ..Pod::default()
        }
    }

    #[test]
    fn identical_pods_are_equal() {
        assert!(check_dw_pod(&pod("nginx:1"), &pod("nginx:1")).is_none());
    }

    #[test]
    fn image_drift_produces_patch_and_round_trips_to_nil() {
        let tenant = pod("nginx:2");
        let superside = pod("nginx:1");
        let updated = check_dw_pod(&tenant, &superside).expect("image drifted");
        assert_eq!(
            updated.spec.as_ref().unwrap().containers[0].image.as_deref(),
            Some("nginx:2")
        );
        // applying the patch re-establishes equality
        assert!(check_dw_pod(&tenant, &updated).is_none());
    }

    #[test]
    fn tenancy_keys_never_flow_upward() {
        let mut superside = pod("nginx:1");
        superside.metadata.annotations = Some(
            [
                ("tenancy.x-k8s.io/cluster".to_string(), "c1".to_string()),
                ("observed".to_string(), "yes".to_string()),
            ]
            .into(),
        );
        let tenant = pod("nginx:1");
        let updated =
            check_uw_object_meta(&superside.metadata, &tenant.metadata).expect("annotation added");
        let annotations = updated.annotations.unwrap();
        assert_eq!(annotations.get("observed").map(String::as_str), Some("yes"));
        assert!(!annotations.contains_key("tenancy.x-k8s.io/cluster"));
    }

    #[test]
    fn upward_merge_never_removes_tenant_keys() {
        let superside = pod("nginx:1");
        let mut tenant = pod("nginx:1");
        tenant.metadata.labels = Some([("mine".to_string(), "kept".to_string())].into());
        assert!(check_uw_object_meta(&superside.metadata, &tenant.metadata).is_none());
    }

    #[test]
    fn status_flows_upward_once() {
        let mut superside = pod("nginx:1");
        superside.status = Some(PodStatus {
            phase: Some("Running".into()),
            ..PodStatus::default()
        });
        let mut tenant = pod("nginx:1");
        let status = check_uw_pod_status(&superside, &tenant).expect("phase drifted");
        assert_eq!(status.phase.as_deref(), Some("Running"));
        tenant.status = Some(status);
        assert!(check_uw_pod_status(&superside, &tenant).is_none());
    }

    #[test]
    fn storage_class_fields_follow_super() {
        let mut superside = StorageClass {
            metadata: ObjectMeta {
                name: Some("fast".into()),
                ..ObjectMeta::default()
            },
            provisioner: "csi.example.com".into(),
            ..StorageClass::default()
        };
        let tenant = superside.clone();
        assert!(check_storage_class(&superside, &tenant).is_none());

        superside.allow_volume_expansion = Some(true);
        let updated = check_storage_class(&superside, &tenant).expect("expansion flag drifted");
        assert_eq!(updated.allow_volume_expansion, Some(true));
        assert!(check_storage_class(&superside, &updated).is_none());
    }
}
