//! Annotation and label keys shared between the super and tenant sides.

/// Annotation on a super cluster object naming the tenant cluster that owns it.
pub const LABEL_CLUSTER: &str = "tenancy.x-k8s.io/cluster";

/// Annotation on a super cluster object naming the tenant-side namespace the
/// owning object lives in.
pub const LABEL_NAMESPACE: &str = "tenancy.x-k8s.io/namespace";

/// Annotation on a super cluster object carrying the UID of the owning tenant
/// object. A mismatch with the live tenant UID is an integrity violation.
pub const LABEL_UID: &str = "tenancy.x-k8s.io/uid";

/// Label on tenant-side nodes created by the syncer as stand-ins for super
/// cluster compute nodes.
pub const LABEL_VIRTUAL_NODE: &str = "tenancy.x-k8s.io/vnode";

/// Label marking a super cluster object (storage class, CRD) as visible to
/// every tenant control plane.
pub const PUBLIC_OBJECT_KEY: &str = "tenancy.x-k8s.io/super.public";

/// Grace period used when propagating a deletion whose tenant object does not
/// specify one.
pub const MINIMUM_GRACE_PERIOD_SECONDS: i64 = 30;
