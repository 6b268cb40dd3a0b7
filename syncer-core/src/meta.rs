//! Metadata accessor helpers.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

/// Accessors over any [`ObjectMeta`]-carrying type, flattening the `Option`
/// plumbing for properties that are always set on persisted objects.
pub trait ObjectExt {
    /// Object name; empty only for objects that were never persisted.
    fn name(&self) -> &str;
    /// Namespace, `None` for cluster-scoped objects.
    fn namespace(&self) -> Option<&str>;
    /// UID assigned by the control plane; empty before persistence.
    fn uid(&self) -> &str;
    /// Resource version, `None` before persistence.
    fn resource_version(&self) -> Option<&str>;
    /// A single annotation value.
    fn annotation(&self, key: &str) -> Option<&str>;
    /// A single label value.
    fn label(&self, key: &str) -> Option<&str>;
    /// Whether the object carries a deletion timestamp.
    fn is_terminating(&self) -> bool;
}

impl<K: k8s_openapi::Metadata<Ty = ObjectMeta>> ObjectExt for K {
    fn name(&self) -> &str {
        self.metadata().name.as_deref().unwrap_or_default()
    }

    fn namespace(&self) -> Option<&str> {
        self.metadata().namespace.as_deref()
    }

    fn uid(&self) -> &str {
        self.metadata().uid.as_deref().unwrap_or_default()
    }

    fn resource_version(&self) -> Option<&str> {
        self.metadata().resource_version.as_deref()
    }

    fn annotation(&self, key: &str) -> Option<&str> {
        self.metadata()
            .annotations
            .as_ref()
            .and_then(|a| a.get(key))
            .map(String::as_str)
    }

    fn label(&self, key: &str) -> Option<&str> {
        self.metadata()
            .labels
            .as_ref()
            .and_then(|l| l.get(key))
            .map(String::as_str)
    }

    fn is_terminating(&self) -> bool {
        self.metadata().deletion_timestamp.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::Pod;

    #[test]
    fn accessors_flatten_options() {
        let pod = Pod {
            metadata: ObjectMeta {
                name: Some("p1".into()),
                namespace: Some("ns".into()),
                uid: Some("u-1".into()),
                annotations: Some([("k".to_string(), "v".to_string())].into()),
                ..ObjectMeta::default()
            },
            ..Pod::default()
        };
        assert_eq!(pod.name(), "p1");
        assert_eq!(pod.namespace(), Some("ns"));
        assert_eq!(pod.uid(), "u-1");
        assert_eq!(pod.annotation("k"), Some("v"));
        assert_eq!(pod.annotation("missing"), None);
        assert_eq!(pod.label("k"), None);
        assert!(!pod.is_terminating());
        assert_eq!(pod.resource_version(), None);
    }
}
