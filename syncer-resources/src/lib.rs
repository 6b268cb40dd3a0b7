//! Resource syncer plugins.
//!
//! Each module implements one governed kind's policy — how its super-side
//! rendition is built, what equality means in each direction, and the extra
//! lifecycle the kind carries (for pods: placement binding and virtual-node
//! GC). The generic engine in `syncer-runtime` does everything else.
//!
//! [`default_registry`] is the explicit plugin table wired by the
//! composition root. Pods and storage classes run by default; ingress and
//! CRD propagation are present but opt-in.

pub mod crd;
pub mod ingress;
pub mod pod;
pub mod storageclass;

use std::sync::Arc;

use syncer_runtime::plugin::{Registration, ResourceSyncer, SyncerRegistry};

/// The plugin table for a stock deployment.
pub fn default_registry() -> SyncerRegistry {
    let mut registry = SyncerRegistry::new();
    registry.register(Registration::new("pod", true, |ctx| {
        let syncer: Arc<dyn ResourceSyncer> = pod::PodSyncer::new(ctx);
        Ok(syncer)
    }));
    registry.register(Registration::new("storageclass", true, |ctx| {
        let syncer: Arc<dyn ResourceSyncer> = storageclass::StorageClassSyncer::new(ctx);
        Ok(syncer)
    }));
    registry.register(Registration::new("ingress", false, |ctx| {
        let syncer: Arc<dyn ResourceSyncer> = ingress::IngressSyncer::new(ctx);
        Ok(syncer)
    }));
    registry.register(Registration::new("crd", false, |ctx| {
        let syncer: Arc<dyn ResourceSyncer> = crd::CrdSyncer::new(ctx);
        Ok(syncer)
    }));
    registry
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_lists_all_kinds() {
        let registry = default_registry();
        assert_eq!(registry.ids(), vec!["pod", "storageclass", "ingress", "crd"]);
    }
}
