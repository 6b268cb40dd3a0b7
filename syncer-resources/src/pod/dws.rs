//! Downward pod reconciliation: tenant-declared pods into the super cluster.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use tracing::{debug, warn};

use syncer_core::constants::MINIMUM_GRACE_PERIOD_SECONDS;
use syncer_core::conversion::equality::check_dw_pod;
use syncer_core::conversion::{build_super_pod, tenant_owner, to_super_namespace};
use syncer_core::meta::ObjectExt;
use syncer_core::{DeleteOptions, SyncError};

use syncer_runtime::reconciler::{DownwardReconciler, Request};

use super::PodSyncer;

#[async_trait]
impl DownwardReconciler for PodSyncer {
    async fn reconcile(&self, request: Request) -> Result<(), SyncError> {
        let tenant_pod = self
            .mc
            .get(&request.cluster, request.namespace.as_deref(), &request.name)?;
        let super_ns = to_super_namespace(
            &request.cluster,
            request.namespace.as_deref().unwrap_or_default(),
        );
        let api = self.super_client.pods();
        let super_pod = match api.get(Some(&super_ns), &request.name).await {
            Ok(pod) => Some(pod),
            Err(err) if err.is_not_found() => None,
            Err(err) => return Err(err.into()),
        };

        match (tenant_pod, super_pod) {
            (None, None) => Ok(()),
            (None, Some(super_pod)) => {
                // tombstone: remove the mapped super object
                let Some(owner) = tenant_owner(&super_pod) else {
                    warn!(%request, "super pod at mapped location carries no ownership mapping, leaving it alone");
                    return Ok(());
                };
                if owner.cluster != request.cluster {
                    warn!(%request, owner = %owner.cluster, "super pod owned by a different cluster, leaving it alone");
                    return Ok(());
                }
                debug!(%request, "deleting super pod for removed tenant pod");
                let opts = DeleteOptions {
                    preconditions_uid: (!super_pod.uid().is_empty())
                        .then(|| super_pod.uid().to_string()),
                    ..DeleteOptions::default()
                };
                match api.delete(Some(&super_ns), &request.name, &opts).await {
                    Ok(()) => Ok(()),
                    Err(err) if err.is_not_found() => Ok(()),
                    Err(err) => Err(err.into()),
                }
            }
            (Some(tenant_pod), None) => {
                if tenant_pod.is_terminating() {
                    // the tenant object is on its way out; recreating the
                    // super pod would only prolong it
                    return Ok(());
                }
                let super_pod = build_super_pod(&request.cluster, &tenant_pod);
                debug!(%request, "creating super pod");
                match api.create(&super_pod).await {
                    Ok(_) => Ok(()),
                    // a resumed crash may have created it already
                    Err(err) if err.is_already_exists() => Ok(()),
                    Err(err) => Err(err.into()),
                }
            }
            (Some(tenant_pod), Some(super_pod)) => {
                let Some(owner) = tenant_owner(&super_pod) else {
                    warn!(%request, "super pod at mapped location carries no ownership mapping, leaving it alone");
                    return Ok(());
                };
                if owner.uid.as_deref() != Some(tenant_pod.uid()) {
                    return Err(SyncError::Integrity(format!(
                        "super pod {super_ns}/{} maps uid {:?} but tenant pod has uid {}",
                        request.name,
                        owner.uid,
                        tenant_pod.uid(),
                    )));
                }
                if tenant_pod.is_terminating() && !super_pod.is_terminating() {
                    // deletion flows down with the tenant's grace period
                    let grace = tenant_pod
                        .metadata
                        .deletion_grace_period_seconds
                        .or_else(|| {
                            tenant_pod
                                .spec
                                .as_ref()
                                .and_then(|s| s.termination_grace_period_seconds)
                        })
                        .unwrap_or(MINIMUM_GRACE_PERIOD_SECONDS);
                    let opts = DeleteOptions {
                        grace_period_seconds: Some(grace),
                        preconditions_uid: Some(super_pod.uid().to_string()),
                    };
                    match api.delete(Some(&super_ns), &request.name, &opts).await {
                        Ok(()) => return Ok(()),
                        Err(err) if err.is_not_found() => return Ok(()),
                        Err(err) => return Err(err.into()),
                    }
                }
                if let Some(updated) = check_dw_pod(&tenant_pod, &super_pod) {
                    debug!(%request, "updating super pod");
                    api.update(&updated).await?;
                }
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{Container, PodSpec};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use std::sync::Arc;
    use syncer_core::constants::LABEL_UID;
    use syncer_runtime::plugin::InitContext;
    use syncer_runtime::reconciler::EventType;
    use syncer_runtime::SyncerConfig;
    use syncer_test::TestCluster;

    fn tenant_pod(name: &str, image: &str) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(name.into()),
                namespace: Some("default".into()),
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

    fn request(name: &str) -> Request {
        Request {
            cluster: "c1".into(),
            namespace: Some("default".into()),
            name: name.into(),
            uid: None,
            event: EventType::Update,
        }
    }

    async fn syncer_with_tenant() -> (Arc<PodSyncer>, TestCluster, TestCluster) {
        let super_cluster = TestCluster::new();
        let tenant = TestCluster::new();
        let ctx = InitContext {
            config: SyncerConfig::default(),
            super_client: super_cluster.client(),
        };
        let syncer = PodSyncer::new(&ctx);
        syncer.mc.register("c1", tenant.client()).await.unwrap();
        (syncer, super_cluster, tenant)
    }

    #[tokio::test]
    async fn creates_super_pod_once_and_is_idempotent() {
        let (syncer, super_cluster, tenant) = syncer_with_tenant().await;
        tenant.put(&tenant_pod("p1", "nginx:1"));
        assert!(syncer_test::eventually(|| {
            syncer.mc.get("c1", Some("default"), "p1").unwrap().is_some()
        })
        .await);

        syncer.reconcile(request("p1")).await.unwrap();
        let created: Pod = super_cluster.get_obj(Some("c1-default"), "p1").unwrap();
        assert_eq!(
            created.annotation(LABEL_UID),
            Some(tenant.get_obj::<Pod>(Some("default"), "p1").unwrap().uid())
        );

        // a second pass with no changes writes nothing
        let rv = created.resource_version().unwrap().to_string();
        syncer.reconcile(request("p1")).await.unwrap();
        let after: Pod = super_cluster.get_obj(Some("c1-default"), "p1").unwrap();
        assert_eq!(after.resource_version(), Some(rv.as_str()));
    }

    #[tokio::test]
    async fn image_change_patches_only_tenant_owned_fields() {
        let (syncer, super_cluster, tenant) = syncer_with_tenant().await;
        tenant.put(&tenant_pod("p1", "nginx:1"));
        assert!(syncer_test::eventually(|| {
            syncer.mc.get("c1", Some("default"), "p1").unwrap().is_some()
        })
        .await);
        syncer.reconcile(request("p1")).await.unwrap();

        // super side sets placement out-of-band
        let mut placed: Pod = super_cluster.get_obj(Some("c1-default"), "p1").unwrap();
        placed.spec.as_mut().unwrap().node_name = Some("n1".into());
        super_cluster.put(&placed);

        // tenant updates the image
        let mut updated = tenant.get_obj::<Pod>(Some("default"), "p1").unwrap();
        updated.spec.as_mut().unwrap().containers[0].image = Some("nginx:2".into());
        tenant.put(&updated);
        assert!(syncer_test::eventually(|| {
            syncer
                .mc
                .get("c1", Some("default"), "p1")
                .unwrap()
                .map(|p| p.spec.as_ref().unwrap().containers[0].image.as_deref() == Some("nginx:2"))
                .unwrap_or(false)
        })
        .await);

        syncer.reconcile(request("p1")).await.unwrap();
        let after: Pod = super_cluster.get_obj(Some("c1-default"), "p1").unwrap();
        assert_eq!(
            after.spec.as_ref().unwrap().containers[0].image.as_deref(),
            Some("nginx:2")
        );
        // placement owned by the super side survives the patch
        assert_eq!(after.spec.as_ref().unwrap().node_name.as_deref(), Some("n1"));
    }

    #[tokio::test]
    async fn tenant_tombstone_deletes_super_pod_idempotently() {
        let (syncer, super_cluster, tenant) = syncer_with_tenant().await;
        tenant.put(&tenant_pod("p1", "nginx:1"));
        assert!(syncer_test::eventually(|| {
            syncer.mc.get("c1", Some("default"), "p1").unwrap().is_some()
        })
        .await);
        syncer.reconcile(request("p1")).await.unwrap();
        assert!(super_cluster.get_obj::<Pod>(Some("c1-default"), "p1").is_some());

        tenant.remove::<Pod>(Some("default"), "p1");
        assert!(syncer_test::eventually(|| {
            syncer.mc.get("c1", Some("default"), "p1").unwrap().is_none()
        })
        .await);
        syncer.reconcile(request("p1")).await.unwrap();
        assert!(super_cluster.get_obj::<Pod>(Some("c1-default"), "p1").is_none());
        // second delete attempt: both sides absent, still no error
        syncer.reconcile(request("p1")).await.unwrap();
    }

    #[tokio::test]
    async fn uid_mismatch_is_a_terminal_integrity_error() {
        let (syncer, super_cluster, tenant) = syncer_with_tenant().await;
        tenant.put(&tenant_pod("p1", "nginx:1"));
        assert!(syncer_test::eventually(|| {
            syncer.mc.get("c1", Some("default"), "p1").unwrap().is_some()
        })
        .await);
        syncer.reconcile(request("p1")).await.unwrap();

        // tenant pod recreated out-of-band: live UID no longer matches the
        // mapping stored on the super pod
        tenant.remove::<Pod>(Some("default"), "p1");
        tenant.put(&tenant_pod("p1", "nginx:1"));
        assert!(syncer_test::eventually(|| {
            let cached = syncer.mc.get("c1", Some("default"), "p1").unwrap();
            let stored: Option<Pod> = super_cluster.get_obj(Some("c1-default"), "p1");
            match (cached, stored) {
                (Some(v), Some(p)) => p.annotation(LABEL_UID) != Some(v.uid()),
                _ => false,
            }
        })
        .await);

        let err = syncer.reconcile(request("p1")).await.unwrap_err();
        assert!(err.is_terminal());
    }
}
