//! Upward pod reconciliation: super-observed placement, status and deletion
//! back into the owning tenant.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use tracing::{debug, warn};

use syncer_core::constants::MINIMUM_GRACE_PERIOD_SECONDS;
use syncer_core::conversion::equality::{check_uw_object_meta, check_uw_pod_status};
use syncer_core::conversion::{build_virtual_node, tenant_owner};
use syncer_core::meta::ObjectExt;
use syncer_core::{ClusterClient, DeleteOptions, SyncError};

use syncer_runtime::reconciler::UpwardReconciler;
use syncer_runtime::reflector::ObjectKey;
use syncer_runtime::uwcontroller::UwsRequest;

use super::PodSyncer;

#[async_trait]
impl UpwardReconciler for PodSyncer {
    async fn back_populate(&self, request: &UwsRequest) -> Result<(), SyncError> {
        let super_ns = request.namespace.as_deref().unwrap_or_default();
        let Some(super_pod) = self
            .super_pods
            .get(&ObjectKey::new(Some(super_ns), &request.name))
        else {
            // gone from the super side; the tenant-side cleanup belongs to
            // the downward path
            return Ok(());
        };
        let Some(owner) = tenant_owner(&*super_pod) else {
            debug!(%request, "dropping super pod without ownership mapping");
            return Ok(());
        };
        let Some(tenant_ns) = owner.namespace.as_deref() else {
            warn!(%request, "super pod mapping lacks a tenant namespace, dropping");
            return Ok(());
        };

        let tenant_pod = match self.mc.get(&owner.cluster, Some(tenant_ns), &request.name) {
            Ok(Some(pod)) => pod,
            // mirrored object not declared (yet, or anymore): nothing to
            // populate into
            Ok(None) => return Ok(()),
            // the tenant went away underneath us; its keys die with it
            Err(SyncError::ClusterNotRegistered(_)) => return Ok(()),
            Err(err) => return Err(err),
        };

        // a stale mapping is a broken invariant, not a race to paper over
        if owner.uid.as_deref() != Some(tenant_pod.uid()) {
            return Err(SyncError::Integrity(format!(
                "super pod {super_ns}/{} maps uid {:?} but tenant pod has uid {}",
                request.name,
                owner.uid,
                tenant_pod.uid(),
            )));
        }

        let tenant_client = match self.mc.tenant_client(&owner.cluster) {
            Ok(client) => client,
            Err(_) => return Ok(()),
        };
        let api = tenant_client.pods();

        let super_node = super_pod.spec.as_ref().and_then(|s| s.node_name.as_deref());
        let tenant_node = tenant_pod.spec.as_ref().and_then(|s| s.node_name.as_deref());
        let mut live = (*tenant_pod).clone();
        match (tenant_node, super_node) {
            (None, Some(node)) => {
                self.bind_pod_to_node(&owner.cluster, tenant_client.as_ref(), &tenant_pod, node)
                    .await?;
                live = match api.get(Some(tenant_ns), &request.name).await {
                    Ok(pod) => pod,
                    Err(err) if err.is_not_found() => return Ok(()),
                    Err(err) => return Err(err.into()),
                };
            }
            (Some(node), _) => {
                // the virtual node should exist whenever a pod references it
                if let Some(nodes) = self.tenant_node_store(&owner.cluster) {
                    if nodes.is_ready() && nodes.get(&ObjectKey::new(None, node)).is_none() {
                        warn!(
                            %request, cluster = %owner.cluster, node,
                            "tenant pod is bound to a virtual node that does not exist"
                        );
                    }
                }
            }
            (None, None) => {}
        }

        // metadata and status are checked independently; the second write is
        // based on a fresh read so it never reverts the first
        if let Some(meta) = check_uw_object_meta(&super_pod.metadata, &live.metadata) {
            let mut updated = live.clone();
            updated.metadata = meta;
            live = api.update(&updated).await?;
        }
        if check_uw_pod_status(&super_pod, &live).is_some() {
            let mut fresh = match api.get(Some(tenant_ns), &request.name).await {
                Ok(pod) => pod,
                Err(err) if err.is_not_found() => return Ok(()),
                Err(err) => return Err(err.into()),
            };
            if let Some(status) = check_uw_pod_status(&super_pod, &fresh) {
                fresh.status = Some(status);
                live = api.update_status(&fresh).await?;
            } else {
                live = fresh;
            }
        }

        // the super side is the source of truth for deletion completion
        if super_pod.is_terminating() {
            if !live.is_terminating() {
                let grace = live
                    .spec
                    .as_ref()
                    .and_then(|s| s.termination_grace_period_seconds)
                    .unwrap_or(MINIMUM_GRACE_PERIOD_SECONDS);
                debug!(%request, grace, "propagating super-side deletion into tenant");
                match api
                    .delete(Some(tenant_ns), &request.name, &DeleteOptions::grace(grace))
                    .await
                {
                    Ok(()) => {}
                    Err(err) if err.is_not_found() => {}
                    Err(err) => return Err(err.into()),
                }
            } else if live.metadata.deletion_grace_period_seconds
                != super_pod.metadata.deletion_grace_period_seconds
            {
                if let Some(grace) = super_pod.metadata.deletion_grace_period_seconds {
                    debug!(%request, grace, "aligning tenant deletion grace period");
                    let opts = DeleteOptions {
                        grace_period_seconds: Some(grace),
                        preconditions_uid: Some(live.uid().to_string()),
                    };
                    match api.delete(Some(tenant_ns), &request.name, &opts).await {
                        Ok(()) => {}
                        Err(err) if err.is_not_found() => {}
                        Err(err) => return Err(err.into()),
                    }
                    if let Some(node) = live.spec.as_ref().and_then(|s| s.node_name.as_deref()) {
                        self.vnodes.record_release(&owner.cluster, node, live.uid());
                    }
                }
            }
        }

        Ok(())
    }
}

impl PodSyncer {
    /// Bind a tenant pod to the virtual node mirroring the super node it was
    /// placed on.
    ///
    /// Two-phase against the GC sweep: the node is reserved out of the
    /// quiescing set first (failing retryably if a sweep is mid-deletion),
    /// then the virtual node is created if the tenant does not have it, then
    /// the pod is bound. The map lock is never held across any of the I/O.
    pub(super) async fn bind_pod_to_node(
        &self,
        cluster: &str,
        tenant_client: &dyn ClusterClient,
        tenant_pod: &Pod,
        node: &str,
    ) -> Result<(), SyncError> {
        let super_node = self.super_client.nodes().get(None, node).await?;

        if !self.vnodes.reserve(cluster, node) {
            return Err(SyncError::BindConflict {
                cluster: cluster.to_string(),
                node: node.to_string(),
            });
        }

        let cached = self
            .tenant_node_store(cluster)
            .and_then(|nodes| nodes.get(&ObjectKey::new(None, node)));
        if cached.is_none() {
            let virtual_node = build_virtual_node(&super_node);
            match tenant_client.nodes().create(&virtual_node).await {
                Ok(_) => debug!(cluster, node, "created virtual node"),
                Err(err) if err.is_already_exists() => {}
                Err(err) => return Err(err.into()),
            }
        }

        let mut bound = tenant_pod.clone();
        bound.spec.get_or_insert_with(Default::default).node_name = Some(node.to_string());
        tenant_client.pods().update(&bound).await?;
        self.vnodes.record_bind(cluster, node, tenant_pod.uid());
        debug!(cluster, node, pod = %ObjectKey::from_obj(tenant_pod), "bound tenant pod");
        Ok(())
    }
}
