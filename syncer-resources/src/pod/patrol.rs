//! The pod patrol pass: drift correction and virtual-node GC.

use ahash::{AHashMap, AHashSet};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use tracing::{debug, warn};

use syncer_core::conversion::equality::{check_dw_pod, check_uw_object_meta, check_uw_pod_status};
use syncer_core::conversion::tenant_owner;
use syncer_core::meta::ObjectExt;
use syncer_core::DeleteOptions;

use syncer_runtime::reconciler::{EventType, PatrolReconciler, Request};
use syncer_runtime::uwcontroller::UwsRequest;

use super::PodSyncer;

type SuperKey = (String, String, String);

#[async_trait]
impl PatrolReconciler for PodSyncer {
    async fn patrol_once(&self) {
        if !self.super_pods.is_ready() {
            return;
        }

        // index the super side by tenant identity
        let mut super_index: AHashMap<SuperKey, std::sync::Arc<Pod>> = AHashMap::new();
        for super_pod in self.super_pods.state() {
            let Some(owner) = tenant_owner(&*super_pod) else {
                continue;
            };
            let Some(tenant_ns) = owner.namespace else {
                continue;
            };
            super_index.insert(
                (owner.cluster, tenant_ns, super_pod.name().to_string()),
                super_pod,
            );
        }

        for cluster in self.mc.cluster_names() {
            if !self.mc.cluster_synced(&cluster) {
                continue;
            }
            let Ok(tenant_pods) = self.mc.list_cluster(&cluster) else {
                continue;
            };

            let mut live_bindings: AHashMap<String, AHashSet<String>> = AHashMap::new();
            for tenant_pod in tenant_pods {
                let tenant_ns = tenant_pod.namespace().unwrap_or_default().to_string();
                if let Some(node) = tenant_pod.spec.as_ref().and_then(|s| s.node_name.as_deref()) {
                    live_bindings
                        .entry(node.to_string())
                        .or_default()
                        .insert(tenant_pod.uid().to_string());
                }

                let key = (
                    cluster.clone(),
                    tenant_ns.clone(),
                    tenant_pod.name().to_string(),
                );
                let request = Request {
                    cluster: cluster.clone(),
                    namespace: Some(tenant_ns),
                    name: tenant_pod.name().to_string(),
                    uid: Some(tenant_pod.uid().to_string()),
                    event: EventType::Add,
                };
                match super_index.remove(&key) {
                    None => {
                        // no super counterpart: the downward path recreates
                        // it exactly as a reactive reconcile would
                        debug!(%request, "patrol found tenant pod without super counterpart");
                        self.mc.enqueue(request);
                    }
                    Some(super_pod) => {
                        if check_dw_pod(&tenant_pod, &super_pod).is_some()
                            || (tenant_pod.is_terminating() && !super_pod.is_terminating())
                        {
                            debug!(%request, "patrol found downward drift");
                            self.mc.enqueue(request);
                        }
                        if needs_upward_pass(&super_pod, &tenant_pod) {
                            self.uw.enqueue(UwsRequest {
                                cluster: None,
                                namespace: super_pod.namespace().map(str::to_string),
                                name: super_pod.name().to_string(),
                            });
                        }
                    }
                }
            }

            // rebuild the vnode reference map from observed state, then
            // advance the GC state machine
            self.vnodes.retain_cluster(&cluster, &live_bindings);
            let Ok(tenant_client) = self.mc.tenant_client(&cluster) else {
                continue;
            };
            for node in self.vnodes.begin_sweep(&cluster) {
                let deleted = match tenant_client
                    .nodes()
                    .delete(None, &node, &DeleteOptions::default())
                    .await
                {
                    Ok(()) => true,
                    Err(err) if err.is_not_found() => true,
                    Err(err) => {
                        warn!(cluster = %cluster, node = %node, %err, "virtual node GC delete failed");
                        false
                    }
                };
                self.vnodes.finish_sweep(&cluster, &node, deleted);
            }
        }

        // whatever is left on the super side has no tenant counterpart:
        // orphaned mirrors the downward path should remove
        for ((cluster, tenant_ns, name), super_pod) in super_index {
            let request = Request {
                uid: tenant_owner(&*super_pod).and_then(|o| o.uid),
                cluster,
                namespace: Some(tenant_ns),
                name,
                event: EventType::Delete,
            };
            if self.mc.cluster_synced(&request.cluster) {
                debug!(%request, "patrol found orphaned super pod");
                self.mc.enqueue(request);
            }
        }
    }
}

fn needs_upward_pass(super_pod: &Pod, tenant_pod: &Pod) -> bool {
    let super_node = super_pod.spec.as_ref().and_then(|s| s.node_name.as_deref());
    let tenant_node = tenant_pod.spec.as_ref().and_then(|s| s.node_name.as_deref());
    (tenant_node.is_none() && super_node.is_some())
        || super_pod.is_terminating()
        || check_uw_pod_status(super_pod, tenant_pod).is_some()
        || check_uw_object_meta(&super_pod.metadata, &tenant_pod.metadata).is_some()
}
