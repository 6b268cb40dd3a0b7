//! The composition root end to end: registry, plugin enablement, tenant
//! lifecycle fan-out, shutdown drain.

use std::time::Duration;

use k8s_openapi::api::core::v1::{Container, Pod, PodSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

use syncer_core::{ClusterClient, ObjectApi};
use syncer_resources::default_registry;
use syncer_runtime::plugin::InitContext;
use syncer_runtime::{Syncer, SyncerConfig};
use syncer_test::{eventually, TestCluster};

fn tenant_pod(name: &str) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some(name.into()),
            namespace: Some("ns".into()),
            ..ObjectMeta::default()
        },
        spec: Some(PodSpec {
            containers: vec![Container {
                name: "main".into(),
                image: Some("redis:7".into()),
                ..Container::default()
            }],
            ..PodSpec::default()
        }),
        ..Pod::default()
    }
}

#[tokio::test]
async fn full_syncer_lifecycle() {
    let super_cluster = TestCluster::new();
    let tenant = TestCluster::new();
    let ctx = InitContext {
        config: SyncerConfig {
            patrol_period: Duration::from_secs(3600),
            ..SyncerConfig::default()
        },
        super_client: super_cluster.client(),
    };

    let registry = default_registry();
    let mut syncer = Syncer::new(&registry, &ctx).unwrap();
    syncer.start();

    syncer.register_tenant("c1", tenant.client()).await.unwrap();
    tenant.pods().create(&tenant_pod("p1")).await.unwrap();
    assert!(
        eventually(|| super_cluster.get_obj::<Pod>(Some("c1-ns"), "p1").is_some()).await,
        "the pod plugin should mirror the tenant pod"
    );

    // decommissioning drains and forgets the tenant; later tenant-side
    // changes no longer reach the super cluster
    syncer.unregister_tenant("c1").await.unwrap();
    tenant.pods().create(&tenant_pod("p2")).await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(super_cluster.get_obj::<Pod>(Some("c1-ns"), "p2").is_none());

    syncer.shutdown().await;
}

#[tokio::test]
async fn disabled_plugins_are_not_built() {
    let super_cluster = TestCluster::new();
    let ctx = InitContext {
        config: SyncerConfig {
            disable: vec!["pod".into(), "storageclass".into()],
            ..SyncerConfig::default()
        },
        super_client: super_cluster.client(),
    };
    let registry = default_registry();
    let built = registry.build(&ctx).unwrap();
    assert!(built.is_empty(), "ingress and crd are opt-in, the rest disabled");

    let ctx = InitContext {
        config: SyncerConfig {
            enable: vec!["ingress".into(), "crd".into()],
            ..SyncerConfig::default()
        },
        super_client: super_cluster.client(),
    };
    let built = registry.build(&ctx).unwrap();
    let names: Vec<_> = built.iter().map(|s| s.name()).collect();
    assert_eq!(names, vec!["pod", "storageclass", "ingress", "crd"]);
}
