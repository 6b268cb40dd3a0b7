//! Patrol as the drift-correction backstop: out-of-band super-side damage is
//! repaired on the next pass, identically to what the reactive path would
//! have produced.

use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::core::v1::{Container, Pod, PodSpec};
use k8s_openapi::api::storage::v1::StorageClass;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

use syncer_core::constants::{LABEL_CLUSTER, LABEL_NAMESPACE, PUBLIC_OBJECT_KEY};
use syncer_core::meta::ObjectExt;
use syncer_core::{ClusterClient, ObjectApi};
use syncer_resources::pod::PodSyncer;
use syncer_resources::storageclass::StorageClassSyncer;
use syncer_runtime::plugin::{InitContext, ResourceSyncer};
use syncer_runtime::SyncerConfig;
use syncer_test::{eventually, TestCluster};
use tokio_util::sync::CancellationToken;

fn fast_patrol_ctx(super_cluster: &TestCluster) -> InitContext {
    InitContext {
        config: SyncerConfig {
            patrol_period: Duration::from_millis(100),
            ..SyncerConfig::default()
        },
        super_client: super_cluster.client(),
    }
}

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
                image: Some("nginx:1".into()),
                ..Container::default()
            }],
            ..PodSpec::default()
        }),
        ..Pod::default()
    }
}

#[tokio::test]
async fn patrol_recreates_out_of_band_deleted_super_pod() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let super_cluster = TestCluster::new();
    let tenant = TestCluster::new();
    let syncer = PodSyncer::new(&fast_patrol_ctx(&super_cluster));
    let shutdown = CancellationToken::new();
    let handles = Arc::clone(&syncer).start(shutdown.clone());
    syncer.register_tenant("c1", tenant.client()).await.unwrap();

    tenant.pods().create(&tenant_pod("p1")).await.unwrap();
    assert!(
        eventually(|| super_cluster.get_obj::<Pod>(Some("c1-ns"), "p1").is_some()).await
    );
    let reactive: Pod = super_cluster.get_obj(Some("c1-ns"), "p1").unwrap();

    // somebody deletes the mirror straight on the super cluster
    super_cluster.remove::<Pod>(Some("c1-ns"), "p1");
    assert!(super_cluster.get_obj::<Pod>(Some("c1-ns"), "p1").is_none());

    assert!(
        eventually(|| super_cluster.get_obj::<Pod>(Some("c1-ns"), "p1").is_some()).await,
        "patrol should recreate the super pod"
    );
    let repaired: Pod = super_cluster.get_obj(Some("c1-ns"), "p1").unwrap();
    // identical to the reactive result, identity fields aside
    assert_eq!(repaired.annotation(LABEL_CLUSTER), reactive.annotation(LABEL_CLUSTER));
    assert_eq!(
        repaired.annotation(LABEL_NAMESPACE),
        reactive.annotation(LABEL_NAMESPACE)
    );
    assert_eq!(repaired.spec, reactive.spec);

    shutdown.cancel();
    for handle in handles {
        let _ = handle.await;
    }
}

#[tokio::test]
async fn public_storage_classes_propagate_and_track_the_source() {
    let super_cluster = TestCluster::new();
    let tenant = TestCluster::new();
    let syncer = StorageClassSyncer::new(&fast_patrol_ctx(&super_cluster));
    let shutdown = CancellationToken::new();
    let handles = Arc::clone(&syncer).start(shutdown.clone());

    let public_sc = StorageClass {
        metadata: ObjectMeta {
            name: Some("fast".into()),
            labels: Some([(PUBLIC_OBJECT_KEY.to_string(), "true".to_string())].into()),
            ..ObjectMeta::default()
        },
        provisioner: "csi.example.com".into(),
        ..StorageClass::default()
    };
    super_cluster.put(&public_sc);

    syncer.register_tenant("c1", tenant.client()).await.unwrap();
    assert!(
        eventually(|| tenant.get_obj::<StorageClass>(None, "fast").is_some()).await,
        "a late-joining tenant receives the public set"
    );
    let copy: StorageClass = tenant.get_obj(None, "fast").unwrap();
    assert_eq!(copy.annotation(LABEL_CLUSTER), Some("c1"));
    assert_eq!(copy.provisioner, "csi.example.com");

    // drift on the tenant copy is realigned
    let mut drifted = copy.clone();
    drifted.allow_volume_expansion = Some(true);
    tenant.put(&drifted);
    assert!(
        eventually(|| {
            tenant
                .get_obj::<StorageClass>(None, "fast")
                .map(|sc| sc.allow_volume_expansion.is_none())
                .unwrap_or(false)
        })
        .await,
        "the super source wins over tenant-side drift"
    );

    // unpublishing removes the propagated copy
    let mut private = super_cluster.get_obj::<StorageClass>(None, "fast").unwrap();
    private.metadata.labels = None;
    super_cluster.put(&private);
    assert!(
        eventually(|| tenant.get_obj::<StorageClass>(None, "fast").is_none()).await,
        "unpublished class should leave the tenant"
    );

    shutdown.cancel();
    for handle in handles {
        let _ = handle.await;
    }
}
