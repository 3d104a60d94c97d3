use std::time::Duration;

use quarks_statefulset::quarks::controller::runtime::ReconcileOutcome;
use quarks_statefulset::quarks::k8s::client::{ClusterError, ResourceKind};
use quarks_statefulset::quarks::k8s::event::Event;
use quarks_statefulset::quarks::k8s::memory::Verb;
use quarks_statefulset::quarks::k8s::quarksstatefulset::{
    ANNOTATION_VERSION, ENV_REPLICAS, LABEL_AZ_NAME, LABEL_POD_ORDINAL, LABEL_VERSION,
};
use quarks_statefulset::quarks::k8s::statefulset::StatefulSet;
use quarks_statefulset::quarks::test_support::{Harness, QuarksStatefulSetBuilder, CONTAINER};

const NAME: &str = "db";

fn replicas_env(set: &StatefulSet) -> Option<String> {
    set.spec
        .template
        .spec
        .container(CONTAINER)
        .and_then(|container| container.env.iter().find(|var| var.name == ENV_REPLICAS))
        .and_then(|var| var.value.clone())
}

#[tokio::test]
async fn scenario_first_pass_creates_version_one() {
    let harness = Harness::new();
    harness
        .create(&QuarksStatefulSetBuilder::new(NAME, 3).build())
        .await;

    assert_eq!(harness.reconcile(NAME).await, ReconcileOutcome::Done);

    let sets = harness.statefulsets();
    assert_eq!(harness.statefulset_names(), vec!["db-v1"]);
    assert_eq!(sets[0].replicas(), 3);
    assert_eq!(sets[0].metadata.annotation(ANNOTATION_VERSION), Some("1"));
    assert_eq!(replicas_env(&sets[0]).as_deref(), Some("3"));
    assert_eq!(sets[0].metadata.owner_references.len(), 1);
    assert_eq!(sets[0].metadata.owner_references[0].kind, "QuarksStatefulSet");

    let status = harness.quarks_statefulset(NAME).status.expect("status");
    assert!(!status.ready);
    assert!(status.last_reconcile.is_some());

    let events = harness.cluster.objects::<Event>();
    assert!(events
        .iter()
        .any(|event| event.reason.as_deref() == Some("VersionCreated")));
}

#[tokio::test]
async fn scenario_ready_pods_make_the_version_available() {
    let harness = Harness::new();
    harness
        .create(&QuarksStatefulSetBuilder::new(NAME, 2).build())
        .await;

    harness.settle(NAME, 2).await;

    assert!(harness.quarks_statefulset(NAME).status.expect("status").ready);
    for ordinal in 0..2 {
        let pod = harness.pod(&format!("db-v1-{}", ordinal));
        let expected = ordinal.to_string();
        assert_eq!(pod.metadata.label(LABEL_POD_ORDINAL), Some(expected.as_str()));
        assert_eq!(pod.metadata.label(LABEL_VERSION), Some("1"));
    }
}

#[tokio::test]
async fn scenario_unchanged_template_keeps_a_single_version() {
    let harness = Harness::new();
    harness
        .create(&QuarksStatefulSetBuilder::new(NAME, 2).build())
        .await;

    harness.settle(NAME, 3).await;
    let before = harness.statefulsets();
    harness.reconcile(NAME).await;

    assert_eq!(harness.statefulset_names(), vec!["db-v1"]);
    assert_eq!(
        harness.statefulsets()[0].metadata.resource_version,
        before[0].metadata.resource_version
    );
}

#[tokio::test]
async fn scenario_template_change_rolls_out_and_retires_previous_version() {
    let harness = Harness::new();
    harness
        .create(&QuarksStatefulSetBuilder::new(NAME, 2).build())
        .await;
    harness.settle(NAME, 2).await;

    harness
        .edit(NAME, |qsts| {
            qsts.spec.template.spec.template.spec.containers[0].image =
                Some("busybox:1.37".to_string());
        })
        .await;

    // The new version comes up next to the old one.
    assert_eq!(harness.reconcile(NAME).await, ReconcileOutcome::Done);
    assert_eq!(harness.statefulset_names(), vec!["db-v1", "db-v2"]);

    // Once v2 serves, v1 is scaled down while its pods drain.
    harness.simulator.sync().await.expect("sync");
    assert_eq!(
        harness.reconcile(NAME).await,
        ReconcileOutcome::RequeueAfter(Duration::from_secs(5))
    );
    let retiring = harness
        .statefulsets()
        .into_iter()
        .find(|set| set.metadata.name_or_empty() == "db-v1")
        .expect("db-v1 still present");
    assert_eq!(retiring.replicas(), 0);

    // With its pods gone, v1 is deleted.
    harness.simulator.sync().await.expect("sync");
    assert_eq!(harness.reconcile(NAME).await, ReconcileOutcome::Done);
    assert_eq!(harness.statefulset_names(), vec!["db-v2"]);
    assert!(harness
        .pods()
        .iter()
        .all(|pod| pod.metadata.label(LABEL_VERSION) == Some("2")));
}

#[tokio::test]
async fn scenario_unavailable_new_version_keeps_previous_version_running() {
    let harness = Harness::new();
    harness
        .create(&QuarksStatefulSetBuilder::new(NAME, 1).build())
        .await;
    harness.settle(NAME, 2).await;

    harness.simulator.hold("db-v2-0");
    harness
        .edit(NAME, |qsts| {
            qsts.spec.template.spec.template.spec.containers[0].image =
                Some("busybox:1.37".to_string());
        })
        .await;
    harness.settle(NAME, 3).await;

    assert_eq!(harness.statefulset_names(), vec!["db-v1", "db-v2"]);
    let v1 = &harness.statefulsets()[0];
    assert_eq!(v1.replicas(), 1);

    harness.simulator.release("db-v2-0").await.expect("release");
    harness.settle(NAME, 3).await;
    assert_eq!(harness.statefulset_names(), vec!["db-v2"]);
}

#[tokio::test]
async fn scenario_scaling_without_replicas_env_updates_in_place() {
    let harness = Harness::new();
    harness
        .create(
            &QuarksStatefulSetBuilder::new(NAME, 2)
                .inject_replicas_env(false)
                .build(),
        )
        .await;
    harness.settle(NAME, 2).await;

    harness
        .edit(NAME, |qsts| qsts.spec.template.spec.replicas = Some(4))
        .await;
    harness.reconcile(NAME).await;

    let sets = harness.statefulsets();
    assert_eq!(harness.statefulset_names(), vec!["db-v1"]);
    assert_eq!(sets[0].replicas(), 4);
    assert_eq!(replicas_env(&sets[0]), None);
}

#[tokio::test]
async fn scenario_scaling_with_replicas_env_creates_a_new_version() {
    let harness = Harness::new();
    harness
        .create(&QuarksStatefulSetBuilder::new(NAME, 2).build())
        .await;
    harness.settle(NAME, 2).await;

    harness
        .edit(NAME, |qsts| qsts.spec.template.spec.replicas = Some(3))
        .await;
    harness.reconcile(NAME).await;

    let sets = harness.statefulsets();
    assert_eq!(harness.statefulset_names(), vec!["db-v1", "db-v2"]);
    assert_eq!(replicas_env(&sets[1]).as_deref(), Some("3"));
    assert_eq!(sets[1].replicas(), 3);
}

#[tokio::test]
async fn scenario_zones_split_replicas_across_statefulsets() {
    let harness = Harness::new();
    harness
        .create(
            &QuarksStatefulSetBuilder::new(NAME, 5)
                .zones(&["z1", "z2", "z3"])
                .build(),
        )
        .await;

    harness.settle(NAME, 2).await;

    let sets = harness.statefulsets();
    assert_eq!(
        harness.statefulset_names(),
        vec!["db-z0-v1", "db-z1-v1", "db-z2-v1"]
    );
    let replicas: Vec<i32> = sets.iter().map(StatefulSet::replicas).collect();
    assert_eq!(replicas, vec![2, 2, 1]);

    // Local replica 1 in zone index 1 is global ordinal 1 * 3 + 1.
    let pod = harness.pod("db-z1-v1-1");
    assert_eq!(pod.metadata.label(LABEL_POD_ORDINAL), Some("4"));
    assert_eq!(pod.metadata.label(LABEL_AZ_NAME), Some("z2"));
    assert_eq!(harness.pods().len(), 5);
}

#[tokio::test]
async fn scenario_invalid_template_is_not_retried() {
    let harness = Harness::new();
    let mut qsts = QuarksStatefulSetBuilder::new(NAME, 1).build();
    qsts.spec.template.spec.template.spec.containers.clear();
    harness.create(&qsts).await;

    assert_eq!(harness.reconcile(NAME).await, ReconcileOutcome::Done);
    assert!(harness.statefulsets().is_empty());
    let status = harness.quarks_statefulset(NAME).status.expect("status");
    assert!(status.last_reconcile.is_some());
    assert!(!status.ready);
}

#[tokio::test]
async fn scenario_write_conflicts_are_retried_within_the_pass() {
    let harness = Harness::new();
    harness
        .create(&QuarksStatefulSetBuilder::new(NAME, 1).build())
        .await;
    harness.cluster.inject_fault(
        ResourceKind::StatefulSet,
        Verb::Create,
        ClusterError::Conflict {
            kind: ResourceKind::StatefulSet,
            name: "db-v1".to_string(),
            message: "the object has been modified".to_string(),
        },
        2,
    );

    assert_eq!(harness.reconcile(NAME).await, ReconcileOutcome::Done);
    assert_eq!(harness.statefulset_names(), vec!["db-v1"]);
    assert_eq!(
        harness
            .cluster
            .call_count(ResourceKind::StatefulSet, Verb::Create),
        3
    );
}

#[tokio::test]
async fn scenario_transient_errors_request_a_retry() {
    let harness = Harness::new();
    harness
        .create(&QuarksStatefulSetBuilder::new(NAME, 1).build())
        .await;
    harness.cluster.inject_fault(
        ResourceKind::StatefulSet,
        Verb::List,
        ClusterError::Transient {
            message: "connection reset".to_string(),
        },
        1,
    );

    assert_eq!(harness.reconcile(NAME).await, ReconcileOutcome::Retry);
    assert!(harness.statefulsets().is_empty());
    assert_eq!(harness.reconcile(NAME).await, ReconcileOutcome::Done);
    assert_eq!(harness.statefulset_names(), vec!["db-v1"]);
}

#[tokio::test]
async fn scenario_missing_quarks_statefulset_is_done() {
    let harness = Harness::new();
    assert_eq!(harness.reconcile("absent").await, ReconcileOutcome::Done);
    assert!(harness.statefulsets().is_empty());
}
