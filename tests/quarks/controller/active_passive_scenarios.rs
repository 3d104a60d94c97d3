use std::time::Duration;

use quarks_statefulset::quarks::controller::active_passive::ACTIVE_POD_ELECTED;
use quarks_statefulset::quarks::controller::probe::ProbeOutcome;
use quarks_statefulset::quarks::controller::runtime::ReconcileOutcome;
use quarks_statefulset::quarks::k8s::client::{ClusterError, ResourceKind};
use quarks_statefulset::quarks::k8s::event::Event;
use quarks_statefulset::quarks::k8s::memory::Verb;
use quarks_statefulset::quarks::k8s::quarksstatefulset::{LABEL_ACTIVE_POD, LABEL_STARTUP_ORDINAL};
use quarks_statefulset::quarks::test_support::{Harness, QuarksStatefulSetBuilder};

const NAME: &str = "ap";

fn active_pods(harness: &Harness) -> Vec<String> {
    harness
        .pods()
        .iter()
        .filter(|pod| pod.metadata.label(LABEL_ACTIVE_POD) == Some("true"))
        .map(|pod| pod.metadata.name_or_empty().to_string())
        .collect()
}

fn startup_ordinals(harness: &Harness, pods: &[&str]) -> Vec<Option<String>> {
    pods.iter()
        .map(|name| {
            harness
                .pod(name)
                .metadata
                .label(LABEL_STARTUP_ORDINAL)
                .map(str::to_string)
        })
        .collect()
}

fn ordinals(values: &[&str]) -> Vec<Option<String>> {
    values.iter().map(|value| Some(value.to_string())).collect()
}

async fn change_image(harness: &Harness) {
    harness
        .edit(NAME, |qsts| {
            qsts.spec.template.spec.template.spec.containers[0].image =
                Some("busybox:1.37".to_string());
        })
        .await;
}

/// Three replicas without the REPLICAS variable, `ap-v1-2` active.
async fn running_set_with_active_last_pod(harness: &Harness) {
    harness.probes.set("ap-v1-2", ProbeOutcome::Success);
    harness
        .create(
            &QuarksStatefulSetBuilder::new(NAME, 3)
                .active_passive(5)
                .inject_replicas_env(false)
                .build(),
        )
        .await;
    harness.settle(NAME, 2).await;
    assert_eq!(active_pods(harness), vec!["ap-v1-2"]);
    assert_eq!(
        startup_ordinals(harness, &["ap-v1-0", "ap-v1-1", "ap-v1-2"]),
        ordinals(&["0", "1", "2"])
    );
}

async fn running_set(harness: &Harness, period_seconds: i32) {
    harness
        .create(
            &QuarksStatefulSetBuilder::new(NAME, 3)
                .active_passive(period_seconds)
                .build(),
        )
        .await;
    harness.settle(NAME, 2).await;
}

#[tokio::test]
async fn scenario_first_passing_pod_becomes_active() {
    let harness = Harness::new();
    harness.probes.set("ap-v1-1", ProbeOutcome::Success);
    harness.probes.set("ap-v1-2", ProbeOutcome::Success);
    running_set(&harness, 5).await;

    assert_eq!(
        harness.reconcile(NAME).await,
        ReconcileOutcome::RequeueAfter(Duration::from_secs(5))
    );
    assert_eq!(active_pods(&harness), vec!["ap-v1-1"]);
    assert!(harness
        .cluster
        .objects::<Event>()
        .iter()
        .any(|event| event.reason.as_deref() == Some(ACTIVE_POD_ELECTED)));
}

#[tokio::test]
async fn scenario_active_label_moves_when_probe_fails() {
    let harness = Harness::new();
    harness.probes.set("ap-v1-2", ProbeOutcome::Success);
    running_set(&harness, 5).await;
    assert_eq!(active_pods(&harness), vec!["ap-v1-2"]);

    harness.probes.set("ap-v1-2", ProbeOutcome::Failure);
    harness.probes.set("ap-v1-0", ProbeOutcome::Success);
    harness.reconcile(NAME).await;

    assert_eq!(active_pods(&harness), vec!["ap-v1-0"]);
}

#[tokio::test]
async fn scenario_label_is_kept_when_no_pod_passes() {
    let harness = Harness::new();
    harness.probes.set("ap-v1-0", ProbeOutcome::Success);
    running_set(&harness, 5).await;
    assert_eq!(active_pods(&harness), vec!["ap-v1-0"]);

    harness.probes.set("ap-v1-0", ProbeOutcome::Unknown);
    harness.reconcile(NAME).await;

    assert_eq!(active_pods(&harness), vec!["ap-v1-0"]);
}

#[tokio::test]
async fn scenario_unready_pods_are_never_probed() {
    let harness = Harness::new();
    harness.probes.set_default(ProbeOutcome::Success);
    harness.simulator.hold("ap-v1-0");
    running_set(&harness, 5).await;

    assert_eq!(active_pods(&harness), vec!["ap-v1-1"]);
    harness.probes.reset_calls();
    harness.reconcile(NAME).await;
    assert!(!harness.probes.calls().iter().any(|pod| pod == "ap-v1-0"));
}

#[tokio::test]
async fn scenario_requeue_follows_shortest_probe_period() {
    let harness = Harness::new();
    running_set(&harness, 3).await;

    assert_eq!(
        harness.reconcile(NAME).await,
        ReconcileOutcome::RequeueAfter(Duration::from_secs(3))
    );
}

#[tokio::test]
async fn scenario_removing_probes_strips_the_active_label() {
    let harness = Harness::new();
    harness.probes.set("ap-v1-0", ProbeOutcome::Success);
    running_set(&harness, 5).await;
    assert_eq!(active_pods(&harness), vec!["ap-v1-0"]);

    harness
        .edit(NAME, |qsts| qsts.spec.active_passive_probes.clear())
        .await;

    assert_eq!(harness.reconcile(NAME).await, ReconcileOutcome::Done);
    assert!(active_pods(&harness).is_empty());
    assert_eq!(harness.statefulset_names(), vec!["ap-v1"]);
}

#[tokio::test]
async fn scenario_previously_active_pod_starts_first_after_rollout() {
    let harness = Harness::new();
    running_set_with_active_last_pod(&harness).await;

    change_image(&harness).await;
    harness.settle(NAME, 4).await;

    assert_eq!(
        startup_ordinals(&harness, &["ap-v2-0", "ap-v2-1", "ap-v2-2"]),
        ordinals(&["1", "2", "0"])
    );
}

#[tokio::test]
async fn scenario_rollout_order_survives_a_failed_pass() {
    let harness = Harness::new();
    running_set_with_active_last_pod(&harness).await;

    change_image(&harness).await;
    harness.cluster.inject_fault(
        ResourceKind::QuarksStatefulSet,
        Verb::Update,
        ClusterError::Transient {
            message: "connection reset".to_string(),
        },
        1,
    );
    assert_eq!(harness.reconcile(NAME).await, ReconcileOutcome::Retry);
    assert!(harness.statefulset_names().contains(&"ap-v2".to_string()));

    harness.settle(NAME, 4).await;

    assert_eq!(
        startup_ordinals(&harness, &["ap-v2-0", "ap-v2-1", "ap-v2-2"]),
        ordinals(&["1", "2", "0"])
    );
}

#[tokio::test]
async fn scenario_scale_up_keeps_existing_startup_ordinals() {
    let harness = Harness::new();
    running_set_with_active_last_pod(&harness).await;
    change_image(&harness).await;
    harness.settle(NAME, 4).await;

    harness
        .edit(NAME, |qsts| qsts.spec.template.spec.replicas = Some(5))
        .await;
    harness.settle(NAME, 2).await;

    assert_eq!(harness.statefulset_names(), vec!["ap-v2"]);
    assert_eq!(
        startup_ordinals(&harness, &["ap-v2-0", "ap-v2-1", "ap-v2-2", "ap-v2-3", "ap-v2-4"]),
        ordinals(&["1", "2", "0", "3", "4"])
    );
}
