use quarks_statefulset::quarks::controller::guard::VOLUME_CLAIM_TEMPLATES_WARNING;
use quarks_statefulset::quarks::controller::runtime::ReconcileOutcome;
use quarks_statefulset::quarks::k8s::event::Event;
use quarks_statefulset::quarks::k8s::ownership::controller_of;
use quarks_statefulset::quarks::k8s::persistentvolumeclaim::PersistentVolumeClaim;
use quarks_statefulset::quarks::k8s::quarksstatefulset::{
    LABEL_POD_ORDINAL, LABEL_QUARKS_STATEFULSET_NAME,
};
use quarks_statefulset::quarks::test_support::{Harness, QuarksStatefulSetBuilder, NAMESPACE};

const NAME: &str = "db";

fn claim_source(harness: &Harness, pod: &str) -> Option<String> {
    harness
        .pod(pod)
        .spec
        .volumes
        .iter()
        .find(|volume| volume.name == "data")
        .and_then(|volume| volume.persistent_volume_claim.as_ref())
        .map(|claim| claim.claim_name.clone())
}

fn warning_count(harness: &Harness) -> usize {
    harness
        .cluster
        .objects::<Event>()
        .iter()
        .filter(|event| {
            event.reason.as_deref() == Some(VOLUME_CLAIM_TEMPLATES_WARNING)
                && event.event_type.as_deref() == Some("Warning")
        })
        .count()
}

#[tokio::test]
async fn scenario_shared_claims_are_created_per_ordinal() {
    let harness = Harness::new();
    harness
        .create(
            &QuarksStatefulSetBuilder::new(NAME, 2)
                .claim_template("data", "1Gi")
                .build(),
        )
        .await;

    harness.reconcile(NAME).await;

    assert_eq!(harness.claim_names(), vec!["data-db-0", "data-db-1"]);
    let claim = harness
        .cluster
        .object::<PersistentVolumeClaim>(NAMESPACE, "data-db-1")
        .expect("claim");
    assert_eq!(claim.storage_request(), Some("1Gi"));
    assert_eq!(claim.metadata.label(LABEL_QUARKS_STATEFULSET_NAME), Some(NAME));
    assert_eq!(claim.metadata.label(LABEL_POD_ORDINAL), Some("1"));
    let owner = controller_of(&claim.metadata).expect("controller reference");
    assert_eq!(owner.kind, "QuarksStatefulSet");
    assert_eq!(owner.name, NAME);
}

#[tokio::test]
async fn scenario_pods_of_every_version_mount_the_same_claim() {
    let harness = Harness::new();
    harness
        .create(
            &QuarksStatefulSetBuilder::new(NAME, 2)
                .claim_template("data", "1Gi")
                .build(),
        )
        .await;
    harness.settle(NAME, 2).await;
    assert_eq!(claim_source(&harness, "db-v1-1").as_deref(), Some("data-db-1"));

    harness
        .edit(NAME, |qsts| {
            qsts.spec.template.spec.template.spec.containers[0].image =
                Some("busybox:1.37".to_string());
        })
        .await;
    harness.settle(NAME, 4).await;

    assert_eq!(harness.statefulset_names(), vec!["db-v2"]);
    assert_eq!(claim_source(&harness, "db-v2-0").as_deref(), Some("data-db-0"));
    assert_eq!(claim_source(&harness, "db-v2-1").as_deref(), Some("data-db-1"));
    assert_eq!(harness.claim_names(), vec!["data-db-0", "data-db-1"]);
}

#[tokio::test]
async fn scenario_scaling_up_adds_claims_for_new_ordinals() {
    let harness = Harness::new();
    harness
        .create(
            &QuarksStatefulSetBuilder::new(NAME, 1)
                .claim_template("data", "1Gi")
                .inject_replicas_env(false)
                .build(),
        )
        .await;
    harness.settle(NAME, 2).await;

    harness
        .edit(NAME, |qsts| qsts.spec.template.spec.replicas = Some(3))
        .await;
    harness.settle(NAME, 2).await;

    assert_eq!(
        harness.claim_names(),
        vec!["data-db-0", "data-db-1", "data-db-2"]
    );
    assert_eq!(claim_source(&harness, "db-v1-2").as_deref(), Some("data-db-2"));
}

#[tokio::test]
async fn scenario_claim_template_change_is_kept_back_without_a_new_version() {
    let harness = Harness::new();
    harness
        .create(
            &QuarksStatefulSetBuilder::new(NAME, 1)
                .claim_template("data", "1Gi")
                .build(),
        )
        .await;
    harness.settle(NAME, 2).await;
    let pod_uid = harness.pod("db-v1-0").metadata.uid;

    harness
        .edit(NAME, |qsts| {
            let claim = &mut qsts.spec.template.spec.volume_claim_templates[0];
            if let Some(resources) = claim.spec.resources.as_mut() {
                resources
                    .requests
                    .insert("storage".to_string(), "5Gi".to_string());
            }
        })
        .await;
    assert_eq!(harness.reconcile(NAME).await, ReconcileOutcome::Done);
    assert_eq!(harness.reconcile(NAME).await, ReconcileOutcome::Done);

    let sets = harness.statefulsets();
    assert_eq!(harness.statefulset_names(), vec!["db-v1"]);
    assert_eq!(
        sets[0].spec.volume_claim_templates[0].storage_request(),
        Some("1Gi")
    );
    assert_eq!(warning_count(&harness), 1);
    assert_eq!(harness.pod("db-v1-0").metadata.uid, pod_uid);

    // A later template change rolls a version with the kept templates and
    // does not repeat the warning.
    harness
        .edit(NAME, |qsts| {
            qsts.spec.template.spec.template.spec.containers[0].image =
                Some("busybox:1.37".to_string());
        })
        .await;
    harness.reconcile(NAME).await;

    let sets = harness.statefulsets();
    assert_eq!(harness.statefulset_names(), vec!["db-v1", "db-v2"]);
    assert_eq!(
        sets[1].spec.volume_claim_templates[0].storage_request(),
        Some("1Gi")
    );
    assert_eq!(warning_count(&harness), 1);
}

#[tokio::test]
async fn scenario_removed_claim_template_is_retained() {
    let harness = Harness::new();
    harness
        .create(
            &QuarksStatefulSetBuilder::new(NAME, 2)
                .claim_template("data", "1Gi")
                .build(),
        )
        .await;
    harness.settle(NAME, 2).await;

    harness
        .edit(NAME, |qsts| qsts.spec.template.spec.volume_claim_templates = vec![])
        .await;
    let first = harness.reconcile(NAME).await;
    let second = harness.reconcile(NAME).await;

    assert_ne!(first, ReconcileOutcome::Retry);
    assert_ne!(second, ReconcileOutcome::Retry);
    assert_eq!(warning_count(&harness), 1);
    assert_eq!(harness.statefulset_names(), vec!["db-v1"]);
    let kept: Vec<String> = harness.statefulsets()[0]
        .spec
        .volume_claim_templates
        .iter()
        .map(|claim| claim.metadata.name_or_empty().to_string())
        .collect();
    assert_eq!(kept, vec!["data"]);
    assert_eq!(harness.claim_names(), vec!["data-db-0", "data-db-1"]);
    assert_eq!(claim_source(&harness, "db-v1-1").as_deref(), Some("data-db-1"));
}
