use std::sync::Arc;

use quarks_statefulset::quarks::controller::runtime::ReconcileOutcome;
use quarks_statefulset::quarks::k8s::client::Api;
use quarks_statefulset::quarks::k8s::configmap::ConfigMap;
use quarks_statefulset::quarks::k8s::quarksstatefulset::ANNOTATION_CONFIG_SHA1;
use quarks_statefulset::quarks::k8s::secret::Secret;
use quarks_statefulset::quarks::test_support::{
    config_map, secret, Harness, QuarksStatefulSetBuilder, NAMESPACE,
};

const NAME: &str = "db";

async fn update_config_map(harness: &Harness, name: &str, key: &str, value: &str) {
    let api = Api::<ConfigMap>::namespaced(Arc::clone(&harness.client), NAMESPACE);
    let mut current = api.get(name).await.expect("get").expect("config map");
    current.data.insert(key.to_string(), value.to_string());
    api.update(&current).await.expect("update config map");
}

fn config_sha1(harness: &Harness, index: usize) -> Option<String> {
    harness.statefulsets()[index]
        .spec
        .template
        .metadata
        .annotation(ANNOTATION_CONFIG_SHA1)
        .map(str::to_string)
}

#[tokio::test]
async fn scenario_config_map_change_rolls_out_new_version() {
    let harness = Harness::new();
    Api::<ConfigMap>::namespaced(Arc::clone(&harness.client), NAMESPACE)
        .create(&config_map("settings", &[("mode", "primary")]))
        .await
        .expect("create config map");
    harness
        .create(
            &QuarksStatefulSetBuilder::new(NAME, 1)
                .env_from_config_map("settings")
                .update_on_config_change()
                .build(),
        )
        .await;
    harness.settle(NAME, 2).await;
    assert_eq!(harness.statefulset_names(), vec!["db-v1"]);
    let first = config_sha1(&harness, 0).expect("config digest annotation");

    update_config_map(&harness, "settings", "mode", "replica").await;
    harness.reconcile(NAME).await;

    assert_eq!(harness.statefulset_names(), vec!["db-v1", "db-v2"]);
    let second = config_sha1(&harness, 1).expect("config digest annotation");
    assert_ne!(first, second);
}

#[tokio::test]
async fn scenario_secret_change_rolls_out_new_version() {
    let harness = Harness::new();
    Api::<Secret>::namespaced(Arc::clone(&harness.client), NAMESPACE)
        .create(&secret("credentials", &[("password", "one")]))
        .await
        .expect("create secret");
    harness
        .create(
            &QuarksStatefulSetBuilder::new(NAME, 1)
                .env_from_secret("credentials")
                .update_on_config_change()
                .build(),
        )
        .await;
    harness.settle(NAME, 2).await;

    let api = Api::<Secret>::namespaced(Arc::clone(&harness.client), NAMESPACE);
    let mut current = api.get("credentials").await.expect("get").expect("secret");
    current
        .string_data
        .insert("password".to_string(), "two".to_string());
    api.update(&current).await.expect("update secret");
    harness.reconcile(NAME).await;

    assert_eq!(harness.statefulset_names(), vec!["db-v1", "db-v2"]);
}

#[tokio::test]
async fn scenario_config_changes_are_ignored_without_opt_in() {
    let harness = Harness::new();
    Api::<ConfigMap>::namespaced(Arc::clone(&harness.client), NAMESPACE)
        .create(&config_map("settings", &[("mode", "primary")]))
        .await
        .expect("create config map");
    harness
        .create(
            &QuarksStatefulSetBuilder::new(NAME, 1)
                .env_from_config_map("settings")
                .build(),
        )
        .await;
    harness.settle(NAME, 2).await;
    assert_eq!(config_sha1(&harness, 0), None);

    update_config_map(&harness, "settings", "mode", "replica").await;
    harness.reconcile(NAME).await;

    assert_eq!(harness.statefulset_names(), vec!["db-v1"]);
}

#[tokio::test]
async fn scenario_missing_config_map_is_retried() {
    let harness = Harness::new();
    harness
        .create(
            &QuarksStatefulSetBuilder::new(NAME, 1)
                .env_from_config_map("settings")
                .update_on_config_change()
                .build(),
        )
        .await;

    assert_eq!(harness.reconcile(NAME).await, ReconcileOutcome::Retry);
    assert!(harness.statefulsets().is_empty());

    Api::<ConfigMap>::namespaced(Arc::clone(&harness.client), NAMESPACE)
        .create(&config_map("settings", &[("mode", "primary")]))
        .await
        .expect("create config map");
    assert_eq!(harness.reconcile(NAME).await, ReconcileOutcome::Done);
    assert_eq!(harness.statefulset_names(), vec!["db-v1"]);
}
