/*
 * Copyright (C) 2024 The Quarks StatefulSet Authors
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 * http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

//! Polling informer. Each tick lists the watched kinds, diffs them against the
//! previous snapshot, and queues the QuarksStatefulSets affected by a change.

use std::collections::{BTreeSet, HashMap};
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;

use crate::quarks::controller::runtime::{ControllerTarget, WorkQueue};
use crate::quarks::k8s::client::{Api, ClusterClient, ClusterError, Resource, Selector};
use crate::quarks::k8s::configmap::ConfigMap;
use crate::quarks::k8s::pod::{ObjectMeta, Pod};
use crate::quarks::k8s::quarksstatefulset::{QuarksStatefulSet, LABEL_QUARKS_STATEFULSET_NAME};
use crate::quarks::k8s::reference::{referenced_configs, ReferencedConfigs};
use crate::quarks::k8s::secret::Secret;
use crate::quarks::k8s::statefulset::StatefulSet;
use crate::quarks::logger::{log_debug, log_warn};
use crate::quarks::observability::metrics;

const COMPONENT: &str = "watch";
const BACKOFF_INITIAL: Duration = Duration::from_millis(200);
const BACKOFF_MAX: Duration = Duration::from_secs(10);

#[derive(Clone, Debug)]
pub struct WatchSettings {
    /// `None` watches every namespace.
    pub namespace: Option<String>,
    pub poll_interval: Duration,
    pub resync_interval: Duration,
}

type ObjectKey = (String, String);

fn key_of(metadata: &ObjectMeta) -> ObjectKey {
    (
        metadata.namespace_or_default().to_string(),
        metadata.name_or_empty().to_string(),
    )
}

#[derive(Clone, Debug, PartialEq)]
struct TrackedQuarksStatefulSet {
    fingerprint: String,
    update_on_config_change: bool,
    refs: ReferencedConfigs,
}

/// Snapshot of what the previous poll saw.
#[derive(Default)]
pub struct Poller {
    qsts: HashMap<ObjectKey, TrackedQuarksStatefulSet>,
    /// Owned StatefulSets and Pods: resource version and owning QuarksStatefulSet.
    children: HashMap<(&'static str, ObjectKey), (String, String)>,
    config_maps: HashMap<ObjectKey, String>,
    secrets: HashMap<ObjectKey, String>,
}

/// Keys whose value changed, appeared, or disappeared between snapshots.
fn changed_keys<K, V>(previous: &HashMap<K, V>, next: &HashMap<K, V>) -> Vec<K>
where
    K: Clone + Eq + Hash,
    V: PartialEq,
{
    let mut keys: Vec<K> = next
        .iter()
        .filter(|(key, value)| previous.get(*key) != Some(*value))
        .map(|(key, _)| key.clone())
        .collect();
    keys.extend(
        previous
            .keys()
            .filter(|key| !next.contains_key(*key))
            .cloned(),
    );
    keys
}

fn api<K: Resource>(client: &Arc<dyn ClusterClient>, namespace: Option<&str>) -> Api<K> {
    match namespace {
        Some(namespace) => Api::namespaced(Arc::clone(client), namespace),
        None => Api::all(Arc::clone(client)),
    }
}

fn resource_version(metadata: &ObjectMeta) -> String {
    metadata.resource_version.clone().unwrap_or_default()
}

impl Poller {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every QuarksStatefulSet seen by the last poll.
    pub fn known_targets(&self) -> Vec<ControllerTarget> {
        let mut targets: Vec<ControllerTarget> = self
            .qsts
            .keys()
            .map(|(namespace, name)| ControllerTarget::new(namespace, name))
            .collect();
        targets.sort();
        targets
    }

    /// Lists the watched kinds and returns the targets affected since the
    /// previous call. The first call reports every QuarksStatefulSet.
    pub async fn poll(
        &mut self,
        client: &Arc<dyn ClusterClient>,
        namespace: Option<&str>,
    ) -> Result<Vec<ControllerTarget>, ClusterError> {
        let everything = Selector::new();
        let mut targets: BTreeSet<ControllerTarget> = BTreeSet::new();

        let mut qsts = HashMap::new();
        for object in api::<QuarksStatefulSet>(client, namespace)
            .list(&everything)
            .await?
        {
            let fingerprint = serde_json::to_string(&object.spec)?
                + object.metadata.deletion_timestamp.as_deref().unwrap_or("");
            qsts.insert(
                key_of(&object.metadata),
                TrackedQuarksStatefulSet {
                    fingerprint,
                    update_on_config_change: object.spec.update_on_config_change,
                    refs: referenced_configs(&object.spec.template.spec.template.spec),
                },
            );
        }
        for (namespace, name) in changed_keys(&self.qsts, &qsts) {
            targets.insert(ControllerTarget::new(&namespace, &name));
        }
        self.qsts = qsts;

        let mut children = HashMap::new();
        for object in api::<StatefulSet>(client, namespace).list(&everything).await? {
            track_child(&mut children, "StatefulSet", &object.metadata);
        }
        for object in api::<Pod>(client, namespace).list(&everything).await? {
            track_child(&mut children, "Pod", &object.metadata);
        }
        for key in changed_keys(&self.children, &children) {
            let owner = children.get(&key).or_else(|| self.children.get(&key));
            if let Some((_, owner)) = owner {
                targets.insert(ControllerTarget::new(&key.1 .0, owner));
            }
        }
        self.children = children;

        if self.qsts.values().any(|tracked| tracked.update_on_config_change) {
            let config_maps: HashMap<ObjectKey, String> = api::<ConfigMap>(client, namespace)
                .list(&everything)
                .await?
                .iter()
                .map(|object| (key_of(&object.metadata), resource_version(&object.metadata)))
                .collect();
            let secrets: HashMap<ObjectKey, String> = api::<Secret>(client, namespace)
                .list(&everything)
                .await?
                .iter()
                .map(|object| (key_of(&object.metadata), resource_version(&object.metadata)))
                .collect();
            for (config_namespace, config_name) in changed_keys(&self.config_maps, &config_maps) {
                targets.extend(self.referencing(&config_namespace, |refs| {
                    refs.references_config_map(&config_name)
                }));
            }
            for (secret_namespace, secret_name) in changed_keys(&self.secrets, &secrets) {
                targets.extend(self.referencing(&secret_namespace, |refs| {
                    refs.references_secret(&secret_name)
                }));
            }
            self.config_maps = config_maps;
            self.secrets = secrets;
        } else {
            self.config_maps.clear();
            self.secrets.clear();
        }

        Ok(targets.into_iter().collect())
    }

    fn referencing<F>(&self, namespace: &str, matches: F) -> Vec<ControllerTarget>
    where
        F: Fn(&ReferencedConfigs) -> bool,
    {
        self.qsts
            .iter()
            .filter(|((qsts_namespace, _), tracked)| {
                qsts_namespace == namespace
                    && tracked.update_on_config_change
                    && matches(&tracked.refs)
            })
            .map(|((qsts_namespace, name), _)| ControllerTarget::new(qsts_namespace, name))
            .collect()
    }
}

fn track_child(
    children: &mut HashMap<(&'static str, ObjectKey), (String, String)>,
    kind: &'static str,
    metadata: &ObjectMeta,
) {
    let Some(owner) = metadata.label(LABEL_QUARKS_STATEFULSET_NAME) else {
        return;
    };
    children.insert(
        (kind, key_of(metadata)),
        (resource_version(metadata), owner.to_string()),
    );
}

/// Polls until `shutdown` fires, queueing affected targets and resyncing
/// every known target on `resync_interval`.
pub async fn run(
    client: Arc<dyn ClusterClient>,
    queue: WorkQueue<ControllerTarget>,
    settings: WatchSettings,
    shutdown: CancellationToken,
) {
    let mut poller = Poller::new();
    let mut backoff = BACKOFF_INITIAL;
    let mut last_resync = Instant::now();
    let namespace = settings.namespace.as_deref();

    loop {
        let delay = match poller.poll(&client, namespace).await {
            Ok(targets) => {
                backoff = BACKOFF_INITIAL;
                for target in targets {
                    let target_text = target.to_string();
                    log_debug(COMPONENT, "Change observed", &[("target", target_text.as_str())]);
                    queue.add(target);
                }
                if last_resync.elapsed() >= settings.resync_interval {
                    last_resync = Instant::now();
                    for target in poller.known_targets() {
                        queue.add(target);
                    }
                }
                settings.poll_interval
            }
            Err(err) => {
                let error_text = err.to_string();
                let backoff_text = humantime::format_duration(backoff).to_string();
                log_warn(
                    COMPONENT,
                    "Failed to list watched resources",
                    &[
                        ("error", error_text.as_str()),
                        ("retry_in", backoff_text.as_str()),
                    ],
                );
                let current = backoff;
                backoff = (backoff * 2).min(BACKOFF_MAX);
                current
            }
        };
        metrics::set_work_queue_depth(queue.len());

        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = sleep(delay) => {}
        }
    }
}
