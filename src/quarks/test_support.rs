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

//! Fixtures shared by the unit and integration suites: a QuarksStatefulSet
//! builder, a harness driving reconcile passes against the in-memory
//! cluster, a StatefulSet simulator standing in for the built-in
//! StatefulSet controller, and a scripted probe runner.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::quarks::controller::pod_mutator;
use crate::quarks::controller::probe::{ProbeFuture, ProbeOutcome, ProbeRunner};
use crate::quarks::controller::quarksstatefulset::{self, ControllerSettings};
use crate::quarks::controller::runtime::{ControllerRuntime, ControllerTarget, ReconcileOutcome};
use crate::quarks::controller::zones::pod_name_ordinal;
use crate::quarks::k8s::client::{Api, ClusterClient, ClusterError, Selector};
use crate::quarks::k8s::configmap::ConfigMap;
use crate::quarks::k8s::memory::InMemoryCluster;
use crate::quarks::k8s::ownership::{is_controlled_by, set_controller, OwnerReference};
use crate::quarks::k8s::persistentvolumeclaim::{
    PersistentVolumeClaim, PersistentVolumeClaimSpec, ResourceRequirements,
};
use crate::quarks::k8s::pod::{
    ContainerSpec, EnvFromSource, ExecAction, LocalObjectReference, ObjectMeta,
    PersistentVolumeClaimVolumeSource, Pod, PodCondition, PodSpec, PodStatus, Probe, VolumeSpec,
};
use crate::quarks::k8s::quarksstatefulset::{
    QuarksStatefulSet, QuarksStatefulSetSpec, LABEL_QUARKS_STATEFULSET_NAME,
};
use crate::quarks::k8s::secret::Secret;
use crate::quarks::k8s::statefulset::{PodTemplateSpec, StatefulSet, StatefulSetSpec};

pub const NAMESPACE: &str = "quarks-test";
pub const CONTAINER: &str = "app";

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Builds QuarksStatefulSets in [`NAMESPACE`] with a single `app` container.
pub struct QuarksStatefulSetBuilder {
    qsts: QuarksStatefulSet,
}

impl QuarksStatefulSetBuilder {
    pub fn new(name: &str, replicas: i32) -> Self {
        let container = ContainerSpec {
            name: CONTAINER.to_string(),
            image: Some("busybox:1.36".to_string()),
            ..Default::default()
        };
        let template = StatefulSet::new(
            ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            StatefulSetSpec {
                replicas: Some(replicas),
                service_name: name.to_string(),
                template: PodTemplateSpec {
                    metadata: ObjectMeta::default(),
                    spec: PodSpec {
                        containers: vec![container],
                        ..Default::default()
                    },
                },
                ..Default::default()
            },
        );
        let spec = QuarksStatefulSetSpec {
            template,
            ..Default::default()
        };
        Self {
            qsts: QuarksStatefulSet::new(ObjectMeta::named(NAMESPACE, name), spec),
        }
    }

    pub fn image(mut self, image: &str) -> Self {
        if let Some(container) = self.containers_mut().next() {
            container.image = Some(image.to_string());
        }
        self
    }

    pub fn zones(mut self, zones: &[&str]) -> Self {
        self.qsts.spec.zones = zones.iter().map(|zone| zone.to_string()).collect();
        self
    }

    pub fn claim_template(mut self, name: &str, size: &str) -> Self {
        let claim = PersistentVolumeClaim {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            spec: PersistentVolumeClaimSpec {
                access_modes: vec!["ReadWriteOnce".to_string()],
                resources: Some(ResourceRequirements {
                    requests: BTreeMap::from([("storage".to_string(), size.to_string())]),
                    ..Default::default()
                }),
                ..Default::default()
            },
            ..Default::default()
        };
        self.qsts.spec.template.spec.volume_claim_templates.push(claim);
        self
    }

    pub fn env_from_config_map(mut self, name: &str) -> Self {
        if let Some(container) = self.containers_mut().next() {
            container.env_from.push(EnvFromSource {
                config_map_ref: Some(LocalObjectReference {
                    name: name.to_string(),
                    optional: None,
                }),
                ..Default::default()
            });
        }
        self
    }

    pub fn env_from_secret(mut self, name: &str) -> Self {
        if let Some(container) = self.containers_mut().next() {
            container.env_from.push(EnvFromSource {
                secret_ref: Some(LocalObjectReference {
                    name: name.to_string(),
                    optional: None,
                }),
                ..Default::default()
            });
        }
        self
    }

    pub fn update_on_config_change(mut self) -> Self {
        self.qsts.spec.update_on_config_change = true;
        self
    }

    pub fn inject_replicas_env(mut self, inject: bool) -> Self {
        self.qsts.spec.inject_replicas_env = Some(inject);
        self
    }

    /// Adds an exec active/passive probe for the `app` container.
    pub fn active_passive(mut self, period_seconds: i32) -> Self {
        let probe = Probe {
            exec: Some(ExecAction {
                command: vec!["/bin/is-leader".to_string()],
            }),
            period_seconds: Some(period_seconds),
            ..Default::default()
        };
        self.qsts
            .spec
            .active_passive_probes
            .insert(CONTAINER.to_string(), probe);
        self
    }

    pub fn build(self) -> QuarksStatefulSet {
        self.qsts
    }

    fn containers_mut(&mut self) -> impl Iterator<Item = &mut ContainerSpec> {
        self.qsts.spec.template.spec.template.spec.containers.iter_mut()
    }
}

pub fn config_map(name: &str, data: &[(&str, &str)]) -> ConfigMap {
    let mut config_map = ConfigMap::new(ObjectMeta::named(NAMESPACE, name));
    config_map.data = data
        .iter()
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .collect();
    config_map
}

pub fn secret(name: &str, string_data: &[(&str, &str)]) -> Secret {
    let mut secret = Secret::new(ObjectMeta::named(NAMESPACE, name));
    secret.string_data = string_data
        .iter()
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .collect();
    secret
}

/// Answers probes from a per-pod script. Unscripted pods get the default.
pub struct ScriptedProbeRunner {
    outcomes: Mutex<BTreeMap<String, ProbeOutcome>>,
    default: Mutex<ProbeOutcome>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedProbeRunner {
    pub fn new(default: ProbeOutcome) -> Self {
        Self {
            outcomes: Mutex::new(BTreeMap::new()),
            default: Mutex::new(default),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn set(&self, pod: &str, outcome: ProbeOutcome) {
        lock(&self.outcomes).insert(pod.to_string(), outcome);
    }

    pub fn set_default(&self, outcome: ProbeOutcome) {
        *lock(&self.default) = outcome;
    }

    /// Pod names probed so far, in call order.
    pub fn calls(&self) -> Vec<String> {
        lock(&self.calls).clone()
    }

    pub fn reset_calls(&self) {
        lock(&self.calls).clear();
    }
}

impl ProbeRunner for ScriptedProbeRunner {
    fn run<'a>(
        &'a self,
        pod: &'a Pod,
        _container: &'a ContainerSpec,
        _probe: &'a Probe,
    ) -> ProbeFuture<'a> {
        let name = pod.metadata.name_or_empty().to_string();
        let outcome = lock(&self.outcomes)
            .get(&name)
            .copied()
            .unwrap_or(*lock(&self.default));
        lock(&self.calls).push(name);
        Box::pin(async move { outcome })
    }
}

/// Stands in for the built-in StatefulSet controller: creates the pods a
/// StatefulSet asks for, passes them through the pod mutator like the
/// admission webhook would, and reports them running and ready.
pub struct StatefulSetSimulator {
    client: Arc<dyn ClusterClient>,
    namespace: String,
    held: Mutex<BTreeSet<String>>,
    next_ip: Mutex<u32>,
}

impl StatefulSetSimulator {
    pub fn new(client: Arc<dyn ClusterClient>, namespace: &str) -> Self {
        Self {
            client,
            namespace: namespace.to_string(),
            held: Mutex::new(BTreeSet::new()),
            next_ip: Mutex::new(1),
        }
    }

    /// Pods created while held stay unready until [`Self::release`].
    pub fn hold(&self, pod: &str) {
        lock(&self.held).insert(pod.to_string());
    }

    pub async fn release(&self, pod: &str) -> Result<(), ClusterError> {
        lock(&self.held).remove(pod);
        self.set_ready(pod, true).await
    }

    pub async fn set_ready(&self, pod: &str, ready: bool) -> Result<(), ClusterError> {
        let api = Api::<Pod>::namespaced(Arc::clone(&self.client), &self.namespace);
        let Some(mut current) = api.get(pod).await? else {
            return Ok(());
        };
        let ip = current
            .pod_ip()
            .map(str::to_string)
            .unwrap_or_else(|| self.allocate_ip());
        current.status = Some(pod_status(ready, &ip));
        api.update_status(&current).await?;
        Ok(())
    }

    fn allocate_ip(&self) -> String {
        let mut next = lock(&self.next_ip);
        let ip = format!("10.244.{}.{}", *next / 250, *next % 250 + 1);
        *next += 1;
        ip
    }

    /// Converges pods and StatefulSet status on the current StatefulSets.
    pub async fn sync(&self) -> Result<(), ClusterError> {
        let statefulsets = Api::<StatefulSet>::namespaced(Arc::clone(&self.client), &self.namespace);
        let pods_api = Api::<Pod>::namespaced(Arc::clone(&self.client), &self.namespace);
        let everything = Selector::new();

        let sets = statefulsets.list(&everything).await?;
        let mut pods: Vec<Pod> = pods_api.list(&everything).await?;

        for pod in &pods {
            let orphaned = !sets
                .iter()
                .any(|set| is_controlled_by(&pod.metadata, "StatefulSet", &set.metadata));
            let managed = pod.metadata.label(LABEL_QUARKS_STATEFULSET_NAME).is_some();
            if orphaned && managed {
                pods_api.delete(pod.metadata.name_or_empty(), None).await?;
            }
        }
        pods.retain(|pod| {
            sets.iter()
                .any(|set| is_controlled_by(&pod.metadata, "StatefulSet", &set.metadata))
        });

        for set in &sets {
            let set_name = set.metadata.name_or_empty();
            let replicas = set.replicas() as u32;
            let owned: Vec<&Pod> = pods
                .iter()
                .filter(|pod| is_controlled_by(&pod.metadata, "StatefulSet", &set.metadata))
                .collect();

            let mut ready = 0;
            for pod in &owned {
                let ordinal = pod_name_ordinal(pod.metadata.name_or_empty()).unwrap_or(u32::MAX);
                if ordinal >= replicas {
                    pods_api.delete(pod.metadata.name_or_empty(), None).await?;
                } else if pod.is_serving() {
                    ready += 1;
                }
            }

            for ordinal in 0..replicas {
                let pod_name = format!("{}-{}", set_name, ordinal);
                if owned
                    .iter()
                    .any(|pod| pod.metadata.name_or_empty() == pod_name)
                {
                    continue;
                }
                let created = pods_api.create(&self.materialize(set, &pod_name)).await?;
                if !lock(&self.held).contains(&pod_name) {
                    let mut running = created;
                    running.status = Some(pod_status(true, &self.allocate_ip()));
                    pods_api.update_status(&running).await?;
                    ready += 1;
                }
            }

            let mut updated = set.clone();
            let mut status = updated.status.take().unwrap_or_default();
            status.replicas = replicas as i32;
            status.ready_replicas = Some(ready);
            status.current_replicas = Some(replicas as i32);
            updated.status = Some(status);
            if updated.status != set.status {
                statefulsets.update_status(&updated).await?;
            }
        }
        Ok(())
    }

    fn materialize(&self, set: &StatefulSet, pod_name: &str) -> Pod {
        let template = &set.spec.template;
        let mut metadata = ObjectMeta::named(&self.namespace, pod_name);
        metadata.labels = template.metadata.labels.clone();
        metadata.annotations = template.metadata.annotations.clone();
        set_controller(
            &mut metadata,
            OwnerReference::controller_of("apps/v1", "StatefulSet", &set.metadata),
        );

        let mut spec = template.spec.clone();
        for claim in &set.spec.volume_claim_templates {
            let claim_template = claim.metadata.name_or_empty();
            let source = PersistentVolumeClaimVolumeSource {
                claim_name: format!("{}-{}", claim_template, pod_name),
                read_only: None,
            };
            match spec
                .volumes
                .iter_mut()
                .find(|volume| volume.name == claim_template)
            {
                Some(volume) => volume.persistent_volume_claim = Some(source),
                None => spec.volumes.push(VolumeSpec {
                    name: claim_template.to_string(),
                    persistent_volume_claim: Some(source),
                    ..Default::default()
                }),
            }
        }

        let pod = Pod::new(metadata, spec);
        pod_mutator::mutate(&pod).unwrap_or(pod)
    }
}

fn pod_status(ready: bool, ip: &str) -> PodStatus {
    PodStatus {
        phase: Some("Running".to_string()),
        pod_ip: Some(ip.to_string()),
        conditions: vec![PodCondition {
            condition_type: "Ready".to_string(),
            status: if ready { "True" } else { "False" }.to_string(),
            last_transition_time: None,
        }],
        ..Default::default()
    }
}

/// An in-memory cluster with the controller's dependencies registered.
pub struct Harness {
    pub cluster: Arc<InMemoryCluster>,
    pub client: Arc<dyn ClusterClient>,
    pub runtime: Arc<ControllerRuntime>,
    pub probes: Arc<ScriptedProbeRunner>,
    pub simulator: StatefulSetSimulator,
}

impl Harness {
    pub fn new() -> Self {
        let cluster = Arc::new(InMemoryCluster::new());
        let client: Arc<dyn ClusterClient> = cluster.clone();
        let runtime = ControllerRuntime::new();
        let probes = Arc::new(ScriptedProbeRunner::new(ProbeOutcome::Failure));
        quarksstatefulset::register_dependencies(
            &runtime,
            Arc::clone(&client),
            probes.clone(),
            ControllerSettings::default(),
        );
        let simulator = StatefulSetSimulator::new(Arc::clone(&client), NAMESPACE);
        Self {
            cluster,
            client,
            runtime,
            probes,
            simulator,
        }
    }

    pub async fn create(&self, qsts: &QuarksStatefulSet) -> QuarksStatefulSet {
        Api::<QuarksStatefulSet>::namespaced(Arc::clone(&self.client), NAMESPACE)
            .create(qsts)
            .await
            .expect("create QuarksStatefulSet")
    }

    /// Replaces the stored spec with `change` applied to the latest copy.
    pub async fn edit<F>(&self, name: &str, change: F) -> QuarksStatefulSet
    where
        F: FnOnce(&mut QuarksStatefulSet),
    {
        let api = Api::<QuarksStatefulSet>::namespaced(Arc::clone(&self.client), NAMESPACE);
        let mut qsts = api.get(name).await.expect("get").expect("QuarksStatefulSet exists");
        change(&mut qsts);
        api.update(&qsts).await.expect("update QuarksStatefulSet")
    }

    pub async fn reconcile(&self, name: &str) -> ReconcileOutcome {
        quarksstatefulset::handle(&self.runtime, ControllerTarget::new(NAMESPACE, name)).await
    }

    /// Alternates reconcile passes and simulator syncs `rounds` times and
    /// returns the last outcome.
    pub async fn settle(&self, name: &str, rounds: usize) -> ReconcileOutcome {
        let mut outcome = ReconcileOutcome::Done;
        for _ in 0..rounds {
            outcome = self.reconcile(name).await;
            self.simulator.sync().await.expect("simulator sync");
        }
        self.reconcile(name).await;
        outcome
    }

    pub fn quarks_statefulset(&self, name: &str) -> QuarksStatefulSet {
        self.cluster
            .object::<QuarksStatefulSet>(NAMESPACE, name)
            .expect("QuarksStatefulSet exists")
    }

    pub fn statefulsets(&self) -> Vec<StatefulSet> {
        self.cluster.objects::<StatefulSet>()
    }

    pub fn statefulset_names(&self) -> Vec<String> {
        self.statefulsets()
            .iter()
            .map(|set| set.metadata.name_or_empty().to_string())
            .collect()
    }

    pub fn pods(&self) -> Vec<Pod> {
        self.cluster.objects::<Pod>()
    }

    pub fn pod(&self, name: &str) -> Pod {
        self.cluster.object::<Pod>(NAMESPACE, name).expect("pod exists")
    }

    pub fn claim_names(&self) -> Vec<String> {
        self.cluster
            .objects::<PersistentVolumeClaim>()
            .iter()
            .map(|claim| claim.metadata.name_or_empty().to_string())
            .collect()
    }
}

impl Default for Harness {
    fn default() -> Self {
        Self::new()
    }
}
