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

//! Active/passive election: exactly one serving pod of a QuarksStatefulSet
//! carries the active label at a time.

use std::collections::BTreeMap;
use std::time::Duration;

use crate::quarks::controller::probe::{evaluate, ProbeOutcome, ProbeRunner};
use crate::quarks::controller::zones::pod_name_ordinal;
use crate::quarks::k8s::pod::{Pod, Probe};
use crate::quarks::k8s::quarksstatefulset::{LABEL_ACTIVE_POD, LABEL_POD_ORDINAL, LABEL_VERSION};

pub const ACTIVE_POD_ELECTED: &str = "ActivePodElected";
const ACTIVE_VALUE: &str = "true";
const DEFAULT_PERIOD: Duration = Duration::from_secs(10);

pub fn is_active(pod: &Pod) -> bool {
    pod.metadata.label(LABEL_ACTIVE_POD) == Some(ACTIVE_VALUE)
}

/// Global pod ordinal from the ordinal label, falling back to the name suffix.
pub fn pod_ordinal(pod: &Pod) -> Option<u32> {
    pod.metadata
        .label(LABEL_POD_ORDINAL)
        .and_then(|value| value.parse::<u32>().ok())
        .or_else(|| pod_name_ordinal(pod.metadata.name_or_empty()))
}

pub fn pod_version(pod: &Pod) -> u32 {
    pod.metadata
        .label(LABEL_VERSION)
        .and_then(|value| value.parse::<u32>().ok())
        .unwrap_or(0)
}

/// Serving pods ordered by pod ordinal, newer versions first on ties.
pub fn candidates(pods: &[Pod]) -> Vec<&Pod> {
    let mut serving: Vec<&Pod> = pods.iter().filter(|pod| pod.is_serving()).collect();
    serving.sort_by(|left, right| {
        let left_key = (pod_ordinal(left).unwrap_or(u32::MAX), std::cmp::Reverse(pod_version(left)));
        let right_key = (
            pod_ordinal(right).unwrap_or(u32::MAX),
            std::cmp::Reverse(pod_version(right)),
        );
        left_key
            .cmp(&right_key)
            .then_with(|| left.metadata.name_or_empty().cmp(right.metadata.name_or_empty()))
    });
    serving
}

/// True when every probe whose container exists in the pod succeeds and at
/// least one was evaluated.
pub async fn pod_passes(
    runner: &dyn ProbeRunner,
    pod: &Pod,
    probes: &BTreeMap<String, Probe>,
) -> bool {
    let mut evaluated = 0usize;
    for (container_name, probe) in probes {
        let Some(container) = pod.spec.container(container_name) else {
            continue;
        };
        evaluated += 1;
        if evaluate(runner, pod, container, probe).await != ProbeOutcome::Success {
            return false;
        }
    }
    evaluated > 0
}

/// Name of the first candidate whose probes pass.
pub async fn elect(
    runner: &dyn ProbeRunner,
    pods: &[Pod],
    probes: &BTreeMap<String, Probe>,
) -> Option<String> {
    for pod in candidates(pods) {
        if pod_passes(runner, pod, probes).await {
            return Some(pod.metadata.name_or_empty().to_string());
        }
    }
    None
}

/// Pods whose active label must change so that only `elected` carries it.
pub fn label_changes(pods: &[Pod], elected: &str) -> Vec<Pod> {
    pods.iter()
        .filter_map(|pod| {
            let should_be_active = pod.metadata.name_or_empty() == elected;
            if should_be_active == is_active(pod) {
                return None;
            }
            let mut updated = pod.clone();
            if should_be_active {
                updated
                    .metadata
                    .labels
                    .insert(LABEL_ACTIVE_POD.to_string(), ACTIVE_VALUE.to_string());
            } else {
                updated.metadata.labels.remove(LABEL_ACTIVE_POD);
            }
            Some(updated)
        })
        .collect()
}

/// Pods still carrying a stale active label, with the label removed.
pub fn strip_active_labels(pods: &[Pod]) -> Vec<Pod> {
    pods.iter()
        .filter(|pod| pod.metadata.labels.contains_key(LABEL_ACTIVE_POD))
        .map(|pod| {
            let mut updated = pod.clone();
            updated.metadata.labels.remove(LABEL_ACTIVE_POD);
            updated
        })
        .collect()
}

/// Ordinal of the pod currently labeled active, if any.
pub fn active_ordinal(pods: &[Pod]) -> Option<u32> {
    pods.iter()
        .filter(|pod| is_active(pod) && !pod.is_terminating())
        .find_map(pod_ordinal)
}

/// Smallest configured `periodSeconds`, default ten seconds.
pub fn requeue_interval(probes: &BTreeMap<String, Probe>) -> Duration {
    probes
        .values()
        .filter_map(|probe| probe.period_seconds)
        .filter(|seconds| *seconds > 0)
        .min()
        .map(|seconds| Duration::from_secs(seconds as u64))
        .unwrap_or(DEFAULT_PERIOD)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quarks::controller::probe::ProbeFuture;
    use crate::quarks::k8s::pod::{
        ContainerSpec, ExecAction, ObjectMeta, PodCondition, PodSpec, PodStatus,
    };

    struct PassingPods(Vec<&'static str>);

    impl ProbeRunner for PassingPods {
        fn run<'a>(&'a self, pod: &'a Pod, _: &'a ContainerSpec, _: &'a Probe) -> ProbeFuture<'a> {
            let passes = self
                .0
                .iter()
                .any(|name| *name == pod.metadata.name_or_empty());
            Box::pin(async move {
                if passes {
                    ProbeOutcome::Success
                } else {
                    ProbeOutcome::Failure
                }
            })
        }
    }

    fn pod(name: &str, ordinal: u32, version: u32, ready: bool) -> Pod {
        let mut metadata = ObjectMeta::named("demo", name);
        metadata
            .labels
            .insert(LABEL_POD_ORDINAL.to_string(), ordinal.to_string());
        metadata
            .labels
            .insert(LABEL_VERSION.to_string(), version.to_string());
        let mut pod = Pod::new(
            metadata,
            PodSpec {
                containers: vec![ContainerSpec {
                    name: "app".to_string(),
                    ..Default::default()
                }],
                ..Default::default()
            },
        );
        pod.status = Some(PodStatus {
            phase: Some("Running".to_string()),
            conditions: vec![PodCondition {
                condition_type: "Ready".to_string(),
                status: if ready { "True" } else { "False" }.to_string(),
                last_transition_time: None,
            }],
            ..Default::default()
        });
        pod
    }

    fn probes() -> BTreeMap<String, Probe> {
        BTreeMap::from([(
            "app".to_string(),
            Probe {
                exec: Some(ExecAction {
                    command: vec!["is-leader".to_string()],
                }),
                period_seconds: Some(3),
                ..Default::default()
            },
        )])
    }

    #[test]
    fn candidates_prefer_low_ordinal_then_new_version() {
        let pods = vec![
            pod("web-v1-1", 1, 1, true),
            pod("web-v1-0", 0, 1, true),
            pod("web-v2-0", 0, 2, true),
            pod("web-v2-1", 1, 2, false),
        ];
        let names: Vec<&str> = candidates(&pods)
            .into_iter()
            .map(|pod| pod.metadata.name_or_empty())
            .collect();
        assert_eq!(names, vec!["web-v2-0", "web-v1-0", "web-v1-1"]);
    }

    #[tokio::test]
    async fn first_passing_candidate_wins() {
        let pods = vec![pod("web-v1-0", 0, 1, true), pod("web-v1-1", 1, 1, true)];
        let runner = PassingPods(vec!["web-v1-1"]);
        assert_eq!(elect(&runner, &pods, &probes()).await.as_deref(), Some("web-v1-1"));

        let nobody = PassingPods(Vec::new());
        assert_eq!(elect(&nobody, &pods, &probes()).await, None);
    }

    #[tokio::test]
    async fn probes_for_absent_containers_do_not_count() {
        let pods = vec![pod("web-v1-0", 0, 1, true)];
        let runner = PassingPods(vec!["web-v1-0"]);
        let mut elsewhere = probes();
        let probe = elsewhere.remove("app").expect("probe");
        elsewhere.insert("sidecar".to_string(), probe);
        assert_eq!(elect(&runner, &pods, &elsewhere).await, None);
    }

    #[test]
    fn label_changes_move_the_flag() {
        let mut old_leader = pod("web-v1-0", 0, 1, true);
        old_leader
            .metadata
            .labels
            .insert(LABEL_ACTIVE_POD.to_string(), "true".to_string());
        let pods = vec![old_leader, pod("web-v1-1", 1, 1, true)];

        let changes = label_changes(&pods, "web-v1-1");
        assert_eq!(changes.len(), 2);
        assert!(!is_active(&changes[0]));
        assert!(is_active(&changes[1]));
        assert_eq!(active_ordinal(&pods), Some(0));

        assert!(label_changes(&pods, "web-v1-0").is_empty());
        assert_eq!(strip_active_labels(&pods).len(), 1);
    }

    #[test]
    fn requeue_uses_smallest_period() {
        assert_eq!(requeue_interval(&probes()), Duration::from_secs(3));
        assert_eq!(requeue_interval(&BTreeMap::new()), Duration::from_secs(10));
    }
}
