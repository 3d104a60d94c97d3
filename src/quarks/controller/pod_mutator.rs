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

//! Admission-time pod mutation: points claim volumes at the shared,
//! version-independent PVCs and stamps ordinal and zone labels.

use serde_json::{json, Value};

use crate::quarks::controller::versions::shared_claim_name;
use crate::quarks::controller::zones::{global_ordinal, pod_name_ordinal};
use crate::quarks::k8s::pod::Pod;
use crate::quarks::k8s::quarksstatefulset::{
    ANNOTATION_ZONES, LABEL_AZ_INDEX, LABEL_AZ_NAME, LABEL_POD_ORDINAL,
    LABEL_QUARKS_STATEFULSET_NAME,
};

fn zones_of(pod: &Pod) -> Vec<String> {
    pod.metadata
        .annotation(ANNOTATION_ZONES)
        .and_then(|raw| serde_json::from_str::<Vec<String>>(raw).ok())
        .unwrap_or_default()
}

/// Returns the mutated pod, or `None` when the pod is not managed by a
/// QuarksStatefulSet or already matches.
pub fn mutate(pod: &Pod) -> Option<Pod> {
    let qsts_name = pod.metadata.label(LABEL_QUARKS_STATEFULSET_NAME)?;
    let pod_name = pod.metadata.name.as_deref().filter(|name| !name.is_empty())?;
    let local = pod_name_ordinal(pod_name)?;

    let zones = zones_of(pod);
    let zone = pod
        .metadata
        .label(LABEL_AZ_INDEX)
        .and_then(|value| value.parse::<usize>().ok())
        .filter(|index| *index < zones.len());
    let ordinal = match zone {
        Some(index) => global_ordinal(local, zones.len(), index),
        None => local,
    };

    let mut mutated = pod.clone();
    let labels = &mut mutated.metadata.labels;
    labels.insert(LABEL_POD_ORDINAL.to_string(), ordinal.to_string());
    if let Some(index) = zone {
        labels.insert(LABEL_AZ_NAME.to_string(), zones[index].clone());
    }

    for volume in &mut mutated.spec.volumes {
        let Some(claim) = volume.persistent_volume_claim.as_mut() else {
            continue;
        };
        // The StatefulSet controller names claims `<template>-<pod>`.
        if claim.claim_name == format!("{}-{}", volume.name, pod_name) {
            claim.claim_name = shared_claim_name(&volume.name, qsts_name, ordinal);
        }
    }

    (mutated != *pod).then_some(mutated)
}

/// JSON patch turning `original` into `mutated`. Labels and volumes are
/// replaced wholesale.
pub fn json_patch(original: &Pod, mutated: &Pod) -> Vec<Value> {
    let mut operations = Vec::new();
    if original.metadata.labels != mutated.metadata.labels {
        operations.push(json!({
            "op": "add",
            "path": "/metadata/labels",
            "value": mutated.metadata.labels,
        }));
    }
    if original.spec.volumes != mutated.spec.volumes {
        operations.push(json!({
            "op": "add",
            "path": "/spec/volumes",
            "value": mutated.spec.volumes,
        }));
    }
    operations
}
