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

//! Volume claim templates of a StatefulSet are immutable. A changed set of
//! templates is never pushed to the API server; the previous version's
//! templates are carried forward and the user is warned instead.

use crate::quarks::k8s::persistentvolumeclaim::PersistentVolumeClaim;
use crate::quarks::k8s::statefulset::StatefulSet;
use std::collections::BTreeMap;

pub const VOLUME_CLAIM_TEMPLATES_WARNING: &str = "VolumeClaimTemplatesWarning";
pub const VOLUME_CLAIM_TEMPLATES_MESSAGE: &str = "Change in VolumeClaimTemplates QuarksStatefulSet won't be performed in sts as it's not supported by Kubernetes";

const DEFAULT_VOLUME_MODE: &str = "Filesystem";

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GuardDecision {
    /// Templates are unchanged (or there is nothing to compare against).
    Apply,
    /// Templates differ; the previous ones were kept.
    KeptPrevious,
}

/// Comparable projection of a claim template: the fields the API server
/// would reject a change to, with defaults filled in.
#[derive(Debug, PartialEq, Eq)]
struct ClaimShape {
    access_modes: Vec<String>,
    storage_class_name: Option<String>,
    volume_mode: String,
    requests: BTreeMap<String, String>,
}

fn shapes(templates: &[PersistentVolumeClaim]) -> BTreeMap<String, ClaimShape> {
    templates
        .iter()
        .map(|template| {
            let mut access_modes = template.spec.access_modes.clone();
            access_modes.sort();
            access_modes.dedup();
            let shape = ClaimShape {
                access_modes,
                storage_class_name: template.spec.storage_class_name.clone(),
                volume_mode: template
                    .spec
                    .volume_mode
                    .clone()
                    .unwrap_or_else(|| DEFAULT_VOLUME_MODE.to_string()),
                requests: template
                    .spec
                    .resources
                    .as_ref()
                    .map(|resources| resources.requests.clone())
                    .unwrap_or_default(),
            };
            (template.metadata.name_or_empty().to_string(), shape)
        })
        .collect()
}

pub fn claim_templates_differ(
    previous: &[PersistentVolumeClaim],
    desired: &[PersistentVolumeClaim],
) -> bool {
    shapes(previous) != shapes(desired)
}

/// Keeps `previous`'s claim templates on every StatefulSet of `group` when
/// they differ from the desired ones.
pub fn guard_claim_templates(
    previous: Option<&StatefulSet>,
    group: &mut [StatefulSet],
) -> GuardDecision {
    let Some(previous) = previous else {
        return GuardDecision::Apply;
    };
    let kept = &previous.spec.volume_claim_templates;
    let mut decision = GuardDecision::Apply;
    for statefulset in group.iter_mut() {
        if claim_templates_differ(kept, &statefulset.spec.volume_claim_templates) {
            statefulset.spec.volume_claim_templates = kept.clone();
            decision = GuardDecision::KeptPrevious;
        }
    }
    decision
}
