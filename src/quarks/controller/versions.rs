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

//! Version manager: renders the desired StatefulSet, detects template changes
//! through a content hash, and plans creation, in-place updates, and
//! retirement of versioned StatefulSets.

use std::collections::{BTreeMap, BTreeSet};
use std::slice;

use serde::Serialize;
use sha1::{Digest, Sha1};

use crate::quarks::controller::guard::{
    claim_templates_differ, guard_claim_templates, GuardDecision,
};
use crate::quarks::controller::quarksstatefulset::QuarksStatefulSetError;
use crate::quarks::controller::zones::{apply_zone, global_ordinal, pod_name_ordinal, zone_index};
use crate::quarks::k8s::configmap::ConfigMap;
use crate::quarks::k8s::ownership::{is_controlled_by, set_controller, OwnerReference};
use crate::quarks::k8s::persistentvolumeclaim::PersistentVolumeClaim;
use crate::quarks::k8s::pod::{ObjectMeta, Pod};
use crate::quarks::k8s::quarksstatefulset::{
    get_max_available_version, QuarksStatefulSet, ANNOTATION_CLAIM_TEMPLATES_HASH,
    ANNOTATION_CONFIG_SHA1, ANNOTATION_TEMPLATE_HASH, ANNOTATION_VERSION, API_VERSION, ENV_REPLICAS, KIND,
    LABEL_AZ_INDEX, LABEL_AZ_NAME, LABEL_POD_ORDINAL, LABEL_QUARKS_STATEFULSET_NAME,
    LABEL_STARTUP_ORDINAL, LABEL_STATEFULSET_NAME, LABEL_VERSION,
};
use crate::quarks::k8s::reference::ReferencedConfigs;
use crate::quarks::k8s::secret::Secret;
use crate::quarks::k8s::statefulset::{PodTemplateSpec, StatefulSet};

pub const VERSION_CREATED: &str = "VersionCreated";

/// The StatefulSets that make up one version: one, or one per zone.
#[derive(Clone, Debug, PartialEq)]
pub struct VersionGroup {
    pub version: u32,
    pub template_hash: Option<String>,
    pub statefulsets: Vec<StatefulSet>,
}

impl VersionGroup {
    pub fn first(&self) -> Option<&StatefulSet> {
        self.statefulsets.first()
    }
}

pub fn version_of(statefulset: &StatefulSet) -> Option<u32> {
    statefulset
        .metadata
        .annotation(ANNOTATION_VERSION)
        .or_else(|| statefulset.metadata.label(LABEL_VERSION))
        .and_then(|value| value.parse::<u32>().ok())
}

pub fn statefulset_name(qsts_name: &str, zone: Option<usize>, version: u32) -> String {
    match zone {
        Some(index) => format!("{}-z{}-v{}", qsts_name, index, version),
        None => format!("{}-v{}", qsts_name, version),
    }
}

/// Shared, version-independent claim backing `template` for `ordinal`.
pub fn shared_claim_name(template: &str, qsts_name: &str, ordinal: u32) -> String {
    format!("{}-{}-{}", template, qsts_name, ordinal)
}

/// Groups the StatefulSets controlled by `qsts` by version.
pub fn group_versions(
    qsts: &QuarksStatefulSet,
    statefulsets: &[StatefulSet],
) -> BTreeMap<u32, VersionGroup> {
    let mut versions: BTreeMap<u32, VersionGroup> = BTreeMap::new();
    for statefulset in statefulsets {
        if !is_controlled_by(&statefulset.metadata, KIND, &qsts.metadata) {
            continue;
        }
        let Some(version) = version_of(statefulset) else {
            continue;
        };
        let group = versions.entry(version).or_insert_with(|| VersionGroup {
            version,
            template_hash: None,
            statefulsets: Vec::new(),
        });
        if group.template_hash.is_none() {
            group.template_hash = statefulset
                .metadata
                .annotation(ANNOTATION_TEMPLATE_HASH)
                .map(str::to_string);
        }
        group.statefulsets.push(statefulset.clone());
    }
    for group in versions.values_mut() {
        group
            .statefulsets
            .sort_by(|left, right| left.metadata.name.cmp(&right.metadata.name));
    }
    versions
}

/// SHA-1 over the content of every referenced ConfigMap and Secret, in name
/// order. A missing reference not marked optional is an error.
pub fn config_digest(
    refs: &ReferencedConfigs,
    config_maps: &BTreeMap<String, ConfigMap>,
    secrets: &BTreeMap<String, Secret>,
) -> Result<String, QuarksStatefulSetError> {
    let mut hasher = Sha1::new();
    for (name, optional) in &refs.config_maps {
        match config_maps.get(name) {
            Some(config_map) => feed_entries(&mut hasher, "configmap", name, &config_map.entries()),
            None if *optional => {}
            None => {
                return Err(QuarksStatefulSetError::MissingDependency(format!(
                    "ConfigMap '{}'",
                    name
                )))
            }
        }
    }
    for (name, optional) in &refs.secrets {
        match secrets.get(name) {
            Some(secret) => feed_entries(&mut hasher, "secret", name, &secret.entries()),
            None if *optional => {}
            None => {
                return Err(QuarksStatefulSetError::MissingDependency(format!(
                    "Secret '{}'",
                    name
                )))
            }
        }
    }
    Ok(hex::encode(hasher.finalize()))
}

fn feed_entries(hasher: &mut Sha1, kind: &str, name: &str, entries: &BTreeMap<String, Vec<u8>>) {
    hasher.update(kind.as_bytes());
    hasher.update([0u8]);
    hasher.update(name.as_bytes());
    hasher.update([0u8]);
    for (key, value) in entries {
        hasher.update(key.as_bytes());
        hasher.update([0u8]);
        hasher.update((value.len() as u64).to_be_bytes());
        hasher.update(value);
    }
}

/// Desired StatefulSet before version naming: ownership label, REPLICAS env,
/// and the config digest.
pub fn render(qsts: &QuarksStatefulSet, config_sha1: Option<&str>) -> StatefulSet {
    let mut rendered = qsts.spec.template.clone();
    rendered.status = None;

    let mut labels = rendered.metadata.labels.clone();
    labels.insert(
        LABEL_QUARKS_STATEFULSET_NAME.to_string(),
        qsts.name().to_string(),
    );
    rendered.metadata = ObjectMeta {
        namespace: Some(qsts.namespace().to_string()),
        labels,
        annotations: rendered.metadata.annotations.clone(),
        ..Default::default()
    };

    let template = &mut rendered.spec.template;
    template.metadata.labels.insert(
        LABEL_QUARKS_STATEFULSET_NAME.to_string(),
        qsts.name().to_string(),
    );
    if qsts.inject_replicas_env() {
        let replicas = qsts.replicas().to_string();
        for container in template.spec.all_containers_mut() {
            container.upsert_env(ENV_REPLICAS, &replicas);
        }
    }
    match config_sha1 {
        Some(digest) => {
            template
                .metadata
                .annotations
                .insert(ANNOTATION_CONFIG_SHA1.to_string(), digest.to_string());
        }
        None => {
            template.metadata.annotations.remove(ANNOTATION_CONFIG_SHA1);
        }
    }
    rendered
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct HashInput<'a> {
    template: &'a PodTemplateSpec,
    zones: &'a [String],
    zone_node_label: &'a str,
}

/// Content hash of a rendered StatefulSet. The replica count only enters
/// through the REPLICAS variable. Claim templates are left out: they cannot
/// change on a running StatefulSet, so a change to them alone must not roll
/// the pods.
pub fn template_hash(
    rendered: &StatefulSet,
    zones: &[String],
    zone_node_label: &str,
) -> Result<String, QuarksStatefulSetError> {
    let payload = serde_json::to_vec(&HashInput {
        template: &rendered.spec.template,
        zones,
        zone_node_label,
    })
    .map_err(|err| QuarksStatefulSetError::InvalidTemplate(err.to_string()))?;
    Ok(hex::encode(Sha1::digest(&payload)))
}

pub fn claim_templates_hash(
    templates: &[PersistentVolumeClaim],
) -> Result<String, QuarksStatefulSetError> {
    let payload = serde_json::to_vec(templates)
        .map_err(|err| QuarksStatefulSetError::InvalidTemplate(err.to_string()))?;
    Ok(hex::encode(Sha1::digest(&payload)))
}

/// True when the user asked for claim templates other than the ones
/// `current` runs with and has not been told about it yet.
fn claim_change_pending(
    current: Option<&StatefulSet>,
    requested: &[PersistentVolumeClaim],
    requested_hash: &str,
) -> bool {
    current.is_some_and(|current| {
        current.metadata.annotation(ANNOTATION_CLAIM_TEMPLATES_HASH) != Some(requested_hash)
            && claim_templates_differ(&current.spec.volume_claim_templates, requested)
    })
}

/// Names, labels, selector, ownership, and zone placement for `version`.
pub fn build_group(
    qsts: &QuarksStatefulSet,
    rendered: &StatefulSet,
    version: u32,
    template_hash: &str,
    claim_hash: &str,
) -> Vec<StatefulSet> {
    let zones = &qsts.spec.zones;
    let total = qsts.replicas();
    let placements: Vec<Option<usize>> = if zones.is_empty() {
        vec![None]
    } else {
        (0..zones.len()).map(Some).collect()
    };
    let version_text = version.to_string();
    let owner = OwnerReference::controller_of(API_VERSION, KIND, &qsts.metadata);

    placements
        .into_iter()
        .map(|zone| {
            let name = statefulset_name(qsts.name(), zone, version);
            let mut statefulset = rendered.clone();
            statefulset.metadata.name = Some(name.clone());
            for labels in [
                &mut statefulset.metadata.labels,
                &mut statefulset.spec.template.metadata.labels,
                &mut statefulset.spec.selector.match_labels,
            ] {
                labels.insert(LABEL_STATEFULSET_NAME.to_string(), name.clone());
                labels.insert(LABEL_VERSION.to_string(), version_text.clone());
            }
            let annotations = &mut statefulset.metadata.annotations;
            annotations.insert(ANNOTATION_VERSION.to_string(), version_text.clone());
            annotations.insert(
                ANNOTATION_TEMPLATE_HASH.to_string(),
                template_hash.to_string(),
            );
            annotations.insert(
                ANNOTATION_CLAIM_TEMPLATES_HASH.to_string(),
                claim_hash.to_string(),
            );
            set_controller(&mut statefulset.metadata, owner.clone());
            statefulset.spec.replicas = Some(total);
            if let Some(index) = zone {
                apply_zone(&mut statefulset, zones, index, qsts.zone_node_label(), total);
            }
            statefulset
        })
        .collect()
}

fn pods_of<'a>(pods: &'a [Pod], statefulset_name: &'a str) -> impl Iterator<Item = &'a Pod> {
    pods.iter()
        .filter(move |pod| pod.metadata.label(LABEL_STATEFULSET_NAME) == Some(statefulset_name))
}

/// Every StatefulSet of the group serves at least its desired replicas.
pub fn is_available(group: &VersionGroup, pods: &[Pod]) -> bool {
    group.statefulsets.iter().all(|statefulset| {
        let serving = pods_of(pods, statefulset.metadata.name_or_empty())
            .filter(|pod| pod.is_serving())
            .count();
        serving >= statefulset.replicas() as usize
    })
}

pub fn availability(versions: &BTreeMap<u32, VersionGroup>, pods: &[Pod]) -> BTreeMap<u32, bool> {
    versions
        .iter()
        .map(|(version, group)| (*version, is_available(group, pods)))
        .collect()
}

/// Global ordinal of a pod: the ordinal label, else derived from its name
/// and zone index.
pub fn global_pod_ordinal(pod: &Pod, zone_count: usize) -> Option<u32> {
    if let Some(ordinal) = pod
        .metadata
        .label(LABEL_POD_ORDINAL)
        .and_then(|value| value.parse::<u32>().ok())
    {
        return Some(ordinal);
    }
    let local = pod_name_ordinal(pod.metadata.name_or_empty())?;
    let index = pod
        .metadata
        .label(LABEL_AZ_INDEX)
        .and_then(|value| value.parse::<usize>().ok())
        .unwrap_or(0);
    Some(global_ordinal(local, zone_count, index))
}

/// The pod with its ordinal, startup-ordinal, version, and zone labels set,
/// or `None` when it already carries them.
pub fn labeled_pod(
    pod: &Pod,
    ordinal: u32,
    startup_ordinal: &str,
    version: u32,
    zones: &[String],
) -> Option<Pod> {
    let mut desired = pod.metadata.labels.clone();
    desired.insert(LABEL_POD_ORDINAL.to_string(), ordinal.to_string());
    desired.insert(LABEL_STARTUP_ORDINAL.to_string(), startup_ordinal.to_string());
    desired.insert(LABEL_VERSION.to_string(), version.to_string());
    if let Some(index) = zone_index(zones.len(), ordinal) {
        desired.insert(LABEL_AZ_INDEX.to_string(), index.to_string());
        desired.insert(LABEL_AZ_NAME.to_string(), zones[index].clone());
    }
    if desired == pod.metadata.labels {
        return None;
    }
    let mut updated = pod.clone();
    updated.metadata.labels = desired;
    Some(updated)
}

/// Shared claims for ordinals `0..replicas` that do not exist yet.
pub fn missing_shared_claims(
    qsts: &QuarksStatefulSet,
    templates: &[PersistentVolumeClaim],
    existing: &BTreeSet<String>,
) -> Vec<PersistentVolumeClaim> {
    let owner = OwnerReference::controller_of(API_VERSION, KIND, &qsts.metadata);
    let mut claims = Vec::new();
    for template in templates {
        let template_name = template.metadata.name_or_empty();
        if template_name.is_empty() {
            continue;
        }
        for ordinal in 0..qsts.replicas().max(0) as u32 {
            let name = shared_claim_name(template_name, qsts.name(), ordinal);
            if existing.contains(&name) {
                continue;
            }
            let mut metadata = ObjectMeta::named(qsts.namespace(), &name);
            metadata.labels.insert(
                LABEL_QUARKS_STATEFULSET_NAME.to_string(),
                qsts.name().to_string(),
            );
            metadata
                .labels
                .insert(LABEL_POD_ORDINAL.to_string(), ordinal.to_string());
            set_controller(&mut metadata, owner.clone());
            claims.push(PersistentVolumeClaim::from_template(template, metadata));
        }
    }
    claims
}

/// Where the versioned StatefulSets should go this pass.
#[derive(Clone, Debug, Default)]
pub struct VersionPlan {
    /// The version pods should converge on: the newest existing or the one
    /// being created.
    pub latest: u32,
    pub template_hash: String,
    /// Hash of the newest version below `latest`, if one is still around.
    pub previous_hash: Option<String>,
    pub created: bool,
    /// The requested claim templates were not applied; warn about it.
    pub guarded: bool,
    pub create: Vec<StatefulSet>,
    pub update: Vec<StatefulSet>,
    pub scale_down: Vec<StatefulSet>,
    pub delete: Vec<StatefulSet>,
    /// Older versions still running pods.
    pub retiring: bool,
    pub max_available: u32,
    pub version_count: usize,
    pub live_hashes: BTreeSet<String>,
    pub claim_templates: Vec<PersistentVolumeClaim>,
}

pub fn plan_versions(
    qsts: &QuarksStatefulSet,
    statefulsets: &[StatefulSet],
    pods: &[Pod],
    config_sha1: Option<&str>,
) -> Result<VersionPlan, QuarksStatefulSetError> {
    let rendered = render(qsts, config_sha1);
    let hash = template_hash(&rendered, &qsts.spec.zones, qsts.zone_node_label())?;
    let requested_claims = &rendered.spec.volume_claim_templates;
    let claim_hash = claim_templates_hash(requested_claims)?;
    let versions = group_versions(qsts, statefulsets);
    let max_available = get_max_available_version(&availability(&versions, pods));

    let mut plan = VersionPlan {
        template_hash: hash.clone(),
        max_available,
        ..Default::default()
    };
    plan.live_hashes.insert(hash.clone());

    match versions.values().next_back() {
        Some(latest) if latest.template_hash.as_deref() == Some(hash.as_str()) => {
            plan.latest = latest.version;
            plan.previous_hash = versions
                .range(..latest.version)
                .next_back()
                .and_then(|(_, group)| group.template_hash.clone());
            plan.guarded = claim_change_pending(latest.first(), requested_claims, &claim_hash);
            for mut desired in build_group(qsts, &rendered, latest.version, &hash, &claim_hash) {
                let existing = latest
                    .statefulsets
                    .iter()
                    .find(|existing| existing.metadata.name == desired.metadata.name);
                match existing {
                    Some(existing) => {
                        if let Some(updated) = merge_in_place(existing, &desired) {
                            plan.update.push(updated);
                        }
                    }
                    None => {
                        guard_claim_templates(latest.first(), slice::from_mut(&mut desired));
                        plan.create.push(desired);
                    }
                }
            }
            plan.claim_templates = latest
                .first()
                .map(|statefulset| statefulset.spec.volume_claim_templates.clone())
                .unwrap_or_default();
        }
        previous => {
            let version = previous.map(|group| group.version).unwrap_or(0) + 1;
            let previous_first = previous.and_then(VersionGroup::first);
            let mut group = build_group(qsts, &rendered, version, &hash, &claim_hash);
            let pending = claim_change_pending(previous_first, requested_claims, &claim_hash);
            plan.guarded = guard_claim_templates(previous_first, &mut group)
                == GuardDecision::KeptPrevious
                && pending;
            plan.previous_hash = previous.and_then(|group| group.template_hash.clone());
            plan.claim_templates = group
                .first()
                .map(|statefulset| statefulset.spec.volume_claim_templates.clone())
                .unwrap_or_default();
            plan.latest = version;
            plan.created = true;
            plan.create = group;
        }
    }

    let mut retired_groups = 0usize;
    for (version, group) in &versions {
        if *version >= max_available {
            if let Some(hash) = &group.template_hash {
                plan.live_hashes.insert(hash.clone());
            }
            continue;
        }
        let mut survivors = 0usize;
        for statefulset in &group.statefulsets {
            let name = statefulset.metadata.name_or_empty();
            if pods_of(pods, name).next().is_none() {
                plan.delete.push(statefulset.clone());
                continue;
            }
            survivors += 1;
            plan.retiring = true;
            if statefulset.replicas() != 0 {
                let mut scaled = statefulset.clone();
                scaled.spec.replicas = Some(0);
                plan.scale_down.push(scaled);
            }
        }
        if survivors == 0 {
            retired_groups += 1;
        } else if let Some(hash) = &group.template_hash {
            plan.live_hashes.insert(hash.clone());
        }
    }
    plan.version_count = versions.len() + usize::from(plan.created) - retired_groups;
    Ok(plan)
}

/// Replicas, labels, and annotations from `desired` applied to `existing`;
/// everything else, claim templates included, stays as it is.
fn merge_in_place(existing: &StatefulSet, desired: &StatefulSet) -> Option<StatefulSet> {
    let mut merged = existing.clone();
    merged.spec.replicas = desired.spec.replicas;
    merged
        .metadata
        .labels
        .extend(desired.metadata.labels.clone());
    merged
        .metadata
        .annotations
        .extend(desired.metadata.annotations.clone());
    (merged != *existing).then_some(merged)
}
