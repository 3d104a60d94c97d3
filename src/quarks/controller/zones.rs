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

//! Availability-zone spreading.
//!
//! A StatefulSet applies one pod template to every replica, so each zone gets
//! its own StatefulSet. Zone `z` of `Z` runs the global ordinals
//! `z, z + Z, z + 2Z, ...`; its local replica `l` is global ordinal `l*Z + z`.

use crate::quarks::k8s::pod::{
    Affinity, NodeAffinity, NodeSelector, NodeSelectorRequirement, NodeSelectorTerm,
};
use crate::quarks::k8s::quarksstatefulset::{ANNOTATION_ZONES, LABEL_AZ_INDEX, LABEL_AZ_NAME};
use crate::quarks::k8s::statefulset::StatefulSet;

/// Zone index of global ordinal `ordinal`, or `None` without zones.
pub fn zone_index(zone_count: usize, ordinal: u32) -> Option<usize> {
    if zone_count == 0 {
        return None;
    }
    Some(ordinal as usize % zone_count)
}

pub fn zone_for(zones: &[String], ordinal: u32) -> Option<&str> {
    zone_index(zones.len(), ordinal).map(|index| zones[index].as_str())
}

/// Number of ordinals in `0..total` that land in zone `index`.
pub fn replicas_for_zone(total: i32, zone_count: usize, index: usize) -> i32 {
    if zone_count == 0 {
        return total.max(0);
    }
    let (total, zone_count, index) = (total.max(0) as usize, zone_count, index);
    if index >= total {
        return 0;
    }
    ((total - index + zone_count - 1) / zone_count) as i32
}

/// Global ordinal of local replica `local` in zone `index`.
pub fn global_ordinal(local: u32, zone_count: usize, index: usize) -> u32 {
    if zone_count == 0 {
        return local;
    }
    local * zone_count as u32 + index as u32
}

/// Trailing ordinal of a StatefulSet pod name such as `web-v2-3`.
pub fn pod_name_ordinal(pod_name: &str) -> Option<u32> {
    pod_name
        .rsplit_once('-')
        .and_then(|(_, suffix)| suffix.parse::<u32>().ok())
}

/// Pins `statefulset` to zone `index`: replica count, node affinity, labels,
/// and the zones annotation.
pub fn apply_zone(
    statefulset: &mut StatefulSet,
    zones: &[String],
    index: usize,
    zone_node_label: &str,
    total_replicas: i32,
) {
    let Some(zone) = zones.get(index) else {
        return;
    };
    statefulset.spec.replicas = Some(replicas_for_zone(total_replicas, zones.len(), index));

    let index_text = index.to_string();
    let zones_json = serde_json::to_string(zones).unwrap_or_else(|_| "[]".to_string());
    for labels in [
        &mut statefulset.metadata.labels,
        &mut statefulset.spec.template.metadata.labels,
    ] {
        labels.insert(LABEL_AZ_INDEX.to_string(), index_text.clone());
        labels.insert(LABEL_AZ_NAME.to_string(), zone.clone());
    }
    for annotations in [
        &mut statefulset.metadata.annotations,
        &mut statefulset.spec.template.metadata.annotations,
    ] {
        annotations.insert(ANNOTATION_ZONES.to_string(), zones_json.clone());
    }
    statefulset
        .spec
        .selector
        .match_labels
        .insert(LABEL_AZ_INDEX.to_string(), index_text);

    require_zone(
        statefulset
            .spec
            .template
            .spec
            .affinity
            .get_or_insert_with(Affinity::default),
        zone_node_label,
        zone,
    );
}

/// Adds `label In [zone]` to every required node selector term, creating a
/// term when there is none. Terms are ORed by the scheduler, so each one must
/// carry the zone requirement.
fn require_zone(affinity: &mut Affinity, zone_node_label: &str, zone: &str) {
    let requirement = NodeSelectorRequirement {
        key: zone_node_label.to_string(),
        operator: "In".to_string(),
        values: vec![zone.to_string()],
    };
    let selector = affinity
        .node_affinity
        .get_or_insert_with(NodeAffinity::default)
        .required_during_scheduling_ignored_during_execution
        .get_or_insert_with(NodeSelector::default);
    if selector.node_selector_terms.is_empty() {
        selector.node_selector_terms.push(NodeSelectorTerm::default());
    }
    for term in &mut selector.node_selector_terms {
        term.match_expressions
            .retain(|existing| existing.key != requirement.key);
        term.match_expressions.push(requirement.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quarks::k8s::statefulset::StatefulSetSpec;

    fn zones() -> Vec<String> {
        vec!["z1".to_string(), "z2".to_string(), "z3".to_string()]
    }

    #[test]
    fn ordinals_round_robin_over_zones() {
        let zones = zones();
        assert_eq!(zone_for(&zones, 0), Some("z1"));
        assert_eq!(zone_for(&zones, 3), Some("z1"));
        assert_eq!(zone_for(&zones, 4), Some("z2"));
        assert_eq!(zone_for(&[], 4), None);
    }

    #[test]
    fn zone_replica_counts_cover_all_ordinals() {
        assert_eq!(replicas_for_zone(5, 3, 0), 2);
        assert_eq!(replicas_for_zone(5, 3, 1), 2);
        assert_eq!(replicas_for_zone(5, 3, 2), 1);
        assert_eq!(replicas_for_zone(2, 3, 2), 0);
        assert_eq!(replicas_for_zone(4, 0, 0), 4);
        for total in 0..10 {
            let sum: i32 = (0..3).map(|z| replicas_for_zone(total, 3, z)).sum();
            assert_eq!(sum, total);
        }
    }

    #[test]
    fn local_replicas_map_back_to_global_ordinals() {
        assert_eq!(global_ordinal(1, 3, 1), 4);
        assert_eq!(zone_index(3, global_ordinal(2, 3, 2)), Some(2));
        assert_eq!(global_ordinal(7, 0, 0), 7);
        assert_eq!(pod_name_ordinal("web-z1-v2-3"), Some(3));
        assert_eq!(pod_name_ordinal("web"), None);
    }

    #[test]
    fn apply_zone_merges_affinity_and_labels() {
        let mut sts = StatefulSet::new(Default::default(), StatefulSetSpec::default());
        sts.spec.template.spec.affinity = Some(Affinity {
            node_affinity: Some(NodeAffinity {
                required_during_scheduling_ignored_during_execution: Some(NodeSelector {
                    node_selector_terms: vec![NodeSelectorTerm {
                        match_expressions: vec![NodeSelectorRequirement {
                            key: "disk".to_string(),
                            operator: "In".to_string(),
                            values: vec!["ssd".to_string()],
                        }],
                        ..Default::default()
                    }],
                }),
                ..Default::default()
            }),
            ..Default::default()
        });

        apply_zone(&mut sts, &zones(), 1, "zone", 4);

        assert_eq!(sts.spec.replicas, Some(1));
        assert_eq!(
            sts.spec.template.metadata.labels.get(LABEL_AZ_NAME).map(String::as_str),
            Some("z2")
        );
        assert_eq!(
            sts.metadata.annotations.get(ANNOTATION_ZONES).map(String::as_str),
            Some(r#"["z1","z2","z3"]"#)
        );
        let terms = &sts
            .spec
            .template
            .spec
            .affinity
            .as_ref()
            .and_then(|affinity| affinity.node_affinity.as_ref())
            .and_then(|node| node.required_during_scheduling_ignored_during_execution.as_ref())
            .expect("required terms")
            .node_selector_terms;
        assert_eq!(terms.len(), 1);
        assert_eq!(terms[0].match_expressions.len(), 2);
        assert_eq!(terms[0].match_expressions[1].values, vec!["z2".to_string()]);
    }
}
