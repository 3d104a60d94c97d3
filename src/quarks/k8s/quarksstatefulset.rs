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

//! The `QuarksStatefulSet` custom resource and the label/annotation keys the
//! controller stamps onto the objects it manages.

use super::pod::{ObjectMeta, Probe};
use super::statefulset::StatefulSet;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const GROUP: &str = "quarks.cloudfoundry.org";
pub const VERSION: &str = "v1alpha1";
pub const API_VERSION: &str = "quarks.cloudfoundry.org/v1alpha1";
pub const KIND: &str = "QuarksStatefulSet";
pub const PLURAL: &str = "quarksstatefulsets";

/// Node label consulted for zone placement when zoneNodeLabel is empty.
pub const DEFAULT_ZONE_NODE_LABEL: &str = "failure-domain.beta.kubernetes.io/zone";

pub const ANNOTATION_VERSION: &str = "quarks.cloudfoundry.org/version";
pub const ANNOTATION_ORDINAL_REVISIONS: &str = "quarks.cloudfoundry.org/ordinal-revisions";
pub const ANNOTATION_ZONES: &str = "quarks.cloudfoundry.org/zones";
pub const ANNOTATION_TEMPLATE_HASH: &str = "quarks.cloudfoundry.org/template-hash";
pub const ANNOTATION_CONFIG_SHA1: &str = "quarks.cloudfoundry.org/config-sha1";
/// Hash of the claim templates last requested for a version, kept or not.
pub const ANNOTATION_CLAIM_TEMPLATES_HASH: &str = "quarks.cloudfoundry.org/claim-templates-hash";

pub const LABEL_VERSION: &str = "quarks.cloudfoundry.org/version";
pub const LABEL_AZ_INDEX: &str = "quarks.cloudfoundry.org/az-index";
pub const LABEL_AZ_NAME: &str = "quarks.cloudfoundry.org/az-name";
pub const LABEL_POD_ORDINAL: &str = "quarks.cloudfoundry.org/pod-ordinal";
pub const LABEL_STARTUP_ORDINAL: &str = "quarks.cloudfoundry.org/startup-ordinal";
pub const LABEL_QUARKS_STATEFULSET_NAME: &str = "quarks.cloudfoundry.org/quarks-statefulset-name";
pub const LABEL_STATEFULSET_NAME: &str = "quarks.cloudfoundry.org/statefulset-name";
pub const LABEL_ACTIVE_POD: &str = "quarks.cloudfoundry.org/pod-active";

/// Environment variable carrying the desired replica count.
pub const ENV_REPLICAS: &str = "REPLICAS";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuarksStatefulSetSpec {
    /// Roll out a new version when referenced ConfigMaps or Secrets change.
    #[serde(default)]
    pub update_on_config_change: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub zone_node_label: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub zones: Vec<String>,
    pub template: StatefulSet,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub active_passive_probes: BTreeMap<String, Probe>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inject_replicas_env: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuarksStatefulSetStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_reconcile: Option<String>,
    #[serde(default)]
    pub ready: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuarksStatefulSet {
    #[serde(default = "QuarksStatefulSet::default_api_version")]
    pub api_version: String,
    #[serde(default = "QuarksStatefulSet::default_kind")]
    pub kind: String,
    pub metadata: ObjectMeta,
    pub spec: QuarksStatefulSetSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<QuarksStatefulSetStatus>,
}

impl QuarksStatefulSet {
    pub fn new(metadata: ObjectMeta, spec: QuarksStatefulSetSpec) -> Self {
        Self {
            api_version: Self::default_api_version(),
            kind: Self::default_kind(),
            metadata,
            spec,
            status: None,
        }
    }

    fn default_api_version() -> String {
        API_VERSION.to_string()
    }

    fn default_kind() -> String {
        KIND.to_string()
    }

    pub fn name(&self) -> &str {
        self.metadata.name_or_empty()
    }

    pub fn namespace(&self) -> &str {
        self.metadata.namespace_or_default()
    }

    pub fn replicas(&self) -> i32 {
        self.spec.template.replicas()
    }

    pub fn zone_node_label(&self) -> &str {
        self.spec
            .zone_node_label
            .as_deref()
            .filter(|label| !label.is_empty())
            .unwrap_or(DEFAULT_ZONE_NODE_LABEL)
    }

    pub fn inject_replicas_env(&self) -> bool {
        self.spec.inject_replicas_env.unwrap_or(true)
    }

    pub fn is_active_passive(&self) -> bool {
        !self.spec.active_passive_probes.is_empty()
    }
}

/// Returns the greatest version marked available, or 0 when none is.
pub fn get_max_available_version(versions: &BTreeMap<u32, bool>) -> u32 {
    versions
        .iter()
        .rev()
        .find(|(_, available)| **available)
        .map(|(version, _)| *version)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn max_available_version_picks_greatest_ready_version() {
        let versions = BTreeMap::from([(1, true), (2, false), (3, true)]);
        assert_eq!(get_max_available_version(&versions), 3);

        let versions = BTreeMap::from([(1, true), (2, false)]);
        assert_eq!(get_max_available_version(&versions), 1);

        let versions = BTreeMap::from([(4, false)]);
        assert_eq!(get_max_available_version(&versions), 0);

        assert_eq!(get_max_available_version(&BTreeMap::new()), 0);
    }

    #[test]
    fn spec_defaults_follow_resource_contract() {
        let qsts: QuarksStatefulSet = serde_json::from_value(json!({
            "apiVersion": API_VERSION,
            "kind": KIND,
            "metadata": {"name": "web", "namespace": "demo"},
            "spec": {
                "template": {
                    "metadata": {"name": "web"},
                    "spec": {"replicas": 3}
                }
            }
        }))
        .expect("qsts");

        assert!(qsts.inject_replicas_env());
        assert!(!qsts.spec.update_on_config_change);
        assert!(!qsts.is_active_passive());
        assert_eq!(qsts.zone_node_label(), DEFAULT_ZONE_NODE_LABEL);
        assert_eq!(qsts.replicas(), 3);
        assert_eq!(qsts.namespace(), "demo");
    }

    #[test]
    fn explicit_settings_are_honoured() {
        let qsts: QuarksStatefulSet = serde_json::from_value(json!({
            "metadata": {"name": "web"},
            "spec": {
                "injectReplicasEnv": false,
                "zoneNodeLabel": "topology.kubernetes.io/zone",
                "zones": ["z1", "z2"],
                "activePassiveProbes": {
                    "app": {"exec": {"command": ["true"]}}
                },
                "template": {"spec": {}}
            }
        }))
        .expect("qsts");

        assert!(!qsts.inject_replicas_env());
        assert!(qsts.is_active_passive());
        assert_eq!(qsts.zone_node_label(), "topology.kubernetes.io/zone");
        assert_eq!(qsts.spec.zones, vec!["z1".to_string(), "z2".to_string()]);
        assert_eq!(qsts.replicas(), 1);
    }
}
