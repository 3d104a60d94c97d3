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

//! Discovers the ConfigMaps and Secrets a pod spec depends on.

use super::pod::{ContainerSpec, PodSpec};
use std::collections::BTreeMap;

/// Names referenced by a pod spec. The flag records whether every reference
/// to that name was marked optional.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReferencedConfigs {
    pub config_maps: BTreeMap<String, bool>,
    pub secrets: BTreeMap<String, bool>,
}

impl ReferencedConfigs {
    pub fn is_empty(&self) -> bool {
        self.config_maps.is_empty() && self.secrets.is_empty()
    }

    pub fn references_config_map(&self, name: &str) -> bool {
        self.config_maps.contains_key(name)
    }

    pub fn references_secret(&self, name: &str) -> bool {
        self.secrets.contains_key(name)
    }

    fn add(target: &mut BTreeMap<String, bool>, name: &str, optional: Option<bool>) {
        if name.is_empty() {
            return;
        }
        let optional = optional.unwrap_or(false);
        target
            .entry(name.to_string())
            .and_modify(|existing| *existing = *existing && optional)
            .or_insert(optional);
    }
}

/// Scans volumes, `envFrom`, and `valueFrom` in init and regular containers.
pub fn referenced_configs(spec: &PodSpec) -> ReferencedConfigs {
    let mut refs = ReferencedConfigs::default();

    for volume in &spec.volumes {
        if let Some(config_map) = &volume.config_map {
            ReferencedConfigs::add(&mut refs.config_maps, &config_map.name, config_map.optional);
        }
        if let Some(secret) = &volume.secret {
            ReferencedConfigs::add(&mut refs.secrets, &secret.secret_name, secret.optional);
        }
        if let Some(projected) = &volume.projected {
            for source in &projected.sources {
                if let Some(config_map) = &source.config_map {
                    ReferencedConfigs::add(
                        &mut refs.config_maps,
                        &config_map.name,
                        config_map.optional,
                    );
                }
                if let Some(secret) = &source.secret {
                    ReferencedConfigs::add(&mut refs.secrets, &secret.name, secret.optional);
                }
            }
        }
    }

    for container in spec.all_containers() {
        scan_container(container, &mut refs);
    }

    refs
}

fn scan_container(container: &ContainerSpec, refs: &mut ReferencedConfigs) {
    for source in &container.env_from {
        if let Some(config_map) = &source.config_map_ref {
            ReferencedConfigs::add(&mut refs.config_maps, &config_map.name, config_map.optional);
        }
        if let Some(secret) = &source.secret_ref {
            ReferencedConfigs::add(&mut refs.secrets, &secret.name, secret.optional);
        }
    }

    for env in &container.env {
        let Some(value_from) = &env.value_from else {
            continue;
        };
        if let Some(selector) = &value_from.config_map_key_ref {
            ReferencedConfigs::add(&mut refs.config_maps, &selector.name, selector.optional);
        }
        if let Some(selector) = &value_from.secret_key_ref {
            ReferencedConfigs::add(&mut refs.secrets, &selector.name, selector.optional);
        }
    }
}
