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

use super::pod::ObjectMeta;

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Minimal ConfigMap resource.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigMap {
    #[serde(default = "ConfigMap::default_api_version")]
    pub api_version: String,
    #[serde(default = "ConfigMap::default_kind")]
    pub kind: String,
    pub metadata: ObjectMeta,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub data: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub binary_data: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub immutable: Option<bool>,
}

impl ConfigMap {
    pub fn new(metadata: ObjectMeta) -> Self {
        Self {
            api_version: Self::default_api_version(),
            kind: Self::default_kind(),
            metadata,
            ..Default::default()
        }
    }

    fn default_api_version() -> String {
        "v1".to_string()
    }

    fn default_kind() -> String {
        "ConfigMap".to_string()
    }

    /// Merged view over `data` and decoded `binaryData`, ordered by key.
    pub fn entries(&self) -> BTreeMap<String, Vec<u8>> {
        let mut merged: BTreeMap<String, Vec<u8>> = BTreeMap::new();
        for (key, value) in &self.data {
            merged.insert(key.clone(), value.clone().into_bytes());
        }
        for (key, value) in &self.binary_data {
            if let Ok(decoded) = BASE64_STANDARD.decode(value) {
                merged.insert(key.clone(), decoded);
            }
        }
        merged
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entries_merge_text_and_binary_data() {
        let mut config_map = ConfigMap::new(ObjectMeta::named("default", "app-config"));
        config_map
            .data
            .insert("a.conf".to_string(), "alpha".to_string());
        config_map
            .binary_data
            .insert("b.bin".to_string(), BASE64_STANDARD.encode([1u8, 2, 3]));
        let entries = config_map.entries();
        assert_eq!(entries.get("a.conf").map(Vec::as_slice), Some(&b"alpha"[..]));
        assert_eq!(entries.get("b.bin").map(Vec::as_slice), Some(&[1u8, 2, 3][..]));
    }
}
