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

/// Minimal Secret resource. Values in `data` are base64 encoded on the wire.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Secret {
    #[serde(default = "Secret::default_api_version")]
    pub api_version: String,
    #[serde(default = "Secret::default_kind")]
    pub kind: String,
    pub metadata: ObjectMeta,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub data: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub string_data: BTreeMap<String, String>,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub secret_type: Option<String>,
}

impl Secret {
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
        "Secret".to_string()
    }

    /// Decoded secret payload ordered by key; `stringData` wins over `data`.
    pub fn entries(&self) -> BTreeMap<String, Vec<u8>> {
        let mut merged: BTreeMap<String, Vec<u8>> = BTreeMap::new();
        for (key, value) in &self.data {
            match BASE64_STANDARD.decode(value) {
                Ok(decoded) => {
                    merged.insert(key.clone(), decoded);
                }
                Err(_) => {
                    merged.insert(key.clone(), value.clone().into_bytes());
                }
            }
        }
        for (key, value) in &self.string_data {
            merged.insert(key.clone(), value.clone().into_bytes());
        }
        merged
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entries_decode_data_and_prefer_string_data() {
        let mut secret = Secret::new(ObjectMeta::named("default", "creds"));
        secret
            .data
            .insert("user".to_string(), BASE64_STANDARD.encode("admin"));
        secret
            .data
            .insert("password".to_string(), BASE64_STANDARD.encode("old"));
        secret
            .string_data
            .insert("password".to_string(), "new".to_string());
        let entries = secret.entries();
        assert_eq!(entries.get("user").map(Vec::as_slice), Some(&b"admin"[..]));
        assert_eq!(entries.get("password").map(Vec::as_slice), Some(&b"new"[..]));
    }
}
