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

use std::sync::Arc;

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use super::client::{Api, ClusterClient, ClusterError, Resource};
use super::pod::ObjectMeta;
use crate::quarks::logger::{log_info, log_warn};

const COMPONENT: &str = "event-recorder";

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectReference {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource_version: Option<String>,
}

impl ObjectReference {
    pub fn to<K: Resource>(object: &K) -> Self {
        let meta = object.metadata();
        Self {
            api_version: Some(K::KIND.api_version()),
            kind: Some(K::KIND.kind().to_string()),
            name: meta.name.clone(),
            namespace: meta.namespace.clone(),
            uid: meta.uid.clone(),
            resource_version: meta.resource_version.clone(),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct EventSource {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub component: Option<String>,
}

/// Minimal representation of Kubernetes core/v1 Event.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    #[serde(default = "Event::default_api_version")]
    pub api_version: String,
    #[serde(default = "Event::default_kind")]
    pub kind: String,
    pub metadata: ObjectMeta,
    pub involved_object: ObjectReference,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub event_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_timestamp: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_timestamp: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub count: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<EventSource>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reporting_component: Option<String>,
}

impl Event {
    fn default_api_version() -> String {
        "v1".to_string()
    }

    fn default_kind() -> String {
        "Event".to_string()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventType {
    Normal,
    Warning,
}

impl EventType {
    pub fn as_str(self) -> &'static str {
        match self {
            EventType::Normal => "Normal",
            EventType::Warning => "Warning",
        }
    }
}

/// Publishes core/v1 Events attributed to the controller.
#[derive(Clone)]
pub struct EventRecorder {
    client: Arc<dyn ClusterClient>,
    component: String,
}

impl EventRecorder {
    pub fn new(client: Arc<dyn ClusterClient>, component: impl Into<String>) -> Self {
        Self {
            client,
            component: component.into(),
        }
    }

    pub async fn record<K: Resource>(
        &self,
        object: &K,
        event_type: EventType,
        reason: &str,
        message: &str,
    ) -> Result<(), ClusterError> {
        let involved = ObjectReference::to(object);
        let namespace = object.metadata().namespace_or_default().to_string();
        let object_name = object.metadata().name_or_empty().to_string();
        let now = Utc::now();
        let timestamp = now.to_rfc3339_opts(SecondsFormat::Secs, true);
        let event = Event {
            api_version: Event::default_api_version(),
            kind: Event::default_kind(),
            metadata: ObjectMeta {
                name: Some(format!(
                    "{}.{:x}",
                    object_name,
                    now.timestamp_nanos_opt().unwrap_or_default()
                )),
                namespace: Some(namespace.clone()),
                ..Default::default()
            },
            involved_object: involved,
            reason: Some(reason.to_string()),
            message: Some(message.to_string()),
            event_type: Some(event_type.as_str().to_string()),
            first_timestamp: Some(timestamp.clone()),
            last_timestamp: Some(timestamp),
            count: Some(1),
            source: Some(EventSource {
                component: Some(self.component.clone()),
            }),
            reporting_component: Some(self.component.clone()),
        };

        let metadata = [
            ("namespace", namespace.as_str()),
            ("object", object_name.as_str()),
            ("reason", reason),
            ("message", message),
        ];
        match event_type {
            EventType::Normal => log_info(COMPONENT, "Recording event", &metadata),
            EventType::Warning => log_warn(COMPONENT, "Recording event", &metadata),
        }

        Api::<Event>::namespaced(Arc::clone(&self.client), &namespace)
            .create(&event)
            .await
            .map(|_| ())
    }
}
