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

//! Cluster API seam. `ClusterClient` speaks raw JSON so it stays object safe;
//! [`Api`] layers typed access over it for the resources the controller uses.

use super::configmap::ConfigMap;
use super::event::Event;
use super::persistentvolumeclaim::PersistentVolumeClaim;
use super::pod::{ObjectMeta, Pod};
use super::quarksstatefulset::{self, QuarksStatefulSet};
use super::secret::Secret;
use super::statefulset::StatefulSet;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::error::Error;
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::Arc;

pub type ClientFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, ClusterError>> + Send + 'a>>;

/// Exact-match label selector.
pub type Selector = BTreeMap<String, String>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ResourceKind {
    QuarksStatefulSet,
    StatefulSet,
    Pod,
    PersistentVolumeClaim,
    ConfigMap,
    Secret,
    Event,
}

impl ResourceKind {
    pub fn group(self) -> &'static str {
        match self {
            ResourceKind::QuarksStatefulSet => quarksstatefulset::GROUP,
            ResourceKind::StatefulSet => "apps",
            _ => "",
        }
    }

    pub fn version(self) -> &'static str {
        match self {
            ResourceKind::QuarksStatefulSet => quarksstatefulset::VERSION,
            _ => "v1",
        }
    }

    pub fn api_version(self) -> String {
        match self.group() {
            "" => self.version().to_string(),
            group => format!("{}/{}", group, self.version()),
        }
    }

    pub fn kind(self) -> &'static str {
        match self {
            ResourceKind::QuarksStatefulSet => quarksstatefulset::KIND,
            ResourceKind::StatefulSet => "StatefulSet",
            ResourceKind::Pod => "Pod",
            ResourceKind::PersistentVolumeClaim => "PersistentVolumeClaim",
            ResourceKind::ConfigMap => "ConfigMap",
            ResourceKind::Secret => "Secret",
            ResourceKind::Event => "Event",
        }
    }

    pub fn plural(self) -> &'static str {
        match self {
            ResourceKind::QuarksStatefulSet => quarksstatefulset::PLURAL,
            ResourceKind::StatefulSet => "statefulsets",
            ResourceKind::Pod => "pods",
            ResourceKind::PersistentVolumeClaim => "persistentvolumeclaims",
            ResourceKind::ConfigMap => "configmaps",
            ResourceKind::Secret => "secrets",
            ResourceKind::Event => "events",
        }
    }

    /// Kinds whose `status` is only writable through the status subresource.
    pub fn has_status_subresource(self) -> bool {
        matches!(
            self,
            ResourceKind::QuarksStatefulSet | ResourceKind::StatefulSet | ResourceKind::Pod
        )
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.kind())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClusterError {
    NotFound { kind: ResourceKind, name: String },
    Conflict { kind: ResourceKind, name: String, message: String },
    AlreadyExists { kind: ResourceKind, name: String },
    Invalid { message: String },
    Transient { message: String },
    Api { status: u16, message: String },
    Serialization(String),
}

impl ClusterError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ClusterError::NotFound { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, ClusterError::Conflict { .. })
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, ClusterError::AlreadyExists { .. })
    }

    /// Errors that a later attempt can plausibly clear without a spec change.
    pub fn is_retryable(&self) -> bool {
        match self {
            ClusterError::Conflict { .. } | ClusterError::Transient { .. } => true,
            ClusterError::Api { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}

impl fmt::Display for ClusterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClusterError::NotFound { kind, name } => write!(f, "{} '{}' not found", kind, name),
            ClusterError::Conflict {
                kind,
                name,
                message,
            } => write!(f, "conflict writing {} '{}': {}", kind, name, message),
            ClusterError::AlreadyExists { kind, name } => {
                write!(f, "{} '{}' already exists", kind, name)
            }
            ClusterError::Invalid { message } => write!(f, "invalid object: {}", message),
            ClusterError::Transient { message } => write!(f, "transient API error: {}", message),
            ClusterError::Api { status, message } => {
                write!(f, "API request failed with status {}: {}", status, message)
            }
            ClusterError::Serialization(message) => write!(f, "serialization error: {}", message),
        }
    }
}

impl Error for ClusterError {}

impl From<serde_json::Error> for ClusterError {
    fn from(err: serde_json::Error) -> Self {
        ClusterError::Serialization(err.to_string())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExecRequest {
    pub namespace: String,
    pub pod: String,
    pub container: String,
    pub command: Vec<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ExecOutcome {
    pub exit_code: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl ExecOutcome {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Verbs the controller consumes from the cluster API.
pub trait ClusterClient: Send + Sync {
    fn get<'a>(
        &'a self,
        kind: ResourceKind,
        namespace: &'a str,
        name: &'a str,
    ) -> ClientFuture<'a, Option<Value>>;

    /// Lists objects; `namespace = None` spans all namespaces.
    fn list<'a>(
        &'a self,
        kind: ResourceKind,
        namespace: Option<&'a str>,
        selector: &'a Selector,
    ) -> ClientFuture<'a, Vec<Value>>;

    fn create<'a>(
        &'a self,
        kind: ResourceKind,
        namespace: &'a str,
        object: Value,
    ) -> ClientFuture<'a, Value>;

    /// Replaces an object. A stale `metadata.resourceVersion` yields `Conflict`.
    fn update<'a>(
        &'a self,
        kind: ResourceKind,
        namespace: &'a str,
        object: Value,
    ) -> ClientFuture<'a, Value>;

    fn update_status<'a>(
        &'a self,
        kind: ResourceKind,
        namespace: &'a str,
        object: Value,
    ) -> ClientFuture<'a, Value>;

    fn delete<'a>(
        &'a self,
        kind: ResourceKind,
        namespace: &'a str,
        name: &'a str,
        resource_version: Option<&'a str>,
    ) -> ClientFuture<'a, ()>;

    fn exec<'a>(&'a self, request: &'a ExecRequest) -> ClientFuture<'a, ExecOutcome>;
}

/// Typed resource understood by [`Api`].
pub trait Resource: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    const KIND: ResourceKind;

    fn metadata(&self) -> &ObjectMeta;

    fn metadata_mut(&mut self) -> &mut ObjectMeta;
}

macro_rules! impl_resource {
    ($ty:ty, $kind:expr) => {
        impl Resource for $ty {
            const KIND: ResourceKind = $kind;

            fn metadata(&self) -> &ObjectMeta {
                &self.metadata
            }

            fn metadata_mut(&mut self) -> &mut ObjectMeta {
                &mut self.metadata
            }
        }
    };
}

impl_resource!(QuarksStatefulSet, ResourceKind::QuarksStatefulSet);
impl_resource!(StatefulSet, ResourceKind::StatefulSet);
impl_resource!(Pod, ResourceKind::Pod);
impl_resource!(PersistentVolumeClaim, ResourceKind::PersistentVolumeClaim);
impl_resource!(ConfigMap, ResourceKind::ConfigMap);
impl_resource!(Secret, ResourceKind::Secret);
impl_resource!(Event, ResourceKind::Event);

/// Typed view over a [`ClusterClient`] for one resource kind.
pub struct Api<K> {
    client: Arc<dyn ClusterClient>,
    namespace: Option<String>,
    _marker: PhantomData<fn() -> K>,
}

impl<K> Clone for Api<K> {
    fn clone(&self) -> Self {
        Self {
            client: Arc::clone(&self.client),
            namespace: self.namespace.clone(),
            _marker: PhantomData,
        }
    }
}

impl<K: Resource> Api<K> {
    pub fn namespaced(client: Arc<dyn ClusterClient>, namespace: &str) -> Self {
        Self {
            client,
            namespace: Some(namespace.to_string()),
            _marker: PhantomData,
        }
    }

    /// Cluster-wide view; reads need the object namespace from the caller.
    pub fn all(client: Arc<dyn ClusterClient>) -> Self {
        Self {
            client,
            namespace: None,
            _marker: PhantomData,
        }
    }

    fn namespace_for(&self, object: Option<&ObjectMeta>) -> String {
        object
            .and_then(|meta| meta.namespace.clone())
            .or_else(|| self.namespace.clone())
            .unwrap_or_else(|| "default".to_string())
    }

    pub async fn get(&self, name: &str) -> Result<Option<K>, ClusterError> {
        let namespace = self.namespace_for(None);
        match self.client.get(K::KIND, &namespace, name).await? {
            Some(value) => Ok(Some(decode(value)?)),
            None => Ok(None),
        }
    }

    pub async fn list(&self, selector: &Selector) -> Result<Vec<K>, ClusterError> {
        let values = self
            .client
            .list(K::KIND, self.namespace.as_deref(), selector)
            .await?;
        values.into_iter().map(decode).collect()
    }

    pub async fn create(&self, object: &K) -> Result<K, ClusterError> {
        let namespace = self.namespace_for(Some(object.metadata()));
        let value = encode(object)?;
        decode(self.client.create(K::KIND, &namespace, value).await?)
    }

    pub async fn update(&self, object: &K) -> Result<K, ClusterError> {
        let namespace = self.namespace_for(Some(object.metadata()));
        let value = encode(object)?;
        decode(self.client.update(K::KIND, &namespace, value).await?)
    }

    pub async fn update_status(&self, object: &K) -> Result<K, ClusterError> {
        let namespace = self.namespace_for(Some(object.metadata()));
        let value = encode(object)?;
        decode(self.client.update_status(K::KIND, &namespace, value).await?)
    }

    pub async fn delete(&self, name: &str, resource_version: Option<&str>) -> Result<(), ClusterError> {
        let namespace = self.namespace_for(None);
        self.client
            .delete(K::KIND, &namespace, name, resource_version)
            .await
    }
}

fn encode<K: Resource>(object: &K) -> Result<Value, ClusterError> {
    let mut value = serde_json::to_value(object)?;
    if let Value::Object(map) = &mut value {
        map.insert(
            "apiVersion".to_string(),
            Value::String(K::KIND.api_version()),
        );
        map.insert("kind".to_string(), Value::String(K::KIND.kind().to_string()));
    }
    Ok(value)
}

fn decode<K: Resource>(value: Value) -> Result<K, ClusterError> {
    serde_json::from_value(value).map_err(ClusterError::from)
}

/// Selector matching every object labeled for the given QuarksStatefulSet.
pub fn owned_by_selector(qsts_name: &str) -> Selector {
    Selector::from([(
        quarksstatefulset::LABEL_QUARKS_STATEFULSET_NAME.to_string(),
        qsts_name.to_string(),
    )])
}

/// True when every selector pair is present in `labels`.
pub fn selector_matches(selector: &Selector, labels: &BTreeMap<String, String>) -> bool {
    selector
        .iter()
        .all(|(key, value)| labels.get(key) == Some(value))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_versions_follow_group_rules() {
        assert_eq!(ResourceKind::Pod.api_version(), "v1");
        assert_eq!(ResourceKind::StatefulSet.api_version(), "apps/v1");
        assert_eq!(
            ResourceKind::QuarksStatefulSet.api_version(),
            "quarks.cloudfoundry.org/v1alpha1"
        );
    }

    #[test]
    fn selector_requires_every_pair() {
        let selector = Selector::from([
            ("app".to_string(), "web".to_string()),
            ("tier".to_string(), "db".to_string()),
        ]);
        let mut labels = BTreeMap::from([("app".to_string(), "web".to_string())]);
        assert!(!selector_matches(&selector, &labels));
        labels.insert("tier".to_string(), "db".to_string());
        assert!(selector_matches(&selector, &labels));
        assert!(selector_matches(&Selector::new(), &labels));
    }

    #[test]
    fn conflicts_and_throttling_are_transient() {
        let conflict = ClusterError::Conflict {
            kind: ResourceKind::Pod,
            name: "web-0".to_string(),
            message: "stale".to_string(),
        };
        assert!(conflict.is_conflict());
        assert!(conflict.is_retryable());
        assert!(ClusterError::Api {
            status: 503,
            message: String::new()
        }
        .is_retryable());
        assert!(!ClusterError::Invalid {
            message: "bad".to_string()
        }
        .is_retryable());
    }
}
