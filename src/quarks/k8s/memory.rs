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

//! In-process cluster store implementing [`ClusterClient`] with the same
//! optimistic-concurrency rules as the API server. Backs the test suites.

use super::client::{
    selector_matches, ClientFuture, ClusterClient, ClusterError, ExecOutcome, ExecRequest,
    Resource, ResourceKind, Selector,
};
use chrono::{SecondsFormat, Utc};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard};

pub type ExecHandler = Arc<dyn Fn(&ExecRequest) -> ExecOutcome + Send + Sync>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Verb {
    Get,
    List,
    Create,
    Update,
    UpdateStatus,
    Delete,
}

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
struct ObjectKey {
    kind: ResourceKind,
    namespace: String,
    name: String,
}

struct Fault {
    kind: ResourceKind,
    verb: Verb,
    error: ClusterError,
    remaining: usize,
}

#[derive(Default)]
struct ClusterState {
    objects: BTreeMap<ObjectKey, Value>,
    resource_version: u64,
    uid_counter: u64,
    faults: Vec<Fault>,
    calls: BTreeMap<(ResourceKind, Verb), usize>,
}

impl ClusterState {
    fn next_resource_version(&mut self) -> String {
        self.resource_version += 1;
        self.resource_version.to_string()
    }

    fn next_uid(&mut self) -> String {
        self.uid_counter += 1;
        format!("00000000-0000-4000-8000-{:012x}", self.uid_counter)
    }

    fn record_call(&mut self, kind: ResourceKind, verb: Verb) -> Result<(), ClusterError> {
        *self.calls.entry((kind, verb)).or_default() += 1;
        if let Some(index) = self
            .faults
            .iter()
            .position(|fault| fault.kind == kind && fault.verb == verb)
        {
            let error = self.faults[index].error.clone();
            self.faults[index].remaining -= 1;
            if self.faults[index].remaining == 0 {
                self.faults.remove(index);
            }
            return Err(error);
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct InMemoryCluster {
    state: Mutex<ClusterState>,
    exec_handler: Mutex<Option<ExecHandler>>,
}

impl InMemoryCluster {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, ClusterState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Fails the next `times` calls of `verb` on `kind` with `error`.
    pub fn inject_fault(&self, kind: ResourceKind, verb: Verb, error: ClusterError, times: usize) {
        if times == 0 {
            return;
        }
        self.state().faults.push(Fault {
            kind,
            verb,
            error,
            remaining: times,
        });
    }

    pub fn set_exec_handler<F>(&self, handler: F)
    where
        F: Fn(&ExecRequest) -> ExecOutcome + Send + Sync + 'static,
    {
        let mut guard = self
            .exec_handler
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard = Some(Arc::new(handler));
    }

    /// Number of calls observed for `verb` on `kind`, including failed ones.
    pub fn call_count(&self, kind: ResourceKind, verb: Verb) -> usize {
        self.state()
            .calls
            .get(&(kind, verb))
            .copied()
            .unwrap_or_default()
    }

    /// Typed snapshot of every stored object of `K`, ordered by namespace and name.
    pub fn objects<K: Resource>(&self) -> Vec<K> {
        self.state()
            .objects
            .iter()
            .filter(|(key, _)| key.kind == K::KIND)
            .filter_map(|(_, value)| serde_json::from_value(value.clone()).ok())
            .collect()
    }

    pub fn object<K: Resource>(&self, namespace: &str, name: &str) -> Option<K> {
        let key = ObjectKey {
            kind: K::KIND,
            namespace: namespace.to_string(),
            name: name.to_string(),
        };
        self.state()
            .objects
            .get(&key)
            .and_then(|value| serde_json::from_value(value.clone()).ok())
    }

    fn do_get(&self, kind: ResourceKind, namespace: &str, name: &str) -> Result<Option<Value>, ClusterError> {
        let mut state = self.state();
        state.record_call(kind, Verb::Get)?;
        let key = ObjectKey {
            kind,
            namespace: namespace.to_string(),
            name: name.to_string(),
        };
        Ok(state.objects.get(&key).cloned())
    }

    fn do_list(
        &self,
        kind: ResourceKind,
        namespace: Option<&str>,
        selector: &Selector,
    ) -> Result<Vec<Value>, ClusterError> {
        let mut state = self.state();
        state.record_call(kind, Verb::List)?;
        Ok(state
            .objects
            .iter()
            .filter(|(key, _)| key.kind == kind)
            .filter(|(key, _)| namespace.map(|ns| key.namespace == ns).unwrap_or(true))
            .filter(|(_, value)| selector_matches(selector, &labels_of(value)))
            .map(|(_, value)| value.clone())
            .collect())
    }

    fn do_create(&self, kind: ResourceKind, namespace: &str, mut object: Value) -> Result<Value, ClusterError> {
        let mut state = self.state();
        state.record_call(kind, Verb::Create)?;

        let name = match meta_str(&object, "name") {
            Some(name) => name,
            None => match meta_str(&object, "generateName") {
                Some(prefix) => {
                    let suffix = state.next_uid();
                    format!("{}{}", prefix, &suffix[suffix.len() - 5..])
                }
                None => {
                    return Err(ClusterError::Invalid {
                        message: format!("{} requires metadata.name", kind),
                    })
                }
            },
        };
        let key = ObjectKey {
            kind,
            namespace: namespace.to_string(),
            name: name.clone(),
        };
        if state.objects.contains_key(&key) {
            return Err(ClusterError::AlreadyExists { kind, name });
        }

        let resource_version = state.next_resource_version();
        let uid = state.next_uid();
        let meta = metadata_mut(&mut object)?;
        meta.insert("name".to_string(), Value::String(name));
        meta.insert("namespace".to_string(), Value::String(namespace.to_string()));
        meta.insert("uid".to_string(), Value::String(uid));
        meta.insert("resourceVersion".to_string(), Value::String(resource_version));
        meta.insert("generation".to_string(), Value::from(1));
        meta.insert(
            "creationTimestamp".to_string(),
            Value::String(Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)),
        );
        if kind.has_status_subresource() {
            if let Value::Object(map) = &mut object {
                map.remove("status");
            }
        }

        state.objects.insert(key, object.clone());
        Ok(object)
    }

    fn do_update(
        &self,
        kind: ResourceKind,
        namespace: &str,
        mut object: Value,
        verb: Verb,
    ) -> Result<Value, ClusterError> {
        let mut state = self.state();
        state.record_call(kind, verb)?;

        let name = meta_str(&object, "name").ok_or_else(|| ClusterError::Invalid {
            message: format!("{} update requires metadata.name", kind),
        })?;
        let key = ObjectKey {
            kind,
            namespace: namespace.to_string(),
            name: name.clone(),
        };
        let Some(stored) = state.objects.get(&key).cloned() else {
            return Err(ClusterError::NotFound { kind, name });
        };

        let stored_version = meta_str(&stored, "resourceVersion");
        if let Some(expected) = meta_str(&object, "resourceVersion") {
            if Some(&expected) != stored_version.as_ref() {
                return Err(ClusterError::Conflict {
                    kind,
                    name,
                    message: "the object has been modified; please apply your changes to the latest version and try again".to_string(),
                });
            }
        }

        let mut next = match verb {
            Verb::UpdateStatus => {
                let mut next = stored.clone();
                let status = object
                    .as_object_mut()
                    .and_then(|map| map.remove("status"))
                    .unwrap_or(Value::Null);
                if let Value::Object(map) = &mut next {
                    map.insert("status".to_string(), status);
                }
                next
            }
            _ => {
                if kind.has_status_subresource() {
                    if let (Value::Object(map), Some(status)) = (&mut object, stored.get("status")) {
                        map.insert("status".to_string(), status.clone());
                    } else if let Value::Object(map) = &mut object {
                        map.remove("status");
                    }
                }
                let generation = stored
                    .pointer("/metadata/generation")
                    .and_then(Value::as_i64)
                    .unwrap_or(1);
                let spec_changed = stored.get("spec") != object.get("spec");
                let meta = metadata_mut(&mut object)?;
                for preserved in ["uid", "creationTimestamp", "deletionTimestamp"] {
                    match stored.pointer(&format!("/metadata/{}", preserved)) {
                        Some(value) => {
                            meta.insert(preserved.to_string(), value.clone());
                        }
                        None => {
                            meta.remove(preserved);
                        }
                    }
                }
                meta.insert(
                    "generation".to_string(),
                    Value::from(if spec_changed { generation + 1 } else { generation }),
                );
                object
            }
        };

        let resource_version = state.next_resource_version();
        metadata_mut(&mut next)?.insert("resourceVersion".to_string(), Value::String(resource_version));
        state.objects.insert(key, next.clone());
        Ok(next)
    }

    fn do_delete(
        &self,
        kind: ResourceKind,
        namespace: &str,
        name: &str,
        resource_version: Option<&str>,
    ) -> Result<(), ClusterError> {
        let mut state = self.state();
        state.record_call(kind, Verb::Delete)?;
        let key = ObjectKey {
            kind,
            namespace: namespace.to_string(),
            name: name.to_string(),
        };
        let Some(stored) = state.objects.get(&key) else {
            return Err(ClusterError::NotFound {
                kind,
                name: name.to_string(),
            });
        };
        if let Some(expected) = resource_version {
            if meta_str(stored, "resourceVersion").as_deref() != Some(expected) {
                return Err(ClusterError::Conflict {
                    kind,
                    name: name.to_string(),
                    message: "precondition failed: resourceVersion mismatch".to_string(),
                });
            }
        }

        let mut doomed = BTreeSet::new();
        if let Some(uid) = meta_str(stored, "uid") {
            doomed.insert(uid);
        }
        state.objects.remove(&key);

        // Cascade to dependents controlled by anything removed so far.
        while !doomed.is_empty() {
            let dependents: Vec<ObjectKey> = state
                .objects
                .iter()
                .filter(|(_, value)| {
                    controller_uid(value)
                        .map(|uid| doomed.contains(&uid))
                        .unwrap_or(false)
                })
                .map(|(key, _)| key.clone())
                .collect();
            doomed.clear();
            for dependent in dependents {
                if let Some(value) = state.objects.remove(&dependent) {
                    if let Some(uid) = meta_str(&value, "uid") {
                        doomed.insert(uid);
                    }
                }
            }
        }
        Ok(())
    }

    fn do_exec(&self, request: &ExecRequest) -> Result<ExecOutcome, ClusterError> {
        let key = ObjectKey {
            kind: ResourceKind::Pod,
            namespace: request.namespace.clone(),
            name: request.pod.clone(),
        };
        if !self.state().objects.contains_key(&key) {
            return Err(ClusterError::NotFound {
                kind: ResourceKind::Pod,
                name: request.pod.clone(),
            });
        }
        let handler = self
            .exec_handler
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        match handler {
            Some(handler) => Ok(handler(request)),
            None => Err(ClusterError::Api {
                status: 501,
                message: "exec is not configured".to_string(),
            }),
        }
    }
}

impl ClusterClient for InMemoryCluster {
    fn get<'a>(
        &'a self,
        kind: ResourceKind,
        namespace: &'a str,
        name: &'a str,
    ) -> ClientFuture<'a, Option<Value>> {
        Box::pin(async move { self.do_get(kind, namespace, name) })
    }

    fn list<'a>(
        &'a self,
        kind: ResourceKind,
        namespace: Option<&'a str>,
        selector: &'a Selector,
    ) -> ClientFuture<'a, Vec<Value>> {
        Box::pin(async move { self.do_list(kind, namespace, selector) })
    }

    fn create<'a>(
        &'a self,
        kind: ResourceKind,
        namespace: &'a str,
        object: Value,
    ) -> ClientFuture<'a, Value> {
        Box::pin(async move { self.do_create(kind, namespace, object) })
    }

    fn update<'a>(
        &'a self,
        kind: ResourceKind,
        namespace: &'a str,
        object: Value,
    ) -> ClientFuture<'a, Value> {
        Box::pin(async move { self.do_update(kind, namespace, object, Verb::Update) })
    }

    fn update_status<'a>(
        &'a self,
        kind: ResourceKind,
        namespace: &'a str,
        object: Value,
    ) -> ClientFuture<'a, Value> {
        Box::pin(async move { self.do_update(kind, namespace, object, Verb::UpdateStatus) })
    }

    fn delete<'a>(
        &'a self,
        kind: ResourceKind,
        namespace: &'a str,
        name: &'a str,
        resource_version: Option<&'a str>,
    ) -> ClientFuture<'a, ()> {
        Box::pin(async move { self.do_delete(kind, namespace, name, resource_version) })
    }

    fn exec<'a>(&'a self, request: &'a ExecRequest) -> ClientFuture<'a, ExecOutcome> {
        Box::pin(async move { self.do_exec(request) })
    }
}

fn meta_str(object: &Value, field: &str) -> Option<String> {
    object
        .get("metadata")
        .and_then(|meta| meta.get(field))
        .and_then(Value::as_str)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

fn labels_of(object: &Value) -> BTreeMap<String, String> {
    object
        .pointer("/metadata/labels")
        .and_then(Value::as_object)
        .map(|labels| {
            labels
                .iter()
                .filter_map(|(key, value)| value.as_str().map(|v| (key.clone(), v.to_string())))
                .collect()
        })
        .unwrap_or_default()
}

fn controller_uid(object: &Value) -> Option<String> {
    object
        .pointer("/metadata/ownerReferences")
        .and_then(Value::as_array)?
        .iter()
        .find(|reference| reference.get("controller").and_then(Value::as_bool) == Some(true))
        .and_then(|reference| reference.get("uid"))
        .and_then(Value::as_str)
        .map(str::to_string)
}

fn metadata_mut(object: &mut Value) -> Result<&mut Map<String, Value>, ClusterError> {
    let map = object.as_object_mut().ok_or_else(|| ClusterError::Invalid {
        message: "object must be a JSON map".to_string(),
    })?;
    let meta = map
        .entry("metadata".to_string())
        .or_insert_with(|| Value::Object(Map::new()));
    meta.as_object_mut().ok_or_else(|| ClusterError::Invalid {
        message: "metadata must be a JSON map".to_string(),
    })
}
