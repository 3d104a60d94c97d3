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
use serde::{Deserialize, Serialize};

/// Kubernetes `OwnerReference` linking a child object back to its controller.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OwnerReference {
    pub api_version: String,
    pub kind: String,
    pub name: String,
    #[serde(default)]
    pub uid: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub controller: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub block_owner_deletion: Option<bool>,
}

impl OwnerReference {
    /// Builds a controlling reference to `owner`.
    pub fn controller_of(api_version: &str, kind: &str, owner: &ObjectMeta) -> Self {
        Self {
            api_version: api_version.to_string(),
            kind: kind.to_string(),
            name: owner.name_or_empty().to_string(),
            uid: owner.uid.clone().unwrap_or_default(),
            controller: Some(true),
            block_owner_deletion: Some(true),
        }
    }

    pub fn is_controller(&self) -> bool {
        self.controller.unwrap_or(false)
    }
}

/// Returns the controlling owner of `meta`, if any.
pub fn controller_of(meta: &ObjectMeta) -> Option<&OwnerReference> {
    meta.owner_references
        .iter()
        .find(|reference| reference.is_controller())
}

/// True when `child` is controlled by an object of `kind` named `name`.
/// An owner with a known UID must match it as well.
pub fn is_controlled_by(child: &ObjectMeta, kind: &str, owner: &ObjectMeta) -> bool {
    match controller_of(child) {
        Some(reference) => {
            reference.kind == kind
                && reference.name == owner.name_or_empty()
                && match owner.uid.as_deref() {
                    Some(uid) if !reference.uid.is_empty() => reference.uid == uid,
                    _ => true,
                }
        }
        None => false,
    }
}

/// Adds or replaces the controlling owner reference on `child`.
pub fn set_controller(child: &mut ObjectMeta, reference: OwnerReference) {
    child
        .owner_references
        .retain(|existing| !existing.is_controller());
    child.owner_references.push(reference);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn owner() -> ObjectMeta {
        ObjectMeta {
            uid: Some("uid-1".to_string()),
            ..ObjectMeta::named("default", "web")
        }
    }

    #[test]
    fn controller_reference_is_recognised() {
        let mut child = ObjectMeta::named("default", "web-v1");
        set_controller(
            &mut child,
            OwnerReference::controller_of("quarks.cloudfoundry.org/v1alpha1", "QuarksStatefulSet", &owner()),
        );
        assert!(is_controlled_by(&child, "QuarksStatefulSet", &owner()));

        let other = ObjectMeta {
            uid: Some("uid-2".to_string()),
            ..ObjectMeta::named("default", "web")
        };
        assert!(!is_controlled_by(&child, "QuarksStatefulSet", &other));
    }

    #[test]
    fn set_controller_replaces_previous_controller() {
        let mut child = ObjectMeta::named("default", "web-v1");
        let first = OwnerReference::controller_of("v1", "A", &owner());
        let second = OwnerReference::controller_of("v1", "B", &owner());
        set_controller(&mut child, first);
        set_controller(&mut child, second);
        assert_eq!(child.owner_references.len(), 1);
        assert_eq!(child.owner_references[0].kind, "B");
    }
}
