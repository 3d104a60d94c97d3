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

//! Startup ordinal bookkeeping.
//!
//! Pods keep their StatefulSet ordinal across versions, but the order in
//! which they may start is tracked separately per revision: the pod that was
//! active before a rollout starts first afterwards. The whole table lives in
//! one annotation on the QuarksStatefulSet.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Pod ordinal (as string) to startup ordinal (as string).
pub type Ordinals = BTreeMap<String, String>;

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Revisions(BTreeMap<String, Ordinals>);

/// Result of reading the revisions annotation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RevisionsDecode {
    Absent,
    Parsed(Revisions),
    Malformed(String),
}

impl RevisionsDecode {
    pub fn into_revisions(self) -> Revisions {
        match self {
            RevisionsDecode::Parsed(revisions) => revisions,
            RevisionsDecode::Absent | RevisionsDecode::Malformed(_) => Revisions::default(),
        }
    }
}

impl Revisions {
    pub fn decode(annotation: Option<&str>) -> RevisionsDecode {
        let Some(raw) = annotation.map(str::trim).filter(|raw| !raw.is_empty()) else {
            return RevisionsDecode::Absent;
        };
        match serde_json::from_str::<Revisions>(raw) {
            Ok(revisions) => RevisionsDecode::Parsed(revisions),
            Err(err) => RevisionsDecode::Malformed(err.to_string()),
        }
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn contains(&self, revision: &str) -> bool {
        self.0.contains_key(revision)
    }

    pub fn ordinals(&self, revision: &str) -> Option<&Ordinals> {
        self.0.get(revision)
    }

    /// `None` means no assignment: the pod ordinal doubles as startup ordinal.
    pub fn startup_ordinal(&self, revision: &str, pod_ordinal: &str) -> Option<&str> {
        self.0
            .get(revision)
            .and_then(|ordinals| ordinals.get(pod_ordinal))
            .map(String::as_str)
    }

    pub fn set(&mut self, revision: &str, pod_ordinal: &str, startup_ordinal: &str) {
        self.0
            .entry(revision.to_string())
            .or_default()
            .insert(pod_ordinal.to_string(), startup_ordinal.to_string());
    }

    /// Returns the existing assignment, or records the smallest free startup
    /// ordinal of the revision.
    pub fn assign(&mut self, revision: &str, pod_ordinal: &str) -> String {
        let ordinals = self.0.entry(revision.to_string()).or_default();
        if let Some(existing) = ordinals.get(pod_ordinal) {
            return existing.clone();
        }
        let used: BTreeSet<u64> = ordinals
            .values()
            .filter_map(|value| value.parse::<u64>().ok())
            .collect();
        let free = (0u64..)
            .find(|candidate| !used.contains(candidate))
            .unwrap_or_default()
            .to_string();
        ordinals.insert(pod_ordinal.to_string(), free.clone());
        free
    }

    /// Fills a fresh `revision` from `previous_revision`.
    ///
    /// `active` goes first, then the remaining pods by their previous
    /// startup ordinal and finally by pod ordinal. Returns false and changes
    /// nothing when `revision` already exists or `previous_revision` does not.
    pub fn seed(
        &mut self,
        revision: &str,
        previous_revision: &str,
        pod_ordinals: &[u32],
        active: Option<u32>,
    ) -> bool {
        if self.0.contains_key(revision) {
            return false;
        }
        let Some(previous) = self.0.get(previous_revision) else {
            return false;
        };

        let mut order: Vec<u32> = pod_ordinals.to_vec();
        order.sort_by_key(|ordinal| {
            let previous_startup = previous
                .get(&ordinal.to_string())
                .and_then(|value| value.parse::<u64>().ok())
                .unwrap_or(u64::MAX);
            (Some(*ordinal) != active, previous_startup, *ordinal)
        });
        order.dedup();

        let seeded: Ordinals = order
            .iter()
            .enumerate()
            .map(|(startup, ordinal)| (ordinal.to_string(), startup.to_string()))
            .collect();
        self.0.insert(revision.to_string(), seeded);
        true
    }

    /// Drops every revision not in `live`. Returns true when something was removed.
    pub fn prune<'a, I>(&mut self, live: I) -> bool
    where
        I: IntoIterator<Item = &'a str>,
    {
        let live: BTreeSet<&str> = live.into_iter().collect();
        let before = self.0.len();
        self.0.retain(|revision, _| live.contains(revision.as_str()));
        self.0.len() != before
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_then_lookup() {
        let mut revisions = Revisions::default();
        revisions.set("rev-a", "0", "5");
        assert_eq!(revisions.startup_ordinal("rev-a", "0"), Some("5"));
        assert_eq!(revisions.startup_ordinal("rev-a", "9"), None);
        assert_eq!(revisions.startup_ordinal("rev-b", "0"), None);

        revisions.set("rev-a", "0", "5");
        assert_eq!(revisions.ordinals("rev-a").map(BTreeMap::len), Some(1));
    }

    #[test]
    fn assign_uses_smallest_free_ordinal_and_keeps_existing() {
        let mut revisions = Revisions::default();
        revisions.set("rev", "0", "1");
        assert_eq!(revisions.assign("rev", "1"), "0");
        assert_eq!(revisions.assign("rev", "2"), "2");
        // Scale-up leaves earlier assignments alone.
        assert_eq!(revisions.assign("rev", "0"), "1");
        assert_eq!(revisions.assign("rev", "3"), "3");
        assert_eq!(revisions.startup_ordinal("rev", "0"), Some("1"));
    }

    #[test]
    fn seed_puts_the_active_pod_first() {
        let mut revisions = Revisions::default();
        revisions.set("old", "0", "0");
        revisions.set("old", "1", "1");
        revisions.set("old", "2", "2");

        assert!(revisions.seed("new", "old", &[0, 1, 2], Some(2)));
        assert_eq!(revisions.startup_ordinal("new", "2"), Some("0"));
        assert_eq!(revisions.startup_ordinal("new", "0"), Some("1"));
        assert_eq!(revisions.startup_ordinal("new", "1"), Some("2"));

        assert!(!revisions.seed("new", "old", &[0, 1, 2], Some(0)), "existing revisions are kept");
        assert!(!revisions.seed("other", "missing", &[0], None));
    }

    #[test]
    fn seed_orders_by_previous_startup_ordinal() {
        let mut revisions = Revisions::default();
        revisions.set("old", "0", "2");
        revisions.set("old", "1", "0");
        revisions.set("old", "2", "1");

        assert!(revisions.seed("new", "old", &[0, 1, 2, 3], None));
        let ordinals = revisions.ordinals("new").expect("seeded");
        assert_eq!(ordinals.get("1").map(String::as_str), Some("0"));
        assert_eq!(ordinals.get("2").map(String::as_str), Some("1"));
        assert_eq!(ordinals.get("0").map(String::as_str), Some("2"));
        assert_eq!(ordinals.get("3").map(String::as_str), Some("3"));
    }

    #[test]
    fn prune_keeps_live_revisions() {
        let mut revisions = Revisions::default();
        revisions.set("a", "0", "0");
        revisions.set("b", "0", "0");
        assert!(revisions.prune(["b"]));
        assert!(!revisions.contains("a"));
        assert!(revisions.contains("b"));
        assert!(!revisions.prune(["b"]));
    }

    #[test]
    fn decode_distinguishes_absent_parsed_and_malformed() {
        assert_eq!(Revisions::decode(None), RevisionsDecode::Absent);
        assert_eq!(Revisions::decode(Some("  ")), RevisionsDecode::Absent);

        let mut revisions = Revisions::default();
        revisions.set("rev", "0", "1");
        let encoded = revisions.encode().expect("encodes");
        assert_eq!(encoded, r#"{"rev":{"0":"1"}}"#);
        assert_eq!(
            Revisions::decode(Some(&encoded)),
            RevisionsDecode::Parsed(revisions)
        );

        let malformed = Revisions::decode(Some("{not json"));
        assert!(matches!(malformed, RevisionsDecode::Malformed(_)));
        assert!(malformed.into_revisions().is_empty());
    }
}
