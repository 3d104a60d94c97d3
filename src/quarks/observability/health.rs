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

use serde::Serialize;
use std::time::Duration;

use crate::quarks::k8s::client::{ClusterClient, ResourceKind, Selector};

const ERROR_MAX_LEN: usize = 240;
const API_CHECK_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone, Debug, Serialize)]
pub struct ComponentHealth {
    pub name: &'static str,
    pub healthy: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ComponentHealth {
    fn healthy(name: &'static str) -> Self {
        ComponentHealth {
            name,
            healthy: true,
            error: None,
        }
    }

    fn unhealthy(name: &'static str, err: impl ToString) -> Self {
        let mut message = err.to_string();
        if message.len() > ERROR_MAX_LEN {
            let mut cut = ERROR_MAX_LEN;
            while !message.is_char_boundary(cut) {
                cut -= 1;
            }
            message.truncate(cut);
        }
        ComponentHealth {
            name,
            healthy: false,
            error: Some(message),
        }
    }
}

#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Ready,
    Degraded,
}

#[derive(Clone, Debug, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub components: Vec<ComponentHealth>,
}

impl HealthReport {
    fn from_components(components: Vec<ComponentHealth>) -> Self {
        let status = if components.iter().all(|component| component.healthy) {
            HealthStatus::Ready
        } else {
            HealthStatus::Degraded
        };
        HealthReport { status, components }
    }

    pub fn is_ready(&self) -> bool {
        self.status == HealthStatus::Ready
    }
}

/// Readiness for `/readyz`: the API server answers a QuarksStatefulSet list
/// and the worker pool is running.
pub async fn readiness_report(
    client: &dyn ClusterClient,
    namespace: Option<&str>,
    workers_started: bool,
) -> HealthReport {
    let mut components = Vec::with_capacity(2);

    let selector = Selector::new();
    let check = client.list(ResourceKind::QuarksStatefulSet, namespace, &selector);
    match tokio::time::timeout(API_CHECK_TIMEOUT, check).await {
        Ok(Ok(_)) => components.push(ComponentHealth::healthy("cluster_api")),
        Ok(Err(err)) => components.push(ComponentHealth::unhealthy("cluster_api", err)),
        Err(_) => components.push(ComponentHealth::unhealthy(
            "cluster_api",
            format!("no answer within {}s", API_CHECK_TIMEOUT.as_secs()),
        )),
    }

    if workers_started {
        components.push(ComponentHealth::healthy("workers"));
    } else {
        components.push(ComponentHealth::unhealthy("workers", "worker pool not started"));
    }

    HealthReport::from_components(components)
}

/// Liveness only confirms the process is serving requests.
pub fn liveness_report() -> HealthReport {
    HealthReport::from_components(vec![ComponentHealth::healthy("process")])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quarks::k8s::client::{ClusterError, ResourceKind};
    use crate::quarks::k8s::memory::{InMemoryCluster, Verb};

    #[tokio::test]
    async fn readiness_reflects_api_and_workers() {
        let cluster = InMemoryCluster::new();
        let report = readiness_report(&cluster, None, true).await;
        assert!(report.is_ready());

        let report = readiness_report(&cluster, None, false).await;
        assert_eq!(report.status, HealthStatus::Degraded);

        cluster.inject_fault(
            ResourceKind::QuarksStatefulSet,
            Verb::List,
            ClusterError::Transient {
                message: "connection refused".to_string(),
            },
            1,
        );
        let report = readiness_report(&cluster, None, true).await;
        assert!(!report.is_ready());
        let api = report
            .components
            .iter()
            .find(|component| component.name == "cluster_api")
            .expect("api component");
        assert!(api.error.as_deref().unwrap_or_default().contains("connection refused"));
    }

    #[test]
    fn liveness_is_always_ready() {
        let report = liveness_report();
        assert!(report.is_ready());
        let json = serde_json::to_value(&report).expect("serializable");
        assert_eq!(json["status"], "ready");
    }
}
