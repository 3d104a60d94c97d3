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

//! Probe evaluation for active/passive election. Exec probes run through
//! the cluster client; HTTP and TCP probes dial the pod IP directly. A probe
//! that times out counts as a failure.

use std::error::Error;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use reqwest::Client;
use tokio::net::TcpStream;

use crate::quarks::k8s::client::{ClusterClient, ExecRequest};
use crate::quarks::k8s::pod::{
    ContainerSpec, ExecAction, HttpGetAction, Pod, Probe, TcpSocketAction,
};
use crate::quarks::logger::log_debug;
use crate::quarks::observability::metrics;
use crate::quarks::util::error::with_context;

const COMPONENT: &str = "probe";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProbeOutcome {
    Success,
    Failure,
    /// The probe could not be evaluated (no handler, no pod IP, unknown port).
    Unknown,
}

impl ProbeOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            ProbeOutcome::Success => "success",
            ProbeOutcome::Failure => "failure",
            ProbeOutcome::Unknown => "unknown",
        }
    }
}

pub type ProbeFuture<'a> = Pin<Box<dyn Future<Output = ProbeOutcome> + Send + 'a>>;

/// Runs a single probe handler against one container of a pod.
pub trait ProbeRunner: Send + Sync {
    fn run<'a>(&'a self, pod: &'a Pod, container: &'a ContainerSpec, probe: &'a Probe)
        -> ProbeFuture<'a>;
}

pub fn handler_name(probe: &Probe) -> &'static str {
    if probe.exec.is_some() {
        "exec"
    } else if probe.http_get.is_some() {
        "httpGet"
    } else if probe.tcp_socket.is_some() {
        "tcpSocket"
    } else {
        "none"
    }
}

pub fn probe_timeout(probe: &Probe) -> Duration {
    probe
        .timeout_seconds
        .filter(|seconds| *seconds > 0)
        .map(|seconds| Duration::from_secs(seconds as u64))
        .unwrap_or(DEFAULT_TIMEOUT)
}

/// Runs `probe` under its timeout and records the outcome. A timeout is a
/// failure.
pub async fn evaluate(
    runner: &dyn ProbeRunner,
    pod: &Pod,
    container: &ContainerSpec,
    probe: &Probe,
) -> ProbeOutcome {
    let outcome = match tokio::time::timeout(probe_timeout(probe), runner.run(pod, container, probe))
        .await
    {
        Ok(outcome) => outcome,
        Err(_) => ProbeOutcome::Failure,
    };
    let handler = handler_name(probe);
    metrics::record_probe_result(handler, outcome.as_str());
    log_debug(
        COMPONENT,
        "Probe evaluated",
        &[
            ("pod", pod.metadata.name_or_empty()),
            ("container", container.name.as_str()),
            ("handler", handler),
            ("outcome", outcome.as_str()),
        ],
    );
    outcome
}

/// Probes pods through the cluster API (exec) and the pod network (HTTP, TCP).
pub struct ClusterProbeRunner {
    client: Arc<dyn ClusterClient>,
    http: Client,
}

impl ClusterProbeRunner {
    pub fn new(client: Arc<dyn ClusterClient>) -> Result<Self, Box<dyn Error + Send + Sync>> {
        // Like the kubelet, HTTPS probes do not verify the serving certificate.
        let http = Client::builder()
            .danger_accept_invalid_certs(true)
            .build()
            .map_err(|e| with_context(e, "Failed to build probe HTTP client"))?;
        Ok(Self { client, http })
    }

    async fn exec(&self, pod: &Pod, container: &ContainerSpec, action: &ExecAction) -> ProbeOutcome {
        if action.command.is_empty() {
            return ProbeOutcome::Unknown;
        }
        let request = ExecRequest {
            namespace: pod.metadata.namespace_or_default().to_string(),
            pod: pod.metadata.name_or_empty().to_string(),
            container: container.name.clone(),
            command: action.command.clone(),
        };
        match self.client.exec(&request).await {
            Ok(outcome) if outcome.success() => ProbeOutcome::Success,
            Ok(_) => ProbeOutcome::Failure,
            Err(err) => {
                let error_text = err.to_string();
                log_debug(
                    COMPONENT,
                    "Exec probe failed to run",
                    &[
                        ("pod", request.pod.as_str()),
                        ("container", request.container.as_str()),
                        ("error", error_text.as_str()),
                    ],
                );
                ProbeOutcome::Failure
            }
        }
    }

    async fn http_get(
        &self,
        pod: &Pod,
        container: &ContainerSpec,
        action: &HttpGetAction,
    ) -> ProbeOutcome {
        let Some(url) = http_probe_url(pod, container, action) else {
            return ProbeOutcome::Unknown;
        };
        let mut request = self.http.get(url);
        for header in &action.http_headers {
            request = request.header(header.name.as_str(), header.value.as_str());
        }
        match request.send().await {
            Ok(response) if (200..400).contains(&response.status().as_u16()) => {
                ProbeOutcome::Success
            }
            _ => ProbeOutcome::Failure,
        }
    }

    async fn tcp_socket(
        &self,
        pod: &Pod,
        container: &ContainerSpec,
        action: &TcpSocketAction,
    ) -> ProbeOutcome {
        let host = action.host.as_deref().or_else(|| pod.pod_ip());
        let (Some(host), Some(port)) = (host, container.resolve_port(&action.port)) else {
            return ProbeOutcome::Unknown;
        };
        match TcpStream::connect((host, port)).await {
            Ok(_) => ProbeOutcome::Success,
            Err(_) => ProbeOutcome::Failure,
        }
    }
}

impl ProbeRunner for ClusterProbeRunner {
    fn run<'a>(
        &'a self,
        pod: &'a Pod,
        container: &'a ContainerSpec,
        probe: &'a Probe,
    ) -> ProbeFuture<'a> {
        Box::pin(async move {
            if let Some(action) = probe.exec.as_ref() {
                self.exec(pod, container, action).await
            } else if let Some(action) = probe.http_get.as_ref() {
                self.http_get(pod, container, action).await
            } else if let Some(action) = probe.tcp_socket.as_ref() {
                self.tcp_socket(pod, container, action).await
            } else {
                ProbeOutcome::Unknown
            }
        })
    }
}

/// `scheme://host:port/path` for an httpGet probe; host defaults to the pod IP.
pub fn http_probe_url(pod: &Pod, container: &ContainerSpec, action: &HttpGetAction) -> Option<String> {
    let host = action.host.as_deref().or_else(|| pod.pod_ip())?;
    let port = container.resolve_port(&action.port)?;
    let scheme = action
        .scheme
        .as_deref()
        .map(str::to_ascii_lowercase)
        .unwrap_or_else(|| "http".to_string());
    let host = if host.contains(':') && !host.starts_with('[') {
        format!("[{}]", host)
    } else {
        host.to_string()
    };
    let path = action.path.as_deref().unwrap_or("/");
    let separator = if path.starts_with('/') { "" } else { "/" };
    Some(format!("{}://{}:{}{}{}", scheme, host, port, separator, path))
}
