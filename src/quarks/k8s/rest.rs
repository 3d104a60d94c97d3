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

//! [`ClusterClient`] backed by the Kubernetes REST API.

use std::env;
use std::error::Error;
use std::fs;
use std::path::PathBuf;
use std::pin::Pin;
use std::time::Duration;

use futures_util::StreamExt;
use openssl::ssl::{SslConnector, SslMethod};
use openssl::x509::X509;
use reqwest::tls::Certificate;
use reqwest::{Client, Method, StatusCode, Url};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::time::sleep;
use tokio_openssl::SslStream;
use tokio_tungstenite::client_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::{HeaderValue, AUTHORIZATION, SEC_WEBSOCKET_PROTOCOL};
use tokio_tungstenite::tungstenite::Message;

use super::client::{
    ClientFuture, ClusterClient, ClusterError, ExecOutcome, ExecRequest, ResourceKind, Selector,
};
use super::pod::ObjectList;
use crate::quarks::config::OperatorConfig;
use crate::quarks::util::error::{new_error, with_context};

const SERVICE_HOST_ENV: &str = "KUBERNETES_SERVICE_HOST";
const SERVICE_PORT_ENV: &str = "KUBERNETES_SERVICE_PORT";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const RETRY_ATTEMPTS: usize = 3;
const RETRY_BACKOFF: Duration = Duration::from_millis(200);
const MAX_BACKOFF: Duration = Duration::from_secs(2);
const EXEC_PROTOCOL: &str = "v4.channel.k8s.io";
const CHANNEL_STDOUT: u8 = 1;
const CHANNEL_STDERR: u8 = 2;
const CHANNEL_STATUS: u8 = 3;

fn should_retry_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

fn is_retryable_reqwest(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect()
}

fn next_backoff(current: Duration) -> Duration {
    current
        .checked_mul(2)
        .unwrap_or(MAX_BACKOFF)
        .min(MAX_BACKOFF)
}

/// Body of a `meta/v1` Status returned with failed requests.
#[derive(Debug, Default, Deserialize)]
struct StatusBody {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    reason: Option<String>,
    #[serde(default)]
    details: Option<StatusDetails>,
}

#[derive(Debug, Default, Deserialize)]
struct StatusDetails {
    #[serde(default)]
    causes: Vec<StatusCause>,
}

#[derive(Debug, Default, Deserialize)]
struct StatusCause {
    #[serde(default)]
    reason: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

fn status_error(status: StatusCode, body: &str, kind: ResourceKind, name: &str) -> ClusterError {
    let parsed: StatusBody = serde_json::from_str(body).unwrap_or_default();
    let message = parsed
        .message
        .clone()
        .filter(|message| !message.is_empty())
        .unwrap_or_else(|| {
            status
                .canonical_reason()
                .unwrap_or("request failed")
                .to_string()
        });
    match status {
        StatusCode::NOT_FOUND => ClusterError::NotFound {
            kind,
            name: name.to_string(),
        },
        StatusCode::CONFLICT if parsed.reason.as_deref() == Some("AlreadyExists") => {
            ClusterError::AlreadyExists {
                kind,
                name: name.to_string(),
            }
        }
        StatusCode::CONFLICT => ClusterError::Conflict {
            kind,
            name: name.to_string(),
            message,
        },
        StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => {
            ClusterError::Invalid { message }
        }
        _ => ClusterError::Api {
            status: status.as_u16(),
            message,
        },
    }
}

/// Where the API server lives and how to authenticate to it.
#[derive(Clone, Debug)]
pub struct RestConfig {
    pub server: Url,
    pub token_file: Option<PathBuf>,
    pub ca_pem: Option<Vec<u8>>,
}

impl RestConfig {
    /// Resolves the API server from flags, falling back to the in-cluster service environment.
    pub fn from_operator_config(
        config: &OperatorConfig,
    ) -> Result<Self, Box<dyn Error + Send + Sync>> {
        let server = match config.api_server.as_deref() {
            Some(server) => server.to_string(),
            None => {
                let host = env::var(SERVICE_HOST_ENV).map_err(|_| {
                    new_error(format!(
                        "{} is not set; pass --api-server when running outside the cluster",
                        SERVICE_HOST_ENV
                    ))
                })?;
                let port = env::var(SERVICE_PORT_ENV).unwrap_or_else(|_| "443".to_string());
                if host.contains(':') {
                    format!("https://[{}]:{}", host, port)
                } else {
                    format!("https://{}:{}", host, port)
                }
            }
        };
        let server = Url::parse(&server)
            .map_err(|e| with_context(e, format!("Invalid API server URL '{}'", server)))?;

        let ca_pem = if config.ca_file.exists() {
            Some(fs::read(&config.ca_file).map_err(|e| {
                with_context(e, format!("Failed to read CA bundle '{}'", config.ca_file.display()))
            })?)
        } else {
            None
        };
        let token_file = Some(config.token_file.clone()).filter(|path| path.exists());

        Ok(Self {
            server,
            token_file,
            ca_pem,
        })
    }
}

pub struct RestClusterClient {
    http: Client,
    config: RestConfig,
}

impl RestClusterClient {
    pub fn new(config: RestConfig) -> Result<Self, Box<dyn Error + Send + Sync>> {
        let mut builder = Client::builder().timeout(REQUEST_TIMEOUT);
        if let Some(ca_pem) = config.ca_pem.as_deref() {
            let certificate = Certificate::from_pem(ca_pem)
                .map_err(|e| with_context(e, "Failed to parse API server CA bundle"))?;
            builder = builder.add_root_certificate(certificate);
        }
        let http = builder
            .build()
            .map_err(|e| with_context(e, "Failed to build HTTP client"))?;
        Ok(Self { http, config })
    }

    fn bearer_token(&self) -> Option<String> {
        // Projected service account tokens rotate; always read the current one.
        let path = self.config.token_file.as_ref()?;
        fs::read_to_string(path)
            .ok()
            .map(|token| token.trim().to_string())
            .filter(|token| !token.is_empty())
    }

    fn apply_auth(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self.bearer_token() {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    pub fn url_from_segments(&self, segments: &[&str]) -> Result<Url, ClusterError> {
        let mut url = self.config.server.clone();
        {
            let mut parts = url.path_segments_mut().map_err(|_| ClusterError::Invalid {
                message: "API server URL cannot be a base".to_string(),
            })?;
            parts.clear();
            for segment in segments {
                if !segment.is_empty() {
                    parts.push(segment);
                }
            }
        }
        Ok(url)
    }

    fn resource_url(
        &self,
        kind: ResourceKind,
        namespace: Option<&str>,
        name: Option<&str>,
        subresource: Option<&str>,
    ) -> Result<Url, ClusterError> {
        let mut segments: Vec<&str> = Vec::with_capacity(8);
        match kind.group() {
            "" => segments.extend(["api", kind.version()]),
            group => segments.extend(["apis", group, kind.version()]),
        }
        if let Some(namespace) = namespace {
            segments.extend(["namespaces", namespace]);
        }
        segments.push(kind.plural());
        if let Some(name) = name {
            segments.push(name);
        }
        if let Some(subresource) = subresource {
            segments.push(subresource);
        }
        self.url_from_segments(&segments)
    }

    async fn send(
        &self,
        method: Method,
        url: Url,
        body: Option<&Value>,
    ) -> Result<reqwest::Response, ClusterError> {
        let mut backoff = RETRY_BACKOFF;
        let mut attempt = 0;
        loop {
            attempt += 1;
            let mut request = self.apply_auth(self.http.request(method.clone(), url.clone()));
            if let Some(body) = body {
                request = request.json(body);
            }
            match request.send().await {
                Ok(response)
                    if should_retry_status(response.status()) && attempt < RETRY_ATTEMPTS => {}
                Ok(response) => return Ok(response),
                Err(err) if is_retryable_reqwest(&err) && attempt < RETRY_ATTEMPTS => {}
                Err(err) => {
                    return Err(ClusterError::Transient {
                        message: err.to_string(),
                    })
                }
            }
            sleep(backoff).await;
            backoff = next_backoff(backoff);
        }
    }

    async fn handle_json(
        response: reqwest::Response,
        kind: ResourceKind,
        name: &str,
    ) -> Result<Value, ClusterError> {
        let status = response.status();
        if status.is_success() {
            return response
                .json::<Value>()
                .await
                .map_err(|err| ClusterError::Serialization(err.to_string()));
        }
        let text = response.text().await.unwrap_or_default();
        Err(status_error(status, &text, kind, name))
    }

    async fn write(
        &self,
        method: Method,
        kind: ResourceKind,
        namespace: &str,
        object: Value,
        subresource: Option<&str>,
    ) -> Result<Value, ClusterError> {
        let name = object
            .pointer("/metadata/name")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let url = if method == Method::POST {
            self.resource_url(kind, Some(namespace), None, None)?
        } else {
            self.resource_url(kind, Some(namespace), Some(&name), subresource)?
        };
        let response = self.send(method, url, Some(&object)).await?;
        Self::handle_json(response, kind, &name).await
    }

    fn exec_url(&self, request: &ExecRequest) -> Result<Url, ClusterError> {
        let mut url = self.url_from_segments(&[
            "api",
            "v1",
            "namespaces",
            request.namespace.as_str(),
            "pods",
            request.pod.as_str(),
            "exec",
        ])?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("container", &request.container);
            for argument in &request.command {
                query.append_pair("command", argument);
            }
            query.append_pair("stdout", "true");
            query.append_pair("stderr", "true");
        }
        let scheme = if url.scheme() == "http" { "ws" } else { "wss" };
        url.set_scheme(scheme).map_err(|_| ClusterError::Invalid {
            message: "cannot derive websocket URL for exec".to_string(),
        })?;
        Ok(url)
    }

    async fn run_exec(&self, request: &ExecRequest) -> Result<ExecOutcome, ClusterError> {
        let transport = |err: &dyn std::fmt::Display| ClusterError::Transient {
            message: format!("exec into {}/{} failed: {}", request.namespace, request.pod, err),
        };

        let url = self.exec_url(request)?;
        let host = url
            .host_str()
            .ok_or_else(|| ClusterError::Invalid {
                message: "exec URL is missing a host".to_string(),
            })?
            .to_string();
        let port = url.port_or_known_default().unwrap_or(443);
        let address = if host.contains(':') && !host.starts_with('[') {
            format!("[{}]:{}", host, port)
        } else {
            format!("{}:{}", host, port)
        };

        let tcp_stream = TcpStream::connect(address)
            .await
            .map_err(|err| transport(&err))?;

        let mut builder = SslConnector::builder(SslMethod::tls_client()).map_err(|err| transport(&err))?;
        if let Some(ca_pem) = self.config.ca_pem.as_deref() {
            for certificate in X509::stack_from_pem(ca_pem).map_err(|err| transport(&err))? {
                builder
                    .cert_store_mut()
                    .add_cert(certificate)
                    .map_err(|err| transport(&err))?;
            }
        }
        let ssl = builder
            .build()
            .configure()
            .and_then(|config| config.into_ssl(host.trim_matches(|c| c == '[' || c == ']')))
            .map_err(|err| transport(&err))?;
        let mut tls_stream = SslStream::new(ssl, tcp_stream).map_err(|err| transport(&err))?;
        Pin::new(&mut tls_stream)
            .connect()
            .await
            .map_err(|err| transport(&err))?;

        let mut ws_request = url
            .as_str()
            .into_client_request()
            .map_err(|err| transport(&err))?;
        ws_request
            .headers_mut()
            .insert(SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_static(EXEC_PROTOCOL));
        if let Some(token) = self.bearer_token() {
            let value = HeaderValue::from_str(&format!("Bearer {}", token))
                .map_err(|err| transport(&err))?;
            ws_request.headers_mut().insert(AUTHORIZATION, value);
        }

        let (mut stream, _) = client_async(ws_request, tls_stream)
            .await
            .map_err(|err| transport(&err))?;

        let mut outcome = ExecOutcome::default();
        let mut status_seen = false;
        while let Some(message) = stream.next().await {
            let payload = match message.map_err(|err| transport(&err))? {
                Message::Binary(payload) => payload,
                Message::Close(_) => break,
                _ => continue,
            };
            let Some((channel, data)) = payload.split_first() else {
                continue;
            };
            match *channel {
                CHANNEL_STDOUT => outcome.stdout.extend_from_slice(data),
                CHANNEL_STDERR => outcome.stderr.extend_from_slice(data),
                CHANNEL_STATUS => {
                    outcome.exit_code = parse_exit_code(data);
                    status_seen = true;
                }
                _ => {}
            }
        }
        if !status_seen {
            return Err(ClusterError::Transient {
                message: format!(
                    "exec into {}/{} closed without a status frame",
                    request.namespace, request.pod
                ),
            });
        }
        Ok(outcome)
    }
}

/// Maps the status channel payload to a process exit code.
fn parse_exit_code(payload: &[u8]) -> i32 {
    let Ok(body) = serde_json::from_slice::<StatusBody>(payload) else {
        return 1;
    };
    if body.status.as_deref() == Some("Success") {
        return 0;
    }
    body.details
        .and_then(|details| {
            details
                .causes
                .into_iter()
                .find(|cause| cause.reason.as_deref() == Some("ExitCode"))
                .and_then(|cause| cause.message)
        })
        .and_then(|code| code.parse::<i32>().ok())
        .unwrap_or(1)
}

impl ClusterClient for RestClusterClient {
    fn get<'a>(
        &'a self,
        kind: ResourceKind,
        namespace: &'a str,
        name: &'a str,
    ) -> ClientFuture<'a, Option<Value>> {
        Box::pin(async move {
            let url = self.resource_url(kind, Some(namespace), Some(name), None)?;
            let response = self.send(Method::GET, url, None).await?;
            if response.status() == StatusCode::NOT_FOUND {
                return Ok(None);
            }
            Self::handle_json(response, kind, name).await.map(Some)
        })
    }

    fn list<'a>(
        &'a self,
        kind: ResourceKind,
        namespace: Option<&'a str>,
        selector: &'a Selector,
    ) -> ClientFuture<'a, Vec<Value>> {
        Box::pin(async move {
            let mut url = self.resource_url(kind, namespace, None, None)?;
            if !selector.is_empty() {
                let encoded = selector
                    .iter()
                    .map(|(key, value)| format!("{}={}", key, value))
                    .collect::<Vec<_>>()
                    .join(",");
                url.query_pairs_mut().append_pair("labelSelector", &encoded);
            }
            let response = self.send(Method::GET, url, None).await?;
            let value = Self::handle_json(response, kind, "").await?;
            let list: ObjectList<Value> = serde_json::from_value(value)?;
            Ok(list.items)
        })
    }

    fn create<'a>(
        &'a self,
        kind: ResourceKind,
        namespace: &'a str,
        object: Value,
    ) -> ClientFuture<'a, Value> {
        Box::pin(async move { self.write(Method::POST, kind, namespace, object, None).await })
    }

    fn update<'a>(
        &'a self,
        kind: ResourceKind,
        namespace: &'a str,
        object: Value,
    ) -> ClientFuture<'a, Value> {
        Box::pin(async move { self.write(Method::PUT, kind, namespace, object, None).await })
    }

    fn update_status<'a>(
        &'a self,
        kind: ResourceKind,
        namespace: &'a str,
        object: Value,
    ) -> ClientFuture<'a, Value> {
        Box::pin(async move {
            self.write(Method::PUT, kind, namespace, object, Some("status"))
                .await
        })
    }

    fn delete<'a>(
        &'a self,
        kind: ResourceKind,
        namespace: &'a str,
        name: &'a str,
        resource_version: Option<&'a str>,
    ) -> ClientFuture<'a, ()> {
        Box::pin(async move {
            let url = self.resource_url(kind, Some(namespace), Some(name), None)?;
            let mut options = json!({
                "apiVersion": "v1",
                "kind": "DeleteOptions",
                "propagationPolicy": "Background",
            });
            if let Some(resource_version) = resource_version {
                options["preconditions"] = json!({ "resourceVersion": resource_version });
            }
            let response = self.send(Method::DELETE, url, Some(&options)).await?;
            Self::handle_json(response, kind, name).await.map(|_| ())
        })
    }

    fn exec<'a>(&'a self, request: &'a ExecRequest) -> ClientFuture<'a, ExecOutcome> {
        Box::pin(async move { self.run_exec(request).await })
    }
}
