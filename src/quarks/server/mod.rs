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

use std::error::Error;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as HyperAcceptor;
use hyper_util::service::TowerToHyperService;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

pub mod handlers;
mod tls;

use crate::quarks::config::OperatorConfig;
use crate::quarks::controller::runtime::ControllerRuntime;
use crate::quarks::k8s::client::ClusterClient;
use crate::quarks::logger::{log_error, log_info, log_warn};
use crate::quarks::util::error::with_context;
use tls::{accept_with_tls, build_tls_acceptor};

const COMPONENT: &str = "server";

/// Shared state behind the webhook and health endpoints.
#[derive(Clone)]
pub struct ServerState {
    pub client: Arc<dyn ClusterClient>,
    pub runtime: Arc<ControllerRuntime>,
    pub namespace: Option<String>,
}

pub fn build_router(state: ServerState) -> Router {
    Router::new()
        .route("/mutate-pods", post(handlers::admission::mutate_pods))
        .route("/metrics", get(handlers::observability::metrics))
        .route("/healthz", get(handlers::observability::combined_health))
        .route("/readyz", get(handlers::observability::readiness))
        .route("/livez", get(handlers::observability::liveness))
        .with_state(state)
}

/// Serves the webhook and health endpoints until `shutdown` fires. TLS is
/// used when both a certificate and a key are configured.
pub async fn serve(
    config: &OperatorConfig,
    state: ServerState,
    shutdown: CancellationToken,
) -> Result<(), Box<dyn Error + Send + Sync>> {
    let addr = config.listen;
    let tls_acceptor = match (config.tls_cert.as_deref(), config.tls_key.as_deref()) {
        (Some(cert), Some(key)) => Some(Arc::new(build_tls_acceptor(cert, key).map_err(
            |e| with_context(e, format!("Failed to prepare TLS acceptor for {addr}")),
        )?)),
        _ => {
            log_warn(
                COMPONENT,
                "No TLS certificate configured; serving plain HTTP",
                &[],
            );
            None
        }
    };

    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| with_context(e, format!("Failed to bind server listener at {addr}")))?;
    let listen_addr_text = addr.to_string();
    log_info(
        COMPONENT,
        "HTTP server listening",
        &[
            ("addr", listen_addr_text.as_str()),
            ("tls", if tls_acceptor.is_some() { "true" } else { "false" }),
        ],
    );

    let app = build_router(state);
    loop {
        let (stream, remote_addr) = tokio::select! {
            _ = shutdown.cancelled() => {
                log_info(COMPONENT, "HTTP server stopping", &[("addr", listen_addr_text.as_str())]);
                return Ok(());
            }
            accepted = listener.accept() => accepted
                .map_err(|e| with_context(e, "Failed to accept incoming TCP connection"))?,
        };
        let service = app.clone();
        let tls_acceptor = tls_acceptor.clone();
        tokio::spawn(async move {
            match tls_acceptor {
                Some(acceptor) => match accept_with_tls(acceptor.as_ref(), stream).await {
                    Ok(tls_stream) => {
                        serve_connection(tls_stream, service, addr, remote_addr).await
                    }
                    Err(err) => {
                        let error_text = err.to_string();
                        let listen_addr_text = addr.to_string();
                        let remote_addr_text = remote_addr.to_string();
                        log_warn(
                            COMPONENT,
                            "TLS handshake failed",
                            &[
                                ("listen_addr", listen_addr_text.as_str()),
                                ("remote_addr", remote_addr_text.as_str()),
                                ("error", error_text.as_str()),
                            ],
                        );
                    }
                },
                None => serve_connection(stream, service, addr, remote_addr).await,
            }
        });
    }
}

async fn serve_connection<I>(io: I, service: Router, listen_addr: SocketAddr, remote_addr: SocketAddr)
where
    I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let service = TowerToHyperService::new(service);
    if let Err(err) = HyperAcceptor::new(TokioExecutor::new())
        .serve_connection_with_upgrades(TokioIo::new(io), service)
        .await
    {
        let should_log = err
            .downcast_ref::<hyper::Error>()
            .map(|hyper_err| !(hyper_err.is_closed() || hyper_err.is_incomplete_message()))
            .unwrap_or(true);
        if should_log {
            let error_text = err.to_string();
            let listen_addr_text = listen_addr.to_string();
            let remote_addr_text = remote_addr.to_string();
            log_error(
                COMPONENT,
                "HTTP serving error",
                &[
                    ("listen_addr", listen_addr_text.as_str()),
                    ("remote_addr", remote_addr_text.as_str()),
                    ("error", error_text.as_str()),
                ],
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quarks::k8s::memory::InMemoryCluster;
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    fn state() -> ServerState {
        ServerState {
            client: Arc::new(InMemoryCluster::new()),
            runtime: ControllerRuntime::new(),
            namespace: None,
        }
    }

    #[tokio::test]
    async fn readiness_requires_running_workers() {
        let response = build_router(state())
            .oneshot(Request::get("/readyz").body(Body::empty()).expect("request"))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        let response = build_router(state())
            .oneshot(Request::get("/livez").body(Body::empty()).expect("request"))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn metrics_use_prometheus_text_format() {
        let response = build_router(state())
            .oneshot(Request::get("/metrics").body(Body::empty()).expect("request"))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()["content-type"],
            "text/plain; version=0.0.4"
        );
        to_bytes(response.into_body(), usize::MAX).await.expect("body");
    }
}
