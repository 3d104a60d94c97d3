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

pub mod args;

use std::error::Error;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::quarks::config::OperatorConfig;
use crate::quarks::controller::probe::{ClusterProbeRunner, ProbeRunner};
use crate::quarks::controller::quarksstatefulset;
use crate::quarks::controller::runtime::ControllerRuntime;
use crate::quarks::k8s::client::ClusterClient;
use crate::quarks::k8s::rest::{RestClusterClient, RestConfig};
use crate::quarks::logger::{self, log_error, log_info};
use crate::quarks::observability::tracing;
use crate::quarks::server::{self, ServerState};
use crate::quarks::util::error::with_context;

pub use args::{Commands, QuarksCtl, RunArgs};

const COMPONENT: &str = "operator";

pub async fn run(command: &Commands) -> Result<(), Box<dyn Error + Send + Sync>> {
    match command {
        Commands::Run(args) => {
            let config = args.operator_config()?;
            run_operator(config).await
        }
        Commands::Version => {
            println!("{} {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

async fn run_operator(config: OperatorConfig) -> Result<(), Box<dyn Error + Send + Sync>> {
    logger::set_log_format(config.log_format);
    logger::set_min_level(config.log_level);
    tracing::init();

    let workers_text = config.workers.to_string();
    let listen_text = config.listen.to_string();
    log_info(
        COMPONENT,
        "Starting operator",
        &[
            ("version", env!("CARGO_PKG_VERSION")),
            ("namespace", config.namespace.as_deref().unwrap_or("*")),
            ("workers", workers_text.as_str()),
            ("listen", listen_text.as_str()),
        ],
    );

    let rest = RestConfig::from_operator_config(&config)
        .map_err(|e| with_context(e, "Failed to resolve API server connection"))?;
    let client: Arc<dyn ClusterClient> = Arc::new(RestClusterClient::new(rest)?);
    let probes: Arc<dyn ProbeRunner> = Arc::new(ClusterProbeRunner::new(Arc::clone(&client))?);
    let runtime = ControllerRuntime::new();
    let shutdown = CancellationToken::new();

    let handles = quarksstatefulset::spawn(
        Arc::clone(&runtime),
        Arc::clone(&client),
        probes,
        &config,
        shutdown.clone(),
    );

    let state = ServerState {
        client,
        runtime: Arc::clone(&runtime),
        namespace: config.namespace.clone(),
    };
    let server_config = config.clone();
    let server_shutdown = shutdown.clone();
    let mut server_task = tokio::spawn(async move {
        server::serve(&server_config, state, server_shutdown).await
    });

    let mut server_result = None;
    tokio::select! {
        signal = wait_for_shutdown_signal() => {
            signal?;
            log_info(COMPONENT, "Shutdown signal received", &[]);
        }
        result = &mut server_task => {
            server_result = Some(result);
        }
    }

    shutdown.cancel();
    runtime.work_queue().shut_down();
    let server_result = match server_result {
        Some(result) => result,
        None => server_task.await,
    };
    for handle in handles {
        if let Err(err) = handle.await {
            let error_text = err.to_string();
            log_error(
                COMPONENT,
                "Controller task ended abnormally",
                &[("error", error_text.as_str())],
            );
        }
    }

    server_result.map_err(|e| with_context(e, "Server task panicked"))??;
    log_info(COMPONENT, "Operator stopped", &[]);
    Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() -> Result<(), Box<dyn Error + Send + Sync>> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = signal(SignalKind::terminate())
        .map_err(|e| with_context(e, "Failed to install SIGTERM handler"))?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.map_err(|e| with_context(e, "Failed to listen for ctrl-c"))
        }
        _ = terminate.recv() => Ok(()),
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() -> Result<(), Box<dyn Error + Send + Sync>> {
    tokio::signal::ctrl_c()
        .await
        .map_err(|e| with_context(e, "Failed to listen for ctrl-c"))
}
