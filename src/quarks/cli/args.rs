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

use clap::{Args, Parser, Subcommand};

use crate::quarks::config::{Config, OperatorConfig};

/// Kubernetes operator for QuarksStatefulSet resources.
#[derive(Parser)]
#[command(name = env!("CARGO_PKG_NAME"))]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = env!("CARGO_PKG_DESCRIPTION"))]
pub struct QuarksCtl {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the controller and the pod mutating webhook
    Run(RunArgs),

    /// Print the operator version
    Version,
}

/// Flags override the matching `QUARKS_STS_*` environment variables, which
/// override the built-in defaults.
#[derive(Args, Debug, Default)]
pub struct RunArgs {
    /// Namespace to watch (all namespaces when unset)
    #[arg(long, env = "QUARKS_STS_NAMESPACE")]
    pub namespace: Option<String>,

    /// Number of reconcile workers
    #[arg(long, env = "QUARKS_STS_WORKERS")]
    pub workers: Option<String>,

    /// How often the cluster is polled for changes (e.g. 2s)
    #[arg(long, env = "QUARKS_STS_POLL_INTERVAL")]
    pub poll_interval: Option<String>,

    /// How often every QuarksStatefulSet is requeued regardless of changes
    #[arg(long, env = "QUARKS_STS_RESYNC_INTERVAL")]
    pub resync_interval: Option<String>,

    /// Upper bound on a single reconcile pass
    #[arg(long, env = "QUARKS_STS_RECONCILE_TIMEOUT")]
    pub reconcile_timeout: Option<String>,

    /// Address to bind the webhook and health server (e.g. 0.0.0.0:2999)
    #[arg(long, env = "QUARKS_STS_LISTEN")]
    pub listen: Option<String>,

    /// PEM certificate chain for the webhook server
    #[arg(long, env = "QUARKS_STS_TLS_CERT")]
    pub tls_cert: Option<String>,

    /// PEM private key for the webhook server
    #[arg(long, env = "QUARKS_STS_TLS_KEY")]
    pub tls_key: Option<String>,

    /// Kubernetes API server URL (in-cluster service when unset)
    #[arg(long, env = "QUARKS_STS_API_SERVER")]
    pub api_server: Option<String>,

    /// Bearer token file for the API server
    #[arg(long, env = "QUARKS_STS_TOKEN_FILE")]
    pub token_file: Option<String>,

    /// CA bundle for the API server
    #[arg(long, env = "QUARKS_STS_CA_FILE")]
    pub ca_file: Option<String>,

    /// Log output format: text or json
    #[arg(long, env = "QUARKS_STS_LOG_FORMAT")]
    pub log_format: Option<String>,

    /// Lowest log level written: debug, info, warn, or error
    #[arg(long, env = "QUARKS_STS_LOG_LEVEL")]
    pub log_level: Option<String>,
}

impl RunArgs {
    /// The flag value for `config`, if one was given.
    pub fn lookup(&self, config: Config) -> Option<String> {
        let value = match config {
            Config::Namespace => &self.namespace,
            Config::Workers => &self.workers,
            Config::PollInterval => &self.poll_interval,
            Config::ResyncInterval => &self.resync_interval,
            Config::ReconcileTimeout => &self.reconcile_timeout,
            Config::Listen => &self.listen,
            Config::TlsCert => &self.tls_cert,
            Config::TlsKey => &self.tls_key,
            Config::ApiServer => &self.api_server,
            Config::TokenFile => &self.token_file,
            Config::CaFile => &self.ca_file,
            Config::LogFormat => &self.log_format,
            Config::LogLevel => &self.log_level,
        };
        value
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_string)
    }

    pub fn operator_config(
        &self,
    ) -> Result<OperatorConfig, Box<dyn std::error::Error + Send + Sync>> {
        OperatorConfig::from_lookup(|config| self.lookup(config))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quarks::logger::LogLevel;
    use clap::CommandFactory;
    use std::time::Duration;

    #[test]
    fn every_parameter_has_a_matching_flag() {
        let command = QuarksCtl::command();
        let run = command.find_subcommand("run").expect("run subcommand");
        for config in Config::ALL {
            let found = run.get_arguments().any(|arg| {
                arg.get_env()
                    .map(|env| env == config.env_var())
                    .unwrap_or(false)
            });
            assert!(found, "no flag reads {}", config.env_var());
        }
    }

    #[test]
    fn flags_feed_operator_config() {
        let cli = QuarksCtl::try_parse_from([
            "quarks-statefulset",
            "run",
            "--workers",
            "2",
            "--poll-interval",
            "500ms",
            "--namespace",
            "  ",
            "--listen",
            "127.0.0.1:9443",
            "--log-level",
            "warn",
        ])
        .expect("parse");
        let Commands::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert_eq!(args.lookup(Config::Namespace), None);

        let config = args.operator_config().expect("config");
        assert_eq!(config.workers, 2);
        assert_eq!(config.poll_interval, Duration::from_millis(500));
        assert_eq!(config.listen.to_string(), "127.0.0.1:9443");
        assert_eq!(config.log_level, LogLevel::Warn);
    }
}
