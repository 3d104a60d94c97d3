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

use std::env;
use std::error::Error;
use std::net::SocketAddr;
use std::path::{Component, PathBuf};
use std::time::Duration;

use crate::quarks::logger::{LogFormat, LogLevel};
use crate::quarks::util::error::{new_error, with_context};

/// Operator parameters, each with its environment variable and default.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Config {
    Namespace,
    Workers,
    PollInterval,
    ResyncInterval,
    ReconcileTimeout,
    Listen,
    TlsCert,
    TlsKey,
    ApiServer,
    TokenFile,
    CaFile,
    LogFormat,
    LogLevel,
}

impl Config {
    pub const ALL: [Config; 13] = [
        Config::Namespace,
        Config::Workers,
        Config::PollInterval,
        Config::ResyncInterval,
        Config::ReconcileTimeout,
        Config::Listen,
        Config::TlsCert,
        Config::TlsKey,
        Config::ApiServer,
        Config::TokenFile,
        Config::CaFile,
        Config::LogFormat,
        Config::LogLevel,
    ];

    pub fn env_var(&self) -> &'static str {
        match self {
            Config::Namespace => "QUARKS_STS_NAMESPACE",
            Config::Workers => "QUARKS_STS_WORKERS",
            Config::PollInterval => "QUARKS_STS_POLL_INTERVAL",
            Config::ResyncInterval => "QUARKS_STS_RESYNC_INTERVAL",
            Config::ReconcileTimeout => "QUARKS_STS_RECONCILE_TIMEOUT",
            Config::Listen => "QUARKS_STS_LISTEN",
            Config::TlsCert => "QUARKS_STS_TLS_CERT",
            Config::TlsKey => "QUARKS_STS_TLS_KEY",
            Config::ApiServer => "QUARKS_STS_API_SERVER",
            Config::TokenFile => "QUARKS_STS_TOKEN_FILE",
            Config::CaFile => "QUARKS_STS_CA_FILE",
            Config::LogFormat => "QUARKS_STS_LOG_FORMAT",
            Config::LogLevel => "QUARKS_STS_LOG_LEVEL",
        }
    }

    /// Default value, or `None` when the parameter is unset by default.
    pub fn default_value(&self) -> Option<&'static str> {
        match self {
            Config::Workers => Some("4"),
            Config::PollInterval => Some("2s"),
            Config::ResyncInterval => Some("5m"),
            Config::ReconcileTimeout => Some("60s"),
            Config::Listen => Some("0.0.0.0:2999"),
            Config::TokenFile => Some("/var/run/secrets/kubernetes.io/serviceaccount/token"),
            Config::CaFile => Some("/var/run/secrets/kubernetes.io/serviceaccount/ca.crt"),
            Config::LogFormat => Some("text"),
            Config::LogLevel => Some("info"),
            Config::Namespace | Config::TlsCert | Config::TlsKey | Config::ApiServer => None,
        }
    }

    /// Reads the environment, ignoring empty values.
    pub fn from_env(&self) -> Option<String> {
        env::var(self.env_var())
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    }
}

#[derive(Clone, Debug)]
pub struct OperatorConfig {
    /// Watch a single namespace; `None` watches all.
    pub namespace: Option<String>,
    pub workers: usize,
    pub poll_interval: Duration,
    pub resync_interval: Duration,
    pub reconcile_timeout: Duration,
    pub listen: SocketAddr,
    pub tls_cert: Option<PathBuf>,
    pub tls_key: Option<PathBuf>,
    pub api_server: Option<String>,
    pub token_file: PathBuf,
    pub ca_file: PathBuf,
    pub log_format: LogFormat,
    pub log_level: LogLevel,
}

impl OperatorConfig {
    pub fn from_env() -> Result<Self, Box<dyn Error + Send + Sync>> {
        Self::from_lookup(|config| config.from_env())
    }

    /// Builds the config from `lookup`, falling back to each parameter's default.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, Box<dyn Error + Send + Sync>>
    where
        F: Fn(Config) -> Option<String>,
    {
        let value = |config: Config| -> Option<String> {
            lookup(config).or_else(|| config.default_value().map(str::to_string))
        };
        let required = |config: Config| -> Result<String, Box<dyn Error + Send + Sync>> {
            value(config).ok_or_else(|| new_error(format!("{} must be set", config.env_var())))
        };

        let workers_raw = required(Config::Workers)?;
        let workers = workers_raw.parse::<usize>().map_err(|e| {
            with_context(
                e,
                format!("{}='{}' is not a worker count", Config::Workers.env_var(), workers_raw),
            )
        })?;
        if workers == 0 {
            return Err(new_error(format!(
                "{} must be at least 1",
                Config::Workers.env_var()
            )));
        }

        let listen_raw = required(Config::Listen)?;
        let listen = listen_raw.parse::<SocketAddr>().map_err(|e| {
            with_context(
                e,
                format!("{}='{}' is not a socket address", Config::Listen.env_var(), listen_raw),
            )
        })?;

        let log_format_raw = required(Config::LogFormat)?;
        let log_format = log_format_raw
            .parse::<LogFormat>()
            .map_err(|e| new_error(format!("{}: {}", Config::LogFormat.env_var(), e)))?;
        let log_level_raw = required(Config::LogLevel)?;
        let log_level = log_level_raw
            .parse::<LogLevel>()
            .map_err(|e| new_error(format!("{}: {}", Config::LogLevel.env_var(), e)))?;

        let tls_cert = value(Config::TlsCert).map(|path| normalize_path(&path));
        let tls_key = value(Config::TlsKey).map(|path| normalize_path(&path));
        if tls_cert.is_some() != tls_key.is_some() {
            return Err(new_error(format!(
                "{} and {} must be set together",
                Config::TlsCert.env_var(),
                Config::TlsKey.env_var()
            )));
        }

        Ok(Self {
            namespace: value(Config::Namespace),
            workers,
            poll_interval: parse_duration(Config::PollInterval, &required(Config::PollInterval)?)?,
            resync_interval: parse_duration(
                Config::ResyncInterval,
                &required(Config::ResyncInterval)?,
            )?,
            reconcile_timeout: parse_duration(
                Config::ReconcileTimeout,
                &required(Config::ReconcileTimeout)?,
            )?,
            listen,
            tls_cert,
            tls_key,
            api_server: value(Config::ApiServer),
            token_file: normalize_path(&required(Config::TokenFile)?),
            ca_file: normalize_path(&required(Config::CaFile)?),
            log_format,
            log_level,
        })
    }

    pub fn tls_enabled(&self) -> bool {
        self.tls_cert.is_some() && self.tls_key.is_some()
    }
}

fn parse_duration(config: Config, raw: &str) -> Result<Duration, Box<dyn Error + Send + Sync>> {
    let duration = humantime::parse_duration(raw).map_err(|e| {
        with_context(
            e,
            format!("{}='{}' is not a duration", config.env_var(), raw),
        )
    })?;
    if duration.is_zero() {
        return Err(new_error(format!(
            "{} must be greater than zero",
            config.env_var()
        )));
    }
    Ok(duration)
}

/// Expands a leading `~/`, anchors relative paths at the working directory,
/// and collapses `.` and `..` components.
fn normalize_path(input: &str) -> PathBuf {
    let path = match input {
        _ if input.starts_with("~/") => env::var("HOME")
            .ok()
            .map(|home| PathBuf::from(home).join(&input[2..])),
        _ if !input.starts_with('/') => env::current_dir().ok().map(|cwd| cwd.join(input)),
        _ => None,
    }
    .unwrap_or_else(|| PathBuf::from(input));

    path.components()
        .fold(PathBuf::new(), |mut normalized, component| {
            match component {
                Component::CurDir => {}
                Component::ParentDir => {
                    normalized.pop();
                }
                _ => normalized.push(component),
            }
            normalized
        })
}
