use std::env;
use std::fs;
use std::time::Duration;

use quarks_statefulset::quarks::config::{Config, OperatorConfig};
use quarks_statefulset::quarks::k8s::rest::RestConfig;
use quarks_statefulset::quarks::logger::{LogFormat, LogLevel};
use serial_test::serial;
use tempfile::TempDir;

struct EnvGuard {
    saved: Vec<(&'static str, Option<String>)>,
}

impl EnvGuard {
    fn new() -> Self {
        let mut names: Vec<&'static str> = Config::ALL.iter().map(Config::env_var).collect();
        names.push("KUBERNETES_SERVICE_HOST");
        names.push("KUBERNETES_SERVICE_PORT");
        let saved = names
            .into_iter()
            .map(|name| (name, env::var(name).ok()))
            .collect();
        for config in Config::ALL {
            env::remove_var(config.env_var());
        }
        Self { saved }
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for (name, value) in &self.saved {
            match value {
                Some(value) => env::set_var(name, value),
                None => env::remove_var(name),
            }
        }
    }
}

#[test]
#[serial]
fn environment_overrides_defaults() {
    let _guard = EnvGuard::new();
    env::set_var("QUARKS_STS_NAMESPACE", "cf");
    env::set_var("QUARKS_STS_WORKERS", "8");
    env::set_var("QUARKS_STS_RESYNC_INTERVAL", "90s");
    env::set_var("QUARKS_STS_LOG_FORMAT", "json");
    env::set_var("QUARKS_STS_LOG_LEVEL", "debug");
    env::set_var("QUARKS_STS_LISTEN", "127.0.0.1:8443");

    let config = OperatorConfig::from_env().expect("config");

    assert_eq!(config.namespace.as_deref(), Some("cf"));
    assert_eq!(config.workers, 8);
    assert_eq!(config.resync_interval, Duration::from_secs(90));
    assert_eq!(config.poll_interval, Duration::from_secs(2));
    assert_eq!(config.log_format, LogFormat::Json);
    assert_eq!(config.log_level, LogLevel::Debug);
    assert_eq!(config.listen.to_string(), "127.0.0.1:8443");
    assert!(!config.tls_enabled());
}

#[test]
#[serial]
fn blank_environment_values_fall_back_to_defaults() {
    let _guard = EnvGuard::new();
    env::set_var("QUARKS_STS_NAMESPACE", "   ");
    env::set_var("QUARKS_STS_WORKERS", "");

    let config = OperatorConfig::from_env().expect("config");

    assert_eq!(config.namespace, None);
    assert_eq!(config.workers, 4);
    assert_eq!(config.log_level, LogLevel::Info);
}

#[test]
#[serial]
fn invalid_environment_values_fail_startup() {
    let _guard = EnvGuard::new();
    env::set_var("QUARKS_STS_POLL_INTERVAL", "soon");
    let err = OperatorConfig::from_env().expect_err("bad duration");
    assert!(err.to_string().contains("QUARKS_STS_POLL_INTERVAL"));

    env::remove_var("QUARKS_STS_POLL_INTERVAL");
    env::set_var("QUARKS_STS_TLS_CERT", "/etc/webhook/tls.crt");
    let err = OperatorConfig::from_env().expect_err("cert without key");
    assert!(err.to_string().contains("QUARKS_STS_TLS_KEY"));

    env::remove_var("QUARKS_STS_TLS_CERT");
    env::set_var("QUARKS_STS_LOG_LEVEL", "verbose");
    let err = OperatorConfig::from_env().expect_err("unknown level");
    assert!(err.to_string().contains("QUARKS_STS_LOG_LEVEL"));
}

#[test]
#[serial]
fn rest_config_reads_explicit_server_and_credentials() {
    let _guard = EnvGuard::new();
    let dir = TempDir::new().expect("tempdir");
    let token = dir.path().join("token");
    let ca = dir.path().join("ca.crt");
    fs::write(&token, "abc").expect("write token");
    fs::write(&ca, "-----BEGIN CERTIFICATE-----\n").expect("write ca");
    env::set_var("QUARKS_STS_API_SERVER", "https://api.example.test:6443");
    env::set_var("QUARKS_STS_TOKEN_FILE", &token);
    env::set_var("QUARKS_STS_CA_FILE", &ca);

    let config = OperatorConfig::from_env().expect("config");
    let rest = RestConfig::from_operator_config(&config).expect("rest config");

    assert_eq!(rest.server.as_str(), "https://api.example.test:6443/");
    assert_eq!(rest.token_file.as_deref(), Some(token.as_path()));
    assert!(rest.ca_pem.is_some());
}

#[test]
#[serial]
fn rest_config_falls_back_to_in_cluster_service() {
    let _guard = EnvGuard::new();
    let dir = TempDir::new().expect("tempdir");
    env::set_var("QUARKS_STS_TOKEN_FILE", dir.path().join("missing-token"));
    env::set_var("QUARKS_STS_CA_FILE", dir.path().join("missing-ca"));
    env::set_var("KUBERNETES_SERVICE_HOST", "10.96.0.1");
    env::set_var("KUBERNETES_SERVICE_PORT", "443");

    let config = OperatorConfig::from_env().expect("config");
    let rest = RestConfig::from_operator_config(&config).expect("rest config");

    assert_eq!(rest.server.as_str(), "https://10.96.0.1/");
    assert_eq!(rest.token_file, None);
    assert_eq!(rest.ca_pem, None);

    env::remove_var("KUBERNETES_SERVICE_HOST");
    let err = RestConfig::from_operator_config(&config).expect_err("no server");
    assert!(err.to_string().contains("KUBERNETES_SERVICE_HOST"));
}
