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
use std::future::Future;
use std::sync::OnceLock;
use std::time::Instant;

use prometheus::core::Collector;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry,
    TextEncoder,
};

static REGISTRY: OnceLock<Registry> = OnceLock::new();
static CONTROLLER_RECONCILES_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
static RECONCILE_DURATION: OnceLock<HistogramVec> = OnceLock::new();
static VERSIONS: OnceLock<IntGaugeVec> = OnceLock::new();
static MAX_AVAILABLE_VERSION: OnceLock<IntGaugeVec> = OnceLock::new();
static ACTIVE_ELECTIONS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
static PROBE_RESULTS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
static REVISIONS_MALFORMED_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
static WORK_QUEUE_DEPTH: OnceLock<IntGauge> = OnceLock::new();

fn registry() -> &'static Registry {
    REGISTRY.get_or_init(|| {
        Registry::new_custom(Some("quarks_statefulset".to_string()), None)
            .expect("failed to initialise quarks_statefulset metrics registry")
    })
}

fn register_collector<C>(collector: C) -> C
where
    C: Clone + Collector + Send + Sync + 'static,
{
    registry()
        .register(Box::new(collector.clone()))
        .expect("failed to register quarks_statefulset metric collector");
    collector
}

fn controller_reconciles_total() -> &'static IntCounterVec {
    CONTROLLER_RECONCILES_TOTAL.get_or_init(|| {
        let opts = Opts::new(
            "controller_reconciles_total",
            "Reconcile passes grouped by controller and result",
        );
        let counter = IntCounterVec::new(opts, &["controller", "result"])
            .expect("failed to build controller reconcile counter");
        register_collector(counter)
    })
}

fn reconcile_duration() -> &'static HistogramVec {
    RECONCILE_DURATION.get_or_init(|| {
        let opts = HistogramOpts::new(
            "reconcile_duration_seconds",
            "Wall time of a single reconcile pass",
        )
        .buckets(vec![0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 15.0, 60.0]);
        let histogram = HistogramVec::new(opts, &["controller"])
            .expect("failed to build reconcile duration histogram");
        register_collector(histogram)
    })
}

fn versions() -> &'static IntGaugeVec {
    VERSIONS.get_or_init(|| {
        let opts = Opts::new(
            "versions",
            "Number of StatefulSet versions currently owned by a QuarksStatefulSet",
        );
        let gauge = IntGaugeVec::new(opts, &["namespace", "name"])
            .expect("failed to build versions gauge");
        register_collector(gauge)
    })
}

fn max_available_version() -> &'static IntGaugeVec {
    MAX_AVAILABLE_VERSION.get_or_init(|| {
        let opts = Opts::new(
            "max_available_version",
            "Highest fully ready version of a QuarksStatefulSet (0 when none)",
        );
        let gauge = IntGaugeVec::new(opts, &["namespace", "name"])
            .expect("failed to build max available version gauge");
        register_collector(gauge)
    })
}

fn active_elections_total() -> &'static IntCounterVec {
    ACTIVE_ELECTIONS_TOTAL.get_or_init(|| {
        let opts = Opts::new(
            "active_elections_total",
            "Active/passive elections grouped by result",
        );
        let counter = IntCounterVec::new(opts, &["namespace", "result"])
            .expect("failed to build active elections counter");
        register_collector(counter)
    })
}

fn probe_results_total() -> &'static IntCounterVec {
    PROBE_RESULTS_TOTAL.get_or_init(|| {
        let opts = Opts::new(
            "probe_results_total",
            "Active/passive probe evaluations grouped by handler and outcome",
        );
        let counter = IntCounterVec::new(opts, &["handler", "outcome"])
            .expect("failed to build probe results counter");
        register_collector(counter)
    })
}

fn revisions_malformed_total() -> &'static IntCounterVec {
    REVISIONS_MALFORMED_TOTAL.get_or_init(|| {
        let opts = Opts::new(
            "revisions_malformed_total",
            "Ordinal revision annotations that failed to decode and were reset",
        );
        let counter = IntCounterVec::new(opts, &["namespace"])
            .expect("failed to build malformed revisions counter");
        register_collector(counter)
    })
}

fn work_queue_depth() -> &'static IntGauge {
    WORK_QUEUE_DEPTH.get_or_init(|| {
        let gauge = IntGauge::new("work_queue_depth", "Items waiting in the controller work queue")
            .expect("failed to build work queue depth gauge");
        register_collector(gauge)
    })
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ControllerReconcileResult {
    Success,
    Requeue,
    Error,
}

impl ControllerReconcileResult {
    fn as_label(self) -> &'static str {
        match self {
            ControllerReconcileResult::Success => "success",
            ControllerReconcileResult::Requeue => "requeue",
            ControllerReconcileResult::Error => "error",
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ElectionResult {
    Elected,
    Unchanged,
    NoCandidate,
}

impl ElectionResult {
    fn as_label(self) -> &'static str {
        match self {
            ElectionResult::Elected => "elected",
            ElectionResult::Unchanged => "unchanged",
            ElectionResult::NoCandidate => "no_candidate",
        }
    }
}

pub fn record_controller_reconcile(controller: &str, result: ControllerReconcileResult) {
    controller_reconciles_total()
        .with_label_values(&[controller, result.as_label()])
        .inc();
}

/// Times `future` and records its outcome under `controller`.
pub async fn observe_reconcile<F, T, E>(controller: &str, future: F) -> Result<T, E>
where
    F: Future<Output = Result<T, E>>,
{
    let start = Instant::now();
    let result = future.await;
    reconcile_duration()
        .with_label_values(&[controller])
        .observe(start.elapsed().as_secs_f64());
    let label = if result.is_ok() {
        ControllerReconcileResult::Success
    } else {
        ControllerReconcileResult::Error
    };
    record_controller_reconcile(controller, label);
    result
}

pub fn set_version_gauges(namespace: &str, name: &str, count: usize, max_available: u32) {
    versions()
        .with_label_values(&[namespace, name])
        .set(count as i64);
    max_available_version()
        .with_label_values(&[namespace, name])
        .set(i64::from(max_available));
}

/// Drops the per-object gauges of a deleted QuarksStatefulSet.
pub fn clear_version_gauges(namespace: &str, name: &str) {
    let _ = versions().remove_label_values(&[namespace, name]);
    let _ = max_available_version().remove_label_values(&[namespace, name]);
}

pub fn record_election(namespace: &str, result: ElectionResult) {
    active_elections_total()
        .with_label_values(&[namespace, result.as_label()])
        .inc();
}

pub fn record_probe_result(handler: &str, outcome: &str) {
    probe_results_total()
        .with_label_values(&[handler, outcome])
        .inc();
}

pub fn record_malformed_revisions(namespace: &str) {
    revisions_malformed_total()
        .with_label_values(&[namespace])
        .inc();
}

pub fn set_work_queue_depth(depth: usize) {
    work_queue_depth().set(depth as i64);
}

pub fn gather() -> Result<Vec<u8>, Box<dyn Error + Send + Sync>> {
    let metric_families = registry().gather();
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|err| Box::new(err) as Box<dyn Error + Send + Sync>)?;
    Ok(buffer)
}
