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

//! QuarksStatefulSet reconciler: observe, resolve the version, guard claim
//! templates, apply, elect the active pod, and update status.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::sync::Arc;
use std::time::Duration;

use chrono::{SecondsFormat, Utc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::quarks::config::OperatorConfig;
use crate::quarks::controller::active_passive::{
    self, active_ordinal, label_changes, pod_version, requeue_interval, strip_active_labels,
    ACTIVE_POD_ELECTED,
};
use crate::quarks::controller::guard::{
    VOLUME_CLAIM_TEMPLATES_MESSAGE, VOLUME_CLAIM_TEMPLATES_WARNING,
};
use crate::quarks::controller::ordinals::{Revisions, RevisionsDecode};
use crate::quarks::controller::probe::ProbeRunner;
use crate::quarks::controller::reconcile::{
    DependencyHandle, FetchResult, ReconcileContext, ReconcileData, Reconciler,
};
use crate::quarks::controller::runtime::{ControllerRuntime, ControllerTarget, ReconcileOutcome};
use crate::quarks::controller::versions::{
    config_digest, global_pod_ordinal, labeled_pod, missing_shared_claims, plan_versions,
    VersionPlan, VERSION_CREATED,
};
use crate::quarks::controller::watch::{self, WatchSettings};
use crate::quarks::k8s::client::{owned_by_selector, Api, ClusterClient, ClusterError};
use crate::quarks::k8s::configmap::ConfigMap;
use crate::quarks::k8s::event::{EventRecorder, EventType};
use crate::quarks::k8s::persistentvolumeclaim::PersistentVolumeClaim;
use crate::quarks::k8s::pod::{Pod, Probe};
use crate::quarks::k8s::quarksstatefulset::{QuarksStatefulSet, ANNOTATION_ORDINAL_REVISIONS};
use crate::quarks::k8s::reference::referenced_configs;
use crate::quarks::k8s::secret::Secret;
use crate::quarks::k8s::statefulset::StatefulSet;
use crate::quarks::logger::{log_debug, log_error, log_info, log_warn};
use crate::quarks::observability::metrics::{self, ElectionResult};
use crate::quarks::observability::tracing::with_span;

const COMPONENT: &str = "quarks-statefulset-controller";
pub const CONTROLLER: &str = "quarksstatefulset";
const MAX_CONFLICT_ATTEMPTS: usize = 5;
const RETIREMENT_POLL: Duration = Duration::from_secs(5);

/// Errors raised while reconciling a QuarksStatefulSet.
#[derive(Debug)]
pub enum QuarksStatefulSetError {
    Cluster(ClusterError),
    /// A referenced ConfigMap or Secret that is not optional does not exist.
    MissingDependency(String),
    InvalidTemplate(String),
    /// A controller dependency was not registered with the runtime.
    Dependency(String),
    Timeout(Duration),
}

impl QuarksStatefulSetError {
    /// Stale writes, including creates that lost a race.
    pub fn is_conflict(&self) -> bool {
        match self {
            QuarksStatefulSetError::Cluster(err) => err.is_conflict() || err.is_already_exists(),
            _ => false,
        }
    }

    /// False only for errors that need the object or the deployment to change.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            QuarksStatefulSetError::InvalidTemplate(_) | QuarksStatefulSetError::Dependency(_)
        )
    }
}

impl Display for QuarksStatefulSetError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            QuarksStatefulSetError::Cluster(err) => write!(f, "cluster error: {}", err),
            QuarksStatefulSetError::MissingDependency(what) => {
                write!(f, "missing referenced {}", what)
            }
            QuarksStatefulSetError::InvalidTemplate(message) => {
                write!(f, "invalid StatefulSet template: {}", message)
            }
            QuarksStatefulSetError::Dependency(message) => {
                write!(f, "controller dependency error: {}", message)
            }
            QuarksStatefulSetError::Timeout(limit) => write!(
                f,
                "reconcile did not finish within {}",
                humantime::format_duration(*limit)
            ),
        }
    }
}

impl Error for QuarksStatefulSetError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            QuarksStatefulSetError::Cluster(err) => Some(err),
            _ => None,
        }
    }
}

impl From<ClusterError> for QuarksStatefulSetError {
    fn from(err: ClusterError) -> Self {
        QuarksStatefulSetError::Cluster(err)
    }
}

/// Tunables shared by every reconcile pass.
#[derive(Clone, Debug)]
pub struct ControllerSettings {
    pub reconcile_timeout: Duration,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            reconcile_timeout: Duration::from_secs(60),
        }
    }
}

/// Cluster objects belonging to one QuarksStatefulSet.
#[derive(Clone, Debug, Default)]
pub struct ObservedState {
    pub statefulsets: Vec<StatefulSet>,
    pub pods: Vec<Pod>,
    pub claims: BTreeSet<String>,
    pub config_maps: BTreeMap<String, ConfigMap>,
    pub secrets: BTreeMap<String, Secret>,
}

#[derive(Clone, Debug)]
pub enum ElectionPlan {
    Elect {
        probes: BTreeMap<String, Probe>,
        interval: Duration,
    },
    /// Election is off; these pods lose a stale active label.
    Strip(Vec<Pod>),
}

#[derive(Clone, Debug)]
pub struct QuarksStatefulSetPlan {
    pub qsts: QuarksStatefulSet,
    pub versions: VersionPlan,
    pub claims: Vec<PersistentVolumeClaim>,
    pub pod_labels: Vec<Pod>,
    /// New value of the ordinal-revisions annotation.
    pub revisions: Option<String>,
    pub malformed_revisions: Option<String>,
    pub pods: Vec<Pod>,
    pub election: ElectionPlan,
}

impl QuarksStatefulSetPlan {
    fn requeue(&self) -> ReconcileOutcome {
        let election = match &self.election {
            ElectionPlan::Elect { interval, .. } => Some(*interval),
            ElectionPlan::Strip(_) => None,
        };
        let retirement = self.versions.retiring.then_some(RETIREMENT_POLL);
        match election.into_iter().chain(retirement).min() {
            Some(delay) => ReconcileOutcome::RequeueAfter(delay),
            None => ReconcileOutcome::Done,
        }
    }
}

#[derive(Default)]
pub struct QuarksStatefulSetController;

impl QuarksStatefulSetController {
    pub fn new() -> Self {
        Self
    }

    fn client(ctx: &ReconcileContext<'_>) -> Result<Arc<dyn ClusterClient>, QuarksStatefulSetError> {
        ctx.dependency::<DependencyHandle<dyn ClusterClient>>()
            .map(|handle| handle.get())
            .ok_or_else(|| {
                QuarksStatefulSetError::Dependency(
                    "cluster client not registered with runtime".to_string(),
                )
            })
    }

    fn probe_runner(
        ctx: &ReconcileContext<'_>,
    ) -> Result<Arc<dyn ProbeRunner>, QuarksStatefulSetError> {
        ctx.dependency::<DependencyHandle<dyn ProbeRunner>>()
            .map(|handle| handle.get())
            .ok_or_else(|| {
                QuarksStatefulSetError::Dependency(
                    "probe runner not registered with runtime".to_string(),
                )
            })
    }

    async fn observe(
        client: Arc<dyn ClusterClient>,
        target: &ControllerTarget,
    ) -> FetchResult<QuarksStatefulSet, ObservedState, QuarksStatefulSetError> {
        let namespace = target.namespace.as_str();
        let qsts = Api::<QuarksStatefulSet>::namespaced(Arc::clone(&client), namespace)
            .get(&target.name)
            .await?;
        let Some(qsts) = qsts.filter(|qsts| qsts.metadata.deletion_timestamp.is_none()) else {
            metrics::clear_version_gauges(namespace, &target.name);
            log_debug(
                COMPONENT,
                "QuarksStatefulSet is gone; nothing to reconcile",
                &[("namespace", namespace), ("quarksstatefulset", target.name.as_str())],
            );
            return Ok(None);
        };

        let selector = owned_by_selector(&target.name);
        let statefulsets = Api::<StatefulSet>::namespaced(Arc::clone(&client), namespace)
            .list(&selector)
            .await?;
        let pods = Api::<Pod>::namespaced(Arc::clone(&client), namespace)
            .list(&selector)
            .await?;
        let claims = Api::<PersistentVolumeClaim>::namespaced(Arc::clone(&client), namespace)
            .list(&selector)
            .await?
            .into_iter()
            .map(|claim| claim.metadata.name_or_empty().to_string())
            .collect();

        let mut config_maps = BTreeMap::new();
        let mut secrets = BTreeMap::new();
        if qsts.spec.update_on_config_change {
            let refs = referenced_configs(&qsts.spec.template.spec.template.spec);
            let config_map_api = Api::<ConfigMap>::namespaced(Arc::clone(&client), namespace);
            for name in refs.config_maps.keys() {
                if let Some(config_map) = config_map_api.get(name).await? {
                    config_maps.insert(name.clone(), config_map);
                }
            }
            let secret_api = Api::<Secret>::namespaced(Arc::clone(&client), namespace);
            for name in refs.secrets.keys() {
                if let Some(secret) = secret_api.get(name).await? {
                    secrets.insert(name.clone(), secret);
                }
            }
        }

        Ok(Some(ReconcileData {
            desired: qsts,
            observed: ObservedState {
                statefulsets,
                pods,
                claims,
                config_maps,
                secrets,
            },
        }))
    }

    /// One pass, re-run from a fresh read after write conflicts.
    pub async fn reconcile_with_retry(
        &self,
        ctx: &ReconcileContext<'_>,
        target: &ControllerTarget,
    ) -> Result<ReconcileOutcome, QuarksStatefulSetError> {
        let mut attempt = 1;
        loop {
            match self.reconcile_and_apply(ctx, target).await {
                Err(err) if err.is_conflict() && attempt < MAX_CONFLICT_ATTEMPTS => {
                    let error_text = err.to_string();
                    let attempt_text = attempt.to_string();
                    log_debug(
                        COMPONENT,
                        "Write conflict; recomputing pass",
                        &[
                            ("namespace", target.namespace.as_str()),
                            ("quarksstatefulset", target.name.as_str()),
                            ("attempt", attempt_text.as_str()),
                            ("error", error_text.as_str()),
                        ],
                    );
                    attempt += 1;
                }
                result => return result,
            }
        }
    }

    async fn create_claims(
        client: &Arc<dyn ClusterClient>,
        plan: &QuarksStatefulSetPlan,
    ) -> Result<(), QuarksStatefulSetError> {
        let api =
            Api::<PersistentVolumeClaim>::namespaced(Arc::clone(client), plan.qsts.namespace());
        for claim in &plan.claims {
            match api.create(claim).await {
                Ok(_) => log_info(
                    COMPONENT,
                    "Created shared volume claim",
                    &[
                        ("namespace", plan.qsts.namespace()),
                        ("claim", claim.metadata.name_or_empty()),
                    ],
                ),
                Err(err) if err.is_already_exists() => {}
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }

    async fn apply_statefulsets(
        client: &Arc<dyn ClusterClient>,
        recorder: Option<&EventRecorder>,
        plan: &QuarksStatefulSetPlan,
    ) -> Result<(), QuarksStatefulSetError> {
        let namespace = plan.qsts.namespace();
        let api = Api::<StatefulSet>::namespaced(Arc::clone(client), namespace);
        let versions = &plan.versions;

        for statefulset in &versions.create {
            api.create(statefulset).await?;
            log_info(
                COMPONENT,
                "Created versioned StatefulSet",
                &[
                    ("namespace", namespace),
                    ("statefulset", statefulset.metadata.name_or_empty()),
                ],
            );
        }
        if versions.created {
            let message = format!("Created version {}", versions.latest);
            record_event(recorder, &plan.qsts, EventType::Normal, VERSION_CREATED, &message).await;
        }
        if versions.guarded {
            record_event(
                recorder,
                &plan.qsts,
                EventType::Warning,
                VOLUME_CLAIM_TEMPLATES_WARNING,
                VOLUME_CLAIM_TEMPLATES_MESSAGE,
            )
            .await;
        }

        for statefulset in versions.update.iter().chain(&versions.scale_down) {
            api.update(statefulset).await?;
        }
        for statefulset in &versions.delete {
            let name = statefulset.metadata.name_or_empty();
            match api
                .delete(name, statefulset.metadata.resource_version.as_deref())
                .await
            {
                Ok(()) => log_info(
                    COMPONENT,
                    "Deleted retired StatefulSet",
                    &[("namespace", namespace), ("statefulset", name)],
                ),
                Err(err) if err.is_not_found() => {}
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }

    async fn elect_active(
        ctx: &ReconcileContext<'_>,
        client: &Arc<dyn ClusterClient>,
        recorder: Option<&EventRecorder>,
        plan: &QuarksStatefulSetPlan,
        pods: &[Pod],
    ) -> Result<(), QuarksStatefulSetError> {
        let namespace = plan.qsts.namespace();
        let pod_api = Api::<Pod>::namespaced(Arc::clone(client), namespace);
        match &plan.election {
            ElectionPlan::Strip(stale) => {
                for pod in stale {
                    pod_api.update(pod).await?;
                }
                Ok(())
            }
            ElectionPlan::Elect { probes, .. } => {
                let runner = Self::probe_runner(ctx)?;
                let Some(elected) = active_passive::elect(runner.as_ref(), pods, probes).await
                else {
                    metrics::record_election(namespace, ElectionResult::NoCandidate);
                    log_debug(
                        COMPONENT,
                        "No pod passed the active probes",
                        &[("namespace", namespace), ("quarksstatefulset", plan.qsts.name())],
                    );
                    return Ok(());
                };
                let changes = label_changes(pods, &elected);
                if changes.is_empty() {
                    metrics::record_election(namespace, ElectionResult::Unchanged);
                    return Ok(());
                }
                for pod in &changes {
                    pod_api.update(pod).await?;
                }
                metrics::record_election(namespace, ElectionResult::Elected);
                let message = format!("Pod {} is now active", elected);
                record_event(recorder, &plan.qsts, EventType::Normal, ACTIVE_POD_ELECTED, &message)
                    .await;
                Ok(())
            }
        }
    }
}

async fn record_event(
    recorder: Option<&EventRecorder>,
    qsts: &QuarksStatefulSet,
    event_type: EventType,
    reason: &str,
    message: &str,
) {
    let Some(recorder) = recorder else {
        return;
    };
    if let Err(err) = recorder.record(qsts, event_type, reason, message).await {
        let error_text = err.to_string();
        log_warn(
            COMPONENT,
            "Failed to record event",
            &[
                ("namespace", qsts.namespace()),
                ("quarksstatefulset", qsts.name()),
                ("reason", reason),
                ("error", error_text.as_str()),
            ],
        );
    }
}

fn validate(qsts: &QuarksStatefulSet) -> Result<(), QuarksStatefulSetError> {
    if qsts.spec.template.spec.template.spec.containers.is_empty() {
        return Err(QuarksStatefulSetError::InvalidTemplate(
            "pod template has no containers".to_string(),
        ));
    }
    let mut seen = BTreeSet::new();
    for zone in &qsts.spec.zones {
        if zone.is_empty() || !seen.insert(zone.as_str()) {
            return Err(QuarksStatefulSetError::InvalidTemplate(format!(
                "zone '{}' is empty or listed twice",
                zone
            )));
        }
    }
    Ok(())
}

impl Reconciler for QuarksStatefulSetController {
    type Desired = QuarksStatefulSet;
    type Observed = ObservedState;
    type Plan = QuarksStatefulSetPlan;
    type Error = QuarksStatefulSetError;

    fn kind(&self) -> &'static str {
        "QuarksStatefulSet"
    }

    async fn fetch(
        &self,
        ctx: &ReconcileContext<'_>,
        target: &ControllerTarget,
    ) -> FetchResult<QuarksStatefulSet, ObservedState, QuarksStatefulSetError> {
        let client = Self::client(ctx)?;
        with_span(COMPONENT, "observe", Self::observe(client, target)).await
    }

    fn diff(
        &self,
        target: &ControllerTarget,
        qsts: &QuarksStatefulSet,
        observed: &ObservedState,
    ) -> Result<QuarksStatefulSetPlan, QuarksStatefulSetError> {
        validate(qsts)?;
        log_debug(
            COMPONENT,
            "Resolving version",
            &[
                ("namespace", target.namespace.as_str()),
                ("quarksstatefulset", target.name.as_str()),
            ],
        );

        let config_sha1 = if qsts.spec.update_on_config_change {
            let refs = referenced_configs(&qsts.spec.template.spec.template.spec);
            Some(config_digest(&refs, &observed.config_maps, &observed.secrets)?)
        } else {
            None
        };
        let versions = plan_versions(
            qsts,
            &observed.statefulsets,
            &observed.pods,
            config_sha1.as_deref(),
        )?;

        let annotation = qsts.metadata.annotation(ANNOTATION_ORDINAL_REVISIONS);
        let (mut revisions, malformed_revisions) = match Revisions::decode(annotation) {
            RevisionsDecode::Malformed(err) => (Revisions::default(), Some(err)),
            decoded => (decoded.into_revisions(), None),
        };
        // The pass that created the version may not have persisted the seed.
        if let Some(previous) = versions.previous_hash.as_deref() {
            if !revisions.contains(&versions.template_hash) {
                let ordinals: Vec<u32> = (0..qsts.replicas().max(0) as u32).collect();
                revisions.seed(
                    &versions.template_hash,
                    previous,
                    &ordinals,
                    active_ordinal(&observed.pods),
                );
            }
        }

        let zones = &qsts.spec.zones;
        let mut latest_pods: Vec<(u32, &Pod)> = observed
            .pods
            .iter()
            .filter(|pod| pod_version(pod) == versions.latest && !pod.is_terminating())
            .filter_map(|pod| global_pod_ordinal(pod, zones.len()).map(|ordinal| (ordinal, pod)))
            .collect();
        latest_pods.sort_by_key(|(ordinal, _)| *ordinal);
        let pod_labels: Vec<Pod> = latest_pods
            .into_iter()
            .filter_map(|(ordinal, pod)| {
                let startup = revisions.assign(&versions.template_hash, &ordinal.to_string());
                labeled_pod(pod, ordinal, &startup, versions.latest, zones)
            })
            .collect();

        revisions.prune(versions.live_hashes.iter().map(String::as_str));
        let revisions_update = if revisions.is_empty() && annotation.is_none() {
            None
        } else {
            let encoded = revisions
                .encode()
                .map_err(|err| QuarksStatefulSetError::InvalidTemplate(err.to_string()))?;
            (Some(encoded.as_str()) != annotation).then_some(encoded)
        };

        let claims = missing_shared_claims(qsts, &versions.claim_templates, &observed.claims);
        let election = if qsts.is_active_passive() {
            ElectionPlan::Elect {
                probes: qsts.spec.active_passive_probes.clone(),
                interval: requeue_interval(&qsts.spec.active_passive_probes),
            }
        } else {
            ElectionPlan::Strip(strip_active_labels(&observed.pods))
        };
        if versions.guarded {
            log_debug(
                COMPONENT,
                "Kept previous volume claim templates",
                &[
                    ("namespace", target.namespace.as_str()),
                    ("quarksstatefulset", target.name.as_str()),
                ],
            );
        }

        Ok(QuarksStatefulSetPlan {
            qsts: qsts.clone(),
            versions,
            claims,
            pod_labels,
            revisions: revisions_update,
            malformed_revisions,
            pods: observed.pods.clone(),
            election,
        })
    }

    async fn apply(
        &self,
        ctx: &ReconcileContext<'_>,
        target: &ControllerTarget,
        plan: QuarksStatefulSetPlan,
    ) -> Result<ReconcileOutcome, QuarksStatefulSetError> {
        let client = Self::client(ctx)?;
        let recorder = ctx.dependency::<EventRecorder>();
        let namespace = target.namespace.as_str();

        if let Some(err) = &plan.malformed_revisions {
            metrics::record_malformed_revisions(namespace);
            log_warn(
                COMPONENT,
                "Ignoring malformed ordinal revisions annotation",
                &[
                    ("namespace", namespace),
                    ("quarksstatefulset", target.name.as_str()),
                    ("error", err.as_str()),
                ],
            );
        }

        let pods = with_span(COMPONENT, "apply", async {
            Self::create_claims(&client, &plan).await?;
            Self::apply_statefulsets(&client, recorder.as_deref(), &plan).await?;

            let pod_api = Api::<Pod>::namespaced(Arc::clone(&client), namespace);
            let mut written: HashMap<String, Pod> = HashMap::new();
            for pod in &plan.pod_labels {
                let updated = pod_api.update(pod).await?;
                written.insert(updated.metadata.name_or_empty().to_string(), updated);
            }

            if let Some(value) = &plan.revisions {
                let mut qsts = plan.qsts.clone();
                qsts.metadata
                    .annotations
                    .insert(ANNOTATION_ORDINAL_REVISIONS.to_string(), value.clone());
                Api::<QuarksStatefulSet>::namespaced(Arc::clone(&client), namespace)
                    .update(&qsts)
                    .await?;
            }

            let pods: Vec<Pod> = plan
                .pods
                .iter()
                .map(|pod| {
                    written
                        .remove(pod.metadata.name_or_empty())
                        .unwrap_or_else(|| pod.clone())
                })
                .collect();
            Ok::<_, QuarksStatefulSetError>(pods)
        })
        .await?;

        with_span(
            COMPONENT,
            "elect-active",
            Self::elect_active(ctx, &client, recorder.as_deref(), &plan, &pods),
        )
        .await?;

        let versions = &plan.versions;
        metrics::set_version_gauges(
            namespace,
            &target.name,
            versions.version_count,
            versions.max_available,
        );
        with_span(
            COMPONENT,
            "update-status",
            write_status(&client, target, Some(versions.max_available > 0)),
        )
        .await;

        let latest = versions.latest.to_string();
        let max_available = versions.max_available.to_string();
        log_info(
            COMPONENT,
            "Applied reconciliation plan",
            &[
                ("namespace", namespace),
                ("quarksstatefulset", target.name.as_str()),
                ("latest_version", latest.as_str()),
                ("max_available_version", max_available.as_str()),
                ("created", if versions.created { "true" } else { "false" }),
            ],
        );
        Ok(plan.requeue())
    }
}

/// Writes `lastReconcile` (and `ready` when known). Failures are logged and
/// otherwise ignored.
async fn write_status(
    client: &Arc<dyn ClusterClient>,
    target: &ControllerTarget,
    ready: Option<bool>,
) {
    let api = Api::<QuarksStatefulSet>::namespaced(Arc::clone(client), &target.namespace);
    let result: Result<(), ClusterError> = async {
        let Some(mut current) = api.get(&target.name).await? else {
            return Ok(());
        };
        let mut status = current.status.clone().unwrap_or_default();
        status.last_reconcile = Some(Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true));
        if let Some(ready) = ready {
            status.ready = ready;
        }
        current.status = Some(status);
        api.update_status(&current).await.map(|_| ())
    }
    .await;
    if let Err(err) = result {
        let error_text = err.to_string();
        log_warn(
            COMPONENT,
            "Failed to update QuarksStatefulSet status",
            &[
                ("namespace", target.namespace.as_str()),
                ("quarksstatefulset", target.name.as_str()),
                ("error", error_text.as_str()),
            ],
        );
    }
}

/// Registers the dependencies the reconciler resolves from the runtime.
pub fn register_dependencies(
    runtime: &ControllerRuntime,
    client: Arc<dyn ClusterClient>,
    probes: Arc<dyn ProbeRunner>,
    settings: ControllerSettings,
) {
    let recorder = Arc::new(EventRecorder::new(Arc::clone(&client), COMPONENT));
    let _ = runtime
        .register_dependency::<DependencyHandle<dyn ClusterClient>>(Arc::new(DependencyHandle::new(
            client,
        )));
    let _ = runtime
        .register_dependency::<DependencyHandle<dyn ProbeRunner>>(Arc::new(DependencyHandle::new(
            probes,
        )));
    let _ = runtime.register_dependency::<EventRecorder>(recorder);
    let _ = runtime.register_dependency::<ControllerSettings>(Arc::new(settings));
}

/// Runs one reconcile pass for `target` under the configured deadline.
pub async fn handle(runtime: &ControllerRuntime, target: ControllerTarget) -> ReconcileOutcome {
    let ctx = runtime.context();
    let controller = QuarksStatefulSetController::new();
    let timeout = ctx
        .dependency::<ControllerSettings>()
        .map(|settings| settings.reconcile_timeout)
        .unwrap_or_else(|| ControllerSettings::default().reconcile_timeout);

    let pass = async {
        match tokio::time::timeout(timeout, controller.reconcile_with_retry(&ctx, &target)).await {
            Ok(result) => result,
            Err(_) => Err(QuarksStatefulSetError::Timeout(timeout)),
        }
    };
    let span_name = format!("reconcile {}", target);
    let result = with_span(COMPONENT, span_name, metrics::observe_reconcile(CONTROLLER, pass)).await;

    match result {
        Ok(outcome) => outcome,
        Err(err) => {
            let error_text = err.to_string();
            log_error(
                COMPONENT,
                "QuarksStatefulSet reconciliation failed",
                &[
                    ("namespace", target.namespace.as_str()),
                    ("quarksstatefulset", target.name.as_str()),
                    ("error", error_text.as_str()),
                ],
            );
            if let Ok(client) = QuarksStatefulSetController::client(&ctx) {
                write_status(&client, &target, None).await;
            }
            if err.is_retryable() {
                ReconcileOutcome::Retry
            } else {
                ReconcileOutcome::Done
            }
        }
    }
}

/// Starts the workers and the watch loop. Handles finish once `shutdown` fires.
pub fn spawn(
    runtime: Arc<ControllerRuntime>,
    client: Arc<dyn ClusterClient>,
    probes: Arc<dyn ProbeRunner>,
    config: &OperatorConfig,
    shutdown: CancellationToken,
) -> Vec<JoinHandle<()>> {
    register_dependencies(
        &runtime,
        Arc::clone(&client),
        probes,
        ControllerSettings {
            reconcile_timeout: config.reconcile_timeout,
        },
    );

    let worker_runtime = Arc::clone(&runtime);
    let mut handles = runtime.spawn_workers(config.workers, shutdown.clone(), move |target| {
        let runtime = Arc::clone(&worker_runtime);
        async move { handle(&runtime, target).await }
    });

    let settings = WatchSettings {
        namespace: config.namespace.clone(),
        poll_interval: config.poll_interval,
        resync_interval: config.resync_interval,
    };
    let queue = runtime.work_queue();
    handles.push(tokio::spawn(watch::run(client, queue, settings, shutdown)));
    handles
}
