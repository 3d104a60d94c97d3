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

use crate::quarks::controller::reconcile::ReconcileContext;
use crate::quarks::observability::metrics;
use std::any::{Any, TypeId};
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock as StdRwLock};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub const DEFAULT_BASE_BACKOFF: Duration = Duration::from_millis(5);
pub const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(1000);

/// Shared controller plumbing: dependency registry, work queue, and worker pool.
pub struct ControllerRuntime {
    dependencies: DependencyRegistry,
    work_queue: WorkQueue<ControllerTarget>,
    workers_started: AtomicBool,
}

impl ControllerRuntime {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            dependencies: DependencyRegistry::default(),
            work_queue: WorkQueue::new(),
            workers_started: AtomicBool::new(false),
        })
    }

    pub fn register_dependency<T>(&self, dependency: Arc<T>) -> Option<Arc<T>>
    where
        T: Send + Sync + 'static,
    {
        self.dependencies.insert(dependency)
    }

    pub fn dependency<T>(&self) -> Option<Arc<T>>
    where
        T: Send + Sync + 'static,
    {
        self.dependencies.get::<T>()
    }

    pub fn context(&self) -> ReconcileContext<'_> {
        ReconcileContext::new(self)
    }

    pub fn work_queue(&self) -> WorkQueue<ControllerTarget> {
        self.work_queue.clone()
    }

    pub fn workers_started(&self) -> bool {
        self.workers_started.load(Ordering::SeqCst)
    }

    /// Spawns `workers` tasks that drain the queue until `shutdown` fires.
    ///
    /// The queue never hands the same target to two workers at once.
    pub fn spawn_workers<H, Fut>(
        &self,
        workers: usize,
        shutdown: CancellationToken,
        handler: H,
    ) -> Vec<JoinHandle<()>>
    where
        H: Fn(ControllerTarget) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ReconcileOutcome> + Send + 'static,
    {
        let handler = Arc::new(handler);
        let handles = (0..workers.max(1))
            .map(|_| {
                let queue = self.work_queue.clone();
                let handler = Arc::clone(&handler);
                let shutdown = shutdown.clone();
                tokio::spawn(async move {
                    loop {
                        let target = tokio::select! {
                            _ = shutdown.cancelled() => break,
                            next = queue.next() => match next {
                                Some(target) => target,
                                None => break,
                            },
                        };
                        let outcome = (handler.as_ref())(target.clone()).await;
                        queue.finish(&target, outcome);
                    }
                })
            })
            .collect();
        self.workers_started.store(true, Ordering::SeqCst);
        handles
    }
}

#[derive(Default)]
struct DependencyRegistry {
    values: StdRwLock<HashMap<TypeId, Arc<dyn Any + Send + Sync>>>,
}

impl DependencyRegistry {
    fn insert<T>(&self, dependency: Arc<T>) -> Option<Arc<T>>
    where
        T: Send + Sync + 'static,
    {
        let mut guard = self.values.write().unwrap_or_else(PoisonError::into_inner);
        guard
            .insert(TypeId::of::<T>(), dependency as Arc<dyn Any + Send + Sync>)
            .and_then(|previous| previous.downcast::<T>().ok())
    }

    fn get<T>(&self) -> Option<Arc<T>>
    where
        T: Send + Sync + 'static,
    {
        let guard = self.values.read().unwrap_or_else(PoisonError::into_inner);
        guard
            .get(&TypeId::of::<T>())
            .and_then(|value| Arc::clone(value).downcast::<T>().ok())
    }
}

/// What a worker does with a target after handling it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Converged; any backoff for the target is reset.
    Done,
    /// Converged, but look again after the delay.
    RequeueAfter(Duration),
    /// Failed; retry with per-target exponential backoff.
    Retry,
}

/// Rate-limited work queue keyed by item identity.
///
/// An item is queued at most once. An item added while a worker holds it is
/// marked dirty and queued again when that worker finishes.
pub struct WorkQueue<T> {
    inner: Arc<QueueInner<T>>,
}

impl<T> Clone for WorkQueue<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct QueueInner<T> {
    state: Mutex<QueueState<T>>,
    notify: Notify,
    base_backoff: Duration,
    max_backoff: Duration,
}

struct QueueState<T> {
    order: VecDeque<T>,
    queued: HashSet<T>,
    processing: HashSet<T>,
    dirty: HashSet<T>,
    failures: HashMap<T, u32>,
    shut_down: bool,
}

impl<T> WorkQueue<T>
where
    T: Clone + Eq + Hash + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::with_backoff(DEFAULT_BASE_BACKOFF, DEFAULT_MAX_BACKOFF)
    }

    pub fn with_backoff(base_backoff: Duration, max_backoff: Duration) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                state: Mutex::new(QueueState {
                    order: VecDeque::new(),
                    queued: HashSet::new(),
                    processing: HashSet::new(),
                    dirty: HashSet::new(),
                    failures: HashMap::new(),
                    shut_down: false,
                }),
                notify: Notify::new(),
                base_backoff,
                max_backoff,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, QueueState<T>> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add(&self, item: T) {
        let mut state = self.state();
        if state.shut_down || state.queued.contains(&item) {
            return;
        }
        if state.processing.contains(&item) {
            state.dirty.insert(item);
            return;
        }
        state.queued.insert(item.clone());
        state.order.push_back(item);
        metrics::set_work_queue_depth(state.order.len());
        drop(state);
        self.inner.notify.notify_one();
    }

    /// Adds `item` once `delay` has elapsed.
    pub fn add_after(&self, item: T, delay: Duration) {
        if delay.is_zero() {
            self.add(item);
            return;
        }
        let queue = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(item);
        });
    }

    /// Adds `item` after its next backoff step.
    pub fn add_rate_limited(&self, item: T) {
        let delay = {
            let mut state = self.state();
            let failures = state.failures.entry(item.clone()).or_insert(0);
            *failures = failures.saturating_add(1);
            self.backoff_for(*failures)
        };
        self.add_after(item, delay);
    }

    /// Clears the failure history of `item`.
    pub fn forget(&self, item: &T) {
        self.state().failures.remove(item);
    }

    pub fn failures(&self, item: &T) -> u32 {
        self.state().failures.get(item).copied().unwrap_or(0)
    }

    fn backoff_for(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(31);
        self.inner
            .base_backoff
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.inner.max_backoff)
            .min(self.inner.max_backoff)
    }

    /// Waits for the next item. Returns `None` once the queue is shut down.
    pub async fn next(&self) -> Option<T> {
        loop {
            let notified = self.inner.notify.notified();
            {
                let mut state = self.state();
                if state.shut_down {
                    return None;
                }
                if let Some(item) = state.order.pop_front() {
                    state.queued.remove(&item);
                    state.processing.insert(item.clone());
                    metrics::set_work_queue_depth(state.order.len());
                    if !state.order.is_empty() {
                        self.inner.notify.notify_one();
                    }
                    return Some(item);
                }
            }
            notified.await;
        }
    }

    /// Releases `item` after a worker handled it, re-queueing it when it was
    /// added in the meantime.
    pub fn done(&self, item: &T) {
        let mut state = self.state();
        state.processing.remove(item);
        if state.dirty.remove(item) && !state.shut_down && state.queued.insert(item.clone()) {
            state.order.push_back(item.clone());
            metrics::set_work_queue_depth(state.order.len());
            drop(state);
            self.inner.notify.notify_one();
        }
    }

    /// Applies a worker's verdict and releases the item.
    pub fn finish(&self, item: &T, outcome: ReconcileOutcome) {
        match outcome {
            ReconcileOutcome::Done => self.forget(item),
            ReconcileOutcome::RequeueAfter(delay) => {
                self.forget(item);
                self.add_after(item.clone(), delay);
            }
            ReconcileOutcome::Retry => self.add_rate_limited(item.clone()),
        }
        self.done(item);
    }

    pub fn len(&self) -> usize {
        self.state().order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn shut_down(&self) {
        self.state().shut_down = true;
        self.inner.notify.notify_waiters();
    }
}

impl<T> Default for WorkQueue<T>
where
    T: Clone + Eq + Hash + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

/// Identity of a QuarksStatefulSet to reconcile.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ControllerTarget {
    pub namespace: String,
    pub name: String,
}

impl ControllerTarget {
    pub fn new(namespace: &str, name: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }
}

impl fmt::Display for ControllerTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "QuarksStatefulSet/{}/{}", self.namespace, self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tokio::time::timeout;

    #[tokio::test]
    async fn dependency_round_trip() {
        let runtime = ControllerRuntime::new();
        let value = Arc::new(String::from("dependency"));
        assert!(runtime.register_dependency(value).is_none());
        let retrieved = runtime
            .dependency::<String>()
            .expect("dependency should be present");
        assert_eq!(retrieved.as_str(), "dependency");
        assert!(runtime.dependency::<u32>().is_none());
    }

    #[tokio::test]
    async fn duplicates_collapse_while_queued() {
        let queue: WorkQueue<&'static str> = WorkQueue::new();
        queue.add("a");
        queue.add("b");
        queue.add("a");
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.next().await, Some("a"));
        assert_eq!(queue.next().await, Some("b"));
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn item_added_while_processing_runs_again_after_done() {
        let queue: WorkQueue<&'static str> = WorkQueue::new();
        queue.add("a");
        let item = queue.next().await.expect("item");
        queue.add("a");
        assert!(queue.is_empty(), "in-flight item must not be handed out twice");

        queue.done(&item);
        assert_eq!(queue.len(), 1);
        assert_eq!(
            timeout(Duration::from_secs(1), queue.next()).await.expect("ready"),
            Some("a")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn retries_back_off_exponentially_and_reset_on_success() {
        let queue: WorkQueue<&'static str> =
            WorkQueue::with_backoff(Duration::from_millis(5), Duration::from_millis(40));
        assert_eq!(queue.backoff_for(1), Duration::from_millis(5));
        assert_eq!(queue.backoff_for(2), Duration::from_millis(10));
        assert_eq!(queue.backoff_for(3), Duration::from_millis(20));
        assert_eq!(queue.backoff_for(10), Duration::from_millis(40));

        queue.add("a");
        let item = queue.next().await.expect("item");
        queue.finish(&item, ReconcileOutcome::Retry);
        assert_eq!(queue.failures(&"a"), 1);
        assert!(queue.is_empty());

        let item = timeout(Duration::from_secs(1), queue.next())
            .await
            .expect("requeued after backoff")
            .expect("item");
        queue.finish(&item, ReconcileOutcome::Done);
        assert_eq!(queue.failures(&"a"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn requeue_after_delays_the_item() {
        let queue: WorkQueue<&'static str> = WorkQueue::new();
        queue.add("a");
        let item = queue.next().await.expect("item");
        queue.finish(&item, ReconcileOutcome::RequeueAfter(Duration::from_secs(10)));
        assert!(queue.is_empty());
        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn workers_never_share_a_target() {
        let runtime = ControllerRuntime::new();
        let shutdown = CancellationToken::new();
        let active = Arc::new(AtomicUsize::new(0));
        let overlap = Arc::new(AtomicBool::new(false));
        let runs = Arc::new(AtomicUsize::new(0));

        let handles = {
            let active = Arc::clone(&active);
            let overlap = Arc::clone(&overlap);
            let runs = Arc::clone(&runs);
            runtime.spawn_workers(4, shutdown.clone(), move |_target| {
                let active = Arc::clone(&active);
                let overlap = Arc::clone(&overlap);
                let runs = Arc::clone(&runs);
                async move {
                    if active.fetch_add(1, Ordering::SeqCst) > 0 {
                        overlap.store(true, Ordering::SeqCst);
                    }
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                    runs.fetch_add(1, Ordering::SeqCst);
                    ReconcileOutcome::Done
                }
            })
        };
        assert!(runtime.workers_started());

        let queue = runtime.work_queue();
        let target = ControllerTarget::new("demo", "web");
        for _ in 0..5 {
            queue.add(target.clone());
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        tokio::time::sleep(Duration::from_millis(200)).await;

        shutdown.cancel();
        for handle in handles {
            handle.await.expect("worker exits");
        }
        assert!(!overlap.load(Ordering::SeqCst));
        let runs = runs.load(Ordering::SeqCst);
        assert!((1..=5).contains(&runs), "runs = {runs}");
    }
}
