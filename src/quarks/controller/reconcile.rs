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

use crate::quarks::controller::runtime::{ControllerRuntime, ControllerTarget, ReconcileOutcome};
use std::error::Error;
use std::future::Future;
use std::sync::Arc;

/// Execution context shared across reconciliation phases.
///
/// Exposes the `ControllerRuntime` so reconcilers can reach the cluster
/// client, event recorder, and other registered helpers.
pub struct ReconcileContext<'a> {
    runtime: &'a ControllerRuntime,
}

impl<'a> ReconcileContext<'a> {
    pub fn new(runtime: &'a ControllerRuntime) -> Self {
        Self { runtime }
    }

    pub fn runtime(&self) -> &'a ControllerRuntime {
        self.runtime
    }

    pub fn dependency<T>(&self) -> Option<Arc<T>>
    where
        T: Send + Sync + 'static,
    {
        self.runtime.dependency::<T>()
    }
}

/// Sized wrapper so trait objects can live in the dependency registry.
pub struct DependencyHandle<T: ?Sized> {
    inner: Arc<T>,
}

impl<T: ?Sized> DependencyHandle<T> {
    pub fn new(inner: Arc<T>) -> Self {
        Self { inner }
    }

    pub fn get(&self) -> Arc<T> {
        Arc::clone(&self.inner)
    }
}

impl<T: ?Sized> Clone for DependencyHandle<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

/// Desired input and observed state gathered during the fetch phase.
pub struct ReconcileData<Desired, Observed> {
    pub desired: Desired,
    pub observed: Observed,
}

pub type FetchResult<D, O, E> = Result<Option<ReconcileData<D, O>>, E>;

/// Fetch, plan, apply.
///
/// `fetch` and `apply` talk to the cluster; `diff` is pure so plans can be
/// asserted on directly in tests.
pub trait Reconciler: Send + Sync {
    type Desired: Send + Sync;
    type Observed: Send + Sync;
    type Plan: Send;
    type Error: Error + Send + Sync + 'static;

    /// Logical kind handled by this reconciler, used for diagnostics.
    fn kind(&self) -> &'static str;

    /// Loads the desired spec and observed state. `Ok(None)` means the
    /// object is gone and nothing remains to do.
    fn fetch(
        &self,
        ctx: &ReconcileContext<'_>,
        target: &ControllerTarget,
    ) -> impl Future<Output = FetchResult<Self::Desired, Self::Observed, Self::Error>> + Send;

    fn diff(
        &self,
        target: &ControllerTarget,
        desired: &Self::Desired,
        observed: &Self::Observed,
    ) -> Result<Self::Plan, Self::Error>;

    fn apply(
        &self,
        ctx: &ReconcileContext<'_>,
        target: &ControllerTarget,
        plan: Self::Plan,
    ) -> impl Future<Output = Result<ReconcileOutcome, Self::Error>> + Send;

    /// Fetch and diff, returning a plan when the object still exists.
    fn reconcile(
        &self,
        ctx: &ReconcileContext<'_>,
        target: &ControllerTarget,
    ) -> impl Future<Output = Result<Option<Self::Plan>, Self::Error>> + Send {
        async move {
            match self.fetch(ctx, target).await? {
                Some(data) => Ok(Some(self.diff(target, &data.desired, &data.observed)?)),
                None => Ok(None),
            }
        }
    }

    fn reconcile_and_apply(
        &self,
        ctx: &ReconcileContext<'_>,
        target: &ControllerTarget,
    ) -> impl Future<Output = Result<ReconcileOutcome, Self::Error>> + Send {
        async move {
            match self.reconcile(ctx, target).await? {
                Some(plan) => self.apply(ctx, target, plan).await,
                None => Ok(ReconcileOutcome::Done),
            }
        }
    }
}
