//! CES plan: turns a list of requested dogus into an ordered install plan.
//!
//! Planning is pure: descriptors are resolved from a [`DoguRegistry`], sorted
//! by their dogu dependencies and interleaved with readiness barriers for the
//! service accounts they need. [`StepFactory`] turns the plan into executable
//! steps.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use ces_core::{DoguDescriptor, DoguRequest, ServiceAccountKind};
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::{debug, info, warn};

mod registry;
mod steps;

pub use registry::{DirRegistry, DoguRegistry, RegistryError, StaticRegistry};
pub use steps::{InstallDoguStep, StepFactory, WaitForComponentStep, WaitForDoguStep};

#[derive(Debug, thiserror::Error)]
pub enum PlanError {
    #[error("dependency cycle between dogus: {}", .0.join(", "))]
    Cycle(Vec<String>),
    #[error("dogu {0} requested more than once")]
    Duplicate(String),
    #[error("resolving {request}: {source}")]
    Registry {
        request: String,
        #[source]
        source: RegistryError,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BarrierKind {
    Dogu,
    Component,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlannedStep {
    InstallDogu(DoguDescriptor),
    WaitForDogu(String),
    WaitForComponent(String),
}

impl PlannedStep {
    pub fn description(&self) -> String {
        match self {
            Self::InstallDogu(d) => format!("install dogu {} ({})", d.name, d.version),
            Self::WaitForDogu(t) => format!("wait for dogu {} to become ready", t),
            Self::WaitForComponent(t) => format!("wait for component {} to become ready", t),
        }
    }
}

impl fmt::Display for PlannedStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(&self.description()) }
}

/// Order descriptors so that every dogu follows the dogus it depends on.
///
/// Only dogu-type dependencies (hard and optional) present in `dogus` count.
/// Among dogus whose dependencies are satisfied the qualified name decides.
pub fn sort_by_dependencies(dogus: Vec<DoguDescriptor>) -> Result<Vec<DoguDescriptor>, PlanError> {
    let index: FxHashMap<&str, usize> = dogus.iter().enumerate().map(|(i, d)| (d.simple_name(), i)).collect();
    let mut indegree = vec![0usize; dogus.len()];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); dogus.len()];
    for (i, d) in dogus.iter().enumerate() {
        let deps: FxHashSet<usize> = d.dogu_dependencies().filter_map(|n| index.get(n).copied()).collect();
        for dep in deps {
            dependents[dep].push(i);
            indegree[i] += 1;
        }
    }
    let mut ready: BTreeMap<&str, usize> =
        indegree.iter().enumerate().filter(|(_, n)| **n == 0).map(|(i, _)| (dogus[i].name.as_str(), i)).collect();
    let mut order = Vec::with_capacity(dogus.len());
    while let Some((_, i)) = ready.pop_first() {
        order.push(i);
        for &j in &dependents[i] {
            indegree[j] -= 1;
            if indegree[j] == 0 {
                ready.insert(dogus[j].name.as_str(), j);
            }
        }
    }
    if order.len() != dogus.len() {
        let mut stuck: Vec<String> =
            indegree.iter().enumerate().filter(|(_, n)| **n > 0).map(|(i, _)| dogus[i].name.clone()).collect();
        stuck.sort();
        return Err(PlanError::Cycle(stuck));
    }
    let mut slots: Vec<Option<DoguDescriptor>> = dogus.into_iter().map(Some).collect();
    Ok(order.into_iter().filter_map(|i| slots[i].take()).collect())
}

/// Builds the dogu part of the install plan.
pub struct StepGenerator {
    registry: Arc<dyn DoguRegistry>,
    components: FxHashSet<String>,
    awaited: FxHashSet<String>,
}

impl StepGenerator {
    pub fn new(registry: Arc<dyn DoguRegistry>) -> Self {
        Self { registry, components: FxHashSet::default(), awaited: FxHashSet::default() }
    }

    /// Components installed by this run; optional component service accounts need one of them.
    pub fn with_components<I, S>(mut self, components: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.components = components.into_iter().map(Into::into).collect();
        self
    }

    /// Components that already have a wait step earlier in the pipeline; no barrier is emitted for them.
    pub fn with_awaited_components<I, S>(mut self, components: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.awaited = components.into_iter().map(Into::into).collect();
        self
    }

    pub async fn resolve(&self, requests: &[DoguRequest]) -> Result<Vec<DoguDescriptor>, PlanError> {
        let mut seen: FxHashSet<&str> = FxHashSet::default();
        let mut out = Vec::with_capacity(requests.len());
        for r in requests {
            if !seen.insert(r.simple_name()) {
                return Err(PlanError::Duplicate(r.simple_name().to_string()));
            }
            let res = match &r.version {
                Some(v) => self.registry.get(&r.name, v).await,
                None => self.registry.get_latest(&r.name).await,
            };
            let d = res.map_err(|source| PlanError::Registry { request: r.to_string(), source })?;
            debug!(dogu = %d.name, version = %d.version, "resolved");
            out.push(d);
        }
        Ok(out)
    }

    pub async fn generate(&self, requests: &[DoguRequest]) -> Result<Vec<PlannedStep>, PlanError> {
        let sorted = sort_by_dependencies(self.resolve(requests).await?)?;
        let steps = self.interleave_barriers(sorted);
        info!(dogus = requests.len(), steps = steps.len(), "dogu plan ready");
        Ok(steps)
    }

    fn interleave_barriers(&self, sorted: Vec<DoguDescriptor>) -> Vec<PlannedStep> {
        let resolved: FxHashSet<String> = sorted.iter().map(|d| d.simple_name().to_string()).collect();
        let mut barriers: FxHashSet<(BarrierKind, String)> =
            self.awaited.iter().map(|c| (BarrierKind::Component, c.clone())).collect();
        let mut steps = Vec::with_capacity(sorted.len() * 2);
        for d in sorted {
            for sa in &d.service_accounts {
                let (kind, available) = match &sa.kind {
                    ServiceAccountKind::Dogu => (BarrierKind::Dogu, resolved.contains(&sa.target)),
                    ServiceAccountKind::Component => (BarrierKind::Component, self.components.contains(&sa.target)),
                    ServiceAccountKind::Unknown(k) => {
                        warn!(dogu = %d.name, kind = %k, target = %sa.target, "unknown service account kind; skipping");
                        continue;
                    }
                };
                if !available && d.is_optional_service_account(sa) {
                    debug!(dogu = %d.name, target = %sa.target, "optional service account provider not installed; skipping");
                    continue;
                }
                if barriers.insert((kind, sa.target.clone())) {
                    steps.push(match kind {
                        BarrierKind::Dogu => PlannedStep::WaitForDogu(sa.target.clone()),
                        BarrierKind::Component => PlannedStep::WaitForComponent(sa.target.clone()),
                    });
                }
            }
            steps.push(PlannedStep::InstallDogu(d));
        }
        steps
    }
}
