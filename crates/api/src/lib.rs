//! CES setup façade.
//!
//! Assembles the full install pipeline from a [`SetupConfig`] and runs it
//! once, guarded by the durable run state. Frontends (the `ces-setup` CLI)
//! depend on this crate only.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Instant;

use ces_core::{Phase, RunState};
use ces_executor::{Executor, ExecutorError, Step};
use ces_kubehub::crd::{Component, Dogu};
use ces_kubehub::{
    JsonPatchClient, KubeAccessor, KubeHub, MemoryAccessor, MemoryHub, ResourceAccessor, RunStateStore, SchemaResolver, StateError,
};
use ces_patch::ResourcePatcher;
use ces_plan::{DoguRegistry, PlanError, StepFactory, StepGenerator, WaitForComponentStep};
use ces_ready::{ReadyConfig, ReadyWatcher};
use k8s_openapi::api::core::v1::{ConfigMap, Namespace, Pod, Service};
use metrics::counter;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

mod config;
mod steps;

pub use config::{validate_config, ComponentConfig, ConfigError, DogusConfig, LoadbalancerConfig, SetupConfig, WaitOverrides};
pub use steps::{
    CreateLoadbalancerStep, CreateNamespaceStep, InstallComponentStep, PatchPhaseStep, ValidateConfigurationStep,
    WriteSetupConfigStep, CES_CONFIG_MAP, LOADBALANCER_SERVICE,
};

#[derive(Debug, thiserror::Error)]
pub enum SetupError {
    #[error("setup is already running")]
    AlreadyRunning,
    #[error("setup has already completed")]
    AlreadyInstalled,
    #[error("invalid setup configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("planning dogu installation: {0}")]
    Plan(#[from] PlanError),
    #[error(transparent)]
    State(#[from] StateError),
    #[error(transparent)]
    Step(#[from] ExecutorError),
}

impl SetupError {
    /// Description of the pipeline step that failed, if any.
    pub fn failed_step(&self) -> Option<&str> {
        match self {
            Self::Step(e) => e.failed_step(),
            _ => None,
        }
    }
}

/// Handles to everything the pipeline touches in the cluster.
#[derive(Clone)]
pub struct Cluster {
    pub namespaces: Arc<dyn ResourceAccessor<Namespace>>,
    pub config_maps: Arc<dyn ResourceAccessor<ConfigMap>>,
    pub services: Arc<dyn ResourceAccessor<Service>>,
    pub pods: Arc<dyn ResourceAccessor<Pod>>,
    pub dogus: Arc<dyn ResourceAccessor<Dogu>>,
    pub components: Arc<dyn ResourceAccessor<Component>>,
    pub resolver: Arc<dyn SchemaResolver>,
    pub patches: Arc<dyn JsonPatchClient>,
}

impl Cluster {
    /// Namespaced handles are scoped to `namespace`.
    pub fn kube(client: kube::Client, namespace: &str) -> Self {
        let hub = Arc::new(KubeHub::new(client.clone()));
        Self {
            namespaces: Arc::new(KubeAccessor::<Namespace>::cluster(client.clone())),
            config_maps: Arc::new(KubeAccessor::<ConfigMap>::namespaced(client.clone(), namespace)),
            services: Arc::new(KubeAccessor::<Service>::namespaced(client.clone(), namespace)),
            pods: Arc::new(KubeAccessor::<Pod>::namespaced(client.clone(), namespace)),
            dogus: Arc::new(KubeAccessor::<Dogu>::namespaced(client.clone(), namespace)),
            components: Arc::new(KubeAccessor::<Component>::namespaced(client, namespace)),
            resolver: hub.clone(),
            patches: hub,
        }
    }
}

/// In-memory cluster for planning without a control plane and for tests.
#[derive(Clone, Default)]
pub struct MemoryCluster {
    pub namespaces: Arc<MemoryAccessor<Namespace>>,
    pub config_maps: Arc<MemoryAccessor<ConfigMap>>,
    pub services: Arc<MemoryAccessor<Service>>,
    pub pods: Arc<MemoryAccessor<Pod>>,
    pub dogus: Arc<MemoryAccessor<Dogu>>,
    pub components: Arc<MemoryAccessor<Component>>,
    pub hub: Arc<MemoryHub>,
}

impl MemoryCluster {
    pub fn new() -> Self { Self::default() }

    pub fn cluster(&self) -> Cluster {
        Cluster {
            namespaces: self.namespaces.clone(),
            config_maps: self.config_maps.clone(),
            services: self.services.clone(),
            pods: self.pods.clone(),
            dogus: self.dogus.clone(),
            components: self.components.clone(),
            resolver: self.hub.clone(),
            patches: self.hub.clone(),
        }
    }
}

/// One setup run.
pub struct Setup {
    config: Arc<SetupConfig>,
    cluster: Cluster,
    registry: Arc<dyn DoguRegistry>,
    watcher: ReadyWatcher,
}

impl Setup {
    /// Readiness timing comes from `CES_WAIT_*`, then from the config's `wait` section.
    pub fn new(config: SetupConfig, cluster: Cluster, registry: Arc<dyn DoguRegistry>) -> Self {
        let watcher = ReadyWatcher::new(config.wait.apply(ReadyConfig::from_env()));
        Self { config: Arc::new(config), cluster, registry, watcher }
    }

    pub fn with_watcher(mut self, watcher: ReadyWatcher) -> Self {
        self.watcher = watcher;
        self
    }

    /// Step descriptions in execution order. Reads descriptors, never the cluster.
    pub async fn plan(&self) -> Result<Vec<String>, SetupError> { Ok(self.build().await?.descriptions()) }

    pub async fn state(&self) -> Result<Option<RunState>, SetupError> {
        Ok(RunStateStore::new(self.cluster.config_maps.clone()).get().await?)
    }

    pub async fn run(&self, cancel: &CancellationToken) -> Result<(), SetupError> {
        let store = RunStateStore::new(self.cluster.config_maps.clone());
        match store.get().await? {
            Some(RunState::Installing) => return Err(SetupError::AlreadyRunning),
            Some(RunState::Installed) => return Err(SetupError::AlreadyInstalled),
            None => {}
        }
        let mut executor = self.build().await?;
        let t0 = Instant::now();
        store.claim().await.map_err(|e| match e {
            StateError::Taken { found: Some(RunState::Installed) } => SetupError::AlreadyInstalled,
            StateError::Taken { .. } => SetupError::AlreadyRunning,
            other => other.into(),
        })?;
        counter!("setup_runs_total", 1u64);
        if let Err(e) = executor.run(cancel).await {
            counter!("setup_run_failures_total", 1u64);
            warn!(step = e.failed_step().unwrap_or("-"), error = %e, "setup failed; state stays installing");
            return Err(e.into());
        }
        store.set(RunState::Installed).await?;
        info!(namespace = %self.config.namespace, took_ms = %t0.elapsed().as_millis(), "setup finished");
        Ok(())
    }

    async fn build(&self) -> Result<Executor, SetupError> {
        let cfg = &self.config;
        let requests = cfg.dogu_requests()?;
        let components = cfg.component_names();
        let planned = StepGenerator::new(self.registry.clone())
            .with_components(components.clone())
            .with_awaited_components(components)
            .generate(&requests)
            .await?;
        let c = &self.cluster;
        let patcher = ResourcePatcher::new(c.resolver.clone(), c.patches.clone(), &cfg.namespace);
        let directives = Arc::new(cfg.resource_patches.clone());
        let patch_step = |phase: Phase| -> Box<dyn Step> { Box::new(PatchPhaseStep::new(phase, patcher.clone(), directives.clone())) };
        let factory = StepFactory::new(&cfg.namespace, c.dogus.clone(), c.pods.clone(), c.components.clone(), self.watcher.clone());

        let mut ex = Executor::new();
        ex.register(Box::new(ValidateConfigurationStep::new(cfg.clone())));
        ex.register(Box::new(CreateNamespaceStep::new(&cfg.namespace, c.namespaces.clone())));
        for comp in &cfg.components {
            ex.register(Box::new(InstallComponentStep::new(comp.clone(), &cfg.namespace, c.components.clone())));
            ex.register(Box::new(WaitForComponentStep::new(&comp.name, c.components.clone(), self.watcher.clone())));
        }
        ex.register(patch_step(Phase::Component));
        ex.register(Box::new(WriteSetupConfigStep::new(cfg, c.config_maps.clone())));
        ex.register_all(factory.materialize(planned));
        ex.register(patch_step(Phase::Dogu));
        if cfg.loadbalancer.enabled {
            ex.register(Box::new(CreateLoadbalancerStep::new(&cfg.namespace, cfg.loadbalancer.clone(), c.services.clone())));
        }
        ex.register(patch_step(Phase::Loadbalancer));
        info!(steps = ex.len(), dogus = requests.len(), components = cfg.components.len(), "setup pipeline assembled");
        Ok(ex)
    }
}
