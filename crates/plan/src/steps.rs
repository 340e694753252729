use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Context;
use ces_core::DoguDescriptor;
use ces_executor::Step;
use ces_kubehub::crd::{Component, Dogu, DoguSpec, APP_LABEL, APP_LABEL_VALUE, COMPONENT_NAME_LABEL, DOGU_NAME_LABEL};
use ces_kubehub::ResourceAccessor;
use ces_ready::predicates::{component_healthy, pod_ready};
use ces_ready::{ReadyWatcher, WaitTarget};
use k8s_openapi::api::core::v1::Pod;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::PlannedStep;

/// Creates the `Dogu` resource; the dogu operator does the rest.
pub struct InstallDoguStep {
    descriptor: DoguDescriptor,
    namespace: String,
    dogus: Arc<dyn ResourceAccessor<Dogu>>,
}

impl InstallDoguStep {
    pub fn new(descriptor: DoguDescriptor, namespace: &str, dogus: Arc<dyn ResourceAccessor<Dogu>>) -> Self {
        Self { descriptor, namespace: namespace.to_string(), dogus }
    }

    fn resource(&self) -> Dogu {
        let simple = self.descriptor.simple_name();
        let mut dogu = Dogu::new(simple, DoguSpec { name: self.descriptor.name.clone(), version: self.descriptor.version.clone() });
        dogu.metadata.namespace = Some(self.namespace.clone());
        dogu.metadata.labels = Some(BTreeMap::from([
            (DOGU_NAME_LABEL.to_string(), simple.to_string()),
            (APP_LABEL.to_string(), APP_LABEL_VALUE.to_string()),
        ]));
        dogu
    }
}

#[async_trait::async_trait]
impl Step for InstallDoguStep {
    fn description(&self) -> String { PlannedStep::InstallDogu(self.descriptor.clone()).description() }

    async fn perform(&self, _cancel: &CancellationToken) -> anyhow::Result<()> {
        match self.dogus.create(&self.resource()).await {
            Ok(_) => {
                info!(dogu = %self.descriptor.name, version = %self.descriptor.version, "dogu resource created");
                Ok(())
            }
            Err(e) if e.is_already_exists() => {
                info!(dogu = %self.descriptor.name, "dogu resource already exists");
                Ok(())
            }
            Err(e) => Err(e).with_context(|| format!("creating dogu resource {}", self.descriptor.name)),
        }
    }
}

/// Blocks until a pod of the dogu reports ready.
pub struct WaitForDoguStep {
    target: String,
    pods: Arc<dyn ResourceAccessor<Pod>>,
    watcher: ReadyWatcher,
}

impl WaitForDoguStep {
    pub fn new(target: &str, pods: Arc<dyn ResourceAccessor<Pod>>, watcher: ReadyWatcher) -> Self {
        Self { target: target.to_string(), pods, watcher }
    }
}

#[async_trait::async_trait]
impl Step for WaitForDoguStep {
    fn description(&self) -> String { PlannedStep::WaitForDogu(self.target.clone()).description() }

    async fn perform(&self, cancel: &CancellationToken) -> anyhow::Result<()> {
        let target = WaitTarget::labeled(DOGU_NAME_LABEL, &self.target);
        self.watcher.wait_until_ready(cancel, self.pods.as_ref(), &target, pod_ready, None).await?;
        info!(dogu = %self.target, "dogu ready");
        Ok(())
    }
}

/// Blocks until the component operator reports the component as available.
pub struct WaitForComponentStep {
    target: String,
    components: Arc<dyn ResourceAccessor<Component>>,
    watcher: ReadyWatcher,
}

impl WaitForComponentStep {
    pub fn new(target: &str, components: Arc<dyn ResourceAccessor<Component>>, watcher: ReadyWatcher) -> Self {
        Self { target: target.to_string(), components, watcher }
    }
}

#[async_trait::async_trait]
impl Step for WaitForComponentStep {
    fn description(&self) -> String { PlannedStep::WaitForComponent(self.target.clone()).description() }

    async fn perform(&self, cancel: &CancellationToken) -> anyhow::Result<()> {
        let target = WaitTarget::named(&self.target, COMPONENT_NAME_LABEL);
        self.watcher.wait_until_ready(cancel, self.components.as_ref(), &target, component_healthy, None).await?;
        info!(component = %self.target, "component ready");
        Ok(())
    }
}

/// Cluster handles needed to execute planned dogu steps.
#[derive(Clone)]
pub struct StepFactory {
    namespace: String,
    dogus: Arc<dyn ResourceAccessor<Dogu>>,
    pods: Arc<dyn ResourceAccessor<Pod>>,
    components: Arc<dyn ResourceAccessor<Component>>,
    watcher: ReadyWatcher,
}

impl StepFactory {
    pub fn new(
        namespace: &str,
        dogus: Arc<dyn ResourceAccessor<Dogu>>,
        pods: Arc<dyn ResourceAccessor<Pod>>,
        components: Arc<dyn ResourceAccessor<Component>>,
        watcher: ReadyWatcher,
    ) -> Self {
        Self { namespace: namespace.to_string(), dogus, pods, components, watcher }
    }

    pub fn materialize(&self, planned: Vec<PlannedStep>) -> Vec<Box<dyn Step>> {
        planned
            .into_iter()
            .map(|p| -> Box<dyn Step> {
                match p {
                    PlannedStep::InstallDogu(d) => Box::new(InstallDoguStep::new(d, &self.namespace, self.dogus.clone())),
                    PlannedStep::WaitForDogu(t) => Box::new(WaitForDoguStep::new(&t, self.pods.clone(), self.watcher.clone())),
                    PlannedStep::WaitForComponent(t) => {
                        Box::new(WaitForComponentStep::new(&t, self.components.clone(), self.watcher.clone()))
                    }
                }
            })
            .collect()
    }
}
