//! Platform steps of the install pipeline that are not generated from dogu descriptors.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Context;
use ces_core::{simple_name, Phase};
use ces_executor::Step;
use ces_kubehub::crd::{Component, ComponentSpec, APP_LABEL, APP_LABEL_VALUE, COMPONENT_NAME_LABEL, DOGU_NAME_LABEL};
use ces_kubehub::{AccessError, ResourceAccessor};
use ces_patch::{PatchDirective, ResourcePatcher};
use k8s_openapi::api::core::v1::{ConfigMap, Namespace, Service, ServicePort, ServiceSpec};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::ObjectMeta;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::{validate_config, ComponentConfig, LoadbalancerConfig, SetupConfig};

pub const CES_CONFIG_MAP: &str = "k8s-ces-config";
pub const LOADBALANCER_SERVICE: &str = "ces-loadbalancer";

fn ces_labels(extra: &[(&str, &str)]) -> Option<BTreeMap<String, String>> {
    let mut labels = BTreeMap::from([(APP_LABEL.to_string(), APP_LABEL_VALUE.to_string())]);
    labels.extend(extra.iter().map(|(k, v)| (k.to_string(), v.to_string())));
    Some(labels)
}

/// `create`, where an existing object of the same name counts as done.
async fn create_once<K, A>(accessor: &A, obj: &K, what: &str) -> anyhow::Result<()>
where
    K: Send + Sync + 'static,
    A: ResourceAccessor<K> + ?Sized,
{
    match accessor.create(obj).await {
        Ok(_) => {
            info!(what, "created");
            Ok(())
        }
        Err(e) if e.is_already_exists() => {
            info!(what, "already exists");
            Ok(())
        }
        Err(e) => Err(e).with_context(|| format!("creating {}", what)),
    }
}

pub struct ValidateConfigurationStep {
    config: Arc<SetupConfig>,
}

impl ValidateConfigurationStep {
    pub fn new(config: Arc<SetupConfig>) -> Self { Self { config } }
}

#[async_trait::async_trait]
impl Step for ValidateConfigurationStep {
    fn description(&self) -> String { "validate setup configuration".to_string() }

    async fn perform(&self, _cancel: &CancellationToken) -> anyhow::Result<()> {
        validate_config(&self.config)?;
        Ok(())
    }
}

pub struct CreateNamespaceStep {
    namespace: String,
    namespaces: Arc<dyn ResourceAccessor<Namespace>>,
}

impl CreateNamespaceStep {
    pub fn new(namespace: &str, namespaces: Arc<dyn ResourceAccessor<Namespace>>) -> Self {
        Self { namespace: namespace.to_string(), namespaces }
    }
}

#[async_trait::async_trait]
impl Step for CreateNamespaceStep {
    fn description(&self) -> String { format!("create namespace {}", self.namespace) }

    async fn perform(&self, _cancel: &CancellationToken) -> anyhow::Result<()> {
        let ns = Namespace {
            metadata: ObjectMeta { name: Some(self.namespace.clone()), labels: ces_labels(&[]), ..Default::default() },
            ..Default::default()
        };
        create_once(self.namespaces.as_ref(), &ns, &format!("namespace {}", self.namespace)).await
    }
}

/// Creates the `Component` resource; the component operator installs the helm chart.
pub struct InstallComponentStep {
    component: ComponentConfig,
    namespace: String,
    components: Arc<dyn ResourceAccessor<Component>>,
}

impl InstallComponentStep {
    pub fn new(component: ComponentConfig, namespace: &str, components: Arc<dyn ResourceAccessor<Component>>) -> Self {
        Self { component, namespace: namespace.to_string(), components }
    }
}

#[async_trait::async_trait]
impl Step for InstallComponentStep {
    fn description(&self) -> String { format!("install component {} ({})", self.component.name, self.component.version) }

    async fn perform(&self, _cancel: &CancellationToken) -> anyhow::Result<()> {
        let c = &self.component;
        let mut res = Component::new(
            &c.name,
            ComponentSpec {
                name: c.name.clone(),
                namespace: c.helm_namespace.clone(),
                version: c.version.clone(),
                deploy_namespace: c.deploy_namespace.clone(),
            },
        );
        res.metadata.namespace = Some(self.namespace.clone());
        res.metadata.labels = ces_labels(&[(COMPONENT_NAME_LABEL, c.name.as_str())]);
        create_once(self.components.as_ref(), &res, &format!("component {}", c.name)).await
    }
}

/// Stores the global dogu selection where the dogus read it at startup.
pub struct WriteSetupConfigStep {
    namespace: String,
    default_dogu: String,
    dogus: Vec<String>,
    config_maps: Arc<dyn ResourceAccessor<ConfigMap>>,
}

impl WriteSetupConfigStep {
    pub fn new(cfg: &SetupConfig, config_maps: Arc<dyn ResourceAccessor<ConfigMap>>) -> Self {
        Self {
            namespace: cfg.namespace.clone(),
            default_dogu: simple_name(cfg.dogus.default_dogu.trim()).to_string(),
            dogus: cfg.dogus.install.clone(),
            config_maps,
        }
    }

    fn data(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            ("default_dogu".to_string(), self.default_dogu.clone()),
            ("dogus".to_string(), self.dogus.join("\n")),
        ])
    }

    async fn merge_into(&self, mut cm: ConfigMap) -> anyhow::Result<()> {
        cm.data.get_or_insert_with(BTreeMap::new).extend(self.data());
        self.config_maps.update(&cm).await.with_context(|| format!("updating config map {}", CES_CONFIG_MAP))?;
        Ok(())
    }

    async fn read(&self) -> anyhow::Result<ConfigMap> {
        self.config_maps.get(CES_CONFIG_MAP).await.with_context(|| format!("reading config map {}", CES_CONFIG_MAP))
    }
}

#[async_trait::async_trait]
impl Step for WriteSetupConfigStep {
    fn description(&self) -> String { format!("write setup configuration to {}", CES_CONFIG_MAP) }

    async fn perform(&self, _cancel: &CancellationToken) -> anyhow::Result<()> {
        match self.config_maps.get(CES_CONFIG_MAP).await {
            Ok(cm) => self.merge_into(cm).await?,
            Err(AccessError::NotFound(_)) => {
                let cm = ConfigMap {
                    metadata: ObjectMeta {
                        name: Some(CES_CONFIG_MAP.to_string()),
                        namespace: Some(self.namespace.clone()),
                        labels: ces_labels(&[]),
                        ..Default::default()
                    },
                    data: Some(self.data()),
                    ..Default::default()
                };
                match self.config_maps.create(&cm).await {
                    Ok(_) => {}
                    Err(e) if e.is_already_exists() => {
                        info!(config_map = CES_CONFIG_MAP, "created concurrently; merging into it");
                        self.merge_into(self.read().await?).await?;
                    }
                    Err(e) => return Err(e).with_context(|| format!("creating config map {}", CES_CONFIG_MAP)),
                }
            }
            Err(e) => return Err(e).with_context(|| format!("reading config map {}", CES_CONFIG_MAP)),
        }
        info!(default_dogu = %self.default_dogu, dogus = self.dogus.len(), "setup configuration written");
        Ok(())
    }
}

/// Exposes the ingress dogu through a `LoadBalancer` service.
pub struct CreateLoadbalancerStep {
    namespace: String,
    config: LoadbalancerConfig,
    services: Arc<dyn ResourceAccessor<Service>>,
}

impl CreateLoadbalancerStep {
    pub fn new(namespace: &str, config: LoadbalancerConfig, services: Arc<dyn ResourceAccessor<Service>>) -> Self {
        Self { namespace: namespace.to_string(), config, services }
    }

    fn service(&self) -> Service {
        let ports = self
            .config
            .ports
            .iter()
            .map(|p| ServicePort {
                name: Some(format!("{}-tcp", p)),
                port: *p,
                target_port: Some(IntOrString::Int(*p)),
                protocol: Some("TCP".to_string()),
                ..Default::default()
            })
            .collect();
        Service {
            metadata: ObjectMeta {
                name: Some(LOADBALANCER_SERVICE.to_string()),
                namespace: Some(self.namespace.clone()),
                labels: ces_labels(&[]),
                ..Default::default()
            },
            spec: Some(ServiceSpec {
                type_: Some("LoadBalancer".to_string()),
                selector: Some(BTreeMap::from([(DOGU_NAME_LABEL.to_string(), self.config.target_dogu.clone())])),
                ports: Some(ports),
                ..Default::default()
            }),
            ..Default::default()
        }
    }
}

#[async_trait::async_trait]
impl Step for CreateLoadbalancerStep {
    fn description(&self) -> String { format!("create loadbalancer service {}", LOADBALANCER_SERVICE) }

    async fn perform(&self, _cancel: &CancellationToken) -> anyhow::Result<()> {
        create_once(self.services.as_ref(), &self.service(), &format!("service {}", LOADBALANCER_SERVICE)).await
    }
}

/// Applies the configured resource patches of one phase.
pub struct PatchPhaseStep {
    phase: Phase,
    patcher: ResourcePatcher,
    directives: Arc<Vec<PatchDirective>>,
}

impl PatchPhaseStep {
    pub fn new(phase: Phase, patcher: ResourcePatcher, directives: Arc<Vec<PatchDirective>>) -> Self {
        Self { phase, patcher, directives }
    }
}

#[async_trait::async_trait]
impl Step for PatchPhaseStep {
    fn description(&self) -> String { format!("apply resource patches for phase {}", self.phase) }

    async fn perform(&self, _cancel: &CancellationToken) -> anyhow::Result<()> {
        self.patcher.apply(self.phase, &self.directives).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ces_kubehub::MemoryAccessor;

    fn config() -> SetupConfig {
        SetupConfig::from_yaml("namespace: ecosystem\ndogus:\n  defaultDogu: cas\n  install: [official/ldap, official/cas]\n").unwrap()
    }

    #[tokio::test]
    async fn setup_config_created_by_someone_else_is_merged() {
        let maps = Arc::new(MemoryAccessor::<ConfigMap>::new());
        maps.insert(ConfigMap {
            metadata: ObjectMeta { name: Some(CES_CONFIG_MAP.into()), resource_version: Some("1".into()), ..Default::default() },
            data: Some(BTreeMap::from([("fqdn".to_string(), "ces.local".to_string())])),
            ..Default::default()
        });
        // The first read misses the map, the create then collides with it.
        maps.fail_next_get(AccessError::NotFound(CES_CONFIG_MAP.into()));
        let step = WriteSetupConfigStep::new(&config(), maps.clone());
        step.perform(&CancellationToken::new()).await.unwrap();

        let data = maps.object(CES_CONFIG_MAP).and_then(|cm| cm.data).unwrap();
        assert_eq!(data["default_dogu"], "cas");
        assert_eq!(data["dogus"], "official/ldap\nofficial/cas");
        assert_eq!(data["fqdn"], "ces.local");
        assert!(maps.created().is_empty());
        assert_eq!(maps.updated().len(), 1);
    }
}
