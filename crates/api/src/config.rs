//! Setup configuration file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use ces_core::{simple_name, DoguRequest, ParseError};
use ces_patch::{PatchDirective, PatchError};
use ces_ready::ReadyConfig;
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("reading {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing setup configuration: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("namespace must not be empty")]
    EmptyNamespace,
    #[error("dogu entry {entry:?}: {source}")]
    Dogu {
        entry: String,
        #[source]
        source: ParseError,
    },
    #[error("dogu {0} is listed more than once")]
    DuplicateDogu(String),
    #[error("default dogu {0:?} is not among the dogus to install")]
    DefaultDogu(String),
    #[error("component entry #{index}: {reason}")]
    Component { index: usize, reason: String },
    #[error("resource patch #{index}: {source}")]
    Patch {
        index: usize,
        #[source]
        source: PatchError,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DogusConfig {
    /// Simple or qualified name of the dogu users land on.
    #[serde(default)]
    pub default_dogu: String,
    /// `namespace/name[:version]` entries.
    #[serde(default)]
    pub install: Vec<String>,
}

fn default_helm_namespace() -> String { "k8s".to_string() }

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentConfig {
    pub name: String,
    pub version: String,
    #[serde(default = "default_helm_namespace")]
    pub helm_namespace: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deploy_namespace: Option<String>,
}

fn default_ports() -> Vec<i32> { vec![80, 443] }
fn default_target_dogu() -> String { "nginx-ingress".to_string() }

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadbalancerConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_ports")]
    pub ports: Vec<i32>,
    /// Dogu whose pods receive the traffic.
    #[serde(default = "default_target_dogu")]
    pub target_dogu: String,
}

impl Default for LoadbalancerConfig {
    fn default() -> Self { Self { enabled: false, ports: default_ports(), target_dogu: default_target_dogu() } }
}

/// Per-run overrides of the readiness timing taken from the environment.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WaitOverrides {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_read_attempts: Option<u32>,
}

impl WaitOverrides {
    pub fn apply(&self, mut cfg: ReadyConfig) -> ReadyConfig {
        if let Some(t) = self.timeout_secs {
            cfg.timeout = Duration::from_secs(t);
        }
        if let Some(n) = self.max_read_attempts {
            cfg.max_read_attempts = n.max(1);
        }
        cfg
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetupConfig {
    pub namespace: String,
    #[serde(default)]
    pub dogus: DogusConfig,
    #[serde(default)]
    pub components: Vec<ComponentConfig>,
    #[serde(default)]
    pub loadbalancer: LoadbalancerConfig,
    #[serde(default)]
    pub resource_patches: Vec<PatchDirective>,
    /// Root of a directory registry with dogu descriptors.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registry_dir: Option<PathBuf>,
    #[serde(default)]
    pub wait: WaitOverrides,
}

impl SetupConfig {
    pub fn from_yaml(s: &str) -> Result<Self, ConfigError> { Ok(serde_yaml::from_str(s)?) }

    pub async fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| ConfigError::Read { path: path.to_path_buf(), source })?;
        Self::from_yaml(&text)
    }

    pub fn dogu_requests(&self) -> Result<Vec<DoguRequest>, ConfigError> {
        self.dogus
            .install
            .iter()
            .map(|e| e.parse::<DoguRequest>().map_err(|source| ConfigError::Dogu { entry: e.clone(), source }))
            .collect()
    }

    pub fn component_names(&self) -> Vec<String> { self.components.iter().map(|c| c.name.clone()).collect() }
}

/// Checks everything that can be checked without a cluster.
pub fn validate_config(cfg: &SetupConfig) -> Result<(), ConfigError> {
    if cfg.namespace.trim().is_empty() {
        return Err(ConfigError::EmptyNamespace);
    }
    let requests = cfg.dogu_requests()?;
    let mut seen = std::collections::BTreeSet::new();
    for r in &requests {
        if !seen.insert(r.simple_name()) {
            return Err(ConfigError::DuplicateDogu(r.simple_name().to_string()));
        }
    }
    let default = cfg.dogus.default_dogu.trim();
    if !default.is_empty() && !seen.contains(simple_name(default)) {
        return Err(ConfigError::DefaultDogu(default.to_string()));
    }
    for (index, c) in cfg.components.iter().enumerate() {
        if c.name.trim().is_empty() || c.version.trim().is_empty() {
            return Err(ConfigError::Component { index, reason: "name and version are required".into() });
        }
    }
    for (index, d) in cfg.resource_patches.iter().enumerate() {
        d.validate().map_err(|source| ConfigError::Patch { index, source })?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
namespace: ecosystem
dogus:
  defaultDogu: cas
  install:
    - official/ldap
    - official/cas:7.0.5-1
components:
  - name: k8s-dogu-operator
    version: 2.0.1
loadbalancer:
  enabled: true
resourcePatches:
  - phase: dogu
    resource: {apiVersion: v1, kind: ConfigMap, name: ldap-config}
    patches:
      - {op: replace, path: /data/mode, value: strict}
wait:
  timeoutSecs: 60
"#;

    #[test]
    fn parses_sample_with_defaults() {
        let cfg = SetupConfig::from_yaml(SAMPLE).unwrap();
        assert_eq!(cfg.namespace, "ecosystem");
        assert_eq!(cfg.components[0].helm_namespace, "k8s");
        assert_eq!(cfg.loadbalancer.ports, vec![80, 443]);
        assert_eq!(cfg.loadbalancer.target_dogu, "nginx-ingress");
        assert_eq!(cfg.dogu_requests().unwrap()[1].version.as_deref(), Some("7.0.5-1"));
        assert_eq!(cfg.wait.apply(ReadyConfig::default()).timeout, Duration::from_secs(60));
        validate_config(&cfg).unwrap();
    }

    #[test]
    fn rejects_default_dogu_outside_install_list() {
        let mut cfg = SetupConfig::from_yaml(SAMPLE).unwrap();
        cfg.dogus.default_dogu = "redmine".into();
        assert!(matches!(validate_config(&cfg), Err(ConfigError::DefaultDogu(_))));
        cfg.dogus.default_dogu = "official/cas".into();
        validate_config(&cfg).unwrap();
    }

    #[test]
    fn rejects_bad_entries() {
        let mut cfg = SetupConfig::from_yaml(SAMPLE).unwrap();
        cfg.dogus.install.push("ldap".into());
        assert!(matches!(validate_config(&cfg), Err(ConfigError::Dogu { .. })));

        let mut cfg = SetupConfig::from_yaml(SAMPLE).unwrap();
        cfg.dogus.install.push("premium/ldap".into());
        assert!(matches!(validate_config(&cfg), Err(ConfigError::DuplicateDogu(ref n)) if n == "ldap"));

        let mut cfg = SetupConfig::from_yaml(SAMPLE).unwrap();
        cfg.namespace = " ".into();
        assert!(matches!(validate_config(&cfg), Err(ConfigError::EmptyNamespace)));

        let mut cfg = SetupConfig::from_yaml(SAMPLE).unwrap();
        cfg.resource_patches[0].patches[0].value = None;
        let err = validate_config(&cfg).unwrap_err();
        assert!(err.to_string().starts_with("resource patch #0"), "{err}");
    }
}
