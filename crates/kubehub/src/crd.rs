//! Custom resources created by the setup: dogus and platform components.

use kube::CustomResource;
use serde::{Deserialize, Serialize};

pub const DOGU_NAME_LABEL: &str = "dogu.name";
pub const COMPONENT_NAME_LABEL: &str = "k8s.cloudogu.com/component.name";
pub const APP_LABEL: &str = "app";
pub const APP_LABEL_VALUE: &str = "ces";

/// Desired state of an installed dogu, reconciled by the dogu operator.
#[derive(CustomResource, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[kube(
    group = "k8s.cloudogu.com",
    version = "v2",
    kind = "Dogu",
    namespaced,
    status = "DoguStatus",
    schema = "disabled"
)]
#[serde(rename_all = "camelCase")]
pub struct DoguSpec {
    /// Qualified name, e.g. `official/ldap`.
    pub name: String,
    pub version: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DoguStatus {
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub health: String,
}

/// Platform component installed from a helm repository by the component operator.
#[derive(CustomResource, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[kube(
    group = "k8s.cloudogu.com",
    version = "v1",
    kind = "Component",
    namespaced,
    status = "ComponentStatus",
    schema = "disabled"
)]
#[serde(rename_all = "camelCase")]
pub struct ComponentSpec {
    pub name: String,
    /// Helm repository namespace, e.g. `k8s`.
    pub namespace: String,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deploy_namespace: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentStatus {
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub health: String,
}

/// Health value reported by both operators once a resource is usable.
pub const HEALTH_AVAILABLE: &str = "available";
