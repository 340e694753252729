//! CES kubehub: cluster capabilities consumed by the setup engine.
//!
//! Everything the engine needs from the control plane goes through the small
//! traits in this crate ([`ResourceAccessor`], [`SchemaResolver`],
//! [`JsonPatchClient`]) so the orchestration logic can run against
//! [`MemoryAccessor`] in tests.

#![forbid(unsafe_code)]

use anyhow::{Context, Result};
use kube::{
    api::{Api, Patch, PatchParams},
    core::{ApiResource, DynamicObject, GroupVersionKind},
    discovery::{Discovery, Scope},
    Client,
};
use metrics::counter;
use tokio::sync::OnceCell;
use tracing::{debug, info};

mod accessor;
pub mod crd;
mod memory;
mod state;

pub use accessor::{AccessError, EventStream, KubeAccessor, ListSnapshot, ResourceAccessor, ResourceEvent, WatchStatus};
pub use memory::{MemoryAccessor, MemoryHub, PatchCall};
pub use state::{RunStateStore, StateError, SETUP_STATE_CONFIG_MAP, STATE_KEY};

/// Create a client from the ambient kubeconfig or in-cluster service account.
pub async fn get_kube_client() -> Result<Client> {
    Client::try_default().await.context("creating kube client (kubeconfig or in-cluster config)")
}

/// Split an `apiVersion` into `(group, version)`; a single token is version-only in the core group.
pub fn parse_api_version(api_version: &str) -> (String, String) {
    match api_version.split_once('/') {
        Some((g, v)) => (g.to_string(), v.to_string()),
        None => (String::new(), api_version.to_string()),
    }
}

pub fn gvk_from_api_version(api_version: &str, kind: &str) -> GroupVersionKind {
    let (group, version) = parse_api_version(api_version);
    GroupVersionKind { group, version, kind: kind.to_string() }
}

pub fn gvk_key(gvk: &GroupVersionKind) -> String {
    if gvk.group.is_empty() {
        format!("{}/{}", gvk.version, gvk.kind)
    } else {
        format!("{}/{}/{}", gvk.group, gvk.version, gvk.kind)
    }
}

/// Concrete endpoint of a resource type.
#[derive(Debug, Clone)]
pub struct ResolvedKind {
    pub resource: ApiResource,
    pub namespaced: bool,
}

/// Maps group/version/kind to the served resource and its scope.
#[async_trait::async_trait]
pub trait SchemaResolver: Send + Sync {
    async fn resolve(&self, gvk: &GroupVersionKind) -> Result<ResolvedKind, AccessError>;
}

/// Issues a single RFC 6902 patch against a named resource.
#[async_trait::async_trait]
pub trait JsonPatchClient: Send + Sync {
    async fn json_patch(
        &self,
        kind: &ResolvedKind,
        namespace: Option<&str>,
        name: &str,
        patch: &json_patch::Patch,
    ) -> Result<(), AccessError>;
}

/// Kube-backed implementation of the schema and patch capabilities.
pub struct KubeHub {
    client: Client,
    discovery: OnceCell<Discovery>,
}

impl KubeHub {
    pub fn new(client: Client) -> Self { Self { client, discovery: OnceCell::new() } }

    pub fn client(&self) -> Client { self.client.clone() }

    /// Discovery is cached for the lifetime of the hub; kinds registered later are not seen.
    async fn discovery(&self) -> Result<&Discovery, AccessError> {
        self.discovery
            .get_or_try_init(|| async {
                let started = std::time::Instant::now();
                let d = Discovery::new(self.client.clone()).run().await.map_err(|e| AccessError::from_kube("api discovery", e))?;
                info!(groups = d.groups().count(), took_ms = %started.elapsed().as_millis(), "discovery complete");
                Ok::<_, AccessError>(d)
            })
            .await
    }
}

#[async_trait::async_trait]
impl SchemaResolver for KubeHub {
    async fn resolve(&self, gvk: &GroupVersionKind) -> Result<ResolvedKind, AccessError> {
        let discovery = self.discovery().await?;
        for group in discovery.groups() {
            for (ar, caps) in group.recommended_resources() {
                if ar.group == gvk.group && ar.version == gvk.version && ar.kind == gvk.kind {
                    let namespaced = matches!(caps.scope, Scope::Namespaced);
                    debug!(gvk = %gvk_key(gvk), plural = %ar.plural, namespaced, "resolved kind");
                    return Ok(ResolvedKind { resource: ar, namespaced });
                }
            }
        }
        Err(AccessError::NotFound(format!("resource type {}", gvk_key(gvk))))
    }
}

#[async_trait::async_trait]
impl JsonPatchClient for KubeHub {
    async fn json_patch(
        &self,
        kind: &ResolvedKind,
        namespace: Option<&str>,
        name: &str,
        patch: &json_patch::Patch,
    ) -> Result<(), AccessError> {
        let api: Api<DynamicObject> = match (kind.namespaced, namespace) {
            (true, Some(ns)) => Api::namespaced_with(self.client.clone(), ns, &kind.resource),
            (true, None) => {
                return Err(AccessError::Other(format!("namespace required for namespaced kind {}", kind.resource.kind)))
            }
            (false, _) => Api::all_with(self.client.clone(), &kind.resource),
        };
        let what = format!("{} {}", kind.resource.kind, name);
        api.patch(name, &PatchParams::default(), &Patch::Json::<()>(patch.clone()))
            .await
            .map_err(|e| AccessError::from_kube(&what, e))?;
        counter!("kube_json_patch_total", 1u64);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_version_core_group() {
        assert_eq!(parse_api_version("v1"), (String::new(), "v1".to_string()));
    }

    #[test]
    fn api_version_named_group() {
        assert_eq!(parse_api_version("apps/v1"), ("apps".to_string(), "v1".to_string()));
        assert_eq!(parse_api_version("k8s.cloudogu.com/v2"), ("k8s.cloudogu.com".to_string(), "v2".to_string()));
    }

    #[test]
    fn gvk_keys_render_like_kubectl() {
        assert_eq!(gvk_key(&gvk_from_api_version("v1", "ConfigMap")), "v1/ConfigMap");
        assert_eq!(gvk_key(&gvk_from_api_version("apps/v1", "Deployment")), "apps/v1/Deployment");
    }
}
