//! CES resource patches: RFC 6902 directives applied to named cluster resources
//! at a given install phase.
//!
//! Directives are validated before anything touches the cluster. Within a
//! phase they run concurrently and every failure is reported, not only the
//! first one.

#![forbid(unsafe_code)]

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use ces_core::{MultiError, Phase};
use ces_kubehub::{gvk_from_api_version, gvk_key, JsonPatchClient, SchemaResolver};
use futures::future::join_all;
use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as Json};
use tracing::{debug, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum PatchError {
    #[error("invalid patch for {target}: {reason}")]
    Invalid { target: String, reason: String },
    #[error("failed to patch resources in phase {phase}: {source}")]
    Phase {
        phase: Phase,
        #[source]
        source: MultiError,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PatchOpKind {
    Add,
    Remove,
    Replace,
}

impl PatchOpKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Add => "add",
            Self::Remove => "remove",
            Self::Replace => "replace",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatchOp {
    pub op: PatchOpKind,
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Json>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRef {
    #[serde(rename = "apiVersion")]
    pub api_version: String,
    pub kind: String,
    pub name: String,
}

impl fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{} {}", self.api_version, self.kind, self.name)
    }
}

/// A set of JSON patch operations for one resource, bound to one phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatchDirective {
    pub phase: Phase,
    pub resource: ResourceRef,
    #[serde(default)]
    pub patches: Vec<PatchOp>,
}

impl PatchDirective {
    pub fn validate(&self) -> Result<(), PatchError> {
        let invalid = |reason: String| PatchError::Invalid { target: self.resource.to_string(), reason };
        if self.resource.api_version.is_empty() || self.resource.kind.is_empty() || self.resource.name.is_empty() {
            return Err(invalid("apiVersion, kind and name are required".into()));
        }
        for (i, p) in self.patches.iter().enumerate() {
            if !p.path.starts_with('/') {
                return Err(invalid(format!("patch #{i}: path {:?} must start with '/'", p.path)));
            }
            let has_value = matches!(&p.value, Some(v) if !v.is_null());
            match p.op {
                PatchOpKind::Add | PatchOpKind::Replace if !has_value => {
                    return Err(invalid(format!("patch #{i}: {} on {} needs a value", p.op.as_str(), p.path)));
                }
                PatchOpKind::Remove if p.value.is_some() => {
                    return Err(invalid(format!("patch #{i}: remove on {} must not carry a value", p.path)));
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// RFC 6902 document for the directive's operations.
    pub fn to_json_patch(&self) -> Result<json_patch::Patch, serde_json::Error> {
        let ops: Vec<Json> = self
            .patches
            .iter()
            .map(|p| {
                let mut m = Map::new();
                m.insert("op".into(), Json::String(p.op.as_str().into()));
                m.insert("path".into(), Json::String(p.path.clone()));
                if let Some(v) = &p.value {
                    m.insert("value".into(), v.clone());
                }
                Json::Object(m)
            })
            .collect();
        serde_json::from_value(Json::Array(ops))
    }
}

/// Escape one JSON pointer reference token (`~` → `~0`, `/` → `~1`).
pub fn escape_pointer_token(token: &str) -> String { token.replace('~', "~0").replace('/', "~1") }

/// Join already unescaped segments into a JSON pointer.
pub fn pointer<S: AsRef<str>>(segments: &[S]) -> String {
    segments.iter().map(|s| format!("/{}", escape_pointer_token(s.as_ref()))).collect()
}

/// Applies directives of one phase against the cluster.
#[derive(Clone)]
pub struct ResourcePatcher {
    resolver: Arc<dyn SchemaResolver>,
    client: Arc<dyn JsonPatchClient>,
    namespace: String,
}

impl ResourcePatcher {
    pub fn new(resolver: Arc<dyn SchemaResolver>, client: Arc<dyn JsonPatchClient>, namespace: impl Into<String>) -> Self {
        Self { resolver, client, namespace: namespace.into() }
    }

    pub fn namespace(&self) -> &str { &self.namespace }

    pub async fn apply(&self, phase: Phase, directives: &[PatchDirective]) -> Result<(), PatchError> {
        let selected: Vec<&PatchDirective> = directives.iter().filter(|d| d.phase == phase).collect();
        if selected.is_empty() {
            debug!(%phase, "no resource patches for phase");
            return Ok(());
        }
        let t0 = Instant::now();
        info!(%phase, count = selected.len(), "applying resource patches");
        let results = join_all(selected.iter().map(|d| self.apply_one(d))).await;
        let mut errors = MultiError::new();
        for (d, res) in selected.iter().zip(results) {
            counter!("patch_directives_total", 1u64);
            if let Err(e) = res {
                counter!("patch_failures_total", 1u64);
                warn!(%phase, target = %d.resource, error = %format!("{:#}", e), "resource patch failed");
                errors.push(e);
            }
        }
        histogram!("patch_phase_ms", t0.elapsed().as_secs_f64() * 1000.0);
        errors.into_result().map_err(|source| PatchError::Phase { phase, source })
    }

    async fn apply_one(&self, d: &PatchDirective) -> anyhow::Result<()> {
        d.validate()?;
        let patch = d.to_json_patch().with_context(|| format!("encoding patch for {}", d.resource))?;
        let gvk = gvk_from_api_version(&d.resource.api_version, &d.resource.kind);
        let kind = self.resolver.resolve(&gvk).await.with_context(|| format!("resolving {}", gvk_key(&gvk)))?;
        let ns = kind.namespaced.then_some(self.namespace.as_str());
        self.client
            .json_patch(&kind, ns, &d.resource.name, &patch)
            .await
            .with_context(|| format!("patching {}", d.resource))?;
        debug!(target = %d.resource, ops = d.patches.len(), namespaced = kind.namespaced, "resource patched");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn directive(ops: Vec<PatchOp>) -> PatchDirective {
        PatchDirective {
            phase: Phase::Dogu,
            resource: ResourceRef { api_version: "apps/v1".into(), kind: "Deployment".into(), name: "ldap".into() },
            patches: ops,
        }
    }

    fn op(kind: PatchOpKind, path: &str, value: Option<Json>) -> PatchOp { PatchOp { op: kind, path: path.into(), value } }

    #[test]
    fn pointer_escapes_tokens() {
        assert_eq!(escape_pointer_token("a/b~c"), "a~1b~0c");
        assert_eq!(pointer(&["metadata", "annotations", "ces.cloudogu.com/x"]), "/metadata/annotations/ces.cloudogu.com~1x");
        assert_eq!(pointer::<&str>(&[]), "");
    }

    #[test]
    fn value_invariants() {
        assert!(directive(vec![op(PatchOpKind::Add, "/spec/replicas", Some(json!(2)))]).validate().is_ok());
        assert!(directive(vec![op(PatchOpKind::Remove, "/spec/replicas", None)]).validate().is_ok());
        assert!(directive(vec![op(PatchOpKind::Add, "/spec/replicas", None)]).validate().is_err());
        assert!(directive(vec![op(PatchOpKind::Replace, "/spec/replicas", Some(Json::Null))]).validate().is_err());
        assert!(directive(vec![op(PatchOpKind::Remove, "/spec/replicas", Some(json!(1)))]).validate().is_err());
        assert!(directive(vec![op(PatchOpKind::Add, "spec/replicas", Some(json!(1)))]).validate().is_err());
    }

    #[test]
    fn missing_target_fields_are_rejected() {
        let mut d = directive(vec![]);
        d.resource.name.clear();
        let err = d.validate().unwrap_err();
        assert!(err.to_string().contains("required"), "{err}");
    }

    #[test]
    fn builds_rfc6902_document() {
        let d = directive(vec![
            op(PatchOpKind::Replace, "/spec/replicas", Some(json!(3))),
            op(PatchOpKind::Remove, "/metadata/labels/tmp", None),
        ]);
        let patch = d.to_json_patch().unwrap();
        assert_eq!(
            serde_json::to_value(&patch).unwrap(),
            json!([
                {"op": "replace", "path": "/spec/replicas", "value": 3},
                {"op": "remove", "path": "/metadata/labels/tmp"}
            ])
        );
    }

    #[test]
    fn directive_wire_format() {
        let d: PatchDirective = serde_json::from_value(json!({
            "phase": "loadbalancer",
            "resource": {"apiVersion": "v1", "kind": "Service", "name": "ces-loadbalancer"},
            "patches": [{"op": "add", "path": "/metadata/annotations", "value": {"a": "b"}}]
        }))
        .unwrap();
        assert_eq!(d.phase, Phase::Loadbalancer);
        assert_eq!(d.resource.api_version, "v1");
        assert_eq!(d.patches[0].op, PatchOpKind::Add);
        assert!(d.validate().is_ok());
    }
}
