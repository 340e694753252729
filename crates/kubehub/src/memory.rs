use std::collections::{BTreeMap, VecDeque};
use std::sync::Mutex;

use futures::{stream, StreamExt};
use kube::core::{ApiResource, GroupVersionKind};
use kube::{Resource, ResourceExt};

use crate::accessor::{AccessError, EventStream, ListSnapshot, ResourceAccessor, ResourceEvent};
use crate::{gvk_key, JsonPatchClient, ResolvedKind, SchemaResolver};

type WatchSession<K> = Vec<Result<ResourceEvent<K>, AccessError>>;

/// In-memory accessor for tests and offline planning.
///
/// Objects are keyed by name. Watch calls replay scripted sessions in order;
/// once the script is exhausted a watch stays open without events.
pub struct MemoryAccessor<K> {
    inner: Mutex<Inner<K>>,
}

struct Inner<K> {
    objects: BTreeMap<String, K>,
    get_errors: VecDeque<AccessError>,
    sessions: VecDeque<WatchSession<K>>,
    watch_calls: Vec<(String, String)>,
    get_calls: usize,
    created: Vec<K>,
    updated: Vec<K>,
    revision: u64,
}

impl<K> Default for MemoryAccessor<K> {
    fn default() -> Self {
        Self {
            inner: Mutex::new(Inner {
                objects: BTreeMap::new(),
                get_errors: VecDeque::new(),
                sessions: VecDeque::new(),
                watch_calls: Vec::new(),
                get_calls: 0,
                created: Vec::new(),
                updated: Vec::new(),
                revision: 0,
            }),
        }
    }
}

fn selector_matches(selector: &str, labels: &BTreeMap<String, String>) -> bool {
    selector
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .all(|term| match term.split_once('=') {
            Some((k, v)) => labels.get(k).map(|x| x == v).unwrap_or(false),
            None => labels.contains_key(term),
        })
}

impl<K> MemoryAccessor<K>
where
    K: Resource + Clone,
{
    pub fn new() -> Self { Self::default() }

    pub fn with_objects(objects: impl IntoIterator<Item = K>) -> Self {
        let me = Self::default();
        for o in objects {
            me.insert(o);
        }
        me
    }

    pub fn insert(&self, obj: K) {
        let mut inner = self.inner.lock().unwrap();
        inner.revision += 1;
        inner.objects.insert(obj.name_any(), obj);
    }

    /// The next `get`/`list` calls fail with these errors, in order.
    pub fn fail_next_get(&self, err: AccessError) { self.inner.lock().unwrap().get_errors.push_back(err); }

    /// Script the events delivered by the next unscripted `watch` call.
    pub fn push_watch(&self, events: WatchSession<K>) { self.inner.lock().unwrap().sessions.push_back(events); }

    /// `(label_selector, resource_version)` of every watch opened so far.
    pub fn watch_calls(&self) -> Vec<(String, String)> { self.inner.lock().unwrap().watch_calls.clone() }

    pub fn get_calls(&self) -> usize { self.inner.lock().unwrap().get_calls }

    pub fn created(&self) -> Vec<K> { self.inner.lock().unwrap().created.clone() }

    pub fn updated(&self) -> Vec<K> { self.inner.lock().unwrap().updated.clone() }

    pub fn object(&self, name: &str) -> Option<K> { self.inner.lock().unwrap().objects.get(name).cloned() }
}

#[async_trait::async_trait]
impl<K> ResourceAccessor<K> for MemoryAccessor<K>
where
    K: Resource + Clone + Send + Sync + 'static,
{
    async fn get(&self, name: &str) -> Result<K, AccessError> {
        let mut inner = self.inner.lock().unwrap();
        inner.get_calls += 1;
        if let Some(err) = inner.get_errors.pop_front() {
            return Err(err);
        }
        inner.objects.get(name).cloned().ok_or_else(|| AccessError::NotFound(name.to_string()))
    }

    async fn list(&self, label_selector: &str) -> Result<ListSnapshot<K>, AccessError> {
        let mut inner = self.inner.lock().unwrap();
        inner.get_calls += 1;
        if let Some(err) = inner.get_errors.pop_front() {
            return Err(err);
        }
        let items = inner.objects.values().filter(|o| selector_matches(label_selector, o.labels())).cloned().collect();
        Ok(ListSnapshot { items, resource_version: inner.revision.to_string() })
    }

    async fn watch(&self, label_selector: &str, resource_version: &str) -> Result<EventStream<K>, AccessError> {
        let mut inner = self.inner.lock().unwrap();
        inner.watch_calls.push((label_selector.to_string(), resource_version.to_string()));
        match inner.sessions.pop_front() {
            Some(events) => Ok(stream::iter(events).boxed()),
            None => Ok(stream::pending().boxed()),
        }
    }

    async fn create(&self, obj: &K) -> Result<K, AccessError> {
        let mut inner = self.inner.lock().unwrap();
        let name = obj.name_any();
        if inner.objects.contains_key(&name) {
            return Err(AccessError::AlreadyExists(name));
        }
        inner.revision += 1;
        let mut stored = obj.clone();
        stored.meta_mut().resource_version = Some(inner.revision.to_string());
        inner.objects.insert(name, stored.clone());
        inner.created.push(stored.clone());
        Ok(stored)
    }

    async fn update(&self, obj: &K) -> Result<K, AccessError> {
        let mut inner = self.inner.lock().unwrap();
        let name = obj.name_any();
        let Some(current) = inner.objects.get(&name) else { return Err(AccessError::NotFound(name)) };
        if let (Some(sent), Some(held)) = (obj.resource_version(), current.resource_version()) {
            if sent != held {
                return Err(AccessError::Conflict(name, format!("resource version {} is stale, current is {}", sent, held)));
            }
        }
        inner.revision += 1;
        let mut stored = obj.clone();
        stored.meta_mut().resource_version = Some(inner.revision.to_string());
        inner.objects.insert(name, stored.clone());
        inner.updated.push(stored.clone());
        Ok(stored)
    }
}

/// One recorded JSON patch request.
#[derive(Debug, Clone, PartialEq)]
pub struct PatchCall {
    pub kind: String,
    pub namespace: Option<String>,
    pub name: String,
    pub patch: serde_json::Value,
}

/// In-memory schema resolver and patch client.
///
/// Only registered kinds resolve. Patches are recorded, not applied.
#[derive(Default)]
pub struct MemoryHub {
    kinds: Mutex<BTreeMap<String, bool>>,
    calls: Mutex<Vec<PatchCall>>,
    failing: Mutex<Vec<String>>,
}

impl MemoryHub {
    pub fn new() -> Self { Self::default() }

    pub fn register(&self, api_version: &str, kind: &str, namespaced: bool) {
        self.kinds.lock().unwrap().insert(gvk_key(&crate::gvk_from_api_version(api_version, kind)), namespaced);
    }

    /// Patches against `name` fail with not found.
    pub fn fail_patch(&self, name: &str) { self.failing.lock().unwrap().push(name.to_string()); }

    pub fn calls(&self) -> Vec<PatchCall> { self.calls.lock().unwrap().clone() }
}

#[async_trait::async_trait]
impl SchemaResolver for MemoryHub {
    async fn resolve(&self, gvk: &GroupVersionKind) -> Result<ResolvedKind, AccessError> {
        let key = gvk_key(gvk);
        match self.kinds.lock().unwrap().get(&key) {
            Some(&namespaced) => Ok(ResolvedKind { resource: ApiResource::from_gvk(gvk), namespaced }),
            None => Err(AccessError::NotFound(format!("resource type {}", key))),
        }
    }
}

#[async_trait::async_trait]
impl JsonPatchClient for MemoryHub {
    async fn json_patch(
        &self,
        kind: &ResolvedKind,
        namespace: Option<&str>,
        name: &str,
        patch: &json_patch::Patch,
    ) -> Result<(), AccessError> {
        self.calls.lock().unwrap().push(PatchCall {
            kind: kind.resource.kind.clone(),
            namespace: namespace.map(str::to_string),
            name: name.to_string(),
            patch: serde_json::to_value(patch)?,
        });
        if self.failing.lock().unwrap().iter().any(|n| n == name) {
            return Err(AccessError::NotFound(format!("{} {}", kind.resource.kind, name)));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::ConfigMap;
    use kube::api::ObjectMeta;

    fn cm(name: &str, labels: &[(&str, &str)]) -> ConfigMap {
        ConfigMap {
            metadata: ObjectMeta {
                name: Some(name.into()),
                labels: Some(labels.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn list_filters_by_equality_selector() {
        let mem = MemoryAccessor::with_objects([cm("a", &[("dogu.name", "ldap")]), cm("b", &[("dogu.name", "cas")])]);
        let snap = mem.list("dogu.name=ldap").await.unwrap();
        assert_eq!(snap.items.len(), 1);
        assert_eq!(snap.items[0].name_any(), "a");
        assert_eq!(mem.list("").await.unwrap().items.len(), 2);
    }

    #[tokio::test]
    async fn create_then_update() {
        let mem = MemoryAccessor::<ConfigMap>::new();
        mem.create(&cm("x", &[])).await.unwrap();
        assert!(mem.create(&cm("x", &[])).await.unwrap_err().is_already_exists());
        assert!(mem.update(&cm("y", &[])).await.unwrap_err().is_not_found());
        mem.update(&cm("x", &[("k", "v")])).await.unwrap();
        assert_eq!(mem.updated().len(), 1);
        assert_eq!(mem.object("x").unwrap().labels().get("k").map(String::as_str), Some("v"));
    }

    #[tokio::test]
    async fn update_with_stale_version_conflicts() {
        let mem = MemoryAccessor::<ConfigMap>::new();
        let first = mem.create(&cm("x", &[])).await.unwrap();
        let second = mem.get("x").await.unwrap();
        mem.update(&first).await.unwrap();
        let err = mem.update(&second).await.unwrap_err();
        assert!(matches!(err, AccessError::Conflict(ref n, _) if n == "x"), "{err}");
    }

    #[tokio::test]
    async fn hub_resolves_registered_kinds_only() {
        let hub = MemoryHub::new();
        hub.register("apps/v1", "Deployment", true);
        let gvk = crate::gvk_from_api_version("apps/v1", "Deployment");
        let kind = hub.resolve(&gvk).await.unwrap();
        assert!(kind.namespaced);
        assert_eq!(kind.resource.plural, "deployments");
        assert!(hub.resolve(&crate::gvk_from_api_version("v1", "Widget")).await.unwrap_err().is_not_found());
    }
}
