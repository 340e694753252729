use std::fmt::Debug;

use futures::{stream::BoxStream, StreamExt};
use kube::{
    api::{Api, ListParams, PostParams, WatchEvent, WatchParams},
    core::ErrorResponse,
    Client, Resource, ResourceExt,
};
use serde::{de::DeserializeOwned, Serialize};
use tracing::debug;

/// Server-side watch timeout; the stream ends after it and callers reopen from the last version.
const WATCH_TIMEOUT_SECS: u32 = 290;

#[derive(Debug, thiserror::Error)]
pub enum AccessError {
    #[error("{0} not found")]
    NotFound(String),
    #[error("{0} already exists")]
    AlreadyExists(String),
    #[error("conflict on {0}: {1}")]
    Conflict(String, String),
    #[error("{what}: api error {code} ({reason}): {message}")]
    Api { what: String, code: u16, reason: String, message: String },
    #[error("{what}: {source}")]
    Kube {
        what: String,
        #[source]
        source: kube::Error,
    },
    #[error("serialization: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("{0}")]
    Other(String),
}

impl AccessError {
    /// Classify a kube error for the object described by `what`.
    pub fn from_kube(what: &str, err: kube::Error) -> Self {
        match err {
            kube::Error::Api(ErrorResponse { code: 404, .. }) => Self::NotFound(what.to_string()),
            kube::Error::Api(ErrorResponse { code: 409, reason, message, .. }) => {
                if reason == "AlreadyExists" {
                    Self::AlreadyExists(what.to_string())
                } else {
                    Self::Conflict(what.to_string(), message)
                }
            }
            kube::Error::Api(ae) => Self::Api { what: what.to_string(), code: ae.code, reason: ae.reason, message: ae.message },
            other => Self::Kube { what: what.to_string(), source: other },
        }
    }

    pub fn is_not_found(&self) -> bool { matches!(self, Self::NotFound(_)) }
    pub fn is_already_exists(&self) -> bool { matches!(self, Self::AlreadyExists(_)) }
}

/// Status payload of a watch `ERROR` event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchStatus {
    pub code: u16,
    pub reason: String,
    pub message: String,
}

impl WatchStatus {
    /// The requested start version is no longer retained by the server.
    pub fn is_expired(&self) -> bool {
        self.code == 410 || self.reason == "Expired" || self.reason == "Gone"
    }
}

impl From<ErrorResponse> for WatchStatus {
    fn from(e: ErrorResponse) -> Self { Self { code: e.code, reason: e.reason, message: e.message } }
}

#[derive(Debug, Clone)]
pub enum ResourceEvent<K> {
    Added(K),
    Modified(K),
    Deleted(K),
    /// Resume point advanced without a state change.
    Bookmark(String),
    Error(WatchStatus),
}

impl<K> From<WatchEvent<K>> for ResourceEvent<K> {
    fn from(ev: WatchEvent<K>) -> Self {
        match ev {
            WatchEvent::Added(o) => Self::Added(o),
            WatchEvent::Modified(o) => Self::Modified(o),
            WatchEvent::Deleted(o) => Self::Deleted(o),
            WatchEvent::Bookmark(b) => Self::Bookmark(b.metadata.resource_version),
            WatchEvent::Error(e) => Self::Error(e.into()),
        }
    }
}

pub type EventStream<K> = BoxStream<'static, Result<ResourceEvent<K>, AccessError>>;

#[derive(Debug, Clone)]
pub struct ListSnapshot<K> {
    pub items: Vec<K>,
    pub resource_version: String,
}

/// get/list/watch/create/update for one resource kind in one scope.
#[async_trait::async_trait]
pub trait ResourceAccessor<K>: Send + Sync
where
    K: Send + Sync + 'static,
{
    async fn get(&self, name: &str) -> Result<K, AccessError>;
    async fn list(&self, label_selector: &str) -> Result<ListSnapshot<K>, AccessError>;
    /// Watch objects matching `label_selector` starting after `resource_version`, bookmarks enabled.
    async fn watch(&self, label_selector: &str, resource_version: &str) -> Result<EventStream<K>, AccessError>;
    async fn create(&self, obj: &K) -> Result<K, AccessError>;
    async fn update(&self, obj: &K) -> Result<K, AccessError>;
}

#[async_trait::async_trait]
impl<K, A> ResourceAccessor<K> for std::sync::Arc<A>
where
    K: Send + Sync + 'static,
    A: ResourceAccessor<K> + ?Sized,
{
    async fn get(&self, name: &str) -> Result<K, AccessError> { (**self).get(name).await }

    async fn list(&self, label_selector: &str) -> Result<ListSnapshot<K>, AccessError> { (**self).list(label_selector).await }

    async fn watch(&self, label_selector: &str, resource_version: &str) -> Result<EventStream<K>, AccessError> {
        (**self).watch(label_selector, resource_version).await
    }

    async fn create(&self, obj: &K) -> Result<K, AccessError> { (**self).create(obj).await }

    async fn update(&self, obj: &K) -> Result<K, AccessError> { (**self).update(obj).await }
}

pub struct KubeAccessor<K> {
    api: Api<K>,
}

impl<K> KubeAccessor<K>
where
    K: Resource<DynamicType = ()>,
{
    pub fn namespaced(client: Client, namespace: &str) -> Self
    where
        K: Resource<Scope = k8s_openapi::NamespaceResourceScope>,
    {
        Self { api: Api::namespaced(client, namespace) }
    }

    pub fn cluster(client: Client) -> Self
    where
        K: Resource<Scope = k8s_openapi::ClusterResourceScope>,
    {
        Self { api: Api::all(client) }
    }
}

fn describe<K: Resource<DynamicType = ()>>(name: &str) -> String {
    format!("{} {}", K::kind(&()), name)
}

#[async_trait::async_trait]
impl<K> ResourceAccessor<K> for KubeAccessor<K>
where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Serialize + Debug + Send + Sync + 'static,
{
    async fn get(&self, name: &str) -> Result<K, AccessError> {
        self.api.get(name).await.map_err(|e| AccessError::from_kube(&describe::<K>(name), e))
    }

    async fn list(&self, label_selector: &str) -> Result<ListSnapshot<K>, AccessError> {
        let lp = ListParams::default().labels(label_selector);
        let list = self
            .api
            .list(&lp)
            .await
            .map_err(|e| AccessError::from_kube(&describe::<K>(label_selector), e))?;
        Ok(ListSnapshot { resource_version: list.metadata.resource_version.unwrap_or_default(), items: list.items })
    }

    async fn watch(&self, label_selector: &str, resource_version: &str) -> Result<EventStream<K>, AccessError> {
        let mut wp = WatchParams::default().labels(label_selector).timeout(WATCH_TIMEOUT_SECS);
        wp.bookmarks = true;
        debug!(kind = %K::kind(&()), selector = %label_selector, rv = %resource_version, "opening watch");
        let what = describe::<K>(label_selector);
        let stream = self
            .api
            .watch(&wp, resource_version)
            .await
            .map_err(|e| AccessError::from_kube(&what, e))?;
        Ok(stream
            .map(move |item| item.map(ResourceEvent::from).map_err(|e| AccessError::from_kube(&what, e)))
            .boxed())
    }

    async fn create(&self, obj: &K) -> Result<K, AccessError> {
        let name = obj.name_any();
        self.api
            .create(&PostParams::default(), obj)
            .await
            .map_err(|e| AccessError::from_kube(&describe::<K>(&name), e))
    }

    async fn update(&self, obj: &K) -> Result<K, AccessError> {
        let name = obj.name_any();
        self.api
            .replace(&name, &PostParams::default(), obj)
            .await
            .map_err(|e| AccessError::from_kube(&describe::<K>(&name), e))
    }
}
