use std::collections::BTreeMap;

use ces_core::{ParseError, RunState};
use k8s_openapi::api::core::v1::ConfigMap;
use kube::api::ObjectMeta;
use tracing::info;

use crate::accessor::{AccessError, ResourceAccessor};
use crate::crd::{APP_LABEL, APP_LABEL_VALUE};

pub const SETUP_STATE_CONFIG_MAP: &str = "k8s-setup-config";
pub const STATE_KEY: &str = "state";
const STATE_CHANGED_ANNOTATION: &str = "ces.cloudogu.com/state-changed-at";

#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("reading setup state: {0}")]
    Read(#[source] AccessError),
    #[error("writing setup state {state}: {source}")]
    Write {
        state: RunState,
        #[source]
        source: AccessError,
    },
    #[error("setup state config map holds an invalid value: {0}")]
    Invalid(#[from] ParseError),
    /// Another run owns the setup; `found` is its state when it was visible.
    #[error("setup state is held by another run ({})", .found.map(|s| s.as_str()).unwrap_or("concurrent write"))]
    Taken { found: Option<RunState> },
}

/// Durable installing/installed marker kept in the setup config map.
pub struct RunStateStore<A> {
    accessor: A,
}

impl<A> RunStateStore<A>
where
    A: ResourceAccessor<ConfigMap>,
{
    pub fn new(accessor: A) -> Self { Self { accessor } }

    async fn read(&self) -> Result<Option<ConfigMap>, StateError> {
        match self.accessor.get(SETUP_STATE_CONFIG_MAP).await {
            Ok(cm) => Ok(Some(cm)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(StateError::Read(e)),
        }
    }

    /// `None` when the config map or the key does not exist yet.
    pub async fn get(&self) -> Result<Option<RunState>, StateError> {
        match self.read().await? {
            Some(cm) => state_of(&cm),
            None => Ok(None),
        }
    }

    pub async fn set(&self, state: RunState) -> Result<(), StateError> {
        let current = self.read().await?;
        self.write(current, state).await.map_err(|source| StateError::Write { state, source })
    }

    /// Moves from no state to `installing` as a compare-and-set.
    ///
    /// The write carries the resource version of the read, so a run that
    /// claimed the setup in between makes this fail with [`StateError::Taken`].
    pub async fn claim(&self) -> Result<(), StateError> {
        let current = self.read().await?;
        if let Some(found) = current.as_ref().map(state_of).transpose()?.flatten() {
            return Err(StateError::Taken { found: Some(found) });
        }
        match self.write(current, RunState::Installing).await {
            Ok(()) => Ok(()),
            Err(AccessError::Conflict(..)) | Err(AccessError::AlreadyExists(_)) => Err(StateError::Taken { found: None }),
            Err(source) => Err(StateError::Write { state: RunState::Installing, source }),
        }
    }

    /// Updates `current` in place (keeping its resource version) or creates the map.
    async fn write(&self, current: Option<ConfigMap>, state: RunState) -> Result<(), AccessError> {
        let now = chrono::Utc::now().to_rfc3339();
        match current {
            Some(mut cm) => {
                cm.data.get_or_insert_with(BTreeMap::new).insert(STATE_KEY.to_string(), state.to_string());
                cm.metadata.annotations.get_or_insert_with(BTreeMap::new).insert(STATE_CHANGED_ANNOTATION.to_string(), now);
                self.accessor.update(&cm).await?;
            }
            None => {
                let cm = ConfigMap {
                    metadata: ObjectMeta {
                        name: Some(SETUP_STATE_CONFIG_MAP.to_string()),
                        labels: Some(BTreeMap::from([(APP_LABEL.to_string(), APP_LABEL_VALUE.to_string())])),
                        annotations: Some(BTreeMap::from([(STATE_CHANGED_ANNOTATION.to_string(), now)])),
                        ..Default::default()
                    },
                    data: Some(BTreeMap::from([(STATE_KEY.to_string(), state.to_string())])),
                    ..Default::default()
                };
                self.accessor.create(&cm).await?;
            }
        }
        info!(state = %state, "setup state written");
        Ok(())
    }
}

fn state_of(cm: &ConfigMap) -> Result<Option<RunState>, StateError> {
    match cm.data.as_ref().and_then(|d| d.get(STATE_KEY)) {
        Some(v) if !v.is_empty() => Ok(Some(v.parse()?)),
        _ => Ok(None),
    }
}
