//! CES ready: block until a cluster resource reaches a target state.
//!
//! A wait is an explicit state machine: an initial read (retried while a named
//! resource is not visible yet), then a watch resumed from the last seen
//! resource version until the predicate is satisfied, a terminal condition is
//! hit, the timeout elapses or the caller cancels.

#![forbid(unsafe_code)]

use std::fmt;
use std::time::Duration;

use ces_kubehub::{AccessError, ResourceAccessor, ResourceEvent};
use futures::StreamExt;
use kube::{Resource, ResourceExt};
use metrics::counter;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

mod config;
pub mod predicates;

pub use config::ReadyConfig;

/// Outcome of evaluating a readiness predicate against one object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
    Ready,
    Pending,
    /// The resource will never become ready; stop waiting.
    Failed(String),
}

/// What to wait for: an object by name, or any object matching a label selector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WaitTarget {
    pub name: Option<String>,
    /// Single equality selector `key=value`; also scopes the watch.
    pub label_selector: String,
}

impl WaitTarget {
    pub fn named(name: &str, label_key: &str) -> Self {
        Self { name: Some(name.to_string()), label_selector: format!("{}={}", label_key, name) }
    }

    pub fn labeled(label_key: &str, value: &str) -> Self {
        Self { name: None, label_selector: format!("{}={}", label_key, value) }
    }
}

impl fmt::Display for WaitTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(n) => write!(f, "{} ({})", n, self.label_selector),
            None => f.write_str(&self.label_selector),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ReadyError {
    #[error("timed out after {after:?} waiting for {target}")]
    Timeout { target: String, after: Duration },
    #[error("wait for {target} was cancelled")]
    Cancelled { target: String },
    #[error("{target} did not appear after {attempts} reads")]
    NotFound { target: String, attempts: u32 },
    #[error("reading {target}: {source}")]
    Read {
        target: String,
        #[source]
        source: AccessError,
    },
    #[error("{target} was deleted while waiting for it")]
    Deleted { target: String },
    #[error("watch on {target} expired: {message}")]
    Expired { target: String, message: String },
    #[error("{target} failed: {reason}")]
    Failed { target: String, reason: String },
}

enum WaitState {
    InitialRead { attempt: u32 },
    Watching { version: String },
    DoneOk,
    DoneFatal(ReadyError),
}

/// Blocks until a resource satisfies a predicate. Holds no state between waits.
#[derive(Debug, Clone, Default)]
pub struct ReadyWatcher {
    cfg: ReadyConfig,
}

impl ReadyWatcher {
    pub fn new(cfg: ReadyConfig) -> Self { Self { cfg } }

    pub fn config(&self) -> &ReadyConfig { &self.cfg }

    /// Wait until `predicate` reports [`Readiness::Ready`] for `target`.
    ///
    /// `timeout` overrides the configured default for this call.
    pub async fn wait_until_ready<K, A, P>(
        &self,
        cancel: &CancellationToken,
        accessor: &A,
        target: &WaitTarget,
        predicate: P,
        timeout: Option<Duration>,
    ) -> Result<(), ReadyError>
    where
        K: Resource + Send + Sync + 'static,
        A: ResourceAccessor<K> + ?Sized,
        P: Fn(&K) -> Readiness + Send + Sync,
    {
        let after = timeout.unwrap_or(self.cfg.timeout);
        info!(target = %target, timeout_s = after.as_secs(), "waiting for readiness");
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ReadyError::Cancelled { target: target.to_string() }),
            res = tokio::time::timeout(after, self.drive(accessor, target, &predicate)) => match res {
                Ok(r) => r,
                Err(_) => Err(ReadyError::Timeout { target: target.to_string(), after }),
            },
        }
    }

    async fn drive<K, A, P>(&self, accessor: &A, target: &WaitTarget, predicate: &P) -> Result<(), ReadyError>
    where
        K: Resource + Send + Sync + 'static,
        A: ResourceAccessor<K> + ?Sized,
        P: Fn(&K) -> Readiness + Send + Sync,
    {
        let mut state = WaitState::InitialRead { attempt: 1 };
        loop {
            state = match state {
                WaitState::InitialRead { attempt } => self.initial_read(accessor, target, predicate, attempt).await,
                WaitState::Watching { version } => self.watch_once(accessor, target, predicate, version).await,
                WaitState::DoneOk => {
                    info!(target = %target, "resource ready");
                    return Ok(());
                }
                WaitState::DoneFatal(e) => return Err(e),
            };
        }
    }

    async fn initial_read<K, A, P>(&self, accessor: &A, target: &WaitTarget, predicate: &P, attempt: u32) -> WaitState
    where
        K: Resource + Send + Sync + 'static,
        A: ResourceAccessor<K> + ?Sized,
        P: Fn(&K) -> Readiness + Send + Sync,
    {
        let read = match &target.name {
            Some(name) => accessor.get(name).await.map(|o| {
                let version = o.resource_version().unwrap_or_default();
                (vec![o], version)
            }),
            // An empty list is pending: matching objects show up as `Added` on the watch.
            None => accessor.list(&target.label_selector).await.map(|snap| (snap.items, snap.resource_version)),
        };
        match read {
            Ok((items, version)) => match evaluate(&items, predicate) {
                Readiness::Ready => WaitState::DoneOk,
                Readiness::Failed(reason) => WaitState::DoneFatal(ReadyError::Failed { target: target.to_string(), reason }),
                Readiness::Pending => {
                    debug!(target = %target, rv = %version, "not ready yet; watching");
                    WaitState::Watching { version }
                }
            },
            Err(e) if e.is_not_found() => {
                if attempt >= self.cfg.max_read_attempts {
                    return WaitState::DoneFatal(ReadyError::NotFound { target: target.to_string(), attempts: attempt });
                }
                let delay = self.cfg.backoff(attempt);
                debug!(target = %target, attempt, delay_ms = %delay.as_millis(), "not visible yet; retrying read");
                tokio::time::sleep(delay).await;
                WaitState::InitialRead { attempt: attempt + 1 }
            }
            Err(source) => WaitState::DoneFatal(ReadyError::Read { target: target.to_string(), source }),
        }
    }

    /// Consume one watch connection. Returns the next state; a recoverable break
    /// comes back as `Watching` with the last known version.
    async fn watch_once<K, A, P>(&self, accessor: &A, target: &WaitTarget, predicate: &P, mut version: String) -> WaitState
    where
        K: Resource + Send + Sync + 'static,
        A: ResourceAccessor<K> + ?Sized,
        P: Fn(&K) -> Readiness + Send + Sync,
    {
        let mut stream = match accessor.watch(&target.label_selector, &version).await {
            Ok(s) => s,
            Err(e) => {
                warn!(target = %target, error = %e, "opening watch failed; retrying");
                tokio::time::sleep(self.cfg.watch_retry_interval).await;
                return WaitState::Watching { version };
            }
        };
        counter!("ready_watch_opened_total", 1u64);
        while let Some(item) = stream.next().await {
            match item {
                Ok(ResourceEvent::Added(o)) | Ok(ResourceEvent::Modified(o)) => {
                    if !is_target(target, &o) {
                        continue;
                    }
                    if let Some(rv) = o.resource_version() {
                        version = rv;
                    }
                    match predicate(&o) {
                        Readiness::Ready => return WaitState::DoneOk,
                        Readiness::Failed(reason) => {
                            return WaitState::DoneFatal(ReadyError::Failed { target: target.to_string(), reason })
                        }
                        Readiness::Pending => debug!(target = %target, rv = %version, "still not ready"),
                    }
                }
                Ok(ResourceEvent::Deleted(o)) => {
                    if is_target(target, &o) {
                        return WaitState::DoneFatal(ReadyError::Deleted { target: target.to_string() });
                    }
                }
                Ok(ResourceEvent::Bookmark(rv)) => version = rv,
                Ok(ResourceEvent::Error(status)) if status.is_expired() => {
                    return WaitState::DoneFatal(ReadyError::Expired { target: target.to_string(), message: status.message });
                }
                Ok(ResourceEvent::Error(status)) => {
                    warn!(target = %target, code = status.code, reason = %status.reason, message = %status.message, "watch broken; reconnecting");
                    break;
                }
                Err(e) => {
                    warn!(target = %target, error = %e, "watch stream error; reconnecting");
                    break;
                }
            }
        }
        drop(stream);
        counter!("ready_watch_restarts_total", 1u64);
        tokio::time::sleep(self.cfg.watch_retry_interval).await;
        WaitState::Watching { version }
    }
}

fn is_target<K: Resource>(target: &WaitTarget, obj: &K) -> bool {
    match &target.name {
        Some(n) => obj.name_any() == *n,
        None => true,
    }
}

/// Any ready object satisfies the wait; otherwise the first failure is fatal.
fn evaluate<K, P>(items: &[K], predicate: &P) -> Readiness
where
    P: Fn(&K) -> Readiness,
{
    let mut failed = None;
    for item in items {
        match predicate(item) {
            Readiness::Ready => return Readiness::Ready,
            Readiness::Failed(r) => {
                failed.get_or_insert(r);
            }
            Readiness::Pending => {}
        }
    }
    failed.map(Readiness::Failed).unwrap_or(Readiness::Pending)
}
