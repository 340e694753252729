//! CES executor: runs registered setup steps one after another.

#![forbid(unsafe_code)]

use std::time::Instant;

use metrics::{counter, histogram};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, Instrument};

/// A unit of setup work.
#[async_trait::async_trait]
pub trait Step: Send + Sync {
    /// Human readable, shown when the step fails.
    fn description(&self) -> String;

    async fn perform(&self, cancel: &CancellationToken) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutorState {
    Idle,
    Running,
    Completed,
    Failed,
}

#[derive(Debug, thiserror::Error)]
#[error("failed during step '{description}': {source:#}")]
pub struct StepFailed {
    /// Zero-based position of the step in registration order.
    pub index: usize,
    pub description: String,
    #[source]
    pub source: anyhow::Error,
}

#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error(transparent)]
    Step(#[from] StepFailed),
    #[error("executor already ran (state {0:?})")]
    AlreadyRan(ExecutorState),
}

impl ExecutorError {
    /// Description of the failed step, if a step failed.
    pub fn failed_step(&self) -> Option<&str> {
        match self {
            Self::Step(s) => Some(&s.description),
            Self::AlreadyRan(_) => None,
        }
    }
}

/// Ordered list of steps. Stops at the first failure; never retries.
pub struct Executor {
    steps: Vec<Box<dyn Step>>,
    state: ExecutorState,
}

impl Default for Executor {
    fn default() -> Self { Self::new() }
}

impl Executor {
    pub fn new() -> Self { Self { steps: Vec::new(), state: ExecutorState::Idle } }

    pub fn register(&mut self, step: Box<dyn Step>) { self.steps.push(step); }

    pub fn register_all(&mut self, steps: impl IntoIterator<Item = Box<dyn Step>>) { self.steps.extend(steps); }

    pub fn len(&self) -> usize { self.steps.len() }
    pub fn is_empty(&self) -> bool { self.steps.is_empty() }
    pub fn state(&self) -> ExecutorState { self.state }

    pub fn descriptions(&self) -> Vec<String> { self.steps.iter().map(|s| s.description()).collect() }

    pub async fn run(&mut self, cancel: &CancellationToken) -> Result<(), ExecutorError> {
        if self.state != ExecutorState::Idle {
            return Err(ExecutorError::AlreadyRan(self.state));
        }
        self.state = ExecutorState::Running;
        let total = self.steps.len();
        let t0 = Instant::now();
        info!(steps = total, "setup run starting");
        for (index, step) in self.steps.iter().enumerate() {
            let description = step.description();
            let span = info_span!("step", index, step = %description);
            let started = Instant::now();
            let res = async {
                if cancel.is_cancelled() {
                    return Err(anyhow::anyhow!("setup cancelled before step started"));
                }
                info!("step started");
                step.perform(cancel).await
            }
            .instrument(span.clone())
            .await;
            counter!("setup_steps_total", 1u64);
            histogram!("setup_step_ms", started.elapsed().as_secs_f64() * 1000.0);
            if let Err(source) = res {
                counter!("setup_step_failures_total", 1u64);
                span.in_scope(|| error!(error = %format!("{:#}", source), "step failed"));
                self.state = ExecutorState::Failed;
                return Err(StepFailed { index, description, source }.into());
            }
            span.in_scope(|| info!(took_ms = %started.elapsed().as_millis(), "step done"));
        }
        self.state = ExecutorState::Completed;
        info!(steps = total, took_ms = %t0.elapsed().as_millis(), "setup run completed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    struct Recorded {
        name: &'static str,
        fail: bool,
        log: Arc<Mutex<Vec<&'static str>>>,
    }

    #[async_trait::async_trait]
    impl Step for Recorded {
        fn description(&self) -> String { format!("step {}", self.name) }

        async fn perform(&self, _cancel: &CancellationToken) -> anyhow::Result<()> {
            self.log.lock().unwrap().push(self.name);
            if self.fail {
                anyhow::bail!("{} exploded", self.name);
            }
            Ok(())
        }
    }

    fn executor(script: &[(&'static str, bool)]) -> (Executor, Arc<Mutex<Vec<&'static str>>>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut ex = Executor::new();
        for (name, fail) in script {
            ex.register(Box::new(Recorded { name, fail: *fail, log: log.clone() }));
        }
        (ex, log)
    }

    #[tokio::test]
    async fn short_circuits_on_first_failure() {
        let (mut ex, log) = executor(&[("A", false), ("B", true), ("C", false)]);
        let err = ex.run(&CancellationToken::new()).await.unwrap_err();
        assert_eq!(*log.lock().unwrap(), vec!["A", "B"]);
        assert_eq!(err.failed_step(), Some("step B"));
        assert_eq!(err.to_string(), "failed during step 'step B': B exploded");
        assert!(matches!(err, ExecutorError::Step(StepFailed { index: 1, .. })));
        assert_eq!(ex.state(), ExecutorState::Failed);
    }

    #[tokio::test]
    async fn runs_all_in_registration_order() {
        let (mut ex, log) = executor(&[("A", false), ("B", false), ("C", false)]);
        assert_eq!(ex.state(), ExecutorState::Idle);
        assert_eq!(ex.descriptions(), vec!["step A", "step B", "step C"]);
        ex.run(&CancellationToken::new()).await.unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["A", "B", "C"]);
        assert_eq!(ex.state(), ExecutorState::Completed);
    }

    #[tokio::test]
    async fn refuses_a_second_run() {
        let (mut ex, log) = executor(&[("A", false)]);
        ex.run(&CancellationToken::new()).await.unwrap();
        assert!(matches!(ex.run(&CancellationToken::new()).await, Err(ExecutorError::AlreadyRan(ExecutorState::Completed))));
        assert_eq!(log.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn cancelled_token_stops_before_next_step() {
        let (mut ex, log) = executor(&[("A", false), ("B", false)]);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = ex.run(&cancel).await.unwrap_err();
        assert!(log.lock().unwrap().is_empty());
        assert_eq!(err.failed_step(), Some("step A"));
        assert!(err.to_string().contains("cancelled"));
    }

    #[tokio::test]
    async fn empty_executor_completes() {
        let mut ex = Executor::default();
        assert!(ex.is_empty());
        ex.run(&CancellationToken::new()).await.unwrap();
        assert_eq!(ex.state(), ExecutorState::Completed);
    }
}
