use std::time::Duration;

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key).ok().and_then(|s| s.parse::<T>().ok()).unwrap_or(default)
}

/// Timing knobs for readiness waits. Built once by the caller and threaded into the watcher.
#[derive(Debug, Clone, PartialEq)]
pub struct ReadyConfig {
    /// Upper bound for a whole wait, initial read and watch included.
    pub timeout: Duration,
    pub initial_backoff: Duration,
    pub backoff_factor: f64,
    pub max_backoff: Duration,
    /// Reads attempted while a named resource is not found, the first one included.
    pub max_read_attempts: u32,
    /// Pause before reopening a broken watch.
    pub watch_retry_interval: Duration,
}

impl Default for ReadyConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(900),
            initial_backoff: Duration::from_millis(500),
            backoff_factor: 2.0,
            max_backoff: Duration::from_secs(10),
            max_read_attempts: 10,
            watch_retry_interval: Duration::from_secs(2),
        }
    }
}

impl ReadyConfig {
    /// Defaults overridden by `CES_WAIT_*` environment variables.
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            timeout: Duration::from_secs(env_or("CES_WAIT_TIMEOUT_SECS", d.timeout.as_secs())),
            initial_backoff: Duration::from_millis(env_or("CES_WAIT_BACKOFF_INITIAL_MS", d.initial_backoff.as_millis() as u64)),
            backoff_factor: env_or("CES_WAIT_BACKOFF_FACTOR", d.backoff_factor).max(1.0),
            max_backoff: Duration::from_millis(env_or("CES_WAIT_BACKOFF_MAX_MS", d.max_backoff.as_millis() as u64)),
            max_read_attempts: env_or("CES_WAIT_READ_ATTEMPTS", d.max_read_attempts).max(1),
            watch_retry_interval: Duration::from_millis(env_or("CES_WAIT_RETRY_MS", d.watch_retry_interval.as_millis() as u64)),
        }
    }

    /// Delay after the `attempt`-th failed read (1-based), capped at `max_backoff`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        if self.initial_backoff.is_zero() {
            return Duration::ZERO;
        }
        let exp = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let secs = self.initial_backoff.as_secs_f64() * self.backoff_factor.max(1.0).powi(exp);
        Duration::from_secs_f64(secs.min(self.max_backoff.as_secs_f64()))
    }
}
