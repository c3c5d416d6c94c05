//! Engine and worker configuration
//!
//! Defaults match the documented settings; every knob can come from the
//! environment (`STEPFLOW_*`) or be set through the builder methods.

use std::time::Duration;

use tracing::warn;

/// Engine-level settings.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// How long an idempotency key maps a start request to its execution
    pub idempotency_ttl: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            idempotency_ttl: Duration::from_secs(24 * 60 * 60),
        }
    }
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_idempotency_ttl(mut self, ttl: Duration) -> Self {
        self.idempotency_ttl = ttl;
        self
    }

    /// Read settings from the environment, falling back to defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(hours) = env_parse::<u64>("STEPFLOW_IDEMPOTENCY_TTL_HOURS") {
            config.idempotency_ttl = Duration::from_secs(hours * 60 * 60);
        }
        config
    }
}

/// Worker loop settings.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Claim limit per dispatch poll
    pub batch_size: i64,
    /// Dispatch loop interval
    pub poll_interval: Duration,
    /// Wake loop interval
    pub wake_interval: Duration,
    /// Reap loop interval
    pub reap_interval: Duration,
    /// How long a running step may go without finishing before it is reaped
    pub stuck_step_timeout: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            poll_interval: Duration::from_millis(1000),
            wake_interval: Duration::from_millis(10_000),
            reap_interval: Duration::from_millis(300_000),
            stuck_step_timeout: Duration::from_secs(30 * 60),
        }
    }
}

impl WorkerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_batch_size(mut self, size: i64) -> Self {
        self.batch_size = size.max(1);
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_wake_interval(mut self, interval: Duration) -> Self {
        self.wake_interval = interval;
        self
    }

    pub fn with_reap_interval(mut self, interval: Duration) -> Self {
        self.reap_interval = interval;
        self
    }

    pub fn with_stuck_step_timeout(mut self, timeout: Duration) -> Self {
        self.stuck_step_timeout = timeout;
        self
    }

    /// Read settings from the environment, falling back to defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(size) = env_parse::<i64>("STEPFLOW_WORKER_BATCH_SIZE") {
            config.batch_size = size.max(1);
        }
        if let Some(ms) = env_parse::<u64>("STEPFLOW_WORKER_POLL_INTERVAL_MS") {
            config.poll_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = env_parse::<u64>("STEPFLOW_WORKER_WAKE_INTERVAL_MS") {
            config.wake_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = env_parse::<u64>("STEPFLOW_WORKER_REAP_INTERVAL_MS") {
            config.reap_interval = Duration::from_millis(ms);
        }
        if let Some(minutes) = env_parse::<u64>("STEPFLOW_WORKER_STUCK_STEP_TIMEOUT_MINUTES") {
            config.stuck_step_timeout = Duration::from_secs(minutes * 60);
        }
        config
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    let raw = std::env::var(key).ok()?;
    match raw.parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(%key, %raw, "ignoring unparseable environment value");
            None
        }
    }
}
