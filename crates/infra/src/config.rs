//! Queue configuration loading and representation.
//!
//! Every tunable of the dispatcher is an explicit field here. Defaults match
//! a small web backend: poll every 5s, claim 10 jobs per tick, keep terminal
//! jobs for 7 days, back off from 1s up to 5min.

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use jobqueue_core::{NewJob, QueueName, RetryPolicy};

/// What the dispatcher does with a claimed job whose type has no handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MissingHandlerPolicy {
    /// Put the job back to `pending`, due again after one poll interval.
    /// Another process (or a later registration) may pick it up.
    #[default]
    Release,
    /// Move the job straight to `failed`.
    Fail,
}

impl FromStr for MissingHandlerPolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "release" => Ok(Self::Release),
            "fail" => Ok(Self::Fail),
            other => Err(ConfigError::invalid(
                "JOBQUEUE_MISSING_HANDLER",
                format!("expected `release` or `fail`, got `{other}`"),
            )),
        }
    }
}

/// Configuration error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {reason}")]
    Invalid { key: String, reason: String },
}

impl ConfigError {
    fn invalid(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key: key.into(),
            reason: reason.into(),
        }
    }
}

/// Dispatcher/queue configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Queue this instance enqueues to and dispatches from.
    pub queue_name: String,
    /// Time between ticks.
    pub poll_interval: Duration,
    /// Maximum jobs claimed per tick.
    pub batch_size: usize,
    /// Terminal jobs older than this are deleted. Zero disables reaping.
    pub retention: Duration,
    /// Delay after the first failure.
    pub backoff_base: Duration,
    /// Upper bound for any retry delay.
    pub backoff_cap: Duration,
    /// Per-job execution limit. `None` lets handlers run unbounded.
    pub job_timeout: Option<Duration>,
    /// Jobs of one batch that may run at the same time. 1 = sequential.
    pub max_concurrent: usize,
    /// Used by `enqueue` when the caller gives no `max_retries`.
    pub default_max_retries: u32,
    /// Used by `enqueue` when the caller gives no `priority`.
    pub default_priority: i32,
    pub missing_handler: MissingHandlerPolicy,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            queue_name: "default".to_string(),
            poll_interval: Duration::from_secs(5),
            batch_size: 10,
            retention: Duration::from_secs(7 * 24 * 60 * 60),
            backoff_base: Duration::from_secs(1),
            backoff_cap: Duration::from_secs(5 * 60),
            job_timeout: Some(Duration::from_secs(5 * 60)),
            max_concurrent: 1,
            default_max_retries: NewJob::DEFAULT_MAX_RETRIES,
            default_priority: 0,
            missing_handler: MissingHandlerPolicy::Release,
        }
    }
}

impl QueueConfig {
    /// Defaults overlaid with `JOBQUEUE_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overlaid with values from `lookup` (keyed like the
    /// environment variables).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(name) = lookup("JOBQUEUE_QUEUE_NAME") {
            config.queue_name = name;
        }
        if let Some(ms) = parse::<u64>(&lookup, "JOBQUEUE_POLL_INTERVAL_MS")? {
            config.poll_interval = Duration::from_millis(ms);
        }
        if let Some(n) = parse::<usize>(&lookup, "JOBQUEUE_BATCH_SIZE")? {
            config.batch_size = n;
        }
        if let Some(secs) = parse::<u64>(&lookup, "JOBQUEUE_RETENTION_SECS")? {
            config.retention = Duration::from_secs(secs);
        }
        if let Some(ms) = parse::<u64>(&lookup, "JOBQUEUE_BACKOFF_BASE_MS")? {
            config.backoff_base = Duration::from_millis(ms);
        }
        if let Some(ms) = parse::<u64>(&lookup, "JOBQUEUE_BACKOFF_CAP_MS")? {
            config.backoff_cap = Duration::from_millis(ms);
        }
        if let Some(ms) = parse::<u64>(&lookup, "JOBQUEUE_JOB_TIMEOUT_MS")? {
            config.job_timeout = (ms > 0).then(|| Duration::from_millis(ms));
        }
        if let Some(n) = parse::<usize>(&lookup, "JOBQUEUE_MAX_CONCURRENT")? {
            config.max_concurrent = n;
        }
        if let Some(n) = parse::<u32>(&lookup, "JOBQUEUE_DEFAULT_MAX_RETRIES")? {
            config.default_max_retries = n;
        }
        if let Some(policy) = lookup("JOBQUEUE_MISSING_HANDLER") {
            config.missing_handler = policy.parse()?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the dispatcher cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.queue()?;
        if self.poll_interval.is_zero() {
            return Err(ConfigError::invalid("poll_interval", "must be greater than zero"));
        }
        if self.batch_size == 0 {
            return Err(ConfigError::invalid("batch_size", "must be greater than zero"));
        }
        if self.max_concurrent == 0 {
            return Err(ConfigError::invalid("max_concurrent", "must be greater than zero"));
        }
        if self.backoff_base > self.backoff_cap {
            return Err(ConfigError::invalid(
                "backoff_base",
                format!(
                    "{:?} exceeds backoff_cap {:?}",
                    self.backoff_base, self.backoff_cap
                ),
            ));
        }
        Ok(())
    }

    /// The validated queue name.
    pub fn queue(&self) -> Result<QueueName, ConfigError> {
        QueueName::new(self.queue_name.as_str())
            .map_err(|e| ConfigError::invalid("queue_name", e.to_string()))
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.backoff_base, self.backoff_cap)
    }

    pub fn with_queue_name(mut self, name: impl Into<String>) -> Self {
        self.queue_name = name.into();
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size;
        self
    }

    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    pub fn with_backoff(mut self, base: Duration, cap: Duration) -> Self {
        self.backoff_base = base;
        self.backoff_cap = cap;
        self
    }

    pub fn with_job_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.job_timeout = timeout;
        self
    }

    pub fn with_max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent = max;
        self
    }

    pub fn with_missing_handler(mut self, policy: MissingHandlerPolicy) -> Self {
        self.missing_handler = policy;
        self
    }
}

fn parse<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| ConfigError::invalid(key, format!("`{raw}`: {e}"))),
        None => Ok(None),
    }
}
