//! Process configuration from environment variables.
//!
//! Every variable is optional; unset or blank values keep the default.
//! Durations are given in whole seconds unless the name says `_MS`.

use std::time::Duration;

use crate::jobs::{
    BatchOptions, LeaseKeeperConfig, QueueSettings, Retention, RetryPolicy, WorkerPoolConfig,
};
use crate::scheduler::CronTriggerConfig;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("{name} is invalid: {reason}")]
    Invalid { name: &'static str, reason: String },

    #[error("{name} is required when {because}")]
    Missing { name: &'static str, because: String },

    #[error("{0}")]
    Inconsistent(String),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum QueueBackend {
    #[default]
    Memory,
    Redis,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StatusBackend {
    #[default]
    Memory,
    Postgres,
}

/// Endpoints of the external collaborators.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpConfig {
    pub data_fetch_url: Option<String>,
    pub oracle_url: Option<String>,
    pub timeout: Duration,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            data_fetch_url: None,
            oracle_url: None,
            timeout: Duration::from_secs(3600),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub queue_backend: QueueBackend,
    pub redis_url: Option<String>,
    pub queue_prefix: String,
    pub status_backend: StatusBackend,
    pub database_url: Option<String>,
    pub queue: QueueSettings,
    pub lease: LeaseKeeperConfig,
    pub pool: WorkerPoolConfig,
    pub scheduler: CronTriggerConfig,
    pub shutdown_grace: Duration,
    pub http: HttpConfig,
    /// Backoff the worker pool applies to transient queue errors while
    /// finishing a job.
    pub infra_retry: RetryPolicy,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            queue_backend: QueueBackend::Memory,
            redis_url: None,
            queue_prefix: "sellerflow:queue".to_string(),
            status_backend: StatusBackend::Memory,
            database_url: None,
            queue: QueueSettings::default(),
            lease: LeaseKeeperConfig::default(),
            pool: WorkerPoolConfig::default(),
            scheduler: CronTriggerConfig::default(),
            shutdown_grace: Duration::from_secs(30),
            http: HttpConfig::default(),
            infra_retry: RetryPolicy::exponential(
                3,
                Duration::from_millis(200),
                Duration::from_secs(5),
            ),
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env(lookup);
        let mut config = Self::default();

        if let Some(backend) = env.string("QUEUE_BACKEND") {
            config.queue_backend = match backend.to_ascii_lowercase().as_str() {
                "memory" => QueueBackend::Memory,
                "redis" => QueueBackend::Redis,
                other => return Err(invalid("QUEUE_BACKEND", format!("unknown backend {other:?}"))),
            };
        }
        config.redis_url = env.string("REDIS_URL");
        if let Some(prefix) = env.string("QUEUE_PREFIX") {
            config.queue_prefix = prefix;
        }
        if let Some(backend) = env.string("STATUS_BACKEND") {
            config.status_backend = match backend.to_ascii_lowercase().as_str() {
                "memory" => StatusBackend::Memory,
                "postgres" => StatusBackend::Postgres,
                other => return Err(invalid("STATUS_BACKEND", format!("unknown backend {other:?}"))),
            };
        }
        config.database_url = env.string("DATABASE_URL");

        if let Some(n) = env.parsed::<usize>("WORKER_CONCURRENCY")? {
            config.pool.concurrency = n;
        }
        if let Some(d) = env.secs("LEASE_DURATION_SECS")? {
            config.queue.lease_duration = d;
            config.lease.lease_duration = d;
        }
        if let Some(d) = env.secs("LEASE_RENEW_INTERVAL_SECS")? {
            config.lease.renew_interval = d;
        }
        if let Some(n) = env.parsed::<u32>("LEASE_RENEW_MAX_RETRIES")? {
            config.lease.max_retries = n;
        }
        if let Some(n) = env.parsed::<u32>("LEASE_RENEW_ESCALATE_AFTER")? {
            config.lease.escalate_after = n;
        }
        if let Some(d) = env.secs("FRESHNESS_WINDOW_SECS")? {
            config.queue.freshness_window = d;
        }

        let retry = &mut config.queue.retry;
        if let Some(n) = env.parsed::<u32>("MAX_ATTEMPTS")? {
            retry.max_attempts = n;
        }
        if let Some(d) = env.secs("RETRY_BASE_DELAY_SECS")? {
            retry.base_delay = d;
        }
        if let Some(d) = env.secs("RETRY_MAX_DELAY_SECS")? {
            retry.max_delay = d;
        }
        let infra = &mut config.infra_retry;
        if let Some(n) = env.parsed::<u32>("INFRA_RETRY_MAX_ATTEMPTS")? {
            infra.max_attempts = n;
        }
        if let Some(ms) = env.parsed::<u64>("INFRA_RETRY_BASE_DELAY_MS")? {
            infra.base_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = env.parsed::<u64>("INFRA_RETRY_MAX_DELAY_MS")? {
            infra.max_delay = Duration::from_millis(ms);
        }
        if let Some(n) = env.parsed::<u32>("MAX_STALLED_COUNT")? {
            config.queue.max_stalled_count = n;
        }
        if let Some(d) = env.secs("STALL_CHECK_INTERVAL_SECS")? {
            config.pool.stall_check_interval = d;
        }
        if let Some(ms) = env.parsed::<u64>("POLL_INTERVAL_MS")? {
            config.pool.poll_interval = Duration::from_millis(ms);
        }

        let retention: &mut Retention = &mut config.queue.retention;
        if let Some(d) = env.secs("RETENTION_COMPLETED_AGE_SECS")? {
            retention.completed_age = d;
        }
        if let Some(n) = env.parsed::<usize>("RETENTION_COMPLETED_COUNT")? {
            retention.completed_count = n;
        }
        if let Some(d) = env.secs("RETENTION_FAILED_AGE_SECS")? {
            retention.failed_age = d;
        }
        if let Some(n) = env.parsed::<usize>("RETENTION_FAILED_COUNT")? {
            retention.failed_count = n;
        }

        if let Some(d) = env.secs("SCHEDULER_INTERVAL_SECS")? {
            config.scheduler.interval = d;
        }
        if let Some(b) = env.bool("SCHEDULER_RUN_ON_START")? {
            config.scheduler.run_on_start = b;
        }
        let batch: &mut BatchOptions = &mut config.scheduler.batch;
        if let Some(n) = env.parsed::<usize>("BATCH_SIZE")? {
            batch.batch_size = n;
        }
        if let Some(ms) = env.parsed::<u64>("BATCH_DELAY_MS")? {
            batch.delay_between_batches = Duration::from_millis(ms);
        }
        if let Some(d) = env.secs("SHUTDOWN_GRACE_SECS")? {
            config.shutdown_grace = d;
        }

        config.http.data_fetch_url = env.string("DATA_FETCH_URL").map(trim_slash);
        config.http.oracle_url = env.string("ORACLE_URL").map(trim_slash);
        if let Some(d) = env.secs("HTTP_TIMEOUT_SECS")? {
            config.http.timeout = d;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pool.concurrency == 0 {
            return Err(invalid("WORKER_CONCURRENCY", "must be at least 1"));
        }
        if self.queue.retry.max_attempts == 0 {
            return Err(invalid("MAX_ATTEMPTS", "must be at least 1"));
        }
        if self.infra_retry.max_attempts == 0 {
            return Err(invalid("INFRA_RETRY_MAX_ATTEMPTS", "must be at least 1"));
        }
        if self.scheduler.batch.batch_size == 0 {
            return Err(invalid("BATCH_SIZE", "must be at least 1"));
        }
        if self.lease.renew_interval >= self.queue.lease_duration {
            return Err(ConfigError::Inconsistent(format!(
                "lease renew interval ({:?}) must be shorter than the lease duration ({:?})",
                self.lease.renew_interval, self.queue.lease_duration
            )));
        }
        if self.queue.retention.completed_age < self.queue.freshness_window {
            return Err(ConfigError::Inconsistent(format!(
                "completed retention age ({:?}) must not be shorter than the freshness window ({:?})",
                self.queue.retention.completed_age, self.queue.freshness_window
            )));
        }
        if self.queue_backend == QueueBackend::Redis && self.redis_url.is_none() {
            return Err(ConfigError::Missing {
                name: "REDIS_URL",
                because: "QUEUE_BACKEND=redis".to_string(),
            });
        }
        if self.status_backend == StatusBackend::Postgres && self.database_url.is_none() {
            return Err(ConfigError::Missing {
                name: "DATABASE_URL",
                because: "STATUS_BACKEND=postgres".to_string(),
            });
        }
        Ok(())
    }

    /// Infra-call retry policy used by the worker pool around queue calls.
    pub fn infra_retry(&self) -> RetryPolicy {
        self.infra_retry.clone()
    }
}

struct Env<F>(F);

impl<F> Env<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn string(&self, name: &str) -> Option<String> {
        (self.0)(name)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn parsed<T>(&self, name: &'static str) -> Result<Option<T>, ConfigError>
    where
        T: core::str::FromStr,
        T::Err: core::fmt::Display,
    {
        let Some(value) = self.string(name) else {
            return Ok(None);
        };
        value
            .parse::<T>()
            .map(Some)
            .map_err(|e| invalid(name, format!("{value:?}: {e}")))
    }

    fn secs(&self, name: &'static str) -> Result<Option<Duration>, ConfigError> {
        Ok(self.parsed::<u64>(name)?.map(Duration::from_secs))
    }

    fn bool(&self, name: &'static str) -> Result<Option<bool>, ConfigError> {
        let Some(value) = self.string(name) else {
            return Ok(None);
        };
        match value.to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" | "y" => Ok(Some(true)),
            "false" | "0" | "no" | "n" => Ok(Some(false)),
            _ => Err(invalid(name, "must be a boolean (true/false/1/0)")),
        }
    }
}

fn invalid(name: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        name,
        reason: reason.into(),
    }
}

fn trim_slash(url: String) -> String {
    url.trim_end_matches('/').to_string()
}
