//! Core job types and policies.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use uuid::Uuid;

use sellerflow_core::{JobId, RunId, UnitKey};

/// Shape of a queued job.
///
/// Jobs written before phases existed carry no phase; they are normalized to
/// the registry's first phase when a worker leases them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobKind {
    #[default]
    Legacy,
    Phased { phase: String },
}

impl JobKind {
    pub fn phased(phase: impl Into<String>) -> Self {
        Self::Phased {
            phase: phase.into(),
        }
    }

    pub fn phase(&self) -> Option<&str> {
        match self {
            JobKind::Legacy => None,
            JobKind::Phased { phase } => Some(phase),
        }
    }
}

/// Queue-side lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Ready to be leased.
    Waiting,
    /// Not visible until `available_at` (initial delay or retry backoff).
    Delayed,
    /// Leased by a worker.
    Active,
    Completed,
    /// Permanently failed (attempts or stall limit exhausted, or fatal error).
    Failed,
}

impl JobState {
    pub const ALL: [JobState; 5] = [
        JobState::Waiting,
        JobState::Delayed,
        JobState::Active,
        JobState::Completed,
        JobState::Failed,
    ];

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Waiting => "waiting",
            JobState::Delayed => "delayed",
            JobState::Active => "active",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
        }
    }
}

impl core::fmt::Display for JobState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::str::FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobState::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| format!("unknown job state: {s}"))
    }
}

/// How the wait before a retry grows with the attempt number.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    Fixed,
    /// `base * 2^(attempt - 1)`
    #[default]
    Exponential,
    /// `base * attempt`
    Linear,
}

/// Attempt cap and backoff for a job, or for retried infrastructure calls
/// (lease renewal, oracle fetches).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts allowed, including the first execution.
    pub max_attempts: u32,
    pub base_delay: Duration,
    /// Upper bound applied after the strategy, before jitter.
    pub max_delay: Duration,
    pub strategy: BackoffStrategy,
    /// Fraction of the delay (0.0 to 1.0) spread around it.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(60),
            max_delay: Duration::from_secs(3600),
            strategy: BackoffStrategy::Exponential,
            jitter: 0.1,
        }
    }
}

impl RetryPolicy {
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self::exponential(max_attempts, delay, delay).with_strategy(BackoffStrategy::Fixed)
    }

    pub fn exponential(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
            strategy: BackoffStrategy::Exponential,
            jitter: 0.0,
        }
    }

    pub fn with_strategy(mut self, strategy: BackoffStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Wait before the retry that follows failed attempt `attempt` (1-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let scaled = match self.strategy {
            BackoffStrategy::Fixed => self.base_delay,
            BackoffStrategy::Exponential => {
                let factor = 1u32 << (attempt - 1).min(30);
                self.base_delay.saturating_mul(factor)
            }
            BackoffStrategy::Linear => self.base_delay.saturating_mul(attempt),
        };
        let capped = scaled.min(self.max_delay);

        if self.jitter <= 0.0 {
            return capped;
        }
        // Deterministic spread in [-jitter, +jitter) keyed on the attempt.
        let position = f64::from(attempt.wrapping_mul(17) % 100) / 100.0;
        let offset = capped.as_secs_f64() * self.jitter.min(1.0) * (position * 2.0 - 1.0);
        Duration::from_secs_f64((capped.as_secs_f64() + offset).max(0.0))
    }

    /// Whether another attempt is allowed after `attempt` executions.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

/// Retention bounds for terminal jobs.
///
/// Completed jobs still inside the freshness window are never pruned,
/// whatever these bounds say.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Retention {
    pub completed_age: Duration,
    pub completed_count: usize,
    pub failed_age: Duration,
    pub failed_count: usize,
}

impl Default for Retention {
    fn default() -> Self {
        Self {
            completed_age: Duration::from_secs(24 * 3600),
            completed_count: 1000,
            failed_age: Duration::from_secs(7 * 24 * 3600),
            failed_count: 5000,
        }
    }
}

/// Behaviour of a queue backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueSettings {
    /// How long a lease lasts before the job is considered stalled.
    pub lease_duration: Duration,
    /// Stall detections tolerated before a job fails permanently.
    pub max_stalled_count: u32,
    /// Completed jobs younger than this suppress re-enqueue of the same id.
    pub freshness_window: Duration,
    pub retry: RetryPolicy,
    pub retention: Retention,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            lease_duration: Duration::from_secs(2 * 3600),
            max_stalled_count: 1,
            freshness_window: Duration::from_secs(2 * 3600),
            retry: RetryPolicy::default(),
            retention: Retention::default(),
        }
    }
}

/// Opaque lease token; only its holder may extend, complete or fail a job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LeaseToken(String);

impl LeaseToken {
    pub fn new() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    pub fn from_raw(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for LeaseToken {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Display for LeaseToken {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lease currently held on an active job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseInfo {
    pub token: LeaseToken,
    pub worker_id: String,
    pub expires_at: DateTime<Utc>,
}

/// A queued phase job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    #[serde(default)]
    pub kind: JobKind,
    /// Logical unit this job belongs to.
    pub unit: UnitKey,
    /// Chain run this job belongs to (absent on legacy jobs).
    #[serde(default)]
    pub run_id: Option<RunId>,
    /// Phase data carried forward from earlier phases.
    #[serde(default)]
    pub payload: Map<String, JsonValue>,
    /// Request metadata, forwarded unchanged along the chain.
    #[serde(default)]
    pub meta: Map<String, JsonValue>,
    #[serde(default)]
    pub dedup_key: Option<String>,
    /// Lower value is leased first.
    pub priority: i32,
    pub max_attempts: u32,
    /// Executions started so far.
    pub attempt: u32,
    pub stalled_count: u32,
    pub state: JobState,
    pub lease: Option<LeaseInfo>,
    pub enqueued_at: DateTime<Utc>,
    pub available_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl Job {
    pub fn phase(&self) -> Option<&str> {
        self.kind.phase()
    }

    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        now >= self.available_at
    }

    /// Whether a completed job still suppresses re-enqueue at `now`.
    pub fn is_fresh(&self, now: DateTime<Utc>, window: Duration) -> bool {
        match (self.state, self.finished_at) {
            (JobState::Completed, Some(at)) => now - at < chrono_duration(window),
            _ => false,
        }
    }

    pub fn lease_expired(&self, now: DateTime<Utc>) -> bool {
        self.lease.as_ref().is_some_and(|l| l.expires_at <= now)
    }
}

/// Request to create a job.
#[derive(Debug, Clone, PartialEq)]
pub struct NewJob {
    pub id: JobId,
    pub kind: JobKind,
    pub unit: UnitKey,
    pub run_id: Option<RunId>,
    pub payload: Map<String, JsonValue>,
    pub meta: Map<String, JsonValue>,
}

impl NewJob {
    pub fn phased(id: JobId, phase: impl Into<String>, unit: UnitKey, run_id: RunId) -> Self {
        Self {
            id,
            kind: JobKind::phased(phase),
            unit,
            run_id: Some(run_id),
            payload: Map::new(),
            meta: Map::new(),
        }
    }

    pub fn with_payload(mut self, payload: Map<String, JsonValue>) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_meta(mut self, meta: Map<String, JsonValue>) -> Self {
        self.meta = meta;
        self
    }

    /// Materialize the queued job at `now`.
    pub fn into_job(self, options: &EnqueueOptions, default_attempts: u32, now: DateTime<Utc>) -> Job {
        let available_at = now + options.delay.map(chrono_duration).unwrap_or_default();
        let state = if available_at > now {
            JobState::Delayed
        } else {
            JobState::Waiting
        };

        Job {
            id: self.id,
            kind: self.kind,
            unit: self.unit,
            run_id: self.run_id,
            payload: self.payload,
            meta: self.meta,
            dedup_key: options.dedup_key.clone(),
            priority: options.priority,
            max_attempts: options.max_attempts.unwrap_or(default_attempts).max(1),
            attempt: 0,
            stalled_count: 0,
            state,
            lease: None,
            enqueued_at: now,
            available_at,
            started_at: None,
            finished_at: None,
            last_error: None,
        }
    }
}

/// Options for [`crate::jobs::JobQueue::enqueue`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnqueueOptions {
    pub priority: i32,
    pub delay: Option<Duration>,
    /// A fresh completed job only counts as a duplicate when its dedup key
    /// matches this one (or when this is `None`).
    pub dedup_key: Option<String>,
    /// Overrides the queue's default attempt cap.
    pub max_attempts: Option<u32>,
    /// Replace a fresh completed job with the same id instead of reporting it.
    pub replace_completed: bool,
}

impl EnqueueOptions {
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn with_dedup_key(mut self, key: impl Into<String>) -> Self {
        self.dedup_key = Some(key.into());
        self
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts);
        self
    }

    pub fn replacing_completed(mut self) -> Self {
        self.replace_completed = true;
        self
    }
}

/// Result of an enqueue: the job reference and whether it already existed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EnqueueOutcome {
    pub job_id: JobId,
    pub existing: bool,
    pub state: JobState,
}

/// What a worker asks the queue for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseRequest {
    pub worker_id: String,
    /// Phases this worker can execute.
    pub phases: Vec<String>,
    /// Whether phase-less legacy jobs are eligible.
    pub include_legacy: bool,
}

impl LeaseRequest {
    pub fn new(worker_id: impl Into<String>, phases: Vec<String>) -> Self {
        Self {
            worker_id: worker_id.into(),
            phases,
            include_legacy: true,
        }
    }

    pub fn accepts(&self, kind: &JobKind) -> bool {
        match kind {
            JobKind::Legacy => self.include_legacy,
            JobKind::Phased { phase } => self.phases.iter().any(|p| p == phase),
        }
    }
}

/// A job handed to a worker together with its lease.
#[derive(Debug, Clone, PartialEq)]
pub struct LeasedJob {
    pub job: Job,
    pub token: LeaseToken,
    pub expires_at: DateTime<Utc>,
}

/// Outcome of [`crate::jobs::JobQueue::fail`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailOutcome {
    /// Re-delivered after backoff.
    Retrying { attempt: u32, retry_at: DateTime<Utc> },
    /// No more attempts; the job is permanently failed.
    Exhausted { attempts: u32 },
}

/// Result of a stall scan.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StallReport {
    /// Returned to waiting for re-delivery.
    pub requeued: Vec<JobId>,
    /// Stalled more often than allowed; permanently failed.
    pub failed: Vec<JobId>,
}

impl StallReport {
    pub fn is_empty(&self) -> bool {
        self.requeued.is_empty() && self.failed.is_empty()
    }
}

/// A lease attempt together with the stall recovery that ran before it.
#[derive(Debug, Clone, Default)]
pub struct LeaseAttempt {
    pub leased: Option<LeasedJob>,
    pub stalls: StallReport,
}

/// Number of jobs per state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueCounts {
    pub waiting: usize,
    pub delayed: usize,
    pub active: usize,
    pub completed: usize,
    pub failed: usize,
}

impl QueueCounts {
    pub fn add(&mut self, state: JobState) {
        match state {
            JobState::Waiting => self.waiting += 1,
            JobState::Delayed => self.delayed += 1,
            JobState::Active => self.active += 1,
            JobState::Completed => self.completed += 1,
            JobState::Failed => self.failed += 1,
        }
    }
}

pub(crate) fn chrono_duration(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_default()
}
