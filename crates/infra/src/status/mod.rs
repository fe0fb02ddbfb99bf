//! Status side channel: per-job and per-unit progress records.
//!
//! Status writes are best effort. The queue is the source of truth for job
//! ownership; a failed status write is logged and never fails the job.
//!
//! ## Record kinds
//!
//! - job records, keyed by job id (`user-42-ORDERS`)
//! - unit records, keyed by parent id (`user-42` or `user-42:DE`)

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use tracing::warn;

use sellerflow_core::RunId;

pub mod in_memory;
pub mod postgres;

pub use in_memory::InMemoryStatusStore;
pub use postgres::PostgresStatusStore;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusKind {
    #[default]
    Job,
    Unit,
}

impl StatusKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StatusKind::Job => "job",
            StatusKind::Unit => "unit",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusState {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
}

impl StatusState {
    pub const ALL: [StatusState; 4] = [
        StatusState::Pending,
        StatusState::Running,
        StatusState::Completed,
        StatusState::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StatusState::Pending => "pending",
            StatusState::Running => "running",
            StatusState::Completed => "completed",
            StatusState::Failed => "failed",
        }
    }

    /// Pending or running.
    pub fn is_in_flight(&self) -> bool {
        matches!(self, StatusState::Pending | StatusState::Running)
    }
}

impl core::fmt::Display for StatusState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::str::FromStr for StatusState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        StatusState::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| format!("unknown status: {s}"))
    }
}

/// Stored status of a job or a unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusRecord {
    pub id: String,
    pub kind: StatusKind,
    pub status: StatusState,
    #[serde(default)]
    pub subject_id: Option<String>,
    #[serde(default)]
    pub region: Option<String>,
    /// Phase of a job record; current phase of a unit record.
    #[serde(default)]
    pub phase: Option<String>,
    #[serde(default)]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub current_job_id: Option<String>,
    #[serde(default)]
    pub run_id: Option<RunId>,
    #[serde(default)]
    pub attempt: Option<u32>,
    /// Overall progress in percent (unit records) or 0/100 (job records).
    #[serde(default)]
    pub progress: u8,
    #[serde(default)]
    pub retrying: bool,
    #[serde(default)]
    pub enqueued_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub failed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub duration_ms: Option<i64>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub failed_phase: Option<String>,
    #[serde(default)]
    pub summary: Option<JsonValue>,
    #[serde(default)]
    pub metadata: Map<String, JsonValue>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl StatusRecord {
    pub fn new(id: impl Into<String>, kind: StatusKind, now: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            kind,
            status: StatusState::Pending,
            subject_id: None,
            region: None,
            phase: None,
            parent_id: None,
            current_job_id: None,
            run_id: None,
            attempt: None,
            progress: 0,
            retrying: false,
            enqueued_at: None,
            started_at: None,
            completed_at: None,
            failed_at: None,
            duration_ms: None,
            error: None,
            failed_phase: None,
            summary: None,
            metadata: Map::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Merge a patch into the record.
    ///
    /// Fields absent from the patch keep their value (a `restart` patch first
    /// clears the previous run's outcome), metadata keys are merged, and a
    /// terminal transition with a known start time fills in the duration.
    pub fn apply(&mut self, patch: StatusPatch, now: DateTime<Utc>) {
        let StatusPatch {
            kind,
            status,
            subject_id,
            region,
            phase,
            parent_id,
            current_job_id,
            run_id,
            attempt,
            progress,
            retrying,
            enqueued_at,
            started_at,
            completed_at,
            failed_at,
            duration_ms,
            error,
            clear_error,
            restart,
            failed_phase,
            summary,
            metadata,
        } = patch;

        if let Some(kind) = kind {
            self.kind = kind;
        }
        if let Some(status) = status {
            self.status = status;
        }
        if restart {
            self.error = None;
            self.failed_phase = None;
            self.started_at = None;
            self.completed_at = None;
            self.failed_at = None;
            self.duration_ms = None;
            self.summary = None;
            self.retrying = false;
        }
        merge(&mut self.subject_id, subject_id);
        merge(&mut self.region, region);
        merge(&mut self.phase, phase);
        merge(&mut self.parent_id, parent_id);
        merge(&mut self.current_job_id, current_job_id);
        merge(&mut self.run_id, run_id);
        merge(&mut self.attempt, attempt);
        merge(&mut self.enqueued_at, enqueued_at);
        merge(&mut self.started_at, started_at);
        merge(&mut self.completed_at, completed_at);
        merge(&mut self.failed_at, failed_at);
        merge(&mut self.duration_ms, duration_ms);
        merge(&mut self.failed_phase, failed_phase);
        merge(&mut self.summary, summary);
        if let Some(progress) = progress {
            self.progress = progress.min(100);
        }
        if let Some(retrying) = retrying {
            self.retrying = retrying;
        }
        if clear_error {
            self.error = None;
        }
        if error.is_some() {
            self.error = error;
        }
        self.metadata.extend(metadata);

        if duration_ms.is_none() {
            let finished = match self.status {
                StatusState::Completed => self.completed_at,
                StatusState::Failed => self.failed_at,
                _ => None,
            };
            if let (Some(start), Some(end)) = (self.started_at, finished) {
                self.duration_ms = Some((end - start).num_milliseconds().max(0));
            }
        }
        self.updated_at = now;
    }

    pub fn matches(&self, filter: &StatusFilter) -> bool {
        filter.kind.is_none_or(|k| k == self.kind)
            && filter.status.is_none_or(|s| s == self.status)
            && filter
                .subject_id
                .as_deref()
                .is_none_or(|s| self.subject_id.as_deref() == Some(s))
            && filter
                .phase
                .as_deref()
                .is_none_or(|p| self.phase.as_deref() == Some(p))
            && filter
                .parent_id
                .as_deref()
                .is_none_or(|p| self.parent_id.as_deref() == Some(p))
            && filter.updated_after.is_none_or(|t| self.updated_at > t)
    }
}

fn merge<T>(slot: &mut Option<T>, value: Option<T>) {
    if value.is_some() {
        *slot = value;
    }
}

/// Partial update of a [`StatusRecord`]; `None` leaves a field untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatusPatch {
    pub kind: Option<StatusKind>,
    pub status: Option<StatusState>,
    pub subject_id: Option<String>,
    pub region: Option<String>,
    pub phase: Option<String>,
    pub parent_id: Option<String>,
    pub current_job_id: Option<String>,
    pub run_id: Option<RunId>,
    pub attempt: Option<u32>,
    pub progress: Option<u8>,
    pub retrying: Option<bool>,
    pub enqueued_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub error: Option<String>,
    /// Drop the error left by an earlier attempt.
    pub clear_error: bool,
    /// A new run starts: drop outcome fields left by the previous run.
    pub restart: bool,
    pub failed_phase: Option<String>,
    pub summary: Option<JsonValue>,
    pub metadata: Map<String, JsonValue>,
}

impl StatusPatch {
    pub fn job(status: StatusState) -> Self {
        Self {
            kind: Some(StatusKind::Job),
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn unit(status: StatusState) -> Self {
        Self {
            kind: Some(StatusKind::Unit),
            status: Some(status),
            ..Default::default()
        }
    }
}

/// Record selection for [`StatusStore::query`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatusFilter {
    pub kind: Option<StatusKind>,
    pub status: Option<StatusState>,
    pub subject_id: Option<String>,
    pub phase: Option<String>,
    pub parent_id: Option<String>,
    pub updated_after: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StatusSort {
    #[default]
    UpdatedDesc,
    UpdatedAsc,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatusQuery {
    pub filter: StatusFilter,
    pub sort: StatusSort,
    pub limit: Option<usize>,
}

impl StatusQuery {
    pub fn units() -> Self {
        Self {
            filter: StatusFilter {
                kind: Some(StatusKind::Unit),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    pub fn jobs_of(parent_id: impl Into<String>) -> Self {
        Self {
            filter: StatusFilter {
                kind: Some(StatusKind::Job),
                parent_id: Some(parent_id.into()),
                ..Default::default()
            },
            sort: StatusSort::UpdatedAsc,
            limit: None,
        }
    }

    pub fn with_status(mut self, status: StatusState) -> Self {
        self.filter.status = Some(status);
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum StatusStoreError {
    #[error("status store unavailable: {0}")]
    Unavailable(String),
    #[error("status store error: {0}")]
    Backend(String),
    #[error("status serialization error: {0}")]
    Serialization(String),
}

/// Durable key/value store of status records.
#[async_trait]
pub trait StatusStore: Send + Sync {
    /// Merge `patch` into the record `id`, creating it when absent.
    async fn upsert(&self, id: &str, patch: StatusPatch) -> Result<StatusRecord, StatusStoreError>;

    async fn get(&self, id: &str) -> Result<Option<StatusRecord>, StatusStoreError>;

    async fn query(&self, query: &StatusQuery) -> Result<Vec<StatusRecord>, StatusStoreError>;
}

/// Best-effort writer in front of a [`StatusStore`].
///
/// Failures are logged at warn and swallowed.
#[derive(Clone)]
pub struct StatusRecorder {
    store: Arc<dyn StatusStore>,
}

impl StatusRecorder {
    pub fn new(store: Arc<dyn StatusStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn StatusStore> {
        &self.store
    }

    pub async fn record(&self, id: &str, patch: StatusPatch) -> Option<StatusRecord> {
        match self.store.upsert(id, patch).await {
            Ok(record) => Some(record),
            Err(e) => {
                warn!(status_id = %id, error = %e, "status write failed");
                None
            }
        }
    }

    pub async fn get(&self, id: &str) -> Result<Option<StatusRecord>, StatusStoreError> {
        self.store.get(id).await
    }
}

impl core::fmt::Debug for StatusRecorder {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("StatusRecorder").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn apply_keeps_untouched_fields_and_merges_metadata() {
        let t0 = Utc::now();
        let mut record = StatusRecord::new("user-1", StatusKind::Unit, t0);

        let mut meta = Map::new();
        meta.insert("source".to_string(), json!("cron"));
        record.apply(
            StatusPatch {
                subject_id: Some("user-1".to_string()),
                phase: Some("INIT".to_string()),
                metadata: meta,
                ..StatusPatch::unit(StatusState::Pending)
            },
            t0,
        );

        let t1 = t0 + chrono::Duration::seconds(5);
        let mut meta = Map::new();
        meta.insert("trigger".to_string(), json!("manual"));
        record.apply(
            StatusPatch {
                progress: Some(150),
                started_at: Some(t0),
                completed_at: Some(t1),
                metadata: meta,
                ..StatusPatch::unit(StatusState::Completed)
            },
            t1,
        );

        assert_eq!(record.subject_id.as_deref(), Some("user-1"));
        assert_eq!(record.phase.as_deref(), Some("INIT"));
        assert_eq!(record.progress, 100);
        assert_eq!(record.duration_ms, Some(5000));
        assert_eq!(record.metadata.len(), 2);
        assert_eq!(record.updated_at, t1);
        assert_eq!(record.created_at, t0);
    }

    #[test]
    fn restart_resets_previous_outcome() {
        let now = Utc::now();
        let mut record = StatusRecord::new("user-1", StatusKind::Unit, now);
        record.apply(
            StatusPatch {
                error: Some("boom".to_string()),
                ..StatusPatch::unit(StatusState::Failed)
            },
            now,
        );
        record.apply(
            StatusPatch {
                restart: true,
                ..StatusPatch::unit(StatusState::Pending)
            },
            now,
        );
        assert_eq!(record.error, None);
        assert_eq!(record.status, StatusState::Pending);
    }

    #[test]
    fn clear_error_drops_only_the_error() {
        let now = Utc::now();
        let mut record = StatusRecord::new("user-1", StatusKind::Unit, now);
        record.apply(
            StatusPatch {
                phase: Some("INIT".to_string()),
                error: Some("upstream 503".to_string()),
                retrying: Some(true),
                ..StatusPatch::unit(StatusState::Running)
            },
            now,
        );
        record.apply(
            StatusPatch {
                clear_error: true,
                ..StatusPatch::unit(StatusState::Running)
            },
            now,
        );
        assert_eq!(record.error, None);
        assert_eq!(record.phase.as_deref(), Some("INIT"));
        assert!(record.retrying);
    }

    #[test]
    fn filter_matches_on_every_given_field() {
        let now = Utc::now();
        let mut record = StatusRecord::new("user-1-INIT", StatusKind::Job, now);
        record.parent_id = Some("user-1".to_string());
        record.phase = Some("INIT".to_string());

        let mut filter = StatusFilter {
            kind: Some(StatusKind::Job),
            parent_id: Some("user-1".to_string()),
            ..Default::default()
        };
        assert!(record.matches(&filter));

        filter.phase = Some("ORDERS".to_string());
        assert!(!record.matches(&filter));
    }
}
