//! Durable queue abstraction and the in-memory backend.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use sellerflow_core::{Clock, JobId};

use super::types::{
    chrono_duration, EnqueueOptions, EnqueueOutcome, FailOutcome, Job, JobState, LeaseAttempt,
    LeaseInfo, LeaseRequest, LeaseToken, LeasedJob, NewJob, QueueCounts, QueueSettings, StallReport,
};

/// Durable, lease-based work queue.
///
/// The backend is the single source of truth for job ownership: every
/// mutation of a leased job must present the exact lease token it was issued,
/// and a stale or expired token is rejected with [`QueueError::LeaseLost`].
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Add a job unless one with the same id is waiting/delayed/active, or
    /// completed inside the freshness window.
    async fn enqueue(&self, job: NewJob, options: EnqueueOptions)
    -> Result<EnqueueOutcome, QueueError>;

    /// Lease the next eligible job (priority, then FIFO). Promotes due delayed
    /// jobs and recovers stalled ones first, reporting what recovery did.
    async fn try_lease(&self, request: &LeaseRequest) -> Result<LeaseAttempt, QueueError>;

    /// [`JobQueue::try_lease`] without the stall report.
    async fn lease(&self, request: &LeaseRequest) -> Result<Option<LeasedJob>, QueueError> {
        Ok(self.try_lease(request).await?.leased)
    }

    /// Push the lease expiry to `now + extension`.
    async fn extend_lease(
        &self,
        job_id: &JobId,
        token: &LeaseToken,
        extension: Duration,
    ) -> Result<DateTime<Utc>, QueueError>;

    async fn complete(&self, job_id: &JobId, token: &LeaseToken) -> Result<(), QueueError>;

    /// Record a failed attempt. Retryable failures are re-delivered with
    /// backoff until the job's attempt cap is reached.
    async fn fail(
        &self,
        job_id: &JobId,
        token: &LeaseToken,
        error: &str,
        retryable: bool,
    ) -> Result<FailOutcome, QueueError>;

    /// Remove a job that has not been leased yet. Returns `false` when the
    /// job is missing, leased or terminal.
    async fn remove(&self, job_id: &JobId) -> Result<bool, QueueError>;

    async fn get(&self, job_id: &JobId) -> Result<Option<Job>, QueueError>;

    /// Return expired leases to waiting, failing jobs that stalled too often.
    async fn recover_stalled(&self) -> Result<StallReport, QueueError>;

    async fn counts(&self) -> Result<QueueCounts, QueueError>;

    /// Jobs in `state`, oldest first.
    async fn list(&self, state: JobState, limit: usize) -> Result<Vec<Job>, QueueError>;
}

/// Queue operation error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum QueueError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    /// The presented lease token is stale, expired or belongs to someone else.
    #[error("lease lost for job {0}")]
    LeaseLost(JobId),
    #[error("queue backend unavailable: {0}")]
    Unavailable(String),
    #[error("queue backend error: {0}")]
    Backend(String),
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl QueueError {
    /// Whether retrying the same call later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, QueueError::Unavailable(_) | QueueError::Backend(_))
    }
}

/// Error text recorded on jobs failed by the stall detector.
pub const STALLED_ERROR: &str = "job stalled more than allowable limit";

#[derive(Debug, Default)]
struct QueueState {
    jobs: HashMap<JobId, Job>,
    /// FIFO position among equal priorities.
    seq: HashMap<JobId, u64>,
    next_seq: u64,
}

impl QueueState {
    fn push_seq(&mut self, id: &JobId) {
        self.next_seq += 1;
        self.seq.insert(id.clone(), self.next_seq);
    }

    fn remove(&mut self, id: &JobId) -> Option<Job> {
        self.seq.remove(id);
        self.jobs.remove(id)
    }

    fn leased_mut(
        &mut self,
        id: &JobId,
        token: &LeaseToken,
        now: DateTime<Utc>,
    ) -> Result<&mut Job, QueueError> {
        let job = self
            .jobs
            .get_mut(id)
            .ok_or_else(|| QueueError::NotFound(id.clone()))?;
        match &job.lease {
            Some(lease)
                if job.state == JobState::Active
                    && &lease.token == token
                    && lease.expires_at > now =>
            {
                Ok(job)
            }
            _ => Err(QueueError::LeaseLost(id.clone())),
        }
    }
}

/// In-memory queue for tests/dev.
///
/// Implements the full lease/retry/stall/retention semantics against an
/// injected clock; nothing survives a process restart.
#[derive(Debug)]
pub struct InMemoryJobQueue {
    settings: QueueSettings,
    clock: Arc<dyn Clock>,
    inner: Mutex<QueueState>,
}

impl InMemoryJobQueue {
    pub fn new(settings: QueueSettings, clock: Arc<dyn Clock>) -> Self {
        Self {
            settings,
            clock,
            inner: Mutex::new(QueueState::default()),
        }
    }

    pub fn arc(settings: QueueSettings, clock: Arc<dyn Clock>) -> Arc<Self> {
        Arc::new(Self::new(settings, clock))
    }

    pub fn settings(&self) -> &QueueSettings {
        &self.settings
    }

    fn state(&self) -> Result<MutexGuard<'_, QueueState>, QueueError> {
        self.inner
            .lock()
            .map_err(|_| QueueError::Backend("in-memory queue lock poisoned".to_string()))
    }

    fn promote_delayed(state: &mut QueueState, now: DateTime<Utc>) {
        let due: Vec<JobId> = state
            .jobs
            .values()
            .filter(|j| j.state == JobState::Delayed && j.is_ready(now))
            .map(|j| j.id.clone())
            .collect();
        for id in due {
            if let Some(job) = state.jobs.get_mut(&id) {
                job.state = JobState::Waiting;
            }
        }
    }

    fn recover_stalled_locked(&self, state: &mut QueueState, now: DateTime<Utc>) -> StallReport {
        let mut report = StallReport::default();
        let stalled: Vec<JobId> = state
            .jobs
            .values()
            .filter(|j| j.state == JobState::Active && j.lease_expired(now))
            .map(|j| j.id.clone())
            .collect();

        for id in stalled {
            let Some(job) = state.jobs.get_mut(&id) else {
                continue;
            };
            job.stalled_count += 1;
            job.lease = None;
            if job.stalled_count > self.settings.max_stalled_count {
                job.state = JobState::Failed;
                job.finished_at = Some(now);
                job.last_error = Some(STALLED_ERROR.to_string());
                warn!(job_id = %id, stalled = job.stalled_count, "stalled job failed permanently");
                report.failed.push(id);
            } else {
                job.state = JobState::Waiting;
                info!(job_id = %id, stalled = job.stalled_count, "stalled job returned to waiting");
                report.requeued.push(id.clone());
                state.push_seq(&id);
            }
        }

        if !report.failed.is_empty() {
            self.prune(state, now);
        }
        report
    }

    /// Apply retention bounds; completed jobs inside the freshness window
    /// are always kept.
    fn prune(&self, state: &mut QueueState, now: DateTime<Utc>) {
        let retention = &self.settings.retention;
        let window = chrono_duration(self.settings.freshness_window);

        for (target, max_age, max_count) in [
            (JobState::Completed, retention.completed_age, retention.completed_count),
            (JobState::Failed, retention.failed_age, retention.failed_count),
        ] {
            let max_age = chrono_duration(max_age);
            let mut terminal: Vec<(DateTime<Utc>, JobId)> = state
                .jobs
                .values()
                .filter(|j| j.state == target)
                .map(|j| (j.finished_at.unwrap_or(j.enqueued_at), j.id.clone()))
                .collect();
            terminal.sort();

            let excess = terminal.len().saturating_sub(max_count);
            for (i, (finished_at, id)) in terminal.into_iter().enumerate() {
                let age = now - finished_at;
                let protected = target == JobState::Completed && age < window;
                if !protected && (age >= max_age || i < excess) {
                    state.remove(&id);
                    debug!(job_id = %id, state = %target, "pruned terminal job");
                }
            }
        }
    }
}

fn dedup_matches(existing: &Option<String>, requested: &Option<String>) -> bool {
    match requested {
        None => true,
        Some(key) => existing.as_deref() == Some(key.as_str()),
    }
}

#[async_trait]
impl JobQueue for InMemoryJobQueue {
    async fn enqueue(
        &self,
        job: NewJob,
        options: EnqueueOptions,
    ) -> Result<EnqueueOutcome, QueueError> {
        let now = self.clock.now();
        let mut state = self.state()?;

        if let Some(existing) = state.jobs.get(&job.id) {
            let duplicate = match existing.state {
                JobState::Waiting | JobState::Delayed | JobState::Active => true,
                JobState::Completed => {
                    existing.is_fresh(now, self.settings.freshness_window)
                        && !options.replace_completed
                        && dedup_matches(&existing.dedup_key, &options.dedup_key)
                }
                JobState::Failed => false,
            };
            if duplicate {
                debug!(job_id = %existing.id, state = %existing.state, "enqueue deduplicated");
                return Ok(EnqueueOutcome {
                    job_id: existing.id.clone(),
                    existing: true,
                    state: existing.state,
                });
            }
        }

        let job = job.into_job(&options, self.settings.retry.max_attempts, now);
        let outcome = EnqueueOutcome {
            job_id: job.id.clone(),
            existing: false,
            state: job.state,
        };
        state.push_seq(&job.id);
        state.jobs.insert(job.id.clone(), job);
        Ok(outcome)
    }

    async fn try_lease(&self, request: &LeaseRequest) -> Result<LeaseAttempt, QueueError> {
        let now = self.clock.now();
        let mut state = self.state()?;

        Self::promote_delayed(&mut state, now);
        let stalls = self.recover_stalled_locked(&mut state, now);

        let next = state
            .jobs
            .values()
            .filter(|j| j.state == JobState::Waiting && request.accepts(&j.kind))
            .min_by_key(|j| (j.priority, state.seq.get(&j.id).copied().unwrap_or(u64::MAX)))
            .map(|j| j.id.clone());

        let Some(job) = next.and_then(|id| state.jobs.get_mut(&id)) else {
            return Ok(LeaseAttempt {
                leased: None,
                stalls,
            });
        };

        let token = LeaseToken::new();
        let expires_at = now + chrono_duration(self.settings.lease_duration);
        job.attempt += 1;
        job.state = JobState::Active;
        job.started_at = Some(now);
        job.lease = Some(LeaseInfo {
            token: token.clone(),
            worker_id: request.worker_id.clone(),
            expires_at,
        });

        Ok(LeaseAttempt {
            leased: Some(LeasedJob {
                job: job.clone(),
                token,
                expires_at,
            }),
            stalls,
        })
    }

    async fn extend_lease(
        &self,
        job_id: &JobId,
        token: &LeaseToken,
        extension: Duration,
    ) -> Result<DateTime<Utc>, QueueError> {
        let now = self.clock.now();
        let mut state = self.state()?;
        let job = state.leased_mut(job_id, token, now)?;
        let expires_at = now + chrono_duration(extension);
        if let Some(lease) = job.lease.as_mut() {
            lease.expires_at = expires_at;
        }
        Ok(expires_at)
    }

    async fn complete(&self, job_id: &JobId, token: &LeaseToken) -> Result<(), QueueError> {
        let now = self.clock.now();
        let mut state = self.state()?;
        let job = state.leased_mut(job_id, token, now)?;
        job.state = JobState::Completed;
        job.finished_at = Some(now);
        job.lease = None;
        self.prune(&mut state, now);
        Ok(())
    }

    async fn fail(
        &self,
        job_id: &JobId,
        token: &LeaseToken,
        error: &str,
        retryable: bool,
    ) -> Result<FailOutcome, QueueError> {
        let now = self.clock.now();
        let mut state = self.state()?;
        let job = state.leased_mut(job_id, token, now)?;
        job.lease = None;
        job.last_error = Some(error.to_string());

        if retryable && job.attempt < job.max_attempts {
            let delay = self.settings.retry.delay_for_attempt(job.attempt);
            let retry_at = now + chrono_duration(delay);
            job.state = JobState::Delayed;
            job.available_at = retry_at;
            let attempt = job.attempt;
            state.push_seq(job_id);
            return Ok(FailOutcome::Retrying { attempt, retry_at });
        }

        job.state = JobState::Failed;
        job.finished_at = Some(now);
        let attempts = job.attempt;
        self.prune(&mut state, now);
        Ok(FailOutcome::Exhausted { attempts })
    }

    async fn remove(&self, job_id: &JobId) -> Result<bool, QueueError> {
        let mut state = self.state()?;
        let removable = state
            .jobs
            .get(job_id)
            .is_some_and(|j| matches!(j.state, JobState::Waiting | JobState::Delayed));
        if removable {
            state.remove(job_id);
        }
        Ok(removable)
    }

    async fn get(&self, job_id: &JobId) -> Result<Option<Job>, QueueError> {
        Ok(self.state()?.jobs.get(job_id).cloned())
    }

    async fn recover_stalled(&self) -> Result<StallReport, QueueError> {
        let now = self.clock.now();
        let mut state = self.state()?;
        Ok(self.recover_stalled_locked(&mut state, now))
    }

    async fn counts(&self) -> Result<QueueCounts, QueueError> {
        let now = self.clock.now();
        let state = self.state()?;
        let mut counts = QueueCounts::default();
        for job in state.jobs.values() {
            // Due delayed jobs are reported as waiting even before promotion.
            let effective = match job.state {
                JobState::Delayed if job.is_ready(now) => JobState::Waiting,
                other => other,
            };
            counts.add(effective);
        }
        Ok(counts)
    }

    async fn list(&self, state: JobState, limit: usize) -> Result<Vec<Job>, QueueError> {
        let guard = self.state()?;
        let mut jobs: Vec<Job> = guard
            .jobs
            .values()
            .filter(|j| j.state == state)
            .cloned()
            .collect();
        jobs.sort_by_key(|j| j.enqueued_at);
        jobs.truncate(limit);
        Ok(jobs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::types::{JobKind, RetryPolicy, Retention};
    use sellerflow_core::{ManualClock, RunId, SubjectId, UnitKey};

    fn unit(subject: &str) -> UnitKey {
        UnitKey::new(SubjectId::new(subject).unwrap())
    }

    fn init_job(subject: &str) -> NewJob {
        NewJob::phased(
            JobId::from_raw(format!("{subject}-INIT")),
            "INIT",
            unit(subject),
            RunId::new(),
        )
    }

    fn settings() -> QueueSettings {
        QueueSettings {
            lease_duration: Duration::from_secs(60),
            max_stalled_count: 1,
            freshness_window: Duration::from_secs(2 * 3600),
            retry: RetryPolicy::exponential(3, Duration::from_secs(10), Duration::from_secs(600)),
            retention: Retention::default(),
        }
    }

    fn queue() -> (InMemoryJobQueue, ManualClock) {
        let clock = ManualClock::starting_now();
        (InMemoryJobQueue::new(settings(), Arc::new(clock.clone())), clock)
    }

    fn request(worker: &str) -> LeaseRequest {
        LeaseRequest::new(worker, vec!["INIT".to_string(), "BATCH".to_string()])
    }

    #[tokio::test]
    async fn enqueue_is_idempotent_while_pending() {
        let (queue, _clock) = queue();

        let first = queue.enqueue(init_job("user-42"), EnqueueOptions::default()).await.unwrap();
        let second = queue.enqueue(init_job("user-42"), EnqueueOptions::default()).await.unwrap();

        assert!(!first.existing);
        assert!(second.existing);
        assert_eq!(first.job_id, second.job_id);
        assert_eq!(second.state, JobState::Waiting);
        assert_eq!(queue.counts().await.unwrap().waiting, 1);
    }

    #[tokio::test]
    async fn completed_jobs_suppress_enqueue_inside_freshness_window() {
        let (queue, clock) = queue();
        queue.enqueue(init_job("user-42"), EnqueueOptions::default()).await.unwrap();
        let leased = queue.lease(&request("w1")).await.unwrap().unwrap();
        queue.complete(&leased.job.id, &leased.token).await.unwrap();

        clock.advance(chrono::Duration::minutes(90));
        let again = queue.enqueue(init_job("user-42"), EnqueueOptions::default()).await.unwrap();
        assert!(again.existing);
        assert_eq!(again.state, JobState::Completed);

        clock.advance(chrono::Duration::minutes(31));
        let fresh = queue.enqueue(init_job("user-42"), EnqueueOptions::default()).await.unwrap();
        assert!(!fresh.existing);
        assert_eq!(fresh.state, JobState::Waiting);
    }

    #[tokio::test]
    async fn dedup_key_and_replace_flag_override_fresh_completion() {
        let (queue, _clock) = queue();
        let options = EnqueueOptions::default().with_dedup_key("run-a");
        queue.enqueue(init_job("user-1"), options.clone()).await.unwrap();
        let leased = queue.lease(&request("w1")).await.unwrap().unwrap();
        queue.complete(&leased.job.id, &leased.token).await.unwrap();

        let same_run = queue.enqueue(init_job("user-1"), options).await.unwrap();
        assert!(same_run.existing);

        let other_run = queue
            .enqueue(init_job("user-1"), EnqueueOptions::default().with_dedup_key("run-b"))
            .await
            .unwrap();
        assert!(!other_run.existing);

        let leased = queue.lease(&request("w1")).await.unwrap().unwrap();
        queue.complete(&leased.job.id, &leased.token).await.unwrap();
        let replaced = queue
            .enqueue(init_job("user-1"), EnqueueOptions::default().replacing_completed())
            .await
            .unwrap();
        assert!(!replaced.existing);
    }

    #[tokio::test]
    async fn only_one_worker_wins_a_lease() {
        let (queue, _clock) = queue();
        queue.enqueue(init_job("user-42"), EnqueueOptions::default()).await.unwrap();

        let req_a = request("a");
        let req_b = request("b");
        let (a, b) = tokio::join!(queue.lease(&req_a), queue.lease(&req_b));
        let winners = [a.unwrap(), b.unwrap()].into_iter().flatten().count();
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn priority_then_fifo_and_phase_filtering() {
        let (queue, _clock) = queue();
        queue.enqueue(init_job("a"), EnqueueOptions::default().with_priority(5)).await.unwrap();
        queue.enqueue(init_job("b"), EnqueueOptions::default().with_priority(1)).await.unwrap();
        queue.enqueue(init_job("c"), EnqueueOptions::default().with_priority(1)).await.unwrap();

        let only_batch = LeaseRequest {
            worker_id: "w".to_string(),
            phases: vec!["BATCH".to_string()],
            include_legacy: false,
        };
        assert!(queue.lease(&only_batch).await.unwrap().is_none());

        let order: Vec<String> = [
            queue.lease(&request("w")).await.unwrap().unwrap(),
            queue.lease(&request("w")).await.unwrap().unwrap(),
            queue.lease(&request("w")).await.unwrap().unwrap(),
        ]
        .iter()
        .map(|l| l.job.id.to_string())
        .collect();
        assert_eq!(order, vec!["b-INIT", "c-INIT", "a-INIT"]);
    }

    #[tokio::test]
    async fn delayed_jobs_become_visible_after_delay() {
        let (queue, clock) = queue();
        queue
            .enqueue(init_job("a"), EnqueueOptions::default().with_delay(Duration::from_secs(30)))
            .await
            .unwrap();
        assert!(queue.lease(&request("w")).await.unwrap().is_none());

        clock.advance(chrono::Duration::seconds(30));
        assert!(queue.lease(&request("w")).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn stale_tokens_are_rejected() {
        let (queue, clock) = queue();
        queue.enqueue(init_job("a"), EnqueueOptions::default()).await.unwrap();
        let leased = queue.lease(&request("w")).await.unwrap().unwrap();

        let wrong = LeaseToken::new();
        assert!(matches!(
            queue.extend_lease(&leased.job.id, &wrong, Duration::from_secs(60)).await,
            Err(QueueError::LeaseLost(_))
        ));

        let extended = queue
            .extend_lease(&leased.job.id, &leased.token, Duration::from_secs(120))
            .await
            .unwrap();
        assert!(extended > leased.expires_at);

        clock.advance(chrono::Duration::seconds(121));
        assert!(matches!(
            queue.complete(&leased.job.id, &leased.token).await,
            Err(QueueError::LeaseLost(_))
        ));
    }

    #[tokio::test]
    async fn expired_lease_is_redelivered_with_incremented_attempt() {
        let (queue, clock) = queue();
        queue.enqueue(init_job("a"), EnqueueOptions::default()).await.unwrap();
        let first = queue.lease(&request("crashed")).await.unwrap().unwrap();
        assert_eq!(first.job.attempt, 1);

        assert!(queue.lease(&request("w2")).await.unwrap().is_none());

        clock.advance(chrono::Duration::seconds(61));
        let second = queue.lease(&request("w2")).await.unwrap().unwrap();
        assert_eq!(second.job.id, first.job.id);
        assert_eq!(second.job.attempt, 2);
        assert_eq!(second.job.stalled_count, 1);
        assert_eq!(second.job.lease.as_ref().unwrap().worker_id, "w2");
        assert_ne!(second.token, first.token);

        // The crashed worker's token no longer works.
        assert!(queue.complete(&first.job.id, &first.token).await.is_err());

        // A second stall exceeds max_stalled_count = 1.
        clock.advance(chrono::Duration::seconds(61));
        let report = queue.recover_stalled().await.unwrap();
        assert_eq!(report.failed, vec![first.job.id.clone()]);
        let failed = queue.get(&first.job.id).await.unwrap().unwrap();
        assert_eq!(failed.state, JobState::Failed);
        assert_eq!(failed.last_error.as_deref(), Some(STALLED_ERROR));
    }

    #[tokio::test]
    async fn retry_cap_bounds_total_attempts() {
        let (queue, clock) = queue();
        queue.enqueue(init_job("a"), EnqueueOptions::default()).await.unwrap();

        let mut attempts = 0;
        loop {
            clock.advance(chrono::Duration::minutes(30));
            let Some(leased) = queue.lease(&request("w")).await.unwrap() else {
                break;
            };
            attempts += 1;
            match queue.fail(&leased.job.id, &leased.token, "boom", true).await.unwrap() {
                FailOutcome::Retrying { attempt, retry_at } => {
                    assert_eq!(attempt, attempts);
                    let expected = settings().retry.delay_for_attempt(attempt);
                    assert_eq!(retry_at, clock.now() + chrono_duration(expected));
                }
                FailOutcome::Exhausted { attempts: total } => {
                    assert_eq!(total, 3);
                }
            }
        }

        assert_eq!(attempts, 3);
        let job = queue.get(&JobId::from("a-INIT")).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Failed);
        assert_eq!(job.last_error.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn fatal_failures_skip_retries() {
        let (queue, _clock) = queue();
        queue.enqueue(init_job("a"), EnqueueOptions::default()).await.unwrap();
        let leased = queue.lease(&request("w")).await.unwrap().unwrap();

        let outcome = queue.fail(&leased.job.id, &leased.token, "unknown phase", false).await;
        assert_eq!(outcome.unwrap(), FailOutcome::Exhausted { attempts: 1 });
    }

    #[tokio::test]
    async fn only_unleased_jobs_can_be_removed() {
        let (queue, _clock) = queue();
        queue.enqueue(init_job("a"), EnqueueOptions::default()).await.unwrap();
        queue.enqueue(init_job("b"), EnqueueOptions::default()).await.unwrap();
        let leased = queue.lease(&request("w")).await.unwrap().unwrap();

        assert!(!queue.remove(&leased.job.id).await.unwrap());
        assert!(queue.remove(&JobId::from("b-INIT")).await.unwrap());
        assert!(!queue.remove(&JobId::from("missing-INIT")).await.unwrap());
    }

    #[tokio::test]
    async fn legacy_jobs_lease_only_when_requested() {
        let (queue, _clock) = queue();
        let legacy = NewJob {
            kind: JobKind::Legacy,
            run_id: None,
            ..init_job("old")
        };
        queue.enqueue(legacy, EnqueueOptions::default()).await.unwrap();

        let mut strict = request("w");
        strict.include_legacy = false;
        assert!(queue.lease(&strict).await.unwrap().is_none());
        let leased = queue.lease(&request("w")).await.unwrap().unwrap();
        assert_eq!(leased.job.kind, JobKind::Legacy);
    }

    #[tokio::test]
    async fn retention_never_prunes_inside_freshness_window() {
        let clock = ManualClock::starting_now();
        let mut settings = settings();
        settings.retention = Retention {
            completed_age: Duration::from_secs(60),
            completed_count: 0,
            failed_age: Duration::from_secs(60),
            failed_count: 0,
        };
        let queue = InMemoryJobQueue::new(settings, Arc::new(clock.clone()));

        queue.enqueue(init_job("a"), EnqueueOptions::default()).await.unwrap();
        let leased = queue.lease(&request("w")).await.unwrap().unwrap();
        queue.complete(&leased.job.id, &leased.token).await.unwrap();
        assert!(queue.get(&leased.job.id).await.unwrap().is_some());

        clock.advance(chrono::Duration::hours(3));
        queue.enqueue(init_job("b"), EnqueueOptions::default()).await.unwrap();
        let leased_b = queue.lease(&request("w")).await.unwrap().unwrap();
        queue.complete(&leased_b.job.id, &leased_b.token).await.unwrap();

        assert!(queue.get(&JobId::from("a-INIT")).await.unwrap().is_none());
        assert!(queue.get(&JobId::from("b-INIT")).await.unwrap().is_some());
    }
}
