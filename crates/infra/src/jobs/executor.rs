//! Worker pool: leases phase jobs, runs their handlers and chains phases.
//!
//! Per leased job:
//!
//! 1. resolve the phase (legacy jobs run as the first phase)
//! 2. record `running` for the job and its unit
//! 3. keep the lease alive from a side task while the handler runs
//! 4. on success enqueue the next phase (or finish the unit), then complete
//! 5. on failure hand the job back to the queue's retry/backoff
//!
//! Jobs that stall recovery fails permanently never reach a handler; the
//! pool records them as failed units whenever a lease or stall scan reports
//! them.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::{AbortHandle, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use sellerflow_core::{Clock, JobId, Phase, PhaseError, PhaseRegistry};

use super::handler::{PhaseContext, PhaseHandler, PhaseOutcome};
use super::lease::{LeaseKeeper, LeaseKeeperConfig};
use super::store::{JobQueue, QueueError, STALLED_ERROR};
use super::types::{
    EnqueueOptions, FailOutcome, Job, JobKind, LeaseRequest, LeaseToken, LeasedJob, NewJob,
    RetryPolicy, StallReport,
};
use crate::status::{StatusPatch, StatusRecorder, StatusState};

/// Worker pool configuration.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Name for logging; slot ids are `{name}-{n}`.
    pub name: String,
    /// Concurrent job executions.
    pub concurrency: usize,
    /// Sleep between empty lease polls.
    pub poll_interval: Duration,
    /// How often the pool scans for stalled jobs.
    pub stall_check_interval: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            name: "worker".to_string(),
            concurrency: 4,
            poll_interval: Duration::from_secs(1),
            stall_check_interval: Duration::from_secs(30),
        }
    }
}

impl WorkerPoolConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }
}

/// Pool runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ExecutorStats {
    pub jobs_processed: u64,
    pub jobs_succeeded: u64,
    /// Successes that enqueued a next phase.
    pub jobs_chained: u64,
    pub jobs_retried: u64,
    pub jobs_failed: u64,
    pub leases_lost: u64,
    pub current_running: usize,
    pub uptime_secs: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error(transparent)]
    Phase(#[from] PhaseError),
}

/// What processing one leased job led to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    /// Phase succeeded and the next phase's job was enqueued.
    Advanced { next_phase: String, next_job_id: JobId },
    /// Terminal phase succeeded; the unit is complete.
    UnitCompleted,
    /// Attempt failed and will be re-delivered after backoff.
    Retrying { attempt: u32, retry_at: DateTime<Utc> },
    /// Attempt failed permanently; the unit is marked failed.
    Failed { attempts: u32 },
    /// The lease was taken over; the outcome was discarded.
    LeaseLost,
}

/// Executes leased phase jobs with registered handlers.
pub struct WorkerPool {
    queue: Arc<dyn JobQueue>,
    status: StatusRecorder,
    registry: Arc<PhaseRegistry>,
    clock: Arc<dyn Clock>,
    handlers: HashMap<String, Arc<dyn PhaseHandler>>,
    lease: LeaseKeeperConfig,
    /// Backoff for transient queue errors while finishing a job.
    infra_retry: RetryPolicy,
    stats: Arc<Mutex<ExecutorStats>>,
}

impl core::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let mut phases: Vec<&String> = self.handlers.keys().collect();
        phases.sort();
        f.debug_struct("WorkerPool")
            .field("handlers", &phases)
            .field("lease", &self.lease)
            .finish_non_exhaustive()
    }
}

impl WorkerPool {
    pub fn new(
        queue: Arc<dyn JobQueue>,
        status: StatusRecorder,
        registry: Arc<PhaseRegistry>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            queue,
            status,
            registry,
            clock,
            handlers: HashMap::new(),
            lease: LeaseKeeperConfig::default(),
            infra_retry: RetryPolicy::exponential(3, Duration::from_millis(200), Duration::from_secs(5)),
            stats: Arc::new(Mutex::new(ExecutorStats::default())),
        }
    }

    pub fn with_lease_config(mut self, lease: LeaseKeeperConfig) -> Self {
        self.lease = lease;
        self
    }

    pub fn with_infra_retry(mut self, policy: RetryPolicy) -> Self {
        self.infra_retry = policy;
        self
    }

    /// Register the handler for a phase. The phase must exist in the registry.
    pub fn register_handler(
        &mut self,
        phase: &str,
        handler: impl PhaseHandler + 'static,
    ) -> Result<(), WorkerError> {
        let phase = self.registry.resolve(phase)?;
        self.handlers.insert(phase.name.clone(), Arc::new(handler));
        Ok(())
    }

    /// Register one handler for every phase.
    pub fn register_all(&mut self, handler: Arc<dyn PhaseHandler>) {
        for name in self.registry.names() {
            self.handlers.insert(name, Arc::clone(&handler));
        }
    }

    pub fn stats(&self) -> ExecutorStats {
        self.stats.lock().map(|s| s.clone()).unwrap_or_default()
    }

    /// Lease request covering every phase with a handler.
    pub fn lease_request(&self, worker_id: impl Into<String>) -> LeaseRequest {
        let phases = self
            .registry
            .names()
            .into_iter()
            .filter(|p| self.handlers.contains_key(p))
            .collect();
        LeaseRequest::new(worker_id, phases)
    }

    /// Lease and process at most one job.
    pub async fn run_once(&self, worker_id: &str) -> Result<Option<JobOutcome>, WorkerError> {
        let Some(leased) = self.lease_next(&self.lease_request(worker_id)).await? else {
            return Ok(None);
        };
        debug!(worker = worker_id, job_id = %leased.job.id, attempt = leased.job.attempt, "leased job");
        self.process(leased).await.map(Some)
    }

    async fn lease_next(&self, request: &LeaseRequest) -> Result<Option<LeasedJob>, WorkerError> {
        let attempt = self.queue.try_lease(request).await?;
        self.record_stalls(&attempt.stalls).await;
        Ok(attempt.leased)
    }

    /// Scan for expired leases and record the jobs that stalled too often.
    pub async fn recover_stalled(&self) -> Result<StallReport, WorkerError> {
        let report = self.queue.recover_stalled().await?;
        self.record_stalls(&report).await;
        Ok(report)
    }

    async fn record_stalls(&self, report: &StallReport) {
        if report.is_empty() {
            return;
        }
        warn!(
            requeued = report.requeued.len(),
            failed = report.failed.len(),
            "recovered stalled jobs"
        );
        for job_id in &report.failed {
            self.record_stalled_failure(job_id).await;
        }
    }

    async fn record_stalled_failure(&self, job_id: &JobId) {
        let job = match self.queue.get(job_id).await {
            Ok(job) => job,
            Err(e) => {
                warn!(job_id = %job_id, error = %e, "could not load stalled job");
                None
            }
        };
        let (parent_id, phase, attempt) = match &job {
            Some(job) => (
                job.unit.parent_id(),
                job.phase().unwrap_or(self.registry.first().name.as_str()).to_string(),
                Some(job.attempt),
            ),
            None => match self.registry.parse_job_id(job_id) {
                Ok((parent, phase)) => (parent.to_string(), phase.name.clone(), None),
                Err(_) => {
                    warn!(job_id = %job_id, "stalled job no longer known; status not updated");
                    return;
                }
            },
        };

        let now = self.clock.now();
        error!(job_id = %job_id, unit = %parent_id, phase = %phase, "phase stalled too often; failed permanently");
        self.update_stats(|s| s.jobs_failed += 1);
        self.status
            .record(
                job_id.as_str(),
                StatusPatch {
                    phase: Some(phase.clone()),
                    parent_id: Some(parent_id.clone()),
                    attempt,
                    failed_at: Some(now),
                    error: Some(STALLED_ERROR.to_string()),
                    retrying: Some(false),
                    ..StatusPatch::job(StatusState::Failed)
                },
            )
            .await;
        self.status
            .record(
                &parent_id,
                StatusPatch {
                    phase: Some(phase.clone()),
                    failed_phase: Some(phase),
                    failed_at: Some(now),
                    error: Some(STALLED_ERROR.to_string()),
                    retrying: Some(false),
                    attempt,
                    ..StatusPatch::unit(StatusState::Failed)
                },
            )
            .await;
    }

    /// Run one leased job to its outcome.
    pub async fn process(&self, leased: LeasedJob) -> Result<JobOutcome, WorkerError> {
        self.update_stats(|s| s.current_running += 1);
        let result = self.process_inner(leased).await;
        self.update_stats(|s| {
            s.current_running = s.current_running.saturating_sub(1);
            s.jobs_processed += 1;
            match &result {
                Ok(JobOutcome::Advanced { .. }) => {
                    s.jobs_succeeded += 1;
                    s.jobs_chained += 1;
                }
                Ok(JobOutcome::UnitCompleted) => s.jobs_succeeded += 1,
                Ok(JobOutcome::Retrying { .. }) => s.jobs_retried += 1,
                Ok(JobOutcome::Failed { .. }) => s.jobs_failed += 1,
                Ok(JobOutcome::LeaseLost) => s.leases_lost += 1,
                Err(_) => {}
            }
        });
        result
    }

    async fn process_inner(&self, leased: LeasedJob) -> Result<JobOutcome, WorkerError> {
        let LeasedJob { job, token, .. } = leased;

        // Legacy jobs carry no phase and run as the first one.
        let phase_name = match &job.kind {
            JobKind::Phased { phase } => phase.clone(),
            JobKind::Legacy => self.registry.first().name.clone(),
        };
        let Some(phase) = self.registry.get(&phase_name).cloned() else {
            let reason = format!("unknown phase {phase_name}");
            return self.fail_fatal(&job, &token, &phase_name, reason).await;
        };
        let Some(handler) = self.handlers.get(&phase.name).cloned() else {
            let reason = format!("no handler registered for phase {}", phase.name);
            return self.fail_fatal(&job, &token, &phase.name, reason).await;
        };

        let started_at = self.clock.now();
        self.record_running(&job, &phase, started_at).await;
        info!(job_id = %job.id, phase = %phase.name, attempt = job.attempt, "phase started");

        let keeper = LeaseKeeper::spawn(
            Arc::clone(&self.queue),
            job.id.clone(),
            token.clone(),
            self.lease.clone(),
        );
        let ctx = PhaseContext {
            job_id: job.id.clone(),
            subject_id: job.unit.subject_id.clone(),
            region: job.unit.region.clone(),
            phase: phase.name.clone(),
            payload: job.payload.clone(),
            meta: job.meta.clone(),
            attempt: job.attempt,
        };
        let result = run_handler(handler, ctx).await;
        let keeper_report = keeper.stop().await;

        if keeper_report.lost {
            warn!(job_id = %job.id, phase = %phase.name, "lease lost while running; discarding outcome");
            return Ok(JobOutcome::LeaseLost);
        }

        match result {
            Ok(outcome) => self.on_success(&job, &token, &phase, outcome).await,
            Err(reason) => self.on_failure(&job, &token, &phase.name, reason).await,
        }
    }

    async fn on_success(
        &self,
        job: &Job,
        token: &LeaseToken,
        phase: &Phase,
        outcome: PhaseOutcome,
    ) -> Result<JobOutcome, WorkerError> {
        let parent_id = job.unit.parent_id();

        let Some(next) = self.registry.next_phase(&phase.name).cloned() else {
            if !self.finish(job, token).await? {
                return Ok(JobOutcome::LeaseLost);
            }
            let now = self.clock.now();
            self.record_job_completed(job, now, outcome.summary.clone()).await;
            self.status
                .record(
                    &parent_id,
                    StatusPatch {
                        phase: Some(phase.name.clone()),
                        progress: Some(100),
                        completed_at: Some(now),
                        retrying: Some(false),
                        clear_error: true,
                        summary: outcome.summary,
                        ..StatusPatch::unit(StatusState::Completed)
                    },
                )
                .await;
            info!(job_id = %job.id, unit = %parent_id, "unit completed");
            return Ok(JobOutcome::UnitCompleted);
        };

        let mut payload = job.payload.clone();
        payload.extend(outcome.data_for_next_phase);
        let next_job_id = self.registry.job_id(&parent_id, &next);
        let new_job = NewJob {
            id: next_job_id.clone(),
            kind: JobKind::phased(next.name.clone()),
            unit: job.unit.clone(),
            run_id: job.run_id,
            payload,
            meta: job.meta.clone(),
        };
        let mut options = EnqueueOptions::default().with_priority(job.priority);
        if let Some(run_id) = job.run_id {
            options = options.with_dedup_key(run_id.to_string());
        }

        let enqueued = self
            .with_retry(|| self.queue.enqueue(new_job.clone(), options.clone()))
            .await;
        if let Err(e) = enqueued {
            error!(job_id = %job.id, next_job_id = %next_job_id, error = %e, "failed to enqueue next phase");
            let reason = format!("failed to enqueue next phase {}: {e}", next.name);
            return self.on_failure(job, token, &phase.name, reason).await;
        }

        if !self.finish(job, token).await? {
            return Ok(JobOutcome::LeaseLost);
        }

        let now = self.clock.now();
        self.record_job_completed(job, now, outcome.summary).await;
        let progress = self.registry.overall_progress_percent(&next.name, 0.0)?;
        self.status
            .record(
                &parent_id,
                StatusPatch {
                    phase: Some(next.name.clone()),
                    current_job_id: Some(next_job_id.to_string()),
                    progress: Some(progress),
                    retrying: Some(false),
                    clear_error: true,
                    ..StatusPatch::unit(StatusState::Running)
                },
            )
            .await;
        info!(job_id = %job.id, next_job_id = %next_job_id, progress, "phase chained");

        Ok(JobOutcome::Advanced {
            next_phase: next.name,
            next_job_id,
        })
    }

    /// Complete the job. `Ok(false)` when the lease was lost meanwhile.
    async fn finish(&self, job: &Job, token: &LeaseToken) -> Result<bool, WorkerError> {
        match self.with_retry(|| self.queue.complete(&job.id, token)).await {
            Ok(()) => Ok(true),
            Err(QueueError::LeaseLost(_)) => {
                warn!(job_id = %job.id, "lease lost before completion");
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn on_failure(
        &self,
        job: &Job,
        token: &LeaseToken,
        phase: &str,
        reason: String,
    ) -> Result<JobOutcome, WorkerError> {
        self.fail_job(job, token, phase, reason, true).await
    }

    /// Unknown phase or missing handler: deployment mismatch, never retried.
    async fn fail_fatal(
        &self,
        job: &Job,
        token: &LeaseToken,
        phase: &str,
        reason: String,
    ) -> Result<JobOutcome, WorkerError> {
        error!(job_id = %job.id, phase, reason = %reason, "fatal phase error");
        self.fail_job(job, token, phase, reason, false).await
    }

    async fn fail_job(
        &self,
        job: &Job,
        token: &LeaseToken,
        phase: &str,
        reason: String,
        retryable: bool,
    ) -> Result<JobOutcome, WorkerError> {
        let failed = self
            .with_retry(|| self.queue.fail(&job.id, token, &reason, retryable))
            .await;
        let outcome = match failed {
            Ok(outcome) => outcome,
            Err(QueueError::LeaseLost(_)) => {
                warn!(job_id = %job.id, "lease lost before failure could be recorded");
                return Ok(JobOutcome::LeaseLost);
            }
            Err(e) => return Err(e.into()),
        };

        let now = self.clock.now();
        let parent_id = job.unit.parent_id();
        let retrying = matches!(outcome, FailOutcome::Retrying { .. });
        self.status
            .record(
                job.id.as_str(),
                StatusPatch {
                    phase: Some(phase.to_string()),
                    parent_id: Some(parent_id.clone()),
                    attempt: Some(job.attempt),
                    failed_at: Some(now),
                    error: Some(reason.clone()),
                    retrying: Some(retrying),
                    ..StatusPatch::job(StatusState::Failed)
                },
            )
            .await;

        match outcome {
            FailOutcome::Retrying { attempt, retry_at } => {
                warn!(job_id = %job.id, phase, attempt, %retry_at, error = %reason, "phase failed; retrying");
                self.status
                    .record(
                        &parent_id,
                        StatusPatch {
                            kind: Some(crate::status::StatusKind::Unit),
                            error: Some(reason),
                            retrying: Some(true),
                            attempt: Some(attempt),
                            ..Default::default()
                        },
                    )
                    .await;
                Ok(JobOutcome::Retrying { attempt, retry_at })
            }
            FailOutcome::Exhausted { attempts } => {
                error!(job_id = %job.id, phase, attempts, error = %reason, "phase failed permanently");
                self.status
                    .record(
                        &parent_id,
                        StatusPatch {
                            phase: Some(phase.to_string()),
                            failed_phase: Some(phase.to_string()),
                            failed_at: Some(now),
                            error: Some(reason),
                            retrying: Some(false),
                            attempt: Some(attempts),
                            ..StatusPatch::unit(StatusState::Failed)
                        },
                    )
                    .await;
                Ok(JobOutcome::Failed { attempts })
            }
        }
    }

    async fn record_running(&self, job: &Job, phase: &Phase, now: DateTime<Utc>) {
        let parent_id = job.unit.parent_id();
        self.status
            .record(
                job.id.as_str(),
                StatusPatch {
                    subject_id: Some(job.unit.subject_id.to_string()),
                    region: job.unit.region.clone(),
                    phase: Some(phase.name.clone()),
                    parent_id: Some(parent_id.clone()),
                    run_id: job.run_id,
                    attempt: Some(job.attempt),
                    started_at: Some(now),
                    enqueued_at: Some(job.enqueued_at),
                    retrying: Some(false),
                    ..StatusPatch::job(StatusState::Running)
                },
            )
            .await;

        let progress = self
            .registry
            .overall_progress_percent(&phase.name, 0.0)
            .unwrap_or_default();
        self.status
            .record(
                &parent_id,
                StatusPatch {
                    subject_id: Some(job.unit.subject_id.to_string()),
                    region: job.unit.region.clone(),
                    phase: Some(phase.name.clone()),
                    current_job_id: Some(job.id.to_string()),
                    run_id: job.run_id,
                    progress: Some(progress),
                    started_at: self.registry.is_first(&phase.name).then_some(now),
                    ..StatusPatch::unit(StatusState::Running)
                },
            )
            .await;
    }

    async fn record_job_completed(
        &self,
        job: &Job,
        now: DateTime<Utc>,
        summary: Option<serde_json::Value>,
    ) {
        self.status
            .record(
                job.id.as_str(),
                StatusPatch {
                    progress: Some(100),
                    completed_at: Some(now),
                    retrying: Some(false),
                    summary,
                    ..StatusPatch::job(StatusState::Completed)
                },
            )
            .await;
    }

    /// Retry transient queue errors with backoff; other errors return at once.
    async fn with_retry<T, F, Fut>(&self, mut op: F) -> Result<T, QueueError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, QueueError>>,
    {
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && self.infra_retry.should_retry(attempt) => {
                    let delay = self.infra_retry.delay_for_attempt(attempt);
                    warn!(attempt, error = %e, ?delay, "transient queue error; retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn update_stats(&self, f: impl FnOnce(&mut ExecutorStats)) {
        if let Ok(mut stats) = self.stats.lock() {
            f(&mut stats);
        }
    }

    /// Start `config.concurrency` slots plus the stall checker.
    pub fn spawn(self, config: WorkerPoolConfig) -> WorkerPoolHandle {
        let pool = Arc::new(self);
        let cancel = CancellationToken::new();
        let mut tasks = JoinSet::new();
        let started = Instant::now();

        for slot in 0..config.concurrency.max(1) {
            let worker_id = format!("{}-{slot}", config.name);
            tasks.spawn(slot_loop(
                Arc::clone(&pool),
                worker_id,
                config.poll_interval,
                cancel.clone(),
            ));
        }
        tasks.spawn(stall_loop(
            Arc::clone(&pool),
            config.stall_check_interval,
            cancel.clone(),
        ));

        info!(pool = %config.name, concurrency = config.concurrency, "worker pool started");
        WorkerPoolHandle {
            name: config.name,
            cancel,
            tasks,
            stats: Arc::clone(&pool.stats),
            started,
        }
    }
}

/// Runs the handler on its own task so a panic becomes a failed attempt.
/// The task is aborted if this future is dropped.
async fn run_handler(handler: Arc<dyn PhaseHandler>, ctx: PhaseContext) -> Result<PhaseOutcome, String> {
    struct AbortOnDrop(AbortHandle);
    impl Drop for AbortOnDrop {
        fn drop(&mut self) {
            self.0.abort();
        }
    }

    let task = tokio::spawn(async move { handler.execute(ctx).await });
    let _guard = AbortOnDrop(task.abort_handle());
    match task.await {
        Ok(Ok(outcome)) if outcome.success => Ok(outcome),
        Ok(Ok(outcome)) => Err(outcome.error_message()),
        Ok(Err(e)) => Err(format!("{e:#}")),
        Err(e) if e.is_panic() => Err("phase handler panicked".to_string()),
        Err(e) => Err(format!("phase handler aborted: {e}")),
    }
}

async fn slot_loop(
    pool: Arc<WorkerPool>,
    worker_id: String,
    poll_interval: Duration,
    cancel: CancellationToken,
) {
    debug!(worker = %worker_id, "worker slot started");
    let request = pool.lease_request(worker_id.clone());

    while !cancel.is_cancelled() {
        match pool.lease_next(&request).await {
            Ok(Some(leased)) => {
                let job_id = leased.job.id.clone();
                if let Err(e) = pool.process(leased).await {
                    error!(worker = %worker_id, job_id = %job_id, error = %e, "job processing failed");
                }
                continue;
            }
            Ok(None) => {}
            Err(e) => {
                error!(worker = %worker_id, error = %e, "failed to lease job");
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(poll_interval) => {}
        }
    }
    debug!(worker = %worker_id, "worker slot stopped");
}

async fn stall_loop(pool: Arc<WorkerPool>, interval: Duration, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        if let Err(e) = pool.recover_stalled().await {
            error!(error = %e, "stall check failed");
        }
    }
}

/// Handle to control a running pool.
#[derive(Debug)]
pub struct WorkerPoolHandle {
    name: String,
    cancel: CancellationToken,
    tasks: JoinSet<()>,
    stats: Arc<Mutex<ExecutorStats>>,
    started: Instant,
}

impl WorkerPoolHandle {
    /// Get current pool statistics.
    pub fn stats(&self) -> ExecutorStats {
        let mut stats = self.stats.lock().map(|s| s.clone()).unwrap_or_default();
        stats.uptime_secs = self.started.elapsed().as_secs();
        stats
    }

    /// Stop leasing, give in-flight jobs `grace` to finish, then abort them.
    ///
    /// Returns `true` when every slot drained within the grace period. An
    /// aborted job keeps its lease until expiry and is re-delivered by stall
    /// recovery.
    pub async fn shutdown(mut self, grace: Duration) -> bool {
        info!(pool = %self.name, "worker pool stopping");
        self.cancel.cancel();

        let drained = tokio::time::timeout(grace, async {
            while self.tasks.join_next().await.is_some() {}
        })
        .await
        .is_ok();

        if !drained {
            let in_flight = self.stats().current_running;
            warn!(pool = %self.name, in_flight, "grace period elapsed; aborting in-flight jobs");
            self.tasks.abort_all();
            while self.tasks.join_next().await.is_some() {}
        }
        info!(pool = %self.name, drained, "worker pool stopped");
        drained
    }
}
