//! Periodic lease renewal for long-running phase jobs.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use sellerflow_core::JobId;

use super::store::{JobQueue, QueueError};
use super::types::{LeaseToken, RetryPolicy};

/// Lease keeper configuration.
#[derive(Debug, Clone)]
pub struct LeaseKeeperConfig {
    /// New expiry is `now + lease_duration` on every renewal.
    pub lease_duration: Duration,
    pub renew_interval: Duration,
    /// Extension attempts per renewal cycle.
    pub max_retries: u32,
    /// Consecutive failed cycles after which failures are logged as errors.
    pub escalate_after: u32,
    /// Backoff between attempts inside one cycle.
    pub backoff: RetryPolicy,
}

impl Default for LeaseKeeperConfig {
    fn default() -> Self {
        Self {
            lease_duration: Duration::from_secs(2 * 3600),
            renew_interval: Duration::from_secs(15 * 60),
            max_retries: 3,
            escalate_after: 2,
            backoff: RetryPolicy::exponential(3, Duration::from_secs(1), Duration::from_secs(30)),
        }
    }
}

/// What happened while the keeper ran.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LeaseKeeperReport {
    pub renewals: u32,
    pub failed_cycles: u32,
    /// The queue rejected the token; the job belongs to someone else now.
    pub lost: bool,
}

/// Side task keeping a job's lease alive while its handler runs.
///
/// Dropping the keeper cancels the renewal loop; [`LeaseKeeper::stop`] also
/// waits for it and returns the report.
#[derive(Debug)]
pub struct LeaseKeeper {
    cancel: CancellationToken,
    lost: Arc<AtomicBool>,
    join: Option<JoinHandle<LeaseKeeperReport>>,
}

impl LeaseKeeper {
    pub fn spawn(
        queue: Arc<dyn JobQueue>,
        job_id: JobId,
        token: LeaseToken,
        config: LeaseKeeperConfig,
    ) -> Self {
        let cancel = CancellationToken::new();
        let lost = Arc::new(AtomicBool::new(false));

        let join = tokio::spawn(renew_loop(
            queue,
            job_id,
            token,
            config,
            cancel.clone(),
            Arc::clone(&lost),
        ));

        Self {
            cancel,
            lost,
            join: Some(join),
        }
    }

    /// Whether the lease has been lost so far.
    pub fn is_lost(&self) -> bool {
        self.lost.load(Ordering::SeqCst)
    }

    pub async fn stop(mut self) -> LeaseKeeperReport {
        self.cancel.cancel();
        let Some(join) = self.join.take() else {
            return LeaseKeeperReport::default();
        };
        match join.await {
            Ok(report) => report,
            Err(e) => {
                error!(error = %e, "lease keeper task failed");
                LeaseKeeperReport {
                    lost: self.is_lost(),
                    ..Default::default()
                }
            }
        }
    }
}

impl Drop for LeaseKeeper {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn renew_loop(
    queue: Arc<dyn JobQueue>,
    job_id: JobId,
    token: LeaseToken,
    config: LeaseKeeperConfig,
    cancel: CancellationToken,
    lost: Arc<AtomicBool>,
) -> LeaseKeeperReport {
    let mut report = LeaseKeeperReport::default();
    let mut consecutive_failures = 0u32;
    let mut ticker = tokio::time::interval_at(
        Instant::now() + config.renew_interval,
        config.renew_interval,
    );
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        match renew_cycle(queue.as_ref(), &job_id, &token, &config, &cancel).await {
            Ok(Some(expires_at)) => {
                consecutive_failures = 0;
                report.renewals += 1;
                debug!(job_id = %job_id, %expires_at, "lease renewed");
            }
            Ok(None) => break,
            Err(QueueError::LeaseLost(_)) | Err(QueueError::NotFound(_)) => {
                error!(job_id = %job_id, "lease lost; job may be re-delivered to another worker");
                report.lost = true;
                lost.store(true, Ordering::SeqCst);
                break;
            }
            Err(e) => {
                consecutive_failures += 1;
                report.failed_cycles += 1;
                if consecutive_failures >= config.escalate_after {
                    error!(
                        job_id = %job_id,
                        consecutive_failures,
                        error = %e,
                        "lease renewal keeps failing; lease may expire"
                    );
                } else {
                    warn!(job_id = %job_id, consecutive_failures, error = %e, "lease renewal failed");
                }
            }
        }
    }

    report
}

/// One renewal cycle. `Ok(None)` means cancelled mid-cycle.
async fn renew_cycle(
    queue: &dyn JobQueue,
    job_id: &JobId,
    token: &LeaseToken,
    config: &LeaseKeeperConfig,
    cancel: &CancellationToken,
) -> Result<Option<DateTime<Utc>>, QueueError> {
    let attempts = config.max_retries.max(1);
    let mut attempt = 1;
    loop {
        match queue.extend_lease(job_id, token, config.lease_duration).await {
            Ok(expires_at) => return Ok(Some(expires_at)),
            Err(e) if attempt >= attempts || !e.is_transient() => {
                return Err(e);
            }
            Err(e) => {
                let delay = config.backoff.delay_for_attempt(attempt);
                debug!(job_id = %job_id, attempt, error = %e, ?delay, "retrying lease extension");
                tokio::select! {
                    _ = cancel.cancelled() => return Ok(None),
                    _ = tokio::time::sleep(delay) => {}
                }
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::store::InMemoryJobQueue;
    use crate::jobs::types::{EnqueueOptions, LeaseRequest, NewJob, QueueSettings};
    use sellerflow_core::{Clock, ManualClock, RunId, SubjectId, UnitKey};

    async fn leased_queue() -> (Arc<InMemoryJobQueue>, ManualClock, crate::jobs::LeasedJob) {
        let clock = ManualClock::starting_now();
        let settings = QueueSettings {
            lease_duration: Duration::from_secs(60),
            ..Default::default()
        };
        let queue = InMemoryJobQueue::arc(settings, Arc::new(clock.clone()));
        let unit = UnitKey::new(SubjectId::new("user-1").unwrap());
        queue
            .enqueue(
                NewJob::phased(JobId::from("user-1-INIT"), "INIT", unit, RunId::new()),
                EnqueueOptions::default(),
            )
            .await
            .unwrap();
        let leased = queue
            .lease(&LeaseRequest::new("w1", vec!["INIT".to_string()]))
            .await
            .unwrap()
            .unwrap();
        (queue, clock, leased)
    }

    fn config() -> LeaseKeeperConfig {
        LeaseKeeperConfig {
            lease_duration: Duration::from_secs(60),
            renew_interval: Duration::from_secs(10),
            ..Default::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn keeper_pushes_expiry_forward() {
        let (queue, clock, leased) = leased_queue().await;
        let keeper = LeaseKeeper::spawn(
            queue.clone(),
            leased.job.id.clone(),
            leased.token.clone(),
            config(),
        );

        clock.advance(chrono::Duration::seconds(50));
        tokio::time::sleep(Duration::from_secs(11)).await;

        let job = queue.get(&leased.job.id).await.unwrap().unwrap();
        let expires_at = job.lease.unwrap().expires_at;
        assert_eq!(expires_at, clock.now() + chrono::Duration::seconds(60));

        let report = keeper.stop().await;
        assert_eq!(report.renewals, 1);
        assert!(!report.lost);
    }

    #[tokio::test(start_paused = true)]
    async fn keeper_stops_when_lease_is_taken_over() {
        let (queue, clock, leased) = leased_queue().await;
        let keeper = LeaseKeeper::spawn(
            queue.clone(),
            leased.job.id.clone(),
            leased.token.clone(),
            config(),
        );

        clock.advance(chrono::Duration::seconds(61));
        queue.recover_stalled().await.unwrap();
        tokio::time::sleep(Duration::from_secs(11)).await;

        assert!(keeper.is_lost());
        let report = keeper.stop().await;
        assert!(report.lost);
        assert_eq!(report.renewals, 0);
    }
}
