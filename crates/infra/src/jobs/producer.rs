//! Producer: enqueues the first phase of logical units.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value as JsonValue};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use sellerflow_core::{Clock, JobId, PhaseRegistry, RunId, UnitKey};

use super::store::{JobQueue, QueueError};
use super::types::{chrono_duration, EnqueueOptions, JobState, NewJob};
use crate::status::{StatusPatch, StatusRecord, StatusRecorder, StatusState};

#[derive(Debug, Clone, thiserror::Error)]
pub enum ProducerError {
    #[error(transparent)]
    Queue(#[from] QueueError),
}

/// Result of [`Producer::enqueue_unit`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EnqueueUnitOutcome {
    pub job_id: JobId,
    /// The unit already had an in-flight or fresh chain.
    pub existing: bool,
    pub state: JobState,
}

/// Batching for [`Producer::enqueue_many`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchOptions {
    pub batch_size: usize,
    pub delay_between_batches: Duration,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            batch_size: 50,
            delay_between_batches: Duration::from_millis(250),
        }
    }
}

/// Aggregated result of a bulk enqueue. One unit's failure never aborts the
/// others.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BulkEnqueueReport {
    pub enqueued: usize,
    pub skipped: usize,
    pub failed: usize,
    /// `(unit, reason)` for every failed unit.
    pub errors: Vec<(String, String)>,
}

impl BulkEnqueueReport {
    pub fn total(&self) -> usize {
        self.enqueued + self.skipped + self.failed
    }

    fn record(&mut self, unit: &UnitKey, result: Result<EnqueueUnitOutcome, ProducerError>) {
        match result {
            Ok(outcome) if outcome.existing => self.skipped += 1,
            Ok(_) => self.enqueued += 1,
            Err(e) => {
                self.failed += 1;
                self.errors.push((unit.to_string(), e.to_string()));
            }
        }
    }
}

/// Enqueues units at their first phase, deduplicating against in-flight and
/// recently completed chains.
///
/// Concurrent calls for the same unit are safe: the queue's atomic
/// add-if-absent decides the winner and the loser sees `existing = true`.
#[derive(Clone)]
pub struct Producer {
    queue: Arc<dyn JobQueue>,
    status: StatusRecorder,
    registry: Arc<PhaseRegistry>,
    clock: Arc<dyn Clock>,
    freshness_window: Duration,
}

impl core::fmt::Debug for Producer {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Producer")
            .field("phases", &self.registry.names())
            .field("freshness_window", &self.freshness_window)
            .finish_non_exhaustive()
    }
}

impl Producer {
    pub fn new(
        queue: Arc<dyn JobQueue>,
        status: StatusRecorder,
        registry: Arc<PhaseRegistry>,
        clock: Arc<dyn Clock>,
        freshness_window: Duration,
    ) -> Self {
        Self {
            queue,
            status,
            registry,
            clock,
            freshness_window,
        }
    }

    pub fn registry(&self) -> &PhaseRegistry {
        &self.registry
    }

    /// Enqueue the first phase of `unit`.
    ///
    /// The unit's status record is consulted before the queue because a
    /// completed chain may already be pruned from the queue while still
    /// inside the freshness window. A status read failure only skips that
    /// check; queue failures propagate.
    pub async fn enqueue_unit(
        &self,
        unit: UnitKey,
        meta: Map<String, JsonValue>,
    ) -> Result<EnqueueUnitOutcome, ProducerError> {
        let now = self.clock.now();
        let parent_id = unit.parent_id();
        let first = self.registry.first();
        let job_id = self.registry.job_id(&parent_id, first);

        let mut retrigger = false;
        match self.status.get(&parent_id).await {
            Ok(Some(record)) => {
                if let Some(existing) = self.existing_chain(&record, &job_id, now).await? {
                    debug!(unit = %parent_id, job_id = %existing.job_id, "unit already has a chain");
                    return Ok(existing);
                }
                retrigger = record.status == StatusState::Failed;
            }
            Ok(None) => {}
            Err(e) => {
                warn!(unit = %parent_id, error = %e, "status lookup failed; relying on queue dedup");
            }
        }

        let run_id = RunId::new();
        let job = NewJob::phased(job_id, first.name.clone(), unit.clone(), run_id)
            .with_meta(meta.clone());
        let mut options = EnqueueOptions::default();
        if retrigger {
            options = options.replacing_completed();
        }

        let outcome = self.queue.enqueue(job, options).await?;
        if outcome.existing {
            debug!(unit = %parent_id, job_id = %outcome.job_id, state = %outcome.state, "enqueue deduplicated by queue");
            return Ok(EnqueueUnitOutcome {
                job_id: outcome.job_id,
                existing: true,
                state: outcome.state,
            });
        }

        info!(unit = %parent_id, job_id = %outcome.job_id, %run_id, retrigger, "unit enqueued");
        self.record_enqueued(&unit, &outcome.job_id, &first.name, run_id, meta, now)
            .await;

        Ok(EnqueueUnitOutcome {
            job_id: outcome.job_id,
            existing: false,
            state: outcome.state,
        })
    }

    /// Enqueue many units in fixed-size batches with a pause between
    /// batches. Units inside a batch are enqueued concurrently.
    pub async fn enqueue_many(
        &self,
        units: Vec<UnitKey>,
        meta: Map<String, JsonValue>,
        options: &BatchOptions,
    ) -> BulkEnqueueReport {
        let mut report = BulkEnqueueReport::default();
        let batch_size = options.batch_size.max(1);
        let batches: Vec<Vec<UnitKey>> = units.chunks(batch_size).map(<[UnitKey]>::to_vec).collect();
        let batch_count = batches.len();

        for (index, batch) in batches.into_iter().enumerate() {
            let mut tasks = JoinSet::new();
            for unit in batch {
                let producer = self.clone();
                let meta = meta.clone();
                tasks.spawn(async move {
                    let result = producer.enqueue_unit(unit.clone(), meta).await;
                    (unit, result)
                });
            }

            while let Some(joined) = tasks.join_next().await {
                match joined {
                    Ok((unit, result)) => report.record(&unit, result),
                    Err(e) => {
                        report.failed += 1;
                        report.errors.push(("<unknown>".to_string(), e.to_string()));
                    }
                }
            }

            if index + 1 < batch_count && !options.delay_between_batches.is_zero() {
                tokio::time::sleep(options.delay_between_batches).await;
            }
        }

        info!(
            enqueued = report.enqueued,
            skipped = report.skipped,
            failed = report.failed,
            "bulk enqueue finished"
        );
        report
    }

    async fn existing_chain(
        &self,
        record: &StatusRecord,
        first_job_id: &JobId,
        now: DateTime<Utc>,
    ) -> Result<Option<EnqueueUnitOutcome>, QueueError> {
        match record.status {
            StatusState::Pending | StatusState::Running => {
                let Some(current) = record.current_job_id.as_deref() else {
                    return Ok(None);
                };
                let current = JobId::from(current);
                // The status record may lag; only a live queue job counts.
                Ok(self.queue.get(&current).await?.and_then(|job| {
                    (!job.state.is_terminal()).then(|| EnqueueUnitOutcome {
                        job_id: job.id,
                        existing: true,
                        state: job.state,
                    })
                }))
            }
            StatusState::Completed => {
                let fresh = record
                    .completed_at
                    .is_some_and(|at| now - at < chrono_duration(self.freshness_window));
                Ok(fresh.then(|| EnqueueUnitOutcome {
                    job_id: first_job_id.clone(),
                    existing: true,
                    state: JobState::Completed,
                }))
            }
            StatusState::Failed => Ok(None),
        }
    }

    async fn record_enqueued(
        &self,
        unit: &UnitKey,
        job_id: &JobId,
        phase: &str,
        run_id: RunId,
        meta: Map<String, JsonValue>,
        now: DateTime<Utc>,
    ) {
        let parent_id = unit.parent_id();
        self.status
            .record(
                job_id.as_str(),
                StatusPatch {
                    subject_id: Some(unit.subject_id.to_string()),
                    region: unit.region.clone(),
                    phase: Some(phase.to_string()),
                    parent_id: Some(parent_id.clone()),
                    run_id: Some(run_id),
                    attempt: Some(0),
                    progress: Some(0),
                    enqueued_at: Some(now),
                    restart: true,
                    ..StatusPatch::job(StatusState::Pending)
                },
            )
            .await;
        self.status
            .record(
                &parent_id,
                StatusPatch {
                    subject_id: Some(unit.subject_id.to_string()),
                    region: unit.region.clone(),
                    phase: Some(phase.to_string()),
                    current_job_id: Some(job_id.to_string()),
                    run_id: Some(run_id),
                    progress: Some(0),
                    enqueued_at: Some(now),
                    restart: true,
                    metadata: meta,
                    ..StatusPatch::unit(StatusState::Pending)
                },
            )
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::store::InMemoryJobQueue;
    use crate::jobs::types::{LeaseRequest, QueueSettings};
    use crate::status::{InMemoryStatusStore, StatusStore};
    use sellerflow_core::{ManualClock, SubjectId};

    struct Fixture {
        clock: ManualClock,
        queue: Arc<InMemoryJobQueue>,
        store: Arc<InMemoryStatusStore>,
        producer: Producer,
    }

    fn fixture() -> Fixture {
        let clock = ManualClock::starting_now();
        let shared: Arc<dyn Clock> = Arc::new(clock.clone());
        let queue = InMemoryJobQueue::arc(QueueSettings::default(), shared.clone());
        let store = Arc::new(InMemoryStatusStore::new(shared.clone()));
        let producer = Producer::new(
            queue.clone(),
            StatusRecorder::new(store.clone()),
            Arc::new(PhaseRegistry::integration()),
            shared,
            Duration::from_secs(2 * 3600),
        );
        Fixture {
            clock,
            queue,
            store,
            producer,
        }
    }

    fn unit(subject: &str) -> UnitKey {
        UnitKey::new(SubjectId::new(subject).unwrap())
    }

    #[tokio::test]
    async fn first_phase_is_enqueued_and_recorded() {
        let f = fixture();
        let outcome = f.producer.enqueue_unit(unit("user-42"), Map::new()).await.unwrap();

        assert_eq!(outcome.job_id, JobId::from("user-42-INIT"));
        assert!(!outcome.existing);
        assert_eq!(outcome.state, JobState::Waiting);

        let unit_record = f.store.get("user-42").await.unwrap().unwrap();
        assert_eq!(unit_record.status, StatusState::Pending);
        assert_eq!(unit_record.current_job_id.as_deref(), Some("user-42-INIT"));
        let job_record = f.store.get("user-42-INIT").await.unwrap().unwrap();
        assert_eq!(job_record.parent_id.as_deref(), Some("user-42"));
    }

    #[tokio::test]
    async fn concurrent_enqueues_create_one_chain() {
        let f = fixture();
        let (a, b) = tokio::join!(
            f.producer.enqueue_unit(unit("user-42"), Map::new()),
            f.producer.enqueue_unit(unit("user-42"), Map::new()),
        );
        let (a, b) = (a.unwrap(), b.unwrap());

        assert_eq!(a.job_id, b.job_id);
        assert_eq!([a.existing, b.existing].iter().filter(|e| **e).count(), 1);
        assert_eq!(f.queue.counts().await.unwrap().waiting, 1);
    }

    #[tokio::test]
    async fn in_flight_chain_at_later_phase_is_reported() {
        let f = fixture();
        f.producer.enqueue_unit(unit("user-1"), Map::new()).await.unwrap();
        let leased = f
            .queue
            .lease(&LeaseRequest::new("w", f.producer.registry().names()))
            .await
            .unwrap()
            .unwrap();
        f.queue.complete(&leased.job.id, &leased.token).await.unwrap();
        f.queue
            .enqueue(
                NewJob::phased(JobId::from("user-1-ORDERS"), "ORDERS", unit("user-1"), RunId::new()),
                EnqueueOptions::default(),
            )
            .await
            .unwrap();
        f.store
            .upsert(
                "user-1",
                StatusPatch {
                    current_job_id: Some("user-1-ORDERS".to_string()),
                    ..StatusPatch::unit(StatusState::Running)
                },
            )
            .await
            .unwrap();

        let again = f.producer.enqueue_unit(unit("user-1"), Map::new()).await.unwrap();
        assert!(again.existing);
        assert_eq!(again.job_id, JobId::from("user-1-ORDERS"));
    }

    #[tokio::test]
    async fn completed_unit_is_fresh_even_after_queue_pruning() {
        let f = fixture();
        let completed_at = f.clock.now();
        f.store
            .upsert(
                "user-7",
                StatusPatch {
                    completed_at: Some(completed_at),
                    progress: Some(100),
                    ..StatusPatch::unit(StatusState::Completed)
                },
            )
            .await
            .unwrap();

        let fresh = f.producer.enqueue_unit(unit("user-7"), Map::new()).await.unwrap();
        assert!(fresh.existing);
        assert_eq!(fresh.state, JobState::Completed);

        f.clock.advance(chrono::Duration::hours(2));
        let stale = f.producer.enqueue_unit(unit("user-7"), Map::new()).await.unwrap();
        assert!(!stale.existing);
        let record = f.store.get("user-7").await.unwrap().unwrap();
        assert_eq!(record.status, StatusState::Pending);
        assert_eq!(record.completed_at, None);
    }

    #[tokio::test]
    async fn failed_unit_is_retriggered() {
        let f = fixture();
        f.producer.enqueue_unit(unit("user-9"), Map::new()).await.unwrap();
        let leased = f
            .queue
            .lease(&LeaseRequest::new("w", vec!["INIT".to_string()]))
            .await
            .unwrap()
            .unwrap();
        f.queue.complete(&leased.job.id, &leased.token).await.unwrap();
        f.store
            .upsert(
                "user-9",
                StatusPatch {
                    error: Some("ORDERS exhausted".to_string()),
                    failed_phase: Some("ORDERS".to_string()),
                    ..StatusPatch::unit(StatusState::Failed)
                },
            )
            .await
            .unwrap();

        let retry = f.producer.enqueue_unit(unit("user-9"), Map::new()).await.unwrap();
        assert!(!retry.existing);
        assert_eq!(retry.state, JobState::Waiting);

        let record = f.store.get("user-9").await.unwrap().unwrap();
        assert_eq!(record.error, None);
        assert_eq!(record.failed_phase, None);
    }

    #[tokio::test(start_paused = true)]
    async fn bulk_enqueue_aggregates_outcomes() {
        let f = fixture();
        f.producer.enqueue_unit(unit("b"), Map::new()).await.unwrap();

        let units = ["a", "b", "c", "d", "e"].into_iter().map(unit).collect();
        let options = BatchOptions {
            batch_size: 2,
            delay_between_batches: Duration::from_millis(100),
        };
        let report = f.producer.enqueue_many(units, Map::new(), &options).await;

        assert_eq!(report.enqueued, 4);
        assert_eq!(report.skipped, 1);
        assert_eq!(report.failed, 0);
        assert_eq!(report.total(), 5);
        assert_eq!(f.queue.counts().await.unwrap().waiting, 5);
    }
}
