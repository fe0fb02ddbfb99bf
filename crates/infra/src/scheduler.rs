//! Cron trigger: asks an oracle which units need work and hands them to the
//! producer. It never executes phases itself.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Map};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use sellerflow_core::{Clock, UnitKey};

use crate::jobs::{BatchOptions, BulkEnqueueReport, Producer, RetryPolicy};

/// External "who needs work" source, consulted once per tick.
#[async_trait]
pub trait SubjectOracle: Send + Sync {
    async fn subjects_needing_work(&self, now: DateTime<Utc>) -> anyhow::Result<Vec<UnitKey>>;
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum SchedulerError {
    #[error("oracle failed: {0}")]
    Oracle(String),

    #[error("scheduler control unavailable: {0}")]
    Control(String),
}

/// Operator pause switch, checked at the start of every tick.
#[async_trait]
pub trait SchedulerControl: Send + Sync {
    async fn is_paused(&self) -> Result<bool, SchedulerError>;
    async fn set_paused(&self, paused: bool) -> Result<(), SchedulerError>;
}

/// Process-local pause flag.
#[derive(Debug, Default)]
pub struct InMemorySchedulerControl {
    paused: AtomicBool,
}

impl InMemorySchedulerControl {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SchedulerControl for InMemorySchedulerControl {
    async fn is_paused(&self) -> Result<bool, SchedulerError> {
        Ok(self.paused.load(Ordering::SeqCst))
    }

    async fn set_paused(&self, paused: bool) -> Result<(), SchedulerError> {
        self.paused.store(paused, Ordering::SeqCst);
        Ok(())
    }
}

/// Pause flag shared by every process through Redis (`{prefix}:scheduler:paused`).
#[cfg(feature = "redis")]
#[derive(Clone)]
pub struct RedisSchedulerControl {
    conn: redis::aio::ConnectionManager,
    key: String,
}

#[cfg(feature = "redis")]
impl RedisSchedulerControl {
    pub async fn connect(redis_url: &str, prefix: &str) -> Result<Self, SchedulerError> {
        let client =
            redis::Client::open(redis_url).map_err(|e| SchedulerError::Control(e.to_string()))?;
        let conn = redis::aio::ConnectionManager::new(client)
            .await
            .map_err(|e| SchedulerError::Control(e.to_string()))?;
        Ok(Self {
            conn,
            key: format!("{prefix}:scheduler:paused"),
        })
    }
}

#[cfg(feature = "redis")]
#[async_trait]
impl SchedulerControl for RedisSchedulerControl {
    async fn is_paused(&self) -> Result<bool, SchedulerError> {
        let mut conn = self.conn.clone();
        let value: Option<String> = redis::cmd("GET")
            .arg(&self.key)
            .query_async(&mut conn)
            .await
            .map_err(|e| SchedulerError::Control(e.to_string()))?;
        Ok(value.as_deref() == Some("1"))
    }

    async fn set_paused(&self, paused: bool) -> Result<(), SchedulerError> {
        let mut conn = self.conn.clone();
        let cmd = if paused {
            let mut cmd = redis::cmd("SET");
            cmd.arg(&self.key).arg("1");
            cmd
        } else {
            let mut cmd = redis::cmd("DEL");
            cmd.arg(&self.key);
            cmd
        };
        cmd.query_async::<_, ()>(&mut conn)
            .await
            .map_err(|e| SchedulerError::Control(e.to_string()))?;
        info!(paused, "scheduler pause flag updated");
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct CronTriggerConfig {
    pub interval: Duration,
    /// Fire immediately on spawn instead of waiting one interval.
    pub run_on_start: bool,
    pub batch: BatchOptions,
    /// Retries for a failing oracle within one tick.
    pub oracle_retry: RetryPolicy,
}

impl Default for CronTriggerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(3600),
            run_on_start: true,
            batch: BatchOptions::default(),
            oracle_retry: RetryPolicy::exponential(3, Duration::from_secs(1), Duration::from_secs(30)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    Paused,
    Enqueued(BulkEnqueueReport),
}

pub struct CronTrigger {
    producer: Producer,
    oracle: Arc<dyn SubjectOracle>,
    control: Arc<dyn SchedulerControl>,
    clock: Arc<dyn Clock>,
    config: CronTriggerConfig,
}

impl core::fmt::Debug for CronTrigger {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("CronTrigger")
            .field("producer", &self.producer)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl CronTrigger {
    pub fn new(
        producer: Producer,
        oracle: Arc<dyn SubjectOracle>,
        control: Arc<dyn SchedulerControl>,
        clock: Arc<dyn Clock>,
        config: CronTriggerConfig,
    ) -> Self {
        Self {
            producer,
            oracle,
            control,
            clock,
            config,
        }
    }

    /// One trigger cycle: check the pause flag, ask the oracle, bulk enqueue.
    pub async fn run_tick(&self) -> Result<TickOutcome, SchedulerError> {
        if self.control.is_paused().await? {
            info!("scheduler paused, skipping tick");
            return Ok(TickOutcome::Paused);
        }

        let units = self.fetch_units().await?;
        if units.is_empty() {
            info!("no subjects need work");
            return Ok(TickOutcome::Enqueued(BulkEnqueueReport::default()));
        }

        let mut meta = Map::new();
        meta.insert("trigger".to_string(), json!("scheduler"));
        meta.insert("triggered_at".to_string(), json!(self.clock.now()));
        let report = self.producer.enqueue_many(units, meta, &self.config.batch).await;
        Ok(TickOutcome::Enqueued(report))
    }

    async fn fetch_units(&self) -> Result<Vec<UnitKey>, SchedulerError> {
        let policy = &self.config.oracle_retry;
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.oracle.subjects_needing_work(self.clock.now()).await {
                Ok(units) => return Ok(units),
                Err(e) if policy.should_retry(attempt) => {
                    let delay = policy.delay_for_attempt(attempt);
                    warn!(attempt, ?delay, error = %format!("{e:#}"), "oracle failed, retrying");
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(SchedulerError::Oracle(format!("{e:#}"))),
            }
        }
    }

    /// Run ticks on the configured interval until the handle is shut down.
    pub fn spawn(self) -> SchedulerHandle {
        let (trigger_tx, trigger_rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();
        let join = tokio::spawn(run_loop(Arc::new(self), trigger_rx, cancel.clone()));
        SchedulerHandle {
            trigger: trigger_tx,
            cancel,
            join,
        }
    }
}

async fn run_loop(trigger: Arc<CronTrigger>, mut manual: mpsc::Receiver<()>, cancel: CancellationToken) {
    let interval = trigger.config.interval;
    let start = if trigger.config.run_on_start {
        Instant::now()
    } else {
        Instant::now() + interval
    };
    let mut ticker = tokio::time::interval_at(start, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    info!(?interval, "scheduler started");

    loop {
        let source = tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => "timer",
            Some(()) = manual.recv() => "manual",
        };

        match trigger.run_tick().await {
            Ok(TickOutcome::Paused) => {}
            Ok(TickOutcome::Enqueued(report)) => info!(
                source,
                enqueued = report.enqueued,
                skipped = report.skipped,
                failed = report.failed,
                "scheduler tick finished"
            ),
            Err(e) => error!(source, error = %e, "scheduler tick failed"),
        }
    }
    info!("scheduler stopped");
}

/// Handle to a spawned [`CronTrigger`].
#[derive(Debug)]
pub struct SchedulerHandle {
    trigger: mpsc::Sender<()>,
    cancel: CancellationToken,
    join: JoinHandle<()>,
}

impl SchedulerHandle {
    /// Request an immediate tick. Requests made while one is already pending
    /// are coalesced; returns `false` for those.
    pub fn trigger_now(&self) -> bool {
        self.trigger.try_send(()).is_ok()
    }

    /// Stop the loop, letting a tick that is already running finish.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(e) = self.join.await {
            error!(error = %e, "scheduler task ended abnormally");
        }
    }
}
