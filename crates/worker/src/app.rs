//! Service wiring: builds the queue, status store, producer, worker pool and
//! scheduler from [`Config`], and runs them until a shutdown signal.

use std::sync::Arc;

use anyhow::Context;
use tracing::{info, warn};

use sellerflow_core::{Clock, PhaseRegistry, SystemClock};
use sellerflow_infra::config::{Config, QueueBackend, StatusBackend};
use sellerflow_infra::external::{HttpPhaseHandler, HttpSubjectOracle};
use sellerflow_infra::jobs::{
    handler_fn, InMemoryJobQueue, JobQueue, PhaseHandler, PhaseOutcome, Producer, WorkerPool,
};
use sellerflow_infra::scheduler::{CronTrigger, InMemorySchedulerControl, SchedulerControl};
use sellerflow_infra::status::{InMemoryStatusStore, PostgresStatusStore, StatusRecorder, StatusStore};

/// Explicitly constructed process services; built once at startup.
#[derive(Clone)]
pub struct Services {
    pub config: Config,
    pub clock: Arc<dyn Clock>,
    pub registry: Arc<PhaseRegistry>,
    pub queue: Arc<dyn JobQueue>,
    pub status: Arc<dyn StatusStore>,
    pub control: Arc<dyn SchedulerControl>,
}

impl core::fmt::Debug for Services {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Services")
            .field("queue_backend", &self.config.queue_backend)
            .field("status_backend", &self.config.status_backend)
            .field("phases", &self.registry.names())
            .finish_non_exhaustive()
    }
}

impl Services {
    pub async fn from_config(config: Config) -> anyhow::Result<Self> {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);

        let (queue, control): (Arc<dyn JobQueue>, Arc<dyn SchedulerControl>) = match config.queue_backend {
            QueueBackend::Memory => {
                warn!("using in-memory queue; jobs do not survive a restart");
                (
                    InMemoryJobQueue::arc(config.queue.clone(), clock.clone()),
                    Arc::new(InMemorySchedulerControl::new()),
                )
            }
            QueueBackend::Redis => redis_backends(&config, clock.clone()).await?,
        };

        let status: Arc<dyn StatusStore> = match config.status_backend {
            StatusBackend::Memory => Arc::new(InMemoryStatusStore::new(clock.clone())),
            StatusBackend::Postgres => {
                let url = config
                    .database_url
                    .as_deref()
                    .context("DATABASE_URL must be set when STATUS_BACKEND=postgres")?;
                Arc::new(PostgresStatusStore::connect(url, clock.clone()).await?)
            }
        };

        info!(
            queue_backend = ?config.queue_backend,
            status_backend = ?config.status_backend,
            "services initialized"
        );
        Ok(Self {
            config,
            clock,
            registry: Arc::new(PhaseRegistry::integration()),
            queue,
            status,
            control,
        })
    }

    pub fn recorder(&self) -> StatusRecorder {
        StatusRecorder::new(self.status.clone())
    }

    pub fn producer(&self) -> Producer {
        Producer::new(
            self.queue.clone(),
            self.recorder(),
            self.registry.clone(),
            self.clock.clone(),
            self.config.queue.freshness_window,
        )
    }

    /// Handler for every phase: the data-fetch service, or a no-op in dry-run mode.
    pub fn phase_handler(&self, dry_run: bool) -> anyhow::Result<Arc<dyn PhaseHandler>> {
        if dry_run {
            return Ok(Arc::new(handler_fn(|ctx| async move {
                info!(job_id = %ctx.job_id, phase = %ctx.phase, "dry run: phase skipped");
                Ok(PhaseOutcome::ok())
            })));
        }
        let url = self
            .config
            .http
            .data_fetch_url
            .as_deref()
            .context("DATA_FETCH_URL must be set to run workers (or pass --dry-run)")?;
        Ok(Arc::new(HttpPhaseHandler::with_timeout(url, self.config.http.timeout)))
    }

    pub fn worker_pool(&self, handler: Arc<dyn PhaseHandler>) -> WorkerPool {
        let mut pool = WorkerPool::new(
            self.queue.clone(),
            self.recorder(),
            self.registry.clone(),
            self.clock.clone(),
        )
        .with_lease_config(self.config.lease.clone())
        .with_infra_retry(self.config.infra_retry());
        pool.register_all(handler);
        pool
    }

    /// The cron trigger, when an oracle is configured.
    pub fn cron_trigger(&self) -> Option<CronTrigger> {
        let url = self.config.http.oracle_url.as_deref()?;
        Some(CronTrigger::new(
            self.producer(),
            Arc::new(HttpSubjectOracle::new(url)),
            self.control.clone(),
            self.clock.clone(),
            self.config.scheduler.clone(),
        ))
    }
}

#[cfg(feature = "redis")]
async fn redis_backends(
    config: &Config,
    clock: Arc<dyn Clock>,
) -> anyhow::Result<(Arc<dyn JobQueue>, Arc<dyn SchedulerControl>)> {
    use sellerflow_infra::jobs::RedisJobQueue;
    use sellerflow_infra::scheduler::RedisSchedulerControl;

    let url = config
        .redis_url
        .as_deref()
        .context("REDIS_URL must be set when QUEUE_BACKEND=redis")?;
    let queue = RedisJobQueue::connect(
        url,
        Some(config.queue_prefix.clone()),
        config.queue.clone(),
        clock,
    )
    .await?;
    let control = RedisSchedulerControl::connect(url, &config.queue_prefix).await?;
    Ok((Arc::new(queue), Arc::new(control)))
}

#[cfg(not(feature = "redis"))]
async fn redis_backends(
    _config: &Config,
    _clock: Arc<dyn Clock>,
) -> anyhow::Result<(Arc<dyn JobQueue>, Arc<dyn SchedulerControl>)> {
    anyhow::bail!("QUEUE_BACKEND=redis but this binary was built without the redis feature")
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RunOptions {
    pub dry_run: bool,
    pub scheduler: bool,
}

/// Run the worker pool (and the scheduler, when enabled) until SIGINT/SIGTERM.
pub async fn run(services: Services, options: RunOptions) -> anyhow::Result<()> {
    let handler = services.phase_handler(options.dry_run)?;
    let pool = services
        .worker_pool(handler)
        .spawn(services.config.pool.clone());

    let scheduler = if options.scheduler {
        let trigger = services.cron_trigger();
        if trigger.is_none() {
            warn!("ORACLE_URL not set; scheduler disabled");
        }
        trigger.map(CronTrigger::spawn)
    } else {
        None
    };

    shutdown_signal().await;
    info!("shutdown requested");

    if let Some(scheduler) = scheduler {
        scheduler.shutdown().await;
    }
    let stats = pool.stats();
    let drained = pool.shutdown(services.config.shutdown_grace).await;
    if drained {
        info!(processed = stats.jobs_processed, failed = stats.jobs_failed, "worker stopped cleanly");
    } else {
        warn!(
            processed = stats.jobs_processed,
            "worker stopped; in-flight jobs will be re-delivered after lease expiry"
        );
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
