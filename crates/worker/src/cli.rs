//! Operator command line: run the worker, enqueue units, inspect status and
//! the queue, cancel waiting jobs, pause or resume the scheduler.

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use serde_json::{json, Map, Value as JsonValue};

use sellerflow_core::{JobId, SubjectId, UnitKey};
use sellerflow_infra::jobs::JobState;
use sellerflow_infra::status::{StatusQuery, StatusState};

use crate::app::{self, RunOptions, Services};

#[derive(Debug, Parser)]
#[command(name = "sellerflow-worker")]
#[command(author, version, about = "Phased integration job engine", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the worker pool and the scheduler until interrupted.
    Run(RunArgs),
    /// Enqueue the first phase for one or more subjects.
    Enqueue(EnqueueArgs),
    /// Show the status record of a job or unit.
    Status {
        /// Job id (`user-42-INIT`) or unit id (`user-42`, `user-42:DE`).
        id: String,
    },
    /// List unit status records, most recently updated first.
    Units {
        #[arg(long)]
        status: Option<StatusState>,
        #[arg(long, default_value = "50")]
        limit: usize,
    },
    /// Show queue counts, optionally listing jobs in one state.
    QueueStats {
        #[arg(long)]
        list: Option<JobState>,
        #[arg(long, default_value = "20")]
        limit: usize,
    },
    /// Remove a waiting or delayed job.
    Cancel {
        job_id: String,
    },
    /// Pause, resume or inspect the scheduler.
    Scheduler {
        #[command(subcommand)]
        action: SchedulerAction,
    },
}

#[derive(Debug, Args)]
pub struct RunArgs {
    /// Skip the data-fetch service; every phase succeeds immediately.
    #[arg(long)]
    pub dry_run: bool,
    /// Do not start the cron trigger in this process.
    #[arg(long)]
    pub no_scheduler: bool,
}

#[derive(Debug, Args)]
pub struct EnqueueArgs {
    #[arg(required = true)]
    pub subjects: Vec<String>,
    /// Region sub-key applied to every subject.
    #[arg(long)]
    pub region: Option<String>,
}

#[derive(Debug, Clone, Copy, Subcommand)]
pub enum SchedulerAction {
    Pause,
    Resume,
    Status,
}

/// Execute a command. Returns the JSON to print, if any.
pub async fn execute(command: Command, services: Services) -> anyhow::Result<Option<JsonValue>> {
    match command {
        Command::Run(args) => {
            app::run(
                services,
                RunOptions {
                    dry_run: args.dry_run,
                    scheduler: !args.no_scheduler,
                },
            )
            .await?;
            Ok(None)
        }
        Command::Enqueue(args) => enqueue(&services, args).await.map(Some),
        Command::Status { id } => {
            let record = services
                .status
                .get(&id)
                .await?
                .with_context(|| format!("no status record for {id}"))?;
            Ok(Some(serde_json::to_value(record)?))
        }
        Command::Units { status, limit } => {
            let mut query = StatusQuery::units().with_limit(limit);
            if let Some(status) = status {
                query = query.with_status(status);
            }
            let records = services.status.query(&query).await?;
            Ok(Some(serde_json::to_value(records)?))
        }
        Command::QueueStats { list, limit } => {
            let counts = services.queue.counts().await?;
            let mut out = json!({ "counts": counts });
            if let Some(state) = list {
                let jobs = services.queue.list(state, limit).await?;
                out["jobs"] = serde_json::to_value(jobs)?;
            }
            Ok(Some(out))
        }
        Command::Cancel { job_id } => {
            let job_id = JobId::from_raw(job_id);
            let removed = services.queue.remove(&job_id).await?;
            Ok(Some(json!({ "job_id": job_id, "removed": removed })))
        }
        Command::Scheduler { action } => {
            match action {
                SchedulerAction::Pause => services.control.set_paused(true).await?,
                SchedulerAction::Resume => services.control.set_paused(false).await?,
                SchedulerAction::Status => {}
            }
            let paused = services.control.is_paused().await?;
            Ok(Some(json!({ "paused": paused })))
        }
    }
}

async fn enqueue(services: &Services, args: EnqueueArgs) -> anyhow::Result<JsonValue> {
    let units = args
        .subjects
        .iter()
        .map(|s| {
            let subject = SubjectId::new(s.as_str())?;
            Ok(match &args.region {
                Some(region) => UnitKey::with_region(subject, region),
                None => UnitKey::new(subject),
            })
        })
        .collect::<anyhow::Result<Vec<UnitKey>>>()?;

    let mut meta = Map::new();
    meta.insert("trigger".to_string(), json!("cli"));
    let producer = services.producer();

    if let [unit] = units.as_slice() {
        let outcome = producer.enqueue_unit(unit.clone(), meta).await?;
        return Ok(serde_json::to_value(outcome)?);
    }
    let report = producer
        .enqueue_many(units, meta, &services.config.scheduler.batch)
        .await;
    Ok(serde_json::to_value(report)?)
}
