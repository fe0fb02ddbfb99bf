//! Phased job engine: durable queue, producer and worker pool.
//!
//! ## Design
//!
//! - One job per (unit, phase); ids are derived from the unit so an enqueue
//!   of an already queued or freshly completed phase is a no-op
//! - Workers hold a lease token while a phase runs; a side task renews it
//! - Expired leases are stalls: the job is re-delivered, and fails once it
//!   stalled more often than allowed
//! - Handler failures retry with backoff until attempts run out
//! - A successful phase enqueues the next one, keyed by the chain's run id
//!
//! ## Components
//!
//! - `JobQueue`: queue backend trait (in-memory, Redis behind `redis`)
//! - `Producer`: enqueues a unit's first phase after checking status
//! - `WorkerPool`: leases, runs handlers, chains and records status
//! - `LeaseKeeper`: periodic lease renewal for one running job

pub mod executor;
pub mod handler;
pub mod lease;
pub mod producer;
#[cfg(feature = "redis")]
pub mod redis_queue;
pub mod store;
pub mod types;

pub use executor::{
    ExecutorStats, JobOutcome, WorkerError, WorkerPool, WorkerPoolConfig, WorkerPoolHandle,
};
pub use handler::{handler_fn, FnHandler, PhaseContext, PhaseHandler, PhaseOutcome};
pub use lease::{LeaseKeeper, LeaseKeeperConfig, LeaseKeeperReport};
pub use producer::{BatchOptions, BulkEnqueueReport, EnqueueUnitOutcome, Producer, ProducerError};
#[cfg(feature = "redis")]
pub use redis_queue::RedisJobQueue;
pub use store::{InMemoryJobQueue, JobQueue, QueueError, STALLED_ERROR};
pub use types::{
    BackoffStrategy, EnqueueOptions, EnqueueOutcome, FailOutcome, Job, JobKind, JobState,
    LeaseAttempt, LeaseInfo, LeaseRequest, LeaseToken, LeasedJob, NewJob, QueueCounts, QueueSettings,
    Retention, RetryPolicy, StallReport,
};
