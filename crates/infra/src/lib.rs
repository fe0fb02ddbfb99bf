//! Infrastructure layer: durable queue, status store, producer, workers,
//! scheduler, config and external service adapters.

pub mod config;
pub mod external;
pub mod jobs;
pub mod scheduler;
pub mod status;
