//! Phase handler seam: the user-supplied work executed for one phase.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

use sellerflow_core::{JobId, SubjectId};

/// Everything a handler gets to see about the job it runs.
#[derive(Debug, Clone, PartialEq)]
pub struct PhaseContext {
    pub job_id: JobId,
    pub subject_id: SubjectId,
    pub region: Option<String>,
    pub phase: String,
    /// Data produced by earlier phases of this run.
    pub payload: Map<String, JsonValue>,
    /// Request metadata, unchanged along the chain.
    pub meta: Map<String, JsonValue>,
    /// 1-based execution attempt of this job.
    pub attempt: u32,
}

/// Result reported by a handler.
///
/// `success == false` is treated exactly like a returned error: the attempt
/// failed and the queue decides whether it is retried.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PhaseOutcome {
    pub success: bool,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub summary: Option<JsonValue>,
    /// Merged into the next phase's payload.
    #[serde(default)]
    pub data_for_next_phase: Map<String, JsonValue>,
}

impl PhaseOutcome {
    pub fn ok() -> Self {
        Self {
            success: true,
            ..Default::default()
        }
    }

    pub fn with_next(data: Map<String, JsonValue>) -> Self {
        Self {
            success: true,
            data_for_next_phase: data,
            ..Default::default()
        }
    }

    pub fn with_summary(mut self, summary: JsonValue) -> Self {
        self.summary = Some(summary);
        self
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Default::default()
        }
    }

    /// Error message for an unsuccessful outcome.
    pub fn error_message(&self) -> String {
        self.error
            .clone()
            .unwrap_or_else(|| "phase handler reported failure".to_string())
    }
}

/// Executes one phase for one unit.
///
/// Handlers may run more than once for the same job (retries, stall
/// re-delivery), so their side effects must be safe to repeat.
#[async_trait]
pub trait PhaseHandler: Send + Sync {
    async fn execute(&self, ctx: PhaseContext) -> anyhow::Result<PhaseOutcome>;
}

/// Adapter turning an async closure into a [`PhaseHandler`].
pub struct FnHandler<F>(pub F);

/// Wrap an async closure as a handler.
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(PhaseContext) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = anyhow::Result<PhaseOutcome>> + Send + 'static,
{
    FnHandler(f)
}

#[async_trait]
impl<F, Fut> PhaseHandler for FnHandler<F>
where
    F: Fn(PhaseContext) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = anyhow::Result<PhaseOutcome>> + Send + 'static,
{
    async fn execute(&self, ctx: PhaseContext) -> anyhow::Result<PhaseOutcome> {
        (self.0)(ctx).await
    }
}
