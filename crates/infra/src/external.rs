//! HTTP adapters for the external collaborators: the per-phase data-fetch
//! service and the "who needs work" oracle.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use tracing::debug;

use sellerflow_core::UnitKey;

use crate::jobs::{PhaseContext, PhaseHandler, PhaseOutcome};
use crate::scheduler::SubjectOracle;

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(3600);

#[derive(Debug, thiserror::Error)]
pub enum ExternalError {
    #[error("network error: {0}")]
    Network(String),
    #[error("API error ({0}): {1}")]
    Api(u16, String),
    #[error("parse error: {0}")]
    Parse(String),
}

fn build_client(timeout: Duration) -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .unwrap_or_else(|_| reqwest::Client::new())
}

async fn read_json<T: serde::de::DeserializeOwned>(
    response: reqwest::Response,
) -> Result<T, ExternalError> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(ExternalError::Api(status.as_u16(), body));
    }
    response
        .json::<T>()
        .await
        .map_err(|e| ExternalError::Parse(e.to_string()))
}

#[derive(Debug, Serialize)]
struct PhaseRequest<'a> {
    job_id: &'a str,
    subject_id: &'a str,
    region: Option<&'a str>,
    phase: &'a str,
    attempt: u32,
    payload: &'a Map<String, JsonValue>,
    meta: &'a Map<String, JsonValue>,
}

/// Runs every phase by POSTing to `{base_url}/phases/{phase}`.
///
/// The response body is a [`PhaseOutcome`]. Transport errors and non-2xx
/// responses are handler failures and go through job-level retry.
#[derive(Debug, Clone)]
pub struct HttpPhaseHandler {
    base_url: String,
    client: reqwest::Client,
}

impl HttpPhaseHandler {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_timeout(base_url, DEFAULT_REQUEST_TIMEOUT)
    }

    pub fn with_timeout(base_url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            base_url: base_url.into(),
            client: build_client(timeout),
        }
    }

    fn phase_url(&self, phase: &str) -> String {
        format!("{}/phases/{phase}", self.base_url.trim_end_matches('/'))
    }

    pub async fn call(&self, ctx: &PhaseContext) -> Result<PhaseOutcome, ExternalError> {
        let request = PhaseRequest {
            job_id: ctx.job_id.as_str(),
            subject_id: ctx.subject_id.as_str(),
            region: ctx.region.as_deref(),
            phase: &ctx.phase,
            attempt: ctx.attempt,
            payload: &ctx.payload,
            meta: &ctx.meta,
        };
        debug!(job_id = %ctx.job_id, phase = %ctx.phase, "calling data-fetch service");
        let response = self
            .client
            .post(self.phase_url(&ctx.phase))
            .json(&request)
            .send()
            .await
            .map_err(|e| ExternalError::Network(e.to_string()))?;
        read_json(response).await
    }
}

#[async_trait]
impl PhaseHandler for HttpPhaseHandler {
    async fn execute(&self, ctx: PhaseContext) -> anyhow::Result<PhaseOutcome> {
        Ok(self.call(&ctx).await?)
    }
}

#[derive(Debug, Deserialize)]
struct SubjectsResponse {
    subjects: Vec<UnitKey>,
}

/// Asks `GET {base_url}/subjects/needing-work?now=<rfc3339>` for units.
#[derive(Debug, Clone)]
pub struct HttpSubjectOracle {
    base_url: String,
    client: reqwest::Client,
}

impl HttpSubjectOracle {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_timeout(base_url, Duration::from_secs(60))
    }

    pub fn with_timeout(base_url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            base_url: base_url.into(),
            client: build_client(timeout),
        }
    }

    pub async fn fetch(&self, now: DateTime<Utc>) -> Result<Vec<UnitKey>, ExternalError> {
        let url = format!(
            "{}/subjects/needing-work",
            self.base_url.trim_end_matches('/')
        );
        let response = self
            .client
            .get(url)
            .query(&[("now", now.to_rfc3339())])
            .send()
            .await
            .map_err(|e| ExternalError::Network(e.to_string()))?;
        let body: SubjectsResponse = read_json(response).await?;
        Ok(body.subjects)
    }
}

#[async_trait]
impl SubjectOracle for HttpSubjectOracle {
    async fn subjects_needing_work(&self, now: DateTime<Utc>) -> anyhow::Result<Vec<UnitKey>> {
        Ok(self.fetch(now).await?)
    }
}
