use std::sync::{Arc, Mutex};

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde_json::{json, Map, Value as JsonValue};

use sellerflow_core::{JobId, SubjectId};
use sellerflow_infra::external::{ExternalError, HttpPhaseHandler, HttpSubjectOracle};
use sellerflow_infra::jobs::{PhaseContext, PhaseHandler};
use sellerflow_infra::scheduler::SubjectOracle;

#[derive(Clone, Default)]
struct Recorded {
    phase_calls: Arc<Mutex<Vec<(String, JsonValue)>>>,
    oracle_queries: Arc<Mutex<Vec<String>>>,
}

struct TestServer {
    base_url: String,
    recorded: Recorded,
    handle: tokio::task::JoinHandle<()>,
}

impl TestServer {
    async fn spawn() -> Self {
        let recorded = Recorded::default();
        let app = Router::new()
            .route("/phases/:phase", post(run_phase))
            .route("/subjects/needing-work", get(needing_work))
            .with_state(recorded.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind ephemeral port");
        let addr = listener.local_addr().unwrap();
        let base_url = format!("http://{}", addr);

        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            base_url,
            recorded,
            handle,
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn run_phase(
    State(recorded): State<Recorded>,
    Path(phase): Path<String>,
    Json(body): Json<JsonValue>,
) -> (StatusCode, Json<JsonValue>) {
    recorded
        .phase_calls
        .lock()
        .unwrap()
        .push((phase.clone(), body.clone()));

    match phase.as_str() {
        "INIT" => (
            StatusCode::OK,
            Json(json!({ "success": true, "data_for_next_phase": { "report_id": "r-1" } })),
        ),
        "ORDERS" => (
            StatusCode::OK,
            Json(json!({ "success": false, "error": "throttled" })),
        ),
        _ => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "message": "maintenance" })),
        ),
    }
}

async fn needing_work(
    State(recorded): State<Recorded>,
    Query(params): Query<std::collections::HashMap<String, String>>,
) -> Json<JsonValue> {
    recorded
        .oracle_queries
        .lock()
        .unwrap()
        .push(params.get("now").cloned().unwrap_or_default());
    Json(json!({
        "subjects": [
            { "subject_id": "user-1" },
            { "subject_id": "user-2", "region": "UK" }
        ]
    }))
}

fn context(phase: &str) -> PhaseContext {
    let mut payload = Map::new();
    payload.insert("carried".to_string(), json!(true));
    PhaseContext {
        job_id: JobId::from_raw(format!("user-42-{phase}")),
        subject_id: SubjectId::new("user-42").unwrap(),
        region: Some("DE".to_string()),
        phase: phase.to_string(),
        payload,
        meta: Map::new(),
        attempt: 1,
    }
}

#[tokio::test]
async fn phase_handler_posts_context_and_reads_outcome() {
    let server = TestServer::spawn().await;
    let handler = HttpPhaseHandler::new(server.base_url.clone());

    let outcome = handler.execute(context("INIT")).await.unwrap();
    assert!(outcome.success);
    assert_eq!(outcome.data_for_next_phase["report_id"], json!("r-1"));

    let calls = server.recorded.phase_calls.lock().unwrap().clone();
    assert_eq!(calls.len(), 1);
    let (phase, body) = &calls[0];
    assert_eq!(phase, "INIT");
    assert_eq!(body["subject_id"], json!("user-42"));
    assert_eq!(body["region"], json!("DE"));
    assert_eq!(body["job_id"], json!("user-42-INIT"));
    assert_eq!(body["payload"]["carried"], json!(true));
}

#[tokio::test]
async fn unsuccessful_outcome_is_returned_not_raised() {
    let server = TestServer::spawn().await;
    let handler = HttpPhaseHandler::new(server.base_url.clone());

    let outcome = handler.execute(context("ORDERS")).await.unwrap();
    assert!(!outcome.success);
    assert_eq!(outcome.error_message(), "throttled");
}

#[tokio::test]
async fn non_success_status_is_an_api_error() {
    let server = TestServer::spawn().await;
    let handler = HttpPhaseHandler::new(server.base_url.clone());

    let err = handler.call(&context("FINALIZE")).await.unwrap_err();
    match err {
        ExternalError::Api(status, body) => {
            assert_eq!(status, 503);
            assert!(body.contains("maintenance"));
        }
        other => panic!("expected API error, got {other:?}"),
    }
}

#[tokio::test]
async fn oracle_lists_units_with_regions() {
    let server = TestServer::spawn().await;
    let oracle = HttpSubjectOracle::new(format!("{}/", server.base_url));

    let units = oracle.subjects_needing_work(Utc::now()).await.unwrap();
    let ids: Vec<String> = units.iter().map(|u| u.parent_id()).collect();
    assert_eq!(ids, ["user-1", "user-2:UK"]);

    let queries = server.recorded.oracle_queries.lock().unwrap().clone();
    assert_eq!(queries.len(), 1);
    assert!(chrono::DateTime::parse_from_rfc3339(&queries[0]).is_ok());
}

#[tokio::test]
async fn unreachable_service_is_a_network_error() {
    let handler = HttpPhaseHandler::new("http://127.0.0.1:1");
    let err = handler.call(&context("INIT")).await.unwrap_err();
    assert!(matches!(err, ExternalError::Network(_)));
}
