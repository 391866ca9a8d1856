use crate::config::RelayConfig;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use benchrelay_repl::{
    DriftReport, FollowerStatus, ReconciliationAuditor, ReplError, ReplicationCoordinator,
};
use benchrelay_store::{Health, StoreError};
use serde::Deserialize;
use std::sync::Arc;

#[derive(Debug, Deserialize)]
pub struct DeadLetterQuery {
    pub follower: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ReconcileQuery {
    pub repair: Option<bool>,
}

#[derive(Debug, Deserialize)]
pub struct ReportsQuery {
    pub limit: Option<usize>,
}

/// Ingest and operator API over one coordinator.
#[derive(Clone)]
pub struct RelayApi {
    coordinator: Arc<ReplicationCoordinator>,
    auditor: Arc<ReconciliationAuditor>,
    config: Arc<RelayConfig>,
}

impl RelayApi {
    pub fn new(
        coordinator: Arc<ReplicationCoordinator>,
        auditor: Arc<ReconciliationAuditor>,
        config: Arc<RelayConfig>,
    ) -> Self {
        Self {
            coordinator,
            auditor,
            config,
        }
    }

    pub fn router(self: Arc<Self>) -> Router {
        Router::new()
            .route("/health", get(health_handler))
            .route("/ready", get(ready_handler))
            .route("/api/v1/results", post(ingest_handler))
            .route("/api/v1/results/batch", post(ingest_batch_handler))
            .route("/api/v1/replication/lag", get(lag_handler))
            .route("/api/v1/replication/dead-letters", get(dead_letters_handler))
            .route(
                "/api/v1/replication/dead-letters/{follower}/replay",
                post(replay_handler),
            )
            .route("/api/v1/reconciliation/run", post(reconcile_run_handler))
            .route("/api/v1/reconciliation/reports", get(reports_handler))
            .with_state(self)
    }

    pub async fn serve(self) -> anyhow::Result<()> {
        let addr = self.config.bind_addr;
        let router = Arc::new(self).router();

        let listener = tokio::net::TcpListener::bind(addr).await?;
        tracing::info!("Ingest API listening on {}", addr);

        axum::serve(listener, router.into_make_service()).await?;
        Ok(())
    }
}

async fn health_handler() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "version": "0.1.0"
    }))
}

async fn ready_handler(State(state): State<Arc<RelayApi>>) -> Response {
    match state.coordinator.leader_store().health().await {
        Health::Unreachable => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({ "status": "leader unreachable" })),
        )
            .into_response(),
        _ => Json(serde_json::json!({ "status": "ok" })).into_response(),
    }
}

async fn ingest_handler(
    State(state): State<Arc<RelayApi>>,
    Json(raw): Json<serde_json::Value>,
) -> Response {
    match state.coordinator.ingest(&raw).await {
        Ok(receipt) => Json(serde_json::json!({
            "status": "accepted",
            "doc_id": receipt.doc_id,
            "index": receipt.index,
            "followers_enqueued": receipt.followers_enqueued,
        }))
        .into_response(),
        Err(e) => error_response(e),
    }
}

async fn ingest_batch_handler(
    State(state): State<Arc<RelayApi>>,
    Json(raws): Json<Vec<serde_json::Value>>,
) -> Response {
    match state.coordinator.ingest_batch(&raws).await {
        Ok(receipt) => Json(serde_json::json!({
            "status": "accepted",
            "accepted": receipt.accepted,
            "followers_enqueued": receipt.followers_enqueued,
        }))
        .into_response(),
        Err(e) => error_response(e),
    }
}

async fn lag_handler(State(state): State<Arc<RelayApi>>) -> Json<Vec<FollowerStatus>> {
    Json(state.coordinator.lag_report().await)
}

async fn dead_letters_handler(
    State(state): State<Arc<RelayApi>>,
    Query(params): Query<DeadLetterQuery>,
) -> Response {
    let result = match params.follower.as_deref() {
        Some(follower) => state.coordinator.dead_letters(follower),
        None => state.coordinator.all_dead_letters(),
    };
    match result {
        Ok(records) => Json(records).into_response(),
        Err(e) => error_response(e),
    }
}

async fn replay_handler(
    State(state): State<Arc<RelayApi>>,
    Path(follower): Path<String>,
) -> Response {
    match state.coordinator.replay_dead_letters(&follower) {
        Ok(replayed) => Json(serde_json::json!({
            "follower": follower,
            "replayed": replayed,
        }))
        .into_response(),
        Err(e) => error_response(e),
    }
}

async fn reconcile_run_handler(
    State(state): State<Arc<RelayApi>>,
    Query(params): Query<ReconcileQuery>,
) -> Response {
    let repair = params.repair.unwrap_or_else(|| state.auditor.repair_enabled());
    match state.auditor.run_once(repair).await {
        Ok(reports) => Json(reports).into_response(),
        Err(e) => error_response(e),
    }
}

async fn reports_handler(
    State(state): State<Arc<RelayApi>>,
    Query(params): Query<ReportsQuery>,
) -> Json<Vec<DriftReport>> {
    Json(state.auditor.recent_reports(params.limit.unwrap_or(20)).await)
}

/// Map a replication error onto the wire. Schema failures are the caller's
/// fault; store failures distinguish "could not reach" from "reached and
/// was refused".
fn error_response(err: ReplError) -> Response {
    match err {
        ReplError::Schema(e) => (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({
                "error": "SchemaError",
                "field": e.field,
                "reason": e.reason,
            })),
        )
            .into_response(),
        ReplError::Store(StoreError::Rejected { status, reason }) => (
            StatusCode::BAD_GATEWAY,
            Json(serde_json::json!({
                "error": "StoreRejected",
                "status": status,
                "reason": reason,
            })),
        )
            .into_response(),
        ReplError::Store(StoreError::InvalidResponse { msg }) => (
            StatusCode::BAD_GATEWAY,
            Json(serde_json::json!({
                "error": "StoreInvalidResponse",
                "reason": msg,
            })),
        )
            .into_response(),
        ReplError::Store(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({
                "error": "StoreUnavailable",
                "reason": e.to_string(),
            })),
        )
            .into_response(),
        ReplError::UnknownFollower { follower_id } => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({
                "error": "UnknownFollower",
                "follower": follower_id,
            })),
        )
            .into_response(),
        other => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({
                "error": "Internal",
                "reason": other.to_string(),
            })),
        )
            .into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use benchrelay_repl::{AuditorConfig, FollowerSpec};
    use benchrelay_store::{DocumentStore, MemoryDocumentStore};
    use tempfile::TempDir;
    use tower::ServiceExt;

    struct TestStack {
        router: Router,
        leader: MemoryDocumentStore,
        _queue_dir: TempDir,
    }

    fn fast_config() -> RelayConfig {
        RelayConfig {
            leader_retry_attempts: 2,
            retry_ceiling: 2,
            backoff_base_ms: 2,
            backoff_max_ms: 10,
            unreachable_grace_secs: 1,
            health_probe_interval_secs: 1,
            ..RelayConfig::default()
        }
    }

    fn test_stack(follower_count: usize) -> TestStack {
        let config = Arc::new(fast_config());
        let queue_dir = TempDir::new().unwrap();

        let leader = MemoryDocumentStore::new();
        let mut specs = Vec::new();
        for i in 0..follower_count {
            specs.push(FollowerSpec {
                id: format!("dc{}", i + 2),
                store: Arc::new(MemoryDocumentStore::new()) as Arc<dyn DocumentStore>,
            });
        }

        let coordinator = Arc::new(
            ReplicationCoordinator::start(
                Arc::new(leader.clone()) as Arc<dyn DocumentStore>,
                specs,
                config.coordinator_config(),
                queue_dir.path(),
            )
            .unwrap(),
        );
        let auditor = Arc::new(ReconciliationAuditor::new(
            coordinator.clone(),
            AuditorConfig::default(),
        ));
        let api = Arc::new(RelayApi::new(coordinator, auditor, config));

        TestStack {
            router: api.router(),
            leader,
            _queue_dir: queue_dir,
        }
    }

    fn sample_doc(n: u32) -> serde_json::Value {
        serde_json::json!({
            "test-execution-id": format!("exec-{:04}", n),
            "test-execution-timestamp": "20260514T120000Z",
            "environment": "nightly",
            "workload": "geonames",
            "test_procedure": "append-no-conflicts",
            "task": "index-append",
            "name": "throughput",
            "value": { "median": 19_994.6, "unit": "docs/s" }
        })
    }

    fn json_post(uri: &str, body: &serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let stack = test_stack(0);

        let request = Request::builder()
            .uri("/health")
            .body(Body::empty())
            .unwrap();
        let response = stack.router.oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["status"], "ok");
    }

    #[tokio::test]
    async fn test_ready_reflects_leader_health() {
        let stack = test_stack(0);

        let request = Request::builder().uri("/ready").body(Body::empty()).unwrap();
        let response = stack.router.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        stack.leader.set_unreachable(true).await;
        let request = Request::builder().uri("/ready").body(Body::empty()).unwrap();
        let response = stack.router.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_ingest_accepted() {
        let stack = test_stack(1);

        let response = stack
            .router
            .oneshot(json_post("/api/v1/results", &sample_doc(1)))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["status"], "accepted");
        assert_eq!(json["doc_id"], "exec-0001/throughput/index-append");
        assert_eq!(json["index"], "benchmark-results-2026-05");
        assert_eq!(json["followers_enqueued"], 1);
        assert_eq!(stack.leader.doc_count("benchmark-results-2026-05").await, 1);
    }

    #[tokio::test]
    async fn test_ingest_schema_error_reports_field() {
        let stack = test_stack(0);
        let mut doc = sample_doc(2);
        doc.as_object_mut().unwrap().remove("value");

        let response = stack
            .router
            .oneshot(json_post("/api/v1/results", &doc))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let json = body_json(response).await;
        assert_eq!(json["error"], "SchemaError");
        assert_eq!(json["field"], "value");
    }

    #[tokio::test]
    async fn test_ingest_leader_down_returns_503() {
        let stack = test_stack(0);
        stack.leader.set_unreachable(true).await;

        let response = stack
            .router
            .oneshot(json_post("/api/v1/results", &sample_doc(3)))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let json = body_json(response).await;
        assert_eq!(json["error"], "StoreUnavailable");
    }

    #[tokio::test]
    async fn test_batch_all_or_nothing() {
        let stack = test_stack(0);
        let mut bad = sample_doc(5);
        bad.as_object_mut().unwrap().remove("name");
        let batch = serde_json::json!([sample_doc(4), bad]);

        let response = stack
            .router
            .clone()
            .oneshot(json_post("/api/v1/results/batch", &batch))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(stack.leader.doc_count("benchmark-results-2026-05").await, 0);

        let batch = serde_json::json!([sample_doc(4), sample_doc(5)]);
        let response = stack
            .router
            .oneshot(json_post("/api/v1/results/batch", &batch))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["accepted"], 2);
        assert_eq!(stack.leader.doc_count("benchmark-results-2026-05").await, 2);
    }

    #[tokio::test]
    async fn test_lag_report_lists_followers() {
        let stack = test_stack(2);

        let request = Request::builder()
            .uri("/api/v1/replication/lag")
            .body(Body::empty())
            .unwrap();
        let response = stack.router.oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        let rows = json.as_array().unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["follower_id"], "dc2");
        assert!(rows[0].get("backlog_depth").is_some());
    }

    #[tokio::test]
    async fn test_dead_letters_empty_and_unknown_follower() {
        let stack = test_stack(1);

        let request = Request::builder()
            .uri("/api/v1/replication/dead-letters")
            .body(Body::empty())
            .unwrap();
        let response = stack.router.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert!(json.as_array().unwrap().is_empty());

        let request = Request::builder()
            .uri("/api/v1/replication/dead-letters?follower=nowhere")
            .body(Body::empty())
            .unwrap();
        let response = stack.router.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let request = json_post(
            "/api/v1/replication/dead-letters/nowhere/replay",
            &serde_json::json!({}),
        );
        let response = stack.router.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let json = body_json(response).await;
        assert_eq!(json["error"], "UnknownFollower");
    }

    #[tokio::test]
    async fn test_reconciliation_run_and_reports() {
        let stack = test_stack(1);

        let response = stack
            .router
            .clone()
            .oneshot(json_post("/api/v1/reconciliation/run", &serde_json::json!({})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        let reports = json.as_array().unwrap();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0]["follower_id"], "dc2");
        assert_eq!(reports[0]["drift"], false);

        let request = Request::builder()
            .uri("/api/v1/reconciliation/reports?limit=5")
            .body(Body::empty())
            .unwrap();
        let response = stack.router.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json.as_array().unwrap().len(), 1);
    }
}
