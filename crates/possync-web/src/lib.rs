//! HTTP surface for the sync pipeline.
//!
//! Each route maps onto one pipeline stage, mirroring how the stages would
//! be deployed as separate short-lived functions: the orchestrator endpoint
//! drives worker invocations, the worker endpoint processes exactly one raw
//! record, and the read endpoints expose job and quality state.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Path as AxumPath, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::NaiveDate;
use possync_core::{Job, QualitySnapshot};
use possync_pipeline::{
    build_alert_sink, AlertSink, LocalWorkerInvoker, Orchestrator, QualityMonitor, QualityThresholds,
    SyncConfig, Worker, WorkerError, WorkerReport,
};
use possync_store::{PgStore, Store, StoreError};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpListener;
use tracing::error;

pub const CRATE_NAME: &str = "possync-web";

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn Store>,
    pub worker: Arc<Worker>,
    pub orchestrator: Arc<Orchestrator>,
    pub monitor: Arc<QualityMonitor>,
    pub default_batch_size: usize,
}

impl AppState {
    pub fn new(
        store: Arc<dyn Store>,
        alerter: Arc<dyn AlertSink>,
        thresholds: QualityThresholds,
        default_batch_size: usize,
        sub_batch_delay: Duration,
    ) -> Self {
        let worker = Arc::new(Worker::new(Arc::clone(&store)).with_batch_delay(sub_batch_delay));
        let orchestrator = Arc::new(Orchestrator::new(
            Arc::clone(&store),
            Arc::new(LocalWorkerInvoker::new(Arc::clone(&worker))),
            Arc::clone(&alerter),
        ));
        let monitor = Arc::new(QualityMonitor::new(Arc::clone(&store), alerter, thresholds));
        Self {
            store,
            worker,
            orchestrator,
            monitor,
            default_batch_size,
        }
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/sync/orchestrate", post(orchestrate_handler))
        .route("/sync/worker", post(worker_handler))
        .route("/sync/resume/{batch_id}", post(resume_handler))
        .route("/sync/reconcile/{tenant_id}/{date}", post(reconcile_handler))
        .route("/jobs/{batch_id}", get(job_handler))
        .route("/quality/{tenant_id}/{date}", get(quality_handler))
        .route("/healthz", get(healthz_handler))
        .with_state(Arc::new(state))
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let config = SyncConfig::from_env();
    let store: Arc<dyn Store> = Arc::new(PgStore::connect(&config.database_url).await?);
    let alerter = build_alert_sink(&config);
    let state = AppState::new(
        store,
        alerter,
        config.thresholds,
        config.batch_size,
        Duration::from_millis(config.sub_batch_delay_ms),
    );

    let port: u16 = std::env::var("POSSYNC_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8000);
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    axum::serve(listener, app(state)).await?;
    Ok(())
}

#[derive(Debug, Deserialize)]
struct OrchestrateRequest {
    batch_id: String,
    batch_size: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct WorkerRequestBody {
    #[allow(dead_code)]
    job_id: Option<String>,
    raw_data_id: i64,
    batch_size: Option<usize>,
}

#[derive(Debug, Serialize)]
struct WorkerResponseBody {
    success: bool,
    #[serde(flatten)]
    report: WorkerReport,
}

async fn orchestrate_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<OrchestrateRequest>,
) -> Response {
    let batch_size = request.batch_size.unwrap_or(state.default_batch_size);
    match state.orchestrator.run(&request.batch_id, batch_size).await {
        Ok(summary) => Json(summary).into_response(),
        Err(err) => store_error(err),
    }
}

async fn worker_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<WorkerRequestBody>,
) -> Response {
    let batch_size = request.batch_size.unwrap_or(state.default_batch_size);
    match state.worker.process_one(request.raw_data_id, batch_size).await {
        Ok(report) => Json(WorkerResponseBody {
            success: true,
            report,
        })
        .into_response(),
        Err(WorkerError::RawNotFound(id)) => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": format!("raw record {id} not found") })),
        )
            .into_response(),
        Err(WorkerError::Store(err)) => store_error(err),
    }
}

async fn resume_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(batch_id): AxumPath<String>,
) -> Response {
    match state
        .orchestrator
        .resume(&batch_id, state.default_batch_size)
        .await
    {
        Ok(summary) => Json(summary).into_response(),
        Err(err) => store_error(err),
    }
}

async fn reconcile_handler(
    State(state): State<Arc<AppState>>,
    AxumPath((tenant_id, date)): AxumPath<(i64, NaiveDate)>,
) -> Response {
    match state.monitor.reconcile(tenant_id, date).await {
        Ok(snapshot) => Json(snapshot).into_response(),
        Err(err) => store_error(err),
    }
}

async fn job_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(batch_id): AxumPath<String>,
) -> Response {
    match state.store.get_job(&batch_id).await {
        Ok(Some(job)) => Json::<Job>(job).into_response(),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": format!("no job for batch {batch_id}") })),
        )
            .into_response(),
        Err(err) => store_error(err),
    }
}

async fn quality_handler(
    State(state): State<Arc<AppState>>,
    AxumPath((tenant_id, date)): AxumPath<(i64, NaiveDate)>,
) -> Response {
    match state.store.get_snapshot(tenant_id, date).await {
        Ok(Some(snapshot)) => Json::<QualitySnapshot>(snapshot).into_response(),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": format!("no snapshot for tenant {tenant_id} on {date}") })),
        )
            .into_response(),
        Err(err) => store_error(err),
    }
}

async fn healthz_handler() -> Response {
    Json(json!({ "status": "ok" })).into_response()
}

fn store_error(err: StoreError) -> Response {
    error!(%err, "request failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": err.to_string() })),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use http_body_util::BodyExt;
    use possync_core::{DataType, JobStatus, NewRawRecord};
    use possync_pipeline::NoopAlerter;
    use possync_store::MemStore;
    use serde_json::Value;
    use tower::ServiceExt;

    fn test_state(store: Arc<MemStore>) -> AppState {
        AppState::new(
            store as Arc<dyn Store>,
            Arc::new(NoopAlerter),
            QualityThresholds::default(),
            200,
            Duration::ZERO,
        )
    }

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 3, 14).unwrap()
    }

    async fn seed_payments(store: &MemStore, batch_id: &str, count: usize) -> i64 {
        let list: Vec<Value> = (0..count)
            .map(|i| {
                json!({
                    "reference": format!("pay-{i}"),
                    "method": "pix",
                    "gross": 5.0,
                })
            })
            .collect();
        store
            .insert_raw(NewRawRecord {
                tenant_id: 3,
                batch_id: batch_id.to_string(),
                data_type: DataType::Payments,
                logical_date: date(),
                payload: json!({ "list": list, "meta": { "page": 1, "has_more": false } }),
                record_count: count as i64,
            })
            .await
            .unwrap()
    }

    fn json_request(method: &str, uri: &str, body: Value) -> axum::http::Request<Body> {
        axum::http::Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_json(response: Response) -> Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn healthz_reports_ok() {
        let app = app(test_state(Arc::new(MemStore::new())));
        let resp = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/healthz")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await["status"], "ok");
    }

    #[tokio::test]
    async fn orchestrate_drains_a_batch_and_exposes_the_job() {
        let store = Arc::new(MemStore::new());
        seed_payments(&store, "web-1", 30).await;
        let app = app(test_state(Arc::clone(&store)));

        let resp = app
            .clone()
            .oneshot(json_request(
                "POST",
                "/sync/orchestrate",
                json!({ "batch_id": "web-1", "batch_size": 10 }),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["success"], true);
        assert_eq!(body["processed_count"], 30);

        let job = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/jobs/web-1")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(job.status(), StatusCode::OK);
        let job = body_json(job).await;
        assert_eq!(job["status"], JobStatus::Completed.as_str());
        assert_eq!(job["processed_records"], 30);
    }

    #[tokio::test]
    async fn worker_route_returns_404_for_unknown_raw() {
        let app = app(test_state(Arc::new(MemStore::new())));
        let resp = app
            .oneshot(json_request(
                "POST",
                "/sync/worker",
                json!({ "raw_data_id": 999, "batch_size": 10 }),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn worker_route_processes_one_record() {
        let store = Arc::new(MemStore::new());
        let raw_id = seed_payments(&store, "web-2", 4).await;
        let app = app(test_state(Arc::clone(&store)));

        let resp = app
            .oneshot(json_request(
                "POST",
                "/sync/worker",
                json!({ "job_id": "manual", "raw_data_id": raw_id }),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["success"], true);
        assert_eq!(body["processed_count"], 4);
        assert!(store.get_raw(raw_id).await.unwrap().unwrap().processed);
    }

    #[tokio::test]
    async fn missing_job_and_snapshot_return_404() {
        let app = app(test_state(Arc::new(MemStore::new())));
        let job = app
            .clone()
            .oneshot(
                axum::http::Request::builder()
                    .uri("/jobs/nope")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(job.status(), StatusCode::NOT_FOUND);

        let quality = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/quality/3/2026-03-14")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(quality.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn reconcile_route_persists_a_readable_snapshot() {
        let store = Arc::new(MemStore::new());
        store
            .upsert_reference_total(3, date(), 0.0, 1)
            .await
            .unwrap();
        let app = app(test_state(Arc::clone(&store)));

        let resp = app
            .clone()
            .oneshot(json_request(
                "POST",
                "/sync/reconcile/3/2026-03-14",
                json!({}),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["status"], "perfect");

        let read = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/quality/3/2026-03-14")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(read.status(), StatusCode::OK);
        assert_eq!(body_json(read).await["percent_precision"], 100.0);
    }

    #[tokio::test]
    async fn resume_route_picks_up_a_partially_drained_batch() {
        let store = Arc::new(MemStore::new());
        let first = seed_payments(&store, "web-3", 8).await;
        seed_payments(&store, "web-3", 8).await;
        let app = app(test_state(Arc::clone(&store)));

        // Pre-consume the first record, as if a previous run stopped here.
        let state_store: Arc<dyn Store> = Arc::clone(&store) as Arc<dyn Store>;
        Worker::new(Arc::clone(&state_store))
            .with_batch_delay(Duration::ZERO)
            .process_one(first, 10)
            .await
            .unwrap();

        let resp = app
            .oneshot(json_request("POST", "/sync/resume/web-3", json!({})))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["success"], true);
        assert_eq!(body["processed_count"], 8);
        assert_eq!(store.pending_row_count("web-3").await.unwrap(), 0);
    }
}
