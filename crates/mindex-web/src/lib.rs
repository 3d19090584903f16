//! JSON job-trigger surface over the sync engine and reconciliation
//! runner. Deliberately thin: no UI, no persistence of its own.

use std::sync::Arc;

use axum::{
    extract::{Path as AxumPath, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use mindex_adapters::ExternalRecordDto;
use mindex_core::ExternalRecord;
use mindex_reconcile::{reconcile, Matcher, ReconcileReport};
use mindex_storage::{InMemoryMirror, MirrorStore};
use mindex_sync::{JobSlot, SyncEngine, SyncError};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::warn;

pub const CRATE_NAME: &str = "mindex-web";

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<SyncEngine>,
    pub mirror: Arc<InMemoryMirror>,
    pub matcher: Arc<Matcher>,
    pub job_slot: JobSlot,
}

impl AppState {
    /// `job_slot` must be the same slot any scheduler shares, so manual
    /// triggers and cron jobs exclude each other.
    pub fn new(
        engine: Arc<SyncEngine>,
        mirror: Arc<InMemoryMirror>,
        matcher: Matcher,
        job_slot: JobSlot,
    ) -> Self {
        Self {
            engine,
            mirror,
            matcher: Arc::new(matcher),
            job_slot,
        }
    }
}

#[derive(Debug, Deserialize)]
struct SyncRangeRequest {
    start_id: i64,
    end_id: i64,
    #[serde(default)]
    batch_size: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct ValidateSampleRequest {
    sample_size: usize,
    #[serde(default)]
    older_than: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct RefreshIncompleteRequest {
    limit: usize,
}

#[derive(Debug, Default, Deserialize)]
struct ChangesQuery {
    limit: Option<usize>,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    mirrored_records: usize,
    max_reference_id: i64,
}

#[derive(Debug, Serialize)]
struct ReconcileResponse {
    report: ReconcileReport,
    skipped: Vec<String>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/records/{id}", get(record_handler))
        .route("/changes", get(changes_handler))
        .route("/jobs/sync-range", post(sync_range_handler))
        .route("/jobs/validate-sample", post(validate_sample_handler))
        .route("/jobs/refresh-incomplete", post(refresh_incomplete_handler))
        .route("/jobs/reconcile", post(reconcile_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn health_handler(State(state): State<Arc<AppState>>) -> Response {
    let max_reference_id = match state.mirror.max_id().await {
        Ok(id) => id,
        Err(err) => return server_error(err.to_string()),
    };
    Json(HealthResponse {
        status: "ok",
        mirrored_records: state.mirror.len(),
        max_reference_id,
    })
    .into_response()
}

async fn record_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<i64>,
) -> Response {
    match state.mirror.get_by_id(id).await {
        Ok(Some(record)) => Json(record).into_response(),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({"error": "record not mirrored"})),
        )
            .into_response(),
        Err(err) => server_error(err.to_string()),
    }
}

async fn changes_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ChangesQuery>,
) -> Response {
    match state.mirror.recent_changes(query.limit.unwrap_or(100)).await {
        Ok(changes) => Json(changes).into_response(),
        Err(err) => server_error(err.to_string()),
    }
}

async fn sync_range_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SyncRangeRequest>,
) -> Response {
    if req.start_id > req.end_id || req.start_id < 1 {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({"error": "invalid id range"})),
        )
            .into_response();
    }
    let Some(_guard) = state.job_slot.try_acquire() else {
        return job_busy();
    };
    into_job_response(
        state
            .engine
            .sync_range(req.start_id, req.end_id, req.batch_size)
            .await,
    )
}

async fn validate_sample_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ValidateSampleRequest>,
) -> Response {
    let Some(_guard) = state.job_slot.try_acquire() else {
        return job_busy();
    };
    into_job_response(
        state
            .engine
            .validate_sample(req.sample_size, req.older_than)
            .await,
    )
}

async fn refresh_incomplete_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<RefreshIncompleteRequest>,
) -> Response {
    let Some(_guard) = state.job_slot.try_acquire() else {
        return job_busy();
    };
    into_job_response(state.engine.refresh_incomplete(req.limit).await)
}

/// Reconciliation is read-only against the mirror, so it does not take
/// the job slot.
async fn reconcile_handler(
    State(state): State<Arc<AppState>>,
    Json(rows): Json<Vec<ExternalRecordDto>>,
) -> Response {
    let mut records: Vec<ExternalRecord> = Vec::with_capacity(rows.len());
    let mut skipped = Vec::new();
    for (index, row) in rows.into_iter().enumerate() {
        match row.into_record() {
            Ok(record) => records.push(record),
            Err(err) => {
                warn!(row = index, error = %err, "skipping malformed reconcile row");
                skipped.push(format!("row {index}: {err}"));
            }
        }
    }
    let report = reconcile(records, state.mirror.as_ref(), &state.matcher);
    Json(ReconcileResponse { report, skipped }).into_response()
}

fn into_job_response(result: Result<mindex_sync::SyncSummary, SyncError>) -> Response {
    match result {
        Ok(summary) => Json(summary).into_response(),
        Err(SyncError::Connection(msg)) => (
            StatusCode::BAD_GATEWAY,
            Json(serde_json::json!({"error": msg})),
        )
            .into_response(),
        Err(err) => server_error(err.to_string()),
    }
}

fn job_busy() -> Response {
    (
        StatusCode::CONFLICT,
        Json(serde_json::json!({"error": "another sync job is running"})),
    )
        .into_response()
}

fn server_error(message: String) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(serde_json::json!({"error": message})),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use mindex_adapters::{ReferenceSource, SourceError};
    use mindex_core::ReferenceRecord;
    use mindex_sync::SyncConfig;
    use tower::util::ServiceExt;

    struct EmptySource;

    #[async_trait]
    impl ReferenceSource for EmptySource {
        async fn fetch_by_id(&self, _id: i64) -> Result<Option<ReferenceRecord>, SourceError> {
            Ok(None)
        }

        async fn search_by_name(
            &self,
            _query: &str,
            _page: usize,
            _page_size: usize,
        ) -> Result<Vec<ReferenceRecord>, SourceError> {
            Ok(Vec::new())
        }
    }

    fn test_state() -> AppState {
        let mirror = Arc::new(InMemoryMirror::new());
        let engine = Arc::new(SyncEngine::new(
            Arc::new(EmptySource),
            Arc::clone(&mirror) as Arc<dyn MirrorStore>,
            &SyncConfig {
                requests_per_minute: 600_000,
                ..SyncConfig::default()
            },
        ));
        AppState::new(engine, mirror, Matcher::default(), JobSlot::new())
    }

    fn seed_record(id: i64, name: &str) -> ReferenceRecord {
        let mut rec = ReferenceRecord {
            reference_id: id,
            canonical_name: name.to_string(),
            formula: None,
            formula_plain: None,
            classification_parts: [None, None, None, None],
            status: "approved".to_string(),
            color: None,
            luster: None,
            streak: None,
            crystal_system: None,
            hardness: None,
            variety_of: None,
            group_id: None,
            synonym_of: None,
            polytype_of: None,
            content_hash: String::new(),
            last_synced_at: Utc::now(),
        };
        rec.refresh_content_hash();
        rec
    }

    #[tokio::test]
    async fn health_reports_mirror_stats() {
        let state = test_state();
        state.mirror.upsert(seed_record(42, "Quartz")).await.unwrap();
        let app = app(state);

        let response = app
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["mirrored_records"], 1);
        assert_eq!(value["max_reference_id"], 42);
    }

    #[tokio::test]
    async fn record_lookup_distinguishes_missing() {
        let state = test_state();
        state.mirror.upsert(seed_record(42, "Quartz")).await.unwrap();
        let router = app(state);

        let found = router
            .clone()
            .oneshot(Request::get("/records/42").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(found.status(), StatusCode::OK);

        let missing = router
            .oneshot(Request::get("/records/43").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn sync_range_rejects_invalid_range() {
        let router = app(test_state());
        let response = router
            .oneshot(
                Request::post("/jobs/sync-range")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"start_id": 10, "end_id": 5}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn sync_range_returns_summary_json() {
        let router = app(test_state());
        let response = router
            .oneshot(
                Request::post("/jobs/sync-range")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"start_id": 1, "end_id": 3}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["checked"], 3);
        assert_eq!(value["new"], 0);
    }

    #[tokio::test]
    async fn reconcile_reports_matches_and_skips() {
        let state = test_state();
        state.mirror.upsert(seed_record(3337, "Quartz")).await.unwrap();
        let router = app(state);

        let payload = r#"[
            {"title": "Quartz", "reference_id": "3337"},
            {"title": ""},
            {"title": "Unobtainium"}
        ]"#;
        let response = router
            .oneshot(
                Request::post("/jobs/reconcile")
                    .header("content-type", "application/json")
                    .body(Body::from(payload))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["report"]["total"], 2);
        assert_eq!(value["report"]["by_strategy"]["exact-id"], 1);
        assert_eq!(value["skipped"].as_array().unwrap().len(), 1);
    }
}
