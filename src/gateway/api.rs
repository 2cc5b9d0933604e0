use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use reelsmith_common::{JobId, JobView};
use serde::{Deserialize, Serialize};
use tracing::info;

use super::events::{self, EventStreamSettings};
use crate::artifact::Brief;
use crate::errors::RegistryError;
use crate::pipeline::JobRunner;
use crate::store::JobStore;

/// Header a caller may set to thread its own id through the job's logs.
pub const CORRELATION_HEADER: &str = "x-correlation-id";

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub runner: JobRunner,
    pub store: JobStore,
    pub events: EventStreamSettings,
}

impl AppState {
    pub fn new(runner: JobRunner, events: EventStreamSettings) -> Self {
        let store = runner.registry().store().clone();
        Self {
            runner,
            store,
            events,
        }
    }
}

pub type SharedState = Arc<AppState>;

#[derive(Debug, Serialize, Deserialize)]
pub struct SubmitResponse {
    pub id: JobId,
}

// ── Error handling ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Conflict(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(serde_json::json!({"error": message}))).into_response()
    }
}

impl From<RegistryError> for ApiError {
    fn from(e: RegistryError) -> Self {
        match e {
            RegistryError::JobNotFound { .. } => ApiError::NotFound(e.to_string()),
            RegistryError::InvalidTransition { .. } | RegistryError::NotRunning { .. } => {
                ApiError::Conflict(e.to_string())
            }
            RegistryError::Store(_) => ApiError::Internal(e.to_string()),
        }
    }
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/jobs", post(submit_job))
        .route("/jobs/{id}", get(get_job))
        .route("/jobs/{id}/cancel", post(cancel_job))
        .route("/jobs/{id}/events", get(events::job_events))
        .route("/health", get(health_check))
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health_check() -> &'static str {
    "ok"
}

async fn submit_job(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Json(brief): Json<Brief>,
) -> Result<impl IntoResponse, ApiError> {
    if brief.prompt.trim().is_empty() && brief.scenes.is_none() {
        return Err(ApiError::BadRequest(
            "Brief needs a prompt or a list of scenes".to_string(),
        ));
    }
    let correlation_id = headers
        .get(CORRELATION_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let id = state.runner.submit(brief, correlation_id).await?;
    info!(job_id = %id, "Job submitted");
    Ok((StatusCode::ACCEPTED, Json(SubmitResponse { id })))
}

/// Polling reads the replicated view, never the registry.
async fn get_job(
    State(state): State<SharedState>,
    Path(id): Path<JobId>,
) -> Result<Json<JobView>, ApiError> {
    state
        .store
        .get(id)
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("Job {} not found", id)))
}

async fn cancel_job(
    State(state): State<SharedState>,
    Path(id): Path<JobId>,
) -> Result<impl IntoResponse, ApiError> {
    let job = state.runner.registry().cancel(id).await?;
    Ok((StatusCode::ACCEPTED, Json(JobView::from(&job))))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ReelsmithToml;
    use crate::job::{JobRegistry, StageRanges};
    use crate::pipeline::{PipelineSettings, Providers};
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use reelsmith_common::JobStatus;
    use std::time::Duration;
    use tower::ServiceExt;

    fn test_state(work_dir: &std::path::Path) -> SharedState {
        let mut config = ReelsmithToml::default();
        config.paths.work_dir = work_dir.to_path_buf();
        config.encoder.program = "/nonexistent/encoder".into();
        let registry = JobRegistry::new(JobStore::default(), StageRanges::default());
        let runner = JobRunner::new(
            registry,
            Providers::from_config(&config),
            PipelineSettings::from_config(&config),
        );
        Arc::new(AppState::new(
            runner,
            EventStreamSettings {
                lookup_window: Duration::from_millis(200),
                lookup_interval: Duration::from_millis(20),
                keepalive: Duration::from_secs(15),
            },
        ))
    }

    async fn body_json(resp: Response) -> serde_json::Value {
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health_check() {
        let dir = tempfile::tempdir().unwrap();
        let app = api_router().with_state(test_state(dir.path()));
        let req = Request::builder().uri("/health").body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&bytes[..], b"ok");
    }

    #[tokio::test]
    async fn test_get_unknown_job_is_404() {
        let dir = tempfile::tempdir().unwrap();
        let app = api_router().with_state(test_state(dir.path()));
        let req = Request::builder()
            .uri(format!("/jobs/{}", uuid::Uuid::new_v4()))
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        assert!(body_json(resp).await["error"].as_str().unwrap().contains("not found"));
    }

    #[tokio::test]
    async fn test_submit_rejects_empty_brief() {
        let dir = tempfile::tempdir().unwrap();
        let app = api_router().with_state(test_state(dir.path()));
        let req = Request::builder()
            .method("POST")
            .uri("/jobs")
            .header("content-type", "application/json")
            .body(Body::from(r#"{"title":"t","prompt":"  "}"#))
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_submit_then_poll() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path());
        let app = api_router().with_state(state.clone());

        let req = Request::builder()
            .method("POST")
            .uri("/jobs")
            .header("content-type", "application/json")
            .header(CORRELATION_HEADER, "corr-42")
            .body(Body::from(r#"{"title":"Tides","prompt":"The moon pulls the sea."}"#))
            .unwrap();
        let resp = app.clone().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::ACCEPTED);
        let id = body_json(resp).await["id"].as_str().unwrap().to_string();

        // Creation is replicated before submit returns.
        let req = Request::builder()
            .uri(format!("/jobs/{}", id))
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let view = body_json(resp).await;
        assert_eq!(view["id"], id);
        assert!(view["percent"].as_u64().unwrap() <= 100);
        assert!(view.get("revision").is_none());

        let job = state.runner.registry().get(id.parse().unwrap()).unwrap();
        assert_eq!(job.correlation_id, "corr-42");
    }

    #[tokio::test]
    async fn test_cancel_twice_conflicts() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path());
        let ctx = state.runner.registry().create("c").await.unwrap();
        let app = api_router().with_state(state.clone());

        let cancel = || {
            Request::builder()
                .method("POST")
                .uri(format!("/jobs/{}/cancel", ctx.job_id))
                .body(Body::empty())
                .unwrap()
        };
        let resp = app.clone().oneshot(cancel()).await.unwrap();
        assert_eq!(resp.status(), StatusCode::ACCEPTED);
        assert_eq!(body_json(resp).await["status"], "canceled");
        assert!(ctx.cancel.is_cancelled());

        let resp = app.clone().oneshot(cancel()).await.unwrap();
        assert_eq!(resp.status(), StatusCode::CONFLICT);

        // Terminal state is visible to the very next poll.
        let view = state.store.get(ctx.job_id).unwrap();
        assert_eq!(view.status, JobStatus::Canceled);
    }

    #[tokio::test]
    async fn test_cancel_unknown_job_is_404() {
        let dir = tempfile::tempdir().unwrap();
        let app = api_router().with_state(test_state(dir.path()));
        let req = Request::builder()
            .method("POST")
            .uri(format!("/jobs/{}/cancel", uuid::Uuid::new_v4()))
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
