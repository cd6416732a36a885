//! HTTP API for the decision engine
//!
//! Thin boundary over the scheduler registry: config-in from the
//! reconciler, schedule-out to the router, manual overrides, router
//! feedback, health and Prometheus metrics.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use prometheus::{Encoder, TextEncoder};
use scheduler_lib::{ConfigUpdate, EngineError, ManualScheduleRequest, SchedulerRegistry};
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tracing::info;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<SchedulerRegistry>,
    pub default_namespace: String,
    pub default_name: String,
}

impl AppState {
    pub fn new(
        registry: Arc<SchedulerRegistry>,
        default_namespace: impl Into<String>,
        default_name: impl Into<String>,
    ) -> Self {
        Self {
            registry,
            default_namespace: default_namespace.into(),
            default_name: default_name.into(),
        }
    }
}

/// Router feedback payload: realised flavour counts over a window.
#[derive(Debug, Deserialize)]
pub struct FeedbackRequest {
    #[serde(default = "default_feedback_window")]
    pub window_seconds: f64,
    pub total_requests: u64,
    #[serde(default)]
    pub flavour_counts: BTreeMap<String, u64>,
}

fn default_feedback_window() -> f64 {
    30.0
}

fn error_response(error: EngineError) -> Response {
    match error {
        EngineError::Validation(message) => {
            (StatusCode::BAD_REQUEST, Json(json!({ "error": message }))).into_response()
        }
        EngineError::NotFound { namespace, name } => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": format!("unknown schedule {namespace}/{name}") })),
        )
            .into_response(),
        EngineError::Pending { .. } => (
            StatusCode::ACCEPTED,
            Json(json!({ "status": "pending" })),
        )
            .into_response(),
        EngineError::Internal(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": e.to_string() })),
        )
            .into_response(),
    }
}

/// PUT /config/{namespace}/{name} - idempotent configuration merge.
async fn update_config(
    State(state): State<Arc<AppState>>,
    Path((namespace, name)): Path<(String, String)>,
    Json(update): Json<ConfigUpdate>,
) -> Response {
    match state.registry.update_config(&namespace, &name, update).await {
        Ok(()) => (
            StatusCode::ACCEPTED,
            Json(json!({ "status": "accepted" })),
        )
            .into_response(),
        Err(e) => error_response(e),
    }
}

async fn schedule_for(state: &AppState, namespace: &str, name: &str) -> Response {
    match state.registry.get(namespace, name).await {
        Ok(session) => match session.latest().await {
            Some(snapshot) => (StatusCode::OK, Json(snapshot)).into_response(),
            None => error_response(EngineError::Pending {
                namespace: namespace.to_string(),
                name: name.to_string(),
            }),
        },
        Err(e) => error_response(e),
    }
}

/// GET /schedule/{namespace}/{name}
async fn get_schedule(
    State(state): State<Arc<AppState>>,
    Path((namespace, name)): Path<(String, String)>,
) -> Response {
    schedule_for(&state, &namespace, &name).await
}

/// GET /schedule - default-key alias.
async fn get_default_schedule(State(state): State<Arc<AppState>>) -> Response {
    schedule_for(&state, &state.default_namespace, &state.default_name).await
}

async fn manual_for(
    state: &AppState,
    namespace: &str,
    name: &str,
    request: ManualScheduleRequest,
) -> Response {
    let session = state.registry.ensure_session(namespace, name).await;
    match session.override_schedule(request).await {
        Ok(_) => (
            StatusCode::ACCEPTED,
            Json(json!({ "status": "schedule set" })),
        )
            .into_response(),
        Err(e) => error_response(e),
    }
}

/// POST /schedule/{namespace}/{name}/manual
async fn set_manual_schedule(
    State(state): State<Arc<AppState>>,
    Path((namespace, name)): Path<(String, String)>,
    Json(request): Json<ManualScheduleRequest>,
) -> Response {
    manual_for(&state, &namespace, &name, request).await
}

/// POST /setschedule - default-key alias.
async fn set_default_manual_schedule(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ManualScheduleRequest>,
) -> Response {
    let namespace = state.default_namespace.clone();
    let name = state.default_name.clone();
    manual_for(&state, &namespace, &name, request).await
}

/// POST /feedback/{namespace}/{name} - realised distribution from the router.
async fn receive_feedback(
    State(state): State<Arc<AppState>>,
    Path((namespace, name)): Path<(String, String)>,
    Json(request): Json<FeedbackRequest>,
) -> Response {
    let session = match state.registry.get(&namespace, &name).await {
        Ok(session) => session,
        Err(e) => return error_response(e),
    };
    match session
        .process_feedback(
            &request.flavour_counts,
            request.total_requests,
            request.window_seconds,
        )
        .await
    {
        Ok(summary) => (StatusCode::OK, Json(summary)).into_response(),
        Err(e) => error_response(e),
    }
}

/// Health check; 200 once the API task is serving.
async fn healthz() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

/// Prometheus metrics endpoint
async fn metrics() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();

    encoder
        .encode(&metric_families, &mut buffer)
        .unwrap_or_default();

    (
        StatusCode::OK,
        [("content-type", "text/plain; charset=utf-8")],
        buffer,
    )
}

/// Create the API router
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/config/{namespace}/{name}", put(update_config))
        .route("/schedule", get(get_default_schedule))
        .route("/schedule/{namespace}/{name}", get(get_schedule))
        .route(
            "/schedule/{namespace}/{name}/manual",
            post(set_manual_schedule),
        )
        .route("/setschedule", post(set_default_manual_schedule))
        .route("/feedback/{namespace}/{name}", post(receive_feedback))
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics))
        .with_state(state)
}

/// Serve the API on an already-bound listener.
pub async fn serve(listener: TcpListener, state: Arc<AppState>) -> anyhow::Result<()> {
    let app = create_router(state);
    info!(addr = %listener.local_addr()?, "Starting API server");
    axum::serve(listener, app).await?;
    Ok(())
}

/// Serve the standalone metrics scrape endpoint.
pub async fn serve_metrics(listener: TcpListener) -> anyhow::Result<()> {
    let app = Router::new().route("/metrics", get(metrics));
    info!(addr = %listener.local_addr()?, "Starting metrics server");
    axum::serve(listener, app).await?;
    Ok(())
}
