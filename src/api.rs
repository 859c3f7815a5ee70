//! HTTP API handlers for the alert relay.
//!
//! - **POST /alerts**: Run an alert through the pipeline. Returns `202 Accepted`
//!   once notification tasks are queued, `409` when nobody can be notified.
//! - **GET /queue/stats**: Lane lengths and queue counters.
//! - **POST /queue/cleanup**: Evict expired dedup entries now.
//! - **GET /health**: Liveness check.
//!
//! Handlers log alert and device identifiers only. Recipient contact details
//! never reach the logs.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use serde::Serialize;
use tracing::{info, instrument, warn};

use crate::model::{AlertIntake, QueueStats};
use crate::pipeline::{AlertPipeline, ProcessedAlert};
use crate::queue::PriorityDeduplicatingQueue;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<AlertPipeline>,
    pub queue: Arc<PriorityDeduplicatingQueue>,
}

impl AppState {
    pub fn new(pipeline: AlertPipeline) -> Self {
        let queue = Arc::clone(pipeline.queue());
        Self {
            pipeline: Arc::new(pipeline),
            queue,
        }
    }
}

/// Error body returned by `POST /alerts`.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: &'static str,
    pub message: String,
}

/// Body returned by `POST /queue/cleanup`.
#[derive(Debug, Serialize)]
pub struct CleanupResponse {
    pub evicted: usize,
    pub remaining: usize,
}

/// Build the router with every relay endpoint.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/alerts", post(post_alert))
        .route("/queue/stats", get(get_queue_stats))
        .route("/queue/cleanup", post(post_queue_cleanup))
        .route("/health", get(health_check))
        .with_state(state)
}

/// POST /alerts - Process an alert.
///
/// # Request Body
///
/// ```json
/// {
///     "alert_type": "FALL_DETECTION",
///     "device_sn": "DEV-001",
///     "timestamp": "2024-03-05T23:30:00Z",
///     "severity": "CRITICAL",
///     "org_id": "ward-3"
/// }
/// ```
///
/// `alert_id` is generated when absent.
///
/// # Response
///
/// `202 Accepted` with the processed alert. When nobody can be notified the
/// response is `409 Conflict` with an [`ErrorResponse`] whose `error` is
/// `"no_recipients"`. Malformed bodies are rejected by the extractor with `422`.
#[instrument(skip_all)]
pub async fn post_alert(
    State(state): State<AppState>,
    Json(intake): Json<AlertIntake>,
) -> Result<(StatusCode, Json<ProcessedAlert>), (StatusCode, Json<ErrorResponse>)> {
    match state.pipeline.process(&intake).await {
        Ok(processed) => Ok((StatusCode::ACCEPTED, Json(processed))),
        Err(e) if e.is_planning() => {
            warn!(error = %e, "Alert could not be distributed");
            Err((
                StatusCode::CONFLICT,
                Json(ErrorResponse {
                    error: "no_recipients",
                    message: e.to_string(),
                }),
            ))
        }
        Err(e) => {
            warn!(error = %e, "Alert processing failed");
            Err((
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorResponse {
                    error: "internal",
                    message: "alert processing failed".to_string(),
                }),
            ))
        }
    }
}

/// GET /queue/stats - Queue occupancy and counters.
pub async fn get_queue_stats(State(state): State<AppState>) -> Json<QueueStats> {
    Json(state.queue.queue_stats())
}

/// POST /queue/cleanup - Evict expired dedup entries.
#[instrument(skip(state))]
pub async fn post_queue_cleanup(State(state): State<AppState>) -> Json<CleanupResponse> {
    let evicted = state.queue.clean_expired_dedup_entries();
    let remaining = state.queue.dedup_entries();
    info!(evicted, remaining, "Dedup entries cleaned");
    Json(CleanupResponse { evicted, remaining })
}

/// GET /health - Simple health check endpoint.
pub async fn health_check() -> impl IntoResponse {
    StatusCode::OK
}
