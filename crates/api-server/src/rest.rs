//! REST handlers for segment building, segment storage, export scheduling and
//! operational endpoints.

use std::sync::Arc;
use std::time::Instant;

use audience_cdp::{ConnectorRegistry, ConnectorStats};
use audience_core::types::{Column, Destination, EvaluationResult, ExportFormat};
use audience_core::{AudienceError, AudienceResult, QueryError};
use audience_export::JobOutcome;
use audience_scheduler::{ExportSchedule, ScheduleRequest, Scheduler};
use audience_segmentation::{ConditionSet, Segment, SegmentDefinition, SegmentationEngine};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use tracing::{error, warn};
use uuid::Uuid;

/// Creator recorded when a save request does not name one.
const DEFAULT_CREATOR: &str = "anonymous";

/// Shared application state for REST handlers.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<SegmentationEngine>,
    pub scheduler: Arc<Scheduler>,
    pub registry: Arc<ConnectorRegistry>,
    pub start_time: Instant,
}

/// Error body returned by every failing endpoint.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

pub struct ApiError(pub AudienceError);

impl From<AudienceError> for ApiError {
    fn from(e: AudienceError) -> Self {
        ApiError(e)
    }
}

fn status_for(e: &AudienceError) -> StatusCode {
    match e {
        AudienceError::Configuration(_) | AudienceError::NoConditions => StatusCode::BAD_REQUEST,
        AudienceError::NotFound(_) => StatusCode::NOT_FOUND,
        AudienceError::Query(QueryError::Rejected(_)) => StatusCode::BAD_REQUEST,
        AudienceError::Query(QueryError::Timeout { .. }) => StatusCode::GATEWAY_TIMEOUT,
        AudienceError::Query(_) => StatusCode::UNPROCESSABLE_ENTITY,
        AudienceError::Delivery(_) => StatusCode::BAD_GATEWAY,
        AudienceError::Store(_)
        | AudienceError::Render(_)
        | AudienceError::Serialization(_)
        | AudienceError::Io(_)
        | AudienceError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(&self.0);
        let code = self.0.code();
        if status.is_server_error() {
            error!(error = %self.0, code, "Request failed");
        } else {
            warn!(error = %self.0, code, "Request rejected");
        }
        metrics::counter!("api.errors", "code" => code).increment(1);
        (
            status,
            Json(ErrorResponse {
                error: code.to_string(),
                message: self.0.to_string(),
            }),
        )
            .into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, Serialize, Deserialize)]
pub struct ColumnsResponse {
    pub columns: Vec<Column>,
}

#[derive(Debug, Deserialize)]
pub struct EvaluateQueryRequest {
    pub query: String,
}

/// A segment to save: a name plus exactly one of `conditions` and `query`.
#[derive(Debug, Deserialize)]
pub struct SaveSegmentRequest {
    pub name: String,
    #[serde(default)]
    pub conditions: Option<ConditionSet>,
    #[serde(default)]
    pub query: Option<String>,
    #[serde(default)]
    pub creator: Option<String>,
}

impl SaveSegmentRequest {
    fn definition(&mut self) -> AudienceResult<SegmentDefinition> {
        match (self.conditions.take(), self.query.take()) {
            (Some(conditions), None) => Ok(SegmentDefinition::Conditions(conditions)),
            (None, Some(query)) => Ok(SegmentDefinition::RawQuery(query)),
            (Some(_), Some(_)) => Err(AudienceError::config(
                "a segment is defined by either conditions or query, not both",
            )),
            (None, None) => Err(AudienceError::config(
                "one of conditions or query is required",
            )),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SaveSegmentResponse {
    pub message: String,
    pub segment: Segment,
}

#[derive(Debug, Deserialize)]
pub struct ExportNowRequest {
    pub segment_name: String,
    pub format: ExportFormat,
    #[serde(default)]
    pub destination: Destination,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub uptime_secs: u64,
    pub dataset_rows: usize,
    pub schedules: usize,
}

/// GET /api/columns: Field catalog.
pub async fn list_columns(State(state): State<AppState>) -> Json<ColumnsResponse> {
    Json(ColumnsResponse {
        columns: state.engine.catalog().to_vec(),
    })
}

/// POST /api/evaluate-segment: Preview a condition set.
pub async fn evaluate_segment(
    State(state): State<AppState>,
    Json(conditions): Json<ConditionSet>,
) -> ApiResult<Json<EvaluationResult>> {
    Ok(Json(state.engine.evaluate_conditions(&conditions)?))
}

/// POST /api/evaluate-query: Preview a raw query.
pub async fn evaluate_query(
    State(state): State<AppState>,
    Json(request): Json<EvaluateQueryRequest>,
) -> ApiResult<Json<EvaluationResult>> {
    Ok(Json(state.engine.evaluate_query(&request.query).await?))
}

/// POST /api/save-segment: Create or replace a named segment.
pub async fn save_segment(
    State(state): State<AppState>,
    Json(mut request): Json<SaveSegmentRequest>,
) -> ApiResult<(StatusCode, Json<SaveSegmentResponse>)> {
    let definition = request.definition()?;
    let creator = request.creator.as_deref().unwrap_or(DEFAULT_CREATOR);
    let segment = state
        .engine
        .save_segment(&request.name, definition, creator)
        .await?;
    metrics::counter!("api.segments_saved").increment(1);
    Ok((
        StatusCode::CREATED,
        Json(SaveSegmentResponse {
            message: "Segment saved successfully".to_string(),
            segment,
        }),
    ))
}

/// GET /api/segments
pub async fn list_segments(State(state): State<AppState>) -> ApiResult<Json<Vec<Segment>>> {
    Ok(Json(state.engine.list_segments()?))
}

/// DELETE /api/segments/:name
pub async fn delete_segment(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<StatusCode> {
    state.engine.delete_segment(&name)?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /api/schedule-export: Create a recurring export.
pub async fn schedule_export(
    State(state): State<AppState>,
    Json(request): Json<ScheduleRequest>,
) -> ApiResult<(StatusCode, Json<ExportSchedule>)> {
    let schedule = state.scheduler.create_schedule(request)?;
    Ok((StatusCode::CREATED, Json(schedule)))
}

/// GET /api/schedules
pub async fn list_schedules(State(state): State<AppState>) -> Json<Vec<ExportSchedule>> {
    Json(state.scheduler.list_schedules())
}

/// DELETE /api/schedules/:id
pub async fn delete_schedule(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    state.scheduler.delete_schedule(id)?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /api/export-now: Run one export and wait for it. A failed run is
/// reported as 502 with the outcome as the body.
pub async fn export_now(
    State(state): State<AppState>,
    Json(request): Json<ExportNowRequest>,
) -> ApiResult<(StatusCode, Json<JobOutcome>)> {
    let outcome = state
        .scheduler
        .export_now(&request.segment_name, request.format, request.destination)
        .await?;
    let status = if outcome.is_success() {
        StatusCode::OK
    } else {
        StatusCode::BAD_GATEWAY
    };
    Ok((status, Json(outcome)))
}

/// GET /api/destinations: Delivery statistics per destination.
pub async fn list_destinations(State(state): State<AppState>) -> Json<Vec<ConnectorStats>> {
    Json(state.registry.stats())
}

/// GET /health: Health check endpoint.
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        uptime_secs: state.start_time.elapsed().as_secs(),
        dataset_rows: state.engine.dataset().len(),
        schedules: state.scheduler.list_schedules().len(),
    })
}

/// GET /ready: Ready once the field catalog is loaded.
pub async fn readiness(State(state): State<AppState>) -> StatusCode {
    if state.engine.catalog().is_empty() {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    }
}

/// GET /live
pub async fn liveness() -> StatusCode {
    StatusCode::OK
}
