use crate::ingest::gateway::IngestGateway;
use crate::ingest::record::{parse_timestamp, MetricRecord};
use crate::ingest::stats::StatsSnapshot;
use crate::storage::traits::{MetricQuery, MetricRow, Storage};
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Shared state for the HTTP API
#[derive(Clone)]
pub struct AppState {
    pub gateway: IngestGateway,
    pub storage: Arc<dyn Storage>,
}

#[derive(Debug, Deserialize)]
pub struct SubmitMetricRequest {
    pub source_name: String,
    pub metric_name: String,
    pub value: i64,
    /// RFC 3339. Missing, empty or unparsable values fall back to write time.
    #[serde(default)]
    pub timestamp: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SubmitMetricResponse {
    pub accepted: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StatsResponse {
    #[serde(flatten)]
    pub counters: StatsSnapshot,
    pub queue_capacity: usize,
    pub queue_depth: usize,
}

#[derive(Debug, Deserialize)]
pub struct ListMetricsQuery {
    pub source_name: Option<String>,
    pub metric_name: Option<String>,
    #[serde(default = "default_limit")]
    pub limit: usize,
}

fn default_limit() -> usize {
    100
}

/// POST /api/metrics
///
/// A full intake queue is reported as `accepted: false`, never as an HTTP error.
pub async fn submit_metric(
    State(state): State<AppState>,
    Json(request): Json<SubmitMetricRequest>,
) -> Result<Json<SubmitMetricResponse>, ApiError> {
    if request.source_name.trim().is_empty() {
        return Err(ApiError::BadRequest("source_name cannot be empty".to_string()));
    }
    if request.metric_name.trim().is_empty() {
        return Err(ApiError::BadRequest("metric_name cannot be empty".to_string()));
    }

    let timestamp = request.timestamp.as_deref().and_then(parse_timestamp);
    let record = MetricRecord::new(request.source_name, request.metric_name, request.value, timestamp);

    Ok(Json(SubmitMetricResponse {
        accepted: state.gateway.submit(record),
    }))
}

/// GET /api/metrics?source_name=&metric_name=&limit=
pub async fn list_metrics(
    State(state): State<AppState>,
    Query(query): Query<ListMetricsQuery>,
) -> Result<Json<Vec<MetricRow>>, ApiError> {
    let rows = state
        .storage
        .query_metrics(MetricQuery {
            source_name: query.source_name,
            metric_name: query.metric_name,
            limit: query.limit.clamp(1, 1000),
        })
        .await
        .map_err(|e| ApiError::InternalError(e.to_string()))?;

    Ok(Json(rows))
}

/// GET /api/stats
pub async fn get_stats(State(state): State<AppState>) -> Json<StatsResponse> {
    Json(StatsResponse {
        counters: state.gateway.stats().snapshot(),
        queue_capacity: state.gateway.capacity(),
        queue_depth: state.gateway.queue_depth(),
    })
}

pub async fn health_check() -> &'static str {
    "OK"
}

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    InternalError(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::InternalError(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };

        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}
