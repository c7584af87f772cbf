use axum::{
    extract::{Path, State},
    Json,
};

use crate::api::handlers::credentials::AppState;
use crate::api::middleware::AppError;
use crate::models::{RunMetricQueryRequest, RunMetricQueryResponse};

/// Compile and run a metric query against the project's warehouse
pub async fn run_query(
    State(state): State<AppState>,
    Path(project_uuid): Path<String>,
    Json(payload): Json<RunMetricQueryRequest>,
) -> Result<Json<RunMetricQueryResponse>, AppError> {
    tracing::info!(
        "Running metric query on explore {} for project {}",
        payload.explore.name,
        project_uuid
    );

    let response = state
        .query_service
        .run_metric_query(&project_uuid, payload)
        .await?;

    Ok(Json(response))
}
