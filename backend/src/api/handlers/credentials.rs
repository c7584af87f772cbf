use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use std::sync::Arc;

use crate::api::middleware::AppError;
use crate::models::SaveCredentialsRequest;
use crate::services::{ProjectCredentialStore, ProjectQueryService};

/// Application state
#[derive(Clone)]
pub struct AppState {
    pub query_service: Arc<ProjectQueryService>,
    pub credential_store: Arc<ProjectCredentialStore>,
}

/// Check, encrypt and save a project's warehouse credentials
pub async fn save_credentials(
    State(state): State<AppState>,
    Path(project_uuid): Path<String>,
    Json(payload): Json<SaveCredentialsRequest>,
) -> Result<StatusCode, AppError> {
    if project_uuid.trim().is_empty() {
        return Err(AppError::Validation("Project UUID cannot be empty".to_string()));
    }
    if payload.organization_uuid.trim().is_empty() {
        return Err(AppError::Validation("Organization UUID cannot be empty".to_string()));
    }

    tracing::info!(
        "Saving warehouse credentials for project {}: {}",
        project_uuid,
        payload.credentials.describe()
    );

    // Unreachable credentials are rejected before they replace working ones
    state.query_service.test_credentials(&payload.credentials).await?;

    state
        .credential_store
        .save_credentials(&project_uuid, &payload.organization_uuid, &payload.credentials)
        .await?;

    // The next query rebuilds its client from the new credentials
    state.query_service.clients().remove_client(&project_uuid).await;

    Ok(StatusCode::NO_CONTENT)
}
