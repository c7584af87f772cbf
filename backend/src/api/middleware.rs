use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Application error types
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Not found: {0}")]
    NotFound(String),

    /// Stored credentials could not be decrypted or parsed
    #[error("Failed to decode warehouse credentials: {0}")]
    Decode(String),

    #[error("Warehouse execution error: {0}")]
    WarehouseExecution(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("SSH tunnel error: {0}")]
    Tunnel(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Invalid SQL: {0}")]
    InvalidSql(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Query timed out: {0}")]
    Timeout(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Internal server error: {0}")]
    Internal(String),
}

/// Error response format
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: ErrorDetail,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl ErrorDetail {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }
}

impl AppError {
    /// HTTP status and machine-readable code for this error
    pub fn status_and_code(&self) -> (StatusCode, &'static str) {
        match self {
            AppError::NotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND"),
            AppError::Decode(_) => (StatusCode::INTERNAL_SERVER_ERROR, "UNEXPECTED_SERVER_ERROR"),
            AppError::WarehouseExecution(_) => (StatusCode::BAD_GATEWAY, "WAREHOUSE_QUERY_ERROR"),
            AppError::Connection(_) => (StatusCode::BAD_GATEWAY, "WAREHOUSE_CONNECTION_ERROR"),
            AppError::Tunnel(_) => (StatusCode::BAD_GATEWAY, "SSH_TUNNEL_ERROR"),
            AppError::Forbidden(_) => (StatusCode::FORBIDDEN, "FORBIDDEN"),
            AppError::InvalidSql(_) => (StatusCode::BAD_REQUEST, "INVALID_SQL"),
            AppError::Validation(_) => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR"),
            AppError::Timeout(_) => (StatusCode::GATEWAY_TIMEOUT, "QUERY_TIMEOUT"),
            AppError::Database(_) => (StatusCode::INTERNAL_SERVER_ERROR, "DATABASE_ERROR"),
            AppError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code) = self.status_and_code();

        let error_detail = match self {
            // Never echo decryption internals back to the caller
            AppError::Decode(msg) => {
                tracing::error!("Credential decode failure: {}", msg);
                ErrorDetail::new(code, "Warehouse credentials could not be read. Please re-enter the project connection settings.")
            }
            AppError::WarehouseExecution(msg) => {
                let enhanced_msg = if msg.contains("does not exist") {
                    format!("{} Check that the explore's tables and columns still exist in the warehouse.", msg)
                } else {
                    msg
                };
                ErrorDetail::new(code, enhanced_msg)
            }
            AppError::Tunnel(msg) => ErrorDetail::new(code, "Could not open the SSH tunnel to the warehouse")
                .with_details(msg),
            AppError::InvalidSql(msg) => {
                ErrorDetail::new(code, format!("{} Only SELECT queries can be compiled from a metric query.", msg))
            }
            AppError::Timeout(msg) => ErrorDetail::new(
                code,
                format!("{} Consider reducing the number of fields or adding filters.", msg),
            ),
            AppError::NotFound(msg)
            | AppError::Connection(msg)
            | AppError::Forbidden(msg)
            | AppError::Validation(msg)
            | AppError::Database(msg)
            | AppError::Internal(msg) => ErrorDetail::new(code, msg),
        };

        let body = Json(ErrorResponse {
            error: error_detail,
        });

        (status, body).into_response()
    }
}

/// Convert anyhow::Error to AppError
impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

/// Convert rusqlite::Error to AppError
impl From<rusqlite::Error> for AppError {
    fn from(err: rusqlite::Error) -> Self {
        AppError::Database(err.to_string())
    }
}
