// Warehouse abstraction layer, one client per supported dialect
pub mod adapter;
pub mod bigquery;
pub mod databricks;
pub mod postgresql;
pub mod snowflake;

pub use adapter::{DialectHints, QueryResult, WarehouseClient};
pub use bigquery::BigqueryWarehouseClient;
pub use databricks::DatabricksWarehouseClient;
pub use postgresql::PostgresWarehouseClient;
pub use snowflake::SnowflakeWarehouseClient;

use crate::api::middleware::AppError;
use crate::models::WarehouseCredentials;
use serde_json::{json, Value};
use std::sync::Arc;

/// Builds warehouse clients from resolved credentials
pub trait WarehouseClientFactory: Send + Sync {
    fn create(&self, credentials: &WarehouseCredentials) -> Result<Arc<dyn WarehouseClient>, AppError>;
}

/// Factory dispatching on the credentials' dialect tag
pub struct DefaultWarehouseClientFactory {
    http: reqwest::Client,
    timeout_secs: u64,
}

impl DefaultWarehouseClientFactory {
    pub fn new(timeout_secs: u64) -> Result<Self, AppError> {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| AppError::Internal(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self { http, timeout_secs })
    }
}

impl WarehouseClientFactory for DefaultWarehouseClientFactory {
    fn create(&self, credentials: &WarehouseCredentials) -> Result<Arc<dyn WarehouseClient>, AppError> {
        create_warehouse_client(credentials, self.http.clone(), self.timeout_secs)
    }
}

/// Factory function to create the appropriate warehouse client
pub fn create_warehouse_client(
    credentials: &WarehouseCredentials,
    http: reqwest::Client,
    timeout_secs: u64,
) -> Result<Arc<dyn WarehouseClient>, AppError> {
    tracing::info!("Creating warehouse client for {}", credentials.describe());
    let client: Arc<dyn WarehouseClient> = match credentials {
        WarehouseCredentials::Postgres(_) | WarehouseCredentials::Redshift(_) => {
            Arc::new(PostgresWarehouseClient::new(credentials.clone(), timeout_secs)?)
        }
        WarehouseCredentials::Snowflake(_) => {
            Arc::new(SnowflakeWarehouseClient::new(credentials.clone(), http, timeout_secs)?)
        }
        WarehouseCredentials::Bigquery(_) => {
            Arc::new(BigqueryWarehouseClient::new(credentials.clone(), http, timeout_secs)?)
        }
        WarehouseCredentials::Databricks(_) => {
            Arc::new(DatabricksWarehouseClient::new(credentials.clone(), http, timeout_secs)?)
        }
    };
    Ok(client)
}

/// Column kinds that REST warehouses report for string-encoded cells
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ValueKind {
    Integer,
    Float,
    Boolean,
    Text,
}

/// Decode a string-encoded cell into typed JSON, keeping the raw text when it does not parse
pub(crate) fn typed_value(kind: ValueKind, raw: Option<&str>) -> Value {
    let Some(raw) = raw else {
        return Value::Null;
    };
    match kind {
        ValueKind::Integer => raw
            .parse::<i64>()
            .map(|v| json!(v))
            .unwrap_or_else(|_| json!(raw)),
        ValueKind::Float => raw
            .parse::<f64>()
            .ok()
            .and_then(serde_json::Number::from_f64)
            .map(Value::Number)
            .unwrap_or_else(|| json!(raw)),
        ValueKind::Boolean => match raw.to_ascii_lowercase().as_str() {
            "true" | "1" => Value::Bool(true),
            "false" | "0" => Value::Bool(false),
            _ => json!(raw),
        },
        ValueKind::Text => json!(raw),
    }
}

/// Pull the raw text out of a JSON cell that may be a string, number, bool or null
pub(crate) fn cell_text(cell: &Value) -> Option<String> {
    match cell {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}
