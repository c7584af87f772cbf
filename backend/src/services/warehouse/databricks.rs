// Databricks SQL warehouse client using the Statement Execution API
use crate::api::middleware::AppError;
use crate::models::{DatabricksCredentials, QueryTags, WarehouseCredentials};
use crate::services::warehouse::adapter::{QueryResult, WarehouseClient};
use crate::services::warehouse::{cell_text, typed_value, ValueKind};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::{Duration, Instant};

const POLL_INTERVAL: Duration = Duration::from_millis(500);

pub struct DatabricksWarehouseClient {
    credentials: WarehouseCredentials,
    params: DatabricksCredentials,
    base_url: String,
    warehouse_id: String,
    client: Client,
    timeout_secs: u64,
}

#[derive(Debug, Serialize)]
struct StatementRequest<'a> {
    statement: &'a str,
    warehouse_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    catalog: Option<&'a str>,
    schema: &'a str,
    wait_timeout: &'static str,
    on_wait_timeout: &'static str,
    disposition: &'static str,
    format: &'static str,
}

#[derive(Debug, Deserialize)]
struct StatementResponse {
    statement_id: String,
    status: StatementStatus,
    #[serde(default)]
    manifest: Option<Manifest>,
    #[serde(default)]
    result: Option<ResultChunk>,
}

#[derive(Debug, Deserialize)]
struct StatementStatus {
    state: String,
    #[serde(default)]
    error: Option<StatementError>,
}

#[derive(Debug, Deserialize)]
struct StatementError {
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Manifest {
    schema: ManifestSchema,
}

#[derive(Debug, Deserialize)]
struct ManifestSchema {
    #[serde(default)]
    columns: Vec<ColumnInfo>,
}

#[derive(Debug, Deserialize)]
struct ColumnInfo {
    name: String,
    type_name: String,
}

#[derive(Debug, Default, Deserialize)]
struct ResultChunk {
    #[serde(default)]
    data_array: Vec<Vec<Value>>,
    #[serde(default)]
    next_chunk_internal_link: Option<String>,
}

impl ColumnInfo {
    fn kind(&self) -> ValueKind {
        match self.type_name.to_uppercase().as_str() {
            "BYTE" | "SHORT" | "INT" | "LONG" => ValueKind::Integer,
            "FLOAT" | "DOUBLE" | "DECIMAL" => ValueKind::Float,
            "BOOLEAN" => ValueKind::Boolean,
            _ => ValueKind::Text,
        }
    }
}

impl DatabricksWarehouseClient {
    pub fn new(credentials: WarehouseCredentials, client: Client, timeout_secs: u64) -> Result<Self, AppError> {
        let WarehouseCredentials::Databricks(params) = &credentials else {
            return Err(AppError::Internal("Databricks client requires databricks credentials".to_string()));
        };
        let params = params.clone();

        let warehouse_id = Self::warehouse_id(&params.http_path).ok_or_else(|| {
            AppError::Validation(format!("Cannot find a warehouse id in http path {}", params.http_path))
        })?;

        let host = params
            .server_hostname
            .trim_start_matches("https://")
            .trim_end_matches('/');
        let base_url = format!("https://{}", host);

        Ok(Self {
            credentials,
            params,
            base_url,
            warehouse_id,
            client,
            timeout_secs,
        })
    }

    /// `/sql/1.0/warehouses/<id>` or `/sql/1.0/endpoints/<id>`
    fn warehouse_id(http_path: &str) -> Option<String> {
        http_path
            .trim_end_matches('/')
            .rsplit('/')
            .next()
            .filter(|id| !id.is_empty() && !http_path.trim_end_matches('/').ends_with("/sql/1.0"))
            .map(str::to_string)
    }

    async fn get<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T, AppError> {
        let response = self
            .client
            .get(format!("{}{}", self.base_url, path))
            .bearer_auth(&self.params.personal_access_token)
            .send()
            .await
            .map_err(|e| AppError::WarehouseExecution(format!("HTTP request failed: {}", e)))?;
        Self::parse(response).await
    }

    async fn parse<T: serde::de::DeserializeOwned>(response: reqwest::Response) -> Result<T, AppError> {
        if !response.status().is_success() {
            let status = response.status();
            let error_body = response.text().await.unwrap_or_else(|_| "Unknown error".to_string());
            return Err(AppError::WarehouseExecution(format!(
                "Databricks request failed ({}): {}",
                status, error_body
            )));
        }
        response
            .json::<T>()
            .await
            .map_err(|e| AppError::WarehouseExecution(format!("Failed to parse Databricks response: {}", e)))
    }

    async fn execute(&self, sql: &str, tags: &QueryTags) -> Result<Vec<Value>, AppError> {
        if !tags.is_empty() {
            tracing::debug!("Query tags are not forwarded to databricks sessions: {:?}", tags);
        }

        let request = StatementRequest {
            statement: sql,
            warehouse_id: &self.warehouse_id,
            catalog: self.params.catalog.as_deref(),
            schema: &self.params.database,
            wait_timeout: "30s",
            on_wait_timeout: "CONTINUE",
            disposition: "INLINE",
            format: "JSON_ARRAY",
        };

        let response = self
            .client
            .post(format!("{}/api/2.0/sql/statements/", self.base_url))
            .bearer_auth(&self.params.personal_access_token)
            .json(&request)
            .send()
            .await
            .map_err(|e| AppError::WarehouseExecution(format!("HTTP request failed: {}", e)))?;
        let mut statement: StatementResponse = Self::parse(response).await?;

        while matches!(statement.status.state.as_str(), "PENDING" | "RUNNING") {
            tokio::time::sleep(POLL_INTERVAL).await;
            statement = self
                .get(&format!("/api/2.0/sql/statements/{}", statement.statement_id))
                .await?;
        }

        if statement.status.state != "SUCCEEDED" {
            let message = statement
                .status
                .error
                .and_then(|e| e.message)
                .unwrap_or_else(|| format!("statement finished in state {}", statement.status.state));
            return Err(AppError::WarehouseExecution(format!("Databricks query failed: {}", message)));
        }

        let columns = statement
            .manifest
            .map(|m| m.schema.columns)
            .unwrap_or_default();
        let mut chunk = statement.result.unwrap_or_default();
        let mut rows = Vec::new();

        loop {
            rows.extend(Self::rows_to_json(&columns, std::mem::take(&mut chunk.data_array)));
            match chunk.next_chunk_internal_link.take() {
                Some(link) => chunk = self.get(&link).await?,
                None => return Ok(rows),
            }
        }
    }

    fn rows_to_json(columns: &[ColumnInfo], data: Vec<Vec<Value>>) -> Vec<Value> {
        data.into_iter()
            .map(|cells| {
                let mut row_obj = serde_json::Map::new();
                for (column, cell) in columns.iter().zip(cells.iter()) {
                    let raw = cell_text(cell);
                    row_obj.insert(column.name.clone(), typed_value(column.kind(), raw.as_deref()));
                }
                Value::Object(row_obj)
            })
            .collect()
    }
}

#[async_trait::async_trait]
impl WarehouseClient for DatabricksWarehouseClient {
    async fn run_query(&self, sql: &str, tags: &QueryTags) -> Result<QueryResult, AppError> {
        let start_time = Instant::now();

        let rows = tokio::time::timeout(Duration::from_secs(self.timeout_secs), self.execute(sql, tags))
            .await
            .map_err(|_| AppError::WarehouseExecution(format!("Query timeout after {} seconds", self.timeout_secs)))??;

        let row_count = rows.len();
        Ok(QueryResult {
            rows,
            row_count,
            execution_time_ms: start_time.elapsed().as_millis() as u64,
        })
    }

    fn credentials(&self) -> &WarehouseCredentials {
        &self.credentials
    }

    async fn test_connection(&self) -> Result<(), AppError> {
        self.execute("SELECT 1", &QueryTags::new())
            .await
            .map(|_| ())
            .map_err(|e| AppError::Connection(e.to_string()))
    }
}
