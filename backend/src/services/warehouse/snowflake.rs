// Snowflake client using the SQL API v2
use crate::api::middleware::AppError;
use crate::models::{QueryTags, SnowflakeCredentials, WarehouseCredentials};
use crate::services::warehouse::adapter::{QueryResult, WarehouseClient};
use crate::services::warehouse::{cell_text, typed_value, ValueKind};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

const POLL_INTERVAL: Duration = Duration::from_millis(500);

pub struct SnowflakeWarehouseClient {
    credentials: WarehouseCredentials,
    params: SnowflakeCredentials,
    base_url: String,
    client: Client,
    timeout_secs: u64,
}

#[derive(Debug, Serialize)]
struct StatementRequest<'a> {
    statement: &'a str,
    timeout: u64,
    database: &'a str,
    schema: &'a str,
    warehouse: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<&'a str>,
    parameters: BTreeMap<&'static str, String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StatementResponse {
    #[serde(default)]
    statement_handle: Option<String>,
    #[serde(default)]
    result_set_meta_data: Option<ResultSetMetaData>,
    #[serde(default)]
    data: Vec<Vec<Value>>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResultSetMetaData {
    #[serde(default)]
    row_type: Vec<RowType>,
    #[serde(default)]
    partition_info: Vec<Value>,
}

#[derive(Debug, Deserialize)]
struct RowType {
    name: String,
    #[serde(rename = "type")]
    data_type: String,
    #[serde(default)]
    scale: Option<i64>,
}

impl RowType {
    fn kind(&self) -> ValueKind {
        match self.data_type.to_lowercase().as_str() {
            "fixed" if self.scale.unwrap_or(0) == 0 => ValueKind::Integer,
            "fixed" | "real" => ValueKind::Float,
            "boolean" => ValueKind::Boolean,
            _ => ValueKind::Text,
        }
    }
}

impl SnowflakeWarehouseClient {
    pub fn new(credentials: WarehouseCredentials, client: Client, timeout_secs: u64) -> Result<Self, AppError> {
        let WarehouseCredentials::Snowflake(params) = &credentials else {
            return Err(AppError::Internal("Snowflake client requires snowflake credentials".to_string()));
        };
        let params = params.clone();

        let base_url = params
            .base_url
            .clone()
            .unwrap_or_else(|| format!("https://{}.snowflakecomputing.com", params.account))
            .trim_end_matches('/')
            .to_string();

        Ok(Self {
            credentials,
            params,
            base_url,
            client,
            timeout_secs,
        })
    }

    fn authorized(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        let params = &self.params;
        builder
            .bearer_auth(&params.access_token)
            .header("X-Snowflake-Authorization-Token-Type", &params.token_type)
            .header("Accept", "application/json")
    }

    /// QUERY_TAG takes a single string; tags are sent as a JSON object
    fn query_tag(tags: &QueryTags) -> Option<String> {
        if tags.is_empty() {
            None
        } else {
            serde_json::to_string(tags).ok()
        }
    }

    async fn read_response(response: reqwest::Response) -> Result<(StatusCode, StatementResponse), AppError> {
        let status = response.status();
        if !status.is_success() {
            let error_body = response.text().await.unwrap_or_else(|_| "Unknown error".to_string());
            let message = serde_json::from_str::<StatementResponse>(&error_body)
                .ok()
                .and_then(|body| body.message)
                .unwrap_or(error_body);
            return Err(AppError::WarehouseExecution(format!(
                "Snowflake query failed ({}): {}",
                status, message
            )));
        }

        let body = response
            .json::<StatementResponse>()
            .await
            .map_err(|e| AppError::WarehouseExecution(format!("Failed to parse Snowflake response: {}", e)))?;
        Ok((status, body))
    }

    async fn execute(&self, sql: &str, tags: &QueryTags) -> Result<Vec<Value>, AppError> {
        let params = &self.params;
        let mut parameters = BTreeMap::new();
        if let Some(tag) = Self::query_tag(tags) {
            parameters.insert("query_tag", tag);
        }

        let request = StatementRequest {
            statement: sql,
            timeout: self.timeout_secs,
            database: &params.database,
            schema: &params.schema,
            warehouse: &params.warehouse,
            role: params.role.as_deref(),
            parameters,
        };

        let endpoint = format!("{}/api/v2/statements", self.base_url);
        let response = self
            .authorized(self.client.post(&endpoint))
            .query(&[("requestId", uuid::Uuid::new_v4().to_string())])
            .json(&request)
            .send()
            .await
            .map_err(|e| AppError::WarehouseExecution(format!("HTTP request failed: {}", e)))?;

        let (mut status, mut body) = Self::read_response(response).await?;

        // 202 means the statement is still running
        while status == StatusCode::ACCEPTED {
            let handle = body.statement_handle.clone().ok_or_else(|| {
                AppError::WarehouseExecution("Snowflake returned 202 without a statement handle".to_string())
            })?;
            tokio::time::sleep(POLL_INTERVAL).await;
            let response = self
                .authorized(self.client.get(format!("{}/api/v2/statements/{}", self.base_url, handle)))
                .send()
                .await
                .map_err(|e| AppError::WarehouseExecution(format!("HTTP request failed: {}", e)))?;
            (status, body) = Self::read_response(response).await?;
        }

        let meta = body.result_set_meta_data.take().ok_or_else(|| {
            AppError::WarehouseExecution("Snowflake response is missing result metadata".to_string())
        })?;

        let mut rows = Self::rows_to_json(&meta.row_type, std::mem::take(&mut body.data));

        // Partition 0 arrives inline; the rest are fetched by index
        if let Some(handle) = body.statement_handle.as_deref() {
            for partition in 1..meta.partition_info.len() {
                let response = self
                    .authorized(self.client.get(format!("{}/api/v2/statements/{}", self.base_url, handle)))
                    .query(&[("partition", partition)])
                    .send()
                    .await
                    .map_err(|e| AppError::WarehouseExecution(format!("HTTP request failed: {}", e)))?;
                let (_, page) = Self::read_response(response).await?;
                rows.extend(Self::rows_to_json(&meta.row_type, page.data));
            }
        }

        Ok(rows)
    }

    fn rows_to_json(row_type: &[RowType], data: Vec<Vec<Value>>) -> Vec<Value> {
        data.into_iter()
            .map(|cells| {
                let mut row_obj = serde_json::Map::new();
                for (column, cell) in row_type.iter().zip(cells.iter()) {
                    let raw = cell_text(cell);
                    row_obj.insert(column.name.clone(), typed_value(column.kind(), raw.as_deref()));
                }
                Value::Object(row_obj)
            })
            .collect()
    }
}

#[async_trait::async_trait]
impl WarehouseClient for SnowflakeWarehouseClient {
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
