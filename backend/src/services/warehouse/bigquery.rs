// BigQuery client using the jobs.query REST API
use crate::api::middleware::AppError;
use crate::models::{BigqueryCredentials, QueryTags, WarehouseCredentials};
use crate::services::warehouse::adapter::{QueryResult, WarehouseClient};
use crate::services::warehouse::{cell_text, typed_value, ValueKind};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

const LABEL_MAX_LEN: usize = 63;

pub struct BigqueryWarehouseClient {
    credentials: WarehouseCredentials,
    params: BigqueryCredentials,
    base_url: String,
    client: Client,
    timeout_secs: u64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct QueryRequest<'a> {
    query: &'a str,
    use_legacy_sql: bool,
    timeout_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    location: Option<&'a str>,
    default_dataset: DatasetReference<'a>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    labels: BTreeMap<String, String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct DatasetReference<'a> {
    project_id: &'a str,
    dataset_id: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueryResponse {
    #[serde(default)]
    job_complete: bool,
    #[serde(default)]
    job_reference: Option<JobReference>,
    #[serde(default)]
    schema: Option<TableSchema>,
    #[serde(default)]
    rows: Vec<TableRow>,
    #[serde(default)]
    page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobReference {
    job_id: String,
    #[serde(default)]
    location: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TableSchema {
    #[serde(default)]
    fields: Vec<TableField>,
}

#[derive(Debug, Deserialize)]
struct TableField {
    name: String,
    #[serde(rename = "type")]
    data_type: String,
}

#[derive(Debug, Deserialize)]
struct TableRow {
    #[serde(default)]
    f: Vec<TableCell>,
}

#[derive(Debug, Deserialize)]
struct TableCell {
    #[serde(default)]
    v: Value,
}

impl BigqueryWarehouseClient {
    pub fn new(credentials: WarehouseCredentials, client: Client, timeout_secs: u64) -> Result<Self, AppError> {
        let WarehouseCredentials::Bigquery(params) = &credentials else {
            return Err(AppError::Internal("BigQuery client requires bigquery credentials".to_string()));
        };
        let params = params.clone();

        let base_url = params
            .base_url
            .clone()
            .unwrap_or_else(|| "https://bigquery.googleapis.com".to_string())
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

    /// Labels allow lowercase letters, digits, `_` and `-`, at most 63 chars,
    /// and keys must start with a letter
    fn sanitize_labels(tags: &QueryTags) -> BTreeMap<String, String> {
        fn clean(raw: &str) -> String {
            raw.to_lowercase()
                .chars()
                .map(|c| if c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-' { c } else { '_' })
                .take(LABEL_MAX_LEN)
                .collect()
        }

        tags.iter()
            .filter_map(|(key, value)| {
                let key = clean(key);
                if key.starts_with(|c: char| c.is_ascii_lowercase()) {
                    Some((key, clean(value)))
                } else {
                    None
                }
            })
            .collect()
    }

    fn field_kind(field: &TableField) -> Option<ValueKind> {
        match field.data_type.to_uppercase().as_str() {
            "INTEGER" | "INT64" => Some(ValueKind::Integer),
            "FLOAT" | "FLOAT64" | "NUMERIC" | "BIGNUMERIC" => Some(ValueKind::Float),
            "BOOLEAN" | "BOOL" => Some(ValueKind::Boolean),
            // Timestamps come back as fractional epoch seconds
            "TIMESTAMP" => None,
            _ => Some(ValueKind::Text),
        }
    }

    fn timestamp_value(raw: Option<&str>) -> Value {
        let Some(raw) = raw else {
            return Value::Null;
        };
        raw.parse::<f64>()
            .ok()
            .and_then(|secs| chrono::DateTime::from_timestamp_micros((secs * 1_000_000.0).round() as i64))
            .map(|ts| json!(ts.to_rfc3339()))
            .unwrap_or_else(|| json!(raw))
    }

    fn rows_to_json(fields: &[TableField], rows: Vec<TableRow>) -> Vec<Value> {
        rows.into_iter()
            .map(|row| {
                let mut row_obj = serde_json::Map::new();
                for (field, cell) in fields.iter().zip(row.f.iter()) {
                    let raw = cell_text(&cell.v);
                    let value = match Self::field_kind(field) {
                        Some(kind) => typed_value(kind, raw.as_deref()),
                        None => Self::timestamp_value(raw.as_deref()),
                    };
                    row_obj.insert(field.name.clone(), value);
                }
                Value::Object(row_obj)
            })
            .collect()
    }

    async fn send(&self, builder: reqwest::RequestBuilder) -> Result<QueryResponse, AppError> {
        let response = builder
            .bearer_auth(&self.params.access_token)
            .send()
            .await
            .map_err(|e| AppError::WarehouseExecution(format!("HTTP request failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let error_body = response.text().await.unwrap_or_else(|_| "Unknown error".to_string());
            let message = serde_json::from_str::<Value>(&error_body)
                .ok()
                .and_then(|body| body["error"]["message"].as_str().map(str::to_string))
                .unwrap_or(error_body);
            return Err(AppError::WarehouseExecution(format!(
                "BigQuery query failed ({}): {}",
                status, message
            )));
        }

        response
            .json::<QueryResponse>()
            .await
            .map_err(|e| AppError::WarehouseExecution(format!("Failed to parse BigQuery response: {}", e)))
    }

    async fn execute(&self, sql: &str, tags: &QueryTags) -> Result<Vec<Value>, AppError> {
        let params = &self.params;
        let request = QueryRequest {
            query: sql,
            use_legacy_sql: false,
            timeout_ms: self.timeout_secs * 1000,
            location: params.location.as_deref(),
            default_dataset: DatasetReference {
                project_id: &params.project,
                dataset_id: &params.dataset,
            },
            labels: Self::sanitize_labels(tags),
        };

        let endpoint = format!("{}/bigquery/v2/projects/{}/queries", self.base_url, params.project);
        let mut response = self.send(self.client.post(&endpoint).json(&request)).await?;
        let mut rows = Vec::new();
        let mut fields: Vec<TableField> = Vec::new();

        // Keep calling getQueryResults until the job is done and every page is read
        loop {
            if response.job_complete {
                if let Some(schema) = response.schema.take() {
                    fields = schema.fields;
                }
                rows.extend(Self::rows_to_json(&fields, std::mem::take(&mut response.rows)));
            }

            if response.job_complete && response.page_token.is_none() {
                return Ok(rows);
            }

            let job = response.job_reference.as_ref().ok_or_else(|| {
                AppError::WarehouseExecution("BigQuery response is missing a job reference".to_string())
            })?;

            let mut query: Vec<(&str, String)> = vec![("timeoutMs", (self.timeout_secs * 1000).to_string())];
            if let Some(location) = job.location.as_ref().or(params.location.as_ref()) {
                query.push(("location", location.clone()));
            }
            if let Some(token) = response.page_token.as_ref() {
                query.push(("pageToken", token.clone()));
            }

            let endpoint = format!(
                "{}/bigquery/v2/projects/{}/queries/{}",
                self.base_url, params.project, job.job_id
            );
            response = self.send(self.client.get(&endpoint).query(&query)).await?;
        }
    }
}

#[async_trait::async_trait]
impl WarehouseClient for BigqueryWarehouseClient {
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
