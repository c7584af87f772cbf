// Warehouse client trait for multi-warehouse support
use crate::api::middleware::AppError;
use crate::models::{QueryTags, WarehouseCredentials, WarehouseType};
use serde_json::Value;

/// Query execution result
#[derive(Debug, Clone)]
pub struct QueryResult {
    pub rows: Vec<Value>,
    pub row_count: usize,
    pub execution_time_ms: u64,
}

/// How a dialect spells identifiers and string literals
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DialectHints {
    pub warehouse_type: WarehouseType,
    pub field_quote: char,
    /// Escape for a single quote inside a string literal
    pub string_escape: &'static str,
}

impl DialectHints {
    pub fn for_warehouse(warehouse_type: WarehouseType) -> Self {
        match warehouse_type {
            WarehouseType::Bigquery | WarehouseType::Databricks => Self {
                warehouse_type,
                field_quote: '`',
                string_escape: "\\'",
            },
            WarehouseType::Postgres | WarehouseType::Redshift | WarehouseType::Snowflake => Self {
                warehouse_type,
                field_quote: '"',
                string_escape: "''",
            },
        }
    }

    pub fn quote_identifier(&self, identifier: &str) -> String {
        let q = self.field_quote;
        let doubled = format!("{q}{q}");
        format!("{q}{}{q}", identifier.replace(q, &doubled))
    }

    pub fn quote_string(&self, value: &str) -> String {
        let escaped = if self.string_escape == "\\'" {
            value.replace('\\', "\\\\").replace('\'', self.string_escape)
        } else {
            value.replace('\'', self.string_escape)
        };
        format!("'{}'", escaped)
    }
}

/// Capability interface shared by every warehouse dialect
#[async_trait::async_trait]
pub trait WarehouseClient: Send + Sync {
    /// Run a compiled query, attaching the tags to the warehouse session
    async fn run_query(&self, sql: &str, tags: &QueryTags) -> Result<QueryResult, AppError>;

    /// The exact credentials this client was built from
    fn credentials(&self) -> &WarehouseCredentials;

    fn warehouse_type(&self) -> WarehouseType {
        self.credentials().warehouse_type()
    }

    fn dialect(&self) -> DialectHints {
        DialectHints::for_warehouse(self.warehouse_type())
    }

    /// Test connection
    async fn test_connection(&self) -> Result<(), AppError>;
}
