use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A queryable model: a base table plus the fields defined on it
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Explore {
    pub name: String,
    /// Fully qualified table reference, emitted verbatim
    pub base_table: String,
    #[serde(default)]
    pub dimensions: Vec<DimensionDefinition>,
    #[serde(default)]
    pub metrics: Vec<MetricDefinition>,
    /// Row-level filter applied to every query, may reference user attributes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sql_filter: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DimensionDefinition {
    pub name: String,
    /// SQL expression, `${TABLE}` resolves to the explore alias
    pub sql: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricAggregation {
    Count,
    CountDistinct,
    Sum,
    Average,
    Min,
    Max,
    /// Already an aggregate expression
    Number,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricDefinition {
    pub name: String,
    pub sql: String,
    pub aggregation: MetricAggregation,
    /// Auto-generated placeholder metric rather than one the user modelled
    #[serde(default)]
    pub is_example: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FilterOperator {
    Equals,
    NotEquals,
    GreaterThan,
    LessThan,
    IsNull,
    NotNull,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldFilter {
    pub field: String,
    pub operator: FilterOperator,
    #[serde(default)]
    pub values: Vec<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SortField {
    pub field: String,
    #[serde(default)]
    pub descending: bool,
}

/// Dialect-agnostic description of an analytical query
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricQuery {
    #[serde(default)]
    pub dimensions: Vec<String>,
    #[serde(default)]
    pub metrics: Vec<String>,
    #[serde(default)]
    pub filters: Vec<FieldFilter>,
    #[serde(default)]
    pub sorts: Vec<SortField>,
    #[serde(default = "default_limit")]
    pub limit: u64,
}

fn default_limit() -> u64 {
    500
}

/// Output of compiling a metric query for one warehouse dialect
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledQuery {
    pub query_text: String,
    pub has_example_metric: bool,
}

#[cfg(test)]
pub(crate) fn test_explore() -> Explore {
    Explore {
        name: "orders".to_string(),
        base_table: "analytics.orders".to_string(),
        dimensions: vec![
            DimensionDefinition {
                name: "status".to_string(),
                sql: "${TABLE}.status".to_string(),
            },
            DimensionDefinition {
                name: "region".to_string(),
                sql: "${TABLE}.region".to_string(),
            },
        ],
        metrics: vec![
            MetricDefinition {
                name: "order_count".to_string(),
                sql: "${TABLE}.id".to_string(),
                aggregation: MetricAggregation::Count,
                is_example: false,
            },
            MetricDefinition {
                name: "total_amount".to_string(),
                sql: "${TABLE}.amount".to_string(),
                aggregation: MetricAggregation::Sum,
                is_example: true,
            },
        ],
        sql_filter: None,
    }
}

#[cfg(test)]
pub(crate) fn test_metric_query() -> MetricQuery {
    MetricQuery {
        dimensions: vec!["status".to_string()],
        metrics: vec!["order_count".to_string()],
        filters: vec![],
        sorts: vec![],
        limit: 500,
    }
}
