use crate::api::middleware::AppError;
use crate::models::WarehouseType;
use sqlparser::ast::Statement;
use sqlparser::dialect::{
    BigQueryDialect, DatabricksDialect, Dialect, PostgreSqlDialect, RedshiftSqlDialect, SnowflakeDialect,
};
use sqlparser::parser::Parser;
use std::any::TypeId;

/// Databricks SQL as Spark parses it: string literals accept `\'` escapes,
/// which `DatabricksDialect` rejects
#[derive(Debug, Default)]
struct SparkSqlDialect;

impl Dialect for SparkSqlDialect {
    fn dialect(&self) -> TypeId {
        TypeId::of::<DatabricksDialect>()
    }

    fn is_delimited_identifier_start(&self, ch: char) -> bool {
        DatabricksDialect.is_delimited_identifier_start(ch)
    }

    fn is_identifier_start(&self, ch: char) -> bool {
        DatabricksDialect.is_identifier_start(ch)
    }

    fn is_identifier_part(&self, ch: char) -> bool {
        DatabricksDialect.is_identifier_part(ch)
    }

    fn supports_string_literal_backslash_escape(&self) -> bool {
        true
    }

    fn supports_filter_during_aggregation(&self) -> bool {
        DatabricksDialect.supports_filter_during_aggregation()
    }

    fn supports_group_by_expr(&self) -> bool {
        DatabricksDialect.supports_group_by_expr()
    }

    fn supports_lambda_functions(&self) -> bool {
        DatabricksDialect.supports_lambda_functions()
    }

    fn supports_select_wildcard_except(&self) -> bool {
        DatabricksDialect.supports_select_wildcard_except()
    }

    fn require_interval_qualifier(&self) -> bool {
        DatabricksDialect.require_interval_qualifier()
    }

    fn supports_struct_literal(&self) -> bool {
        DatabricksDialect.supports_struct_literal()
    }

    fn supports_nested_comments(&self) -> bool {
        DatabricksDialect.supports_nested_comments()
    }

    fn supports_group_by_with_modifier(&self) -> bool {
        DatabricksDialect.supports_group_by_with_modifier()
    }
}

/// Checks compiled warehouse SQL before it leaves the service
pub struct SqlValidator;

impl SqlValidator {
    fn dialect_for(warehouse_type: WarehouseType) -> Box<dyn Dialect> {
        match warehouse_type {
            WarehouseType::Postgres => Box::new(PostgreSqlDialect {}),
            WarehouseType::Redshift => Box::new(RedshiftSqlDialect {}),
            WarehouseType::Snowflake => Box::new(SnowflakeDialect {}),
            WarehouseType::Bigquery => Box::new(BigQueryDialect {}),
            WarehouseType::Databricks => Box::new(SparkSqlDialect),
        }
    }

    fn parse(sql: &str, warehouse_type: WarehouseType) -> Result<Vec<Statement>, AppError> {
        let dialect = Self::dialect_for(warehouse_type);
        Parser::new(dialect.as_ref())
            .try_with_sql(sql)
            .and_then(|mut parser| parser.parse_statements())
            .map_err(|e| AppError::InvalidSql(format!("SQL parsing error: {}", e)))
    }

    /// Ensure the SQL is exactly one SELECT in the warehouse's dialect
    pub fn validate_select_only(sql: &str, warehouse_type: WarehouseType) -> Result<(), AppError> {
        let statements = Self::parse(sql, warehouse_type)?;

        match statements.as_slice() {
            [] => Err(AppError::InvalidSql("Empty SQL query".to_string())),
            [Statement::Query(query)] => {
                if query.limit_clause.is_none() {
                    tracing::debug!("Compiled {} query has no LIMIT clause", warehouse_type.as_str());
                }
                Ok(())
            }
            [other] => Err(AppError::InvalidSql(format!(
                "Only SELECT queries are permitted. Found: {}",
                Self::statement_keyword(other)
            ))),
            _ => Err(AppError::InvalidSql(
                "Multiple statements are not allowed. Only a single SELECT query is permitted.".to_string(),
            )),
        }
    }

    fn statement_keyword(statement: &Statement) -> String {
        statement
            .to_string()
            .split_whitespace()
            .next()
            .unwrap_or("unknown")
            .to_uppercase()
    }
}
