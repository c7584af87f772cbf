//! Compiles a [`MetricQuery`] against an [`Explore`] into warehouse SQL.
//!
//! The output shape is fixed:
//! `SELECT dims, metrics FROM base AS alias [WHERE ..] [GROUP BY ..] [HAVING ..] [ORDER BY ..] LIMIT n`.
//! Identifier quoting and string escaping follow the client's [`DialectHints`],
//! so the same metric query compiles to different text per warehouse (and
//! therefore to a different results-cache key).

use crate::api::middleware::AppError;
use crate::models::{
    CompiledQuery, Explore, FieldFilter, FilterOperator, MetricAggregation, MetricDefinition, MetricQuery,
    UserAttributeValueMap,
};
use crate::services::warehouse::DialectHints;
use serde_json::Value;

const ATTRIBUTE_PREFIXES: &[&str] = &["lightdash.attributes.", "ld.attr."];

/// Turns semantic queries into SQL text
pub trait MetricQueryCompiler: Send + Sync {
    fn compile(
        &self,
        explore: &Explore,
        metric_query: &MetricQuery,
        dialect: &DialectHints,
        user_attributes: &UserAttributeValueMap,
    ) -> Result<CompiledQuery, AppError>;
}

pub struct SqlMetricQueryCompiler;

enum Field<'a> {
    Dimension(String),
    Metric(&'a MetricDefinition, String),
}

struct CompileContext<'a> {
    explore: &'a Explore,
    dialect: &'a DialectHints,
    user_attributes: &'a UserAttributeValueMap,
    alias: String,
}

impl<'a> CompileContext<'a> {
    /// Replace `${TABLE}` and user attribute placeholders
    fn render_sql(&self, sql: &str) -> Result<String, AppError> {
        let mut output = String::with_capacity(sql.len());
        let mut rest = sql;

        while let Some(start) = rest.find("${") {
            output.push_str(&rest[..start]);
            let after = &rest[start + 2..];
            let end = after
                .find('}')
                .ok_or_else(|| AppError::Validation(format!("Unterminated placeholder in SQL: {}", sql)))?;
            let name = after[..end].trim();

            if name == "TABLE" {
                output.push_str(&self.alias);
            } else if let Some(attribute) = ATTRIBUTE_PREFIXES.iter().find_map(|p| name.strip_prefix(p)) {
                let value = self.user_attributes.get(attribute).ok_or_else(|| {
                    AppError::Forbidden(format!("Missing user attribute \"{}\" required by this explore", attribute))
                })?;
                output.push_str(&self.dialect.quote_string(value));
            } else {
                return Err(AppError::Validation(format!("Unknown placeholder ${{{}}}", name)));
            }

            rest = &after[end + 1..];
        }

        output.push_str(rest);
        Ok(output)
    }

    fn metric_expression(&self, metric: &MetricDefinition) -> Result<String, AppError> {
        let sql = self.render_sql(&metric.sql)?;
        Ok(match metric.aggregation {
            MetricAggregation::Count => format!("COUNT({})", sql),
            MetricAggregation::CountDistinct => format!("COUNT(DISTINCT {})", sql),
            MetricAggregation::Sum => format!("SUM({})", sql),
            MetricAggregation::Average => format!("AVG({})", sql),
            MetricAggregation::Min => format!("MIN({})", sql),
            MetricAggregation::Max => format!("MAX({})", sql),
            MetricAggregation::Number => sql,
        })
    }

    fn field(&self, name: &str) -> Result<Field<'a>, AppError> {
        if let Some(dimension) = self.explore.dimensions.iter().find(|d| d.name == name) {
            return Ok(Field::Dimension(self.render_sql(&dimension.sql)?));
        }
        if let Some(metric) = self.explore.metrics.iter().find(|m| m.name == name) {
            return Ok(Field::Metric(metric, self.metric_expression(metric)?));
        }
        Err(AppError::Validation(format!(
            "Field \"{}\" does not exist in explore \"{}\"",
            name, self.explore.name
        )))
    }

    fn literal(&self, value: &Value) -> Result<String, AppError> {
        match value {
            Value::String(s) => Ok(self.dialect.quote_string(s)),
            Value::Number(n) => Ok(n.to_string()),
            Value::Bool(true) => Ok("TRUE".to_string()),
            Value::Bool(false) => Ok("FALSE".to_string()),
            Value::Null => Ok("NULL".to_string()),
            other => Err(AppError::Validation(format!("Unsupported filter value: {}", other))),
        }
    }

    fn single_value(&self, filter: &FieldFilter) -> Result<String, AppError> {
        match filter.values.as_slice() {
            [value] => self.literal(value),
            _ => Err(AppError::Validation(format!(
                "Filter {:?} on \"{}\" takes exactly one value",
                filter.operator, filter.field
            ))),
        }
    }

    fn value_list(&self, filter: &FieldFilter) -> Result<Vec<String>, AppError> {
        if filter.values.is_empty() {
            return Err(AppError::Validation(format!(
                "Filter {:?} on \"{}\" needs at least one value",
                filter.operator, filter.field
            )));
        }
        filter.values.iter().map(|v| self.literal(v)).collect()
    }

    fn condition(&self, expression: &str, filter: &FieldFilter) -> Result<String, AppError> {
        Ok(match filter.operator {
            FilterOperator::Equals => match self.value_list(filter)?.as_slice() {
                [value] => format!("({}) = {}", expression, value),
                values => format!("({}) IN ({})", expression, values.join(", ")),
            },
            FilterOperator::NotEquals => match self.value_list(filter)?.as_slice() {
                [value] => format!("({}) <> {}", expression, value),
                values => format!("({}) NOT IN ({})", expression, values.join(", ")),
            },
            FilterOperator::GreaterThan => format!("({}) > {}", expression, self.single_value(filter)?),
            FilterOperator::LessThan => format!("({}) < {}", expression, self.single_value(filter)?),
            FilterOperator::IsNull => format!("({}) IS NULL", expression),
            FilterOperator::NotNull => format!("({}) IS NOT NULL", expression),
        })
    }
}

impl MetricQueryCompiler for SqlMetricQueryCompiler {
    fn compile(
        &self,
        explore: &Explore,
        metric_query: &MetricQuery,
        dialect: &DialectHints,
        user_attributes: &UserAttributeValueMap,
    ) -> Result<CompiledQuery, AppError> {
        if metric_query.dimensions.is_empty() && metric_query.metrics.is_empty() {
            return Err(AppError::Validation(
                "Metric query must select at least one dimension or metric".to_string(),
            ));
        }

        let ctx = CompileContext {
            explore,
            dialect,
            user_attributes,
            alias: dialect.quote_identifier(&explore.name),
        };

        let mut select = Vec::new();
        let mut selected_names = Vec::new();
        let mut has_example_metric = false;

        for name in &metric_query.dimensions {
            match ctx.field(name)? {
                Field::Dimension(sql) => select.push(format!("{} AS {}", sql, dialect.quote_identifier(name))),
                Field::Metric(..) => {
                    return Err(AppError::Validation(format!("\"{}\" is a metric, not a dimension", name)))
                }
            }
            selected_names.push(name.as_str());
        }

        for name in &metric_query.metrics {
            match ctx.field(name)? {
                Field::Metric(metric, sql) => {
                    has_example_metric |= metric.is_example;
                    select.push(format!("{} AS {}", sql, dialect.quote_identifier(name)));
                }
                Field::Dimension(_) => {
                    return Err(AppError::Validation(format!("\"{}\" is a dimension, not a metric", name)))
                }
            }
            selected_names.push(name.as_str());
        }

        let mut where_clauses = Vec::new();
        let mut having_clauses = Vec::new();

        if let Some(sql_filter) = explore.sql_filter.as_deref().filter(|f| !f.trim().is_empty()) {
            where_clauses.push(format!("({})", ctx.render_sql(sql_filter)?));
        }

        for filter in &metric_query.filters {
            match ctx.field(&filter.field)? {
                Field::Dimension(sql) => where_clauses.push(ctx.condition(&sql, filter)?),
                Field::Metric(_, sql) => having_clauses.push(ctx.condition(&sql, filter)?),
            }
        }

        let mut order_by = Vec::new();
        for sort in &metric_query.sorts {
            if !selected_names.contains(&sort.field.as_str()) {
                // Validate existence first for a clearer message
                ctx.field(&sort.field)?;
                return Err(AppError::Validation(format!(
                    "Cannot sort by \"{}\" because it is not selected",
                    sort.field
                )));
            }
            let direction = if sort.descending { "DESC" } else { "ASC" };
            order_by.push(format!("{} {}", dialect.quote_identifier(&sort.field), direction));
        }

        let mut sql = format!(
            "SELECT\n  {}\nFROM {} AS {}",
            select.join(",\n  "),
            explore.base_table,
            ctx.alias
        );

        if !where_clauses.is_empty() {
            sql.push_str(&format!("\nWHERE {}", where_clauses.join("\n  AND ")));
        }

        if !metric_query.dimensions.is_empty() {
            let ordinals: Vec<String> = (1..=metric_query.dimensions.len()).map(|i| i.to_string()).collect();
            sql.push_str(&format!("\nGROUP BY {}", ordinals.join(", ")));
        }

        if !having_clauses.is_empty() {
            sql.push_str(&format!("\nHAVING {}", having_clauses.join("\n  AND ")));
        }

        if !order_by.is_empty() {
            sql.push_str(&format!("\nORDER BY {}", order_by.join(", ")));
        }

        sql.push_str(&format!("\nLIMIT {}", metric_query.limit));

        Ok(CompiledQuery {
            query_text: sql,
            has_example_metric,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{test_explore, test_metric_query, SortField, WarehouseType};
    use serde_json::json;

    fn postgres() -> DialectHints {
        DialectHints::for_warehouse(WarehouseType::Postgres)
    }

    fn compile(explore: &Explore, query: &MetricQuery, dialect: DialectHints) -> Result<CompiledQuery, AppError> {
        SqlMetricQueryCompiler.compile(explore, query, &dialect, &UserAttributeValueMap::new())
    }

    #[test]
    fn test_compile_basic_query() {
        let compiled = compile(&test_explore(), &test_metric_query(), postgres()).unwrap();

        assert_eq!(
            compiled.query_text,
            "SELECT\n  \"orders\".status AS \"status\",\n  COUNT(\"orders\".id) AS \"order_count\"\n\
             FROM analytics.orders AS \"orders\"\nGROUP BY 1\nLIMIT 500"
        );
        assert!(!compiled.has_example_metric);
    }

    #[test]
    fn test_dialect_changes_quoting() {
        let pg = compile(&test_explore(), &test_metric_query(), postgres()).unwrap();
        let bq = compile(
            &test_explore(),
            &test_metric_query(),
            DialectHints::for_warehouse(WarehouseType::Bigquery),
        )
        .unwrap();

        assert!(bq.query_text.contains("`orders`.status AS `status`"));
        assert_ne!(pg.query_text, bq.query_text);
    }

    #[test]
    fn test_example_metric_flag() {
        let mut query = test_metric_query();
        query.metrics.push("total_amount".to_string());

        let compiled = compile(&test_explore(), &query, postgres()).unwrap();
        assert!(compiled.has_example_metric);
        assert!(compiled.query_text.contains("SUM(\"orders\".amount) AS \"total_amount\""));
    }

    #[test]
    fn test_filters_split_between_where_and_having() {
        let mut query = test_metric_query();
        query.filters = vec![
            FieldFilter {
                field: "status".to_string(),
                operator: FilterOperator::Equals,
                values: vec![json!("open"), json!("it's")],
            },
            FieldFilter {
                field: "order_count".to_string(),
                operator: FilterOperator::GreaterThan,
                values: vec![json!(10)],
            },
            FieldFilter {
                field: "region".to_string(),
                operator: FilterOperator::NotNull,
                values: vec![],
            },
        ];

        let sql = compile(&test_explore(), &query, postgres()).unwrap().query_text;
        assert!(sql.contains("WHERE (\"orders\".status) IN ('open', 'it''s')\n  AND (\"orders\".region) IS NOT NULL"));
        assert!(sql.contains("HAVING (COUNT(\"orders\".id)) > 10"));
    }

    #[test]
    fn test_sorts_use_selected_aliases() {
        let mut query = test_metric_query();
        query.sorts = vec![SortField {
            field: "order_count".to_string(),
            descending: true,
        }];
        let sql = compile(&test_explore(), &query, postgres()).unwrap().query_text;
        assert!(sql.contains("ORDER BY \"order_count\" DESC\nLIMIT 500"));

        query.sorts[0].field = "region".to_string();
        assert!(matches!(compile(&test_explore(), &query, postgres()), Err(AppError::Validation(_))));
    }

    #[test]
    fn test_unknown_field_is_validation_error() {
        let mut query = test_metric_query();
        query.dimensions.push("nope".to_string());
        assert!(matches!(compile(&test_explore(), &query, postgres()), Err(AppError::Validation(_))));

        let empty = MetricQuery {
            dimensions: vec![],
            metrics: vec![],
            ..test_metric_query()
        };
        assert!(matches!(compile(&test_explore(), &empty, postgres()), Err(AppError::Validation(_))));
    }

    #[test]
    fn test_sql_filter_substitutes_user_attributes() {
        let mut explore = test_explore();
        explore.sql_filter =
            Some("${TABLE}.region = ${lightdash.attributes.region} OR ${TABLE}.owner = ${ld.attr.email}".to_string());

        let mut attributes = UserAttributeValueMap::new();
        attributes.insert("region".to_string(), "EMEA".to_string());
        attributes.insert("email".to_string(), "o'neil@example.com".to_string());

        let compiled = SqlMetricQueryCompiler
            .compile(&explore, &test_metric_query(), &postgres(), &attributes)
            .unwrap();
        assert!(compiled.query_text.contains(
            "WHERE (\"orders\".region = 'EMEA' OR \"orders\".owner = 'o''neil@example.com')"
        ));
    }

    #[test]
    fn test_missing_user_attribute_is_forbidden() {
        let mut explore = test_explore();
        explore.sql_filter = Some("${TABLE}.region = ${ld.attr.region}".to_string());

        let result = compile(&explore, &test_metric_query(), postgres());
        assert!(matches!(result, Err(AppError::Forbidden(_))));
    }

    #[test]
    fn test_compile_is_deterministic() {
        let first = compile(&test_explore(), &test_metric_query(), postgres()).unwrap();
        let second = compile(&test_explore(), &test_metric_query(), postgres()).unwrap();
        assert_eq!(first, second);
    }
}
