// Postgres-family client (Postgres and Redshift) using connection pooling
use crate::api::middleware::AppError;
use crate::models::{PostgresCredentials, QueryTags, WarehouseCredentials};
use crate::services::warehouse::adapter::{QueryResult, WarehouseClient};
use crate::services::warehouse::{typed_value, ValueKind};
use deadpool_postgres::{Config as PoolConfig, ManagerConfig, Pool, RecyclingMethod, Runtime};
use serde_json::{json, Value};
use std::time::Instant;
use tokio_postgres::types::{FromSql, Type};
use tokio_postgres::{NoTls, Row};

const MAX_POOL_SIZE: usize = 8;

const NUMERIC_POS: u16 = 0x0000;
const NUMERIC_NEG: u16 = 0x4000;
const NUMERIC_NAN: u16 = 0xC000;
const NUMERIC_PINF: u16 = 0xD000;
const NUMERIC_NINF: u16 = 0xF000;

/// NUMERIC/DECIMAL column (SUM and AVG results) rendered as decimal text
#[derive(Debug, Clone, PartialEq)]
struct PgNumeric {
    text: String,
    scale: u16,
}

impl PgNumeric {
    fn to_json(&self) -> Value {
        let kind = if self.scale == 0 { ValueKind::Integer } else { ValueKind::Float };
        typed_value(kind, Some(&self.text))
    }
}

impl<'a> FromSql<'a> for PgNumeric {
    fn from_sql(_ty: &Type, raw: &'a [u8]) -> Result<Self, Box<dyn std::error::Error + Sync + Send>> {
        decode_numeric(raw)
    }

    fn accepts(ty: &Type) -> bool {
        *ty == Type::NUMERIC
    }
}

/// Decode the binary NUMERIC wire format: ndigits, weight, sign, dscale, then base-10000 digits
fn decode_numeric(raw: &[u8]) -> Result<PgNumeric, Box<dyn std::error::Error + Sync + Send>> {
    let word = |offset: usize| -> Option<[u8; 2]> { raw.get(offset..offset + 2).map(|b| [b[0], b[1]]) };
    let header = (word(0), word(2), word(4), word(6));
    let (Some(ndigits), Some(weight), Some(sign), Some(dscale)) = header else {
        return Err("numeric value is shorter than its header".into());
    };
    let ndigits = i16::from_be_bytes(ndigits).max(0) as usize;
    let weight = i16::from_be_bytes(weight) as i32;
    let sign = u16::from_be_bytes(sign);
    let dscale = u16::from_be_bytes(dscale);

    let special = match sign {
        NUMERIC_NAN => Some("NaN"),
        NUMERIC_PINF => Some("Infinity"),
        NUMERIC_NINF => Some("-Infinity"),
        NUMERIC_POS | NUMERIC_NEG => None,
        other => return Err(format!("invalid numeric sign 0x{:04x}", other).into()),
    };
    if let Some(text) = special {
        return Ok(PgNumeric { text: text.to_string(), scale: 1 });
    }

    let mut digits = Vec::with_capacity(ndigits);
    for i in 0..ndigits {
        let digit = word(8 + i * 2).ok_or("numeric value is shorter than its digit count")?;
        let digit = i16::from_be_bytes(digit);
        if !(0..10_000).contains(&digit) {
            return Err(format!("invalid numeric digit {}", digit).into());
        }
        digits.push(digit);
    }
    let digit_at = |idx: i32| -> i16 {
        usize::try_from(idx).ok().and_then(|i| digits.get(i).copied()).unwrap_or(0)
    };

    let mut text = String::new();
    if sign == NUMERIC_NEG {
        text.push('-');
    }
    if weight < 0 {
        text.push('0');
    } else {
        text.push_str(&digit_at(0).to_string());
        for idx in 1..=weight {
            text.push_str(&format!("{:04}", digit_at(idx)));
        }
    }

    if dscale > 0 {
        let mut fraction = String::new();
        let groups = (dscale as i32 + 3) / 4;
        for k in 1..=groups {
            fraction.push_str(&format!("{:04}", digit_at(weight + k)));
        }
        fraction.truncate(dscale as usize);
        text.push('.');
        text.push_str(&fraction);
    }

    Ok(PgNumeric { text, scale: dscale })
}

pub struct PostgresWarehouseClient {
    pool: Pool,
    credentials: WarehouseCredentials,
    timeout_secs: u64,
}

impl PostgresWarehouseClient {
    /// Build a lazily-connecting pool; no network I/O happens here
    pub fn new(credentials: WarehouseCredentials, timeout_secs: u64) -> Result<Self, AppError> {
        let (params, is_redshift) = match &credentials {
            WarehouseCredentials::Postgres(c) => (c, false),
            WarehouseCredentials::Redshift(c) => (c, true),
            other => {
                return Err(AppError::Internal(format!(
                    "Postgres client cannot be built from {} credentials",
                    other.warehouse_type().as_str()
                )))
            }
        };

        let pool = Self::create_pool(params, is_redshift)?;

        Ok(Self {
            pool,
            credentials,
            timeout_secs,
        })
    }

    fn create_pool(params: &PostgresCredentials, is_redshift: bool) -> Result<Pool, AppError> {
        let mut cfg = PoolConfig::new();
        cfg.host = Some(params.host.clone());
        cfg.port = Some(params.port);
        cfg.user = Some(params.user.clone());
        cfg.password = Some(params.password.clone());
        cfg.dbname = Some(params.dbname.clone());
        cfg.application_name = Some("warehouse-query-backend".to_string());
        // Redshift rejects the `options` startup parameter
        if !is_redshift {
            cfg.options = Some(format!("-c search_path={}", params.schema));
        }
        cfg.manager = Some(ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        });

        let pool = cfg
            .create_pool(Some(Runtime::Tokio1), NoTls)
            .map_err(|e| {
                tracing::error!("Failed to create connection pool: {}", e);
                AppError::Connection(format!("Failed to create connection pool: {}", e))
            })?;
        pool.resize(MAX_POOL_SIZE);
        Ok(pool)
    }

    async fn get_client(&self) -> Result<deadpool_postgres::Object, AppError> {
        self.pool
            .get()
            .await
            .map_err(|e| AppError::Connection(format!("Failed to get connection from pool: {}", e)))
    }

    fn describe_error(e: &tokio_postgres::Error) -> String {
        if let Some(db_error) = e.as_db_error() {
            let mut details = format!("Code: {}, Message: {}", db_error.code().code(), db_error.message());
            if let Some(hint) = db_error.hint() {
                details.push_str(&format!(", Hint: {}", hint));
            }
            details
        } else {
            e.to_string()
        }
    }

    fn row_to_json(row: &Row) -> Value {
        let mut row_obj = serde_json::Map::new();
        for (idx, column) in row.columns().iter().enumerate() {
            let value = match *column.type_() {
                Type::INT2 => row.try_get::<_, Option<i16>>(idx).ok().flatten().map(|v| json!(v)),
                Type::INT4 => row.try_get::<_, Option<i32>>(idx).ok().flatten().map(|v| json!(v)),
                Type::INT8 => row.try_get::<_, Option<i64>>(idx).ok().flatten().map(|v| json!(v)),
                Type::FLOAT4 => row.try_get::<_, Option<f32>>(idx).ok().flatten().map(|v| json!(v)),
                Type::FLOAT8 => row.try_get::<_, Option<f64>>(idx).ok().flatten().map(|v| json!(v)),
                Type::BOOL => row.try_get::<_, Option<bool>>(idx).ok().flatten().map(|v| json!(v)),
                Type::TIMESTAMPTZ => row
                    .try_get::<_, Option<chrono::DateTime<chrono::Utc>>>(idx)
                    .ok()
                    .flatten()
                    .map(|v| json!(v.to_rfc3339())),
                Type::TIMESTAMP => row
                    .try_get::<_, Option<chrono::NaiveDateTime>>(idx)
                    .ok()
                    .flatten()
                    .map(|v| json!(v.to_string())),
                Type::DATE => row
                    .try_get::<_, Option<chrono::NaiveDate>>(idx)
                    .ok()
                    .flatten()
                    .map(|v| json!(v.to_string())),
                Type::NUMERIC => row
                    .try_get::<_, Option<PgNumeric>>(idx)
                    .ok()
                    .flatten()
                    .map(|v| v.to_json()),
                Type::UUID => row
                    .try_get::<_, Option<uuid::Uuid>>(idx)
                    .ok()
                    .flatten()
                    .map(|v| json!(v.to_string())),
                Type::JSON | Type::JSONB => row.try_get::<_, Option<Value>>(idx).ok().flatten(),
                _ => match row.try_get::<_, Option<String>>(idx) {
                    Ok(v) => v.map(Value::String),
                    // Types without a text mapping (arrays, intervals...) show their type name
                    Err(_) => Some(json!(format!("<{}>", column.type_().name()))),
                },
            };
            row_obj.insert(column.name().to_string(), value.unwrap_or(Value::Null));
        }
        Value::Object(row_obj)
    }
}

#[async_trait::async_trait]
impl WarehouseClient for PostgresWarehouseClient {
    async fn run_query(&self, sql: &str, tags: &QueryTags) -> Result<QueryResult, AppError> {
        let client = self.get_client().await?;
        if !tags.is_empty() {
            tracing::debug!("Query tags are not forwarded to {} sessions: {:?}", self.warehouse_type().as_str(), tags);
        }

        let start_time = Instant::now();

        let rows = tokio::time::timeout(
            std::time::Duration::from_secs(self.timeout_secs),
            client.query(sql, &[]),
        )
        .await
        .map_err(|_| AppError::WarehouseExecution(format!("Query timeout after {} seconds", self.timeout_secs)))?
        .map_err(|e| AppError::WarehouseExecution(format!("Query execution failed: {}", Self::describe_error(&e))))?;

        let json_rows: Vec<Value> = rows.iter().map(Self::row_to_json).collect();
        let row_count = json_rows.len();

        Ok(QueryResult {
            rows: json_rows,
            row_count,
            execution_time_ms: start_time.elapsed().as_millis() as u64,
        })
    }

    fn credentials(&self) -> &WarehouseCredentials {
        &self.credentials
    }

    async fn test_connection(&self) -> Result<(), AppError> {
        let client = self.get_client().await?;
        client
            .simple_query("SELECT 1")
            .await
            .map_err(|e| AppError::Connection(format!("Connection test failed: {}", Self::describe_error(&e))))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{test_postgres_credentials, WarehouseType};

    #[tokio::test]
    async fn test_client_creation_is_lazy() {
        // Nothing listens on this host; building the pool must still succeed
        let client = PostgresWarehouseClient::new(test_postgres_credentials("unreachable.invalid"), 5).unwrap();
        assert_eq!(client.warehouse_type(), WarehouseType::Postgres);
        assert_eq!(client.credentials(), &test_postgres_credentials("unreachable.invalid"));
    }

    #[tokio::test]
    async fn test_redshift_variant() {
        let WarehouseCredentials::Postgres(params) = test_postgres_credentials("cluster.redshift") else {
            unreachable!()
        };
        let client = PostgresWarehouseClient::new(WarehouseCredentials::Redshift(params), 5).unwrap();
        assert_eq!(client.warehouse_type(), WarehouseType::Redshift);
        assert_eq!(client.dialect().field_quote, '"');
    }

    #[test]
    fn test_rejects_other_dialects() {
        let creds = WarehouseCredentials::Bigquery(crate::models::BigqueryCredentials {
            project: "p".to_string(),
            dataset: "d".to_string(),
            location: None,
            access_token: "t".to_string(),
            base_url: None,
        });
        assert!(PostgresWarehouseClient::new(creds, 5).is_err());
    }

    fn numeric_bytes(weight: i16, sign: u16, dscale: u16, digits: &[i16]) -> Vec<u8> {
        let mut raw = Vec::new();
        raw.extend_from_slice(&(digits.len() as i16).to_be_bytes());
        raw.extend_from_slice(&weight.to_be_bytes());
        raw.extend_from_slice(&sign.to_be_bytes());
        raw.extend_from_slice(&dscale.to_be_bytes());
        for digit in digits {
            raw.extend_from_slice(&digit.to_be_bytes());
        }
        raw
    }

    fn numeric_json(weight: i16, sign: u16, dscale: u16, digits: &[i16]) -> Value {
        decode_numeric(&numeric_bytes(weight, sign, dscale, digits)).unwrap().to_json()
    }

    #[test]
    fn test_numeric_accepts_only_numeric() {
        assert!(<PgNumeric as FromSql>::accepts(&Type::NUMERIC));
        assert!(!<PgNumeric as FromSql>::accepts(&Type::FLOAT8));
        assert!(!<PgNumeric as FromSql>::accepts(&Type::TEXT));
    }

    #[test]
    fn test_numeric_aggregates_become_json_numbers() {
        // AVG(amount) = 12345.678
        assert_eq!(numeric_json(1, NUMERIC_POS, 3, &[1, 2345, 6780]), json!(12345.678));
        // SUM(id) = 10000
        assert_eq!(numeric_json(1, NUMERIC_POS, 0, &[1]), json!(10000));
        assert_eq!(numeric_json(0, NUMERIC_NEG, 0, &[42]), json!(-42));
        assert_eq!(numeric_json(0, NUMERIC_POS, 0, &[]), json!(0));
        assert_eq!(numeric_json(-1, NUMERIC_POS, 2, &[500]), json!(0.05));
        assert_eq!(numeric_json(-2, NUMERIC_POS, 5, &[1000]), json!(0.00001));
    }

    #[test]
    fn test_numeric_text_keeps_scale() {
        let value = decode_numeric(&numeric_bytes(0, NUMERIC_NEG, 4, &[3, 1400])).unwrap();
        assert_eq!(value.text, "-3.1400");

        let value = decode_numeric(&numeric_bytes(2, NUMERIC_POS, 0, &[12, 0, 5])).unwrap();
        assert_eq!(value.text, "1200000005");
    }

    #[test]
    fn test_numeric_wider_than_i64_stays_text() {
        // 10^24
        let value = numeric_json(6, NUMERIC_POS, 0, &[1]);
        assert_eq!(value, json!("1000000000000000000000000"));
    }

    #[test]
    fn test_numeric_special_values() {
        assert_eq!(numeric_json(0, NUMERIC_NAN, 0, &[]), json!("NaN"));
        assert_eq!(numeric_json(0, NUMERIC_PINF, 0, &[]), json!("Infinity"));
        assert_eq!(numeric_json(0, NUMERIC_NINF, 0, &[]), json!("-Infinity"));
    }

    #[test]
    fn test_numeric_rejects_malformed_bytes() {
        assert!(decode_numeric(&[0, 1, 0]).is_err());

        let mut truncated = numeric_bytes(0, NUMERIC_POS, 0, &[7]);
        truncated.pop();
        assert!(decode_numeric(&truncated).is_err());

        assert!(decode_numeric(&numeric_bytes(0, 0x1234, 0, &[7])).is_err());
        assert!(decode_numeric(&numeric_bytes(0, NUMERIC_POS, 0, &[10_000])).is_err());
    }
}
