use serde::{Deserialize, Serialize};

use crate::api::middleware::AppError;

/// Warehouse dialect tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WarehouseType {
    Postgres,
    Redshift,
    Snowflake,
    Bigquery,
    Databricks,
}

impl WarehouseType {
    pub fn from_str(s: &str) -> Result<Self, AppError> {
        match s.to_lowercase().as_str() {
            "postgres" | "postgresql" => Ok(WarehouseType::Postgres),
            "redshift" => Ok(WarehouseType::Redshift),
            "snowflake" => Ok(WarehouseType::Snowflake),
            "bigquery" => Ok(WarehouseType::Bigquery),
            "databricks" => Ok(WarehouseType::Databricks),
            _ => Err(AppError::Validation(format!("Unsupported warehouse type: {}", s))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            WarehouseType::Postgres => "postgres",
            WarehouseType::Redshift => "redshift",
            WarehouseType::Snowflake => "snowflake",
            WarehouseType::Bigquery => "bigquery",
            WarehouseType::Databricks => "databricks",
        }
    }
}

/// Bastion host used to reach a warehouse that is not directly routable
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SshTunnelConfig {
    pub host: String,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    pub user: String,
    /// PEM/OpenSSH private key contents
    pub private_key: String,
    /// known_hosts lines for the bastion; when absent any host key is accepted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub known_hosts: Option<String>,
}

fn default_ssh_port() -> u16 {
    22
}

/// Postgres wire protocol credentials, shared by Postgres and Redshift
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostgresCredentials {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub dbname: String,
    pub schema: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh_tunnel: Option<SshTunnelConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnowflakeCredentials {
    /// Account identifier, e.g. `myorg-myaccount`
    pub account: String,
    pub user: String,
    pub access_token: String,
    #[serde(default = "default_snowflake_token_type")]
    pub token_type: String,
    pub database: String,
    pub warehouse: String,
    pub schema: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    /// Overrides `https://<account>.snowflakecomputing.com`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
}

fn default_snowflake_token_type() -> String {
    "PROGRAMMATIC_ACCESS_TOKEN".to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BigqueryCredentials {
    pub project: String,
    pub dataset: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    /// OAuth2 bearer token minted for the service account
    pub access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabricksCredentials {
    pub server_hostname: String,
    /// e.g. `/sql/1.0/warehouses/abc123`
    pub http_path: String,
    pub personal_access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub catalog: Option<String>,
    pub database: String,
}

/// Per-project warehouse connection descriptor.
///
/// Plain value type: two descriptors are interchangeable exactly when they
/// compare equal, which is what the client cache relies on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum WarehouseCredentials {
    Postgres(PostgresCredentials),
    Redshift(PostgresCredentials),
    Snowflake(SnowflakeCredentials),
    Bigquery(BigqueryCredentials),
    Databricks(DatabricksCredentials),
}

impl WarehouseCredentials {
    pub fn warehouse_type(&self) -> WarehouseType {
        match self {
            WarehouseCredentials::Postgres(_) => WarehouseType::Postgres,
            WarehouseCredentials::Redshift(_) => WarehouseType::Redshift,
            WarehouseCredentials::Snowflake(_) => WarehouseType::Snowflake,
            WarehouseCredentials::Bigquery(_) => WarehouseType::Bigquery,
            WarehouseCredentials::Databricks(_) => WarehouseType::Databricks,
        }
    }

    pub fn ssh_tunnel(&self) -> Option<&SshTunnelConfig> {
        match self {
            WarehouseCredentials::Postgres(c) | WarehouseCredentials::Redshift(c) => c.ssh_tunnel.as_ref(),
            _ => None,
        }
    }

    /// Host and port the warehouse listens on, for dialects that can be tunneled
    pub fn endpoint(&self) -> Option<(&str, u16)> {
        match self {
            WarehouseCredentials::Postgres(c) | WarehouseCredentials::Redshift(c) => {
                Some((c.host.as_str(), c.port))
            }
            _ => None,
        }
    }

    /// Copy of these credentials pointing at a local tunnel endpoint
    pub fn with_endpoint(&self, host: &str, port: u16) -> Self {
        let mut rewritten = self.clone();
        match &mut rewritten {
            WarehouseCredentials::Postgres(c) | WarehouseCredentials::Redshift(c) => {
                c.host = host.to_string();
                c.port = port;
            }
            _ => {}
        }
        rewritten
    }

    /// Secret-free summary for logs
    pub fn describe(&self) -> String {
        match self {
            WarehouseCredentials::Postgres(c) | WarehouseCredentials::Redshift(c) => format!(
                "{}://{}@{}:{}/{}{}",
                self.warehouse_type().as_str(),
                c.user,
                c.host,
                c.port,
                c.dbname,
                if c.ssh_tunnel.is_some() { " (via ssh)" } else { "" }
            ),
            WarehouseCredentials::Snowflake(c) => {
                format!("snowflake://{}@{}/{}/{}", c.user, c.account, c.database, c.schema)
            }
            WarehouseCredentials::Bigquery(c) => format!("bigquery://{}/{}", c.project, c.dataset),
            WarehouseCredentials::Databricks(c) => {
                format!("databricks://{}{}", c.server_hostname, c.http_path)
            }
        }
    }
}

#[cfg(test)]
pub(crate) fn test_postgres_credentials(host: &str) -> WarehouseCredentials {
    WarehouseCredentials::Postgres(PostgresCredentials {
        host: host.to_string(),
        port: 5432,
        user: "analyst".to_string(),
        password: "s3cret".to_string(),
        dbname: "analytics".to_string(),
        schema: "public".to_string(),
        ssh_tunnel: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_credentials_tagged_serialization() {
        let creds = test_postgres_credentials("db.internal");
        let json = serde_json::to_value(&creds).unwrap();
        assert_eq!(json["type"], "postgres");
        assert!(json.get("ssh_tunnel").is_none());

        let parsed: WarehouseCredentials = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, creds);
    }

    #[test]
    fn test_structural_equality() {
        assert_eq!(test_postgres_credentials("a"), test_postgres_credentials("a"));
        assert_ne!(test_postgres_credentials("a"), test_postgres_credentials("b"));
    }

    #[test]
    fn test_with_endpoint_rewrites_only_host_and_port() {
        let creds = test_postgres_credentials("db.internal");
        let rewritten = creds.with_endpoint("127.0.0.1", 40123);
        assert_eq!(rewritten.endpoint(), Some(("127.0.0.1", 40123)));
        assert_eq!(creds.endpoint(), Some(("db.internal", 5432)));
        assert_eq!(rewritten.warehouse_type(), WarehouseType::Postgres);
    }

    #[test]
    fn test_describe_omits_password() {
        let summary = test_postgres_credentials("db.internal").describe();
        assert!(summary.contains("analyst@db.internal:5432"));
        assert!(!summary.contains("s3cret"));
    }

    #[test]
    fn test_warehouse_type_parsing() {
        assert_eq!(WarehouseType::from_str("PostgreSQL").unwrap(), WarehouseType::Postgres);
        assert_eq!(WarehouseType::from_str("bigquery").unwrap(), WarehouseType::Bigquery);
        assert!(WarehouseType::from_str("oracle").is_err());
    }
}
