use serde::Deserialize;
use std::env;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub database: DatabaseConfig,
    pub server: ServerConfig,
    pub logging: LoggingConfig,
    pub encryption: EncryptionConfig,
    pub results_cache: ResultsCacheConfig,
    pub query: QueryConfig,
    pub ssh: SshConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub style: String,
}

#[derive(Clone, Deserialize)]
pub struct EncryptionConfig {
    pub secret: Option<String>,
}

// Keep the secret out of debug output
impl std::fmt::Debug for EncryptionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptionConfig")
            .field("secret", &self.secret.as_ref().map(|_| "***"))
            .finish()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResultsCacheConfig {
    pub enabled: bool,
    /// Entries at least this old are stale
    pub cache_state_time_seconds: u64,
    /// `memory://`, `file:///path` or `s3://bucket/prefix`
    pub store_url: String,
}

impl ResultsCacheConfig {
    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.cache_state_time_seconds)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueryConfig {
    /// 0 disables the caller-side timeout
    pub timeout_secs: u64,
    pub max_limit: u64,
}

impl QueryConfig {
    pub fn timeout(&self) -> Option<Duration> {
        (self.timeout_secs > 0).then(|| Duration::from_secs(self.timeout_secs))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SshConfig {
    pub binary: String,
    pub connect_timeout_secs: u64,
}

/// Environment variable to config key
const ENV_OVERRIDES: &[(&str, &str)] = &[
    ("DATABASE_URL", "database.url"),
    ("HOST", "server.host"),
    ("PORT", "server.port"),
    ("RUST_LOG", "logging.level"),
    ("RUST_LOG_STYLE", "logging.style"),
    ("ENCRYPTION_SECRET", "encryption.secret"),
    ("RESULTS_CACHE_ENABLED", "results_cache.enabled"),
    ("CACHE_STALE_TIME", "results_cache.cache_state_time_seconds"),
    ("RESULTS_CACHE_STORE_URL", "results_cache.store_url"),
    ("QUERY_TIMEOUT_SECS", "query.timeout_secs"),
    ("QUERY_MAX_LIMIT", "query.max_limit"),
    ("SSH_BINARY", "ssh.binary"),
    ("SSH_CONNECT_TIMEOUT_SECS", "ssh.connect_timeout_secs"),
];

impl Config {
    pub fn from_env() -> Result<Self, config::ConfigError> {
        // Try to load from .env file
        let _ = dotenv::dotenv();

        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Build the config from defaults plus whatever `lookup` returns for each known variable
    pub fn from_lookup<F>(lookup: F) -> Result<Self, config::ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut builder = config::Config::builder()
            .set_default("database.url", "./warehouse-query.db")?
            .set_default("server.host", "0.0.0.0")?
            .set_default("server.port", 3000)?
            .set_default("logging.level", "info")?
            .set_default("logging.style", "auto")?
            .set_default("encryption.secret", None::<String>)?
            .set_default("results_cache.enabled", false)?
            .set_default("results_cache.cache_state_time_seconds", 86400)?
            .set_default("results_cache.store_url", "memory://")?
            .set_default("query.timeout_secs", 300)?
            .set_default("query.max_limit", 5000)?
            .set_default("ssh.binary", "ssh")?
            .set_default("ssh.connect_timeout_secs", 15)?;

        for (variable, key) in ENV_OVERRIDES {
            if let Some(value) = lookup(variable) {
                builder = builder.set_override(*key, value)?;
            }
        }

        builder.build()?.try_deserialize()
    }

    pub fn server_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_with(vars: &[(&str, &str)]) -> Result<Config, config::ConfigError> {
        let vars: HashMap<String, String> = vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        Config::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn test_config_defaults() {
        let config = config_with(&[]).unwrap();

        assert_eq!(config.server.port, 3000);
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.database.url, "./warehouse-query.db");
        assert!(config.encryption.secret.is_none());
        assert!(!config.results_cache.enabled);
        assert_eq!(config.results_cache.cache_state_time_seconds, 86400);
        assert_eq!(config.results_cache.store_url, "memory://");
        assert_eq!(config.query.max_limit, 5000);
        assert_eq!(config.query.timeout(), Some(Duration::from_secs(300)));
        assert_eq!(config.ssh.binary, "ssh");
    }

    #[test]
    fn test_env_overrides() {
        let config = config_with(&[
            ("PORT", "8080"),
            ("ENCRYPTION_SECRET", "hunter2"),
            ("RESULTS_CACHE_ENABLED", "true"),
            ("CACHE_STALE_TIME", "3600"),
            ("RESULTS_CACHE_STORE_URL", "s3://bucket/results"),
            ("QUERY_TIMEOUT_SECS", "0"),
        ])
        .unwrap();

        assert_eq!(config.server_address(), "0.0.0.0:8080");
        assert_eq!(config.encryption.secret.as_deref(), Some("hunter2"));
        assert!(config.results_cache.enabled);
        assert_eq!(config.results_cache.stale_after(), Duration::from_secs(3600));
        assert_eq!(config.results_cache.store_url, "s3://bucket/results");
        assert_eq!(config.query.timeout(), None);
    }

    #[test]
    fn test_invalid_port_is_an_error() {
        assert!(config_with(&[("PORT", "not-a-port")]).is_err());
    }

    #[test]
    fn test_secret_not_in_debug_output() {
        let config = config_with(&[("ENCRYPTION_SECRET", "hunter2")]).unwrap();
        assert!(!format!("{:?}", config).contains("hunter2"));
    }
}
