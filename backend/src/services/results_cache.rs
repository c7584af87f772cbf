// Query Results Cache Service
//
// Content-addressed cache of warehouse result sets on an object store.
// Freshness comes from the object's last-modified time, so entries never
// need to be rewritten to expire. Cache failures are logged and treated as
// misses; they never fail a query.

use crate::config::ResultsCacheConfig;
use crate::models::QueryTags;
use chrono::{DateTime, Utc};
use object_store::path::Path;
use object_store::{ObjectStore, PutOptions, PutPayload, TagSet};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;

const DEFAULT_PREFIX: &str = "results-cache";

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Object store error: {0}")]
    ObjectStore(#[from] object_store::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid cache configuration: {0}")]
    Config(String),
}

/// Source of "now" for freshness checks
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A fresh cache hit
#[derive(Debug, Clone, PartialEq)]
pub struct CachedResults {
    pub rows: Vec<Value>,
    pub updated_at: DateTime<Utc>,
}

pub struct ResultsCache {
    store: Arc<dyn ObjectStore>,
    prefix: Path,
    enabled: bool,
    stale_after: Duration,
    clock: Arc<dyn Clock>,
    /// Detached writes not yet known to be finished
    pending: Mutex<Vec<JoinHandle<()>>>,
}

impl ResultsCache {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        prefix: Path,
        enabled: bool,
        stale_after: Duration,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            prefix,
            enabled,
            stale_after,
            clock,
            pending: Mutex::new(Vec::new()),
        }
    }

    /// A cache that always misses and never writes
    pub fn disabled() -> Self {
        Self::new(
            Arc::new(object_store::memory::InMemory::new()),
            Path::from(DEFAULT_PREFIX),
            false,
            Duration::ZERO,
            Arc::new(SystemClock),
        )
    }

    /// Build the store from `store_url`; S3 settings are read from `AWS_*` variables
    pub fn from_config(config: &ResultsCacheConfig) -> Result<Self, CacheError> {
        if !config.enabled {
            return Ok(Self::disabled());
        }

        let url = url::Url::parse(&config.store_url)
            .map_err(|e| CacheError::Config(format!("{}: {}", config.store_url, e)))?;
        let options = std::env::vars()
            .filter(|(key, _)| key.starts_with("AWS_"))
            .map(|(key, value)| (key.to_ascii_lowercase(), value));
        let (store, path) = object_store::parse_url_opts(&url, options)?;

        let prefix = if path.as_ref().is_empty() {
            Path::from(DEFAULT_PREFIX)
        } else {
            path
        };

        tracing::info!(
            "Results cache enabled at {} (stale after {}s)",
            config.store_url,
            config.cache_state_time_seconds
        );

        Ok(Self::new(
            Arc::from(store),
            prefix,
            true,
            config.stale_after(),
            Arc::new(SystemClock),
        ))
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Lowercase hex SHA-256 of `"{project_uuid}.{query_text}"`
    pub fn derive_key(project_uuid: &str, query_text: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(project_uuid.as_bytes());
        hasher.update(b".");
        hasher.update(query_text.as_bytes());
        hasher
            .finalize()
            .iter()
            .map(|b| format!("{:02x}", b))
            .collect()
    }

    /// An entry exactly at the threshold is already stale
    pub fn is_fresh(updated_at: DateTime<Utc>, now: DateTime<Utc>, stale_after: Duration) -> bool {
        match chrono::Duration::from_std(stale_after) {
            Ok(threshold) => now.signed_duration_since(updated_at) < threshold,
            Err(_) => true,
        }
    }

    fn location(&self, key: &str) -> Path {
        self.prefix.child(key)
    }

    /// Return fresh cached rows, or `None` on miss, staleness or any failure
    pub async fn lookup(&self, key: &str) -> Option<CachedResults> {
        if !self.enabled {
            return None;
        }

        match self.try_lookup(key).await {
            Ok(Some(hit)) => {
                tracing::debug!("Results cache hit for {}", key);
                Some(hit)
            }
            Ok(None) => {
                tracing::debug!("Results cache miss for {}", key);
                None
            }
            Err(e) => {
                tracing::warn!("Results cache lookup failed for {}, treating as miss: {}", key, e);
                None
            }
        }
    }

    async fn try_lookup(&self, key: &str) -> Result<Option<CachedResults>, CacheError> {
        let location = self.location(key);

        let meta = match self.store.head(&location).await {
            Ok(meta) => meta,
            Err(object_store::Error::NotFound { .. }) => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        if !Self::is_fresh(meta.last_modified, self.clock.now(), self.stale_after) {
            tracing::debug!("Results cache entry {} is stale (updated {})", key, meta.last_modified);
            return Ok(None);
        }

        let payload = self.store.get(&location).await?.bytes().await?;
        let rows: Vec<Value> = serde_json::from_slice(&payload)?;

        Ok(Some(CachedResults {
            rows,
            updated_at: meta.last_modified,
        }))
    }

    /// Write rows in a detached task; the caller never waits and never sees a failure
    pub fn store(&self, key: &str, rows: &[Value], tags: &QueryTags) {
        if !self.enabled {
            return;
        }

        let payload = match serde_json::to_vec(rows) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::warn!("Failed to serialize results for cache entry {}: {}", key, e);
                return;
            }
        };

        let mut tag_set = TagSet::default();
        for (name, value) in tags {
            tag_set.push(name, value);
        }
        let opts = PutOptions {
            tags: tag_set,
            ..Default::default()
        };

        let store = self.store.clone();
        let location = self.location(key);
        let key = key.to_string();

        let handle = tokio::spawn(async move {
            match store.put_opts(&location, PutPayload::from(payload), opts).await {
                Ok(_) => tracing::debug!("Results cache entry {} written", key),
                Err(e) => tracing::warn!("Failed to write results cache entry {}: {}", key, e),
            }
        });

        if let Ok(mut pending) = self.pending.lock() {
            pending.retain(|h| !h.is_finished());
            pending.push(handle);
        }
    }

    /// Wait for every write started so far
    pub async fn flush(&self) {
        let handles: Vec<JoinHandle<()>> = match self.pending.lock() {
            Ok(mut pending) => pending.drain(..).collect(),
            Err(_) => return,
        };

        for handle in handles {
            if let Err(e) = handle.await {
                tracing::warn!("Results cache write task failed: {}", e);
            }
        }
    }
}
