use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::models::{Explore, MetricQuery, WarehouseCredentials, WarehouseType};

/// Opaque key/value metadata attached to a warehouse session
pub type QueryTags = BTreeMap<String, String>;

/// Per-user attribute values after merging organization defaults
pub type UserAttributeValueMap = BTreeMap<String, String>;

/// Body of `POST /api/projects/{project_uuid}/runQuery`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunMetricQueryRequest {
    pub organization_uuid: String,
    pub user_uuid: String,
    pub metric_query: MetricQuery,
    pub explore: Explore,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query_tags: Option<QueryTags>,
}

/// Where the returned rows came from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheMetadata {
    pub cache_hit: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_updated_time: Option<DateTime<Utc>>,
}

impl CacheMetadata {
    pub fn miss() -> Self {
        Self {
            cache_hit: false,
            cache_updated_time: None,
        }
    }

    pub fn hit(updated_at: DateTime<Utc>) -> Self {
        Self {
            cache_hit: true,
            cache_updated_time: Some(updated_at),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunMetricQueryResponse {
    pub rows: Vec<Value>,
    pub cache_metadata: CacheMetadata,
    /// Compiled warehouse SQL
    pub query: String,
    pub has_example_metric: bool,
    pub warehouse_type: WarehouseType,
}

/// Body of `PUT /api/projects/{project_uuid}/warehouse-credentials`
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveCredentialsRequest {
    pub organization_uuid: String,
    pub credentials: WarehouseCredentials,
}
