use axum::{
    routing::{get, post, put},
    Router,
};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::api::handlers::{credentials, query, AppState};

/// Create router with application state
pub fn create_router_with_state(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route(
            "/api/projects/{project_uuid}/runQuery",
            post(query::run_query),
        )
        .route(
            "/api/projects/{project_uuid}/warehouse-credentials",
            put(credentials::save_credentials),
        )
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Health check endpoint
async fn health_check() -> &'static str {
    "OK"
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::services::client_cache::test_support::FakeClientFactory;
    use crate::services::{
        EncryptionService, ProjectCredentialStore, ProjectQueryService, ResultsCache, SqlMetricQueryCompiler,
        SshTunnelManager, WarehouseClientCache,
    };
    use crate::storage::SqliteStorage;
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use serde_json::{json, Value};
    use std::sync::Arc;
    use std::time::Duration;
    use tower::ServiceExt;

    async fn test_state() -> AppState {
        test_state_with(FakeClientFactory::with_rows(vec![json!({"status": "open", "order_count": 3})])).await
    }

    async fn test_state_with(factory: FakeClientFactory) -> AppState {
        let config = Config::from_lookup(|_| None).unwrap();
        let storage = Arc::new(SqliteStorage::new(":memory:").await.unwrap());
        let encryption = Arc::new(EncryptionService::new("route-test-secret").unwrap());
        let credential_store = Arc::new(ProjectCredentialStore::new(storage, encryption));
        let factory = Arc::new(factory);

        let query_service = Arc::new(ProjectQueryService::new(
            credential_store.clone(),
            Arc::new(SshTunnelManager::new("ssh", Duration::from_secs(1))),
            Arc::new(WarehouseClientCache::new(factory)),
            Arc::new(ResultsCache::disabled()),
            Arc::new(SqlMetricQueryCompiler),
            config.query.timeout(),
            config.query.max_limit,
        ));

        AppState {
            query_service,
            credential_store,
        }
    }

    fn run_query_body() -> Value {
        json!({
            "organizationUuid": "org-1",
            "userUuid": "user-1",
            "metricQuery": {"dimensions": ["status"], "metrics": ["order_count"], "limit": 10},
            "explore": {
                "name": "orders",
                "baseTable": "analytics.orders",
                "dimensions": [{"name": "status", "sql": "${TABLE}.status"}],
                "metrics": [{"name": "order_count", "sql": "${TABLE}.id", "aggregation": "count"}]
            },
            "queryTags": {"dashboard_uuid": "d-1"}
        })
    }

    fn save_credentials_body() -> Value {
        json!({
            "organizationUuid": "org-1",
            "credentials": {
                "type": "postgres",
                "host": "db.internal",
                "port": 5432,
                "user": "analyst",
                "password": "s3cret",
                "dbname": "analytics",
                "schema": "public"
            }
        })
    }

    fn json_request(method: &str, uri: &str, body: &Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_json(response: axum::response::Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health_check() {
        let app = create_router_with_state(test_state().await);
        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&bytes[..], b"OK");
    }

    #[tokio::test]
    async fn test_run_query_unknown_project_is_404() {
        let app = create_router_with_state(test_state().await);
        let response = app
            .oneshot(json_request("POST", "/api/projects/missing/runQuery", &run_query_body()))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body = body_json(response).await;
        assert_eq!(body["error"]["code"], "NOT_FOUND");
    }

    #[tokio::test]
    async fn test_save_credentials_then_run_query() {
        let state = test_state().await;
        let app = create_router_with_state(state.clone());

        let response = app
            .clone()
            .oneshot(json_request("PUT", "/api/projects/p1/warehouse-credentials", &save_credentials_body()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        let response = app
            .oneshot(json_request("POST", "/api/projects/p1/runQuery", &run_query_body()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = body_json(response).await;
        assert_eq!(body["cacheMetadata"]["cacheHit"], false);
        assert_eq!(body["rows"][0]["order_count"], 3);
        assert_eq!(body["warehouseType"], "postgres");
        assert_eq!(body["hasExampleMetric"], false);
        assert!(body["query"].as_str().unwrap().ends_with("LIMIT 10"));
        assert_eq!(state.query_service.clients().client_count().await, 1);
    }

    #[tokio::test]
    async fn test_saving_credentials_evicts_cached_client() {
        let state = test_state().await;
        let app = create_router_with_state(state.clone());

        app.clone()
            .oneshot(json_request("PUT", "/api/projects/p1/warehouse-credentials", &save_credentials_body()))
            .await
            .unwrap();
        app.clone()
            .oneshot(json_request("POST", "/api/projects/p1/runQuery", &run_query_body()))
            .await
            .unwrap();
        assert_eq!(state.query_service.clients().client_count().await, 1);

        let response = app
            .oneshot(json_request("PUT", "/api/projects/p1/warehouse-credentials", &save_credentials_body()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        assert_eq!(state.query_service.clients().client_count().await, 0);
    }

    #[tokio::test]
    async fn test_unreachable_credentials_are_not_saved() {
        let factory = FakeClientFactory {
            fail_with: Some("connection refused".to_string()),
            ..Default::default()
        };
        let app = create_router_with_state(test_state_with(factory).await);

        let response = app
            .clone()
            .oneshot(json_request("PUT", "/api/projects/p1/warehouse-credentials", &save_credentials_body()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        let body = body_json(response).await;
        assert_eq!(body["error"]["code"], "WAREHOUSE_CONNECTION_ERROR");

        let response = app
            .oneshot(json_request("POST", "/api/projects/p1/runQuery", &run_query_body()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_limit_over_maximum_is_400() {
        let state = test_state().await;
        let app = create_router_with_state(state);
        let mut body = run_query_body();
        body["metricQuery"]["limit"] = json!(100_000);

        let response = app
            .oneshot(json_request("POST", "/api/projects/p1/runQuery", &body))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert_eq!(body["error"]["code"], "VALIDATION_ERROR");
    }

    #[tokio::test]
    async fn test_unknown_warehouse_type_is_rejected() {
        let app = create_router_with_state(test_state().await);
        let mut body = save_credentials_body();
        body["credentials"]["type"] = json!("oracle");

        let response = app
            .oneshot(json_request("PUT", "/api/projects/p1/warehouse-credentials", &body))
            .await
            .unwrap();

        assert!(response.status().is_client_error());
    }
}
