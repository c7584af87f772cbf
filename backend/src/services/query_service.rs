use crate::api::middleware::AppError;
use crate::models::{
    CacheMetadata, RunMetricQueryRequest, RunMetricQueryResponse, UserAttributeValueMap, WarehouseCredentials,
};
use crate::services::client_cache::WarehouseClientCache;
use crate::services::credential_store::CredentialStore;
use crate::services::query_compiler::MetricQueryCompiler;
use crate::services::results_cache::ResultsCache;
use crate::services::ssh_tunnel::TunnelConnector;
use crate::validation::SqlValidator;
use std::sync::Arc;
use std::time::Duration;

/// Runs metric queries for projects: credentials, tunnel, client, cache, warehouse
pub struct ProjectQueryService {
    credential_store: Arc<dyn CredentialStore>,
    tunnels: Arc<dyn TunnelConnector>,
    clients: Arc<WarehouseClientCache>,
    results_cache: Arc<ResultsCache>,
    compiler: Arc<dyn MetricQueryCompiler>,
    query_timeout: Option<Duration>,
    max_limit: u64,
}

impl ProjectQueryService {
    pub fn new(
        credential_store: Arc<dyn CredentialStore>,
        tunnels: Arc<dyn TunnelConnector>,
        clients: Arc<WarehouseClientCache>,
        results_cache: Arc<ResultsCache>,
        compiler: Arc<dyn MetricQueryCompiler>,
        query_timeout: Option<Duration>,
        max_limit: u64,
    ) -> Self {
        Self {
            credential_store,
            tunnels,
            clients,
            results_cache,
            compiler,
            query_timeout,
            max_limit,
        }
    }

    pub fn clients(&self) -> &Arc<WarehouseClientCache> {
        &self.clients
    }

    pub fn results_cache(&self) -> &Arc<ResultsCache> {
        &self.results_cache
    }

    /// Open a connection with the given credentials and run the warehouse's connection check.
    ///
    /// The client is built outside the registry, and the tunnel (if any) is
    /// closed whether or not the check passes.
    pub async fn test_credentials(&self, credentials: &WarehouseCredentials) -> Result<(), AppError> {
        let check = async {
            let (mut session, effective_credentials) = self.tunnels.connect(credentials).await?;
            let result = match self.clients.create_uncached(&effective_credentials) {
                Ok(client) => client.test_connection().await,
                Err(e) => Err(e),
            };
            self.tunnels.disconnect(&mut session).await;
            result
        };

        let result = match self.query_timeout {
            Some(limit) => tokio::time::timeout(limit, check).await.map_err(|_| {
                AppError::Timeout(format!("Connection check did not finish within {} seconds", limit.as_secs_f64()))
            })?,
            None => check.await,
        };

        match &result {
            Ok(()) => tracing::info!("Connection check passed for {}", credentials.describe()),
            Err(e) => tracing::warn!("Connection check failed for {}: {}", credentials.describe(), e),
        }
        result
    }

    /// Execute a metric query, serving it from the results cache when a fresh entry exists.
    ///
    /// When the caller-side timeout elapses the in-flight work is dropped;
    /// an open tunnel is then torn down by its session's `Drop`.
    pub async fn run_metric_query(
        &self,
        project_uuid: &str,
        request: RunMetricQueryRequest,
    ) -> Result<RunMetricQueryResponse, AppError> {
        match self.query_timeout {
            Some(limit) => tokio::time::timeout(limit, self.run(project_uuid, &request))
                .await
                .map_err(|_| {
                    tracing::warn!("Query for project {} timed out after {:?}", project_uuid, limit);
                    AppError::Timeout(format!("Query did not finish within {} seconds", limit.as_secs_f64()))
                })?,
            None => self.run(project_uuid, &request).await,
        }
    }

    async fn run(
        &self,
        project_uuid: &str,
        request: &RunMetricQueryRequest,
    ) -> Result<RunMetricQueryResponse, AppError> {
        let limit = request.metric_query.limit;
        if limit == 0 || limit > self.max_limit {
            return Err(AppError::Validation(format!(
                "Query limit must be between 1 and {}, got {}",
                self.max_limit, limit
            )));
        }

        let credentials = self.credential_store.get_credentials(project_uuid).await?;
        let user_attributes = self
            .credential_store
            .get_attribute_overrides(&request.organization_uuid, &request.user_uuid)
            .await?;

        let (mut session, effective_credentials) = self.tunnels.connect(&credentials).await?;

        let result = self
            .execute(
                project_uuid,
                request,
                &effective_credentials,
                session.is_tunneled(),
                &user_attributes,
            )
            .await;

        // Every path past a successful connect ends here
        self.tunnels.disconnect(&mut session).await;

        result
    }

    async fn execute(
        &self,
        project_uuid: &str,
        request: &RunMetricQueryRequest,
        credentials: &WarehouseCredentials,
        tunneled: bool,
        user_attributes: &UserAttributeValueMap,
    ) -> Result<RunMetricQueryResponse, AppError> {
        let client = self.clients.resolve_client(project_uuid, credentials, tunneled).await?;
        let warehouse_type = client.warehouse_type();

        let compiled = self.compiler.compile(
            &request.explore,
            &request.metric_query,
            &client.dialect(),
            user_attributes,
        )?;
        SqlValidator::validate_select_only(&compiled.query_text, warehouse_type)?;

        let key = ResultsCache::derive_key(project_uuid, &compiled.query_text);

        if let Some(cached) = self.results_cache.lookup(&key).await {
            tracing::info!(
                "Serving {} rows for project {} from results cache (updated {})",
                cached.rows.len(),
                project_uuid,
                cached.updated_at
            );
            return Ok(RunMetricQueryResponse {
                rows: cached.rows,
                cache_metadata: CacheMetadata::hit(cached.updated_at),
                query: compiled.query_text,
                has_example_metric: compiled.has_example_metric,
                warehouse_type,
            });
        }

        let tags = request.query_tags.clone().unwrap_or_default();
        let result = client.run_query(&compiled.query_text, &tags).await?;

        tracing::info!(
            "Query for project {} returned {} rows from {} in {}ms",
            project_uuid,
            result.row_count,
            warehouse_type.as_str(),
            result.execution_time_ms
        );

        self.results_cache.store(&key, &result.rows, &tags);

        Ok(RunMetricQueryResponse {
            rows: result.rows,
            cache_metadata: CacheMetadata::miss(),
            query: compiled.query_text,
            has_example_metric: compiled.has_example_metric,
            warehouse_type,
        })
    }
}
