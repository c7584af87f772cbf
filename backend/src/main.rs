use axum::Router;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

use warehouse_query_backend::api::handlers::AppState;
use warehouse_query_backend::api::routes::create_router_with_state;
use warehouse_query_backend::config::Config;
use warehouse_query_backend::services::warehouse::DefaultWarehouseClientFactory;
use warehouse_query_backend::services::{
    EncryptionService, ProjectCredentialStore, ProjectQueryService, ResultsCache, SqlMetricQueryCompiler,
    SshTunnelManager, WarehouseClientCache,
};
use warehouse_query_backend::storage::SqliteStorage;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration (also reads .env, so it must come before the log filter)
    let config = Config::from_env()?;

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.logging.level)),
        )
        .with_ansi(config.logging.style != "never")
        .init();

    let secret = config.encryption.secret.clone().ok_or_else(|| {
        error!("ENCRYPTION_SECRET is not set");
        anyhow::anyhow!("ENCRYPTION_SECRET must be set to read warehouse credentials")
    })?;
    let encryption = Arc::new(EncryptionService::new(&secret)?);

    // Initialize SQLite storage
    let storage = Arc::new(SqliteStorage::new(&config.database.url).await.map_err(|e| {
        error!("Failed to initialize database: {}", e);
        e
    })?);

    let credential_store = Arc::new(ProjectCredentialStore::new(storage, encryption));
    let factory = Arc::new(DefaultWarehouseClientFactory::new(config.query.timeout_secs.max(1))?);
    let results_cache = Arc::new(ResultsCache::from_config(&config.results_cache).map_err(|e| {
        error!("Failed to initialize results cache: {}", e);
        e
    })?);
    let tunnels = Arc::new(SshTunnelManager::new(
        &config.ssh.binary,
        Duration::from_secs(config.ssh.connect_timeout_secs),
    ));

    let query_service = Arc::new(ProjectQueryService::new(
        credential_store.clone(),
        tunnels,
        Arc::new(WarehouseClientCache::new(factory)),
        results_cache.clone(),
        Arc::new(SqlMetricQueryCompiler),
        config.query.timeout(),
        config.query.max_limit,
    ));

    let state = AppState {
        query_service,
        credential_store,
    };
    let app: Router = create_router_with_state(state);

    // Start server
    let addr: SocketAddr = config.server_address().parse()?;
    info!("Server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Let detached cache writes land before exiting
    results_cache.flush().await;
    info!("Server stopped");

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
    }
    info!("Shutdown signal received");
}
