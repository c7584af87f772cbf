use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::api::middleware::AppError;
use crate::models::WarehouseCredentials;
use crate::services::warehouse::{WarehouseClient, WarehouseClientFactory};

/// Registry of live warehouse clients, one per project.
///
/// A cached client is reused only while its credentials are equal to the
/// freshly resolved ones. Construction happens outside the lock, so two
/// tasks resolving different credentials for the same project race and the
/// last writer wins; every read re-checks equality, so a stale winner is
/// simply replaced on the next call.
pub struct WarehouseClientCache {
    clients: Arc<RwLock<HashMap<String, Arc<dyn WarehouseClient>>>>,
    factory: Arc<dyn WarehouseClientFactory>,
}

impl WarehouseClientCache {
    pub fn new(factory: Arc<dyn WarehouseClientFactory>) -> Self {
        Self {
            clients: Arc::new(RwLock::new(HashMap::new())),
            factory,
        }
    }

    /// Get the cached client for a project or build a new one.
    ///
    /// Tunneled sessions always get a fresh client that is never stored:
    /// their local endpoint only lives as long as the session.
    pub async fn resolve_client(
        &self,
        project_uuid: &str,
        credentials: &WarehouseCredentials,
        tunneled: bool,
    ) -> Result<Arc<dyn WarehouseClient>, AppError> {
        if tunneled {
            tracing::debug!("Creating uncached client for tunneled session of project {}", project_uuid);
            return self.create_uncached(credentials);
        }

        {
            let clients = self.clients.read().await;
            if let Some(client) = clients.get(project_uuid) {
                if client.credentials() == credentials {
                    tracing::debug!("Using cached warehouse client for project {}", project_uuid);
                    return Ok(client.clone());
                }
            }
        }

        let client = self.factory.create(credentials)?;

        let mut clients = self.clients.write().await;
        // The superseded client closes once in-flight queries drop their handles
        if clients.insert(project_uuid.to_string(), client.clone()).is_some() {
            tracing::info!("Replaced warehouse client for project {} after credentials changed", project_uuid);
        } else {
            tracing::info!("Cached new warehouse client for project {}", project_uuid);
        }

        Ok(client)
    }

    /// Build a client that the registry never stores
    pub fn create_uncached(&self, credentials: &WarehouseCredentials) -> Result<Arc<dyn WarehouseClient>, AppError> {
        self.factory.create(credentials)
    }

    /// Drop the cached client for a project (e.g. after its credentials are updated)
    pub async fn remove_client(&self, project_uuid: &str) -> bool {
        let mut clients = self.clients.write().await;
        let removed = clients.remove(project_uuid).is_some();

        if removed {
            tracing::info!("Removed cached warehouse client for project {}", project_uuid);
        }

        removed
    }

    /// Get the number of cached clients
    pub async fn client_count(&self) -> usize {
        let clients = self.clients.read().await;
        clients.len()
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::FakeClientFactory;
    use super::*;
    use crate::models::test_postgres_credentials;

    fn create_cache() -> (WarehouseClientCache, Arc<FakeClientFactory>) {
        let factory = Arc::new(FakeClientFactory::default());
        (WarehouseClientCache::new(factory.clone()), factory)
    }

    #[tokio::test]
    async fn test_cache_creation() {
        let (cache, _) = create_cache();
        assert_eq!(cache.client_count().await, 0);
    }

    #[tokio::test]
    async fn test_unchanged_credentials_reuse_client() {
        let (cache, factory) = create_cache();
        let creds = test_postgres_credentials("db.internal");

        let first = cache.resolve_client("p1", &creds, false).await.unwrap();
        let second = cache.resolve_client("p1", &creds.clone(), false).await.unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(factory.created(), 1);
        assert_eq!(cache.client_count().await, 1);
    }

    #[tokio::test]
    async fn test_changed_credentials_replace_client() {
        let (cache, factory) = create_cache();

        let first = cache.resolve_client("p1", &test_postgres_credentials("old.host"), false).await.unwrap();
        let second = cache.resolve_client("p1", &test_postgres_credentials("new.host"), false).await.unwrap();

        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(factory.created(), 2);
        assert_eq!(cache.client_count().await, 1);

        // The replacement is what gets reused afterwards
        let third = cache.resolve_client("p1", &test_postgres_credentials("new.host"), false).await.unwrap();
        assert!(Arc::ptr_eq(&second, &third));
    }

    #[tokio::test]
    async fn test_projects_are_isolated() {
        let (cache, factory) = create_cache();
        let creds = test_postgres_credentials("db.internal");

        let p1 = cache.resolve_client("p1", &creds, false).await.unwrap();
        let p2 = cache.resolve_client("p2", &creds, false).await.unwrap();

        assert!(!Arc::ptr_eq(&p1, &p2));
        assert_eq!(factory.created(), 2);
    }

    #[tokio::test]
    async fn test_tunneled_sessions_bypass_cache() {
        let (cache, factory) = create_cache();
        let creds = test_postgres_credentials("127.0.0.1");

        let first = cache.resolve_client("p1", &creds, true).await.unwrap();
        let second = cache.resolve_client("p1", &creds, true).await.unwrap();

        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(factory.created(), 2);
        assert_eq!(cache.client_count().await, 0);
    }

    #[tokio::test]
    async fn test_superseded_client_is_released_by_registry() {
        let (cache, _) = create_cache();
        let old = cache.resolve_client("p1", &test_postgres_credentials("old.host"), false).await.unwrap();
        assert_eq!(Arc::strong_count(&old), 2);

        cache.resolve_client("p1", &test_postgres_credentials("new.host"), false).await.unwrap();
        // Only the in-flight holder keeps it alive now
        assert_eq!(Arc::strong_count(&old), 1);
    }

    #[tokio::test]
    async fn test_remove_client() {
        let (cache, _) = create_cache();
        assert!(!cache.remove_client("p1").await);

        cache.resolve_client("p1", &test_postgres_credentials("db"), false).await.unwrap();
        assert!(cache.remove_client("p1").await);
        assert_eq!(cache.client_count().await, 0);
    }

    #[tokio::test]
    async fn test_concurrent_rotation_keeps_one_consistent_entry() {
        let (cache, factory) = create_cache();
        let old_creds = test_postgres_credentials("old.host");
        let new_creds = test_postgres_credentials("new.host");

        let (a, b) = futures::join!(
            cache.resolve_client("p1", &old_creds, false),
            cache.resolve_client("p1", &new_creds, false)
        );
        let (a, b) = (a.unwrap(), b.unwrap());

        // Each caller runs on the credentials it resolved, whoever won the insert
        assert_eq!(a.credentials(), &old_creds);
        assert_eq!(b.credentials(), &new_creds);
        assert_eq!(factory.created(), 2);
        assert_eq!(cache.client_count().await, 1);

        let cached = cache.clients.read().await.get("p1").map(|c| c.credentials().clone()).unwrap();
        assert!(cached == old_creds || cached == new_creds);

        // The next resolve converges on the requested credentials
        let latest = cache.resolve_client("p1", &new_creds, false).await.unwrap();
        assert_eq!(latest.credentials(), &new_creds);
        let cached = cache.clients.read().await.get("p1").map(|c| c.credentials().clone()).unwrap();
        assert_eq!(cached, new_creds);
    }

    #[tokio::test]
    async fn test_create_uncached_leaves_registry_alone() {
        let (cache, factory) = create_cache();
        let client = cache.create_uncached(&test_postgres_credentials("db.internal")).unwrap();

        assert_eq!(client.credentials(), &test_postgres_credentials("db.internal"));
        assert_eq!(factory.created(), 1);
        assert_eq!(cache.client_count().await, 0);
    }
}
