use std::sync::Arc;

use crate::api::middleware::AppError;
use crate::models::{UserAttributeValueMap, WarehouseCredentials};
use crate::services::encryption::EncryptionService;
use crate::storage::{SqliteStorage, UserAttributeRow};

/// Source of per-project warehouse credentials and per-user attribute values
#[async_trait::async_trait]
pub trait CredentialStore: Send + Sync {
    /// Fetch and decrypt the credentials for a project
    async fn get_credentials(&self, project_uuid: &str) -> Result<WarehouseCredentials, AppError>;

    /// Organization attribute defaults overridden by the user's own values
    async fn get_attribute_overrides(
        &self,
        organization_uuid: &str,
        user_uuid: &str,
    ) -> Result<UserAttributeValueMap, AppError>;
}

/// Credential store backed by SQLite with AES-GCM encrypted blobs
pub struct ProjectCredentialStore {
    storage: Arc<SqliteStorage>,
    encryption: Arc<EncryptionService>,
}

impl ProjectCredentialStore {
    pub fn new(storage: Arc<SqliteStorage>, encryption: Arc<EncryptionService>) -> Self {
        Self { storage, encryption }
    }

    /// Encrypt and upsert a project's credentials
    pub async fn save_credentials(
        &self,
        project_uuid: &str,
        organization_uuid: &str,
        credentials: &WarehouseCredentials,
    ) -> Result<(), AppError> {
        let plaintext = serde_json::to_vec(credentials)
            .map_err(|e| AppError::Internal(format!("Failed to serialize credentials: {}", e)))?;
        let blob = self.encryption.encrypt(&plaintext)?;

        self.storage
            .save_warehouse_credentials(
                project_uuid,
                organization_uuid,
                credentials.warehouse_type().as_str(),
                &blob,
            )
            .await?;

        tracing::info!(
            "Saved {} credentials for project {}",
            credentials.warehouse_type().as_str(),
            project_uuid
        );
        Ok(())
    }
}

#[async_trait::async_trait]
impl CredentialStore for ProjectCredentialStore {
    async fn get_credentials(&self, project_uuid: &str) -> Result<WarehouseCredentials, AppError> {
        let stored = self
            .storage
            .get_warehouse_credentials(project_uuid)
            .await?
            .ok_or_else(|| {
                AppError::NotFound(format!("Cannot find warehouse credentials for project {}", project_uuid))
            })?;

        let plaintext = self.encryption.decrypt(&stored.encrypted_credentials)?;
        serde_json::from_slice::<WarehouseCredentials>(&plaintext)
            .map_err(|e| AppError::Decode(format!("credentials for project {} are not valid JSON: {}", project_uuid, e)))
    }

    async fn get_attribute_overrides(
        &self,
        organization_uuid: &str,
        user_uuid: &str,
    ) -> Result<UserAttributeValueMap, AppError> {
        let rows = self
            .storage
            .get_user_attribute_rows(organization_uuid, user_uuid)
            .await?;
        Ok(merge_attribute_values(rows))
    }
}

/// User value wins; attributes with neither a value nor a default are dropped
fn merge_attribute_values(rows: Vec<UserAttributeRow>) -> UserAttributeValueMap {
    rows.into_iter()
        .filter_map(|row| {
            row.user_value
                .or(row.attribute_default)
                .map(|value| (row.name, value))
        })
        .collect()
}
