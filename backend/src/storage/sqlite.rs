use rusqlite::{Connection, OptionalExtension, Result as SqliteResult};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Encrypted credentials row joined with its project
#[derive(Debug, Clone)]
pub struct StoredCredentials {
    pub project_uuid: String,
    pub organization_uuid: String,
    pub warehouse_type: String,
    pub encrypted_credentials: Vec<u8>,
}

/// One attribute as seen by one user
#[derive(Debug, Clone, PartialEq)]
pub struct UserAttributeRow {
    pub name: String,
    pub attribute_default: Option<String>,
    pub user_value: Option<String>,
}

/// SQLite storage for projects, encrypted warehouse credentials and user attributes
/// Uses tokio::Mutex for async-friendly locking
pub struct SqliteStorage {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStorage {
    /// Create a new SQLite storage instance
    pub async fn new<P: AsRef<Path>>(db_path: P) -> SqliteResult<Self> {
        // Handle SQLite URL format (sqlite:./path or sqlite://path)
        let path_str = db_path.as_ref().to_string_lossy();
        let clean_path: &str = if path_str.starts_with("sqlite:") {
            let mut cleaned = path_str.trim_start_matches("sqlite:");
            cleaned = cleaned.trim_start_matches("//");
            cleaned
        } else {
            path_str.as_ref()
        };

        let conn = Connection::open(clean_path)?;
        let storage = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        storage.init_schema().await?;
        Ok(storage)
    }

    /// Initialize database schema
    async fn init_schema(&self) -> SqliteResult<()> {
        let conn = self.conn.lock().await;

        conn.execute("PRAGMA foreign_keys = ON", [])?;

        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS projects (
                project_uuid TEXT PRIMARY KEY,
                organization_uuid TEXT NOT NULL,
                created_at TEXT NOT NULL
            )
            "#,
            [],
        )?;

        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS warehouse_credentials (
                project_uuid TEXT PRIMARY KEY,
                warehouse_type TEXT NOT NULL,
                encrypted_credentials BLOB NOT NULL,
                updated_at TEXT NOT NULL,
                FOREIGN KEY (project_uuid) REFERENCES projects(project_uuid) ON DELETE CASCADE
            )
            "#,
            [],
        )?;

        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS user_attributes (
                user_attribute_uuid TEXT PRIMARY KEY,
                organization_uuid TEXT NOT NULL,
                name TEXT NOT NULL,
                attribute_default TEXT,
                UNIQUE(organization_uuid, name)
            )
            "#,
            [],
        )?;

        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS organization_member_user_attributes (
                user_uuid TEXT NOT NULL,
                user_attribute_uuid TEXT NOT NULL,
                value TEXT NOT NULL,
                PRIMARY KEY (user_uuid, user_attribute_uuid),
                FOREIGN KEY (user_attribute_uuid) REFERENCES user_attributes(user_attribute_uuid) ON DELETE CASCADE
            )
            "#,
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_user_attributes_organization ON user_attributes(organization_uuid)",
            [],
        )?;

        Ok(())
    }

    /// Insert or update a project together with its encrypted credentials
    pub async fn save_warehouse_credentials(
        &self,
        project_uuid: &str,
        organization_uuid: &str,
        warehouse_type: &str,
        encrypted_credentials: &[u8],
    ) -> SqliteResult<()> {
        let mut db_conn = self.conn.lock().await;
        let now = chrono::Utc::now().to_rfc3339();
        let tx = db_conn.transaction()?;

        tx.execute(
            r#"
            INSERT INTO projects (project_uuid, organization_uuid, created_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(project_uuid) DO UPDATE SET organization_uuid = excluded.organization_uuid
            "#,
            rusqlite::params![project_uuid, organization_uuid, now],
        )?;

        tx.execute(
            r#"
            INSERT OR REPLACE INTO warehouse_credentials
            (project_uuid, warehouse_type, encrypted_credentials, updated_at)
            VALUES (?1, ?2, ?3, ?4)
            "#,
            rusqlite::params![project_uuid, warehouse_type, encrypted_credentials, now],
        )?;

        tx.commit()
    }

    /// Get the encrypted credentials for a project, if both rows exist
    pub async fn get_warehouse_credentials(
        &self,
        project_uuid: &str,
    ) -> SqliteResult<Option<StoredCredentials>> {
        let db_conn = self.conn.lock().await;
        let mut stmt = db_conn.prepare(
            r#"
            SELECT p.project_uuid, p.organization_uuid, wc.warehouse_type, wc.encrypted_credentials
            FROM projects p
            INNER JOIN warehouse_credentials wc ON wc.project_uuid = p.project_uuid
            WHERE p.project_uuid = ?1
            "#,
        )?;

        stmt.query_row(rusqlite::params![project_uuid], |row| {
            Ok(StoredCredentials {
                project_uuid: row.get(0)?,
                organization_uuid: row.get(1)?,
                warehouse_type: row.get(2)?,
                encrypted_credentials: row.get(3)?,
            })
        })
        .optional()
    }

    /// Create or update an organization attribute, returning its uuid
    pub async fn save_user_attribute(
        &self,
        organization_uuid: &str,
        name: &str,
        attribute_default: Option<&str>,
    ) -> SqliteResult<String> {
        let db_conn = self.conn.lock().await;
        let candidate_uuid = uuid::Uuid::new_v4().to_string();

        db_conn.execute(
            r#"
            INSERT INTO user_attributes (user_attribute_uuid, organization_uuid, name, attribute_default)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(organization_uuid, name) DO UPDATE SET attribute_default = excluded.attribute_default
            "#,
            rusqlite::params![candidate_uuid, organization_uuid, name, attribute_default],
        )?;

        db_conn.query_row(
            "SELECT user_attribute_uuid FROM user_attributes WHERE organization_uuid = ?1 AND name = ?2",
            rusqlite::params![organization_uuid, name],
            |row| row.get(0),
        )
    }

    /// Set one user's value for an attribute
    pub async fn set_user_attribute_value(
        &self,
        user_uuid: &str,
        user_attribute_uuid: &str,
        value: &str,
    ) -> SqliteResult<()> {
        let db_conn = self.conn.lock().await;
        db_conn.execute(
            r#"
            INSERT OR REPLACE INTO organization_member_user_attributes (user_uuid, user_attribute_uuid, value)
            VALUES (?1, ?2, ?3)
            "#,
            rusqlite::params![user_uuid, user_attribute_uuid, value],
        )?;
        Ok(())
    }

    /// Every attribute of the organization with its default and this user's value
    pub async fn get_user_attribute_rows(
        &self,
        organization_uuid: &str,
        user_uuid: &str,
    ) -> SqliteResult<Vec<UserAttributeRow>> {
        let db_conn = self.conn.lock().await;
        let mut stmt = db_conn.prepare(
            r#"
            SELECT ua.name, ua.attribute_default, omua.value
            FROM user_attributes ua
            LEFT JOIN organization_member_user_attributes omua
                ON omua.user_attribute_uuid = ua.user_attribute_uuid AND omua.user_uuid = ?2
            WHERE ua.organization_uuid = ?1
            ORDER BY ua.name
            "#,
        )?;

        let rows = stmt.query_map(rusqlite::params![organization_uuid, user_uuid], |row| {
            Ok(UserAttributeRow {
                name: row.get(0)?,
                attribute_default: row.get(1)?,
                user_value: row.get(2)?,
            })
        })?;

        rows.collect()
    }
}
