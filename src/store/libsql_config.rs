//! libSQL-backed [`ConfigurationStore`].

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use libsql::{Connection, Database as LibSqlDatabase, params};
use secrecy::ExposeSecret;
use tracing::{debug, info};

use super::{KEY_CREDENTIAL, KEY_SERVICE_ADDRESS, KEY_WORK_DIR};
use crate::collaborators::{ConfigurationStore, Credential};
use crate::error::StoreError;
use crate::store::migrations;

/// Settings in a `settings(key, value, updated_at)` table.
///
/// Values are stored as JSON text.
pub struct LibSqlConfigStore {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlConfigStore {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                StoreError::Connection(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| StoreError::Connection(format!("Failed to open libSQL database: {e}")))?;

        let store = Self::from_database(db).await?;
        info!(path = %path.display(), "Settings database opened");
        Ok(store)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, StoreError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                StoreError::Connection(format!("Failed to create in-memory database: {e}"))
            })?;
        Self::from_database(db).await
    }

    async fn from_database(db: LibSqlDatabase) -> Result<Self, StoreError> {
        let conn = db
            .connect()
            .map_err(|e| StoreError::Connection(format!("Failed to create connection: {e}")))?;
        migrations::run_migrations(&conn).await?;
        Ok(Self {
            db: Arc::new(db),
            conn,
        })
    }

    async fn get_setting(&self, key: &str) -> Result<Option<serde_json::Value>, StoreError> {
        let mut rows = self
            .conn
            .query("SELECT value FROM settings WHERE key = ?1", params![key])
            .await
            .map_err(|e| StoreError::Query(format!("get_setting: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let value_str: String = row
                    .get(0)
                    .map_err(|e| StoreError::Query(format!("get_setting: {e}")))?;
                let value = serde_json::from_str(&value_str)
                    .map_err(|e| StoreError::Serialization(format!("{key}: {e}")))?;
                Ok(Some(value))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(StoreError::Query(format!("get_setting: {e}"))),
        }
    }

    async fn set_setting(&self, key: &str, value: &serde_json::Value) -> Result<(), StoreError> {
        let now = Utc::now().to_rfc3339();
        let value_str =
            serde_json::to_string(value).map_err(|e| StoreError::Serialization(e.to_string()))?;

        self.conn
            .execute(
                "INSERT INTO settings (key, value, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT (key) DO UPDATE SET value = ?2, updated_at = ?3",
                params![key, value_str, now],
            )
            .await
            .map_err(|e| StoreError::Query(format!("set_setting: {e}")))?;

        debug!(key, "Setting saved");
        Ok(())
    }

    async fn get_string(&self, key: &str) -> Result<Option<String>, StoreError> {
        match self.get_setting(key).await? {
            Some(serde_json::Value::String(s)) => Ok(Some(s)),
            Some(serde_json::Value::Null) | None => Ok(None),
            Some(other) => Err(StoreError::Serialization(format!(
                "{key}: expected a string, got {other}"
            ))),
        }
    }
}

#[async_trait]
impl ConfigurationStore for LibSqlConfigStore {
    async fn credential(&self) -> Result<Option<Credential>, StoreError> {
        Ok(self.get_string(KEY_CREDENTIAL).await?.map(Credential::new))
    }

    async fn set_credential(&self, credential: &Credential) -> Result<(), StoreError> {
        let value = serde_json::Value::String(credential.secret().expose_secret().to_string());
        self.set_setting(KEY_CREDENTIAL, &value).await
    }

    async fn work_dir(&self) -> Result<Option<PathBuf>, StoreError> {
        Ok(self.get_string(KEY_WORK_DIR).await?.map(PathBuf::from))
    }

    async fn set_work_dir(&self, path: &Path) -> Result<(), StoreError> {
        let value = serde_json::Value::String(path.display().to_string());
        self.set_setting(KEY_WORK_DIR, &value).await
    }

    async fn service_address(&self) -> Result<Option<String>, StoreError> {
        self.get_string(KEY_SERVICE_ADDRESS).await
    }

    async fn set_service_address(&self, address: &str) -> Result<(), StoreError> {
        self.set_setting(KEY_SERVICE_ADDRESS, &serde_json::Value::String(address.to_string()))
            .await
    }
}
