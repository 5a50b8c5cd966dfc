//! In-memory [`ConfigurationStore`] for ephemeral runs and tests.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use secrecy::ExposeSecret;
use tokio::sync::RwLock;

use super::{KEY_CREDENTIAL, KEY_SERVICE_ADDRESS, KEY_WORK_DIR};
use crate::collaborators::{ConfigurationStore, Credential};
use crate::error::StoreError;

#[derive(Debug, Default)]
pub struct MemoryConfigStore {
    values: RwLock<HashMap<&'static str, String>>,
}

impl MemoryConfigStore {
    pub fn new() -> Self {
        Self::default()
    }

    async fn get(&self, key: &'static str) -> Option<String> {
        self.values.read().await.get(key).cloned()
    }

    async fn set(&self, key: &'static str, value: String) {
        self.values.write().await.insert(key, value);
    }
}

#[async_trait]
impl ConfigurationStore for MemoryConfigStore {
    async fn credential(&self) -> Result<Option<Credential>, StoreError> {
        Ok(self.get(KEY_CREDENTIAL).await.map(Credential::new))
    }

    async fn set_credential(&self, credential: &Credential) -> Result<(), StoreError> {
        self.set(KEY_CREDENTIAL, credential.secret().expose_secret().to_string())
            .await;
        Ok(())
    }

    async fn work_dir(&self) -> Result<Option<PathBuf>, StoreError> {
        Ok(self.get(KEY_WORK_DIR).await.map(PathBuf::from))
    }

    async fn set_work_dir(&self, path: &Path) -> Result<(), StoreError> {
        self.set(KEY_WORK_DIR, path.display().to_string()).await;
        Ok(())
    }

    async fn service_address(&self) -> Result<Option<String>, StoreError> {
        Ok(self.get(KEY_SERVICE_ADDRESS).await)
    }

    async fn set_service_address(&self, address: &str) -> Result<(), StoreError> {
        self.set(KEY_SERVICE_ADDRESS, address.to_string()).await;
        Ok(())
    }
}
