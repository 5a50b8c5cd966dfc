//! Narrow interfaces to everything the orchestrator does not own.
//!
//! Detection of the external application, credential extraction, data
//! store decryption and settings persistence are all reached through the
//! traits here, so the orchestrator can be driven by real adapters or by
//! test fakes.

pub mod helper;
pub mod procfs;

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::{CredentialError, DecryptionError, DetectionError, StoreError};

pub use helper::{HelperCredentialService, HelperDecryptor, HelperTool};
pub use procfs::ProcfsDetector;

/// A running instance of the external application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppProcess {
    pub pid: u32,
    pub name: String,
    pub executable_path: PathBuf,
}

/// Where the external application keeps its encrypted data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataInfo {
    pub data_dir: PathBuf,
    pub account: Option<String>,
}

/// Decryption key for the external application's data store.
#[derive(Clone)]
pub struct Credential(SecretString);

impl Credential {
    pub fn new(value: impl Into<String>) -> Self {
        Self(SecretString::from(value.into()))
    }

    pub fn secret(&self) -> &SecretString {
        &self.0
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Credential([REDACTED])")
    }
}

/// Sink for intermediate progress (0..=100) of a long-running collaborator.
#[derive(Debug, Clone)]
pub struct ProgressReporter {
    tx: Option<mpsc::UnboundedSender<u8>>,
}

impl ProgressReporter {
    pub fn new(tx: mpsc::UnboundedSender<u8>) -> Self {
        Self { tx: Some(tx) }
    }

    /// A reporter that drops every report.
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    /// Report progress; values above 100 are clamped.
    pub fn report(&self, percent: u8) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(percent.min(100));
        }
    }
}

/// Locates the external application and its data.
#[async_trait]
pub trait ExternalAppDetector: Send + Sync {
    async fn is_running(&self) -> bool;

    async fn detect_processes(&self) -> Result<Vec<AppProcess>, DetectionError>;

    async fn detect_data_directory(&self) -> Result<DataInfo, DetectionError>;
}

/// Extracts the data store credential from the running application.
#[async_trait]
pub trait CredentialService: Send + Sync {
    async fn obtain_credential(&self, executable_path: &Path)
    -> Result<Credential, CredentialError>;
}

/// Decrypts the application's data store into a working directory.
#[async_trait]
pub trait DataStoreDecryptor: Send + Sync {
    async fn decrypt(
        &self,
        source_dir: &Path,
        work_dir: &Path,
        credential: &Credential,
        executable_path: &Path,
        progress: ProgressReporter,
    ) -> Result<(), DecryptionError>;

    /// Whether `work_dir` already holds decrypted data.
    async fn check_decrypted(&self, work_dir: &Path) -> bool;
}

/// Persistent settings shared with the rest of the product.
#[async_trait]
pub trait ConfigurationStore: Send + Sync {
    async fn credential(&self) -> Result<Option<Credential>, StoreError>;

    async fn set_credential(&self, credential: &Credential) -> Result<(), StoreError>;

    async fn work_dir(&self) -> Result<Option<PathBuf>, StoreError>;

    async fn set_work_dir(&self, path: &Path) -> Result<(), StoreError>;

    async fn service_address(&self) -> Result<Option<String>, StoreError>;

    async fn set_service_address(&self, address: &str) -> Result<(), StoreError>;
}

#[cfg(test)]
mod tests {
    use secrecy::ExposeSecret;

    use super::*;

    #[test]
    fn credential_debug_is_redacted() {
        let credential = Credential::new("c0ffee");
        assert_eq!(format!("{credential:?}"), "Credential([REDACTED])");
        assert_eq!(credential.secret().expose_secret(), "c0ffee");
    }

    #[tokio::test]
    async fn progress_reports_are_clamped() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let reporter = ProgressReporter::new(tx);
        reporter.report(40);
        reporter.report(250);
        assert_eq!(rx.recv().await, Some(40));
        assert_eq!(rx.recv().await, Some(100));
    }

    #[test]
    fn disabled_reporter_is_silent() {
        ProgressReporter::disabled().report(10);
    }
}
