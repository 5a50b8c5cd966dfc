//! Wiring of the production collaborators into one application.

use std::sync::Arc;

use tracing::info;

use crate::collaborators::{HelperCredentialService, HelperDecryptor, HelperTool, ProcfsDetector};
use crate::config::AppConfig;
use crate::error::Result;
use crate::onboarding::{InitOrchestrator, ServiceDependencies};
use crate::store::LibSqlConfigStore;
use crate::supervisor::ProcessSupervisor;

/// The assembled components of a vault-pilot instance.
pub struct App {
    pub orchestrator: InitOrchestrator,
    pub supervisor: ProcessSupervisor,
    pub detector: Arc<ProcfsDetector>,
}

impl App {
    /// Open the settings database and wire the procfs detector, the helper
    /// adapters and a supervisor with automatic restarts enabled.
    pub async fn from_config(config: &AppConfig) -> Result<Self> {
        let store = LibSqlConfigStore::new_local(&config.db_path).await?;

        let helper = HelperTool::new(&config.helper);
        let detector = Arc::new(ProcfsDetector::new(config.detector.clone()));
        let supervisor = ProcessSupervisor::new(config.supervisor.clone());
        supervisor.enable_auto_restart(true).await;

        let deps = ServiceDependencies {
            detector: detector.clone(),
            credentials: Arc::new(HelperCredentialService::new(helper.clone())),
            decryptor: Arc::new(HelperDecryptor::new(helper)),
            store: Arc::new(store),
            supervisor: supervisor.clone(),
        };
        let orchestrator = InitOrchestrator::new(config.orchestrator.clone(), deps);

        info!(db = %config.db_path.display(), "Application assembled");
        Ok(Self {
            orchestrator,
            supervisor,
            detector,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;
    use crate::config::{
        DetectorConfig, HelperConfig, OrchestratorConfig, ServiceConfig, SupervisorConfig,
    };
    use crate::error::{Error, StoreError};
    use crate::supervisor::ProcessState;

    fn config(db_path: PathBuf) -> AppConfig {
        AppConfig {
            db_path,
            log_dir: None,
            supervisor: SupervisorConfig::default(),
            helper: HelperConfig {
                executable_path: PathBuf::from("/no/such/helper"),
                timeout: std::time::Duration::from_secs(1),
            },
            detector: DetectorConfig {
                app_name: "Demo".into(),
                process_names: vec!["demo".into()],
                data_dirs: Vec::new(),
            },
            orchestrator: OrchestratorConfig::new(ServiceConfig::new("/no/such/service")),
        }
    }

    #[tokio::test]
    async fn builds_with_a_fresh_database() {
        let tmp = tempfile::tempdir().unwrap();
        let db_path = tmp.path().join("nested/settings.db");

        let app = App::from_config(&config(db_path.clone())).await.unwrap();

        assert!(db_path.exists());
        assert!(app.supervisor.process_info().await.auto_restart);
        assert_eq!(app.supervisor.status().await, ProcessState::Stopped);
        assert!(!app.orchestrator.is_running());
    }

    #[tokio::test]
    async fn unopenable_database_is_a_store_error() {
        let tmp = tempfile::tempdir().unwrap();
        // A regular file where the parent directory should be.
        let blocker = tmp.path().join("blocker");
        std::fs::write(&blocker, b"x").unwrap();

        let err = App::from_config(&config(blocker.join("settings.db")))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, Error::Store(StoreError::Connection(_))), "{err}");
    }
}
