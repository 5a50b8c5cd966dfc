//! Configuration types.

use std::path::{Path, PathBuf};
use std::time::Duration;

use secrecy::ExposeSecret;

use crate::collaborators::Credential;
use crate::error::ConfigError;
use crate::onboarding::StepWeights;
use crate::supervisor::state::DEFAULT_SETTLE;
use crate::supervisor::{ProcessConfig, Readiness};

/// Supervisor timing and restart policy.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Time between the graceful termination signal and a forced kill.
    pub grace_period: Duration,
    /// Delay before an automatic restart.
    pub restart_backoff: Duration,
    /// Consecutive automatic restarts before giving up.
    pub max_restart_attempts: u32,
    /// Upper bound on the stop phase of `restart()`.
    pub restart_stop_timeout: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            grace_period: Duration::from_secs(5),
            restart_backoff: Duration::from_secs(2),
            max_restart_attempts: 3,
            restart_stop_timeout: Duration::from_secs(15),
        }
    }
}

impl SupervisorConfig {
    /// Build config from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            grace_period: env_millis("VAULT_PILOT_STOP_GRACE_MS", defaults.grace_period),
            restart_backoff: env_millis("VAULT_PILOT_RESTART_BACKOFF_MS", defaults.restart_backoff),
            max_restart_attempts: std::env::var("VAULT_PILOT_MAX_RESTARTS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.max_restart_attempts),
            restart_stop_timeout: defaults.restart_stop_timeout,
        }
    }
}

/// How to launch the background data service.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub executable_path: PathBuf,
    /// Placed before the generated arguments, e.g. a script for an interpreter.
    pub base_args: Vec<String>,
    /// `host:port` the service listens on.
    pub listen_addr: String,
    /// Appended after the generated arguments.
    pub extra_args: Vec<String>,
    /// Environment variable that carries the credential.
    pub credential_env: String,
    pub startup_timeout: Duration,
    /// When set, readiness is an HTTP probe against this URL.
    pub ready_url: Option<String>,
    /// Without `ready_url`, the service counts as ready once it has stayed
    /// up this long.
    pub settle: Duration,
}

impl ServiceConfig {
    pub fn new(executable_path: impl Into<PathBuf>) -> Self {
        Self {
            executable_path: executable_path.into(),
            base_args: Vec::new(),
            listen_addr: "127.0.0.1:5030".to_string(),
            extra_args: Vec::new(),
            credential_env: "VAULT_DATA_KEY".to_string(),
            startup_timeout: Duration::from_secs(30),
            ready_url: None,
            settle: DEFAULT_SETTLE,
        }
    }

    /// Base address persisted for other components to reach the service.
    pub fn base_url(&self) -> String {
        format!("http://{}", self.listen_addr)
    }

    /// Launch configuration for serving the decrypted data in `work_dir`.
    pub fn process_config(&self, work_dir: &Path, credential: &Credential) -> ProcessConfig {
        let mut args = self.base_args.clone();
        args.extend([
            "server".to_string(),
            "--addr".to_string(),
            self.listen_addr.clone(),
            "--work-dir".to_string(),
            work_dir.display().to_string(),
        ]);
        args.extend(self.extra_args.iter().cloned());

        let readiness = match &self.ready_url {
            Some(url) => Readiness::HttpOk { url: url.clone() },
            None => Readiness::Alive {
                settle: self.settle,
            },
        };

        ProcessConfig::new(&self.executable_path)
            .with_args(args)
            .with_work_dir(work_dir, false)
            .with_env(
                self.credential_env.clone(),
                credential.secret().expose_secret().to_string(),
            )
            .with_timeout(self.startup_timeout)
            .with_readiness(readiness)
    }
}

/// The external helper executable that extracts credentials and decrypts.
#[derive(Debug, Clone)]
pub struct HelperConfig {
    pub executable_path: PathBuf,
    /// Per-invocation timeout.
    pub timeout: Duration,
}

/// Where to look for the external application.
#[derive(Debug, Clone)]
pub struct DetectorConfig {
    pub app_name: String,
    /// Process names (as in `/proc/<pid>/comm`), matched case-insensitively.
    pub process_names: Vec<String>,
    /// Candidate data directories, first existing one wins.
    pub data_dirs: Vec<PathBuf>,
}

/// Orchestrator configuration.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Display name of the external application, used in user prompts.
    pub app_name: String,
    /// Used when neither the caller nor the store supplies a work directory.
    pub default_work_dir: Option<PathBuf>,
    pub detect_timeout: Duration,
    pub credential_timeout: Duration,
    pub decrypt_timeout: Duration,
    pub weights: StepWeights,
    pub service: ServiceConfig,
}

impl OrchestratorConfig {
    pub fn new(service: ServiceConfig) -> Self {
        Self {
            app_name: "the external application".to_string(),
            default_work_dir: None,
            detect_timeout: Duration::from_secs(10),
            credential_timeout: Duration::from_secs(60),
            decrypt_timeout: Duration::from_secs(600),
            weights: StepWeights::default(),
            service,
        }
    }
}

/// Everything the binary needs, loaded from the environment.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub db_path: PathBuf,
    pub log_dir: Option<PathBuf>,
    pub supervisor: SupervisorConfig,
    pub helper: HelperConfig,
    pub detector: DetectorConfig,
    pub orchestrator: OrchestratorConfig,
}

impl AppConfig {
    /// Build config from environment variables.
    ///
    /// `VAULT_PILOT_SERVICE_BIN` and `VAULT_PILOT_HELPER_BIN` are required.
    pub fn from_env() -> Result<Self, ConfigError> {
        let home = std::env::var("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("."));
        let base_dir = home.join(".vault-pilot");

        let service_bin = required_env("VAULT_PILOT_SERVICE_BIN")?;
        let helper_bin = required_env("VAULT_PILOT_HELPER_BIN")?;

        let app_name =
            std::env::var("VAULT_PILOT_APP_NAME").unwrap_or_else(|_| "WeChat".to_string());

        let mut service = ServiceConfig::new(service_bin);
        if let Ok(addr) = std::env::var("VAULT_PILOT_SERVICE_ADDR") {
            if !addr.contains(':') {
                return Err(ConfigError::InvalidValue {
                    key: "VAULT_PILOT_SERVICE_ADDR".to_string(),
                    message: format!("expected host:port, got {addr:?}"),
                });
            }
            service.listen_addr = addr;
        }
        service.extra_args = list_env("VAULT_PILOT_SERVICE_ARGS", ' ');
        if let Ok(name) = std::env::var("VAULT_PILOT_CREDENTIAL_ENV") {
            service.credential_env = name;
        }
        service.startup_timeout = env_millis("VAULT_PILOT_STARTUP_TIMEOUT_MS", service.startup_timeout);
        service.ready_url = std::env::var("VAULT_PILOT_READY_URL").ok();

        let helper = HelperConfig {
            executable_path: PathBuf::from(helper_bin),
            timeout: env_millis("VAULT_PILOT_HELPER_TIMEOUT_MS", Duration::from_secs(600)),
        };

        let mut process_names = list_env("VAULT_PILOT_PROCESS_NAMES", ',');
        if process_names.is_empty() {
            process_names.push(app_name.clone());
        }
        let detector = DetectorConfig {
            app_name: app_name.clone(),
            process_names,
            data_dirs: list_env("VAULT_PILOT_DATA_DIRS", ',')
                .into_iter()
                .map(PathBuf::from)
                .collect(),
        };

        let mut orchestrator = OrchestratorConfig::new(service);
        orchestrator.app_name = app_name;
        orchestrator.default_work_dir = std::env::var("VAULT_PILOT_WORK_DIR")
            .ok()
            .map(PathBuf::from);
        orchestrator.credential_timeout =
            env_millis("VAULT_PILOT_CREDENTIAL_TIMEOUT_MS", orchestrator.credential_timeout);
        orchestrator.decrypt_timeout =
            env_millis("VAULT_PILOT_DECRYPT_TIMEOUT_MS", orchestrator.decrypt_timeout);

        let db_path = std::env::var("VAULT_PILOT_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| base_dir.join("settings.db"));

        Ok(Self {
            db_path,
            log_dir: std::env::var("VAULT_PILOT_LOG_DIR").ok().map(PathBuf::from),
            supervisor: SupervisorConfig::from_env(),
            helper,
            detector,
            orchestrator,
        })
    }
}

fn required_env(key: &str) -> Result<String, ConfigError> {
    std::env::var(key).map_err(|_| ConfigError::MissingEnvVar(key.to_string()))
}

fn env_millis(key: &str, default: Duration) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .map(Duration::from_millis)
        .unwrap_or(default)
}

fn list_env(key: &str, separator: char) -> Vec<String> {
    std::env::var(key)
        .unwrap_or_default()
        .split(separator)
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}
