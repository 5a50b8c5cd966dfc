//! Error types for vault-pilot.

use std::path::PathBuf;
use std::time::Duration;

use crate::supervisor::ProcessState;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Detection error: {0}")]
    Detection(#[from] DetectionError),

    #[error("Credential error: {0}")]
    Credential(#[from] CredentialError),

    #[error("Decryption error: {0}")]
    Decryption(#[from] DecryptionError),

    #[error("Process error: {0}")]
    Process(#[from] ProcessError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Configuration store errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// External application detection errors.
#[derive(Debug, thiserror::Error)]
pub enum DetectionError {
    #[error("No running process of {app} was found")]
    ProcessNotFound { app: String },

    #[error("Data directory not found: {0}")]
    DataDirNotFound(String),

    #[error("Detection is not supported on this platform: {0}")]
    Unsupported(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Credential extraction errors.
#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    #[error("Credential extraction denied: {0}")]
    Denied(String),

    #[error("Malformed credential: {0}")]
    Malformed(String),

    #[error("Credential helper failed: {0}")]
    Helper(#[from] HelperError),
}

/// Data store decryption errors.
#[derive(Debug, thiserror::Error)]
pub enum DecryptionError {
    #[error("Credential rejected by the data store: {0}")]
    BadCredential(String),

    #[error("Source data is corrupt: {0}")]
    CorruptSource(String),

    #[error("No decrypted data found in {}", .0.display())]
    NotDecrypted(PathBuf),

    #[error("Decryption helper failed: {0}")]
    Helper(#[from] HelperError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from running the external helper executable.
#[derive(Debug, thiserror::Error)]
pub enum HelperError {
    #[error("Helper executable not found: {}", .0.display())]
    NotFound(PathBuf),

    #[error("Failed to spawn helper: {0}")]
    Spawn(std::io::Error),

    #[error("Helper timed out after {0:?}")]
    Timeout(Duration),

    #[error("Helper exited with code {code}: {stderr}")]
    Failed { code: i32, stderr: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Process supervisor errors.
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("A process is already {state}")]
    AlreadyActive { state: ProcessState },

    #[error("Cannot {operation} while the process is {state}")]
    InvalidState {
        operation: &'static str,
        state: ProcessState,
    },

    #[error("Executable not found: {}", .0.display())]
    ExecutableNotFound(PathBuf),

    #[error("Working directory does not exist: {}", .0.display())]
    WorkDirMissing(PathBuf),

    #[error("Failed to spawn process: {0}")]
    SpawnFailed(String),

    #[error("Process did not become ready within {0:?}")]
    StartupTimeout(Duration),

    #[error("Process exited during startup (code {code:?}, signal {signal:?})")]
    ExitedDuringStartup {
        code: Option<i32>,
        signal: Option<i32>,
    },

    #[error("Start was cancelled by a stop request")]
    StartCancelled,

    #[error("No previous process configuration to restart")]
    NoPreviousConfig,

    #[error("Failed to stop process: {0}")]
    StopFailed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failure classes surfaced at the step boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    DetectionFailure,
    CredentialFailure,
    DecryptionFailure,
    ProcessStartFailure,
    StorageFailure,
    Timeout,
    /// A pause, not a failure.
    UserInputRequired,
}

/// Error produced by a single onboarding step.
///
/// Every collaborator error is converted into one of these at the step
/// boundary; the orchestrator never propagates them further.
#[derive(Debug, thiserror::Error)]
pub enum StepError {
    #[error(transparent)]
    Detection(#[from] DetectionError),

    #[error(transparent)]
    Credential(#[from] CredentialError),

    #[error(transparent)]
    Decryption(#[from] DecryptionError),

    #[error(transparent)]
    ProcessStart(#[from] ProcessError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Cannot use working directory {}: {source}", path.display())]
    WorkDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Missing {0}; an earlier step must run first")]
    MissingInput(&'static str),

    #[error("{operation} timed out after {timeout:?}")]
    Timeout {
        operation: &'static str,
        timeout: Duration,
    },

    #[error("Waiting for user: {action}")]
    UserInputRequired { action: String },
}

impl StepError {
    /// Classify this error into the step failure taxonomy.
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::Detection(_) => FailureKind::DetectionFailure,
            Self::Credential(CredentialError::Helper(HelperError::Timeout(_)))
            | Self::Decryption(DecryptionError::Helper(HelperError::Timeout(_)))
            | Self::ProcessStart(ProcessError::StartupTimeout(_))
            | Self::Timeout { .. } => FailureKind::Timeout,
            Self::Credential(_) => FailureKind::CredentialFailure,
            Self::Decryption(_) => FailureKind::DecryptionFailure,
            Self::ProcessStart(_) => FailureKind::ProcessStartFailure,
            Self::Store(_) | Self::WorkDir { .. } | Self::MissingInput(_) => {
                FailureKind::StorageFailure
            }
            Self::UserInputRequired { .. } => FailureKind::UserInputRequired,
        }
    }

    /// Whether this outcome pauses the run instead of failing it.
    pub fn is_pause(&self) -> bool {
        matches!(self, Self::UserInputRequired { .. })
    }
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, Error>;
