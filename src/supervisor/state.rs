//! Process lifecycle states, launch configuration, and supervisor events.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Default time allowed for a spawned process to become ready.
pub const DEFAULT_STARTUP_TIMEOUT: Duration = Duration::from_secs(30);

/// Default settle window for [`Readiness::Alive`].
pub const DEFAULT_SETTLE: Duration = Duration::from_millis(500);

/// Lifecycle state of the supervised process.
///
/// Stopped → Starting → Running → Stopping → Stopped, with Error reachable
/// from Starting or Running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessState {
    Stopped,
    Starting,
    Running,
    Stopping,
    Error,
}

impl ProcessState {
    /// Check if a transition from `self` to `target` is valid.
    pub fn can_transition_to(&self, target: ProcessState) -> bool {
        use ProcessState::*;
        matches!(
            (self, target),
            (Stopped, Starting)
                | (Starting, Running)
                | (Starting, Error)
                | (Starting, Stopping)
                | (Running, Stopping)
                | (Running, Error)
                | (Stopping, Stopped)
                | (Error, Starting)
                | (Error, Stopping)
                | (Error, Stopped)
        )
    }

    /// Whether a process slot is occupied or being set up.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Starting | Self::Running | Self::Stopping)
    }
}

impl Default for ProcessState {
    fn default() -> Self {
        Self::Stopped
    }
}

impl std::fmt::Display for ProcessState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Error => "error",
        };
        write!(f, "{s}")
    }
}

/// How the supervisor confirms that a freshly spawned process is live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
    /// The process is still running after the settle window.
    Alive { settle: Duration },
    /// A stdout or stderr line contains the given text.
    OutputContains(String),
    /// An HTTP GET against the URL returns a success status.
    HttpOk { url: String },
}

impl Default for Readiness {
    fn default() -> Self {
        Self::Alive {
            settle: DEFAULT_SETTLE,
        }
    }
}

/// Launch configuration for the supervised process.
///
/// Retained by the supervisor after a start attempt so `restart()` can
/// reuse it.
#[derive(Clone)]
pub struct ProcessConfig {
    pub executable_path: PathBuf,
    pub args: Vec<String>,
    pub work_dir: Option<PathBuf>,
    /// Extra environment variables. Values are never printed.
    pub env: BTreeMap<String, String>,
    /// Upper bound on the wait for readiness.
    pub timeout: Duration,
    /// Create `work_dir` if it does not exist.
    pub create_work_dir: bool,
    pub readiness: Readiness,
}

impl ProcessConfig {
    pub fn new(executable_path: impl Into<PathBuf>) -> Self {
        Self {
            executable_path: executable_path.into(),
            args: Vec::new(),
            work_dir: None,
            env: BTreeMap::new(),
            timeout: DEFAULT_STARTUP_TIMEOUT,
            create_work_dir: false,
            readiness: Readiness::default(),
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_work_dir(mut self, dir: impl Into<PathBuf>, create: bool) -> Self {
        self.work_dir = Some(dir.into());
        self.create_work_dir = create;
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_readiness(mut self, readiness: Readiness) -> Self {
        self.readiness = readiness;
        self
    }
}

impl std::fmt::Debug for ProcessConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessConfig")
            .field("executable_path", &self.executable_path)
            .field("args", &self.args)
            .field("work_dir", &self.work_dir)
            .field("env_keys", &self.env.keys().collect::<Vec<_>>())
            .field("timeout", &self.timeout)
            .field("create_work_dir", &self.create_work_dir)
            .field("readiness", &self.readiness)
            .finish()
    }
}

/// How a process exited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitInfo {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl ExitInfo {
    pub(crate) fn from_status(status: &std::process::ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal()
        };
        #[cfg(not(unix))]
        let signal = None;

        Self {
            code: status.code(),
            signal,
        }
    }
}

/// Events broadcast by the supervisor.
#[derive(Debug, Clone, PartialEq)]
pub enum SupervisorEvent {
    StatusChanged {
        old: ProcessState,
        new: ProcessState,
    },
    Stdout(String),
    Stderr(String),
    ProcessExit {
        code: Option<i32>,
        signal: Option<i32>,
    },
    MaxRestartsReached,
}

/// Read-only view of the supervisor.
#[derive(Debug, Clone)]
pub struct ProcessSnapshot {
    pub state: ProcessState,
    pub pid: Option<u32>,
    pub started_at: Option<DateTime<Utc>>,
    pub uptime: Option<Duration>,
    pub restart_attempts: u32,
    pub auto_restart: bool,
    pub config: Option<ProcessConfig>,
    pub last_exit: Option<ExitInfo>,
}
