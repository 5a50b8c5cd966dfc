//! Process supervisor: spawns, watches, stops and restarts one process.

use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::io::{AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{RwLock, broadcast, oneshot, watch};
use tracing::{debug, info, warn};

use super::readiness::wait_until_ready;
use super::state::{
    ExitInfo, ProcessConfig, ProcessSnapshot, ProcessState, SupervisorEvent,
};
use crate::config::SupervisorConfig;
use crate::error::ProcessError;
use crate::output::{LossyLines, discard};

/// Broadcast capacity; process output can be chatty.
const EVENT_CAPACITY: usize = 1024;

/// How long to wait for the exit after a forced kill.
const KILL_WAIT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StartOrigin {
    User,
    AutoRestart,
}

/// A live spawned process. The `Child` itself is owned by its monitor task.
struct ProcessHandle {
    generation: u64,
    pid: Option<u32>,
    started_at: DateTime<Utc>,
    started: Instant,
    stop_requested: bool,
    kill_tx: Option<oneshot::Sender<()>>,
    exit_rx: watch::Receiver<Option<ExitInfo>>,
}

#[derive(Default)]
struct Slot {
    state: ProcessState,
    handle: Option<ProcessHandle>,
    config: Option<ProcessConfig>,
    restart_attempts: u32,
    auto_restart: bool,
    restarts_exhausted: bool,
    generation: u64,
    last_exit: Option<ExitInfo>,
}

struct Inner {
    policy: SupervisorConfig,
    slot: RwLock<Slot>,
    events: broadcast::Sender<SupervisorEvent>,
}

/// Lifecycle manager for the single background service process.
///
/// Cheap to clone; all clones share the same process slot.
#[derive(Clone)]
pub struct ProcessSupervisor {
    inner: Arc<Inner>,
}

impl ProcessSupervisor {
    pub fn new(policy: SupervisorConfig) -> Self {
        let (events, _rx) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                policy,
                slot: RwLock::new(Slot::default()),
                events,
            }),
        }
    }

    /// Subscribe to status, output, exit and restart-budget events.
    pub fn subscribe(&self) -> broadcast::Receiver<SupervisorEvent> {
        self.inner.events.subscribe()
    }

    /// Spawn a process and wait until it is ready.
    ///
    /// Rejected while another process is starting, running or stopping.
    /// Resets the automatic restart budget.
    pub async fn start(&self, config: ProcessConfig) -> Result<(), ProcessError> {
        self.inner.start(config, StartOrigin::User).await
    }

    /// Stop the process. Succeeds immediately when nothing is running.
    ///
    /// Without `force` the process gets a termination signal and the
    /// configured grace period before it is killed.
    pub async fn stop(&self, force: bool) -> Result<(), ProcessError> {
        self.inner.stop(force).await
    }

    /// Stop (if needed) and start again with the last configuration.
    pub async fn restart(&self) -> Result<(), ProcessError> {
        self.inner.restart().await
    }

    /// Liveness check: the process is running and has not exited.
    pub async fn health_check(&self) -> bool {
        let slot = self.inner.slot.read().await;
        if slot.state != ProcessState::Running {
            return false;
        }
        let Some(handle) = slot.handle.as_ref() else {
            return false;
        };
        if handle.stop_requested || handle.exit_rx.borrow().is_some() {
            return false;
        }
        is_signalable(handle.pid)
    }

    pub async fn status(&self) -> ProcessState {
        self.inner.slot.read().await.state
    }

    pub async fn process_info(&self) -> ProcessSnapshot {
        let slot = self.inner.slot.read().await;
        let handle = slot.handle.as_ref();
        ProcessSnapshot {
            state: slot.state,
            pid: handle.and_then(|h| h.pid),
            started_at: handle.map(|h| h.started_at),
            uptime: handle
                .filter(|_| slot.state == ProcessState::Running)
                .map(|h| h.started.elapsed()),
            restart_attempts: slot.restart_attempts,
            auto_restart: slot.auto_restart,
            config: slot.config.clone(),
            last_exit: slot.last_exit,
        }
    }

    /// Turn automatic restarts after unexpected exits on or off.
    pub async fn enable_auto_restart(&self, enabled: bool) {
        self.inner.slot.write().await.auto_restart = enabled;
        info!(enabled, "Service auto-restart updated");
    }
}

impl Inner {
    async fn start(
        self: &Arc<Self>,
        config: ProcessConfig,
        origin: StartOrigin,
    ) -> Result<(), ProcessError> {
        {
            let mut slot = self.slot.write().await;
            if slot.state.is_active() {
                return Err(ProcessError::AlreadyActive { state: slot.state });
            }
            slot.config = Some(config.clone());
            if origin == StartOrigin::User {
                slot.restart_attempts = 0;
                slot.restarts_exhausted = false;
            }
            self.transition(&mut slot, ProcessState::Starting);
        }

        let launched = self.launch(&config).await;

        let mut slot = self.slot.write().await;
        match launched {
            Ok(generation) if slot.generation == generation && slot.state == ProcessState::Starting => {
                self.transition(&mut slot, ProcessState::Running);
                let pid = slot.handle.as_ref().and_then(|h| h.pid);
                info!(
                    pid = ?pid,
                    executable = %config.executable_path.display(),
                    origin = ?origin,
                    "Service process running"
                );
                Ok(())
            }
            Ok(_) => {
                debug!(state = %slot.state, "Process became ready after a stop request");
                Err(ProcessError::StartCancelled)
            }
            Err(e) => {
                if let Some(handle) = slot.handle.as_mut() {
                    if let Some(kill_tx) = handle.kill_tx.take() {
                        let _ = kill_tx.send(());
                    }
                }
                let e = match slot.state {
                    ProcessState::Starting => {
                        self.transition(&mut slot, ProcessState::Error);
                        e
                    }
                    ProcessState::Stopping if slot.handle.is_none() => {
                        self.transition(&mut slot, ProcessState::Stopped);
                        ProcessError::StartCancelled
                    }
                    ProcessState::Stopping | ProcessState::Stopped => ProcessError::StartCancelled,
                    _ => e,
                };
                warn!(
                    executable = %config.executable_path.display(),
                    error = %e,
                    "Service process failed to start"
                );
                Err(e)
            }
        }
    }

    /// Validate, spawn, and wait for readiness. Returns the handle generation.
    async fn launch(self: &Arc<Self>, config: &ProcessConfig) -> Result<u64, ProcessError> {
        if tokio::fs::metadata(&config.executable_path).await.is_err() {
            return Err(ProcessError::ExecutableNotFound(
                config.executable_path.clone(),
            ));
        }

        if let Some(dir) = &config.work_dir {
            if !tokio::fs::try_exists(dir).await.unwrap_or(false) {
                if config.create_work_dir {
                    tokio::fs::create_dir_all(dir).await?;
                    debug!(dir = %dir.display(), "Created process working directory");
                } else {
                    return Err(ProcessError::WorkDirMissing(dir.clone()));
                }
            }
        }

        let mut command = Command::new(&config.executable_path);
        command
            .args(&config.args)
            .envs(&config.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &config.work_dir {
            command.current_dir(dir);
        }

        // Subscribe before the output readers exist so no early line is missed.
        let readiness_events = self.events.subscribe();
        let (kill_tx, kill_rx) = oneshot::channel();
        let (exit_tx, exit_rx) = watch::channel(None);

        // Spawn and register under one lock so a concurrent stop either
        // cancels the start here or finds the handle.
        let (mut child, pid, generation) = {
            let mut slot = self.slot.write().await;
            if slot.state != ProcessState::Starting {
                return Err(ProcessError::StartCancelled);
            }
            let child = command
                .spawn()
                .map_err(|e| ProcessError::SpawnFailed(e.to_string()))?;
            let pid = child.id();
            slot.generation += 1;
            let generation = slot.generation;
            slot.handle = Some(ProcessHandle {
                generation,
                pid,
                started_at: Utc::now(),
                started: Instant::now(),
                stop_requested: false,
                kill_tx: Some(kill_tx),
                exit_rx: exit_rx.clone(),
            });
            (child, pid, generation)
        };

        if let Some(stdout) = child.stdout.take() {
            spawn_line_reader(stdout, self.events.clone(), SupervisorEvent::Stdout);
        }
        if let Some(stderr) = child.stderr.take() {
            spawn_line_reader(stderr, self.events.clone(), SupervisorEvent::Stderr);
        }

        debug!(pid = ?pid, generation, "Service process spawned");
        tokio::spawn(monitor(
            Arc::clone(self),
            child,
            generation,
            kill_rx,
            exit_tx,
        ));

        let outcome = tokio::time::timeout(config.timeout, async {
            tokio::select! {
                ready = wait_until_ready(&config.readiness, readiness_events) => ready,
                exit = wait_for_exit(exit_rx) => Err(ProcessError::ExitedDuringStartup {
                    code: exit.code,
                    signal: exit.signal,
                }),
            }
        })
        .await;

        match outcome {
            Ok(Ok(())) => Ok(generation),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(ProcessError::StartupTimeout(config.timeout)),
        }
    }

    async fn stop(&self, force: bool) -> Result<(), ProcessError> {
        let (generation, pid, exit_rx, kill_tx, already_stopping) = {
            let mut slot = self.slot.write().await;
            let state = slot.state;
            if state == ProcessState::Stopped {
                debug!("Stop requested but no process is running");
                return Ok(());
            }
            let Some(handle) = slot.handle.as_mut() else {
                match state {
                    ProcessState::Error => {
                        self.transition(&mut slot, ProcessState::Stopped);
                        return Ok(());
                    }
                    ProcessState::Starting => {
                        // Nothing spawned yet: the start sees `Stopping`
                        // and settles to `Stopped` without spawning.
                        let events = self.events.subscribe();
                        self.transition(&mut slot, ProcessState::Stopping);
                        drop(slot);
                        info!("Stop requested before the process was spawned; cancelling start");
                        return self.wait_for_stopped(events).await;
                    }
                    _ => {
                        return Err(ProcessError::InvalidState {
                            operation: "stop",
                            state,
                        });
                    }
                }
            };

            let already_stopping = handle.stop_requested;
            handle.stop_requested = true;
            let kill_tx = if force { handle.kill_tx.take() } else { None };
            let captured = (
                handle.generation,
                handle.pid,
                handle.exit_rx.clone(),
                kill_tx,
                already_stopping,
            );
            if !already_stopping {
                self.transition(&mut slot, ProcessState::Stopping);
            }
            captured
        };

        if let Some(kill_tx) = kill_tx {
            info!(pid = ?pid, "Force-killing service process");
            let _ = kill_tx.send(());
        } else if already_stopping {
            debug!(pid = ?pid, "Stop already in progress; waiting for exit");
            let bound = self.policy.grace_period + KILL_WAIT;
            return match tokio::time::timeout(bound, wait_for_exit(exit_rx)).await {
                Ok(_) => Ok(()),
                Err(_) => Err(ProcessError::StopFailed(format!(
                    "process did not exit within {bound:?}"
                ))),
            };
        } else {
            if send_terminate(pid) {
                info!(pid = ?pid, grace = ?self.policy.grace_period, "Stopping service process");
                let graceful =
                    tokio::time::timeout(self.policy.grace_period, wait_for_exit(exit_rx.clone()))
                        .await;
                if graceful.is_ok() {
                    return Ok(());
                }
                warn!(
                    pid = ?pid,
                    grace = ?self.policy.grace_period,
                    "Service process ignored termination; forcing kill"
                );
            }
            self.send_kill(generation).await;
        }

        match tokio::time::timeout(KILL_WAIT, wait_for_exit(exit_rx)).await {
            Ok(_) => Ok(()),
            Err(_) => Err(ProcessError::StopFailed(format!(
                "process {pid:?} did not exit after kill"
            ))),
        }
    }

    /// Wait until a cancelled start has settled to `Stopped`.
    async fn wait_for_stopped(
        &self,
        mut events: broadcast::Receiver<SupervisorEvent>,
    ) -> Result<(), ProcessError> {
        let settled = tokio::time::timeout(KILL_WAIT, async {
            loop {
                match events.recv().await {
                    Ok(SupervisorEvent::StatusChanged {
                        new: ProcessState::Stopped,
                        ..
                    })
                    | Err(RecvError::Closed) => return,
                    Ok(_) => {}
                    Err(RecvError::Lagged(_)) => {
                        if self.slot.read().await.state == ProcessState::Stopped {
                            return;
                        }
                    }
                }
            }
        })
        .await;
        settled.map_err(|_| {
            ProcessError::StopFailed(format!("cancelled start did not settle within {KILL_WAIT:?}"))
        })
    }

    async fn restart(self: &Arc<Self>) -> Result<(), ProcessError> {
        let (state, config) = {
            let slot = self.slot.read().await;
            (slot.state, slot.config.clone())
        };
        let config = config.ok_or(ProcessError::NoPreviousConfig)?;

        if state != ProcessState::Stopped {
            let bound = self.policy.restart_stop_timeout;
            match tokio::time::timeout(bound, self.stop(false)).await {
                Ok(stopped) => stopped?,
                Err(_) => {
                    return Err(ProcessError::StopFailed(format!(
                        "process did not stop within {bound:?}"
                    )));
                }
            }
        }

        info!(executable = %config.executable_path.display(), "Restarting service process");
        self.start(config, StartOrigin::User).await
    }

    async fn send_kill(&self, generation: u64) {
        let kill_tx = {
            let mut slot = self.slot.write().await;
            slot.handle
                .as_mut()
                .filter(|h| h.generation == generation)
                .and_then(|h| h.kill_tx.take())
        };
        if let Some(kill_tx) = kill_tx {
            let _ = kill_tx.send(());
        }
    }

    /// Record an exit observed by the monitor task of `generation`.
    async fn handle_exit(self: &Arc<Self>, generation: u64, exit: ExitInfo) {
        let mut slot = self.slot.write().await;
        let handle = match slot.handle.take() {
            Some(handle) if handle.generation == generation => handle,
            other => {
                slot.handle = other;
                debug!(generation, "Ignoring exit of a superseded process");
                return;
            }
        };

        slot.last_exit = Some(exit);
        let _ = self.events.send(SupervisorEvent::ProcessExit {
            code: exit.code,
            signal: exit.signal,
        });

        match slot.state {
            ProcessState::Stopping => {
                info!(pid = ?handle.pid, code = ?exit.code, signal = ?exit.signal, "Service process stopped");
                self.transition(&mut slot, ProcessState::Stopped);
            }
            ProcessState::Starting => {
                warn!(pid = ?handle.pid, code = ?exit.code, "Service process exited during startup");
                self.transition(&mut slot, ProcessState::Error);
            }
            ProcessState::Running => {
                warn!(
                    pid = ?handle.pid,
                    code = ?exit.code,
                    signal = ?exit.signal,
                    uptime = ?handle.started.elapsed(),
                    "Service process exited unexpectedly"
                );
                self.transition(&mut slot, ProcessState::Error);
                if slot.auto_restart && !slot.restarts_exhausted {
                    if let Some(attempt) = self.claim_restart_attempt(&mut slot) {
                        self.spawn_auto_restart(attempt);
                    }
                }
            }
            ProcessState::Stopped | ProcessState::Error => {}
        }
    }

    /// Take one attempt from the restart budget, or mark it exhausted.
    fn claim_restart_attempt(&self, slot: &mut Slot) -> Option<u32> {
        if slot.restart_attempts >= self.policy.max_restart_attempts {
            slot.restarts_exhausted = true;
            warn!(
                attempts = slot.restart_attempts,
                "Service restart budget exhausted; automatic restarts disabled"
            );
            let _ = self.events.send(SupervisorEvent::MaxRestartsReached);
            return None;
        }
        slot.restart_attempts += 1;
        Some(slot.restart_attempts)
    }

    fn spawn_auto_restart(self: &Arc<Self>, attempt: u32) {
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            inner.run_auto_restart(attempt).await;
        });
    }

    async fn run_auto_restart(self: Arc<Self>, mut attempt: u32) {
        loop {
            tokio::time::sleep(self.policy.restart_backoff).await;

            let config = {
                let slot = self.slot.read().await;
                if !slot.auto_restart || slot.state != ProcessState::Error {
                    debug!(attempt, state = %slot.state, "Automatic restart no longer needed");
                    return;
                }
                match slot.config.clone() {
                    Some(config) => config,
                    None => return,
                }
            };

            info!(
                attempt,
                max = self.policy.max_restart_attempts,
                "Automatically restarting service process"
            );
            let err = match self.start(config, StartOrigin::AutoRestart).await {
                Ok(()) => return,
                Err(e) => e,
            };
            warn!(attempt, error = %err, "Automatic restart failed");

            let mut slot = self.slot.write().await;
            if !slot.auto_restart || slot.state != ProcessState::Error || slot.restarts_exhausted {
                return;
            }
            match self.claim_restart_attempt(&mut slot) {
                Some(next) => attempt = next,
                None => return,
            }
        }
    }

    fn transition(&self, slot: &mut Slot, to: ProcessState) {
        let from = slot.state;
        if from == to {
            return;
        }
        if !from.can_transition_to(to) {
            warn!(from = %from, to = %to, "Ignoring invalid process state transition");
            return;
        }
        slot.state = to;
        debug!(from = %from, to = %to, "Process state changed");
        let _ = self
            .events
            .send(SupervisorEvent::StatusChanged { old: from, new: to });
    }
}

/// Owns the child: waits for it to exit, killing it on request.
async fn monitor(
    inner: Arc<Inner>,
    mut child: Child,
    generation: u64,
    mut kill_rx: oneshot::Receiver<()>,
    exit_tx: watch::Sender<Option<ExitInfo>>,
) {
    let status = tokio::select! {
        status = child.wait() => status,
        Ok(()) = &mut kill_rx => {
            if let Err(e) = child.start_kill() {
                warn!(error = %e, "Failed to kill service process");
            }
            child.wait().await
        }
    };

    let exit = match status {
        Ok(status) => ExitInfo::from_status(&status),
        Err(e) => {
            warn!(error = %e, "Failed to wait for service process");
            ExitInfo {
                code: None,
                signal: None,
            }
        }
    };

    // State first, so anyone woken by the watch sees the final state.
    inner.handle_exit(generation, exit).await;
    exit_tx.send_replace(Some(exit));
}

async fn wait_for_exit(mut exit_rx: watch::Receiver<Option<ExitInfo>>) -> ExitInfo {
    loop {
        if let Some(exit) = *exit_rx.borrow_and_update() {
            return exit;
        }
        if exit_rx.changed().await.is_err() {
            return exit_rx.borrow().unwrap_or(ExitInfo {
                code: None,
                signal: None,
            });
        }
    }
}

fn spawn_line_reader<R>(
    reader: R,
    events: broadcast::Sender<SupervisorEvent>,
    wrap: fn(String) -> SupervisorEvent,
) where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = LossyLines::new(BufReader::new(reader));
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    let _ = events.send(wrap(line));
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "Failed to read process output; discarding the rest");
                    if let Err(e) = discard(lines.into_inner()).await {
                        debug!(error = %e, "Process output stream closed");
                    }
                    break;
                }
            }
        }
    });
}

#[cfg(unix)]
fn send_terminate(pid: Option<u32>) -> bool {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    let Some(pid) = pid else {
        return false;
    };
    match kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
        Ok(()) => true,
        Err(e) => {
            debug!(pid, error = %e, "SIGTERM not delivered");
            false
        }
    }
}

#[cfg(not(unix))]
fn send_terminate(_pid: Option<u32>) -> bool {
    false
}

#[cfg(unix)]
fn is_signalable(pid: Option<u32>) -> bool {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    match pid {
        Some(pid) => kill(Pid::from_raw(pid as i32), None).is_ok(),
        None => false,
    }
}

#[cfg(not(unix))]
fn is_signalable(pid: Option<u32>) -> bool {
    pid.is_some()
}
