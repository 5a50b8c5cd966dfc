//! InitOrchestrator: sequences the initialization steps.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::{Mutex, RwLock, broadcast, mpsc};
use tracing::{Instrument, debug, info, info_span, warn};
use uuid::Uuid;

use super::events::OrchestratorEvent;
use super::state::{OrchestrationState, Step, StepStatus};
use super::steps::{self, RunSession, StepContext};
use crate::collaborators::{
    ConfigurationStore, CredentialService, DataStoreDecryptor, ExternalAppDetector,
    ProgressReporter,
};
use crate::config::OrchestratorConfig;
use crate::error::StepError;
use crate::supervisor::ProcessSupervisor;

/// Event channel capacity.
const EVENT_CAPACITY: usize = 256;

/// Collaborators the orchestrator drives.
pub struct ServiceDependencies {
    pub detector: Arc<dyn ExternalAppDetector>,
    pub credentials: Arc<dyn CredentialService>,
    pub decryptor: Arc<dyn DataStoreDecryptor>,
    pub store: Arc<dyn ConfigurationStore>,
    pub supervisor: ProcessSupervisor,
}

enum StepOutcome {
    Success,
    Paused,
    Failed,
}

/// Clears the `running` flag when a run ends, however it ends.
struct RunGuard<'a>(&'a AtomicBool);

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

struct Inner {
    config: OrchestratorConfig,
    deps: ServiceDependencies,
    state: RwLock<OrchestrationState>,
    session: Mutex<RunSession>,
    running: AtomicBool,
    events: broadcast::Sender<OrchestratorEvent>,
}

/// Drives detection, credential extraction, decryption and service launch.
///
/// Runs never return errors: every failure ends up as a step `Error` plus
/// an [`OrchestratorEvent::Error`]. Cheap to clone.
#[derive(Clone)]
pub struct InitOrchestrator {
    inner: Arc<Inner>,
}

impl InitOrchestrator {
    pub fn new(config: OrchestratorConfig, deps: ServiceDependencies) -> Self {
        let (events, _rx) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                config,
                deps,
                state: RwLock::new(OrchestrationState::default()),
                session: Mutex::new(RunSession::default()),
                running: AtomicBool::new(false),
                events,
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OrchestratorEvent> {
        self.inner.events.subscribe()
    }

    pub async fn get_state(&self) -> OrchestrationState {
        self.inner.state.read().await.clone()
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    /// Start a fresh run. Ignored while another run is in progress.
    pub async fn start_initialization(&self) {
        let Some(_guard) = self.inner.try_begin() else {
            warn!("Initialization already in progress; ignoring start request");
            return;
        };

        let run_id = Uuid::new_v4();
        let inner = &self.inner;
        async {
            info!("Initialization started");
            inner.session.lock().await.reset();
            let snapshot = {
                let mut state = inner.state.write().await;
                *state = OrchestrationState::default();
                state.clone()
            };
            inner.emit(OrchestratorEvent::StateChanged { state: snapshot });

            if inner.try_fast_path().await {
                return;
            }
            inner.run_from(Step::DetectingApp).await;
        }
        .instrument(info_span!("init_run", run_id = %run_id))
        .await;
    }

    /// Re-run the current step if it failed or is waiting for the user,
    /// then continue forward. Ignored while a run is in progress.
    pub async fn retry_current_step(&self) {
        let Some(_guard) = self.inner.try_begin() else {
            warn!("Initialization in progress; ignoring retry request");
            return;
        };

        let (step, status) = {
            let state = self.inner.state.read().await;
            (state.current_step, state.step(state.current_step).status)
        };
        if !status.is_retryable() {
            debug!(step = %step, status = %status, "Nothing to retry");
            return;
        }

        let run_id = Uuid::new_v4();
        self.inner
            .run_from(step)
            .instrument(info_span!("init_retry", run_id = %run_id, step = %step))
            .await;
    }

    /// Record the user's working directory choice.
    ///
    /// Resumes the run if it is paused waiting for exactly this input.
    pub async fn set_work_dir(&self, path: impl Into<PathBuf>) {
        let path = path.into();
        info!(work_dir = %path.display(), "Working directory chosen");
        self.inner.session.lock().await.requested_work_dir = Some(path);

        let waiting = {
            let state = self.inner.state.read().await;
            state.current_step == Step::SelectingWorkDir
                && state.step(Step::SelectingWorkDir).status == StepStatus::WaitingUserInput
        };
        if waiting {
            self.retry_current_step().await;
        }
    }
}

impl Inner {
    fn try_begin(&self) -> Option<RunGuard<'_>> {
        self.running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| RunGuard(&self.running))
    }

    fn emit(&self, event: OrchestratorEvent) {
        let _ = self.events.send(event);
    }

    /// Apply `f` to the state and recompute progress. Returns a snapshot.
    async fn update<F>(&self, f: F) -> OrchestrationState
    where
        F: FnOnce(&mut OrchestrationState),
    {
        let mut state = self.state.write().await;
        f(&mut state);
        if !state.is_completed {
            state.recompute_progress(&self.config.weights);
        }
        state.clone()
    }

    /// Skip straight to a running service when a previous run left
    /// everything in place.
    async fn try_fast_path(&self) -> bool {
        let store = &self.deps.store;
        let credential = match store.credential().await {
            Ok(Some(credential)) => credential,
            Ok(None) => return false,
            Err(e) => {
                warn!(error = %e, "Could not read stored credential");
                return false;
            }
        };
        let work_dir = match store.work_dir().await {
            Ok(Some(dir)) => dir,
            Ok(None) => return false,
            Err(e) => {
                warn!(error = %e, "Could not read stored working directory");
                return false;
            }
        };
        if !self.deps.decryptor.check_decrypted(&work_dir).await {
            debug!(work_dir = %work_dir.display(), "No decrypted data; running full setup");
            return false;
        }

        info!(work_dir = %work_dir.display(), "Existing setup found; starting service directly");
        if let Err(e) =
            steps::launch_service(&self.deps, &self.config, &work_dir, &credential).await
        {
            warn!(error = %e, "Fast start failed; running full setup");
            return false;
        }

        {
            let mut session = self.session.lock().await;
            session.credential = Some(credential);
            session.work_dir = Some(work_dir);
        }
        self.update(|state| {
            for step in Step::ALL.iter().filter(|s| !s.is_terminal()) {
                let info = state.step_mut(*step);
                info.status = StepStatus::Success;
                info.progress = 100;
            }
        })
        .await;
        self.finish().await;
        true
    }

    /// Execute steps from `start` until completion, a pause, or a failure.
    async fn run_from(&self, start: Step) {
        let mut step = start;
        loop {
            if steps::handler(step).is_none() {
                self.finish().await;
                return;
            }
            match self.execute_step(step).await {
                StepOutcome::Success => match step.next() {
                    Some(next) => step = next,
                    None => {
                        self.finish().await;
                        return;
                    }
                },
                StepOutcome::Paused | StepOutcome::Failed => return,
            }
        }
    }

    async fn execute_step(&self, step: Step) -> StepOutcome {
        let Some(handler) = steps::handler(step) else {
            return StepOutcome::Success;
        };

        let snapshot = self
            .update(|state| {
                let from = state.current_step;
                if from != step && !from.can_transition_to(step) {
                    warn!(from = %from, to = %step, "Step entered out of order");
                }
                state.current_step = step;
                let info = state.step_mut(step);
                info.status = StepStatus::InProgress;
                info.progress = 0;
                info.error = None;
                info.user_action = None;
            })
            .await;
        self.emit(OrchestratorEvent::StateChanged { state: snapshot });
        self.emit(OrchestratorEvent::StepProgress { step, progress: 0 });
        info!(step = %step, "Step started");

        let (progress_tx, mut progress_rx) = mpsc::unbounded_channel();
        let ctx = StepContext {
            deps: &self.deps,
            config: &self.config,
            session: &self.session,
            progress: ProgressReporter::new(progress_tx),
        };

        let result = {
            let run = handler(&ctx);
            tokio::pin!(run);
            loop {
                tokio::select! {
                    result = &mut run => break result,
                    Some(progress) = progress_rx.recv() => self.on_progress(step, progress).await,
                }
            }
        };
        drop(ctx);
        while let Ok(progress) = progress_rx.try_recv() {
            self.on_progress(step, progress).await;
        }

        match result {
            Ok(()) => {
                let snapshot = self
                    .update(|state| {
                        let info = state.step_mut(step);
                        info.status = StepStatus::Success;
                        info.progress = 100;
                    })
                    .await;
                self.emit(OrchestratorEvent::StepProgress {
                    step,
                    progress: 100,
                });
                self.emit(OrchestratorEvent::StateChanged { state: snapshot });
                info!(step = %step, "Step succeeded");
                StepOutcome::Success
            }
            Err(e) if e.is_pause() => {
                let action = match e {
                    StepError::UserInputRequired { action } => action,
                    other => other.to_string(),
                };
                info!(step = %step, action = %action, "Step waiting for user input");
                let snapshot = self
                    .update(|state| {
                        let info = state.step_mut(step);
                        info.status = StepStatus::WaitingUserInput;
                        info.user_action = Some(action);
                    })
                    .await;
                self.emit(OrchestratorEvent::StateChanged { state: snapshot });
                StepOutcome::Paused
            }
            Err(e) => {
                let message = format!("{}: {e}", step.title());
                warn!(step = %step, kind = ?e.kind(), error = %e, "Step failed");
                let snapshot = self
                    .update(|state| {
                        let info = state.step_mut(step);
                        info.status = StepStatus::Error;
                        info.error = Some(message.clone());
                    })
                    .await;
                self.emit(OrchestratorEvent::StateChanged { state: snapshot });
                self.emit(OrchestratorEvent::Error { step, message });
                StepOutcome::Failed
            }
        }
    }

    async fn on_progress(&self, step: Step, progress: u8) {
        let progress = progress.min(100);
        let mut changed = false;
        let snapshot = self
            .update(|state| {
                let info = state.step_mut(step);
                if info.status == StepStatus::InProgress && info.progress != progress {
                    info.progress = progress;
                    changed = true;
                }
            })
            .await;
        if changed {
            self.emit(OrchestratorEvent::StepProgress { step, progress });
            self.emit(OrchestratorEvent::StateChanged { state: snapshot });
        }
    }

    async fn finish(&self) {
        let snapshot = {
            let mut state = self.state.write().await;
            state.complete();
            state.clone()
        };
        info!("Initialization completed");
        self.emit(OrchestratorEvent::StateChanged { state: snapshot });
        self.emit(OrchestratorEvent::Completed);
    }
}
