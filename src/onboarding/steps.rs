//! Step handlers, one per pipeline step.
//!
//! Every handler is idempotent: it overwrites run-session data and store
//! keys instead of appending, and the service step stops a still-running
//! service before launching a new one. That makes retrying any step safe.

use std::future::Future;
use std::path::PathBuf;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::orchestrator::ServiceDependencies;
use super::state::Step;
use crate::collaborators::{Credential, ProgressReporter};
use crate::config::OrchestratorConfig;
use crate::error::StepError;
use crate::supervisor::ProcessState;

/// Data produced by earlier steps of the current run.
#[derive(Debug, Default)]
pub(crate) struct RunSession {
    pub app_executable: Option<PathBuf>,
    pub data_dir: Option<PathBuf>,
    pub credential: Option<Credential>,
    pub work_dir: Option<PathBuf>,
    /// Chosen through `set_work_dir`; survives new runs.
    pub requested_work_dir: Option<PathBuf>,
}

impl RunSession {
    /// Forget everything produced by a previous run.
    pub fn reset(&mut self) {
        *self = Self {
            requested_work_dir: self.requested_work_dir.take(),
            ..Self::default()
        };
    }
}

/// Everything a handler may touch.
pub(crate) struct StepContext<'a> {
    pub deps: &'a ServiceDependencies,
    pub config: &'a OrchestratorConfig,
    pub session: &'a Mutex<RunSession>,
    pub progress: ProgressReporter,
}

pub(crate) type StepHandler =
    for<'a> fn(&'a StepContext<'a>) -> BoxFuture<'a, Result<(), StepError>>;

/// Handlers indexed by [`Step::index`]; `Completed` has none.
const HANDLERS: [StepHandler; 5] = [
    detect_app,
    obtain_credential,
    select_work_dir,
    decrypt_store,
    start_service,
];

pub(crate) fn handler(step: Step) -> Option<StepHandler> {
    HANDLERS.get(step.index()).copied()
}

/// Bound a collaborator call with a timeout, converting its error.
async fn bounded<T, E, F>(operation: &'static str, timeout: Duration, fut: F) -> Result<T, StepError>
where
    F: Future<Output = Result<T, E>>,
    E: Into<StepError>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result.map_err(Into::into),
        Err(_) => Err(StepError::Timeout { operation, timeout }),
    }
}

fn detect_app<'a>(ctx: &'a StepContext<'a>) -> BoxFuture<'a, Result<(), StepError>> {
    Box::pin(async move {
        let detector = &ctx.deps.detector;
        let timeout = ctx.config.detect_timeout;

        let running = tokio::time::timeout(timeout, detector.is_running())
            .await
            .map_err(|_| StepError::Timeout {
                operation: "application detection",
                timeout,
            })?;
        if !running {
            return Err(StepError::UserInputRequired {
                action: format!("Start {} and log in, then retry", ctx.config.app_name),
            });
        }

        let processes = bounded("process detection", timeout, detector.detect_processes()).await?;
        ctx.progress.report(50);
        let data = bounded("data directory detection", timeout, detector.detect_data_directory())
            .await?;

        let Some(process) = processes.into_iter().next() else {
            return Err(StepError::UserInputRequired {
                action: format!("Start {} and log in, then retry", ctx.config.app_name),
            });
        };

        info!(
            pid = process.pid,
            executable = %process.executable_path.display(),
            data_dir = %data.data_dir.display(),
            account = ?data.account,
            "Application detected"
        );

        let mut session = ctx.session.lock().await;
        session.app_executable = Some(process.executable_path);
        session.data_dir = Some(data.data_dir);
        Ok(())
    })
}

fn obtain_credential<'a>(ctx: &'a StepContext<'a>) -> BoxFuture<'a, Result<(), StepError>> {
    Box::pin(async move {
        let executable = ctx
            .session
            .lock()
            .await
            .app_executable
            .clone()
            .ok_or(StepError::MissingInput("application executable"))?;

        let credential = bounded(
            "credential extraction",
            ctx.config.credential_timeout,
            ctx.deps.credentials.obtain_credential(&executable),
        )
        .await?;

        ctx.deps.store.set_credential(&credential).await?;
        ctx.session.lock().await.credential = Some(credential);
        Ok(())
    })
}

fn select_work_dir<'a>(ctx: &'a StepContext<'a>) -> BoxFuture<'a, Result<(), StepError>> {
    Box::pin(async move {
        let requested = ctx.session.lock().await.requested_work_dir.clone();
        let dir = match requested {
            Some(dir) => Some(dir),
            None => ctx
                .deps
                .store
                .work_dir()
                .await?
                .or_else(|| ctx.config.default_work_dir.clone()),
        };
        let Some(dir) = dir else {
            return Err(StepError::UserInputRequired {
                action: "Choose a directory for the decrypted data".to_string(),
            });
        };

        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|source| StepError::WorkDir {
                path: dir.clone(),
                source,
            })?;

        ctx.deps.store.set_work_dir(&dir).await?;
        debug!(work_dir = %dir.display(), "Working directory selected");
        ctx.session.lock().await.work_dir = Some(dir);
        Ok(())
    })
}

fn decrypt_store<'a>(ctx: &'a StepContext<'a>) -> BoxFuture<'a, Result<(), StepError>> {
    Box::pin(async move {
        let (source, work_dir, credential, executable) = {
            let session = ctx.session.lock().await;
            (
                session
                    .data_dir
                    .clone()
                    .ok_or(StepError::MissingInput("data directory"))?,
                session
                    .work_dir
                    .clone()
                    .ok_or(StepError::MissingInput("working directory"))?,
                session
                    .credential
                    .clone()
                    .ok_or(StepError::MissingInput("credential"))?,
                session
                    .app_executable
                    .clone()
                    .ok_or(StepError::MissingInput("application executable"))?,
            )
        };

        bounded(
            "decryption",
            ctx.config.decrypt_timeout,
            ctx.deps.decryptor.decrypt(
                &source,
                &work_dir,
                &credential,
                &executable,
                ctx.progress.clone(),
            ),
        )
        .await
    })
}

fn start_service<'a>(ctx: &'a StepContext<'a>) -> BoxFuture<'a, Result<(), StepError>> {
    Box::pin(async move {
        let (work_dir, credential) = {
            let session = ctx.session.lock().await;
            (
                session
                    .work_dir
                    .clone()
                    .ok_or(StepError::MissingInput("working directory"))?,
                session
                    .credential
                    .clone()
                    .ok_or(StepError::MissingInput("credential"))?,
            )
        };

        launch_service(ctx.deps, ctx.config, &work_dir, &credential).await
    })
}

/// Replace any running service with one serving `work_dir`.
pub(crate) async fn launch_service(
    deps: &ServiceDependencies,
    config: &OrchestratorConfig,
    work_dir: &std::path::Path,
    credential: &Credential,
) -> Result<(), StepError> {
    let supervisor = &deps.supervisor;
    if supervisor.status().await != ProcessState::Stopped {
        debug!("Stopping previous service instance");
        supervisor.stop(false).await?;
    }

    supervisor
        .start(config.service.process_config(work_dir, credential))
        .await?;
    deps.store
        .set_service_address(&config.service.base_url())
        .await?;
    Ok(())
}
