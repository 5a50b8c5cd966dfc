use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use vault_pilot::app::App;
use vault_pilot::collaborators::{ExternalAppDetector, ProcfsDetector};
use vault_pilot::config::AppConfig;
use vault_pilot::onboarding::{InitOrchestrator, OrchestratorEvent, Step, StepStatus};
use vault_pilot::supervisor::SupervisorEvent;

/// How often the detector is polled while waiting for the app to start.
const DETECT_POLL_INTERVAL: Duration = Duration::from_secs(2);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::from_env().context("Invalid configuration")?;
    let _log_guard = init_tracing(config.log_dir.as_deref())?;

    eprintln!("vault-pilot v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   App: {}", config.orchestrator.app_name);
    eprintln!("   Service: {}", config.orchestrator.service.base_url());
    eprintln!("   Settings: {}\n", config.db_path.display());

    let App {
        orchestrator,
        supervisor,
        detector,
    } = App::from_config(&config)
        .await
        .context("Failed to initialize vault-pilot")?;

    let _orchestrator_log = spawn_orchestrator_logger(orchestrator.subscribe());
    let _supervisor_log = spawn_supervisor_logger(supervisor.subscribe());

    let driver = tokio::spawn(drive(orchestrator, detector));

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    info!("Shutting down");
    driver.abort();

    supervisor.enable_auto_restart(false).await;
    if let Err(e) = supervisor.stop(false).await {
        warn!(error = %e, "Graceful stop failed; killing service");
        supervisor.stop(true).await?;
    }
    Ok(())
}

/// stderr logging filtered by `RUST_LOG` (default `info`), plus a daily
/// log file when a log directory is configured.
fn init_tracing(log_dir: Option<&Path>) -> anyhow::Result<Option<WorkerGuard>> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false);

    let Some(log_dir) = log_dir else {
        tracing_subscriber::registry()
            .with(filter)
            .with(stderr_layer)
            .init();
        return Ok(None);
    };

    std::fs::create_dir_all(log_dir)
        .with_context(|| format!("Failed to create log directory {}", log_dir.display()))?;
    let file_appender = tracing_appender::rolling::daily(log_dir, "vault-pilot.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_target(false)
        .with_line_number(true);

    tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .with(file_layer)
        .init();
    info!(log_dir = %log_dir.display(), "File logging enabled");
    Ok(Some(guard))
}

/// Run initialization, resolving pauses until it completes or fails.
async fn drive(orchestrator: InitOrchestrator, detector: Arc<ProcfsDetector>) {
    orchestrator.start_initialization().await;

    loop {
        let state = orchestrator.get_state().await;
        if state.is_completed {
            info!("Setup complete; press Ctrl-C to stop the service");
            return;
        }

        let current = state.step(state.current_step);
        match (current.step, current.status) {
            (Step::DetectingApp, StepStatus::WaitingUserInput) => {
                if let Some(action) = &current.user_action {
                    eprintln!("   {action}");
                }
                while !detector.is_running().await {
                    tokio::time::sleep(DETECT_POLL_INTERVAL).await;
                }
                orchestrator.retry_current_step().await;
            }
            (Step::SelectingWorkDir, StepStatus::WaitingUserInput) => {
                match prompt_line("Directory for decrypted data: ").await {
                    Some(dir) => orchestrator.set_work_dir(dir).await,
                    None => {
                        warn!("No working directory given; setup paused");
                        return;
                    }
                }
            }
            (step, StepStatus::Error) => {
                error!(
                    step = %step,
                    error = current.error.as_deref().unwrap_or_default(),
                    "Setup failed; restart vault-pilot to try again"
                );
                return;
            }
            _ => return,
        }
    }
}

async fn prompt_line(prompt: &str) -> Option<String> {
    eprint!("{prompt}");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    match lines.next_line().await {
        Ok(Some(line)) if !line.trim().is_empty() => Some(line.trim().to_string()),
        _ => None,
    }
}

fn spawn_orchestrator_logger(
    mut rx: broadcast::Receiver<OrchestratorEvent>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(OrchestratorEvent::StepProgress { step, progress }) => {
                    info!(step = %step, progress, "Step progress");
                }
                Ok(OrchestratorEvent::StateChanged { state }) => {
                    debug!(
                        current = %state.current_step,
                        overall = state.overall_progress,
                        "Setup state changed"
                    );
                }
                Ok(OrchestratorEvent::Error { step, message }) => {
                    error!(step = %step, "{message}");
                }
                Ok(OrchestratorEvent::Completed) => info!("Setup completed"),
                Err(RecvError::Lagged(n)) => warn!(skipped = n, "Setup event log lagged"),
                Err(RecvError::Closed) => break,
            }
        }
    })
}

fn spawn_supervisor_logger(
    mut rx: broadcast::Receiver<SupervisorEvent>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(SupervisorEvent::Stdout(line)) => info!(target: "service", "{line}"),
                Ok(SupervisorEvent::Stderr(line)) => warn!(target: "service", "{line}"),
                Ok(SupervisorEvent::StatusChanged { old, new }) => {
                    info!(from = %old, to = %new, "Service status changed");
                }
                Ok(SupervisorEvent::ProcessExit { code, signal }) => {
                    info!(code = ?code, signal = ?signal, "Service exited");
                }
                Ok(SupervisorEvent::MaxRestartsReached) => {
                    error!("Service keeps crashing; automatic restarts stopped");
                }
                Err(RecvError::Lagged(n)) => warn!(skipped = n, "Service event log lagged"),
                Err(RecvError::Closed) => break,
            }
        }
    })
}
