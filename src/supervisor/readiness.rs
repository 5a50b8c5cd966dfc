//! Readiness probes run while a freshly spawned process is `Starting`.

use std::time::Duration;

use tokio::sync::broadcast::{self, error::RecvError};
use tracing::debug;

use super::state::{Readiness, SupervisorEvent};
use crate::error::ProcessError;

/// Per-request timeout for the HTTP probe.
const HTTP_PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// Delay between HTTP probe attempts.
const HTTP_PROBE_INTERVAL: Duration = Duration::from_millis(250);

/// Wait until the process satisfies `readiness`.
///
/// Never returns on its own if the condition is never met; callers bound it
/// with the startup timeout and race it against process exit.
pub(crate) async fn wait_until_ready(
    readiness: &Readiness,
    mut events: broadcast::Receiver<SupervisorEvent>,
) -> Result<(), ProcessError> {
    match readiness {
        Readiness::Alive { settle } => {
            tokio::time::sleep(*settle).await;
            Ok(())
        }
        Readiness::OutputContains(pattern) => loop {
            match events.recv().await {
                Ok(SupervisorEvent::Stdout(line) | SupervisorEvent::Stderr(line))
                    if line.contains(pattern.as_str()) =>
                {
                    debug!(pattern = %pattern, "Readiness line observed");
                    return Ok(());
                }
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    debug!(skipped, "Readiness probe lagged behind process output");
                }
                Err(RecvError::Closed) => std::future::pending::<()>().await,
            }
        },
        Readiness::HttpOk { url } => poll_http(url).await,
    }
}

async fn poll_http(url: &str) -> Result<(), ProcessError> {
    let client = reqwest::Client::builder()
        .timeout(HTTP_PROBE_TIMEOUT)
        .build()
        .map_err(|e| ProcessError::SpawnFailed(format!("Failed to build HTTP probe: {e}")))?;

    loop {
        match client.get(url).send().await {
            Ok(resp) if resp.status().is_success() => {
                debug!(url = %url, "HTTP readiness probe succeeded");
                return Ok(());
            }
            Ok(resp) => debug!(url = %url, status = %resp.status(), "Service not ready yet"),
            Err(e) => debug!(url = %url, error = %e, "Service not reachable yet"),
        }
        tokio::time::sleep(HTTP_PROBE_INTERVAL).await;
    }
}
