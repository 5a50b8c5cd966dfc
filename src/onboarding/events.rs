//! Events broadcast by the orchestrator.

use serde::Serialize;

use super::state::{OrchestrationState, Step};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OrchestratorEvent {
    /// Full snapshot after any state change.
    StateChanged { state: OrchestrationState },
    /// The run finished; always preceded by a final `StateChanged`.
    Completed,
    /// A step failed; the run is aborted.
    Error { step: Step, message: String },
    StepProgress { step: Step, progress: u8 },
}
