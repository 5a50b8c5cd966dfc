//! Initialization pipeline: first-launch setup flow.
//!
//! A run walks the steps in order: detect the external application, obtain
//! its data key, choose a working directory, decrypt the data there, and
//! start the background data service. Each step reports status and
//! progress through [`OrchestratorEvent`]s. A run can pause for user input
//! and be resumed with a retry.

pub mod events;
pub mod orchestrator;
pub mod state;
mod steps;

pub use events::OrchestratorEvent;
pub use orchestrator::{InitOrchestrator, ServiceDependencies};
pub use state::{OrchestrationState, Step, StepInfo, StepStatus, StepWeights, weighted_progress};
