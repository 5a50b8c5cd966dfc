//! Process supervision for the background data service.
//!
//! The supervisor owns at most one spawned process. It validates and spawns
//! it, confirms readiness, forwards its output as events, stops it
//! gracefully with escalation to a forced kill, and optionally restarts it
//! after unexpected exits within a bounded budget.

pub mod process;
mod readiness;
pub mod state;

pub use process::ProcessSupervisor;
pub use state::{
    ExitInfo, ProcessConfig, ProcessSnapshot, ProcessState, Readiness, SupervisorEvent,
};
