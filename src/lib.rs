//! vault-pilot: first-launch setup and supervision of a local data service.

pub mod app;
pub mod collaborators;
pub mod config;
pub mod error;
pub mod onboarding;
mod output;
pub mod store;
pub mod supervisor;
