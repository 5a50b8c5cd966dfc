//! Persistence for onboarding settings.

pub mod libsql_config;
pub mod memory;
pub mod migrations;

pub use libsql_config::LibSqlConfigStore;
pub use memory::MemoryConfigStore;

pub(crate) const KEY_CREDENTIAL: &str = "credential";
pub(crate) const KEY_WORK_DIR: &str = "work_dir";
pub(crate) const KEY_SERVICE_ADDRESS: &str = "service_address";
