//! Orchestration core: host lifecycle rules, job execution and VM placement

pub mod capacity;
pub mod error;
pub mod guard;
pub mod host;
pub mod job;
pub mod mock;
pub mod orchestrator;
pub mod provisioner;
pub mod registry;
pub mod runner;
pub mod snapshot_writer;
pub mod traits;

// Re-export commonly used types
pub use error::OrchestratorError;
pub use orchestrator::Orchestrator;
pub use orchestrator::OrchestratorConfig;
pub use registry::HostRegistry;
pub use runner::RunnerConfig;
