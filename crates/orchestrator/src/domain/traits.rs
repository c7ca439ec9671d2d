//! Collaborator interfaces the orchestration core depends on

use api_types::HostCapacity;
use async_trait::async_trait;
use core::error::Error;
use error_stack::Report;
use serde::Deserialize;

use super::host::Host;
use super::host::HostTarget;
use super::host::VmSpec;
use super::registry::RegistrySnapshot;

/// Failures reported by an external capability
#[derive(Debug, derive_more::Display)]
pub enum CapabilityError {
    #[display("failed to launch capability: {message}")]
    LaunchFailed { message: String },
    #[display("capability reported failure: {message}")]
    CommandFailed { message: String },
    #[display("capability produced unusable output: {message}")]
    InvalidOutput { message: String },
    #[display("host unreachable: {message}")]
    Unreachable { message: String },
    #[display("operation not supported by this capability: {operation}")]
    Unsupported { operation: String },
}

impl Error for CapabilityError {}

/// What a successful provisioning run learned about the host
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ProvisionReport {
    /// Hardware totals discovered on the machine, if the backend gathers them
    pub facts: Option<HostCapacity>,
}

/// The privileged work the orchestrator sequences but does not implement.
///
/// Implementations must be convergent: the same call may be repeated after a
/// failure or a timeout.
#[async_trait]
pub trait HostCapability: Send + Sync {
    /// Brings a bare machine into a managed state.
    async fn provision(&self, host: &HostTarget) -> Result<ProvisionReport, Report<CapabilityError>>;

    /// Installs the virtualization stack.
    async fn install_virtualization(&self, host: &HostTarget) -> Result<(), Report<CapabilityError>>;

    /// Creates and boots a guest.
    async fn create_vm(&self, host: &HostTarget, vm: &VmSpec) -> Result<(), Report<CapabilityError>>;

    /// Checks that the host answers.
    async fn ping(&self, host: &HostTarget) -> Result<(), Report<CapabilityError>>;
}

/// Source of truth for how much of a host is still free
pub trait CapacityTracker: Send + Sync {
    /// Capacity of `host` not yet reserved.
    fn available(&self, host: &Host) -> HostCapacity;

    /// Atomically checks and reserves `request` for `vm_id`.
    ///
    /// On refusal returns the capacity that was available.
    fn reserve(&self, host: &Host, vm_id: &str, request: HostCapacity) -> Result<(), HostCapacity>;

    /// Returns a reservation to the pool.
    fn release(&self, host_id: &str, vm_id: &str) -> Option<HostCapacity>;

    /// Reservations held on `host_id`, ordered by virtual machine id.
    fn allocations(&self, host_id: &str) -> Vec<(String, HostCapacity)>;
}

/// Failures of the registry's backing store
#[derive(Debug, derive_more::Display)]
pub enum PersistenceError {
    #[display("failed to read state from {path}")]
    ReadFailed { path: String },
    #[display("state in {path} could not be decoded")]
    Corrupt { path: String },
    #[display("failed to write state to {path}")]
    WriteFailed { path: String },
    #[display("state writer thread could not be started")]
    WriterUnavailable,
}

impl Error for PersistenceError {}

/// Durable home for registry snapshots
pub trait SnapshotStore: Send + Sync {
    /// Returns `None` when nothing has been saved yet.
    fn load(&self) -> Result<Option<RegistrySnapshot>, Report<PersistenceError>>;

    /// Replaces the stored state with `snapshot` in one step.
    fn save(&self, snapshot: &RegistrySnapshot) -> Result<(), Report<PersistenceError>>;
}

/// Renders a capability failure for `last_error` fields.
pub fn describe_failure(report: &Report<CapabilityError>) -> String {
    report.current_context().to_string()
}
