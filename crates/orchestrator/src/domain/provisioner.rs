//! Virtual machine creation on VM hosts

use std::sync::Arc;

use api_types::CreateVmRequest;
use api_types::HostCapacity;
use api_types::JobKind;
use api_types::OsVariant;
use api_types::RejectionReason;
use api_types::VmStatus;
use chrono::Utc;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::error;
use tracing::info;
use tracing::warn;
use utils::keyed_lock::KeyedAsyncLock;

use super::guard;
use super::guard::GuardRejection;
use super::guard::HostAction;
use super::host::Host;
use super::host::HostTarget;
use super::host::VirtualMachine;
use super::host::VmSpec;
use super::job::JobTicket;
use super::job::JOB_EVENT_TARGET;
use super::registry::HostRegistry;
use super::runner::Supervisor;
use super::traits::CapacityTracker;
use super::traits::HostCapability;

const MAX_VM_NAME_LEN: usize = 64;

/// Why a virtual machine request was refused
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProvisionRejection {
    #[error("host {host_id} not found")]
    HostNotFound { host_id: String },
    #[error("host {host_id} cannot run virtual machines: {rejection}")]
    HostNotEligible {
        host_id: String,
        rejection: GuardRejection,
    },
    #[error("invalid virtual machine parameters: {message}")]
    InvalidParameters { message: String },
    #[error("a virtual machine named '{name}' already exists on host {host_id}")]
    NameConflict { name: String, host_id: String },
    #[error("host {host_id} has insufficient capacity: requested {requested}, available {available}")]
    CapacityExceeded {
        host_id: String,
        requested: HostCapacity,
        available: HostCapacity,
    },
}

impl ProvisionRejection {
    pub fn reason(&self) -> RejectionReason {
        match self {
            Self::HostNotFound { .. } => RejectionReason::HostNotFound,
            Self::HostNotEligible { .. } => RejectionReason::HostNotEligible,
            Self::InvalidParameters { .. } => RejectionReason::InvalidParameters,
            Self::NameConflict { .. } => RejectionReason::NameConflict,
            Self::CapacityExceeded { .. } => RejectionReason::CapacityExceeded,
        }
    }
}

/// Checks the request on its own, without looking at any host.
pub fn validate(request: &CreateVmRequest) -> Result<VmSpec, ProvisionRejection> {
    let invalid = |message: String| ProvisionRejection::InvalidParameters { message };

    let name = request.vm_name.trim();
    if name.is_empty() {
        return Err(invalid("vm_name must not be empty".to_string()));
    }
    if name.len() > MAX_VM_NAME_LEN {
        return Err(invalid(format!(
            "vm_name must be at most {MAX_VM_NAME_LEN} characters"
        )));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    {
        return Err(invalid(format!(
            "vm_name '{name}' may only contain letters, digits, '-', '_' and '.'"
        )));
    }

    let vcpus = u32::try_from(request.vcpus)
        .ok()
        .filter(|v| *v > 0)
        .ok_or_else(|| invalid(format!("vcpus must be a positive integer, got {}", request.vcpus)))?;
    let memory_mb = u64::try_from(request.memory_mb)
        .ok()
        .filter(|v| *v > 0)
        .ok_or_else(|| {
            invalid(format!(
                "memory_mb must be a positive integer, got {}",
                request.memory_mb
            ))
        })?;
    let disk_gb = u64::try_from(request.disk_gb)
        .ok()
        .filter(|v| *v > 0)
        .ok_or_else(|| invalid(format!("disk_gb must be a positive integer, got {}", request.disk_gb)))?;
    let os_variant: OsVariant = request
        .os_variant
        .parse()
        .map_err(|err: api_types::UnsupportedOsVariant| invalid(err.to_string()))?;

    Ok(VmSpec {
        name: name.to_string(),
        vcpus,
        memory_mb,
        disk_gb,
        os_variant,
    })
}

/// A virtual machine that was accepted and is being created
#[derive(Debug)]
pub struct VmAccepted {
    pub vm: VirtualMachine,
    pub hostname: String,
    /// Completes once the VM record reached `Running` or `Failed`
    pub completion: JoinHandle<()>,
}

/// Validates, reserves and creates virtual machines
#[derive(Clone)]
pub struct VmProvisioner {
    registry: Arc<HostRegistry>,
    capacity: Arc<dyn CapacityTracker>,
    capability: Arc<dyn HostCapability>,
    locks: Arc<KeyedAsyncLock<String>>,
    supervisor: Supervisor,
}

impl VmProvisioner {
    pub fn new(
        registry: Arc<HostRegistry>,
        capacity: Arc<dyn CapacityTracker>,
        capability: Arc<dyn HostCapability>,
        locks: Arc<KeyedAsyncLock<String>>,
        supervisor: Supervisor,
    ) -> Self {
        Self {
            registry,
            capacity,
            capability,
            locks,
            supervisor,
        }
    }

    /// Refuses a request body that could not be decoded.
    ///
    /// The host checks still come first, so an ineligible host reports
    /// `HostNotEligible` whatever the body looked like.
    pub async fn reject_malformed(&self, host_id: &str, detail: &str) -> ProvisionRejection {
        let _guard = self.locks.lock(&host_id.to_string()).await;
        match self.eligible_host(host_id) {
            Err(rejection) => rejection,
            Ok(_) => ProvisionRejection::InvalidParameters {
                message: detail.to_string(),
            },
        }
    }

    fn eligible_host(&self, host_id: &str) -> Result<Host, ProvisionRejection> {
        let host = self
            .registry
            .host(host_id)
            .ok_or_else(|| ProvisionRejection::HostNotFound {
                host_id: host_id.to_string(),
            })?;
        guard::evaluate(host.status, host.is_vm_host, HostAction::CreateVirtualMachine).map_err(
            |rejection| ProvisionRejection::HostNotEligible {
                host_id: host_id.to_string(),
                rejection,
            },
        )?;
        Ok(host)
    }

    /// Accepts a VM request and starts creating it in the background.
    ///
    /// Every check, the capacity reservation and the insertion of the
    /// `Creating` record happen under the host lock.
    pub async fn create(
        &self,
        host_id: &str,
        request: &CreateVmRequest,
    ) -> Result<VmAccepted, ProvisionRejection> {
        let (vm, target, ticket) = {
            let _guard = self.locks.lock(&host_id.to_string()).await;

            let host = self.eligible_host(host_id)?;
            let spec = validate(request)?;

            let taken = self
                .registry
                .vms_on_host(host_id)
                .iter()
                .any(|vm| vm.is_live() && vm.spec.name == spec.name);
            if taken {
                return Err(ProvisionRejection::NameConflict {
                    name: spec.name,
                    host_id: host_id.to_string(),
                });
            }

            let vm_id = uuid::Uuid::new_v4().to_string();
            let requested = spec.resources();
            self.capacity
                .reserve(&host, &vm_id, requested)
                .map_err(|available| ProvisionRejection::CapacityExceeded {
                    host_id: host_id.to_string(),
                    requested,
                    available,
                })?;

            let vm = VirtualMachine::creating(vm_id, host_id.to_string(), spec, Utc::now());
            if self.registry.insert_vm(vm.clone()).is_err() {
                self.capacity.release(host_id, &vm.id);
                return Err(ProvisionRejection::HostNotFound {
                    host_id: host_id.to_string(),
                });
            }

            let ticket = self.supervisor.jobs().begin(
                JobKind::CreateVirtualMachine,
                host_id,
                Some(&vm.id),
            );
            info!(
                target: JOB_EVENT_TARGET,
                job_id = ticket.id(),
                host_id,
                vm_id = %vm.id,
                kind = %JobKind::CreateVirtualMachine,
                vm_name = %vm.spec.name,
                "job dispatched"
            );
            (vm, host.target(), ticket)
        };

        let hostname = target.hostname.clone();
        let provisioner = self.clone();
        let spec = vm.spec.clone();
        let completion =
            tokio::spawn(async move { provisioner.execute(ticket, target, spec).await });

        Ok(VmAccepted {
            vm,
            hostname,
            completion,
        })
    }

    async fn execute(self, ticket: JobTicket, target: HostTarget, spec: VmSpec) {
        let capability = Arc::clone(&self.capability);
        let result = self
            .supervisor
            .supervise(&ticket, || {
                let capability = Arc::clone(&capability);
                let target = target.clone();
                let spec = spec.clone();
                async move { capability.create_vm(&target, &spec).await }
            })
            .await;
        self.resolve(ticket, result).await;
    }

    /// Moves the VM out of `Creating`. Host status is never touched.
    async fn resolve(&self, ticket: JobTicket, result: Result<(), String>) {
        let host_id = ticket.host_id().to_string();
        let Some(vm_id) = ticket.vm_id().map(str::to_string) else {
            error!(job_id = ticket.id(), "virtual machine job without a vm id");
            self.supervisor.jobs().finish(ticket);
            return;
        };
        let _guard = self.locks.lock(&host_id).await;

        let applied = self.registry.update_vm(&vm_id, |vm| match &result {
            Ok(()) => {
                vm.status = VmStatus::Running;
                vm.last_error = None;
            }
            Err(reason) => {
                vm.status = VmStatus::Failed;
                vm.last_error = Some(format!("VM creation failed: {reason}"));
            }
        });
        if result.is_err() {
            self.capacity.release(&host_id, &vm_id);
        }

        let job_id = ticket.id().to_string();
        let attempts = self
            .supervisor
            .jobs()
            .finish(ticket)
            .map(|job| job.attempts)
            .unwrap_or_default();

        match (applied, result) {
            (Ok(()), Ok(())) => info!(
                target: JOB_EVENT_TARGET,
                job_id = %job_id,
                host_id = %host_id,
                vm_id = %vm_id,
                kind = %JobKind::CreateVirtualMachine,
                attempts,
                status = %VmStatus::Running,
                "job succeeded"
            ),
            (Ok(()), Err(reason)) => warn!(
                target: JOB_EVENT_TARGET,
                job_id = %job_id,
                host_id = %host_id,
                vm_id = %vm_id,
                kind = %JobKind::CreateVirtualMachine,
                attempts,
                status = %VmStatus::Failed,
                reason = %reason,
                "job failed"
            ),
            (Err(err), _) => error!(
                target: JOB_EVENT_TARGET,
                job_id = %job_id,
                host_id = %host_id,
                vm_id = %vm_id,
                "failed to resolve job: {err}"
            ),
        }
    }
}
