//! Entry point for every external operation
//!
//! Each operation either applies a guarded transition synchronously or
//! dispatches a background job and acknowledges immediately. Nothing below
//! this facade leaks to callers: every outcome is an [`ActionResponse`].

use std::sync::Arc;
use std::time::Duration;

use api_types::ActionResponse;
use api_types::CreateVmRequest;
use api_types::HealthStatus;
use api_types::HostInfo;
use api_types::HostStatus;
use api_types::HostUsage;
use api_types::JobInfo;
use api_types::RegisterHostRequest;
use api_types::ResourceAllocation;
use api_types::VmInfo;
use chrono::Utc;
use futures::future::join_all;
use tracing::info;
use tracing::warn;
use utils::keyed_lock::KeyedAsyncLock;

use super::capacity::AllocationLedger;
use super::error::OrchestratorError;
use super::guard;
use super::guard::HostAction;
use super::guard::Transition;
use super::host::Host;
use super::job::JobTable;
use super::provisioner::VmProvisioner;
use super::registry::HostRegistry;
use super::registry::RegistryError;
use super::runner::run_bounded;
use super::runner::JobRunner;
use super::runner::RunnerConfig;
use super::runner::Supervisor;
use super::traits::CapacityTracker;
use super::traits::HostCapability;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrchestratorConfig {
    pub runner: RunnerConfig,
    pub health_check_timeout: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            runner: RunnerConfig::default(),
            health_check_timeout: Duration::from_secs(30),
        }
    }
}

/// Result of one health sweep over all in-service hosts
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HealthSweep {
    pub checked: usize,
    pub unhealthy: Vec<String>,
}

pub struct Orchestrator {
    registry: Arc<HostRegistry>,
    capacity: Arc<dyn CapacityTracker>,
    capability: Arc<dyn HostCapability>,
    locks: Arc<KeyedAsyncLock<String>>,
    jobs: Arc<JobTable>,
    runner: JobRunner,
    provisioner: VmProvisioner,
    health_check_timeout: Duration,
}

impl Orchestrator {
    /// Wires the runner and provisioner around a shared lock table.
    ///
    /// Capacity reservations are rebuilt from the registry's live guests.
    pub fn new(
        registry: Arc<HostRegistry>,
        capability: Arc<dyn HostCapability>,
        config: OrchestratorConfig,
    ) -> Self {
        let capacity: Arc<dyn CapacityTracker> =
            Arc::new(AllocationLedger::from_vms(&registry.all_vms()));
        let locks = Arc::new(KeyedAsyncLock::new());
        let jobs = Arc::new(JobTable::new());
        let supervisor = Supervisor::new(Arc::clone(&jobs), config.runner);

        let runner = JobRunner::new(
            Arc::clone(&registry),
            Arc::clone(&capability),
            Arc::clone(&locks),
            supervisor.clone(),
        );
        let provisioner = VmProvisioner::new(
            Arc::clone(&registry),
            Arc::clone(&capacity),
            Arc::clone(&capability),
            Arc::clone(&locks),
            supervisor,
        );

        Self {
            registry,
            capacity,
            capability,
            locks,
            jobs,
            runner,
            provisioner,
            health_check_timeout: config.health_check_timeout,
        }
    }

    pub fn register_host(&self, request: RegisterHostRequest) -> ActionResponse {
        match self.registry.register(request) {
            Ok(host) => ActionResponse::success(format!("Host {} registered", host.hostname))
                .with_resource_id(host.id),
            Err(err) => self.reject("register_host", None, err.into()),
        }
    }

    /// Starts provisioning a `Pending` or `Error` host.
    pub async fn provision_host(&self, host_id: &str) -> ActionResponse {
        match self.runner.start(host_id, HostAction::ProvisionHost).await {
            Ok(started) => ActionResponse::success(format!(
                "Provisioning initiated for host {}",
                started.hostname
            ))
            .with_resource_id(started.job_id),
            Err(err) => self.reject("provision_host", Some(host_id), err),
        }
    }

    /// Starts installing the virtualization stack on an `Active` host.
    pub async fn setup_vm_host(&self, host_id: &str) -> ActionResponse {
        match self.runner.start(host_id, HostAction::SetupVmHost).await {
            Ok(started) => ActionResponse::success(format!(
                "VM host setup initiated for host {}",
                started.hostname
            ))
            .with_resource_id(started.job_id),
            Err(err) => self.reject("setup_vm_host", Some(host_id), err),
        }
    }

    pub async fn set_maintenance_mode(&self, host_id: &str, maintenance: bool) -> ActionResponse {
        match self.try_set_maintenance(host_id, maintenance).await {
            Ok(host) if maintenance => {
                ActionResponse::success(format!("Host {} placed in maintenance mode", host.hostname))
            }
            Ok(host) => ActionResponse::success(format!("Host {} is now active", host.hostname)),
            Err(err) => self.reject("set_maintenance_mode", Some(host_id), err),
        }
    }

    async fn try_set_maintenance(
        &self,
        host_id: &str,
        maintenance: bool,
    ) -> Result<Host, OrchestratorError> {
        let _guard = self.locks.lock(&host_id.to_string()).await;

        let host = self.find_host(host_id)?;
        let action = HostAction::SetMaintenance(maintenance);
        let next = match guard::evaluate(host.status, host.is_vm_host, action)? {
            Transition::Immediate { next } => next,
            transition => {
                return Err(OrchestratorError::UnexpectedTransition { action, transition })
            }
        };
        let host = self.registry.update_host(host_id, |host| {
            host.status = next;
            host.clone()
        })?;
        info!(host_id, status = %next, "maintenance mode changed");
        Ok(host)
    }

    /// Accepts a VM request; the VM record reports the final outcome.
    pub async fn create_virtual_machine(
        &self,
        host_id: &str,
        request: &CreateVmRequest,
    ) -> ActionResponse {
        match self.provisioner.create(host_id, request).await {
            Ok(accepted) => ActionResponse::success(format!(
                "Virtual machine creation initiated on host {}",
                accepted.hostname
            ))
            .with_resource_id(accepted.vm.id),
            Err(rejection) => self.reject("create_virtual_machine", Some(host_id), rejection.into()),
        }
    }

    /// Answers a VM request whose body could not be decoded.
    ///
    /// Unknown and ineligible hosts are reported as such before the body.
    pub async fn reject_malformed_vm_request(&self, host_id: &str, detail: &str) -> ActionResponse {
        let rejection = self.provisioner.reject_malformed(host_id, detail).await;
        self.reject("create_virtual_machine", Some(host_id), rejection.into())
    }

    /// Probes the host and records the result in its health fields.
    ///
    /// Lifecycle status is never changed.
    pub async fn check_health(&self, host_id: &str) -> ActionResponse {
        match self.try_check_health(host_id).await {
            Ok(host) => ActionResponse::success(format!("Host {} is healthy", host.hostname)),
            Err(err) => self.reject("check_health", Some(host_id), err),
        }
    }

    async fn try_check_health(&self, host_id: &str) -> Result<Host, OrchestratorError> {
        let host = {
            let _guard = self.locks.lock(&host_id.to_string()).await;
            let host = self.find_host(host_id)?;
            guard::evaluate(host.status, host.is_vm_host, HostAction::CheckHealth)?;
            host
        };

        let capability = Arc::clone(&self.capability);
        let target = host.target();
        let probe = run_bounded(self.health_check_timeout, async move {
            capability.ping(&target).await
        })
        .await;

        let health = if probe.is_ok() {
            HealthStatus::Healthy
        } else {
            HealthStatus::Unhealthy
        };
        {
            let _guard = self.locks.lock(&host_id.to_string()).await;
            self.registry.update_host(host_id, |host| {
                host.health = health;
                host.last_health_check = Some(Utc::now());
            })?;
        }

        match probe {
            Ok(()) => Ok(host),
            Err(reason) => Err(OrchestratorError::Unhealthy {
                hostname: host.hostname,
                reason,
            }),
        }
    }

    /// Health-checks every `Active` and `Maintenance` host concurrently.
    pub async fn check_all_health(&self) -> HealthSweep {
        let in_service: Vec<String> = self
            .registry
            .hosts()
            .into_iter()
            .filter(|host| matches!(host.status, HostStatus::Active | HostStatus::Maintenance))
            .map(|host| host.id)
            .collect();

        let results = join_all(in_service.iter().map(|id| self.check_health(id))).await;
        let unhealthy = in_service
            .iter()
            .zip(results)
            .filter(|(_, response)| !response.is_success())
            .map(|(id, _)| id.clone())
            .collect();

        HealthSweep {
            checked: in_service.len(),
            unhealthy,
        }
    }

    pub fn host(&self, host_id: &str) -> Option<HostInfo> {
        self.registry.host(host_id).map(|host| self.host_info(&host))
    }

    pub fn hosts(&self) -> Vec<HostInfo> {
        self.registry
            .hosts()
            .iter()
            .map(|host| self.host_info(host))
            .collect()
    }

    pub fn vm(&self, vm_id: &str) -> Option<VmInfo> {
        self.registry.vm(vm_id).map(|vm| vm.to_info())
    }

    /// Returns `None` when the host is unknown.
    pub fn vms_on_host(&self, host_id: &str) -> Option<Vec<VmInfo>> {
        self.registry.host(host_id)?;
        Some(
            self.registry
                .vms_on_host(host_id)
                .iter()
                .map(|vm| vm.to_info())
                .collect(),
        )
    }

    /// Reservations on a host with usage percentages; `None` for unknown hosts.
    pub fn host_usage(&self, host_id: &str) -> Option<HostUsage> {
        let host = self.registry.host(host_id)?;
        let mut allocations: Vec<ResourceAllocation> = self
            .capacity
            .allocations(host_id)
            .into_iter()
            .filter_map(|(vm_id, resources)| {
                let vm = self.registry.vm(&vm_id)?;
                Some(ResourceAllocation {
                    vm_id,
                    vm_name: vm.spec.name,
                    resources,
                    allocated_at: vm.created_at,
                })
            })
            .collect();
        allocations.sort_by(|a, b| {
            a.allocated_at
                .cmp(&b.allocated_at)
                .then_with(|| a.vm_id.cmp(&b.vm_id))
        });
        Some(HostUsage::new(host.id, host.capacity, allocations))
    }

    /// Jobs dispatched but not yet resolved.
    pub fn jobs(&self) -> Vec<JobInfo> {
        self.jobs.list()
    }

    /// Blocks until registry changes have reached the state file.
    pub fn flush_state(&self) {
        self.registry.flush();
    }

    fn host_info(&self, host: &Host) -> HostInfo {
        host.to_info(self.capacity.available(host))
    }

    fn find_host(&self, host_id: &str) -> Result<Host, OrchestratorError> {
        self.registry.host(host_id).ok_or_else(|| {
            RegistryError::HostNotFound {
                host_id: host_id.to_string(),
            }
            .into()
        })
    }

    fn reject(
        &self,
        operation: &str,
        host_id: Option<&str>,
        err: OrchestratorError,
    ) -> ActionResponse {
        warn!(operation, host_id, reason = ?err.reason(), "operation rejected: {err}");
        err.into()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use api_types::ActionStatus;
    use api_types::HostCapacity;
    use api_types::RejectionReason;
    use api_types::VmStatus;
    use similar_asserts::assert_eq;
    use tokio::sync::Notify;

    use super::*;
    use crate::domain::mock::Operation;
    use crate::domain::mock::Script;
    use crate::domain::mock::ScriptedCapability;

    fn config() -> OrchestratorConfig {
        OrchestratorConfig {
            runner: RunnerConfig {
                provision_timeout: Duration::from_millis(300),
                vm_host_setup_timeout: Duration::from_millis(300),
                vm_create_timeout: Duration::from_millis(300),
                max_attempts: 1,
                retry_backoff: Duration::from_millis(10),
            },
            health_check_timeout: Duration::from_millis(300),
        }
    }

    fn orchestrator(capability: Arc<ScriptedCapability>) -> Orchestrator {
        Orchestrator::new(Arc::new(HostRegistry::new()), capability, config())
    }

    fn register(orchestrator: &Orchestrator, id: &str, ip: &str) {
        let response = orchestrator.register_host(RegisterHostRequest {
            id: Some(id.to_string()),
            hostname: format!("{id}.lab"),
            ip: ip.parse().unwrap(),
            ssh_user: "root".to_string(),
            ssh_port: 22,
            capacity: HostCapacity::new(16, 65536, 1000),
            metadata: Default::default(),
        });
        assert!(response.is_success(), "{response:?}");
    }

    async fn wait_for_status(orchestrator: &Orchestrator, host_id: &str, status: HostStatus) -> HostInfo {
        for _ in 0..200 {
            let host = orchestrator.host(host_id).unwrap();
            if host.status == status {
                return host;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("host {host_id} never reached {status}");
    }

    async fn wait_for_vm(orchestrator: &Orchestrator, vm_id: &str, status: VmStatus) -> VmInfo {
        for _ in 0..200 {
            let vm = orchestrator.vm(vm_id).unwrap();
            if vm.status == status {
                return vm;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("vm {vm_id} never reached {status}");
    }

    #[test_log::test(tokio::test)]
    async fn host_goes_from_pending_to_vm_host() {
        let orchestrator = orchestrator(Arc::new(ScriptedCapability::new()));
        register(&orchestrator, "h1", "10.0.0.1");

        let response = orchestrator.provision_host("h1").await;
        assert_eq!(response.status, ActionStatus::Success);
        assert_eq!(
            response.message.as_deref(),
            Some("Provisioning initiated for host h1.lab")
        );
        wait_for_status(&orchestrator, "h1", HostStatus::Active).await;

        let response = orchestrator.setup_vm_host("h1").await;
        assert!(response.is_success());
        assert_eq!(
            orchestrator.host("h1").unwrap().status,
            HostStatus::SettingUpVmHost
        );
        let host = wait_for_status(&orchestrator, "h1", HostStatus::Active).await;
        assert!(host.is_vm_host);
        assert_eq!(host.last_error, None);
        assert!(orchestrator.jobs().is_empty());
    }

    #[tokio::test]
    async fn provisioning_an_active_host_is_an_invalid_transition() {
        let orchestrator = orchestrator(Arc::new(ScriptedCapability::new()));
        register(&orchestrator, "h1", "10.0.0.1");
        orchestrator.provision_host("h1").await;
        wait_for_status(&orchestrator, "h1", HostStatus::Active).await;

        let response = orchestrator.provision_host("h1").await;

        assert_eq!(response.status, ActionStatus::Failure);
        assert_eq!(response.reason, Some(RejectionReason::InvalidTransition));
        let message = response.message.unwrap();
        assert!(message.contains("Active"), "{message}");
        assert!(message.contains("provision_host"), "{message}");
        assert_eq!(orchestrator.host("h1").unwrap().status, HostStatus::Active);
    }

    #[tokio::test]
    async fn failed_provisioning_can_be_retried() {
        let capability = Arc::new(
            ScriptedCapability::new().with(Operation::Provision, Script::Fail("pxe boot failed".into())),
        );
        let orchestrator = orchestrator(capability.clone());
        register(&orchestrator, "h1", "10.0.0.1");

        orchestrator.provision_host("h1").await;
        let host = wait_for_status(&orchestrator, "h1", HostStatus::Error).await;
        assert!(host.last_error.unwrap().contains("pxe boot failed"));

        capability.set(Operation::Provision, Script::Succeed);
        assert!(orchestrator.provision_host("h1").await.is_success());
        let host = wait_for_status(&orchestrator, "h1", HostStatus::Active).await;
        assert_eq!(host.last_error, None);
        assert_eq!(capability.calls(Operation::Provision), 2);
    }

    #[tokio::test]
    async fn failed_vm_host_setup_keeps_host_active() {
        let capability = Arc::new(
            ScriptedCapability::new()
                .with(Operation::InstallVirtualization, Script::Fail("kvm unavailable".into())),
        );
        let orchestrator = orchestrator(capability);
        register(&orchestrator, "h1", "10.0.0.1");
        orchestrator.provision_host("h1").await;
        wait_for_status(&orchestrator, "h1", HostStatus::Active).await;

        assert!(orchestrator.setup_vm_host("h1").await.is_success());
        for _ in 0..200 {
            if orchestrator.jobs().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let host = orchestrator.host("h1").unwrap();
        assert_eq!(host.status, HostStatus::Active);
        assert!(!host.is_vm_host);
        assert!(host.last_error.unwrap().contains("kvm unavailable"));
    }

    #[tokio::test]
    async fn maintenance_round_trip() {
        let orchestrator = orchestrator(Arc::new(ScriptedCapability::new()));
        register(&orchestrator, "h1", "10.0.0.1");

        let response = orchestrator.set_maintenance_mode("h1", true).await;
        assert_eq!(response.reason, Some(RejectionReason::InvalidTransition));

        orchestrator.provision_host("h1").await;
        wait_for_status(&orchestrator, "h1", HostStatus::Active).await;

        let response = orchestrator.set_maintenance_mode("h1", true).await;
        assert_eq!(
            response.message.as_deref(),
            Some("Host h1.lab placed in maintenance mode")
        );
        assert_eq!(orchestrator.host("h1").unwrap().status, HostStatus::Maintenance);

        let response = orchestrator.set_maintenance_mode("h1", true).await;
        assert_eq!(response.status, ActionStatus::Failure);

        let response = orchestrator.set_maintenance_mode("h1", false).await;
        assert_eq!(response.message.as_deref(), Some("Host h1.lab is now active"));
        assert_eq!(orchestrator.host("h1").unwrap().status, HostStatus::Active);
    }

    #[tokio::test]
    async fn maintenance_round_trip_keeps_vm_host_flag() {
        let orchestrator = orchestrator(Arc::new(ScriptedCapability::new()));
        register(&orchestrator, "h1", "10.0.0.1");
        orchestrator.provision_host("h1").await;
        wait_for_status(&orchestrator, "h1", HostStatus::Active).await;
        orchestrator.setup_vm_host("h1").await;
        let before = wait_for_status(&orchestrator, "h1", HostStatus::Active).await;
        assert!(before.is_vm_host);

        let enter = orchestrator.set_maintenance_mode("h1", true).await;
        let during = orchestrator.host("h1").unwrap();
        let leave = orchestrator.set_maintenance_mode("h1", false).await;

        assert!(enter.is_success(), "{enter:?}");
        assert!(leave.is_success(), "{leave:?}");
        assert_eq!(during.status, HostStatus::Maintenance);
        assert!(during.is_vm_host, "Entering maintenance must keep the VM host flag");
        let after = orchestrator.host("h1").unwrap();
        assert_eq!(after.status, HostStatus::Active);
        assert!(after.is_vm_host, "Leaving maintenance must keep the VM host flag");
        assert_eq!(after.capacity, before.capacity);
    }

    #[tokio::test]
    async fn concurrent_provision_requests_dispatch_one_job() {
        let gate = Arc::new(Notify::new());
        let capability = Arc::new(
            ScriptedCapability::new().with(Operation::Provision, Script::WaitFor(gate.clone())),
        );
        let config = OrchestratorConfig {
            runner: RunnerConfig {
                provision_timeout: Duration::from_secs(10),
                ..config().runner
            },
            ..config()
        };
        let orchestrator = Arc::new(Orchestrator::new(
            Arc::new(HostRegistry::new()),
            capability.clone(),
            config,
        ));
        register(&orchestrator, "h1", "10.0.0.1");

        let mut handles = Vec::new();
        for _ in 0..16 {
            let orchestrator = Arc::clone(&orchestrator);
            handles.push(tokio::spawn(async move { orchestrator.provision_host("h1").await }));
        }
        let mut successes = 0;
        let mut conflicts = 0;
        for handle in handles {
            let response = handle.await.unwrap();
            if response.is_success() {
                successes += 1;
            } else {
                assert_eq!(response.reason, Some(RejectionReason::ConcurrencyConflict));
                conflicts += 1;
            }
        }

        assert_eq!(successes, 1);
        assert_eq!(conflicts, 15);
        assert_eq!(orchestrator.jobs().len(), 1);

        gate.notify_one();
        wait_for_status(&orchestrator, "h1", HostStatus::Active).await;
        assert_eq!(capability.calls(Operation::Provision), 1);
    }

    #[tokio::test]
    async fn transient_host_rejects_every_operation_as_conflict() {
        let capability = Arc::new(ScriptedCapability::new().with(Operation::Provision, Script::Hang));
        let orchestrator = orchestrator(capability);
        register(&orchestrator, "h1", "10.0.0.1");
        orchestrator.provision_host("h1").await;

        for response in [
            orchestrator.setup_vm_host("h1").await,
            orchestrator.set_maintenance_mode("h1", true).await,
            orchestrator.check_health("h1").await,
        ] {
            assert_eq!(response.reason, Some(RejectionReason::ConcurrencyConflict));
        }
        let response = orchestrator
            .create_virtual_machine("h1", &CreateVmRequest::new("web", 2, 2048, 20, "ubuntu22.04"))
            .await;
        assert_eq!(response.reason, Some(RejectionReason::HostNotEligible));

        let host = wait_for_status(&orchestrator, "h1", HostStatus::Error).await;
        assert!(host.last_error.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn vm_on_non_vm_host_is_not_eligible() {
        let orchestrator = orchestrator(Arc::new(ScriptedCapability::new()));
        register(&orchestrator, "h1", "10.0.0.1");
        orchestrator.provision_host("h1").await;
        wait_for_status(&orchestrator, "h1", HostStatus::Active).await;

        let response = orchestrator
            .create_virtual_machine("h1", &CreateVmRequest::new("", 0, 0, 0, "beos"))
            .await;

        assert_eq!(response.reason, Some(RejectionReason::HostNotEligible));
        assert_eq!(orchestrator.vms_on_host("h1"), Some(Vec::new()));
    }

    #[tokio::test]
    async fn vm_creation_runs_on_vm_host() {
        let orchestrator = orchestrator(Arc::new(ScriptedCapability::new()));
        register(&orchestrator, "h1", "10.0.0.1");
        orchestrator.provision_host("h1").await;
        wait_for_status(&orchestrator, "h1", HostStatus::Active).await;
        orchestrator.setup_vm_host("h1").await;
        for _ in 0..200 {
            if orchestrator.host("h1").unwrap().is_vm_host {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let response = orchestrator
            .create_virtual_machine("h1", &CreateVmRequest::new("web-01", 4, 8192, 50, "debian11"))
            .await;
        assert_eq!(
            response.message.as_deref(),
            Some("Virtual machine creation initiated on host h1.lab")
        );
        let vm_id = response.resource_id.unwrap();
        let vm = wait_for_vm(&orchestrator, &vm_id, VmStatus::Running).await;
        assert_eq!(vm.name, "web-01");
        assert_eq!(vm.host_id, "h1");

        let host = orchestrator.host("h1").unwrap();
        assert_eq!(host.status, HostStatus::Active);
        assert_eq!(host.available, HostCapacity::new(12, 57344, 950));

        let response = orchestrator
            .create_virtual_machine("h1", &CreateVmRequest::new("web-01", 1, 512, 5, "debian11"))
            .await;
        assert_eq!(response.reason, Some(RejectionReason::NameConflict));

        let response = orchestrator
            .create_virtual_machine("h1", &CreateVmRequest::new("huge", 64, 512, 5, "debian11"))
            .await;
        assert_eq!(response.reason, Some(RejectionReason::CapacityExceeded));
    }

    #[tokio::test]
    async fn host_usage_lists_live_reservations() {
        let capability = Arc::new(
            ScriptedCapability::new().with(Operation::CreateVm, Script::Fail("no bridge".into())),
        );
        let orchestrator = orchestrator(capability.clone());
        register(&orchestrator, "h1", "10.0.0.1");
        orchestrator.provision_host("h1").await;
        wait_for_status(&orchestrator, "h1", HostStatus::Active).await;
        orchestrator.setup_vm_host("h1").await;
        wait_for_status(&orchestrator, "h1", HostStatus::Active).await;

        let failed = orchestrator
            .create_virtual_machine("h1", &CreateVmRequest::new("broken", 8, 8192, 100, "ubuntu22.04"))
            .await;
        wait_for_vm(&orchestrator, failed.resource_id.as_deref().unwrap(), VmStatus::Failed).await;
        capability.set(Operation::CreateVm, Script::Succeed);
        let created = orchestrator
            .create_virtual_machine("h1", &CreateVmRequest::new("web", 4, 16384, 250, "ubuntu22.04"))
            .await;
        let vm_id = created.resource_id.unwrap();
        wait_for_vm(&orchestrator, &vm_id, VmStatus::Running).await;

        let usage = orchestrator.host_usage("h1").expect("host should exist");

        assert_eq!(usage.allocations.len(), 1, "Failed guests hold no resources");
        assert_eq!(usage.allocations[0].vm_id, vm_id);
        assert_eq!(usage.allocations[0].vm_name, "web");
        assert_eq!(usage.allocated, HostCapacity::new(4, 16384, 250));
        assert_eq!(usage.cpu_percent, 25.0);
        assert_eq!(usage.memory_percent, 25.0);
        assert_eq!(usage.disk_percent, 25.0);
        assert_eq!(orchestrator.host_usage("nope"), None);
    }

    #[tokio::test]
    async fn unknown_hosts_are_reported() {
        let orchestrator = orchestrator(Arc::new(ScriptedCapability::new()));
        for response in [
            orchestrator.provision_host("ghost").await,
            orchestrator.setup_vm_host("ghost").await,
            orchestrator.set_maintenance_mode("ghost", true).await,
            orchestrator.check_health("ghost").await,
            orchestrator
                .create_virtual_machine("ghost", &CreateVmRequest::new("a", 1, 1, 1, "centos8"))
                .await,
        ] {
            assert_eq!(response.reason, Some(RejectionReason::HostNotFound));
        }
        assert_eq!(orchestrator.vms_on_host("ghost"), None);
    }

    #[tokio::test]
    async fn health_checks_record_probe_results() {
        let capability = Arc::new(ScriptedCapability::new());
        let orchestrator = orchestrator(capability.clone());
        register(&orchestrator, "h1", "10.0.0.1");

        let response = orchestrator.check_health("h1").await;
        assert!(response.is_success());
        let host = orchestrator.host("h1").unwrap();
        assert_eq!(host.health, HealthStatus::Healthy);
        assert!(host.last_health_check.is_some());
        assert_eq!(host.status, HostStatus::Pending);

        capability.set(Operation::Ping, Script::Hang);
        let response = orchestrator.check_health("h1").await;
        assert_eq!(response.reason, Some(RejectionReason::Unhealthy));
        assert_eq!(orchestrator.host("h1").unwrap().health, HealthStatus::Unhealthy);
    }

    #[tokio::test]
    async fn health_sweep_only_covers_in_service_hosts() {
        let capability = Arc::new(ScriptedCapability::new());
        let orchestrator = orchestrator(capability.clone());
        register(&orchestrator, "h1", "10.0.0.1");
        register(&orchestrator, "h2", "10.0.0.2");
        orchestrator.provision_host("h1").await;
        wait_for_status(&orchestrator, "h1", HostStatus::Active).await;

        capability.set(Operation::Ping, Script::Fail("icmp timeout".into()));
        let sweep = orchestrator.check_all_health().await;

        assert_eq!(
            sweep,
            HealthSweep {
                checked: 1,
                unhealthy: vec!["h1".to_string()],
            }
        );
        assert_eq!(orchestrator.host("h2").unwrap().health, HealthStatus::Unknown);
    }

    #[tokio::test]
    async fn duplicate_registration_is_rejected() {
        let orchestrator = orchestrator(Arc::new(ScriptedCapability::new()));
        register(&orchestrator, "h1", "10.0.0.1");

        let response = orchestrator.register_host(RegisterHostRequest {
            id: None,
            hostname: "other".into(),
            ip: "10.0.0.1".parse().unwrap(),
            ssh_user: "root".into(),
            ssh_port: 22,
            capacity: Default::default(),
            metadata: Default::default(),
        });
        assert_eq!(response.reason, Some(RejectionReason::DuplicateHost));
        assert_eq!(orchestrator.hosts().len(), 1);
    }
}
