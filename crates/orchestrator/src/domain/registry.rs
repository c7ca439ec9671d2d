//! Host registry: the single source of truth for host and VM records

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;

use api_types::HostStatus;
use api_types::RegisterHostRequest;
use api_types::RejectionReason;
use api_types::VmStatus;
use chrono::DateTime;
use chrono::Utc;
use dashmap::DashMap;
use error_stack::Report;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;
use tracing::info;
use tracing::warn;

use super::host::Host;
use super::host::VirtualMachine;
use super::snapshot_writer::SnapshotWriter;
use super::traits::PersistenceError;
use super::traits::SnapshotStore;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("host {host_id} not found")]
    HostNotFound { host_id: String },
    #[error("virtual machine {vm_id} not found")]
    VmNotFound { vm_id: String },
    #[error("a host with id {host_id} is already registered")]
    DuplicateId { host_id: String },
    #[error("IP address {ip} is already registered to host {host_id}")]
    DuplicateIp { ip: String, host_id: String },
    #[error("invalid registration: {message}")]
    InvalidRegistration { message: String },
}

impl RegistryError {
    pub fn reason(&self) -> RejectionReason {
        match self {
            Self::HostNotFound { .. } => RejectionReason::HostNotFound,
            Self::VmNotFound { .. } => RejectionReason::Internal,
            Self::DuplicateId { .. } | Self::DuplicateIp { .. } => RejectionReason::DuplicateHost,
            Self::InvalidRegistration { .. } => RejectionReason::InvalidParameters,
        }
    }
}

/// Everything the registry knows, in a serializable form
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RegistrySnapshot {
    pub hosts: Vec<Host>,
    #[serde(default)]
    pub vms: Vec<VirtualMachine>,
}

impl RegistrySnapshot {
    /// Settles records a previous process left in a transient state.
    ///
    /// A job that was running when the process stopped will never report
    /// back, so its host or VM is moved to the state a failed job would have
    /// produced. Returns the number of records changed.
    pub fn recover_interrupted(&mut self, now: DateTime<Utc>) -> usize {
        let mut recovered = 0;
        for host in &mut self.hosts {
            let (status, message) = match host.status {
                HostStatus::Provisioning => (
                    HostStatus::Error,
                    "provisioning failed: interrupted by orchestrator restart",
                ),
                HostStatus::SettingUpVmHost => (
                    HostStatus::Active,
                    "VM host setup failed: interrupted by orchestrator restart",
                ),
                _ => continue,
            };
            warn!(host_id = %host.id, from = %host.status, to = %status, "recovering interrupted host");
            host.status = status;
            host.last_error = Some(message.to_string());
            host.updated_at = now;
            recovered += 1;
        }
        for vm in &mut self.vms {
            if vm.status != VmStatus::Creating {
                continue;
            }
            warn!(vm_id = %vm.id, host_id = %vm.host_id, "recovering interrupted virtual machine");
            vm.status = VmStatus::Failed;
            vm.last_error =
                Some("VM creation failed: interrupted by orchestrator restart".to_string());
            vm.updated_at = now;
            recovered += 1;
        }
        recovered
    }
}

/// Concurrent store of hosts and their virtual machines.
///
/// Mutations are expected to happen while the caller holds the host's keyed
/// lock; the registry itself only guarantees that each single update is
/// atomic. With a [`SnapshotStore`] attached, every mutation queues a full
/// snapshot for the background [`SnapshotWriter`].
pub struct HostRegistry {
    hosts: DashMap<String, Host>,
    vms: DashMap<String, VirtualMachine>,
    writer: Option<SnapshotWriter>,
    /// Serializes registrations so id/IP uniqueness checks are atomic
    registration: Mutex<()>,
    /// Keeps snapshots reaching the writer in mutation order
    persist: Mutex<()>,
}

impl Default for HostRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl HostRegistry {
    /// In-memory registry without persistence.
    pub fn new() -> Self {
        Self {
            hosts: DashMap::new(),
            vms: DashMap::new(),
            writer: None,
            registration: Mutex::new(()),
            persist: Mutex::new(()),
        }
    }

    /// Loads the registry from `store`, settling interrupted records.
    pub fn with_store(store: Arc<dyn SnapshotStore>) -> Result<Self, Report<PersistenceError>> {
        let mut snapshot = store.load()?.unwrap_or_default();
        let recovered = snapshot.recover_interrupted(Utc::now());

        let registry = Self {
            writer: Some(SnapshotWriter::spawn(store)?),
            ..Self::new()
        };
        for host in snapshot.hosts {
            registry.hosts.insert(host.id.clone(), host);
        }
        for vm in snapshot.vms {
            registry.vms.insert(vm.id.clone(), vm);
        }
        info!(
            hosts = registry.hosts.len(),
            vms = registry.vms.len(),
            recovered,
            "host registry loaded"
        );
        if recovered > 0 {
            registry.persist();
        }
        Ok(registry)
    }

    pub fn register(&self, request: RegisterHostRequest) -> Result<Host, RegistryError> {
        validate_registration(&request)?;

        let _registration = self
            .registration
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        let id = match request.id.as_deref().map(str::trim) {
            Some(id) => id.to_string(),
            None => uuid::Uuid::new_v4().to_string(),
        };
        if self.hosts.contains_key(&id) {
            return Err(RegistryError::DuplicateId { host_id: id });
        }
        if let Some(existing) = self.hosts.iter().find(|host| host.ip == request.ip) {
            return Err(RegistryError::DuplicateIp {
                ip: request.ip.to_string(),
                host_id: existing.id.clone(),
            });
        }

        let host = Host::new(id.clone(), request, Utc::now());
        self.hosts.insert(id, host.clone());
        info!(host_id = %host.id, hostname = %host.hostname, ip = %host.ip, "host registered");
        self.persist();
        Ok(host)
    }

    pub fn host(&self, host_id: &str) -> Option<Host> {
        self.hosts.get(host_id).map(|host| host.value().clone())
    }

    /// All hosts, oldest registration first.
    pub fn hosts(&self) -> Vec<Host> {
        let mut hosts: Vec<Host> = self.hosts.iter().map(|h| h.value().clone()).collect();
        hosts.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        hosts
    }

    /// Applies `update` to the host and stamps `updated_at`.
    pub fn update_host<R>(
        &self,
        host_id: &str,
        update: impl FnOnce(&mut Host) -> R,
    ) -> Result<R, RegistryError> {
        let result = {
            let mut host = self
                .hosts
                .get_mut(host_id)
                .ok_or_else(|| RegistryError::HostNotFound {
                    host_id: host_id.to_string(),
                })?;
            let result = update(&mut host);
            host.updated_at = Utc::now();
            result
        };
        self.persist();
        Ok(result)
    }

    pub fn insert_vm(&self, vm: VirtualMachine) -> Result<(), RegistryError> {
        if !self.hosts.contains_key(&vm.host_id) {
            return Err(RegistryError::HostNotFound {
                host_id: vm.host_id.clone(),
            });
        }
        self.vms.insert(vm.id.clone(), vm);
        self.persist();
        Ok(())
    }

    pub fn update_vm<R>(
        &self,
        vm_id: &str,
        update: impl FnOnce(&mut VirtualMachine) -> R,
    ) -> Result<R, RegistryError> {
        let result = {
            let mut vm = self
                .vms
                .get_mut(vm_id)
                .ok_or_else(|| RegistryError::VmNotFound {
                    vm_id: vm_id.to_string(),
                })?;
            let result = update(&mut vm);
            vm.updated_at = Utc::now();
            result
        };
        self.persist();
        Ok(result)
    }

    pub fn vm(&self, vm_id: &str) -> Option<VirtualMachine> {
        self.vms.get(vm_id).map(|vm| vm.value().clone())
    }

    /// Virtual machines placed on `host_id`, oldest first.
    pub fn vms_on_host(&self, host_id: &str) -> Vec<VirtualMachine> {
        let mut vms: Vec<VirtualMachine> = self
            .vms
            .iter()
            .filter(|vm| vm.host_id == host_id)
            .map(|vm| vm.value().clone())
            .collect();
        vms.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        vms
    }

    pub fn all_vms(&self) -> Vec<VirtualMachine> {
        self.vms.iter().map(|vm| vm.value().clone()).collect()
    }

    pub fn snapshot(&self) -> RegistrySnapshot {
        RegistrySnapshot {
            hosts: self.hosts(),
            vms: {
                let mut vms = self.all_vms();
                vms.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
                vms
            },
        }
    }

    /// Blocks until queued snapshots have reached the store.
    pub fn flush(&self) {
        if let Some(writer) = &self.writer {
            writer.flush();
        }
    }

    /// Queues a snapshot for the attached store.
    ///
    /// Write failures are logged by the writer: the in-memory registry stays
    /// authoritative and the next mutation retries the write.
    fn persist(&self) {
        let Some(writer) = &self.writer else {
            return;
        };
        let _persist = self.persist.lock().unwrap_or_else(PoisonError::into_inner);
        writer.submit(self.snapshot());
    }
}

fn validate_registration(request: &RegisterHostRequest) -> Result<(), RegistryError> {
    let invalid = |message: &str| RegistryError::InvalidRegistration {
        message: message.to_string(),
    };
    if request.hostname.trim().is_empty() {
        return Err(invalid("hostname must not be empty"));
    }
    if let Some(id) = &request.id {
        if id.trim().is_empty() || id.contains('/') {
            return Err(invalid("host id must be non-empty and must not contain '/'"));
        }
    }
    if request.ssh_user.trim().is_empty() {
        return Err(invalid("ssh_user must not be empty"));
    }
    if request.ssh_port == 0 {
        return Err(invalid("ssh_port must be greater than zero"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use api_types::HostCapacity;
    use similar_asserts::assert_eq;

    use super::*;
    use crate::domain::host::VmSpec;
    use crate::domain::mock::MemorySnapshotStore;

    fn request(id: Option<&str>, hostname: &str, ip: &str) -> RegisterHostRequest {
        RegisterHostRequest {
            id: id.map(str::to_string),
            hostname: hostname.to_string(),
            ip: ip.parse().unwrap(),
            ssh_user: "root".to_string(),
            ssh_port: 22,
            capacity: HostCapacity::new(8, 16384, 200),
            metadata: Default::default(),
        }
    }

    fn vm_spec(name: &str) -> VmSpec {
        VmSpec {
            name: name.to_string(),
            vcpus: 2,
            memory_mb: 2048,
            disk_gb: 20,
            os_variant: Default::default(),
        }
    }

    #[test]
    fn registered_hosts_start_pending() {
        let registry = HostRegistry::new();

        let host = registry
            .register(request(Some("h1"), "node-1", "10.0.0.1"))
            .unwrap();

        assert_eq!(host.status, HostStatus::Pending);
        assert!(!host.is_vm_host);
        assert_eq!(host.last_error, None);
        assert_eq!(registry.host("h1"), Some(host));
    }

    #[test]
    fn generated_ids_are_unique() {
        let registry = HostRegistry::new();
        let a = registry.register(request(None, "a", "10.0.0.1")).unwrap();
        let b = registry.register(request(None, "b", "10.0.0.2")).unwrap();
        assert_ne!(a.id, b.id);
        assert_eq!(registry.hosts().len(), 2);
    }

    #[test]
    fn duplicate_id_and_ip_are_rejected() {
        let registry = HostRegistry::new();
        registry
            .register(request(Some("h1"), "node-1", "10.0.0.1"))
            .unwrap();

        let err = registry
            .register(request(Some("h1"), "node-2", "10.0.0.2"))
            .unwrap_err();
        assert_eq!(
            err,
            RegistryError::DuplicateId {
                host_id: "h1".into()
            }
        );

        let err = registry
            .register(request(Some("h2"), "node-2", "10.0.0.1"))
            .unwrap_err();
        assert_eq!(err.reason(), RejectionReason::DuplicateHost);
        assert_eq!(
            err.to_string(),
            "IP address 10.0.0.1 is already registered to host h1"
        );
    }

    #[test]
    fn blank_hostname_is_rejected() {
        let registry = HostRegistry::new();
        let err = registry
            .register(request(None, "   ", "10.0.0.1"))
            .unwrap_err();
        assert_eq!(err.reason(), RejectionReason::InvalidParameters);
        assert!(registry.hosts().is_empty());
    }

    #[test]
    fn update_host_applies_and_stamps() {
        let registry = HostRegistry::new();
        let before = registry
            .register(request(Some("h1"), "node-1", "10.0.0.1"))
            .unwrap();

        let status = registry
            .update_host("h1", |host| {
                host.status = HostStatus::Provisioning;
                host.status
            })
            .unwrap();

        assert_eq!(status, HostStatus::Provisioning);
        let after = registry.host("h1").unwrap();
        assert_eq!(after.status, HostStatus::Provisioning);
        assert!(after.updated_at >= before.updated_at);

        assert_eq!(
            registry.update_host("missing", |_| ()),
            Err(RegistryError::HostNotFound {
                host_id: "missing".into()
            })
        );
    }

    #[test]
    fn vms_are_listed_per_host() {
        let registry = HostRegistry::new();
        registry
            .register(request(Some("h1"), "node-1", "10.0.0.1"))
            .unwrap();
        registry
            .register(request(Some("h2"), "node-2", "10.0.0.2"))
            .unwrap();

        let now = Utc::now();
        registry
            .insert_vm(VirtualMachine::creating("v1".into(), "h1".into(), vm_spec("a"), now))
            .unwrap();
        registry
            .insert_vm(VirtualMachine::creating("v2".into(), "h2".into(), vm_spec("b"), now))
            .unwrap();

        let on_h1 = registry.vms_on_host("h1");
        assert_eq!(on_h1.len(), 1);
        assert_eq!(on_h1[0].id, "v1");

        let orphan = VirtualMachine::creating("v3".into(), "nope".into(), vm_spec("c"), now);
        assert!(matches!(
            registry.insert_vm(orphan),
            Err(RegistryError::HostNotFound { .. })
        ));

        registry
            .update_vm("v1", |vm| vm.status = VmStatus::Running)
            .unwrap();
        assert_eq!(registry.vm("v1").unwrap().status, VmStatus::Running);
    }

    #[test]
    fn mutations_are_written_to_the_store() {
        let store = Arc::new(MemorySnapshotStore::default());
        let registry = HostRegistry::with_store(store.clone()).unwrap();

        registry
            .register(request(Some("h1"), "node-1", "10.0.0.1"))
            .unwrap();
        registry
            .update_host("h1", |host| host.status = HostStatus::Active)
            .unwrap();

        registry.flush();

        let saved = store.saved().expect("snapshot should be saved");
        assert!((1..=2).contains(&store.save_count()));
        assert_eq!(saved.hosts.len(), 1);
        assert_eq!(saved.hosts[0].status, HostStatus::Active);
    }

    /// Store that cannot complete a save until the test releases it
    #[derive(Default)]
    struct StalledStore {
        inner: MemorySnapshotStore,
        gate: Mutex<()>,
    }

    impl SnapshotStore for StalledStore {
        fn load(&self) -> Result<Option<RegistrySnapshot>, Report<PersistenceError>> {
            self.inner.load()
        }

        fn save(&self, snapshot: &RegistrySnapshot) -> Result<(), Report<PersistenceError>> {
            let _gate = self.gate.lock().unwrap();
            self.inner.save(snapshot)
        }
    }

    #[test]
    fn mutations_do_not_wait_for_the_store() {
        let store = Arc::new(StalledStore::default());
        let registry = HostRegistry::with_store(store.clone()).unwrap();

        let gate = store.gate.lock().unwrap();
        for (id, ip) in [("h1", "10.0.0.1"), ("h2", "10.0.0.2"), ("h3", "10.0.0.3")] {
            registry.register(request(Some(id), id, ip)).unwrap();
        }
        registry
            .update_host("h2", |host| host.status = HostStatus::Maintenance)
            .unwrap();
        assert_eq!(store.inner.save_count(), 0, "nothing can be written yet");

        drop(gate);
        registry.flush();

        let saved = store.inner.saved().expect("snapshot should be saved");
        assert_eq!(saved.hosts.len(), 3);
        assert_eq!(saved.hosts[1].status, HostStatus::Maintenance);
        assert!(store.inner.save_count() <= 2);
    }

    #[test]
    fn reload_settles_interrupted_jobs() {
        let store = Arc::new(MemorySnapshotStore::default());
        {
            let registry = HostRegistry::with_store(store.clone()).unwrap();
            for (id, ip) in [("h1", "10.0.0.1"), ("h2", "10.0.0.2"), ("h3", "10.0.0.3")] {
                registry.register(request(Some(id), id, ip)).unwrap();
            }
            registry
                .update_host("h1", |h| h.status = HostStatus::Provisioning)
                .unwrap();
            registry
                .update_host("h2", |h| h.status = HostStatus::SettingUpVmHost)
                .unwrap();
            registry
                .update_host("h3", |h| {
                    h.status = HostStatus::Active;
                    h.is_vm_host = true;
                })
                .unwrap();
            registry
                .insert_vm(VirtualMachine::creating(
                    "v1".into(),
                    "h3".into(),
                    vm_spec("web"),
                    Utc::now(),
                ))
                .unwrap();
        }

        let registry = HostRegistry::with_store(store.clone()).unwrap();

        let h1 = registry.host("h1").unwrap();
        assert_eq!(h1.status, HostStatus::Error);
        assert!(h1.last_error.unwrap().contains("interrupted"));

        let h2 = registry.host("h2").unwrap();
        assert_eq!(h2.status, HostStatus::Active);
        assert!(!h2.is_vm_host);
        assert!(h2.last_error.is_some());

        assert_eq!(registry.host("h3").unwrap().status, HostStatus::Active);
        assert_eq!(registry.vm("v1").unwrap().status, VmStatus::Failed);

        registry.flush();
        let saved = store.saved().unwrap();
        assert!(saved.hosts.iter().all(|h| !h.status.is_transient()));
    }
}
