//! Test adapters implementing the domain traits
//!
//! Compiled into the library so integration tests and local demos can drive
//! the orchestrator without touching real machines.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;

use api_types::HostCapacity;
use async_trait::async_trait;
use error_stack::Report;
use tokio::sync::Notify;

use super::host::HostTarget;
use super::host::VmSpec;
use super::registry::RegistrySnapshot;
use super::traits::CapabilityError;
use super::traits::HostCapability;
use super::traits::PersistenceError;
use super::traits::ProvisionReport;
use super::traits::SnapshotStore;

/// Capability operations a script can be attached to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Provision,
    InstallVirtualization,
    CreateVm,
    Ping,
}

/// What a scripted operation does when called
#[derive(Debug, Clone)]
pub enum Script {
    Succeed,
    Fail(String),
    /// Never returns
    Hang,
    Panic(String),
    /// Fails the first `n` calls, then succeeds
    FailTimes(u32),
    /// Succeeds once the notify is triggered
    WaitFor(Arc<Notify>),
}

/// Capability whose behaviour is set per operation by the test
#[derive(Debug, Default)]
pub struct ScriptedCapability {
    scripts: Mutex<HashMap<Operation, Script>>,
    calls: Mutex<HashMap<Operation, u32>>,
    facts: Mutex<Option<HostCapacity>>,
}

impl ScriptedCapability {
    /// Every operation succeeds until told otherwise.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(self, operation: Operation, script: Script) -> Self {
        self.set(operation, script);
        self
    }

    pub fn with_facts(self, facts: HostCapacity) -> Self {
        *self.facts.lock().unwrap_or_else(PoisonError::into_inner) = Some(facts);
        self
    }

    pub fn set(&self, operation: Operation, script: Script) {
        self.scripts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(operation, script);
    }

    pub fn calls(&self, operation: Operation) -> u32 {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&operation)
            .copied()
            .unwrap_or_default()
    }

    async fn play(&self, operation: Operation) -> Result<(), Report<CapabilityError>> {
        let call = {
            let mut calls = self.calls.lock().unwrap_or_else(PoisonError::into_inner);
            let count = calls.entry(operation).or_default();
            *count += 1;
            *count
        };
        let script = self
            .scripts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&operation)
            .cloned()
            .unwrap_or(Script::Succeed);

        match script {
            Script::Succeed => Ok(()),
            Script::Fail(message) => Err(Report::new(CapabilityError::CommandFailed { message })),
            Script::Hang => std::future::pending().await,
            Script::Panic(message) => panic!("{message}"),
            Script::FailTimes(n) if call <= n => Err(Report::new(CapabilityError::CommandFailed {
                message: format!("scripted failure {call} of {n}"),
            })),
            Script::FailTimes(_) => Ok(()),
            Script::WaitFor(notify) => {
                notify.notified().await;
                Ok(())
            }
        }
    }
}

#[async_trait]
impl HostCapability for ScriptedCapability {
    async fn provision(&self, _host: &HostTarget) -> Result<ProvisionReport, Report<CapabilityError>> {
        self.play(Operation::Provision).await?;
        let facts = *self.facts.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(ProvisionReport { facts })
    }

    async fn install_virtualization(&self, _host: &HostTarget) -> Result<(), Report<CapabilityError>> {
        self.play(Operation::InstallVirtualization).await
    }

    async fn create_vm(&self, _host: &HostTarget, _vm: &VmSpec) -> Result<(), Report<CapabilityError>> {
        self.play(Operation::CreateVm).await
    }

    async fn ping(&self, _host: &HostTarget) -> Result<(), Report<CapabilityError>> {
        self.play(Operation::Ping).await
    }
}

/// Snapshot store that keeps the last saved snapshot in memory
#[derive(Debug, Default)]
pub struct MemorySnapshotStore {
    saved: Mutex<Option<RegistrySnapshot>>,
    saves: Mutex<u32>,
}

impl MemorySnapshotStore {
    pub fn saved(&self) -> Option<RegistrySnapshot> {
        self.saved
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn save_count(&self) -> u32 {
        *self.saves.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl SnapshotStore for MemorySnapshotStore {
    fn load(&self) -> Result<Option<RegistrySnapshot>, Report<PersistenceError>> {
        Ok(self.saved())
    }

    fn save(&self, snapshot: &RegistrySnapshot) -> Result<(), Report<PersistenceError>> {
        *self.saved.lock().unwrap_or_else(PoisonError::into_inner) = Some(snapshot.clone());
        *self.saves.lock().unwrap_or_else(PoisonError::into_inner) += 1;
        Ok(())
    }
}
