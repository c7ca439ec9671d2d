//! In-memory resource allocation ledger

use std::collections::HashMap;

use api_types::HostCapacity;
use dashmap::DashMap;
use tracing::debug;

use super::host::Host;
use super::host::VirtualMachine;
use super::traits::CapacityTracker;

/// Reservations per host, keyed by virtual machine id.
///
/// Remaining capacity is the host's reported totals minus every reservation.
#[derive(Debug, Default)]
pub struct AllocationLedger {
    allocations: DashMap<String, HashMap<String, HostCapacity>>,
}

impl AllocationLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuilds reservations from the guests that still hold resources.
    pub fn from_vms<'a>(vms: impl IntoIterator<Item = &'a VirtualMachine>) -> Self {
        let ledger = Self::new();
        for vm in vms.into_iter().filter(|vm| vm.is_live()) {
            ledger
                .allocations
                .entry(vm.host_id.clone())
                .or_default()
                .insert(vm.id.clone(), vm.spec.resources());
        }
        ledger
    }

    pub fn allocated(&self, host_id: &str) -> HostCapacity {
        self.allocations
            .get(host_id)
            .map(|entries| {
                entries
                    .values()
                    .fold(HostCapacity::default(), |acc, r| acc.saturating_add(r))
            })
            .unwrap_or_default()
    }
}

impl CapacityTracker for AllocationLedger {
    fn available(&self, host: &Host) -> HostCapacity {
        host.capacity.saturating_sub(&self.allocated(&host.id))
    }

    fn reserve(&self, host: &Host, vm_id: &str, request: HostCapacity) -> Result<(), HostCapacity> {
        // The entry guard keeps the shard locked across check and insert.
        let mut entries = self.allocations.entry(host.id.clone()).or_default();
        let allocated = entries
            .values()
            .fold(HostCapacity::default(), |acc, r| acc.saturating_add(r));
        let available = host.capacity.saturating_sub(&allocated);
        if !available.fits(&request) {
            return Err(available);
        }
        entries.insert(vm_id.to_string(), request);
        debug!(host_id = %host.id, vm_id, %request, "capacity reserved");
        Ok(())
    }

    fn release(&self, host_id: &str, vm_id: &str) -> Option<HostCapacity> {
        let released = self
            .allocations
            .get_mut(host_id)
            .and_then(|mut entries| entries.remove(vm_id));
        if let Some(released) = released {
            debug!(host_id, vm_id, %released, "capacity released");
        }
        released
    }

    fn allocations(&self, host_id: &str) -> Vec<(String, HostCapacity)> {
        let mut allocations: Vec<_> = self
            .allocations
            .get(host_id)
            .map(|entries| {
                entries
                    .iter()
                    .map(|(vm_id, resources)| (vm_id.clone(), *resources))
                    .collect()
            })
            .unwrap_or_default();
        allocations.sort_by(|a, b| a.0.cmp(&b.0));
        allocations
    }
}
