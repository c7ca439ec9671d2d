//! Host and virtual machine records kept by the registry

use std::collections::BTreeMap;
use std::net::IpAddr;

use api_types::HealthStatus;
use api_types::HostCapacity;
use api_types::HostInfo;
use api_types::HostStatus;
use api_types::OsVariant;
use api_types::RegisterHostRequest;
use api_types::VmInfo;
use api_types::VmStatus;
use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;

/// A bare-metal machine under management
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Host {
    pub id: String,
    pub hostname: String,
    pub ip: IpAddr,
    pub ssh_user: String,
    pub ssh_port: u16,
    pub status: HostStatus,
    /// Set once the virtualization stack is installed; never reset
    pub is_vm_host: bool,
    pub last_error: Option<String>,
    pub capacity: HostCapacity,
    #[serde(default)]
    pub health: HealthStatus,
    #[serde(default)]
    pub last_health_check: Option<DateTime<Utc>>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Host {
    /// Builds a freshly registered host in `Pending`.
    pub fn new(id: String, request: RegisterHostRequest, now: DateTime<Utc>) -> Self {
        Self {
            id,
            hostname: request.hostname.trim().to_string(),
            ip: request.ip,
            ssh_user: request.ssh_user,
            ssh_port: request.ssh_port,
            status: HostStatus::Pending,
            is_vm_host: false,
            last_error: None,
            capacity: request.capacity,
            health: HealthStatus::Unknown,
            last_health_check: None,
            metadata: request.metadata,
            created_at: now,
            updated_at: now,
        }
    }

    /// Connection details handed to capability backends.
    pub fn target(&self) -> HostTarget {
        HostTarget {
            id: self.id.clone(),
            hostname: self.hostname.clone(),
            ip: self.ip,
            ssh_user: self.ssh_user.clone(),
            ssh_port: self.ssh_port,
        }
    }

    pub fn to_info(&self, available: HostCapacity) -> HostInfo {
        HostInfo {
            id: self.id.clone(),
            hostname: self.hostname.clone(),
            ip: self.ip,
            ssh_user: self.ssh_user.clone(),
            ssh_port: self.ssh_port,
            status: self.status,
            is_vm_host: self.is_vm_host,
            last_error: self.last_error.clone(),
            capacity: self.capacity,
            available,
            health: self.health,
            last_health_check: self.last_health_check,
            metadata: self.metadata.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

/// What a capability needs to reach a host
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostTarget {
    pub id: String,
    pub hostname: String,
    pub ip: IpAddr,
    pub ssh_user: String,
    pub ssh_port: u16,
}

/// Validated virtual machine parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmSpec {
    pub name: String,
    pub vcpus: u32,
    pub memory_mb: u64,
    pub disk_gb: u64,
    pub os_variant: OsVariant,
}

impl VmSpec {
    pub fn resources(&self) -> HostCapacity {
        HostCapacity::new(self.vcpus, self.memory_mb, self.disk_gb)
    }
}

/// A guest created on a VM host
///
/// Owned by exactly one host through `host_id`; the host keeps no list of
/// its guests, lookups go through the registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VirtualMachine {
    pub id: String,
    pub host_id: String,
    #[serde(flatten)]
    pub spec: VmSpec,
    pub status: VmStatus,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl VirtualMachine {
    pub fn creating(id: String, host_id: String, spec: VmSpec, now: DateTime<Utc>) -> Self {
        Self {
            id,
            host_id,
            spec,
            status: VmStatus::Creating,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Failed guests keep their record but no longer hold their name or resources.
    pub fn is_live(&self) -> bool {
        self.status != VmStatus::Failed
    }

    pub fn to_info(&self) -> VmInfo {
        VmInfo {
            id: self.id.clone(),
            host_id: self.host_id.clone(),
            name: self.spec.name.clone(),
            vcpus: self.spec.vcpus,
            memory_mb: self.spec.memory_mb,
            disk_gb: self.spec.disk_gb,
            os_variant: self.spec.os_variant,
            status: self.status,
            last_error: self.last_error.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}
