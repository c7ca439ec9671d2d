//! Shared API type definitions
//!
//! This crate contains the wire types exchanged between the orchestrator daemon
//! and its callers: host and virtual machine records, request bodies for the
//! remote operations, and the uniform `{status, message}` action response.

use std::collections::BTreeMap;
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;

/// Lifecycle status of a bare-metal host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HostStatus {
    /// Registered but never provisioned
    Pending,
    /// Provisioning job in flight
    Provisioning,
    /// Provisioned and usable
    Active,
    /// Last provisioning attempt failed
    Error,
    /// Taken out of service by an operator
    Maintenance,
    /// Virtualization stack installation in flight
    #[serde(rename = "SettingUpVMHost")]
    SettingUpVmHost,
}

impl HostStatus {
    /// Transient statuses are only reachable through a dispatched job and
    /// always resolve to a stable status.
    pub fn is_transient(self) -> bool {
        matches!(self, Self::Provisioning | Self::SettingUpVmHost)
    }
}

impl fmt::Display for HostStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SettingUpVmHost => f.write_str("SettingUpVMHost"),
            other => write!(f, "{other:?}"),
        }
    }
}

/// Lifecycle status of a virtual machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VmStatus {
    Creating,
    Running,
    Failed,
}

impl fmt::Display for VmStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Result of the most recent reachability probe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum HealthStatus {
    #[default]
    Unknown,
    Healthy,
    Unhealthy,
}

/// Guest operating systems the virtualization backend knows how to install
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum OsVariant {
    #[default]
    #[serde(rename = "ubuntu22.04")]
    Ubuntu2204,
    #[serde(rename = "ubuntu20.04")]
    Ubuntu2004,
    #[serde(rename = "ubuntu18.04")]
    Ubuntu1804,
    #[serde(rename = "debian11")]
    Debian11,
    #[serde(rename = "debian10")]
    Debian10,
    #[serde(rename = "centos8")]
    Centos8,
    #[serde(rename = "centos7")]
    Centos7,
}

impl OsVariant {
    pub const ALL: [OsVariant; 7] = [
        Self::Ubuntu2204,
        Self::Ubuntu2004,
        Self::Ubuntu1804,
        Self::Debian11,
        Self::Debian10,
        Self::Centos8,
        Self::Centos7,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ubuntu2204 => "ubuntu22.04",
            Self::Ubuntu2004 => "ubuntu20.04",
            Self::Ubuntu1804 => "ubuntu18.04",
            Self::Debian11 => "debian11",
            Self::Debian10 => "debian10",
            Self::Centos8 => "centos8",
            Self::Centos7 => "centos7",
        }
    }
}

impl fmt::Display for OsVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unsupported OS variant name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnsupportedOsVariant(pub String);

impl fmt::Display for UnsupportedOsVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let supported: Vec<&str> = OsVariant::ALL.iter().map(|v| v.as_str()).collect();
        write!(
            f,
            "unsupported os variant '{}', expected one of: {}",
            self.0,
            supported.join(", ")
        )
    }
}

impl std::error::Error for UnsupportedOsVariant {}

impl FromStr for OsVariant {
    type Err = UnsupportedOsVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|v| v.as_str() == s.trim())
            .ok_or_else(|| UnsupportedOsVariant(s.to_string()))
    }
}

/// Compute, memory and disk amounts of a host or a reservation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct HostCapacity {
    /// Number of vCPUs
    pub cpu: u32,
    /// Memory in MiB
    pub memory_mb: u64,
    /// Disk in GiB
    pub disk_gb: u64,
}

impl HostCapacity {
    pub fn new(cpu: u32, memory_mb: u64, disk_gb: u64) -> Self {
        Self {
            cpu,
            memory_mb,
            disk_gb,
        }
    }

    /// Returns true if every dimension of `request` fits in `self`.
    pub fn fits(&self, request: &HostCapacity) -> bool {
        request.cpu <= self.cpu
            && request.memory_mb <= self.memory_mb
            && request.disk_gb <= self.disk_gb
    }

    pub fn saturating_sub(&self, other: &HostCapacity) -> HostCapacity {
        HostCapacity {
            cpu: self.cpu.saturating_sub(other.cpu),
            memory_mb: self.memory_mb.saturating_sub(other.memory_mb),
            disk_gb: self.disk_gb.saturating_sub(other.disk_gb),
        }
    }

    pub fn saturating_add(&self, other: &HostCapacity) -> HostCapacity {
        HostCapacity {
            cpu: self.cpu.saturating_add(other.cpu),
            memory_mb: self.memory_mb.saturating_add(other.memory_mb),
            disk_gb: self.disk_gb.saturating_add(other.disk_gb),
        }
    }
}

impl fmt::Display for HostCapacity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} vCPU, {}MB memory, {}GB disk",
            self.cpu, self.memory_mb, self.disk_gb
        )
    }
}

/// Resources held by one virtual machine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceAllocation {
    pub vm_id: String,
    pub vm_name: String,
    pub resources: HostCapacity,
    pub allocated_at: DateTime<Utc>,
}

/// Reservation summary of a host
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostUsage {
    pub host_id: String,
    pub total: HostCapacity,
    pub allocated: HostCapacity,
    pub allocations: Vec<ResourceAllocation>,
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub disk_percent: f64,
}

impl HostUsage {
    pub fn new(host_id: String, total: HostCapacity, allocations: Vec<ResourceAllocation>) -> Self {
        let allocated = allocations
            .iter()
            .fold(HostCapacity::default(), |acc, a| acc.saturating_add(&a.resources));
        Self {
            host_id,
            total,
            allocated,
            cpu_percent: usage_percent(u64::from(allocated.cpu), u64::from(total.cpu)),
            memory_percent: usage_percent(allocated.memory_mb, total.memory_mb),
            disk_percent: usage_percent(allocated.disk_gb, total.disk_gb),
            allocations,
        }
    }
}

/// Share of `total` in use, rounded to two decimals; 0 for an unknown total.
fn usage_percent(used: u64, total: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    (used as f64 / total as f64 * 10_000.0).round() / 100.0
}

/// Host record as returned to callers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostInfo {
    pub id: String,
    pub hostname: String,
    pub ip: IpAddr,
    pub ssh_user: String,
    pub ssh_port: u16,
    pub status: HostStatus,
    pub is_vm_host: bool,
    pub last_error: Option<String>,
    /// Total capacity reported by the host
    pub capacity: HostCapacity,
    /// Capacity not yet reserved by virtual machines
    pub available: HostCapacity,
    pub health: HealthStatus,
    pub last_health_check: Option<DateTime<Utc>>,
    pub metadata: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Virtual machine record as returned to callers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VmInfo {
    pub id: String,
    pub host_id: String,
    pub name: String,
    pub vcpus: u32,
    pub memory_mb: u64,
    pub disk_gb: u64,
    pub os_variant: OsVariant,
    pub status: VmStatus,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

fn default_ssh_user() -> String {
    "root".to_string()
}

fn default_ssh_port() -> u16 {
    22
}

/// Body of the host registration request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterHostRequest {
    /// Host identifier, generated when absent
    #[serde(default)]
    pub id: Option<String>,
    pub hostname: String,
    pub ip: IpAddr,
    #[serde(default = "default_ssh_user")]
    pub ssh_user: String,
    #[serde(default = "default_ssh_port")]
    pub ssh_port: u16,
    /// Capacity known up front; provisioning may overwrite it with discovered facts
    #[serde(default)]
    pub capacity: HostCapacity,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

fn default_vcpus() -> i64 {
    2
}

fn default_memory_mb() -> i64 {
    2048
}

fn default_disk_gb() -> i64 {
    20
}

fn default_os_variant() -> String {
    OsVariant::default().as_str().to_string()
}

/// Body of the virtual machine creation request
///
/// The name defaults to empty, numeric fields are signed and the OS variant
/// is free text so that out-of-range values reach validation and come back
/// as a structured rejection. Bodies that do not fit these types at all are
/// rejected by the server after the host eligibility check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateVmRequest {
    #[serde(default)]
    pub vm_name: String,
    #[serde(default = "default_vcpus")]
    pub vcpus: i64,
    #[serde(default = "default_memory_mb")]
    pub memory_mb: i64,
    #[serde(default = "default_disk_gb")]
    pub disk_gb: i64,
    #[serde(default = "default_os_variant")]
    pub os_variant: String,
}

impl CreateVmRequest {
    pub fn new(
        vm_name: impl Into<String>,
        vcpus: i64,
        memory_mb: i64,
        disk_gb: i64,
        os_variant: impl Into<String>,
    ) -> Self {
        Self {
            vm_name: vm_name.into(),
            vcpus,
            memory_mb,
            disk_gb,
            os_variant: os_variant.into(),
        }
    }
}

fn default_maintenance() -> bool {
    true
}

/// Body of the maintenance toggle request
///
/// An empty body enters maintenance mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaintenanceRequest {
    #[serde(default = "default_maintenance")]
    pub maintenance: bool,
}

/// Outcome of a remote operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActionStatus {
    Success,
    Failure,
}

/// Machine-readable reason attached to a failed action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectionReason {
    /// The referenced host does not exist
    HostNotFound,
    /// The action is not legal from the host's current status
    InvalidTransition,
    /// Another job is already in flight for the host
    ConcurrencyConflict,
    /// The host cannot run virtual machines right now
    HostNotEligible,
    /// Request parameters are malformed
    InvalidParameters,
    /// The host does not have enough remaining capacity
    CapacityExceeded,
    /// A virtual machine with the same name already exists on the host
    NameConflict,
    /// Registration data collides with an existing host
    DuplicateHost,
    /// The host did not answer the health probe
    Unhealthy,
    /// Unexpected internal failure
    Internal,
}

/// Uniform response for every remote operation
///
/// Every operation returns immediately; `Success` means the operation was
/// accepted (and, for job-backed operations, dispatched). The final outcome
/// is observed by re-reading the host or virtual machine record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionResponse {
    pub status: ActionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<RejectionReason>,
    /// Identifier of the resource created by the operation, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_id: Option<String>,
}

impl ActionResponse {
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            status: ActionStatus::Success,
            message: Some(message.into()),
            reason: None,
            resource_id: None,
        }
    }

    pub fn failure(reason: RejectionReason, message: impl Into<String>) -> Self {
        Self {
            status: ActionStatus::Failure,
            message: Some(message.into()),
            reason: Some(reason),
            resource_id: None,
        }
    }

    pub fn with_resource_id(mut self, id: impl Into<String>) -> Self {
        self.resource_id = Some(id.into());
        self
    }

    pub fn is_success(&self) -> bool {
        self.status == ActionStatus::Success
    }
}

/// Kind of privileged long-running work
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    ProvisionHost,
    SetupVmHost,
    CreateVirtualMachine,
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::ProvisionHost => "provision_host",
            Self::SetupVmHost => "setup_vm_host",
            Self::CreateVirtualMachine => "create_virtual_machine",
        })
    }
}

/// In-flight job as returned to callers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobInfo {
    pub id: String,
    pub kind: JobKind,
    pub host_id: String,
    pub vm_id: Option<String>,
    pub started_at: DateTime<Utc>,
    pub attempts: u32,
}
