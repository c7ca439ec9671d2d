//! Host lifecycle state machine
//!
//! [`evaluate`] decides whether an action may run against a host in a given
//! status, and [`resolve`] decides where a finished job lands. Both are pure
//! functions of their arguments; every transition rule of the host lifecycle
//! lives in this module.

use std::fmt;

use api_types::HostStatus;
use api_types::JobKind;
use api_types::RejectionReason;
use thiserror::Error;

use super::job::JobOutcome;

/// An action requested against a host
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostAction {
    ProvisionHost,
    SetupVmHost,
    SetMaintenance(bool),
    CreateVirtualMachine,
    CheckHealth,
}

impl fmt::Display for HostAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ProvisionHost => f.write_str("provision_host"),
            Self::SetupVmHost => f.write_str("setup_vm_host"),
            Self::SetMaintenance(on) => write!(f, "set_maintenance_mode({on})"),
            Self::CreateVirtualMachine => f.write_str("create_virtual_machine"),
            Self::CheckHealth => f.write_str("check_health"),
        }
    }
}

/// What an allowed action does to the host record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Mark the host `in_progress` and hand the work to a background job
    Dispatch {
        kind: JobKind,
        in_progress: HostStatus,
    },
    /// Apply `next` synchronously
    Immediate { next: HostStatus },
    /// Leave the host status as it is
    Unchanged,
}

/// Why an action was refused
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GuardRejection {
    #[error("cannot {action}: host is {status} and another operation is still in progress")]
    InProgress {
        action: HostAction,
        status: HostStatus,
    },
    #[error("cannot {action} while host is {status}")]
    NotAllowed {
        action: HostAction,
        status: HostStatus,
    },
    #[error("cannot {action}: host is already a VM host")]
    AlreadyVmHost { action: HostAction },
    #[error("cannot {action}: host is not configured as a VM host")]
    NotVmHost { action: HostAction },
}

impl GuardRejection {
    pub fn reason(&self) -> RejectionReason {
        match self {
            Self::InProgress { .. } => RejectionReason::ConcurrencyConflict,
            Self::NotAllowed { .. } | Self::AlreadyVmHost { .. } | Self::NotVmHost { .. } => {
                RejectionReason::InvalidTransition
            }
        }
    }
}

/// Decides whether `action` is legal for a host in `status`.
pub fn evaluate(
    status: HostStatus,
    is_vm_host: bool,
    action: HostAction,
) -> Result<Transition, GuardRejection> {
    let not_allowed = || GuardRejection::NotAllowed { action, status };

    match status {
        HostStatus::Provisioning | HostStatus::SettingUpVmHost => {
            Err(GuardRejection::InProgress { action, status })
        }
        HostStatus::Pending | HostStatus::Error => match action {
            HostAction::ProvisionHost => Ok(Transition::Dispatch {
                kind: JobKind::ProvisionHost,
                in_progress: HostStatus::Provisioning,
            }),
            HostAction::CheckHealth => Ok(Transition::Unchanged),
            HostAction::SetupVmHost
            | HostAction::SetMaintenance(_)
            | HostAction::CreateVirtualMachine => Err(not_allowed()),
        },
        HostStatus::Active => match action {
            HostAction::ProvisionHost | HostAction::SetMaintenance(false) => Err(not_allowed()),
            HostAction::SetupVmHost if is_vm_host => Err(GuardRejection::AlreadyVmHost { action }),
            HostAction::SetupVmHost => Ok(Transition::Dispatch {
                kind: JobKind::SetupVmHost,
                in_progress: HostStatus::SettingUpVmHost,
            }),
            HostAction::SetMaintenance(true) => Ok(Transition::Immediate {
                next: HostStatus::Maintenance,
            }),
            HostAction::CreateVirtualMachine if is_vm_host => Ok(Transition::Unchanged),
            HostAction::CreateVirtualMachine => Err(GuardRejection::NotVmHost { action }),
            HostAction::CheckHealth => Ok(Transition::Unchanged),
        },
        HostStatus::Maintenance => match action {
            HostAction::SetMaintenance(false) => Ok(Transition::Immediate {
                next: HostStatus::Active,
            }),
            HostAction::CheckHealth => Ok(Transition::Unchanged),
            HostAction::ProvisionHost
            | HostAction::SetupVmHost
            | HostAction::SetMaintenance(true)
            | HostAction::CreateVirtualMachine => Err(not_allowed()),
        },
    }
}

/// Stable host state a finished job lands in
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub status: HostStatus,
    pub is_vm_host: bool,
    pub last_error: Option<String>,
}

/// Computes the host state after a host-level job finished.
///
/// Returns `None` for job kinds that never touch the host status.
pub fn resolve(kind: JobKind, is_vm_host: bool, outcome: &JobOutcome) -> Option<Resolution> {
    let resolution = match (kind, outcome) {
        (JobKind::ProvisionHost, JobOutcome::Success) => Resolution {
            status: HostStatus::Active,
            is_vm_host,
            last_error: None,
        },
        (JobKind::ProvisionHost, JobOutcome::Failure(reason)) => Resolution {
            status: HostStatus::Error,
            is_vm_host,
            last_error: Some(format!("provisioning failed: {reason}")),
        },
        (JobKind::SetupVmHost, JobOutcome::Success) => Resolution {
            status: HostStatus::Active,
            is_vm_host: true,
            last_error: None,
        },
        (JobKind::SetupVmHost, JobOutcome::Failure(reason)) => Resolution {
            status: HostStatus::Active,
            is_vm_host,
            last_error: Some(format!("VM host setup failed: {reason}")),
        },
        (JobKind::CreateVirtualMachine, _) => return None,
    };
    Some(resolution)
}
