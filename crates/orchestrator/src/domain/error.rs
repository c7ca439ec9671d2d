use api_types::ActionResponse;
use api_types::RejectionReason;
use thiserror::Error;

use super::guard::GuardRejection;
use super::guard::HostAction;
use super::guard::Transition;
use super::provisioner::ProvisionRejection;
use super::registry::RegistryError;

/// Any reason an orchestrator operation did not go ahead
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Rejected(#[from] GuardRejection),
    #[error(transparent)]
    Provision(#[from] ProvisionRejection),
    #[error("host {hostname} is unreachable: {reason}")]
    Unhealthy { hostname: String, reason: String },
    #[error("internal error: {action} produced unexpected transition {transition:?}")]
    UnexpectedTransition {
        action: HostAction,
        transition: Transition,
    },
}

impl OrchestratorError {
    pub fn reason(&self) -> RejectionReason {
        match self {
            Self::Registry(err) => err.reason(),
            Self::Rejected(rejection) => rejection.reason(),
            Self::Provision(rejection) => rejection.reason(),
            Self::Unhealthy { .. } => RejectionReason::Unhealthy,
            Self::UnexpectedTransition { .. } => RejectionReason::Internal,
        }
    }
}

impl From<OrchestratorError> for ActionResponse {
    fn from(err: OrchestratorError) -> Self {
        ActionResponse::failure(err.reason(), err.to_string())
    }
}
