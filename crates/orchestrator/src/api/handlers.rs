use std::sync::Arc;

use api_types::ActionResponse;
use api_types::CreateVmRequest;
use api_types::HostInfo;
use api_types::HostUsage;
use api_types::JobInfo;
use api_types::MaintenanceRequest;
use api_types::RegisterHostRequest;
use api_types::VmInfo;
use poem::handler;
use poem::web::Data;
use poem::web::Json;
use poem::web::Path;

use super::ApiError;
use crate::domain::Orchestrator;

fn host_not_found(host_id: String) -> poem::Error {
    ApiError::NotFound {
        resource: "host",
        id: host_id,
    }
    .into()
}

/// Register a bare-metal host
#[handler]
pub async fn register_host(
    orchestrator: Data<&Arc<Orchestrator>>,
    Json(request): Json<RegisterHostRequest>,
) -> Json<ActionResponse> {
    Json(orchestrator.register_host(request))
}

#[handler]
pub async fn list_hosts(orchestrator: Data<&Arc<Orchestrator>>) -> Json<Vec<HostInfo>> {
    Json(orchestrator.hosts())
}

#[handler]
pub async fn get_host(
    orchestrator: Data<&Arc<Orchestrator>>,
    Path(host_id): Path<String>,
) -> poem::Result<Json<HostInfo>> {
    orchestrator
        .host(&host_id)
        .map(Json)
        .ok_or_else(|| host_not_found(host_id))
}

/// Reservations and usage percentages of a host
#[handler]
pub async fn get_host_usage(
    orchestrator: Data<&Arc<Orchestrator>>,
    Path(host_id): Path<String>,
) -> poem::Result<Json<HostUsage>> {
    orchestrator
        .host_usage(&host_id)
        .map(Json)
        .ok_or_else(|| host_not_found(host_id))
}

/// Start provisioning; the host record reports the outcome.
#[handler]
pub async fn provision_host(
    orchestrator: Data<&Arc<Orchestrator>>,
    Path(host_id): Path<String>,
) -> Json<ActionResponse> {
    Json(orchestrator.provision_host(&host_id).await)
}

#[handler]
pub async fn setup_vm_host(
    orchestrator: Data<&Arc<Orchestrator>>,
    Path(host_id): Path<String>,
) -> Json<ActionResponse> {
    Json(orchestrator.setup_vm_host(&host_id).await)
}

#[handler]
pub async fn set_maintenance_mode(
    orchestrator: Data<&Arc<Orchestrator>>,
    Path(host_id): Path<String>,
    Json(request): Json<MaintenanceRequest>,
) -> Json<ActionResponse> {
    Json(
        orchestrator
            .set_maintenance_mode(&host_id, request.maintenance)
            .await,
    )
}

#[handler]
pub async fn check_health(
    orchestrator: Data<&Arc<Orchestrator>>,
    Path(host_id): Path<String>,
) -> Json<ActionResponse> {
    Json(orchestrator.check_health(&host_id).await)
}

/// Request a virtual machine on a VM host
///
/// A body that does not decode is still answered with an `ActionResponse`.
#[handler]
pub async fn create_vm(
    orchestrator: Data<&Arc<Orchestrator>>,
    Path(host_id): Path<String>,
    request: poem::Result<Json<CreateVmRequest>>,
) -> Json<ActionResponse> {
    match request {
        Ok(Json(request)) => Json(orchestrator.create_virtual_machine(&host_id, &request).await),
        Err(err) => Json(
            orchestrator
                .reject_malformed_vm_request(&host_id, &err.to_string())
                .await,
        ),
    }
}

#[handler]
pub async fn list_host_vms(
    orchestrator: Data<&Arc<Orchestrator>>,
    Path(host_id): Path<String>,
) -> poem::Result<Json<Vec<VmInfo>>> {
    orchestrator
        .vms_on_host(&host_id)
        .map(Json)
        .ok_or_else(|| host_not_found(host_id))
}

#[handler]
pub async fn get_vm(
    orchestrator: Data<&Arc<Orchestrator>>,
    Path(vm_id): Path<String>,
) -> poem::Result<Json<VmInfo>> {
    orchestrator.vm(&vm_id).map(Json).ok_or_else(|| {
        ApiError::NotFound {
            resource: "virtual machine",
            id: vm_id,
        }
        .into()
    })
}

/// Jobs that have been dispatched and not yet resolved
#[handler]
pub async fn list_jobs(orchestrator: Data<&Arc<Orchestrator>>) -> Json<Vec<JobInfo>> {
    Json(orchestrator.jobs())
}
