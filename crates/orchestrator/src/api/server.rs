use std::sync::Arc;

use error_stack::Report;
use poem::get;
use poem::listener::TcpListener;
use poem::middleware::Tracing;
use poem::post;
use poem::Endpoint;
use poem::EndpointExt;
use poem::Route;
use poem::Server;
use tokio_util::sync::CancellationToken;
use tracing::error;
use tracing::info;

use super::auth::ApiTokenMiddleware;
use super::handlers;
use super::ApiError;
use crate::domain::Orchestrator;

/// Builds the API routes around `orchestrator`.
pub fn routes(orchestrator: Arc<Orchestrator>, api_token: Option<String>) -> impl Endpoint {
    Route::new()
        .at(
            "/api/v1/hosts",
            get(handlers::list_hosts).post(handlers::register_host),
        )
        .at("/api/v1/hosts/:host_id", get(handlers::get_host))
        .at("/api/v1/hosts/:host_id/usage", get(handlers::get_host_usage))
        .at(
            "/api/v1/hosts/:host_id/provision",
            post(handlers::provision_host),
        )
        .at(
            "/api/v1/hosts/:host_id/setup-vm-host",
            post(handlers::setup_vm_host),
        )
        .at(
            "/api/v1/hosts/:host_id/maintenance",
            post(handlers::set_maintenance_mode),
        )
        .at(
            "/api/v1/hosts/:host_id/health-check",
            post(handlers::check_health),
        )
        .at(
            "/api/v1/hosts/:host_id/vms",
            get(handlers::list_host_vms).post(handlers::create_vm),
        )
        .at("/api/v1/vms/:vm_id", get(handlers::get_vm))
        .at("/api/v1/jobs", get(handlers::list_jobs))
        .data(orchestrator)
        .with(ApiTokenMiddleware::new(api_token))
        .with(Tracing)
}

/// HTTP API server exposing the orchestrator operations
pub struct ApiServer {
    orchestrator: Arc<Orchestrator>,
    listen_addr: String,
    api_token: Option<String>,
}

impl ApiServer {
    pub fn new(orchestrator: Arc<Orchestrator>, listen_addr: String, api_token: Option<String>) -> Self {
        Self {
            orchestrator,
            listen_addr,
            api_token,
        }
    }

    /// Start the API server
    ///
    /// # Errors
    ///
    /// - [`ApiError::ServerError`] if the server fails to start or bind to the address
    pub async fn run(self, cancellation_token: CancellationToken) -> Result<(), Report<ApiError>> {
        info!("Starting HTTP API server on {}", self.listen_addr);
        if self.api_token.is_none() {
            info!("API token not configured, requests are not authenticated");
        }

        let app = routes(self.orchestrator, self.api_token);
        let listener = TcpListener::bind(&self.listen_addr);
        let server = Server::new(listener);

        tokio::select! {
            result = server.run(app) => {
                match result {
                    Ok(()) => {
                        info!("API server stopped normally");
                        Ok(())
                    }
                    Err(e) => {
                        error!("API server failed: {e}");
                        Err(Report::new(ApiError::ServerError {
                            message: format!("Server failed: {e}"),
                        }))
                    }
                }
            }
            _ = cancellation_token.cancelled() => {
                info!("API server shutdown requested");
                Ok(())
            }
        }
    }
}
