//! HTTP API for driving the orchestrator
//!
//! # API Endpoints
//!
//! - `POST /api/v1/hosts` - Register a host
//! - `GET /api/v1/hosts` - List hosts
//! - `GET /api/v1/hosts/:host_id` - Get a host
//! - `GET /api/v1/hosts/:host_id/usage` - Get a host's reservations and usage
//! - `POST /api/v1/hosts/:host_id/provision` - Provision a host
//! - `POST /api/v1/hosts/:host_id/setup-vm-host` - Install the virtualization stack
//! - `POST /api/v1/hosts/:host_id/maintenance` - Enter or leave maintenance mode
//! - `POST /api/v1/hosts/:host_id/health-check` - Probe a host
//! - `POST /api/v1/hosts/:host_id/vms` - Create a virtual machine
//! - `GET /api/v1/hosts/:host_id/vms` - List a host's virtual machines
//! - `GET /api/v1/vms/:vm_id` - Get a virtual machine
//! - `GET /api/v1/jobs` - List in-flight jobs
//!
//! Operations answer with an `ActionResponse`; a rejected operation is still
//! HTTP 200 with `status: "Failure"` and a machine-readable `reason`. This
//! includes VM request bodies that cannot be decoded.
//!
//! # Authentication
//!
//! When an API token is configured, every request must carry it:
//! ```text
//! Authorization: Bearer <TOKEN>
//! ```

use core::error::Error;

pub mod auth;
pub mod handlers;
pub mod server;

/// API errors
#[derive(Debug, derive_more::Display)]
pub enum ApiError {
    #[display("{resource} not found: {id}")]
    NotFound { resource: &'static str, id: String },
    #[display("Server error: {message}")]
    ServerError { message: String },
    #[display("Authentication failed: {reason}")]
    AuthenticationFailed { reason: String },
    #[display("Missing authorization header")]
    MissingAuthHeader,
}

impl Error for ApiError {}

impl ApiError {
    pub fn status(&self) -> poem::http::StatusCode {
        use poem::http::StatusCode;
        match self {
            Self::NotFound { .. } => StatusCode::NOT_FOUND,
            Self::ServerError { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Self::AuthenticationFailed { .. } | Self::MissingAuthHeader => StatusCode::UNAUTHORIZED,
        }
    }
}

impl From<ApiError> for poem::Error {
    fn from(err: ApiError) -> Self {
        let status = err.status();
        poem::Error::from_string(err.to_string(), status)
    }
}
