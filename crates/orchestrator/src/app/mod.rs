//! Application module
//!
//! Daemon wiring and lifecycle: building the services, running the
//! background tasks and shutting down on a signal.

pub mod builder;
pub mod core;
pub mod services;
pub mod tasks;

pub use builder::ApplicationBuilder;
pub use core::Application;
pub use services::ApplicationServices;
