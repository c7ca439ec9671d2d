//! Bare-metal host lifecycle orchestrator
//!
//! Registers hosts, provisions them, turns them into VM hosts and places
//! virtual machines on them. Every privileged action runs as a background
//! job against an external capability; callers poll the host and VM records
//! for the outcome.

pub mod api;
pub mod app;
pub mod config;
pub mod domain;
pub mod infrastructure;

pub use domain::Orchestrator;
pub use infrastructure::logging;
