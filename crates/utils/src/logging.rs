//! provides logging helpers

use tracing::Subscriber;
use tracing_subscriber::filter::{self};
use tracing_subscriber::fmt::layer;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::Layer;

/// Environment variable overriding the default log directive, e.g. `metal_orchestrator=debug`.
pub const LOG_LEVEL_ENV_VAR: &str = "METAL_LOG";

/// Builds the env-filter honoring [`LOG_LEVEL_ENV_VAR`], defaulting to `info`.
pub fn env_filter() -> filter::EnvFilter {
    filter::EnvFilter::builder()
        .with_default_directive(filter::LevelFilter::INFO.into())
        .with_env_var(LOG_LEVEL_ENV_VAR)
        .from_env_lossy()
}

/// Returns the human readable stderr layer shared by every binary in the workspace.
pub fn get_fmt_layer<S>() -> Box<dyn Layer<S> + Send + Sync + 'static>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    layer()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_thread_ids(false)
        .boxed()
}
