//! provides logging helpers

use std::fmt::{self};
use std::path::Path;

use anyhow::Context;
use chrono::SecondsFormat;
use chrono::Utc;
use tracing::field::Field;
use tracing::field::Visit;
use tracing::Event;
use tracing::Subscriber;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::RollingFileAppender;
use tracing_appender::rolling::Rotation;
use tracing_subscriber::filter::FilterExt;
use tracing_subscriber::filter::{self};
use tracing_subscriber::fmt::format;
use tracing_subscriber::fmt::layer;
use tracing_subscriber::fmt::FmtContext;
use tracing_subscriber::fmt::FormatEvent;
use tracing_subscriber::prelude::*;
use tracing_subscriber::registry;

use crate::domain::job::JOB_EVENT_TARGET;

/// Writes job events as `key=value` lines.
struct JobEventFormatter;

#[derive(Default)]
struct FieldVisitor {
    message: String,
    fields: Vec<(&'static str, String)>,
}

impl Visit for FieldVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        } else {
            self.fields.push((field.name(), value.to_string()));
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{value:?}");
        } else {
            self.fields.push((field.name(), format!("{value:?}")));
        }
    }
}

/// Quotes values that would otherwise break the line format.
fn quote(value: &str) -> String {
    if value.is_empty() || value.contains(|c: char| c.is_whitespace() || c == '"' || c == '=') {
        format!("{value:?}")
    } else {
        value.to_string()
    }
}

fn format_job_line(timestamp: &str, level: &str, visitor: &FieldVisitor) -> String {
    let mut line = format!(
        "ts={timestamp} level={} event={}",
        level.to_ascii_lowercase(),
        quote(&visitor.message)
    );
    for (key, value) in &visitor.fields {
        line.push_str(&format!(" {key}={}", quote(value)));
    }
    line
}

impl<S, N> FormatEvent<S, N> for JobEventFormatter
where
    S: Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
    N: for<'a> tracing_subscriber::fmt::FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        _ctx: &FmtContext<'_, S, N>,
        mut writer: format::Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let mut visitor = FieldVisitor::default();
        event.record(&mut visitor);
        let timestamp = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
        writeln!(
            writer,
            "{}",
            format_job_line(&timestamp, event.metadata().level().as_str(), &visitor)
        )
    }
}

/// initiate the global tracing subscriber
///
/// Everything goes to stderr; events with the job target additionally go to
/// a daily-rotated audit file next to `job_log_file`.
pub fn init<P: AsRef<Path>>(job_log_file: P) -> anyhow::Result<WorkerGuard> {
    let job_log_file = job_log_file.as_ref();
    let dir = job_log_file
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    let prefix = job_log_file
        .file_name()
        .and_then(|name| name.to_str())
        .with_context(|| format!("invalid job log file name: {}", job_log_file.display()))?;

    let appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(prefix)
        .max_log_files(3)
        .build(dir)
        .context("failed to create rolling file appender")?;
    let (file_writer, file_guard) = tracing_appender::non_blocking(appender);

    let fmt_layer = utils::logging::get_fmt_layer().with_filter(utils::logging::env_filter());

    let job_layer = layer()
        .event_format(JobEventFormatter)
        .fmt_fields(format::DefaultFields::new())
        .with_writer(file_writer)
        .with_ansi(false)
        .with_filter(
            filter::filter_fn(|metadata| metadata.target() == JOB_EVENT_TARGET)
                .and(filter::LevelFilter::INFO),
        );

    registry()
        .with(fmt_layer)
        .with(job_layer)
        .try_init()
        .context("failed to install tracing subscriber")?;
    Ok(file_guard)
}
