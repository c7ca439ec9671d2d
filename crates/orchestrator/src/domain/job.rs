//! In-flight job bookkeeping

use std::fmt;

use api_types::JobInfo;
use api_types::JobKind;
use chrono::Utc;
use dashmap::DashMap;

/// Tracing target for job lifecycle events; routed to the job audit log.
pub const JOB_EVENT_TARGET: &str = "jobs";

/// Terminal result of a job
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Success,
    Failure(String),
}

impl JobOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}

impl fmt::Display for JobOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => f.write_str("success"),
            Self::Failure(reason) => write!(f, "failure: {reason}"),
        }
    }
}

/// Handle for one dispatched job.
///
/// Not `Clone`: [`JobTable::finish`] consumes it, so a job can be resolved
/// only once.
#[derive(Debug)]
pub struct JobTicket {
    id: String,
    kind: JobKind,
    host_id: String,
    vm_id: Option<String>,
}

impl JobTicket {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> JobKind {
        self.kind
    }

    pub fn host_id(&self) -> &str {
        &self.host_id
    }

    pub fn vm_id(&self) -> Option<&str> {
        self.vm_id.as_deref()
    }
}

/// Jobs that have been dispatched but not yet resolved
#[derive(Debug, Default)]
pub struct JobTable {
    jobs: DashMap<String, JobInfo>,
}

impl JobTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin(&self, kind: JobKind, host_id: &str, vm_id: Option<&str>) -> JobTicket {
        let id = uuid::Uuid::new_v4().to_string();
        self.jobs.insert(
            id.clone(),
            JobInfo {
                id: id.clone(),
                kind,
                host_id: host_id.to_string(),
                vm_id: vm_id.map(str::to_string),
                started_at: Utc::now(),
                attempts: 0,
            },
        );
        JobTicket {
            id,
            kind,
            host_id: host_id.to_string(),
            vm_id: vm_id.map(str::to_string),
        }
    }

    /// Bumps the attempt counter and returns the new value.
    pub fn record_attempt(&self, ticket: &JobTicket) -> u32 {
        self.jobs
            .get_mut(&ticket.id)
            .map(|mut job| {
                job.attempts += 1;
                job.attempts
            })
            .unwrap_or_default()
    }

    pub fn finish(&self, ticket: JobTicket) -> Option<JobInfo> {
        self.jobs.remove(&ticket.id).map(|(_, job)| job)
    }

    pub fn list(&self) -> Vec<JobInfo> {
        let mut jobs: Vec<JobInfo> = self.jobs.iter().map(|job| job.value().clone()).collect();
        jobs.sort_by(|a, b| a.started_at.cmp(&b.started_at).then(a.id.cmp(&b.id)));
        jobs
    }

    pub fn count_for_host(&self, host_id: &str) -> usize {
        self.jobs
            .iter()
            .filter(|job| job.host_id == host_id)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}
