//! Background execution of host jobs
//!
//! A job is dispatched under the host's keyed lock, runs its capability
//! without holding any lock, and is resolved under the lock again. Each
//! capability attempt runs in its own task with a hard deadline, so a hung or
//! panicking backend still yields a failure outcome and the host always
//! leaves its transient status.

use std::any::Any;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use api_types::HostCapacity;
use api_types::JobKind;
use error_stack::Report;
use tokio::task::JoinHandle;
use tracing::error;
use tracing::info;
use tracing::warn;
use utils::keyed_lock::KeyedAsyncLock;

use super::error::OrchestratorError;
use super::guard;
use super::guard::HostAction;
use super::guard::Transition;
use super::host::Host;
use super::job::JobOutcome;
use super::job::JobTable;
use super::job::JobTicket;
use super::job::JOB_EVENT_TARGET;
use super::registry::HostRegistry;
use super::registry::RegistryError;
use super::traits::describe_failure;
use super::traits::CapabilityError;
use super::traits::HostCapability;

/// Deadlines and retry policy for capability calls
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunnerConfig {
    pub provision_timeout: Duration,
    pub vm_host_setup_timeout: Duration,
    pub vm_create_timeout: Duration,
    /// Total attempts per job, including the first
    pub max_attempts: u32,
    pub retry_backoff: Duration,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            provision_timeout: Duration::from_secs(1800),
            vm_host_setup_timeout: Duration::from_secs(1800),
            vm_create_timeout: Duration::from_secs(600),
            max_attempts: 1,
            retry_backoff: Duration::from_secs(5),
        }
    }
}

impl RunnerConfig {
    pub fn timeout_for(&self, kind: JobKind) -> Duration {
        match kind {
            JobKind::ProvisionHost => self.provision_timeout,
            JobKind::SetupVmHost => self.vm_host_setup_timeout,
            JobKind::CreateVirtualMachine => self.vm_create_timeout,
        }
    }
}

/// Runs `attempt` in its own task, bounded by `timeout`.
///
/// Timeouts abort the task. Panics are caught through the join error. Both
/// come back as a failure description.
pub async fn run_bounded<T, Fut>(timeout: Duration, attempt: Fut) -> Result<T, String>
where
    T: Send + 'static,
    Fut: Future<Output = Result<T, Report<CapabilityError>>> + Send + 'static,
{
    let mut handle = tokio::spawn(attempt);
    match tokio::time::timeout(timeout, &mut handle).await {
        Ok(Ok(Ok(value))) => Ok(value),
        Ok(Ok(Err(report))) => {
            warn!("Capability call failed: {report:?}");
            Err(describe_failure(&report))
        }
        Ok(Err(join_error)) => match join_error.try_into_panic() {
            Ok(payload) => Err(format!("capability crashed: {}", panic_message(payload))),
            Err(join_error) => Err(format!("capability task was cancelled: {join_error}")),
        },
        Err(_) => {
            handle.abort();
            Err(format!("timed out after {}s", timeout.as_secs_f64()))
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    match payload.downcast::<String>() {
        Ok(message) => *message,
        Err(payload) => match payload.downcast::<&'static str>() {
            Ok(message) => (*message).to_string(),
            Err(_) => "panic with non-string payload".to_string(),
        },
    }
}

/// Attempt and retry policy shared by every job kind
#[derive(Clone)]
pub struct Supervisor {
    jobs: Arc<JobTable>,
    config: RunnerConfig,
}

impl Supervisor {
    pub fn new(jobs: Arc<JobTable>, config: RunnerConfig) -> Self {
        Self { jobs, config }
    }

    pub fn jobs(&self) -> &Arc<JobTable> {
        &self.jobs
    }

    /// Calls `attempt` until it succeeds or `max_attempts` is exhausted.
    ///
    /// Returns the last failure description when every attempt failed.
    pub async fn supervise<T, F, Fut>(&self, ticket: &JobTicket, mut attempt: F) -> Result<T, String>
    where
        T: Send + 'static,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, Report<CapabilityError>>> + Send + 'static,
    {
        let timeout = self.config.timeout_for(ticket.kind());
        let max_attempts = self.config.max_attempts.max(1);
        let mut last_failure = String::new();

        for remaining in (0..max_attempts).rev() {
            let attempt_no = self.jobs.record_attempt(ticket);
            match run_bounded(timeout, attempt()).await {
                Ok(value) => return Ok(value),
                Err(failure) => {
                    warn!(
                        target: JOB_EVENT_TARGET,
                        job_id = ticket.id(),
                        host_id = ticket.host_id(),
                        kind = %ticket.kind(),
                        attempt = attempt_no,
                        reason = %failure,
                        "job attempt failed"
                    );
                    last_failure = failure;
                }
            }
            if remaining > 0 {
                tokio::time::sleep(self.config.retry_backoff).await;
            }
        }
        Err(last_failure)
    }
}

/// Host-level job the runner knows how to execute
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HostJob {
    Provision,
    InstallVirtualization,
}

impl HostJob {
    fn from_kind(kind: JobKind) -> Option<Self> {
        match kind {
            JobKind::ProvisionHost => Some(Self::Provision),
            JobKind::SetupVmHost => Some(Self::InstallVirtualization),
            JobKind::CreateVirtualMachine => None,
        }
    }
}

/// A host job that passed the guard and is now running
#[derive(Debug)]
pub struct JobStarted {
    pub job_id: String,
    pub hostname: String,
    /// Completes once the job has been resolved into the registry
    pub completion: JoinHandle<()>,
}

/// Dispatches and resolves provisioning and VM host setup jobs
#[derive(Clone)]
pub struct JobRunner {
    registry: Arc<HostRegistry>,
    capability: Arc<dyn HostCapability>,
    locks: Arc<KeyedAsyncLock<String>>,
    supervisor: Supervisor,
}

impl JobRunner {
    pub fn new(
        registry: Arc<HostRegistry>,
        capability: Arc<dyn HostCapability>,
        locks: Arc<KeyedAsyncLock<String>>,
        supervisor: Supervisor,
    ) -> Self {
        Self {
            registry,
            capability,
            locks,
            supervisor,
        }
    }

    /// Checks `action` against the host, marks it in progress and spawns the job.
    ///
    /// Returns as soon as the job is dispatched.
    pub async fn start(
        &self,
        host_id: &str,
        action: HostAction,
    ) -> Result<JobStarted, OrchestratorError> {
        let (ticket, job, host) = {
            let _guard = self.locks.lock(&host_id.to_string()).await;

            let host = self
                .registry
                .host(host_id)
                .ok_or_else(|| RegistryError::HostNotFound {
                    host_id: host_id.to_string(),
                })?;
            let transition = guard::evaluate(host.status, host.is_vm_host, action)?;
            let (kind, in_progress, job) = match transition {
                Transition::Dispatch { kind, in_progress } => match HostJob::from_kind(kind) {
                    Some(job) => (kind, in_progress, job),
                    None => return Err(OrchestratorError::UnexpectedTransition { action, transition }),
                },
                _ => return Err(OrchestratorError::UnexpectedTransition { action, transition }),
            };

            let host = self.registry.update_host(host_id, |host| {
                host.status = in_progress;
                host.clone()
            })?;
            let ticket = self.supervisor.jobs().begin(kind, host_id, None);
            info!(
                target: JOB_EVENT_TARGET,
                job_id = ticket.id(),
                host_id,
                kind = %kind,
                status = %in_progress,
                "job dispatched"
            );
            (ticket, job, host)
        };

        let job_id = ticket.id().to_string();
        let hostname = host.hostname.clone();
        let runner = self.clone();
        let completion = tokio::spawn(async move { runner.execute(ticket, job, host).await });

        Ok(JobStarted {
            job_id,
            hostname,
            completion,
        })
    }

    async fn execute(self, ticket: JobTicket, job: HostJob, host: Host) {
        let target = host.target();
        let capability = Arc::clone(&self.capability);

        let (outcome, facts) = match job {
            HostJob::Provision => {
                let result = self
                    .supervisor
                    .supervise(&ticket, || {
                        let capability = Arc::clone(&capability);
                        let target = target.clone();
                        async move { capability.provision(&target).await }
                    })
                    .await;
                match result {
                    Ok(report) => (JobOutcome::Success, report.facts),
                    Err(reason) => (JobOutcome::Failure(reason), None),
                }
            }
            HostJob::InstallVirtualization => {
                let result = self
                    .supervisor
                    .supervise(&ticket, || {
                        let capability = Arc::clone(&capability);
                        let target = target.clone();
                        async move { capability.install_virtualization(&target).await }
                    })
                    .await;
                match result {
                    Ok(()) => (JobOutcome::Success, None),
                    Err(reason) => (JobOutcome::Failure(reason), None),
                }
            }
        };

        self.resolve(ticket, outcome, facts).await;
    }

    /// Lands the host in its stable post-job state. Consumes the ticket.
    async fn resolve(&self, ticket: JobTicket, outcome: JobOutcome, facts: Option<HostCapacity>) {
        let host_id = ticket.host_id().to_string();
        let _guard = self.locks.lock(&host_id).await;

        let kind = ticket.kind();
        let applied = self.registry.update_host(&host_id, |host| {
            if let Some(resolution) = guard::resolve(kind, host.is_vm_host, &outcome) {
                host.status = resolution.status;
                host.is_vm_host = resolution.is_vm_host;
                host.last_error = resolution.last_error;
            }
            if let Some(facts) = facts {
                host.capacity = facts;
            }
            host.status
        });

        let job_id = ticket.id().to_string();
        let attempts = self
            .supervisor
            .jobs()
            .finish(ticket)
            .map(|job| job.attempts)
            .unwrap_or_default();

        match applied {
            Ok(status) if outcome.is_success() => info!(
                target: JOB_EVENT_TARGET,
                job_id = %job_id,
                host_id = %host_id,
                kind = %kind,
                attempts,
                status = %status,
                "job succeeded"
            ),
            Ok(status) => warn!(
                target: JOB_EVENT_TARGET,
                job_id = %job_id,
                host_id = %host_id,
                kind = %kind,
                attempts,
                status = %status,
                outcome = %outcome,
                "job failed"
            ),
            Err(err) => error!(
                target: JOB_EVENT_TARGET,
                job_id = %job_id,
                host_id = %host_id,
                kind = %kind,
                "failed to resolve job: {err}"
            ),
        }
    }
}
