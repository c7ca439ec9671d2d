use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use anyhow::Result;
use tokio::time::Instant;

use crate::app::services::ApplicationServices;
use crate::app::tasks::Tasks;
use crate::config::DaemonArgs;
use crate::domain::Orchestrator;

const JOB_DRAIN_POLL: Duration = Duration::from_millis(250);

/// Running daemon: the orchestrator plus the arguments it was started with
pub struct Application {
    services: ApplicationServices,
    daemon_args: DaemonArgs,
}

impl Application {
    pub fn new(services: ApplicationServices, daemon_args: DaemonArgs) -> Self {
        Self {
            services,
            daemon_args,
        }
    }

    pub fn services(&self) -> &ApplicationServices {
        &self.services
    }

    pub fn daemon_args(&self) -> &DaemonArgs {
        &self.daemon_args
    }

    /// Serves the API and runs health sweeps until a signal arrives or a
    /// task exits.
    pub async fn run(&self) -> Result<()> {
        let mut tasks = Tasks::new();
        tasks.spawn_all_tasks(self)?;
        tasks
            .wait_for_completion()
            .await
            .inspect_err(|e| tracing::error!("Error during task execution: {e}"))
    }

    /// Waits up to the configured grace period for running jobs, then makes
    /// sure the state file has caught up with the registry.
    ///
    /// Jobs still running after the grace period are abandoned; the next
    /// start marks their hosts and VMs as interrupted.
    pub async fn shutdown(&self) -> Result<()> {
        let orchestrator = Arc::clone(&self.services.orchestrator);
        let abandoned = drain_jobs(&orchestrator, self.daemon_args.shutdown_grace()).await;
        if abandoned > 0 {
            tracing::warn!(
                jobs = abandoned,
                "Abandoning in-flight jobs, they will be recovered on restart"
            );
        }

        tokio::task::spawn_blocking(move || orchestrator.flush_state())
            .await
            .context("flushing orchestrator state")?;

        tracing::info!("Shutdown completed");
        Ok(())
    }
}

/// Returns the number of jobs still running when `grace` ran out.
async fn drain_jobs(orchestrator: &Orchestrator, grace: Duration) -> usize {
    // `None` waits without limit
    let deadline = Instant::now().checked_add(grace);
    loop {
        let running = orchestrator.jobs().len();
        let now = Instant::now();
        if running == 0 || deadline.is_some_and(|deadline| now >= deadline) {
            return running;
        }
        tracing::info!(jobs = running, "Waiting for in-flight jobs to finish");
        let pause = deadline.map_or(JOB_DRAIN_POLL, |deadline| {
            JOB_DRAIN_POLL.min(deadline - now)
        });
        tokio::time::sleep(pause).await;
    }
}

#[cfg(test)]
mod tests {
    use api_types::HostStatus;
    use clap::Parser;
    use serde_json::json;
    use similar_asserts::assert_eq;
    use tokio::sync::Notify;

    use super::*;
    use crate::config::Cli;
    use crate::config::Commands;
    use crate::domain::mock::Operation;
    use crate::domain::mock::Script;
    use crate::domain::mock::ScriptedCapability;
    use crate::domain::HostRegistry;
    use crate::domain::OrchestratorConfig;

    fn application(script: Script, grace_secs: &str) -> Application {
        let capability = ScriptedCapability::new().with(Operation::Provision, script);
        let orchestrator = Arc::new(Orchestrator::new(
            Arc::new(HostRegistry::new()),
            Arc::new(capability),
            OrchestratorConfig::default(),
        ));
        let argv = ["metal-orchestrator", "daemon", "--shutdown-grace-secs", grace_secs];
        let daemon_args = match Cli::try_parse_from(argv).expect("arguments should parse").command {
            Commands::Daemon(args) => *args,
            Commands::Version => panic!("expected daemon command"),
        };
        Application::new(ApplicationServices { orchestrator }, daemon_args)
    }

    async fn start_provisioning(app: &Application) {
        let orchestrator = &app.services().orchestrator;
        let request = serde_json::from_value(
            json!({ "id": "h1", "hostname": "node-1", "ip": "10.0.0.1", "ssh_user": "ops" }),
        )
        .unwrap();
        orchestrator.register_host(request);
        orchestrator.provision_host("h1").await;
        assert_eq!(orchestrator.jobs().len(), 1, "provisioning should be in flight");
    }

    #[tokio::test]
    async fn shutdown_lets_running_jobs_finish() {
        // Arrange
        let release = Arc::new(Notify::new());
        let app = application(Script::WaitFor(release.clone()), "10");
        start_provisioning(&app).await;
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            release.notify_one();
        });

        // Act
        app.shutdown().await.expect("shutdown should succeed");

        // Assert
        let orchestrator = &app.services().orchestrator;
        assert!(orchestrator.jobs().is_empty(), "The job should have drained");
        assert_eq!(orchestrator.host("h1").unwrap().status, HostStatus::Active);
    }

    #[tokio::test]
    async fn shutdown_abandons_jobs_after_the_grace_period() {
        let app = application(Script::Hang, "0");
        start_provisioning(&app).await;

        tokio::time::timeout(Duration::from_secs(5), app.shutdown())
            .await
            .expect("shutdown should not wait for a hung job")
            .unwrap();

        let orchestrator = &app.services().orchestrator;
        assert_eq!(orchestrator.jobs().len(), 1);
        assert_eq!(
            orchestrator.host("h1").unwrap().status,
            HostStatus::Provisioning
        );
    }
}
